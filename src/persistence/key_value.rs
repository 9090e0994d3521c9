//! Key-value strategy.
//!
//! Records are stored as JSON strings under `<prefix>:<id>` with a TTL.
//! `find`, `update` and `delete` enumerate every key under the prefix and
//! deserialize each value: O(n) over the key space. Use this strategy for
//! small or short-lived data such as health-check caches, not for large
//! harvested datasets.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::document::{id_string, patch_fields, timestamp_now, CREATED_AT_FIELD, ID_FIELD};
use super::query::{self, Query};
use super::{
    DeleteOutcome, Payload, PersistenceStrategy, SaveOutcome, StrategyKind, UpdateOutcome,
    WriteFailure,
};
use crate::error::PersistenceError;
use crate::model::{CollectionSpec, Record};

// ============================================================================
// Backend Trait
// ============================================================================

/// Raw key-value backend used by [`KeyValueStrategy`].
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn connect(&self) -> Result<(), PersistenceError> {
        Ok(())
    }

    /// Writes `value` only if `key` is absent. Returns `false` when it exists.
    async fn insert(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<bool, PersistenceError>;

    /// Overwrites an existing key, keeping its remaining TTL. Returns `false`
    /// when the key does not exist.
    async fn replace(&self, key: &str, value: String) -> Result<bool, PersistenceError>;

    async fn get(&self, key: &str) -> Result<Option<String>, PersistenceError>;

    /// Every live key starting with `prefix`.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, PersistenceError>;

    async fn remove(&self, key: &str) -> Result<bool, PersistenceError>;
}

// ============================================================================
// Redis Backend
// ============================================================================

/// Redis backend over a multiplexed, auto-reconnecting connection manager.
pub struct RedisStore {
    url: String,
    conn: OnceCell<ConnectionManager>,
}

impl RedisStore {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            conn: OnceCell::new(),
        }
    }

    async fn conn(&self) -> Result<ConnectionManager, PersistenceError> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                let client = redis::Client::open(self.url.as_str())?;
                let manager = client.get_connection_manager().await?;
                info!(url = %self.url, "Connected to Redis");
                Ok::<_, PersistenceError>(manager)
            })
            .await?;
        Ok(conn.clone())
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn connect(&self) -> Result<(), PersistenceError> {
        self.conn().await.map(|_| ())
    }

    async fn insert(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<bool, PersistenceError> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    async fn replace(&self, key: &str, value: String) -> Result<bool, PersistenceError> {
        let mut conn = self.conn().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("XX")
            .arg("KEEPTTL")
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        let mut conn = self.conn().await?;
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, PersistenceError> {
        let mut conn = self.conn().await?;
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(format!("{}*", glob_escape(prefix)))
            .query_async(&mut conn)
            .await?;
        Ok(keys)
    }

    async fn remove(&self, key: &str) -> Result<bool, PersistenceError> {
        let mut conn = self.conn().await?;
        let removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed > 0)
    }
}

/// Escapes Redis glob metacharacters so `prefix` matches literally.
fn glob_escape(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

// ============================================================================
// In-memory Backend
// ============================================================================

/// Process-local backend with the same expiry semantics as Redis.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, (String, Option<Instant>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(entry: &(String, Option<Instant>), now: Instant) -> bool {
        entry.1.map_or(true, |deadline| deadline > now)
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn insert(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<bool, PersistenceError> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        if entries.get(key).is_some_and(|e| Self::live(e, now)) {
            return Ok(false);
        }
        entries.insert(key.to_string(), (value, ttl.map(|ttl| now + ttl)));
        Ok(true)
    }

    async fn replace(&self, key: &str, value: String) -> Result<bool, PersistenceError> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        match entries.get_mut(key) {
            Some(entry) if Self::live(entry, now) => {
                entry.0 = value;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        let entries = self.entries.lock().await;
        let now = Instant::now();
        Ok(entries
            .get(key)
            .filter(|e| Self::live(e, now))
            .map(|e| e.0.clone()))
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, PersistenceError> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        entries.retain(|_, e| Self::live(e, now));
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn remove(&self, key: &str) -> Result<bool, PersistenceError> {
        Ok(self.entries.lock().await.remove(key).is_some())
    }
}

// ============================================================================
// Strategy
// ============================================================================

pub struct KeyValueStrategy {
    store: Arc<dyn KeyValueStore>,
    default_ttl: Option<Duration>,
    seen_prefixes: Mutex<HashSet<String>>,
}

impl KeyValueStrategy {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            default_ttl: None,
            seen_prefixes: Mutex::new(HashSet::new()),
        }
    }

    /// TTL for prefixes that do not configure their own. Zero disables it.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = (!ttl.is_zero()).then_some(ttl);
        self
    }

    fn key_prefix(target: &CollectionSpec) -> String {
        format!("{}:", target.name)
    }

    async fn ttl_for(&self, target: &CollectionSpec) -> Option<Duration> {
        let ttl = target.ttl_seconds.map(Duration::from_secs).or(self.default_ttl);
        if self.seen_prefixes.lock().await.insert(target.name.clone()) {
            debug!(
                prefix = %target.name,
                ttl_secs = ?ttl.map(|t| t.as_secs()),
                "Key prefix initialized"
            );
        }
        ttl
    }

    /// Loads every record under the target prefix together with its key.
    async fn scan(
        &self,
        target: &CollectionSpec,
        query: &Query,
    ) -> Result<Vec<(String, Record)>, PersistenceError> {
        let mut found = Vec::new();
        for key in self.store.keys(&Self::key_prefix(target)).await? {
            // Expired between KEYS and GET
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<Record>(&raw) {
                Ok(record) if query::matches(&record, query) => found.push((key, record)),
                Ok(_) => {}
                Err(e) => warn!(key = %key, error = %e, "Skipping undecodable value"),
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl PersistenceStrategy for KeyValueStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::KeyValue
    }

    async fn connect(&self) -> Result<(), PersistenceError> {
        self.store.connect().await
    }

    async fn save(
        &self,
        target: &CollectionSpec,
        data: Payload,
    ) -> Result<SaveOutcome, PersistenceError> {
        let ttl = self.ttl_for(target).await;
        let prefix = Self::key_prefix(target);
        let now = timestamp_now();

        let mut outcome = SaveOutcome::default();
        for (index, mut record) in data.into_records().into_iter().enumerate() {
            let id = record
                .get(ID_FIELD)
                .or_else(|| record.get("id"))
                .map(id_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            record.insert(ID_FIELD.to_string(), serde_json::Value::String(id.clone()));
            if !record.contains_key(CREATED_AT_FIELD) {
                record.insert(CREATED_AT_FIELD.to_string(), serde_json::Value::String(now.clone()));
            }

            let key = format!("{}{}", prefix, id);
            let value = serde_json::to_string(&record)?;
            // Backend errors abort the batch; only an existing key is per-item
            if self.store.insert(&key, value, ttl).await? {
                outcome.inserted_count += 1;
                outcome.inserted_ids.push(key);
            } else {
                let err = PersistenceError::DuplicateKey {
                    collection: target.name.clone(),
                    key,
                };
                warn!(index, error = %err, "Entry rejected");
                outcome.failures.push(WriteFailure {
                    index,
                    message: err.to_string(),
                });
            }
        }
        Ok(outcome)
    }

    async fn find(
        &self,
        target: &CollectionSpec,
        query: &Query,
    ) -> Result<Vec<Record>, PersistenceError> {
        Ok(self.scan(target, query).await?.into_iter().map(|(_, r)| r).collect())
    }

    async fn update(
        &self,
        target: &CollectionSpec,
        query: &Query,
        patch: &Record,
    ) -> Result<UpdateOutcome, PersistenceError> {
        let fields = patch_fields(patch);
        let mut outcome = UpdateOutcome::default();
        for (key, mut record) in self.scan(target, query).await? {
            outcome.matched_count += 1;
            let mut changed = false;
            for (field, value) in fields.iter().filter(|(k, _)| k.as_str() != ID_FIELD) {
                if record.get(field) != Some(value) {
                    record.insert(field.clone(), value.clone());
                    changed = true;
                }
            }
            if changed && self.store.replace(&key, serde_json::to_string(&record)?).await? {
                outcome.modified_count += 1;
            }
        }
        Ok(outcome)
    }

    async fn delete(
        &self,
        target: &CollectionSpec,
        query: &Query,
    ) -> Result<DeleteOutcome, PersistenceError> {
        let mut deleted_count = 0;
        for (key, _) in self.scan(target, query).await? {
            if self.store.remove(&key).await? {
                deleted_count += 1;
            }
        }
        Ok(DeleteOutcome { deleted_count })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(value: serde_json::Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn strategy() -> KeyValueStrategy {
        KeyValueStrategy::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_keys_derive_from_prefix_and_id() {
        let kv = strategy();
        let target = CollectionSpec::named("health");

        let outcome = kv
            .save(
                &target,
                vec![rec(json!({"id": "sirene", "ok": true})), rec(json!({"ok": false}))].into(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.inserted_count, 2);
        assert_eq!(outcome.inserted_ids[0], "health:sirene");
        assert!(outcome.inserted_ids[1].starts_with("health:"));
    }

    #[tokio::test]
    async fn test_duplicate_key_does_not_abort_batch() {
        let kv = strategy();
        let target = CollectionSpec::named("sirene");

        let batch = vec![
            rec(json!({"_id": "1", "v": 1})),
            rec(json!({"_id": "1", "v": 2})),
            rec(json!({"_id": "2", "v": 3})),
        ];
        let outcome = kv.save(&target, batch.into()).await.unwrap();

        assert_eq!(outcome.inserted_count, 2);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].index, 1);

        let one = kv.find_one(&target, &rec(json!({"_id": "1"}))).await.unwrap().unwrap();
        assert_eq!(one["v"], 1);
    }

    #[tokio::test]
    async fn test_find_is_scoped_to_prefix() {
        let kv = strategy();
        kv.save(&CollectionSpec::named("a"), rec(json!({"x": 1})).into())
            .await
            .unwrap();
        kv.save(&CollectionSpec::named("ab"), rec(json!({"x": 2})).into())
            .await
            .unwrap();

        let found = kv.find(&CollectionSpec::named("a"), &Query::new()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["x"], 1);
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let kv = strategy();
        let target = CollectionSpec::named("geo");
        kv.save(
            &target,
            vec![
                rec(json!({"_id": "p", "code": "75"})),
                rec(json!({"_id": "l", "code": "69"})),
            ]
            .into(),
        )
        .await
        .unwrap();

        let updated = kv
            .update(&target, &rec(json!({"code": "75"})), &rec(json!({"label": "Paris"})))
            .await
            .unwrap();
        assert_eq!(updated.modified_count, 1);
        let paris = kv.find_one(&target, &rec(json!({"_id": "p"}))).await.unwrap().unwrap();
        assert_eq!(paris["label"], "Paris");

        let deleted = kv.delete(&target, &Query::new()).await.unwrap();
        assert_eq!(deleted.deleted_count, 2);
    }

    struct UnreachableStore;

    #[async_trait]
    impl KeyValueStore for UnreachableStore {
        async fn insert(
            &self,
            _key: &str,
            _value: String,
            _ttl: Option<Duration>,
        ) -> Result<bool, PersistenceError> {
            Err(PersistenceError::Backend("connection refused".into()))
        }

        async fn replace(&self, _key: &str, _value: String) -> Result<bool, PersistenceError> {
            Err(PersistenceError::Backend("connection refused".into()))
        }

        async fn get(&self, _key: &str) -> Result<Option<String>, PersistenceError> {
            Err(PersistenceError::Backend("connection refused".into()))
        }

        async fn keys(&self, _prefix: &str) -> Result<Vec<String>, PersistenceError> {
            Err(PersistenceError::Backend("connection refused".into()))
        }

        async fn remove(&self, _key: &str) -> Result<bool, PersistenceError> {
            Err(PersistenceError::Backend("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_backend_failure_aborts_save() {
        let kv = KeyValueStrategy::new(Arc::new(UnreachableStore));
        let target = CollectionSpec::named("sirene");

        let batch = vec![rec(json!({"_id": "1"})), rec(json!({"_id": "2"}))];
        let err = kv.save(&target, batch.into()).await.unwrap_err();
        assert!(matches!(err, PersistenceError::Backend(ref m) if m == "connection refused"));
    }

    #[test]
    fn test_glob_escape() {
        assert_eq!(glob_escape("geo:"), "geo:");
        assert_eq!(glob_escape("a*b?[c]:"), "a\\*b\\?\\[c\\]:");
        assert_eq!(glob_escape("x\\y"), "x\\\\y");
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let kv = strategy().with_default_ttl(Duration::from_secs(60));
        let target = CollectionSpec::named("cache");
        kv.save(&target, rec(json!({"_id": "k"})).into()).await.unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(kv.find(&target, &Query::new()).await.unwrap().len(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(kv.find(&target, &Query::new()).await.unwrap().is_empty());

        // Expired key can be written again
        let again = kv.save(&target, rec(json!({"_id": "k"})).into()).await.unwrap();
        assert_eq!(again.inserted_count, 1);
    }
}
