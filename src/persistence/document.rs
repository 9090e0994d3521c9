//! Document-store strategy.
//!
//! Each logical collection is one schema-less container of JSON records.
//! Records receive an `_id` (kept when supplied) and a `createdAt` timestamp;
//! TTL is an expiry rule on `createdAt`. When a data directory is configured,
//! each collection is mirrored to `<data_dir>/<collection>.json`.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::query::{self, Query};
use super::{
    DeleteOutcome, Payload, PersistenceStrategy, SaveOutcome, StrategyKind, UpdateOutcome,
    WriteFailure,
};
use crate::error::PersistenceError;
use crate::model::{CollectionSpec, Record};

pub const ID_FIELD: &str = "_id";
pub const CREATED_AT_FIELD: &str = "createdAt";

#[derive(Debug, Default)]
struct Collection {
    docs: Vec<Record>,
    /// Field sets that must be unique, besides `_id`
    unique: Vec<Vec<String>>,
    ttl: Option<ChronoDuration>,
}

impl Collection {
    fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let Some(ttl) = self.ttl else {
            return 0;
        };
        let before = self.docs.len();
        self.docs.retain(|doc| match created_at(doc) {
            // An expiry past the representable range never comes
            Some(created) => created.checked_add_signed(ttl).map_or(true, |expiry| expiry > now),
            None => true,
        });
        before - self.docs.len()
    }

    fn conflict(&self, doc: &Record) -> Option<String> {
        let id = doc.get(ID_FIELD);
        if self.docs.iter().any(|d| d.get(ID_FIELD) == id) {
            return id.map(id_string);
        }
        unique_clash(&self.unique, doc, self.docs.iter())
    }
}

/// First unique index on which `doc` collides with one of `others`.
fn unique_clash<'a, I>(unique: &[Vec<String>], doc: &Record, others: I) -> Option<String>
where
    I: Iterator<Item = &'a Record> + Clone,
{
    for fields in unique {
        let Some(key) = unique_key(doc, fields) else {
            continue;
        };
        if others
            .clone()
            .any(|d| unique_key(d, fields).as_ref() == Some(&key))
        {
            return Some(format!("{}={}", fields.join("+"), Value::Array(key)));
        }
    }
    None
}

/// In-process document store with optional file mirroring.
pub struct DocumentStrategy {
    data_dir: Option<PathBuf>,
    collections: Mutex<HashMap<String, Collection>>,
}

impl DocumentStrategy {
    pub fn in_memory() -> Self {
        Self {
            data_dir: None,
            collections: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_data_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(dir.into()),
            collections: Mutex::new(HashMap::new()),
        }
    }

    fn file_for(&self, name: &str) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join(format!("{}.json", name)))
    }

    /// Returns the collection, creating it and applying its index and TTL
    /// settings on first use.
    async fn open<'a>(
        &self,
        collections: &'a mut HashMap<String, Collection>,
        target: &CollectionSpec,
    ) -> Result<&'a mut Collection, PersistenceError> {
        if !collections.contains_key(&target.name) {
            let docs = self.read_file(&target.name).await?;
            let collection = Collection {
                docs,
                unique: target
                    .indexes
                    .iter()
                    .filter(|idx| idx.unique && !idx.fields.is_empty())
                    .map(|idx| idx.fields.clone())
                    .collect(),
                ttl: target
                    .ttl_seconds
                    .and_then(|secs| i64::try_from(secs).ok())
                    .and_then(ChronoDuration::try_seconds),
            };
            debug!(
                collection = %target.name,
                documents = collection.docs.len(),
                unique_indexes = collection.unique.len(),
                ttl_secs = ?target.ttl_seconds,
                "Collection initialized"
            );
            collections.insert(target.name.clone(), collection);
        }

        let collection = collections
            .get_mut(&target.name)
            .ok_or_else(|| {
                PersistenceError::Backend(format!("collection '{}' vanished", target.name))
            })?;
        let expired = collection.purge_expired(Utc::now());
        if expired > 0 {
            debug!(collection = %target.name, expired, "Expired documents purged");
        }
        Ok(collection)
    }

    async fn read_file(&self, name: &str) -> Result<Vec<Record>, PersistenceError> {
        let Some(path) = self.file_for(name) else {
            return Ok(Vec::new());
        };
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn flush(&self, name: &str, collection: &Collection) -> Result<(), PersistenceError> {
        let Some(path) = self.file_for(name) else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, serde_json::to_vec(&collection.docs)?).await?;
        Ok(())
    }
}

#[async_trait]
impl PersistenceStrategy for DocumentStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Document
    }

    async fn connect(&self) -> Result<(), PersistenceError> {
        if let Some(dir) = &self.data_dir {
            tokio::fs::create_dir_all(dir).await?;
        }
        Ok(())
    }

    async fn save(
        &self,
        target: &CollectionSpec,
        data: Payload,
    ) -> Result<SaveOutcome, PersistenceError> {
        let mut collections = self.collections.lock().await;
        let collection = self.open(&mut collections, target).await?;

        let mut outcome = SaveOutcome::default();
        let now = timestamp_now();
        for (index, mut doc) in data.into_records().into_iter().enumerate() {
            if !doc.contains_key(ID_FIELD) {
                doc.insert(ID_FIELD.to_string(), Value::String(Uuid::new_v4().to_string()));
            }
            if !doc.contains_key(CREATED_AT_FIELD) {
                doc.insert(CREATED_AT_FIELD.to_string(), Value::String(now.clone()));
            }

            if let Some(key) = collection.conflict(&doc) {
                let err = PersistenceError::DuplicateKey {
                    collection: target.name.clone(),
                    key,
                };
                warn!(index, error = %err, "Document rejected");
                outcome.failures.push(WriteFailure {
                    index,
                    message: err.to_string(),
                });
                continue;
            }

            outcome.inserted_ids.push(doc.get(ID_FIELD).map(id_string).unwrap_or_default());
            collection.docs.push(doc);
            outcome.inserted_count += 1;
        }

        if outcome.inserted_count > 0 {
            self.flush(&target.name, collection).await?;
        }
        Ok(outcome)
    }

    async fn find(
        &self,
        target: &CollectionSpec,
        query: &Query,
    ) -> Result<Vec<Record>, PersistenceError> {
        let mut collections = self.collections.lock().await;
        let collection = self.open(&mut collections, target).await?;
        Ok(collection
            .docs
            .iter()
            .filter(|doc| query::matches(doc, query))
            .cloned()
            .collect())
    }

    async fn update(
        &self,
        target: &CollectionSpec,
        query: &Query,
        patch: &Record,
    ) -> Result<UpdateOutcome, PersistenceError> {
        let fields = patch_fields(patch);
        let mut collections = self.collections.lock().await;
        let collection = self.open(&mut collections, target).await?;

        let mut outcome = UpdateOutcome::default();
        let mut patched = Vec::new();
        for (index, doc) in collection.docs.iter().enumerate() {
            if !query::matches(doc, query) {
                continue;
            }
            outcome.matched_count += 1;
            let mut doc = doc.clone();
            let mut changed = false;
            for (key, value) in fields.iter().filter(|(k, _)| k.as_str() != ID_FIELD) {
                if doc.get(key) != Some(value) {
                    doc.insert(key.clone(), value.clone());
                    changed = true;
                }
            }
            if changed {
                patched.push((index, doc));
            }
        }
        outcome.modified_count = patched.len();

        // All or nothing: the patched collection must still satisfy its unique indexes
        if !patched.is_empty() && !collection.unique.is_empty() {
            let mut next = collection.docs.clone();
            for (index, doc) in &patched {
                next[*index] = doc.clone();
            }
            for (index, doc) in &patched {
                let index = *index;
                let others = next
                    .iter()
                    .enumerate()
                    .filter(move |(i, _)| *i != index)
                    .map(|(_, d)| d);
                if let Some(key) = unique_clash(&collection.unique, doc, others) {
                    return Err(PersistenceError::DuplicateKey {
                        collection: target.name.clone(),
                        key,
                    });
                }
            }
        }
        for (index, doc) in patched {
            collection.docs[index] = doc;
        }

        if outcome.modified_count > 0 {
            self.flush(&target.name, collection).await?;
        }
        Ok(outcome)
    }

    async fn delete(
        &self,
        target: &CollectionSpec,
        query: &Query,
    ) -> Result<DeleteOutcome, PersistenceError> {
        let mut collections = self.collections.lock().await;
        let collection = self.open(&mut collections, target).await?;

        let before = collection.docs.len();
        collection.docs.retain(|doc| !query::matches(doc, query));
        let deleted_count = before - collection.docs.len();

        if deleted_count > 0 {
            self.flush(&target.name, collection).await?;
        }
        Ok(DeleteOutcome { deleted_count })
    }
}

/// Accepts either a plain field map or a `{"$set": {...}}` patch.
pub(crate) fn patch_fields(patch: &Record) -> Record {
    match patch.get("$set") {
        Some(Value::Object(set)) => set.clone(),
        _ => patch.clone(),
    }
}

pub(crate) fn id_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub(crate) fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn created_at(doc: &Record) -> Option<DateTime<Utc>> {
    doc.get(CREATED_AT_FIELD)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn unique_key(doc: &Record, fields: &[String]) -> Option<Vec<Value>> {
    fields
        .iter()
        .map(|f| query::get_path(doc, f).cloned())
        .collect()
}
