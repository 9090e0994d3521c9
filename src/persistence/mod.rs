//! Interchangeable storage backends behind one save/find/update/delete
//! contract.
//!
//! Strategies form a closed set ([`StrategyKind`]) so configuration can be
//! checked against it before any source is registered. The
//! [`PersistenceManager`] maps each kind to its live implementation.

pub mod document;
pub mod key_value;
pub mod query;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

use crate::error::PersistenceError;
use crate::model::{CollectionSpec, Record};

pub use document::DocumentStrategy;
pub use key_value::{KeyValueStore, KeyValueStrategy, MemoryStore, RedisStore};
pub use query::Query;

// ============================================================================
// Strategy Kinds
// ============================================================================

/// Registered persistence strategy names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StrategyKind {
    /// Schema-less document collections
    Document,
    /// Prefix-scanned key-value entries with TTL
    KeyValue,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Document => "document",
            StrategyKind::KeyValue => "keyValue",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = PersistenceError;

    /// Accepts the canonical names plus the backend aliases used in older
    /// configuration trees (`mongodb`, `redis`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "document" | "mongodb" | "mongo" => Ok(StrategyKind::Document),
            "keyvalue" | "key_value" | "key-value" | "redis" => Ok(StrategyKind::KeyValue),
            _ => Err(PersistenceError::UnknownStrategy(s.to_string())),
        }
    }
}

// ============================================================================
// Contract
// ============================================================================

/// Data handed to [`PersistenceStrategy::save`]: one record or a batch.
#[derive(Debug, Clone)]
pub enum Payload {
    One(Record),
    Many(Vec<Record>),
}

impl Payload {
    pub fn into_records(self) -> Vec<Record> {
        match self {
            Payload::One(r) => vec![r],
            Payload::Many(rs) => rs,
        }
    }
}

impl From<Record> for Payload {
    fn from(record: Record) -> Self {
        Payload::One(record)
    }
}

impl From<Vec<Record>> for Payload {
    fn from(records: Vec<Record>) -> Self {
        Payload::Many(records)
    }
}

/// One rejected item of a bulk save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteFailure {
    pub index: usize,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveOutcome {
    pub inserted_count: usize,
    /// Document `_id`s or key-value keys, in insertion order
    pub inserted_ids: Vec<String>,
    pub failures: Vec<WriteFailure>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOutcome {
    pub matched_count: usize,
    pub modified_count: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOutcome {
    pub deleted_count: usize,
}

/// Storage backend contract.
///
/// `save` has unordered bulk semantics: a rejected item (e.g. a duplicate
/// key) is reported in [`SaveOutcome::failures`] and the remaining items are
/// still written. A backend failure fails the whole call. Index and TTL
/// settings of a collection are applied lazily on its first use.
#[async_trait]
pub trait PersistenceStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Opens backend connections. Called once by the manager.
    async fn connect(&self) -> Result<(), PersistenceError> {
        Ok(())
    }

    /// Releases backend connections.
    async fn close(&self) -> Result<(), PersistenceError> {
        Ok(())
    }

    async fn save(
        &self,
        target: &CollectionSpec,
        data: Payload,
    ) -> Result<SaveOutcome, PersistenceError>;

    async fn find(
        &self,
        target: &CollectionSpec,
        query: &Query,
    ) -> Result<Vec<Record>, PersistenceError>;

    async fn find_one(
        &self,
        target: &CollectionSpec,
        query: &Query,
    ) -> Result<Option<Record>, PersistenceError> {
        Ok(self.find(target, query).await?.into_iter().next())
    }

    async fn update(
        &self,
        target: &CollectionSpec,
        query: &Query,
        patch: &Record,
    ) -> Result<UpdateOutcome, PersistenceError>;

    async fn delete(
        &self,
        target: &CollectionSpec,
        query: &Query,
    ) -> Result<DeleteOutcome, PersistenceError>;
}

// ============================================================================
// Manager
// ============================================================================

/// Registry of live strategies, shared read-only by every connector.
#[derive(Default)]
pub struct PersistenceManager {
    strategies: HashMap<StrategyKind, Arc<dyn PersistenceStrategy>>,
}

impl PersistenceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the implementation for its kind.
    pub fn register(&mut self, strategy: Arc<dyn PersistenceStrategy>) {
        info!(strategy = %strategy.kind(), "Persistence strategy registered");
        self.strategies.insert(strategy.kind(), strategy);
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn PersistenceStrategy>) -> Self {
        self.register(strategy);
        self
    }

    pub fn is_registered(&self, name: &str) -> bool {
        name.parse::<StrategyKind>()
            .map(|kind| self.strategies.contains_key(&kind))
            .unwrap_or(false)
    }

    /// Resolves a strategy by its configured name.
    ///
    /// # Errors
    ///
    /// [`PersistenceError::UnknownStrategy`] naming `name` when it does not
    /// parse or nothing is registered under it.
    pub fn get_strategy(
        &self,
        name: &str,
    ) -> Result<Arc<dyn PersistenceStrategy>, PersistenceError> {
        let kind: StrategyKind = name.parse()?;
        self.strategies
            .get(&kind)
            .cloned()
            .ok_or_else(|| PersistenceError::UnknownStrategy(name.to_string()))
    }

    pub async fn connect_all(&self) -> Result<(), PersistenceError> {
        for strategy in self.strategies.values() {
            strategy.connect().await?;
        }
        Ok(())
    }

    pub async fn close_all(&self) -> Result<(), PersistenceError> {
        for strategy in self.strategies.values() {
            strategy.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_strategy_names_itself() {
        let manager =
            PersistenceManager::new().with_strategy(Arc::new(DocumentStrategy::in_memory()));

        for name in ["cassandra", "", "s3"] {
            match manager.get_strategy(name) {
                Err(PersistenceError::UnknownStrategy(n)) => assert_eq!(n, name),
                Err(other) => panic!("unexpected error: {other}"),
                Ok(_) => panic!("strategy '{name}' should not resolve"),
            }
        }

        // Parses but is not registered
        match manager.get_strategy("redis") {
            Err(PersistenceError::UnknownStrategy(n)) => assert_eq!(n, "redis"),
            _ => panic!("keyValue is not registered"),
        }
    }

    #[test]
    fn test_strategy_aliases() {
        assert_eq!("mongodb".parse::<StrategyKind>().unwrap(), StrategyKind::Document);
        assert_eq!("keyValue".parse::<StrategyKind>().unwrap(), StrategyKind::KeyValue);
        assert_eq!("redis".parse::<StrategyKind>().unwrap(), StrategyKind::KeyValue);

        let manager =
            PersistenceManager::new().with_strategy(Arc::new(DocumentStrategy::in_memory()));
        assert!(manager.is_registered("document"));
        assert!(!manager.is_registered("keyValue"));
    }
}
