use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::error::{ConfigError, HarvestError, PersistenceError};
use crate::model::{CollectionSpec, HarvestParams, HarvestResult, Record, SourceConfig};
use crate::persistence::document::ID_FIELD;
use crate::persistence::{
    DeleteOutcome, Payload, PersistenceManager, PersistenceStrategy, Query, SaveOutcome,
    UpdateOutcome,
};

/// A source's collection bound to the strategy it is configured with.
#[derive(Clone)]
pub struct SourceStore {
    collection: CollectionSpec,
    strategy: Arc<dyn PersistenceStrategy>,
}

impl SourceStore {
    pub fn new(collection: CollectionSpec, strategy: Arc<dyn PersistenceStrategy>) -> Self {
        Self { collection, strategy }
    }

    /// Resolves the source's `persistence.strategy` against the registry.
    pub fn for_source(
        source: &SourceConfig,
        persistence: &PersistenceManager,
    ) -> Result<Self, HarvestError> {
        let name = source.strategy_name().ok_or_else(|| ConfigError::MissingFields {
            source_id: source.id.clone(),
            missing: vec!["persistence.strategy".to_string()],
        })?;
        let strategy = persistence.get_strategy(name)?;
        Ok(Self::new(source.collection_spec(), strategy))
    }

    pub fn collection(&self) -> &CollectionSpec {
        &self.collection
    }

    pub fn strategy(&self) -> &Arc<dyn PersistenceStrategy> {
        &self.strategy
    }

    pub async fn save(&self, data: impl Into<Payload>) -> Result<SaveOutcome, PersistenceError> {
        self.strategy.save(&self.collection, data.into()).await
    }

    pub async fn find(&self, query: &Query) -> Result<Vec<Record>, PersistenceError> {
        self.strategy.find(&self.collection, query).await
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<Record>, PersistenceError> {
        let mut query = Query::new();
        query.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
        self.strategy.find_one(&self.collection, &query).await
    }

    pub async fn update(
        &self,
        query: &Query,
        patch: &Record,
    ) -> Result<UpdateOutcome, PersistenceError> {
        self.strategy.update(&self.collection, query, patch).await
    }

    pub async fn delete(&self, query: &Query) -> Result<DeleteOutcome, PersistenceError> {
        self.strategy.delete(&self.collection, query).await
    }
}

/// Capability contract of a per-source-type connector.
///
/// Only `harvest` is source-specific; data access goes through the source's
/// [`SourceStore`] unless a connector overrides it.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Source this connector instance serves.
    fn source(&self) -> &SourceConfig;

    fn store(&self) -> &SourceStore;

    /// Runs one fetch → transform → persist cycle. Failures are logged and
    /// returned to the caller.
    async fn harvest(&self, params: &HarvestParams) -> Result<HarvestResult, HarvestError>;

    async fn get_data(&self, query: &Query) -> Result<Vec<Record>, HarvestError> {
        Ok(self.store().find(query).await?)
    }

    async fn get_data_by_id(&self, id: &str) -> Result<Option<Record>, HarvestError> {
        Ok(self.store().find_by_id(id).await?)
    }

    async fn update_data(
        &self,
        query: &Query,
        patch: &Record,
    ) -> Result<UpdateOutcome, HarvestError> {
        Ok(self.store().update(query, patch).await?)
    }

    async fn delete_data(&self, query: &Query) -> Result<DeleteOutcome, HarvestError> {
        Ok(self.store().delete(query).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PersistenceConfig;
    use crate::persistence::DocumentStrategy;
    use serde_json::json;

    fn source(strategy: Option<&str>) -> SourceConfig {
        let mut source = SourceConfig::new("geo", "Geo", "insee");
        source.persistence = strategy.map(|s| PersistenceConfig {
            strategy: Some(s.to_string()),
            ..Default::default()
        });
        source
    }

    fn manager() -> PersistenceManager {
        PersistenceManager::new().with_strategy(Arc::new(DocumentStrategy::in_memory()))
    }

    #[tokio::test]
    async fn test_store_round_trip_by_id() {
        let store = SourceStore::for_source(&source(Some("mongodb")), &manager()).unwrap();
        assert_eq!(store.collection().name, "geo");

        let record = json!({"_id": "75056", "nom": "Paris"}).as_object().cloned().unwrap();
        store.save(record).await.unwrap();

        let found = store.find_by_id("75056").await.unwrap().unwrap();
        assert_eq!(found["nom"], "Paris");
        assert!(store.find_by_id("69123").await.unwrap().is_none());
    }

    #[test]
    fn test_store_requires_strategy() {
        let err = SourceStore::for_source(&source(None), &manager()).err().unwrap();
        assert!(matches!(err, HarvestError::Config(ConfigError::MissingFields { .. })));

        let err = SourceStore::for_source(&source(Some("cassandra")), &manager()).err().unwrap();
        assert!(err.to_string().contains("cassandra"));
    }
}
