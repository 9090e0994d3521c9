//! Concrete connectors and the factory registry keyed by source `type`.

pub mod insee;
pub mod rest;

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::client::ApiClient;
use crate::config::GlobalConfig;
use crate::error::HarvestError;
use crate::harvest::HarvestPipeline;
use crate::model::{HarvestParams, Record, SourceConfig};
use crate::persistence::PersistenceManager;
use crate::traits::{Connector, SourceStore};
use crate::transform::DataTransformer;

pub use insee::InseeConnector;
pub use rest::RestConnector;

/// Everything a factory needs to build a connector for one source.
#[derive(Clone)]
pub struct ConnectorContext {
    pub source: Arc<SourceConfig>,
    pub persistence: Arc<PersistenceManager>,
    pub global: Arc<GlobalConfig>,
}

pub type ConnectorFactory =
    Arc<dyn Fn(ConnectorContext) -> Result<Box<dyn Connector>, HarvestError> + Send + Sync>;

#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    factories: BTreeMap<String, ConnectorFactory>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `insee` and `rest` connectors.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(insee::SOURCE_TYPE, |ctx| Ok(Box::new(InseeConnector::new(ctx)?)));
        registry.register(rest::SOURCE_TYPE, |ctx| Ok(Box::new(RestConnector::new(ctx)?)));
        registry
    }

    /// Registers (or replaces) the factory for `source_type`.
    pub fn register<F>(&mut self, source_type: impl Into<String>, factory: F)
    where
        F: Fn(ConnectorContext) -> Result<Box<dyn Connector>, HarvestError> + Send + Sync + 'static,
    {
        self.factories.insert(source_type.into(), Arc::new(factory));
    }

    /// Keeps already registered factories; used to layer builtins under
    /// caller-supplied ones.
    pub fn merge_missing(&mut self, other: ConnectorRegistry) {
        for (source_type, factory) in other.factories {
            self.factories.entry(source_type).or_insert(factory);
        }
    }

    pub fn contains(&self, source_type: &str) -> bool {
        self.factories.contains_key(source_type)
    }

    pub fn types(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn create(&self, ctx: ConnectorContext) -> Result<Box<dyn Connector>, HarvestError> {
        let factory = self
            .factories
            .get(&ctx.source.source_type)
            .ok_or_else(|| HarvestError::ConnectorNotFound(ctx.source.source_type.clone()))?;
        factory(ctx)
    }
}

// ============================================================================
// Shared connector plumbing
// ============================================================================

/// HTTP client and harvest tail shared by the builtin connectors.
pub struct ConnectorBase {
    source: Arc<SourceConfig>,
    client: ApiClient,
    pipeline: HarvestPipeline,
}

impl ConnectorBase {
    pub fn new(ctx: &ConnectorContext) -> Result<Self, HarvestError> {
        let source = Arc::clone(&ctx.source);
        let client = ApiClient::from_source(&source, &ctx.global.http)?;
        let store = SourceStore::for_source(&source, &ctx.persistence)?;
        let pipeline = HarvestPipeline::new(
            source.id.clone(),
            DataTransformer::from_config(source.transform.as_ref()),
            store,
        )
        .with_timeout(Duration::from_millis(ctx.global.harvest.stage_timeout_ms));

        Ok(Self {
            source,
            client,
            pipeline,
        })
    }

    pub fn source(&self) -> &SourceConfig {
        &self.source
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    pub fn pipeline(&self) -> &HarvestPipeline {
        &self.pipeline
    }

    pub fn store(&self) -> &SourceStore {
        self.pipeline.store()
    }
}

/// String form of a parameter; numbers are accepted too.
pub fn param_str(params: &HarvestParams, key: &str) -> Option<String> {
    match params.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Query pairs from a `query` object parameter.
pub fn query_pairs(params: &HarvestParams) -> Vec<(String, String)> {
    let Some(Value::Object(query)) = params.get("query") else {
        return Vec::new();
    };
    query
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| {
            let text = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), text)
        })
        .collect()
}

/// Follows a dotted path into a response body.
pub fn extract_path<'a>(body: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(body, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

/// Objects become records; other items are wrapped as `{"value": item}`.
pub fn into_records(data: Value) -> Vec<Record> {
    fn record_of(item: Value) -> Record {
        match item {
            Value::Object(record) => record,
            other => {
                let mut record = Record::new();
                record.insert("value".to_string(), other);
                record
            }
        }
    }

    match data {
        Value::Null => Vec::new(),
        Value::Array(items) => items.into_iter().map(record_of).collect(),
        other => vec![record_of(other)],
    }
}
