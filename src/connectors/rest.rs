//! Generic JSON endpoint connector.

use async_trait::async_trait;
use tracing::{info, instrument};

use super::{extract_path, into_records, param_str, query_pairs, ConnectorBase, ConnectorContext};
use crate::error::HarvestError;
use crate::model::{HarvestParams, HarvestResult, Record, SourceConfig};
use crate::traits::{Connector, SourceStore};

pub const SOURCE_TYPE: &str = "rest";

/// Fetches `params.path` (or `connection.endpoint`) and stores the records
/// found at `params.dataPath`, or the whole body.
pub struct RestConnector {
    base: ConnectorBase,
}

impl RestConnector {
    pub fn new(ctx: ConnectorContext) -> Result<Self, HarvestError> {
        Ok(Self {
            base: ConnectorBase::new(&ctx)?,
        })
    }

    async fn fetch(&self, params: &HarvestParams) -> Result<Vec<Record>, HarvestError> {
        let source = self.base.source();
        let path = param_str(params, "path")
            .or_else(|| source.connection.as_ref().and_then(|c| c.endpoint.clone()))
            .unwrap_or_default();

        let body = self.base.client().get_json(&path, &query_pairs(params)).await?;

        let data = match param_str(params, "dataPath") {
            Some(data_path) => extract_path(&body, &data_path).cloned().ok_or_else(|| {
                HarvestError::UnexpectedResponse {
                    source_id: source.id.clone(),
                    message: format!("no data at '{}'", data_path),
                }
            })?,
            None => body,
        };
        Ok(into_records(data))
    }
}

#[async_trait]
impl Connector for RestConnector {
    fn source(&self) -> &SourceConfig {
        self.base.source()
    }

    fn store(&self) -> &SourceStore {
        self.base.store()
    }

    #[instrument(skip(self, params), fields(source_id = %self.base.source().id))]
    async fn harvest(&self, params: &HarvestParams) -> Result<HarvestResult, HarvestError> {
        info!("Starting REST harvest");
        self.base.pipeline().execute(self.fetch(params)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GlobalConfig;
    use crate::model::{AuthConfig, AuthType, ConnectionConfig, PersistenceConfig};
    use crate::persistence::{KeyValueStrategy, MemoryStore, PersistenceManager, Query};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn connector(base_url: &str) -> RestConnector {
        let mut source = SourceConfig::new("communes", "Communes", SOURCE_TYPE);
        source.connection = Some(ConnectionConfig {
            base_url: Some(base_url.to_string()),
            endpoint: Some("communes".into()),
            auth: Some(AuthConfig {
                auth_type: AuthType::ApiKey,
                credential: Some("secret".into()),
                header: Some("X-Api-Token".into()),
            }),
            ..Default::default()
        });
        source.persistence = Some(PersistenceConfig {
            strategy: Some("redis".into()),
            collection: Some("communes".into()),
            ..Default::default()
        });

        let kv = KeyValueStrategy::new(Arc::new(MemoryStore::new()));
        RestConnector::new(ConnectorContext {
            source: Arc::new(source),
            persistence: Arc::new(PersistenceManager::new().with_strategy(Arc::new(kv))),
            global: Arc::new(GlobalConfig::default()),
        })
        .unwrap()
    }

    fn params(value: Value) -> HarvestParams {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_harvest_default_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/communes"))
            .and(header("x-api-token", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"code": "75056", "nom": "Paris"},
                {"code": "69123", "nom": "Lyon"}
            ])))
            .mount(&server)
            .await;

        let c = connector(&server.uri());
        let result = c.harvest(&HarvestParams::new()).await.unwrap();
        assert_eq!(result.data_count, 2);

        let mut q = Query::new();
        q.insert("nom".into(), json!("Lyon"));
        assert_eq!(c.get_data(&q).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_harvest_with_path_query_and_data_path() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/departements/69/communes"))
            .and(query_param("fields", "nom"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": {"items": [{"nom": "Lyon"}]}
            })))
            .mount(&server)
            .await;

        let c = connector(&server.uri());
        let result = c
            .harvest(&params(json!({
                "path": "departements/69/communes",
                "query": {"fields": "nom"},
                "dataPath": "result.items"
            })))
            .await
            .unwrap();
        assert_eq!(result.data_count, 1);

        let err = c
            .harvest(&params(json!({
                "path": "departements/69/communes",
                "query": {"fields": "nom"},
                "dataPath": "nope"
            })))
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::UnexpectedResponse { .. }));
    }
}
