//! Source liveness probing, health history and alerting.
//!
//! Health checking never fails: every problem ends up as a
//! [`HealthCheckRecord`] with an unhealthy status. Every result is stored in
//! the `health_checks` collection of the configured strategy; threshold
//! breaches go to `health_alerts` and the in-memory active alert set. Both
//! collections expire entries after `health.retentionDays`.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::client::ApiClient;
use crate::config::{HealthSettings, HttpSettings};
use crate::error::{HarvestError, PersistenceError};
use crate::model::{
    AlertKind, CollectionSpec, EndpointProbe, HealthAlert, HealthCheckRecord, HealthConfig,
    HealthStatus, Record, SourceConfig,
};
use crate::persistence::{PersistenceManager, PersistenceStrategy, Query};

pub const HEALTH_COLLECTION: &str = "health_checks";
pub const ALERT_COLLECTION: &str = "health_alerts";

// ============================================================================
// Probes
// ============================================================================

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct HealthCheckOptions {
    /// Overrides `health.maxDataSize` for this call
    pub max_data_size: Option<usize>,
}

/// What a probe observed. Turned into a [`HealthCheckRecord`] by the manager.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub status: HealthStatus,
    pub message: String,
    pub response_time: Option<u64>,
    pub endpoint: Option<String>,
    pub error: Option<String>,
    pub data_sample: Option<Value>,
}

impl ProbeOutcome {
    pub fn new(status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            response_time: None,
            endpoint: None,
            error: None,
            data_sample: None,
        }
    }
}

/// Liveness probe for one source type.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Must not fail; errors become unhealthy outcomes.
    async fn probe(
        &self,
        source: &SourceConfig,
        health: &HealthConfig,
        max_data_size: usize,
    ) -> ProbeOutcome;
}

/// Issues one request against the first configured endpoint, or the
/// source's base URL when none is configured.
pub struct HttpProbe {
    settings: HttpSettings,
}

impl HttpProbe {
    pub fn new(settings: HttpSettings) -> Self {
        Self { settings }
    }

    fn endpoint_for(source: &SourceConfig, health: &HealthConfig) -> Option<EndpointProbe> {
        if let Some(endpoint) = health.endpoints.first() {
            return Some(endpoint.clone());
        }
        source.base_url().map(|base| EndpointProbe {
            name: None,
            url: base.to_string(),
            method: "GET".to_string(),
            expected_status: 200,
            timeout_ms: 10_000,
        })
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(
        &self,
        source: &SourceConfig,
        health: &HealthConfig,
        max_data_size: usize,
    ) -> ProbeOutcome {
        let Some(endpoint) = Self::endpoint_for(source, health) else {
            return ProbeOutcome::new(HealthStatus::Error, "No health endpoint configured");
        };

        let method = match Method::from_bytes(endpoint.method.to_ascii_uppercase().as_bytes()) {
            Ok(method) => method,
            Err(e) => {
                let mut outcome = ProbeOutcome::new(HealthStatus::Error, "Invalid probe method");
                outcome.error = Some(e.to_string());
                return outcome;
            }
        };

        // Authenticated like harvests whenever the source has a base URL
        let client = ApiClient::from_source(source, &self.settings).ok();
        let request = match &client {
            Some(client) => client
                .url_for(&endpoint.url)
                .map(|url| client.authorize(client.http().request(method, url))),
            None => url::Url::parse(&endpoint.url)
                .map_err(HarvestError::from)
                .map(|url| reqwest::Client::new().request(method, url)),
        };
        let request = match request {
            Ok(request) => request.timeout(Duration::from_millis(endpoint.timeout_ms)),
            Err(e) => {
                let mut outcome = ProbeOutcome::new(HealthStatus::Error, "Invalid probe URL");
                outcome.endpoint = Some(endpoint.url.clone());
                outcome.error = Some(e.to_string());
                return outcome;
            }
        };

        let start = Instant::now();
        let response = request.send().await;
        let elapsed = start.elapsed().as_millis() as u64;

        let mut outcome = match response {
            Ok(response) => {
                let status = response.status().as_u16();
                if status == endpoint.expected_status {
                    let mut outcome = ProbeOutcome::new(HealthStatus::Healthy, "Source is healthy");
                    outcome.data_sample = match response.json::<Value>().await {
                        Ok(body) => sample(&body, max_data_size),
                        Err(_) => None,
                    };
                    outcome
                } else {
                    ProbeOutcome::new(
                        HealthStatus::UnexpectedStatus,
                        format!("Expected status {}, got {}", endpoint.expected_status, status),
                    )
                }
            }
            Err(e) => {
                let mut outcome =
                    ProbeOutcome::new(HealthStatus::ConnectionError, "Connection failed");
                outcome.error = Some(e.to_string());
                outcome
            }
        };
        outcome.response_time = Some(elapsed);
        outcome.endpoint = Some(endpoint.name.unwrap_or(endpoint.url));
        outcome
    }
}

/// First `n` array elements or first `n` object entries.
pub fn sample(body: &Value, n: usize) -> Option<Value> {
    match body {
        Value::Array(items) => Some(Value::Array(items.iter().take(n).cloned().collect())),
        Value::Object(map) => Some(Value::Object(
            map.iter().take(n).map(|(k, v)| (k.clone(), v.clone())).collect::<Map<_, _>>(),
        )),
        Value::Null => None,
        other => Some(other.clone()),
    }
}

// ============================================================================
// Summary
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceHealth {
    pub source_id: String,
    pub name: String,
    /// `None` when the source was never checked
    pub status: Option<HealthStatus>,
    pub is_healthy: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub response_time: Option<u64>,
    pub active_alerts: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub unchecked: usize,
    pub active_alerts: usize,
    pub sources: Vec<SourceHealth>,
    pub generated_at: DateTime<Utc>,
}

// ============================================================================
// Manager
// ============================================================================

pub struct HealthManager {
    persistence: Arc<PersistenceManager>,
    storage: String,
    checks: CollectionSpec,
    alerts: CollectionSpec,
    max_data_size: usize,
    default_probe: Arc<dyn HealthProbe>,
    probes: HashMap<String, Arc<dyn HealthProbe>>,
    active_alerts: RwLock<HashMap<String, Vec<HealthAlert>>>,
}

impl HealthManager {
    pub fn new(
        persistence: Arc<PersistenceManager>,
        settings: &HealthSettings,
        http: &HttpSettings,
    ) -> Self {
        let ttl_seconds = settings
            .retention_days
            .checked_mul(86_400)
            .filter(|secs| *secs > 0);
        let retained = |name: &str| CollectionSpec {
            ttl_seconds,
            ..CollectionSpec::named(name)
        };
        Self {
            persistence,
            storage: settings.storage.clone(),
            checks: retained(HEALTH_COLLECTION),
            alerts: retained(ALERT_COLLECTION),
            max_data_size: settings.max_data_size,
            default_probe: Arc::new(HttpProbe::new(http.clone())),
            probes: HashMap::new(),
            active_alerts: RwLock::new(HashMap::new()),
        }
    }

    /// Probe used for sources of `source_type` instead of the HTTP probe.
    pub fn with_probe(
        mut self,
        source_type: impl Into<String>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        self.probes.insert(source_type.into(), probe);
        self
    }

    fn probe_for(&self, source_type: &str) -> &Arc<dyn HealthProbe> {
        self.probes.get(source_type).unwrap_or(&self.default_probe)
    }

    fn storage(&self) -> Result<Arc<dyn PersistenceStrategy>, PersistenceError> {
        self.persistence.get_strategy(&self.storage)
    }

    #[instrument(skip(self, source, options), fields(source_id = %source.id))]
    pub async fn check_source_health(
        &self,
        source: &SourceConfig,
        options: &HealthCheckOptions,
    ) -> HealthCheckRecord {
        let Some(health) = &source.health else {
            let record = HealthCheckRecord::new(
                &source.id,
                HealthStatus::NoConfig,
                "No health configuration",
            );
            return self.stored(record).await;
        };
        if !health.enabled {
            let record = HealthCheckRecord::new(
                &source.id,
                HealthStatus::Disabled,
                "Health checks disabled",
            );
            return self.stored(record).await;
        }

        let max_data_size = options
            .max_data_size
            .or(health.max_data_size)
            .unwrap_or(self.max_data_size);
        let outcome = self
            .probe_for(&source.source_type)
            .probe(source, health, max_data_size)
            .await;

        let mut record = HealthCheckRecord::new(&source.id, outcome.status, outcome.message);
        record.response_time = outcome.response_time;
        record.endpoint = outcome.endpoint;
        record.error = outcome.error;
        record.data_sample = outcome.data_sample;

        if record.is_healthy {
            debug!(response_time = ?record.response_time, "Source healthy");
        } else {
            warn!(status = ?record.status, message = %record.message, "Source unhealthy");
        }

        let record = self.stored(record).await;
        if health.alerting.enabled {
            self.evaluate_alerts(source, health, &record).await;
        }
        record
    }

    async fn stored(&self, record: HealthCheckRecord) -> HealthCheckRecord {
        if let Err(e) = self.store_record(&record).await {
            warn!(error = %e, "Failed to store health record");
        }
        record
    }

    /// Checks every source in order. Never fails.
    pub async fn check_all_sources_health(
        &self,
        sources: &[Arc<SourceConfig>],
        options: &HealthCheckOptions,
    ) -> Vec<HealthCheckRecord> {
        let mut records = Vec::with_capacity(sources.len());
        for source in sources {
            records.push(self.check_source_health(source, options).await);
        }
        let healthy = records.iter().filter(|r| r.is_healthy).count();
        info!(total = records.len(), healthy, "Health check round completed");
        records
    }

    async fn store_record(&self, record: &HealthCheckRecord) -> Result<(), PersistenceError> {
        let doc = to_record(record)?;
        self.storage()?.save(&self.checks, doc.into()).await?;
        Ok(())
    }

    async fn evaluate_alerts(
        &self,
        source: &SourceConfig,
        health: &HealthConfig,
        record: &HealthCheckRecord,
    ) {
        let mut alerts = Vec::new();

        let observed = (health.thresholds.response_time, record.response_time);
        if let (Some(threshold), Some(response_time)) = observed {
            if response_time > threshold {
                alerts.push(HealthAlert {
                    source_id: source.id.clone(),
                    kind: AlertKind::ResponseTimeExceeded,
                    message: format!("Response time {}ms exceeds {}ms", response_time, threshold),
                    value: response_time,
                    threshold,
                    timestamp: Utc::now(),
                });
            }
        }

        if let Some(threshold) = health.thresholds.consecutive_failures.filter(|t| *t > 0) {
            if !record.is_healthy {
                match self.history(&source.id, None).await {
                    Ok(history) => {
                        let failures = history.iter().take_while(|r| !r.is_healthy).count() as u64;
                        if failures >= u64::from(threshold) {
                            alerts.push(HealthAlert {
                                source_id: source.id.clone(),
                                kind: AlertKind::ConsecutiveFailures,
                                message: format!("{} consecutive failed health checks", failures),
                                value: failures,
                                threshold: u64::from(threshold),
                                timestamp: Utc::now(),
                            });
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to read health history"),
                }
            }
        }

        for alert in &alerts {
            warn!(alert = ?alert.kind, message = %alert.message, "Health alert raised");
            if let Err(e) = self.store_alert(alert).await {
                warn!(error = %e, "Failed to store health alert");
            }
        }

        let mut active = self.active_alerts.write().await;
        if alerts.is_empty() {
            active.remove(&source.id);
        } else {
            active.insert(source.id.clone(), alerts);
        }
    }

    async fn store_alert(&self, alert: &HealthAlert) -> Result<(), PersistenceError> {
        let doc = to_record(alert)?;
        self.storage()?.save(&self.alerts, doc.into()).await?;
        Ok(())
    }

    /// Alerts raised by the latest check of `source_id`.
    pub async fn active_alerts(&self, source_id: &str) -> Vec<HealthAlert> {
        self.active_alerts
            .read()
            .await
            .get(source_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Stored records of the last `days` days, newest first. A window
    /// reaching past the representable range returns the whole history.
    pub async fn get_health_history(
        &self,
        source_id: &str,
        days: u32,
    ) -> Result<Vec<HealthCheckRecord>, HarvestError> {
        let since = ChronoDuration::try_days(i64::from(days))
            .and_then(|window| Utc::now().checked_sub_signed(window));
        Ok(self.history(source_id, since).await?)
    }

    async fn history(
        &self,
        source_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<HealthCheckRecord>, PersistenceError> {
        let mut query = Query::new();
        query.insert("sourceId".to_string(), Value::String(source_id.to_string()));
        if let Some(since) = since {
            let mut range = Map::new();
            range.insert("$gte".to_string(), Value::String(since.to_rfc3339()));
            query.insert("timestamp".to_string(), Value::Object(range));
        }

        let docs = self.storage()?.find(&self.checks, &query).await?;
        let mut records: Vec<HealthCheckRecord> = docs
            .into_iter()
            .filter_map(|doc| serde_json::from_value(Value::Object(doc)).ok())
            .collect();
        // Stored order is oldest first; keep that tie-break reversed
        records.reverse();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(records)
    }

    /// Latest status and active alert count for each source.
    pub async fn get_health_summary(
        &self,
        sources: &[Arc<SourceConfig>],
    ) -> Result<HealthSummary, HarvestError> {
        let mut entries = Vec::with_capacity(sources.len());
        for source in sources {
            let latest = self.history(&source.id, None).await?.into_iter().next();
            let active_alerts = self.active_alerts(&source.id).await.len();
            entries.push(SourceHealth {
                source_id: source.id.clone(),
                name: source.name.clone(),
                status: latest.as_ref().map(|r| r.status),
                is_healthy: latest.as_ref().is_some_and(|r| r.is_healthy),
                last_check: latest.as_ref().map(|r| r.timestamp),
                response_time: latest.as_ref().and_then(|r| r.response_time),
                active_alerts,
            });
        }

        Ok(HealthSummary {
            total: entries.len(),
            healthy: entries.iter().filter(|e| e.is_healthy).count(),
            unhealthy: entries.iter().filter(|e| e.status.is_some() && !e.is_healthy).count(),
            unchecked: entries.iter().filter(|e| e.status.is_none()).count(),
            active_alerts: entries.iter().map(|e| e.active_alerts).sum(),
            sources: entries,
            generated_at: Utc::now(),
        })
    }
}

fn to_record<T: Serialize>(value: &T) -> Result<Record, PersistenceError> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        _ => Err(PersistenceError::Backend("expected a JSON object".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AlertingConfig, ConnectionConfig, HealthThresholds};
    use crate::persistence::DocumentStrategy;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn manager() -> HealthManager {
        let persistence =
            PersistenceManager::new().with_strategy(Arc::new(DocumentStrategy::in_memory()));
        HealthManager::new(
            Arc::new(persistence),
            &HealthSettings::default(),
            &HttpSettings::default(),
        )
    }

    fn source(url: &str, thresholds: HealthThresholds) -> SourceConfig {
        let mut source = SourceConfig::new("sirene", "Sirene", "insee");
        source.connection = Some(ConnectionConfig {
            base_url: Some(url.to_string()),
            ..Default::default()
        });
        source.health = Some(HealthConfig {
            enabled: true,
            endpoints: vec![EndpointProbe {
                name: None,
                url: "status".to_string(),
                method: "GET".to_string(),
                expected_status: 200,
                timeout_ms: 2_000,
            }],
            thresholds,
            alerting: AlertingConfig { enabled: true },
            max_data_size: Some(2),
        });
        source
    }

    #[tokio::test]
    async fn test_no_config_is_unhealthy_and_stored() {
        let health = manager();
        let record = health
            .check_source_health(
                &SourceConfig::new("x", "X", "insee"),
                &HealthCheckOptions::default(),
            )
            .await;
        assert!(!record.is_healthy);
        assert_eq!(record.status, HealthStatus::NoConfig);

        let history = health.get_health_history("x", 1).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, HealthStatus::NoConfig);
    }

    #[tokio::test]
    async fn test_disabled_is_reported_healthy_and_stored() {
        let health = manager();
        let mut s = SourceConfig::new("x", "X", "insee");
        s.health = Some(HealthConfig::default());
        let record = health.check_source_health(&s, &HealthCheckOptions::default()).await;
        assert!(record.is_healthy);
        assert_eq!(record.status, HealthStatus::Disabled);

        let history = health.get_health_history("x", 1).await.unwrap();
        assert_eq!(history[0].status, HealthStatus::Disabled);
    }

    #[tokio::test]
    async fn test_history_window_larger_than_calendar() {
        let health = manager();
        health
            .check_source_health(
                &SourceConfig::new("sirene", "Sirene", "insee"),
                &HealthCheckOptions::default(),
            )
            .await;

        let history = health.get_health_history("sirene", u32::MAX).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_expired_health_records_are_dropped() {
        let persistence =
            PersistenceManager::new().with_strategy(Arc::new(DocumentStrategy::in_memory()));
        let settings = HealthSettings {
            retention_days: 1,
            ..Default::default()
        };
        let health = HealthManager::new(Arc::new(persistence), &settings, &HttpSettings::default());
        assert_eq!(health.checks.ttl_seconds, Some(86_400));

        let old = Utc::now() - ChronoDuration::days(2);
        let mut stale =
            HealthCheckRecord::new("sirene", HealthStatus::ConnectionError, "Connection failed");
        stale.timestamp = old;
        let mut doc = to_record(&stale).unwrap();
        doc.insert("createdAt".to_string(), json!(old.to_rfc3339()));
        health
            .storage()
            .unwrap()
            .save(&health.checks, doc.into())
            .await
            .unwrap();

        health
            .check_source_health(
                &SourceConfig::new("sirene", "Sirene", "insee"),
                &HealthCheckOptions::default(),
            )
            .await;

        let history = health.get_health_history("sirene", 30).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, HealthStatus::NoConfig);
    }

    #[test]
    fn test_zero_retention_keeps_records() {
        let settings = HealthSettings {
            retention_days: 0,
            ..Default::default()
        };
        let health = HealthManager::new(
            Arc::new(PersistenceManager::new()),
            &settings,
            &HttpSettings::default(),
        );
        assert_eq!(health.checks.ttl_seconds, None);
        assert_eq!(health.alerts.ttl_seconds, None);
    }

    #[tokio::test]
    async fn test_healthy_probe_attaches_bounded_sample_and_is_stored() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([1, 2, 3, 4])))
            .mount(&server)
            .await;

        let health = manager();
        let s = source(&server.uri(), HealthThresholds::default());
        let record = health.check_source_health(&s, &HealthCheckOptions::default()).await;

        assert_eq!(record.status, HealthStatus::Healthy);
        assert_eq!(record.data_sample, Some(json!([1, 2])));
        assert!(record.response_time.is_some());

        let history = health.get_health_history("sirene", 1).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_unexpected_status_and_connection_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let health = manager();
        let record = health
            .check_source_health(
                &source(&server.uri(), HealthThresholds::default()),
                &HealthCheckOptions::default(),
            )
            .await;
        assert_eq!(record.status, HealthStatus::UnexpectedStatus);
        assert!(!record.is_healthy);

        let record = health
            .check_source_health(
                &source("http://127.0.0.1:1", HealthThresholds::default()),
                &HealthCheckOptions::default(),
            )
            .await;
        assert_eq!(record.status, HealthStatus::ConnectionError);
        assert!(record.error.is_some());
    }

    #[tokio::test]
    async fn test_consecutive_failures_alert() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let health = manager();
        let s = source(
            &server.uri(),
            HealthThresholds {
                response_time: None,
                consecutive_failures: Some(2),
            },
        );

        health.check_source_health(&s, &HealthCheckOptions::default()).await;
        assert!(health.active_alerts("sirene").await.is_empty());

        health.check_source_health(&s, &HealthCheckOptions::default()).await;
        let alerts = health.active_alerts("sirene").await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::ConsecutiveFailures);
        assert_eq!(alerts[0].value, 2);
    }

    #[tokio::test]
    async fn test_slow_response_alert_and_summary() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(100)))
            .mount(&server)
            .await;

        let health = manager();
        let s = Arc::new(source(
            &server.uri(),
            HealthThresholds {
                response_time: Some(10),
                consecutive_failures: None,
            },
        ));

        let record = health.check_source_health(&s, &HealthCheckOptions::default()).await;
        assert!(record.is_healthy);

        let alerts = health.active_alerts("sirene").await;
        assert_eq!(alerts[0].kind, AlertKind::ResponseTimeExceeded);

        let never_checked = Arc::new(SourceConfig::new("geo", "Geo", "insee"));
        let summary = health.get_health_summary(&[s, never_checked]).await.unwrap();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.healthy, 1);
        assert_eq!(summary.unchecked, 1);
        assert_eq!(summary.active_alerts, 1);
    }

    struct FixedProbe;

    #[async_trait]
    impl HealthProbe for FixedProbe {
        async fn probe(&self, _: &SourceConfig, _: &HealthConfig, _: usize) -> ProbeOutcome {
            ProbeOutcome::new(HealthStatus::Error, "probe says no")
        }
    }

    #[tokio::test]
    async fn test_probe_registry_by_source_type() {
        let health = manager().with_probe("insee", Arc::new(FixedProbe));
        let record = health
            .check_source_health(
                &source("http://localhost", HealthThresholds::default()),
                &HealthCheckOptions::default(),
            )
            .await;
        assert_eq!(record.status, HealthStatus::Error);
        assert_eq!(record.message, "probe says no");
    }

    #[test]
    fn test_sample_object_keys() {
        let body = json!({"a": 1, "b": 2, "c": 3});
        assert_eq!(sample(&body, 2), Some(json!({"a": 1, "b": 2})));
    }
}
