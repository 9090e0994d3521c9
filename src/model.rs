//! Data model shared by every layer of the harvester.
//!
//! Source descriptors mirror the JSON documents of the configuration tree
//! (camelCase keys). Harvested data stays schema-less: a [`Record`] is an
//! ordered JSON object.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One stored or harvested record. Key order is preserved.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Free-form parameters passed to a harvest (mode, identifiers, filters).
pub type HarvestParams = serde_json::Map<String, serde_json::Value>;

// ============================================================================
// Source Configuration
// ============================================================================

/// Full descriptor for one data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceConfig {
    /// Unique, stable identifier (also the config directory name)
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Selects the connector implementation (e.g. `"insee"`, `"rest"`)
    #[serde(rename = "type", default)]
    pub source_type: String,

    /// Source-specific sub-kind (e.g. `"sirene"`, `"series"`, `"geo"`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistence: Option<PersistenceConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<TransformConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthConfig>,
}

/// Identity document (`source.json`) of a source directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceIdentity {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub source_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl SourceConfig {
    /// Creates a bare descriptor with only its identity set.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        source_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            source_type: source_type.into(),
            kind: None,
            description: None,
            connection: None,
            persistence: None,
            schedule: None,
            transform: None,
            health: None,
        }
    }

    pub fn identity(&self) -> SourceIdentity {
        SourceIdentity {
            id: Some(self.id.clone()),
            name: self.name.clone(),
            source_type: self.source_type.clone(),
            kind: self.kind.clone(),
            description: self.description.clone(),
        }
    }

    pub fn base_url(&self) -> Option<&str> {
        self.connection
            .as_ref()
            .and_then(|c| c.base_url.as_deref())
            .filter(|u| !u.is_empty())
    }

    pub fn strategy_name(&self) -> Option<&str> {
        self.persistence
            .as_ref()
            .and_then(|p| p.strategy.as_deref())
            .filter(|s| !s.is_empty())
    }

    /// Storage target for this source's records.
    ///
    /// The collection name defaults to the source id.
    pub fn collection_spec(&self) -> CollectionSpec {
        match &self.persistence {
            Some(p) => CollectionSpec {
                name: p.collection.clone().unwrap_or_else(|| self.id.clone()),
                indexes: p.indexes.clone(),
                ttl_seconds: p.ttl.as_ref().filter(|t| t.enabled).map(|t| t.seconds),
            },
            None => CollectionSpec::named(self.id.clone()),
        }
    }
}

/// `connection.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Default path for generic connectors, relative to `base_url`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(default, alias = "authentication", skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,

    /// Per-request timeout; falls back to the global HTTP timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Extra headers sent with every request
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthType {
    #[default]
    None,
    Bearer,
    ApiKey,
    Basic,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    #[serde(rename = "type", default)]
    pub auth_type: AuthType,

    /// Token, API key, or `user:password` for basic auth
    #[serde(default, alias = "token", skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,

    /// Header name for API keys (default `X-API-Key`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_minute: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_hour: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_backoff")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_delay_ms() -> u64 {
    1000
}

fn default_backoff() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_delay_ms(),
            backoff_multiplier: default_backoff(),
        }
    }
}

/// `persistence.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceConfig {
    #[serde(default, alias = "strategies", skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,

    /// Collection (document store) or key prefix (key-value store)
    #[serde(default, alias = "keyPrefix", skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indexes: Vec<IndexSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<TtlConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSpec {
    pub fields: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TtlConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub seconds: u64,
}

fn default_true() -> bool {
    true
}

/// Resolved storage target handed to persistence strategies.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionSpec {
    pub name: String,
    pub indexes: Vec<IndexSpec>,
    pub ttl_seconds: Option<u64>,
}

impl CollectionSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// `schedule.json`. Consumed by an external scheduler only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

// ============================================================================
// Transform Rules
// ============================================================================

/// `transform.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<TransformRule>,
}

/// Declarative per-field normalization instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformRule {
    pub field: String,
    #[serde(flatten)]
    pub kind: RuleKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RuleKind {
    Date {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        format: Option<String>,
    },
    Enum {
        #[serde(default)]
        mapping: BTreeMap<String, serde_json::Value>,
    },
    Number,
    Boolean,
    String,
    Array,
}

impl TransformRule {
    pub fn new(field: impl Into<String>, kind: RuleKind) -> Self {
        Self {
            field: field.into(),
            kind,
        }
    }
}

// ============================================================================
// Health Configuration
// ============================================================================

/// `health.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub endpoints: Vec<EndpointProbe>,

    #[serde(default)]
    pub thresholds: HealthThresholds,

    #[serde(default)]
    pub alerting: AlertingConfig,

    /// Number of array elements / object keys kept in `dataSample`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_data_size: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointProbe {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Absolute URL, or a path joined onto `connection.baseUrl`
    pub url: String,

    #[serde(default = "default_method")]
    pub method: String,

    #[serde(default = "default_expected_status")]
    pub expected_status: u16,

    #[serde(default = "default_probe_timeout", alias = "timeout")]
    pub timeout_ms: u64,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_expected_status() -> u16 {
    200
}

fn default_probe_timeout() -> u64 {
    10_000
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthThresholds {
    /// Milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consecutive_failures: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertingConfig {
    #[serde(default)]
    pub enabled: bool,
}

// ============================================================================
// Health Records
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    NoConfig,
    Disabled,
    Healthy,
    UnexpectedStatus,
    ConnectionError,
    Error,
}

/// Result of one liveness probe. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckRecord {
    pub source_id: String,
    pub is_healthy: bool,
    pub status: HealthStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time: Option<u64>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_sample: Option<serde_json::Value>,
}

impl HealthCheckRecord {
    pub fn new(source_id: &str, status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            source_id: source_id.to_string(),
            is_healthy: matches!(status, HealthStatus::Healthy | HealthStatus::Disabled),
            status,
            message: message.into(),
            response_time: None,
            timestamp: Utc::now(),
            endpoint: None,
            error: None,
            data_sample: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    ResponseTimeExceeded,
    ConsecutiveFailures,
}

/// Threshold breach recorded separately from health records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthAlert {
    pub source_id: String,
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub message: String,
    pub value: u64,
    pub threshold: u64,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Harvest Results
// ============================================================================

/// Summary of one harvest attempt, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarvestResult {
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub data_count: usize,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<HarvestStats>,
}

impl HarvestResult {
    pub fn succeeded(source: &str, data_count: usize) -> Self {
        Self {
            source: source.to_string(),
            timestamp: Utc::now(),
            data_count,
            success: true,
            error: None,
            stats: None,
        }
    }

    pub fn failed(source: &str, error: impl ToString) -> Self {
        Self {
            source: source.to_string(),
            timestamp: Utc::now(),
            data_count: 0,
            success: false,
            error: Some(error.to_string()),
            stats: None,
        }
    }
}

/// Per-stage timings of a harvest.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarvestStats {
    pub total_duration_ms: u64,
    pub fetch_duration_ms: u64,
    pub transform_duration_ms: u64,
    pub persist_duration_ms: u64,
    pub records_fetched: usize,
    pub records_stored: usize,
    pub write_failures: usize,
}
