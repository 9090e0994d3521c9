//! Error taxonomy for the harvesting core.
//!
//! Each layer owns a focused error enum; [`HarvestError`] is what the
//! orchestrator hands back to façade callers.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Configuration Errors
// ============================================================================

/// Errors raised while loading, validating or writing source configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A configuration file or directory could not be read or written
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A configuration document exists but is not valid JSON for its type
    #[error("Malformed configuration file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Required fields are absent; every missing field is listed
    #[error("Invalid configuration for source '{source_id}': missing {}", .missing.join(", "))]
    MissingFields {
        source_id: String,
        missing: Vec<String>,
    },

    /// The configuration names a persistence strategy that does not exist
    #[error("Source '{source_id}' uses unknown persistence strategy '{strategy}'")]
    InvalidStrategy { source_id: String, strategy: String },

    /// `${VAR}` placeholders left unresolved while `strictEnv` is on
    #[error("Unresolved environment variables in '{path}': {}", .names.join(", "))]
    UnresolvedVariables { path: PathBuf, names: Vec<String> },

    /// The id cannot name a directory under `sources/`
    #[error("Invalid source id '{0}'")]
    InvalidSourceId(String),

    /// A source with this id is already registered
    #[error("Source '{0}' already exists")]
    AlreadyExists(String),

    /// No source with this id is registered
    #[error("Source '{0}' not found")]
    NotFound(String),
}

// ============================================================================
// Persistence Errors
// ============================================================================

/// Errors raised by persistence strategies and the strategy registry.
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// The requested strategy name is not registered
    #[error("Unknown persistence strategy: '{0}'")]
    UnknownStrategy(String),

    /// A record collides with an existing `_id`, unique index or key
    #[error("Duplicate key '{key}' in '{collection}'")]
    DuplicateKey { collection: String, key: String },

    /// Redis backend failure
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Record (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// File-backed collection I/O failure
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other backend read/write failure
    #[error("Backend error: {0}")]
    Backend(String),
}

// ============================================================================
// Transform Errors
// ============================================================================

/// Per-field transformation failure. Always recovered by the transformer.
#[derive(Error, Debug)]
pub enum TransformError {
    #[error("Cannot parse '{value}' as a date")]
    InvalidDate { value: String },

    #[error("Unsupported date format '{0}'")]
    UnsupportedFormat(String),
}

// ============================================================================
// Pipeline Errors
// ============================================================================

/// Errors that can occur while running the harvest pipeline tail.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Stage execution exceeded timeout
    #[error("Stage '{stage}' timed out after {timeout_secs}s")]
    StageTimeout { stage: String, timeout_secs: u64 },

    /// The persistence stage failed
    #[error("Persist stage failed: {0}")]
    PersistFailed(#[from] PersistenceError),
}

// ============================================================================
// Top-level Errors
// ============================================================================

/// Errors surfaced by connectors, clients and the [`SourceManager`].
///
/// [`SourceManager`]: crate::manager::SourceManager
#[derive(Error, Debug)]
pub enum HarvestError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// No connector factory is registered for this source type
    #[error("No connector registered for source type '{0}'")]
    ConnectorNotFound(String),

    /// No source with this id is configured
    #[error("Source '{0}' not found")]
    SourceNotFound(String),

    /// The source cannot perform network operations without a base URL
    #[error("Source '{0}' has no connection.baseUrl")]
    MissingBaseUrl(String),

    /// Non-2xx HTTP response (other than 429)
    #[error("HTTP {status} from {url}: {body}")]
    Transport {
        status: u16,
        url: String,
        body: String,
    },

    /// HTTP 429 response; handled by the retry handler until attempts run out
    #[error("Rate limited by {url}")]
    RateLimited {
        url: String,
        retry_after: Option<Duration>,
    },

    /// Connection, TLS, timeout or body decoding failure
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The remote answered with a payload the connector cannot interpret
    #[error("Unexpected response from '{source_id}': {message}")]
    UnexpectedResponse { source_id: String, message: String },

    /// The harvest parameters are invalid for the selected mode
    #[error("Invalid harvest parameters: {0}")]
    InvalidParams(String),

    /// An operation was called before `SourceManager::initialize`
    #[error("Source manager is not initialized")]
    NotInitialized,

    #[error("Executor error: {0}")]
    Executor(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure classification consumed by the retry handler.
pub trait Retryable {
    /// HTTP status carried by the error, if any.
    fn http_status(&self) -> Option<u16>;

    /// Server-advertised wait before the next attempt, if any.
    fn retry_after(&self) -> Option<Duration> {
        None
    }

    /// Client errors other than 429 are final; everything else may be retried.
    fn is_retryable(&self) -> bool {
        match self.http_status() {
            Some(status) => !((400..500).contains(&status) && status != 429),
            None => true,
        }
    }
}

impl Retryable for HarvestError {
    fn http_status(&self) -> Option<u16> {
        match self {
            HarvestError::Transport { status, .. } => Some(*status),
            HarvestError::RateLimited { .. } => Some(429),
            HarvestError::Network(e) => e.status().map(|s| s.as_u16()),
            // Local failures will not improve on retry
            HarvestError::Config(_)
            | HarvestError::ConnectorNotFound(_)
            | HarvestError::SourceNotFound(_)
            | HarvestError::MissingBaseUrl(_)
            | HarvestError::InvalidUrl(_)
            | HarvestError::InvalidParams(_) => Some(400),
            _ => None,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            HarvestError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
