//! Harvesting orchestration for external statistical APIs.
//!
//! Sources are described by a configuration tree, fetched through
//! rate-limited and retried HTTP clients, normalized by declarative rules,
//! stored through interchangeable persistence strategies and probed for
//! health. [`SourceManager`] is the entry point.

pub mod client;
pub mod config;
pub mod connectors;
pub mod error;
pub mod executor;
pub mod harvest;
pub mod health;
pub mod manager;
pub mod model;
pub mod persistence;
pub mod telemetry;
pub mod traits;
pub mod transform;

// Re-export common types for convenience
pub use config::{ConfigManager, GlobalConfig};
pub use error::{ConfigError, HarvestError, PersistenceError};
pub use executor::HarvestExecutor;
pub use health::{HealthCheckOptions, HealthManager, HealthProbe};
pub use manager::{HarvestAllOptions, SourceManager, SourceManagerBuilder};
pub use model::*;
pub use persistence::{PersistenceManager, PersistenceStrategy, Query, StrategyKind};
pub use traits::{Connector, SourceStore};
pub use transform::DataTransformer;
