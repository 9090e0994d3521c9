//! Application context and the operations exposed to façade layers.
//!
//! A [`SourceManager`] is built once per process (or per test) and passed by
//! reference. [`SourceManager::initialize`] loads the configuration tree,
//! connects persistence backends and validates every source against the
//! connector and strategy registries; it runs at most once.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{error, info, instrument, warn};

use crate::config::{validate_configuration, ConfigManager, GlobalConfig, LoadReport};
use crate::connectors::{ConnectorContext, ConnectorRegistry};
use crate::error::{ConfigError, HarvestError, PersistenceError};
use crate::executor::HarvestExecutor;
use crate::health::{HealthCheckOptions, HealthManager, HealthProbe, HealthSummary};
use crate::model::{HarvestParams, HarvestResult, HealthCheckRecord, Record, SourceConfig};
use crate::persistence::{
    DeleteOutcome, DocumentStrategy, KeyValueStore, KeyValueStrategy, MemoryStore,
    PersistenceManager, PersistenceStrategy, Query, RedisStore, StrategyKind, UpdateOutcome,
};
use crate::traits::Connector;

/// Options for [`SourceManager::harvest_all`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HarvestAllOptions {
    /// Parameters passed to every connector
    pub params: HarvestParams,
    /// Skip sources whose schedule is absent or disabled
    pub scheduled_only: bool,
}

/// State that exists once `initialize` has succeeded.
struct Runtime {
    global: Arc<GlobalConfig>,
    persistence: Arc<PersistenceManager>,
    connectors: ConnectorRegistry,
    health: HealthManager,
    executor: HarvestExecutor,
    load_report: LoadReport,
}

pub struct SourceManagerBuilder {
    config_root: PathBuf,
    connectors: ConnectorRegistry,
    strategies: Vec<Arc<dyn PersistenceStrategy>>,
    probes: Vec<(String, Arc<dyn HealthProbe>)>,
}

impl SourceManagerBuilder {
    /// Registers a connector factory; builtins with the same type are replaced.
    pub fn with_connector<F>(mut self, source_type: impl Into<String>, factory: F) -> Self
    where
        F: Fn(ConnectorContext) -> Result<Box<dyn Connector>, HarvestError> + Send + Sync + 'static,
    {
        self.connectors.register(source_type, factory);
        self
    }

    /// Replaces the default backend for the strategy's kind.
    pub fn with_strategy(mut self, strategy: Arc<dyn PersistenceStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    pub fn with_probe(
        mut self,
        source_type: impl Into<String>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        self.probes.push((source_type.into(), probe));
        self
    }

    pub fn build(self) -> SourceManager {
        SourceManager {
            config: ConfigManager::new(self.config_root),
            extra_connectors: self.connectors,
            extra_strategies: self.strategies,
            extra_probes: self.probes,
            runtime: OnceCell::new(),
        }
    }
}

pub struct SourceManager {
    config: ConfigManager,
    extra_connectors: ConnectorRegistry,
    extra_strategies: Vec<Arc<dyn PersistenceStrategy>>,
    extra_probes: Vec<(String, Arc<dyn HealthProbe>)>,
    runtime: OnceCell<Runtime>,
}

impl SourceManager {
    pub fn builder(config_root: impl Into<PathBuf>) -> SourceManagerBuilder {
        SourceManagerBuilder {
            config_root: config_root.into(),
            connectors: ConnectorRegistry::new(),
            strategies: Vec::new(),
            probes: Vec::new(),
        }
    }

    pub fn new(config_root: impl Into<PathBuf>) -> Self {
        Self::builder(config_root).build()
    }

    pub fn config(&self) -> &ConfigManager {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.runtime.initialized()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Loads configuration, connects persistence and registers connectors.
    /// Later calls return immediately.
    ///
    /// # Errors
    ///
    /// A malformed global document, a backend that cannot connect, or a
    /// loaded source whose `type` or `persistence.strategy` is not registered.
    #[instrument(skip(self), fields(root = %self.config.root().display()))]
    pub async fn initialize(&self) -> Result<(), HarvestError> {
        self.runtime.get_or_try_init(|| self.bootstrap()).await?;
        Ok(())
    }

    async fn bootstrap(&self) -> Result<Runtime, HarvestError> {
        let load_report = self.config.load().await?;
        let global = Arc::new(self.config.global().await);

        let persistence = Arc::new(self.build_persistence(&global));
        persistence.connect_all().await?;

        let mut connectors = self.extra_connectors.clone();
        connectors.merge_missing(ConnectorRegistry::with_builtin());

        for source in self.config.get_sources().await {
            if !connectors.contains(&source.source_type) {
                error!(
                    source_id = %source.id,
                    source_type = %source.source_type,
                    "No connector for source type"
                );
                return Err(HarvestError::ConnectorNotFound(source.source_type.clone()));
            }
            if let Some(strategy) = source.strategy_name() {
                persistence.get_strategy(strategy)?;
            }
        }

        let health = self.extra_probes.iter().fold(
            HealthManager::new(Arc::clone(&persistence), &global.health, &global.http),
            |health, (source_type, probe)| {
                health.with_probe(source_type.clone(), Arc::clone(probe))
            },
        );

        info!(
            sources = load_report.loaded.len(),
            rejected = load_report.failed.len(),
            connectors = ?connectors.types(),
            "Source manager initialized"
        );

        Ok(Runtime {
            executor: HarvestExecutor::new(global.harvest.max_concurrent),
            global,
            persistence,
            connectors,
            health,
            load_report,
        })
    }

    fn build_persistence(&self, global: &GlobalConfig) -> PersistenceManager {
        let document = match &global.persistence.document.data_dir {
            Some(dir) => DocumentStrategy::with_data_dir(dir),
            None => DocumentStrategy::in_memory(),
        };

        let kv_settings = &global.persistence.key_value;
        let kv_store: Arc<dyn KeyValueStore> = match &kv_settings.url {
            Some(url) => Arc::new(RedisStore::new(url.clone())),
            None => Arc::new(MemoryStore::new()),
        };
        let key_value = KeyValueStrategy::new(kv_store)
            .with_default_ttl(Duration::from_secs(kv_settings.default_ttl_seconds));

        let mut persistence = PersistenceManager::new()
            .with_strategy(Arc::new(document))
            .with_strategy(Arc::new(key_value));
        for strategy in &self.extra_strategies {
            persistence.register(Arc::clone(strategy));
        }
        persistence
    }

    /// Closes persistence connections.
    pub async fn shutdown(&self) -> Result<(), HarvestError> {
        if let Some(runtime) = self.runtime.get() {
            runtime.persistence.close_all().await?;
            info!("Source manager shut down");
        }
        Ok(())
    }

    fn runtime(&self) -> Result<&Runtime, HarvestError> {
        self.runtime.get().ok_or(HarvestError::NotInitialized)
    }

    /// Sources rejected by the last full configuration load.
    pub fn rejected_sources(&self) -> Vec<(String, String)> {
        self.runtime
            .get()
            .map(|r| r.load_report.failed.clone())
            .unwrap_or_default()
    }

    // ========================================================================
    // Sources
    // ========================================================================

    pub async fn get_sources(&self) -> Vec<Arc<SourceConfig>> {
        self.config.get_sources().await
    }

    pub async fn get_source_config(&self, id: &str) -> Result<Arc<SourceConfig>, HarvestError> {
        self.config
            .get_source(id)
            .await
            .ok_or_else(|| HarvestError::SourceNotFound(id.to_string()))
    }

    async fn connector(&self, id: &str) -> Result<Box<dyn Connector>, HarvestError> {
        let runtime = self.runtime()?;
        let source = self.get_source_config(id).await?;
        runtime.connectors.create(ConnectorContext {
            source,
            persistence: Arc::clone(&runtime.persistence),
            global: Arc::clone(&runtime.global),
        })
    }

    // ========================================================================
    // Harvesting
    // ========================================================================

    /// Harvests one source. Errors propagate to the caller.
    #[instrument(skip(self, params))]
    pub async fn harvest_source_by_id(
        &self,
        id: &str,
        params: &HarvestParams,
    ) -> Result<HarvestResult, HarvestError> {
        let connector = self.connector(id).await?;
        match self.runtime()?.executor.execute(connector.as_ref(), params).await {
            Ok(result) => Ok(result),
            Err(e) => {
                error!(source_id = %id, error = %e, "Harvest failed");
                Err(e)
            }
        }
    }

    /// Harvests every source in turn. A failing source becomes a failed
    /// entry; this call itself never fails.
    pub async fn harvest_all(&self, options: &HarvestAllOptions) -> Vec<HarvestResult> {
        let mut results = Vec::new();
        for source in self.get_sources().await {
            if options.scheduled_only && !source.schedule.as_ref().is_some_and(|s| s.enabled) {
                continue;
            }
            let result = match self.harvest_source_by_id(&source.id, &options.params).await {
                Ok(result) => result,
                Err(e) => HarvestResult::failed(&source.id, e),
            };
            results.push(result);
        }

        let failed = results.iter().filter(|r| !r.success).count();
        info!(total = results.len(), failed, "Harvest round completed");
        results
    }

    // ========================================================================
    // Data access
    // ========================================================================

    pub async fn get_data(&self, id: &str, query: &Query) -> Result<Vec<Record>, HarvestError> {
        self.connector(id).await?.get_data(query).await
    }

    pub async fn get_data_by_id(
        &self,
        id: &str,
        doc_id: &str,
    ) -> Result<Option<Record>, HarvestError> {
        self.connector(id).await?.get_data_by_id(doc_id).await
    }

    pub async fn update_data(
        &self,
        id: &str,
        query: &Query,
        patch: &Record,
    ) -> Result<UpdateOutcome, HarvestError> {
        self.connector(id).await?.update_data(query, patch).await
    }

    pub async fn delete_data(
        &self,
        id: &str,
        query: &Query,
    ) -> Result<DeleteOutcome, HarvestError> {
        self.connector(id).await?.delete_data(query).await
    }

    // ========================================================================
    // Health
    // ========================================================================

    /// Fails only for an unknown source or an uninitialized manager; probe
    /// problems are reported in the record.
    pub async fn check_source_health(
        &self,
        id: &str,
        options: &HealthCheckOptions,
    ) -> Result<HealthCheckRecord, HarvestError> {
        let runtime = self.runtime()?;
        let source = self.get_source_config(id).await?;
        Ok(runtime.health.check_source_health(&source, options).await)
    }

    pub async fn check_all_sources_health(
        &self,
        options: &HealthCheckOptions,
    ) -> Vec<HealthCheckRecord> {
        let Ok(runtime) = self.runtime() else {
            warn!("Health check requested before initialization");
            return Vec::new();
        };
        let sources = self.get_sources().await;
        runtime.health.check_all_sources_health(&sources, options).await
    }

    pub async fn get_health_history(
        &self,
        id: &str,
        days: u32,
    ) -> Result<Vec<HealthCheckRecord>, HarvestError> {
        self.get_source_config(id).await?;
        self.runtime()?.health.get_health_history(id, days).await
    }

    pub async fn get_health_summary(&self) -> Result<HealthSummary, HarvestError> {
        let sources = self.get_sources().await;
        self.runtime()?.health.get_health_summary(&sources).await
    }

    pub fn health(&self) -> Result<&HealthManager, HarvestError> {
        Ok(&self.runtime()?.health)
    }

    // ========================================================================
    // Source administration
    // ========================================================================

    /// Every problem that keeps `config` from being accepted; empty when valid.
    pub fn validate_source(&self, config: &SourceConfig) -> Vec<String> {
        let mut problems = Vec::new();
        match validate_configuration(config) {
            Err(ConfigError::MissingFields { missing, .. }) => {
                problems.extend(missing.into_iter().map(|field| format!("missing {}", field)));
            }
            Err(e) => problems.push(e.to_string()),
            Ok(()) => {}
        }

        if let Ok(runtime) = self.runtime() {
            if !config.source_type.is_empty() && !runtime.connectors.contains(&config.source_type) {
                let missing = HarvestError::ConnectorNotFound(config.source_type.clone());
                problems.push(missing.to_string());
            }
            // Unparseable names were already reported above
            if let Some(strategy) = config.strategy_name() {
                let known = strategy.parse::<StrategyKind>().is_ok();
                if known && !runtime.persistence.is_registered(strategy) {
                    let missing = PersistenceError::UnknownStrategy(strategy.to_string());
                    problems.push(missing.to_string());
                }
            }
        }
        problems
    }

    fn ensure_valid(&self, config: &SourceConfig) -> Result<(), HarvestError> {
        validate_configuration(config)?;
        let runtime = self.runtime()?;
        if !runtime.connectors.contains(&config.source_type) {
            return Err(HarvestError::ConnectorNotFound(config.source_type.clone()));
        }
        if let Some(strategy) = config.strategy_name() {
            runtime.persistence.get_strategy(strategy)?;
        }
        Ok(())
    }

    pub async fn add_source(
        &self,
        config: SourceConfig,
    ) -> Result<Arc<SourceConfig>, HarvestError> {
        self.ensure_valid(&config)?;
        Ok(self.config.add_source_config(config).await?)
    }

    pub async fn update_source(
        &self,
        id: &str,
        mut config: SourceConfig,
    ) -> Result<Arc<SourceConfig>, HarvestError> {
        config.id = id.to_string();
        self.ensure_valid(&config)?;
        Ok(self.config.update_source_config(id, config).await?)
    }

    pub async fn remove_source(&self, id: &str) -> Result<(), HarvestError> {
        Ok(self.config.remove_source_config(id).await?)
    }
}
