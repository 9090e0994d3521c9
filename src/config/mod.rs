//! Configuration tree loading and the in-memory source registry.
//!
//! Layout under the configuration root:
//!
//! ```text
//! <root>/global.json
//! <root>/.env
//! <root>/sources/<id>/source.json       identity (required)
//! <root>/sources/<id>/connection.json   optional
//! <root>/sources/<id>/persistence.json  optional
//! <root>/sources/<id>/schedule.json     optional
//! <root>/sources/<id>/transform.json    optional
//! <root>/sources/<id>/health.json       optional
//! ```
//!
//! A missing optional document leaves the matching field `None`. A malformed
//! document fails that source's load only; other sources still load.

pub mod env;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::ConfigError;
use crate::model::SourceConfig;
use crate::persistence::StrategyKind;

const GLOBAL_FILE: &str = "global.json";
const SOURCES_DIR: &str = "sources";
const IDENTITY_FILE: &str = "source.json";
const CONNECTION_FILE: &str = "connection.json";
const PERSISTENCE_FILE: &str = "persistence.json";
const SCHEDULE_FILE: &str = "schedule.json";
const TRANSFORM_FILE: &str = "transform.json";
const HEALTH_FILE: &str = "health.json";

// ============================================================================
// Global Configuration
// ============================================================================

/// `global.json`. Every section is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalConfig {
    pub http: HttpSettings,
    pub persistence: PersistenceSettings,
    pub health: HealthSettings,
    pub harvest: HarvestSettings,
    /// Fail a source's load when it references unset environment variables
    pub strict_env: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpSettings {
    pub timeout_ms: u64,
    pub user_agent: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            user_agent: format!("stat-harvester/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistenceSettings {
    pub document: DocumentSettings,
    pub key_value: KeyValueSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DocumentSettings {
    /// One JSON file per collection; in-memory only when absent
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeyValueSettings {
    /// Redis URL; in-memory store when absent
    pub url: Option<String>,
    pub default_ttl_seconds: u64,
}

impl Default for KeyValueSettings {
    fn default() -> Self {
        Self {
            url: None,
            default_ttl_seconds: 86_400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthSettings {
    /// Strategy that stores health records and alerts
    pub storage: String,
    pub max_data_size: usize,
    /// Stored health records and alerts expire after this many days; 0 keeps them
    pub retention_days: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            storage: StrategyKind::Document.as_str().to_string(),
            max_data_size: 5,
            retention_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HarvestSettings {
    pub max_concurrent: usize,
    pub stage_timeout_ms: u64,
}

impl Default for HarvestSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            stage_timeout_ms: 300_000,
        }
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Checks the fields a source needs before it can be harvested.
///
/// Every missing field is reported, not just the first one.
pub fn validate_configuration(config: &SourceConfig) -> Result<(), ConfigError> {
    let mut missing = Vec::new();
    if config.id.trim().is_empty() {
        missing.push("id".to_string());
    }
    if config.name.trim().is_empty() {
        missing.push("name".to_string());
    }
    if config.source_type.trim().is_empty() {
        missing.push("type".to_string());
    }
    if config.base_url().is_none() {
        missing.push("connection.baseUrl".to_string());
    }
    if config.strategy_name().is_none() {
        missing.push("persistence.strategy".to_string());
    }

    if !missing.is_empty() {
        return Err(ConfigError::MissingFields {
            source_id: config.id.clone(),
            missing,
        });
    }

    if let Some(strategy) = config.strategy_name() {
        if strategy.parse::<StrategyKind>().is_err() {
            return Err(ConfigError::InvalidStrategy {
                source_id: config.id.clone(),
                strategy: strategy.to_string(),
            });
        }
    }

    Ok(())
}

// ============================================================================
// Config Manager
// ============================================================================

/// Outcome of a full configuration load.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    /// Directory name and reason for every source that was rejected
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
struct Entry {
    dir: PathBuf,
    config: Arc<SourceConfig>,
}

/// Owns the source registry. Mutations go through the config tree on disk.
pub struct ConfigManager {
    root: PathBuf,
    global: RwLock<GlobalConfig>,
    sources: RwLock<BTreeMap<String, Entry>>,
}

impl ConfigManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            global: RwLock::new(GlobalConfig::default()),
            sources: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn sources_dir(&self) -> PathBuf {
        self.root.join(SOURCES_DIR)
    }

    pub async fn global(&self) -> GlobalConfig {
        self.global.read().await.clone()
    }

    /// Loads the global document and every source directory.
    ///
    /// Invalid sources are skipped and reported; only an unreadable root or a
    /// malformed `global.json` fails the whole load.
    pub async fn load(&self) -> Result<LoadReport, ConfigError> {
        let env_file = self.root.join(".env");
        if env_file.exists() {
            if let Err(e) = dotenvy::from_path(&env_file) {
                warn!(path = %env_file.display(), error = %e, "Failed to load .env file");
            }
        }

        let global: GlobalConfig = read_document(&self.root.join(GLOBAL_FILE), false)
            .await?
            .unwrap_or_default();
        let strict = global.strict_env;
        *self.global.write().await = global;

        let mut report = LoadReport::default();
        let mut registry = BTreeMap::new();

        for dir in self.list_source_dirs().await? {
            let dir_name = dir_name(&dir);
            let loaded = match load_source_dir(&dir, strict).await {
                Ok(config) => validate_configuration(&config).map(|_| config),
                Err(e) => Err(e),
            };

            match loaded {
                Ok(config) => {
                    debug!(source_id = %config.id, "Source configuration loaded");
                    report.loaded.push(config.id.clone());
                    registry.insert(
                        config.id.clone(),
                        Entry {
                            dir,
                            config: Arc::new(config),
                        },
                    );
                }
                Err(e) => {
                    warn!(source = %dir_name, error = %e, "Skipping source configuration");
                    report.failed.push((dir_name, e.to_string()));
                }
            }
        }

        *self.sources.write().await = registry;
        info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            root = %self.root.display(),
            "Configuration loaded"
        );
        Ok(report)
    }

    async fn list_source_dirs(&self) -> Result<Vec<PathBuf>, ConfigError> {
        let sources_dir = self.sources_dir();
        let mut entries = match tokio::fs::read_dir(&sources_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(path = %sources_dir.display(), "No sources directory");
                return Ok(Vec::new());
            }
            Err(e) => return Err(io_error(&sources_dir, e)),
        };

        let mut dirs = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&sources_dir, e))? {
            let path = entry.path();
            if path.is_dir() {
                dirs.push(path);
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    /// Loads one source directory without validating it.
    pub async fn load_source_config(&self, dir: &Path) -> Result<SourceConfig, ConfigError> {
        let strict = self.global.read().await.strict_env;
        load_source_dir(dir, strict).await
    }

    pub async fn get_source(&self, id: &str) -> Option<Arc<SourceConfig>> {
        self.sources.read().await.get(id).map(|e| Arc::clone(&e.config))
    }

    pub async fn get_sources(&self) -> Vec<Arc<SourceConfig>> {
        self.sources
            .read()
            .await
            .values()
            .map(|e| Arc::clone(&e.config))
            .collect()
    }

    /// Writes a new source directory and loads it into the registry.
    pub async fn add_source_config(
        &self,
        config: SourceConfig,
    ) -> Result<Arc<SourceConfig>, ConfigError> {
        check_source_id(&config.id)?;
        validate_configuration(&config)?;
        if self.sources.read().await.contains_key(&config.id) {
            return Err(ConfigError::AlreadyExists(config.id));
        }

        let dir = self.sources_dir().join(&config.id);
        write_source_dir(&dir, &config).await?;
        info!(source_id = %config.id, "Source added");
        self.reload_source(&config.id, dir).await
    }

    /// Rewrites a source's documents, then reloads it from disk.
    pub async fn update_source_config(
        &self,
        id: &str,
        mut config: SourceConfig,
    ) -> Result<Arc<SourceConfig>, ConfigError> {
        check_source_id(id)?;
        let dir = self
            .sources
            .read()
            .await
            .get(id)
            .map(|e| e.dir.clone())
            .ok_or_else(|| ConfigError::NotFound(id.to_string()))?;

        config.id = id.to_string();
        validate_configuration(&config)?;
        write_source_dir(&dir, &config).await?;
        info!(source_id = %id, "Source updated");
        self.reload_source(id, dir).await
    }

    /// Deletes a source directory, then drops it from the registry. The
    /// entry stays registered when the directory cannot be removed.
    pub async fn remove_source_config(&self, id: &str) -> Result<(), ConfigError> {
        let mut sources = self.sources.write().await;
        let dir = sources
            .get(id)
            .map(|e| e.dir.clone())
            .ok_or_else(|| ConfigError::NotFound(id.to_string()))?;

        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(io_error(&dir, e)),
        }
        sources.remove(id);
        info!(source_id = %id, "Source removed");
        Ok(())
    }

    async fn reload_source(
        &self,
        id: &str,
        dir: PathBuf,
    ) -> Result<Arc<SourceConfig>, ConfigError> {
        let mut config = self.load_source_config(&dir).await?;
        if config.id.is_empty() {
            config.id = id.to_string();
        }
        validate_configuration(&config)?;

        let config = Arc::new(config);
        self.sources.write().await.insert(
            id.to_string(),
            Entry {
                dir,
                config: Arc::clone(&config),
            },
        );
        Ok(config)
    }
}

// ============================================================================
// Document I/O
// ============================================================================

async fn load_source_dir(dir: &Path, strict: bool) -> Result<SourceConfig, ConfigError> {
    let identity_path = dir.join(IDENTITY_FILE);
    let identity: crate::model::SourceIdentity = read_document(&identity_path, strict)
        .await?
        .ok_or_else(|| ConfigError::Io {
            path: identity_path.clone(),
            source: std::io::Error::new(ErrorKind::NotFound, "missing source identity document"),
        })?;

    let mut config = SourceConfig::new(
        identity.id.unwrap_or_else(|| dir_name(dir)),
        identity.name,
        identity.source_type,
    );
    config.kind = identity.kind;
    config.description = identity.description;
    config.connection = read_document(&dir.join(CONNECTION_FILE), strict).await?;
    config.persistence = read_document(&dir.join(PERSISTENCE_FILE), strict).await?;
    config.schedule = read_document(&dir.join(SCHEDULE_FILE), strict).await?;
    config.transform = read_document(&dir.join(TRANSFORM_FILE), strict).await?;
    config.health = read_document(&dir.join(HEALTH_FILE), strict).await?;
    Ok(config)
}

/// Reads and interpolates one JSON document. A missing file yields `None`.
async fn read_document<T: DeserializeOwned>(
    path: &Path,
    strict: bool,
) -> Result<Option<T>, ConfigError> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "Configuration document not found");
            return Ok(None);
        }
        Err(e) => return Err(io_error(path, e)),
    };

    let parse_err = |source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    };

    let mut value: serde_json::Value = serde_json::from_str(&raw).map_err(parse_err)?;
    let unresolved = env::interpolate(&mut value);
    if !unresolved.is_empty() {
        if strict {
            return Err(ConfigError::UnresolvedVariables {
                path: path.to_path_buf(),
                names: unresolved,
            });
        }
        warn!(
            path = %path.display(),
            variables = ?unresolved,
            "Unresolved environment variables left as-is"
        );
    }

    serde_json::from_value(value).map(Some).map_err(parse_err)
}

async fn write_source_dir(dir: &Path, config: &SourceConfig) -> Result<(), ConfigError> {
    tokio::fs::create_dir_all(dir).await.map_err(|e| io_error(dir, e))?;

    write_document(&dir.join(IDENTITY_FILE), Some(&config.identity())).await?;
    write_document(&dir.join(CONNECTION_FILE), config.connection.as_ref()).await?;
    write_document(&dir.join(PERSISTENCE_FILE), config.persistence.as_ref()).await?;
    write_document(&dir.join(SCHEDULE_FILE), config.schedule.as_ref()).await?;
    write_document(&dir.join(TRANSFORM_FILE), config.transform.as_ref()).await?;
    write_document(&dir.join(HEALTH_FILE), config.health.as_ref()).await?;
    Ok(())
}

/// Writes `doc` as pretty JSON, or removes the file when `doc` is `None`.
async fn write_document<T: Serialize>(path: &Path, doc: Option<&T>) -> Result<(), ConfigError> {
    match doc {
        Some(doc) => {
            let body = serde_json::to_string_pretty(doc).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
            tokio::fs::write(path, body).await.map_err(|e| io_error(path, e))
        }
        None => match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(path, e)),
        },
    }
}

/// Accepts ids that name exactly one directory below `sources/`.
fn check_source_id(id: &str) -> Result<(), ConfigError> {
    let single_component = matches!(
        Path::new(id).components().collect::<Vec<_>>().as_slice(),
        [Component::Normal(_)]
    );
    if id.trim().is_empty() || id.contains(['/', '\\']) || !single_component {
        return Err(ConfigError::InvalidSourceId(id.to_string()));
    }
    Ok(())
}

fn io_error(path: &Path, source: std::io::Error) -> ConfigError {
    ConfigError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn dir_name(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConnectionConfig, PersistenceConfig};
    use serde_json::json;
    use tempfile::TempDir;

    fn write_json(path: &Path, value: serde_json::Value) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, serde_json::to_string_pretty(&value).unwrap()).unwrap();
    }

    fn seed_source(root: &Path, id: &str) {
        let dir = root.join("sources").join(id);
        write_json(&dir.join("source.json"), json!({"name": id, "type": "insee"}));
        write_json(
            &dir.join("connection.json"),
            json!({"baseUrl": "https://api.insee.fr/", "rateLimit": {"requestsPerMinute": 30}}),
        );
        write_json(&dir.join("persistence.json"), json!({"strategy": "document"}));
    }

    fn valid_source(id: &str) -> SourceConfig {
        let mut config = SourceConfig::new(id, "Sirene", "insee");
        config.connection = Some(ConnectionConfig {
            base_url: Some("https://api.insee.fr/".into()),
            ..Default::default()
        });
        config.persistence = Some(PersistenceConfig {
            strategy: Some("document".into()),
            ..Default::default()
        });
        config
    }

    #[test]
    fn test_validation_lists_every_missing_field() {
        let config = SourceConfig::new("sirene", "Sirene", "insee");
        let err = validate_configuration(&config).unwrap_err();
        match err {
            ConfigError::MissingFields { missing, .. } => {
                assert_eq!(
                    missing,
                    vec!["connection.baseUrl".to_string(), "persistence.strategy".to_string()]
                );
            }
            other => panic!("unexpected error: {other}"),
        }

        let empty = SourceConfig::new("", "", "");
        match validate_configuration(&empty).unwrap_err() {
            ConfigError::MissingFields { missing, .. } => assert_eq!(missing.len(), 5),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_validation_rejects_unknown_strategy() {
        let mut config = valid_source("sirene");
        config.persistence.as_mut().unwrap().strategy = Some("cassandra".into());
        let err = validate_configuration(&config).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidStrategy { ref strategy, .. } if strategy == "cassandra"
        ));
    }

    #[tokio::test]
    async fn test_missing_persistence_document_is_not_fatal() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("sources").join("bdm");
        write_json(&dir.join("source.json"), json!({"name": "BDM", "type": "insee"}));
        write_json(&dir.join("connection.json"), json!({"baseUrl": "https://api.insee.fr/"}));

        let manager = ConfigManager::new(tmp.path());
        let config = manager.load_source_config(&dir).await.unwrap();

        assert_eq!(config.id, "bdm");
        assert!(config.persistence.is_none());
        assert!(config.health.is_none());
        assert_eq!(config.base_url(), Some("https://api.insee.fr/"));
    }

    #[tokio::test]
    async fn test_malformed_document_fails_only_that_source() {
        let tmp = TempDir::new().unwrap();
        seed_source(tmp.path(), "good");
        seed_source(tmp.path(), "broken");
        std::fs::write(tmp.path().join("sources/broken/health.json"), "{ not json").unwrap();

        let manager = ConfigManager::new(tmp.path());
        let report = manager.load().await.unwrap();

        assert_eq!(report.loaded, vec!["good".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "broken");
        assert!(manager.get_source("good").await.is_some());
        assert!(manager.get_source("broken").await.is_none());
    }

    #[tokio::test]
    async fn test_load_interpolates_environment() {
        std::env::set_var("STAT_HARVESTER_CFG_TOKEN", "tok-123");
        let tmp = TempDir::new().unwrap();
        seed_source(tmp.path(), "sirene");
        write_json(
            &tmp.path().join("sources/sirene/connection.json"),
            json!({
                "baseUrl": "https://api.insee.fr/",
                "auth": {"type": "bearer", "credential": "${STAT_HARVESTER_CFG_TOKEN}"}
            }),
        );

        let manager = ConfigManager::new(tmp.path());
        manager.load().await.unwrap();
        let source = manager.get_source("sirene").await.unwrap();
        let auth = source.connection.as_ref().unwrap().auth.as_ref().unwrap();
        assert_eq!(auth.credential.as_deref(), Some("tok-123"));
    }

    #[tokio::test]
    async fn test_strict_env_rejects_unresolved_placeholders() {
        let tmp = TempDir::new().unwrap();
        write_json(&tmp.path().join("global.json"), json!({"strictEnv": true}));
        seed_source(tmp.path(), "sirene");
        write_json(
            &tmp.path().join("sources/sirene/connection.json"),
            json!({"baseUrl": "${STAT_HARVESTER_DEFINITELY_UNSET}"}),
        );

        let manager = ConfigManager::new(tmp.path());
        let report = manager.load().await.unwrap();
        assert!(report.loaded.is_empty());
        assert!(report.failed[0].1.contains("STAT_HARVESTER_DEFINITELY_UNSET"));
    }

    #[tokio::test]
    async fn test_add_update_remove_round_trip_through_disk() {
        let tmp = TempDir::new().unwrap();
        let manager = ConfigManager::new(tmp.path());
        manager.load().await.unwrap();

        let added = manager.add_source_config(valid_source("sirene")).await.unwrap();
        assert_eq!(added.name, "Sirene");
        assert!(tmp.path().join("sources/sirene/connection.json").exists());
        assert!(!tmp.path().join("sources/sirene/health.json").exists());

        let dup = manager.add_source_config(valid_source("sirene")).await.unwrap_err();
        assert!(matches!(dup, ConfigError::AlreadyExists(_)));

        let mut changed = valid_source("ignored-id");
        changed.name = "Sirene V3".into();
        let updated = manager.update_source_config("sirene", changed).await.unwrap();
        assert_eq!(updated.id, "sirene");
        assert_eq!(updated.name, "Sirene V3");

        // A fresh manager sees the same state on disk
        let reloaded = ConfigManager::new(tmp.path());
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.get_source("sirene").await.unwrap().name, "Sirene V3");

        manager.remove_source_config("sirene").await.unwrap();
        assert!(manager.get_source("sirene").await.is_none());
        assert!(!tmp.path().join("sources/sirene").exists());
        assert!(matches!(
            manager.remove_source_config("sirene").await,
            Err(ConfigError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_source_ids_must_stay_inside_sources_dir() {
        let tmp = TempDir::new().unwrap();
        let manager = ConfigManager::new(tmp.path().join("config"));
        manager.load().await.unwrap();

        for id in ["../escape", "a/b", "..", ".", "a\\b", "/abs", "  "] {
            let err = manager.add_source_config(valid_source(id)).await.unwrap_err();
            assert!(matches!(err, ConfigError::InvalidSourceId(ref bad) if bad == id), "{id}");
        }
        assert!(!tmp.path().join("escape").exists());
        assert!(manager.get_sources().await.is_empty());

        assert!(matches!(
            manager.update_source_config("../escape", valid_source("x")).await,
            Err(ConfigError::InvalidSourceId(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_remove_keeps_registry_entry() {
        let tmp = TempDir::new().unwrap();
        let manager = ConfigManager::new(tmp.path());
        manager.load().await.unwrap();
        manager.add_source_config(valid_source("sirene")).await.unwrap();

        // A plain file where the directory was makes the delete fail
        let dir = tmp.path().join("sources/sirene");
        std::fs::remove_dir_all(&dir).unwrap();
        std::fs::write(&dir, "not a directory").unwrap();

        let err = manager.remove_source_config("sirene").await.unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert!(manager.get_source("sirene").await.is_some());
    }

    #[tokio::test]
    async fn test_global_defaults_when_absent() {
        let tmp = TempDir::new().unwrap();
        let manager = ConfigManager::new(tmp.path());
        manager.load().await.unwrap();
        let global = manager.global().await;
        assert_eq!(global.http.timeout_ms, 30_000);
        assert_eq!(global.health.storage, "document");
        assert!(!global.strict_env);
    }
}
