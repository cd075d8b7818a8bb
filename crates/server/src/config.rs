use crate::api::links::UrlFactory;
use crate::templates::{HttpTemplateResolver, RoutingTemplateResolver};
use anyhow::{Context, Result};
use ruleflow_core::backend::{report_channel, DryRunBackend, ExecutionBackend, ProcessBackend};
use ruleflow_core::storage::{JsonlEventLog, RedbWorkflowStore, WorkDirectory};
use ruleflow_core::template::DirectoryTemplateResolver;
use ruleflow_core::{EngineConfig, WorkflowEngine};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub engine: EngineSection,

    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_index_file")]
    pub index_file: String,

    #[serde(default = "default_event_log_dir")]
    pub event_log_dir: String,

    #[serde(default = "default_work_dir")]
    pub work_dir: String,

    #[serde(default = "default_templates_dir")]
    pub templates_dir: String,
}

fn default_index_file() -> String {
    "index.redb".to_string()
}

fn default_event_log_dir() -> String {
    "events".to_string()
}

fn default_work_dir() -> String {
    "work".to_string()
}

fn default_templates_dir() -> String {
    "templates".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            index_file: default_index_file(),
            event_log_dir: default_event_log_dir(),
            work_dir: default_work_dir(),
            templates_dir: default_templates_dir(),
        }
    }
}

/// Which execution backend receives submitted nodes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Process,
    DryRun,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    #[serde(default)]
    pub backend: BackendKind,
}

fn default_lock_timeout_ms() -> u64 {
    5000
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
            backend: BackendKind::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,
}

fn default_path_prefix() -> String {
    "/api/v1".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            path_prefix: default_path_prefix(),
        }
    }
}

impl ServerConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self::default()
        };

        config.data_dir = data_dir;
        config.api.path_prefix = normalize_prefix(&config.api.path_prefix);
        Ok(config)
    }

    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.index_file)
    }

    pub fn event_log_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.event_log_dir)
    }

    pub fn work_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.work_dir)
    }

    pub fn templates_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.templates_dir)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            lock_timeout: Duration::from_millis(self.engine.lock_timeout_ms),
        }
    }
}

/// `api/v1/` and `/api/v1` both become `/api/v1`; empty stays empty
fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{}", trimmed)
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<WorkflowEngine>,
    pub urls: UrlFactory,
}

impl AppState {
    /// Wire the engine from configuration and start the report listener
    pub fn new(config: &ServerConfig, base_url: &str) -> Result<Self> {
        let store = Arc::new(
            RedbWorkflowStore::new(config.index_path()).context("Failed to create workflow store")?,
        );
        let event_log = Arc::new(
            JsonlEventLog::new(config.event_log_path()).context("Failed to create event log")?,
        );
        let workdir = WorkDirectory::new(config.work_path()).context("Failed to create work directory")?;

        let templates_dir = config.templates_path();
        std::fs::create_dir_all(&templates_dir).context("Failed to create templates directory")?;
        let resolver = Arc::new(RoutingTemplateResolver::new(
            DirectoryTemplateResolver::new(templates_dir),
            HttpTemplateResolver::new(),
        ));

        let (sink, reports) = report_channel();
        let backend: Arc<dyn ExecutionBackend> = match config.engine.backend {
            BackendKind::Process => Arc::new(ProcessBackend::new(sink)),
            BackendKind::DryRun => Arc::new(DryRunBackend::new()),
        };

        let engine = Arc::new(WorkflowEngine::new(
            store,
            event_log,
            resolver,
            backend,
            workdir,
            config.engine_config(),
        ));
        engine.spawn_report_listener(reports);

        Ok(Self {
            engine,
            urls: UrlFactory::new(base_url, &config.api.path_prefix),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = ServerConfig::load(&temp_dir.path().join("absent.toml"), temp_dir.path().join("data")).unwrap();

        assert_eq!(config.storage.index_file, "index.redb");
        assert_eq!(config.engine.lock_timeout_ms, 5000);
        assert_eq!(config.engine.backend, BackendKind::Process);
        assert_eq!(config.api.path_prefix, "/api/v1");
        assert_eq!(config.work_path(), temp_dir.path().join("data").join("work"));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ruleflow.toml");
        std::fs::write(
            &path,
            "[engine]\nlock_timeout_ms = 0\nbackend = \"dry_run\"\n\n[api]\npath_prefix = \"v2/\"\n",
        )
        .unwrap();

        let config = ServerConfig::load(&path, temp_dir.path().to_path_buf()).unwrap();
        assert_eq!(config.engine_config().lock_timeout, Duration::ZERO);
        assert_eq!(config.engine.backend, BackendKind::DryRun);
        assert_eq!(config.api.path_prefix, "/v2");
        assert_eq!(config.storage.templates_dir, "templates");
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ruleflow.toml");
        std::fs::write(&path, "[engine\nlock_timeout_ms = ").unwrap();
        assert!(ServerConfig::load(&path, temp_dir.path().to_path_buf()).is_err());
    }
}
