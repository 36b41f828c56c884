//! Configuration for the Zeule orchestrator.
//!
//! Settings are read from `zeule.toml` (absent file → defaults), then
//! environment variables, then CLI flags, each layer overriding the last.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3141
//! db_path = ".zeule/pipelines.db"
//! memory = false
//! dev_mode = false
//!
//! [executor]
//! kind = "http"
//! url = "http://localhost:8000/phases"
//! timeout_secs = 600
//! max_attempts = 3
//! min_backoff_ms = 1000
//! max_backoff_ms = 30000
//!
//! [[phases]]
//! sequence_index = 0
//! name = "Trend Discovery"
//! requires_approval = true
//! enabled = true
//! ```
//!
//! Environment overrides: `ZEULE_HOST`, `ZEULE_PORT`, `ZEULE_DB_PATH`,
//! `ZEULE_EXECUTOR_KIND`, `ZEULE_EXECUTOR_URL`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::phase::{PhaseCatalog, PhaseDefinition};
use crate::pipeline::executor::{
    HttpExecutor, PhaseExecutor, RetryPolicy, RetryingExecutor, StubExecutor,
};

pub const DEFAULT_CONFIG_FILE: &str = "zeule.toml";

/// Which collaborator runs the phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    /// Local deterministic stand-in
    #[default]
    Stub,
    /// Remote phase service over HTTP
    Http,
}

impl std::fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutorKind::Stub => write!(f, "stub"),
            ExecutorKind::Http => write!(f, "http"),
        }
    }
}

impl std::str::FromStr for ExecutorKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stub" => Ok(ExecutorKind::Stub),
            "http" => Ok(ExecutorKind::Http),
            _ => anyhow::bail!("Invalid executor kind '{}'. Valid values: stub, http", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// SQLite file for durable pipelines
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Keep pipelines in memory only; `db_path` is ignored
    #[serde(default)]
    pub memory: bool,
    /// Permissive CORS for a locally served dashboard
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3141
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".zeule/pipelines.db")
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db_path: default_db_path(),
            memory: false,
            dev_mode: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutorSection {
    #[serde(default)]
    pub kind: ExecutorKind,
    /// Phase service endpoint, required when `kind = "http"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Hard ceiling on one phase dispatch, retries included
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_min_backoff_ms")]
    pub min_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_max_attempts() -> u32 {
    3
}

fn default_min_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            kind: ExecutorKind::default(),
            url: None,
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            min_backoff_ms: default_min_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// The complete zeule.toml configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ZeuleConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub executor: ExecutorSection,
    /// Phase catalog; empty means the built-in eight-phase catalog
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub phases: Vec<PhaseDefinition>,
}

impl ZeuleConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse zeule.toml")
    }

    /// Returns default configuration if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// File, then environment overrides.
    pub fn resolve(path: &Path) -> Result<Self> {
        let mut config = Self::load_or_default(path)?;
        config.apply_env()?;
        Ok(config)
    }

    /// Defaults with the built-in catalog written out, for `config init`.
    pub fn template() -> Self {
        Self {
            phases: PhaseCatalog::default_catalog().phases().to_vec(),
            ..Self::default()
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize zeule.toml")
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, self.to_toml()?)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `ZEULE_*` environment variables on top of the file settings.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(host) = std::env::var("ZEULE_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("ZEULE_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid ZEULE_PORT '{}'", port))?;
        }
        if let Ok(path) = std::env::var("ZEULE_DB_PATH") {
            self.server.db_path = PathBuf::from(path);
        }
        if let Ok(kind) = std::env::var("ZEULE_EXECUTOR_KIND") {
            self.executor.kind = kind.parse()?;
        }
        if let Ok(url) = std::env::var("ZEULE_EXECUTOR_URL") {
            self.executor.url = Some(url);
        }
        Ok(())
    }

    /// The configured catalog, or the built-in one when none is configured.
    pub fn catalog(&self) -> Result<PhaseCatalog> {
        if self.phases.is_empty() {
            return Ok(PhaseCatalog::default_catalog());
        }
        PhaseCatalog::new(self.phases.clone()).context("Invalid [[phases]] in zeule.toml")
    }

    pub fn phase_timeout(&self) -> Duration {
        Duration::from_secs(self.executor.timeout_secs.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.executor.max_attempts.max(1),
            min_backoff: Duration::from_millis(self.executor.min_backoff_ms),
            max_backoff: Duration::from_millis(self.executor.max_backoff_ms),
        }
    }

    /// Timeout for one HTTP attempt: the dispatch deadline, less the retry
    /// backoff, split across the attempts. Never below one second.
    pub fn request_timeout(&self) -> Duration {
        let policy = self.retry_policy();
        let backoff: Duration = (1..policy.max_attempts).map(|n| policy.backoff(n)).sum();
        let per_attempt = self.phase_timeout().saturating_sub(backoff) / policy.max_attempts;
        per_attempt.max(Duration::from_secs(1))
    }

    pub fn build_executor(&self) -> Result<Arc<dyn PhaseExecutor>> {
        match self.executor.kind {
            ExecutorKind::Stub => Ok(Arc::new(StubExecutor::new())),
            ExecutorKind::Http => {
                let url = self
                    .executor
                    .url
                    .as_deref()
                    .filter(|u| !u.trim().is_empty())
                    .context("executor.url is required when executor.kind = \"http\"")?;
                let http = HttpExecutor::new(url, self.request_timeout())?;
                Ok(Arc::new(RetryingExecutor::new(http, self.retry_policy())))
            }
        }
    }

    /// Non-fatal problems worth reporting at startup.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.executor.min_backoff_ms > self.executor.max_backoff_ms {
            warnings.push(format!(
                "executor.min_backoff_ms ({}) exceeds max_backoff_ms ({})",
                self.executor.min_backoff_ms, self.executor.max_backoff_ms
            ));
        }
        if self.executor.kind == ExecutorKind::Stub && self.executor.url.is_some() {
            warnings.push("executor.url is set but executor.kind is \"stub\"".to_string());
        }
        if !self.phases.is_empty() && self.phases.iter().all(|p| !p.enabled) {
            warnings.push("every phase is disabled; pipelines complete without work".to_string());
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ENV_VARS: [&str; 5] = [
        "ZEULE_HOST",
        "ZEULE_PORT",
        "ZEULE_DB_PATH",
        "ZEULE_EXECUTOR_KIND",
        "ZEULE_EXECUTOR_URL",
    ];

    fn clear_env() {
        for var in ENV_VARS {
            unsafe { std::env::remove_var(var) };
        }
    }

    #[test]
    fn test_defaults() {
        let config = ZeuleConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 3141);
        assert_eq!(config.server.db_path, PathBuf::from(".zeule/pipelines.db"));
        assert!(!config.server.memory);
        assert_eq!(config.executor.kind, ExecutorKind::Stub);
        assert_eq!(config.executor.timeout_secs, 600);
        assert_eq!(config.catalog().unwrap().len(), 8);
    }

    #[test]
    fn test_parse_full_file() {
        let config = ZeuleConfig::parse(
            r#"
            [server]
            port = 8080
            dev_mode = true

            [executor]
            kind = "http"
            url = "http://localhost:8000/phases"
            timeout_secs = 30
            max_attempts = 5

            [[phases]]
            sequence_index = 10
            name = "Draft"
            requires_approval = false

            [[phases]]
            sequence_index = 5
            name = "Research"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "127.0.0.1");
        assert!(config.server.dev_mode);
        assert_eq!(config.executor.kind, ExecutorKind::Http);
        assert_eq!(config.phase_timeout(), Duration::from_secs(30));
        assert_eq!(config.retry_policy().max_attempts, 5);

        let catalog = config.catalog().unwrap();
        assert_eq!(catalog.phases()[0].name, "Research");
        assert!(catalog.phases()[0].requires_approval);
        assert!(!catalog.phases()[1].requires_approval);
    }

    #[test]
    fn test_invalid_catalog_is_an_error() {
        let config = ZeuleConfig::parse(
            r#"
            [[phases]]
            sequence_index = 0
            name = "Same"

            [[phases]]
            sequence_index = 1
            name = "Same"
            "#,
        )
        .unwrap();
        assert!(config.catalog().is_err());
    }

    #[test]
    fn test_unknown_executor_kind_fails_to_parse() {
        assert!(ZeuleConfig::parse("[executor]\nkind = \"carrier-pigeon\"\n").is_err());
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = tempdir().unwrap();
        let config = ZeuleConfig::load_or_default(&dir.path().join("zeule.toml")).unwrap();
        assert_eq!(config, ZeuleConfig::default());
    }

    #[test]
    fn test_template_round_trips_through_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("zeule.toml");
        let template = ZeuleConfig::template();
        template.save(&path).unwrap();

        let loaded = ZeuleConfig::load(&path).unwrap();
        assert_eq!(loaded, template);
        assert_eq!(loaded.phases.len(), 8);
        assert_eq!(loaded.catalog().unwrap(), PhaseCatalog::default_catalog());
    }

    #[test]
    fn test_env_overrides_file() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            std::env::set_var("ZEULE_PORT", "9000");
            std::env::set_var("ZEULE_EXECUTOR_KIND", "HTTP");
            std::env::set_var("ZEULE_EXECUTOR_URL", "http://phases.local/run");
        }

        let dir = tempdir().unwrap();
        let path = dir.path().join("zeule.toml");
        std::fs::write(&path, "[server]\nport = 4000\nhost = \"0.0.0.0\"\n").unwrap();
        let config = ZeuleConfig::resolve(&path);
        clear_env();

        let config = config.unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.executor.kind, ExecutorKind::Http);
        assert_eq!(config.executor.url.as_deref(), Some("http://phases.local/run"));
    }

    #[test]
    fn test_invalid_env_port_is_an_error() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe { std::env::set_var("ZEULE_PORT", "not-a-port") };
        let result = ZeuleConfig::default().apply_env();
        clear_env();
        assert!(result.is_err());
    }

    #[test]
    fn test_http_executor_requires_url() {
        let mut config = ZeuleConfig::default();
        config.executor.kind = ExecutorKind::Http;
        assert!(config.build_executor().is_err());

        config.executor.url = Some("http://localhost:8000/phases".into());
        assert!(config.build_executor().is_ok());
    }

    #[test]
    fn test_request_timeout_leaves_room_for_every_attempt() {
        let mut config = ZeuleConfig::default();
        assert_eq!(config.request_timeout(), Duration::from_secs(199));

        config.executor.timeout_secs = 30;
        config.executor.max_attempts = 5;
        assert_eq!(config.request_timeout(), Duration::from_secs(3));
        let policy = config.retry_policy();
        let worst_case = config.request_timeout() * policy.max_attempts
            + (1..policy.max_attempts).map(|n| policy.backoff(n)).sum::<Duration>();
        assert!(worst_case <= config.phase_timeout());

        config.executor.timeout_secs = 1;
        assert_eq!(config.request_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_validate_warnings() {
        let mut config = ZeuleConfig::default();
        assert!(config.validate().is_empty());
        config.executor.min_backoff_ms = 5_000;
        config.executor.max_backoff_ms = 10;
        config.executor.url = Some("http://unused".into());
        assert_eq!(config.validate().len(), 2);
    }

    #[test]
    fn test_executor_kind_from_str() {
        assert_eq!("stub".parse::<ExecutorKind>().unwrap(), ExecutorKind::Stub);
        assert_eq!("Http".parse::<ExecutorKind>().unwrap(), ExecutorKind::Http);
        assert!("grpc".parse::<ExecutorKind>().is_err());
        assert_eq!(ExecutorKind::Http.to_string(), "http");
    }
}
