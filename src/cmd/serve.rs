//! Gateway server command (`zeule serve`).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use zeule::config::ZeuleConfig;
use zeule::pipeline::db::{PipelineDb, SqliteStore};
use zeule::pipeline::orchestrator::Orchestrator;
use zeule::pipeline::store::{MemoryStore, PipelineStore};
use zeule::server::{ServerConfig, start_server};

/// CLI overrides for the `[server]` section.
pub struct ServeArgs {
    pub port: Option<u16>,
    pub host: Option<String>,
    pub db_path: Option<PathBuf>,
    pub memory: bool,
    pub dev: bool,
}

pub async fn cmd_serve(config_path: &Path, args: ServeArgs) -> Result<()> {
    let mut config = ZeuleConfig::resolve(config_path)?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(db_path) = args.db_path {
        config.server.db_path = db_path;
    }
    config.server.memory |= args.memory;
    config.server.dev_mode |= args.dev;

    for warning in config.validate() {
        tracing::warn!(%warning, "config.warning");
    }

    let catalog = config.catalog()?;
    let executor = config.build_executor()?;
    let store = open_store(&config).await?;
    tracing::info!(
        phases = catalog.len(),
        executor = %config.executor.kind,
        memory = config.server.memory,
        "orchestrator.ready"
    );

    let orchestrator = Orchestrator::new(store, executor, catalog, config.phase_timeout());
    let recovered = orchestrator.recover_interrupted().await?;
    if recovered > 0 {
        println!("Resumed {} interrupted phase(s).", recovered);
    }
    #[cfg(unix)]
    spawn_catalog_reloader(config_path.to_path_buf(), orchestrator.clone())?;

    start_server(
        ServerConfig {
            host: config.server.host.clone(),
            port: config.server.port,
            dev_mode: config.server.dev_mode,
        },
        orchestrator,
    )
    .await
}

async fn open_store(config: &ZeuleConfig) -> Result<Arc<dyn PipelineStore>> {
    if config.server.memory {
        return Ok(Arc::new(MemoryStore::new()));
    }
    let path = &config.server.db_path;
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = PipelineDb::new(path)
        .with_context(|| format!("Failed to open pipeline database {}", path.display()))?;
    Ok(Arc::new(SqliteStore::open(db).await?))
}

/// Re-read the `[[phases]]` catalog from the config file on every SIGHUP.
#[cfg(unix)]
fn spawn_catalog_reloader(config_path: PathBuf, orchestrator: Orchestrator) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            if let Err(e) = reload_catalog_from(&config_path, &orchestrator) {
                tracing::error!(error = %e, path = %config_path.display(), "catalog.reload_failed");
            }
        }
    });
    Ok(())
}

/// Load the catalog from `config_path` and swap it in. An invalid file
/// leaves the running catalog untouched.
fn reload_catalog_from(config_path: &Path, orchestrator: &Orchestrator) -> Result<usize> {
    let catalog = ZeuleConfig::resolve(config_path)?.catalog()?;
    let phases = catalog.len();
    orchestrator.reload_catalog(catalog);
    Ok(phases)
}
