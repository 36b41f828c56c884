use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};

use super::models::{PipelineId, PipelineInstance, PipelineStatus};
use super::store::{CommitHook, MemoryStore, Mutation, PipelineStore};
use crate::errors::PipelineError;

/// Async-safe handle to the pipeline database.
///
/// Wraps `PipelineDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, keeping synchronous SQLite I/O
/// off the async worker threads.
///
/// There is one connection, so writes for different pipelines queue behind
/// each other for the duration of a single statement. Pipeline locks stay
/// independent: a slow write delays other pipelines' commits but never
/// serializes their commands or their executor calls.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<PipelineDb>>,
}

impl DbHandle {
    pub fn new(db: PipelineDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&PipelineDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

/// One row per pipeline instance; the whole instance, phase records
/// included, is stored as JSON in `body`. Status and timestamps are
/// duplicated into columns for filtering.
pub struct PipelineDb {
    conn: Connection,
}

impl PipelineDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.run_migrations().context("Failed to run migrations")?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.run_migrations().context("Failed to run migrations")?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS pipelines (
                    id TEXT PRIMARY KEY,
                    status TEXT NOT NULL,
                    niche TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    body TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_pipelines_status ON pipelines(status);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    pub fn insert_pipeline(&self, instance: &PipelineInstance) -> Result<()> {
        let body = serde_json::to_string(instance).context("Failed to serialize pipeline")?;
        self.conn
            .execute(
                "INSERT INTO pipelines (id, status, niche, created_at, updated_at, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    instance.id.to_string(),
                    instance.status.as_str(),
                    instance.niche,
                    instance.created_at.to_rfc3339(),
                    instance.last_updated.to_rfc3339(),
                    body
                ],
            )
            .context("Failed to insert pipeline")?;
        Ok(())
    }

    pub fn save_pipeline(&self, instance: &PipelineInstance) -> Result<()> {
        let body = serde_json::to_string(instance).context("Failed to serialize pipeline")?;
        let changed = self
            .conn
            .execute(
                "UPDATE pipelines SET status = ?2, updated_at = ?3, body = ?4 WHERE id = ?1",
                params![
                    instance.id.to_string(),
                    instance.status.as_str(),
                    instance.last_updated.to_rfc3339(),
                    body
                ],
            )
            .context("Failed to update pipeline")?;
        if changed == 0 {
            anyhow::bail!("Pipeline {} not found in database", instance.id);
        }
        Ok(())
    }

    pub fn get_pipeline(&self, id: PipelineId) -> Result<Option<PipelineInstance>> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM pipelines WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query pipeline")?;
        body.map(|b| serde_json::from_str(&b).context("Corrupt pipeline body"))
            .transpose()
    }

    pub fn list_pipelines(&self, status: Option<PipelineStatus>) -> Result<Vec<PipelineInstance>> {
        let mut stmt = self.conn.prepare(
            "SELECT body FROM pipelines
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![status.map(|s| s.as_str())], |row| {
            row.get::<_, String>(0)
        })?;
        let mut out = Vec::new();
        for body in rows {
            let body = body?;
            out.push(serde_json::from_str(&body).context("Corrupt pipeline body")?);
        }
        Ok(out)
    }
}

/// Durable store: the in-memory lock map as cache, written through to SQLite.
///
/// A mutation is persisted while the instance lock is still held, so writes
/// for one instance reach the database in the order they were committed.
pub struct SqliteStore {
    cache: MemoryStore,
    db: DbHandle,
}

impl SqliteStore {
    /// Open the database and load every stored pipeline into the cache.
    pub async fn open(db: PipelineDb) -> Result<Self> {
        let db = DbHandle::new(db);
        let existing = db.call(|db| db.list_pipelines(None)).await?;
        let cache = MemoryStore::new();
        for instance in existing {
            cache
                .insert(instance)
                .map_err(|e| anyhow::anyhow!("Failed to load pipeline: {}", e))?;
        }
        tracing::info!(pipelines = cache.len(), "store.loaded");
        Ok(Self { cache, db })
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }
}

#[async_trait]
impl PipelineStore for SqliteStore {
    async fn create(&self, instance: PipelineInstance) -> Result<PipelineInstance, PipelineError> {
        let row = instance.clone();
        self.db
            .call(move |db| db.insert_pipeline(&row))
            .await
            .map_err(PipelineError::Store)?;
        self.cache.create(instance).await
    }

    async fn get(&self, id: PipelineId) -> Result<PipelineInstance, PipelineError> {
        self.cache.get(id).await
    }

    async fn update_then<'a>(
        &self,
        id: PipelineId,
        mutation: Mutation<'a>,
        on_commit: CommitHook<'a>,
    ) -> Result<PipelineInstance, PipelineError> {
        let db = self.db.clone();
        self.cache
            .apply(
                id,
                mutation,
                move |draft| async move {
                    db.call(move |db| db.save_pipeline(&draft))
                        .await
                        .map_err(PipelineError::Store)
                },
                on_commit,
            )
            .await
    }

    async fn list(
        &self,
        status: Option<PipelineStatus>,
    ) -> Result<Vec<PipelineInstance>, PipelineError> {
        self.cache.list(status).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::PhaseCatalog;
    use crate::pipeline::models::{PhaseStatus, PipelineConfig};

    fn instance(niche: &str) -> PipelineInstance {
        PipelineInstance::new(niche, Some("topic".into()), PipelineConfig::default(), &PhaseCatalog::default())
    }

    #[test]
    fn test_create_database_and_run_migrations() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let count: i64 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='pipelines'",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(count, 1);
        Ok(())
    }

    #[test]
    fn test_insert_get_and_save_pipeline() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let mut inst = instance("Keto Diet");
        db.insert_pipeline(&inst)?;
        assert_eq!(db.get_pipeline(inst.id)?, Some(inst.clone()));

        inst.status = PipelineStatus::Running;
        inst.phase_records[0].status = PhaseStatus::Running;
        db.save_pipeline(&inst)?;
        let loaded = db.get_pipeline(inst.id)?.unwrap();
        assert_eq!(loaded.status, PipelineStatus::Running);
        assert_eq!(loaded.phase_records[0].status, PhaseStatus::Running);
        Ok(())
    }

    #[test]
    fn test_save_unknown_pipeline_fails() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        assert!(db.save_pipeline(&instance("Ghost")).is_err());
        assert!(db.get_pipeline(PipelineId::new())?.is_none());
        Ok(())
    }

    #[test]
    fn test_list_pipelines_by_status() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let a = instance("A");
        let mut b = instance("B");
        b.status = PipelineStatus::Paused;
        db.insert_pipeline(&a)?;
        db.insert_pipeline(&b)?;
        assert_eq!(db.list_pipelines(None)?.len(), 2);
        let paused = db.list_pipelines(Some(PipelineStatus::Paused))?;
        assert_eq!(paused.len(), 1);
        assert_eq!(paused[0].niche, "B");
        Ok(())
    }

    #[tokio::test]
    async fn test_sqlite_store_survives_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("pipelines.db");

        let id = {
            let store = SqliteStore::open(PipelineDb::new(&path)?).await?;
            let created = store.create(instance("Keto Diet")).await?;
            store
                .update(
                    created.id,
                    Box::new(|inst| {
                        inst.topic = Some("Meal prep".into());
                        Ok(())
                    }),
                )
                .await?;
            created.id
        };

        let reopened = SqliteStore::open(PipelineDb::new(&path)?).await?;
        let loaded = reopened.get(id).await?;
        assert_eq!(loaded.niche, "Keto Diet");
        assert_eq!(loaded.topic.as_deref(), Some("Meal prep"));
        assert_eq!(reopened.list(None).await?.len(), 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_for_different_ids_all_persist() -> Result<()> {
        let store = Arc::new(SqliteStore::open(PipelineDb::new_in_memory()?).await?);
        let mut ids = Vec::new();
        for i in 0..8 {
            ids.push(store.create(instance(&format!("Niche {}", i))).await?.id);
        }

        let mut handles = Vec::new();
        for id in ids.clone() {
            for n in 0..10 {
                let store = Arc::clone(&store);
                handles.push(tokio::spawn(async move {
                    store
                        .update(
                            id,
                            Box::new(move |inst| {
                                inst.topic = Some(format!("write {}", n));
                                inst.touch();
                                Ok(())
                            }),
                        )
                        .await
                }));
            }
        }
        for h in handles {
            h.await??;
        }

        for id in ids {
            let row = store.db().call(move |db| db.get_pipeline(id)).await?.unwrap();
            assert_eq!(row.version, 10);
            assert_eq!(row, store.get(id).await?);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_mutation_is_not_persisted() -> Result<()> {
        let store = SqliteStore::open(PipelineDb::new_in_memory()?).await?;
        let created = store.create(instance("Keto Diet")).await?;
        let result = store
            .update(
                created.id,
                Box::new(|inst| {
                    inst.niche = "changed".into();
                    Err(PipelineError::Validation("rejected".into()))
                }),
            )
            .await;
        assert!(result.is_err());
        let row = store.db().call(move |db| db.get_pipeline(created.id)).await?;
        assert_eq!(row.unwrap().niche, "Keto Diet");
        Ok(())
    }
}
