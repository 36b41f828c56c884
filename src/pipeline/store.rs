//! Pipeline instance storage.
//!
//! [`PipelineStore`] is the seam the orchestrator writes through. Every
//! `update` runs its mutation against a copy of the instance while holding
//! that instance's lock and commits the copy only if the mutation succeeds,
//! so readers never observe a partial write. Updates for the same id are
//! serialized; updates for different ids never contend. A commit hook runs
//! after the commit while the lock is still held, so whatever it publishes
//! is ordered the same way as the commits themselves.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;

use super::models::{PipelineId, PipelineInstance, PipelineStatus};
use crate::errors::PipelineError;

/// A change applied atomically to one instance under its lock.
pub type Mutation<'a> =
    Box<dyn FnOnce(&mut PipelineInstance) -> Result<(), PipelineError> + Send + 'a>;

/// Called with the committed instance before its lock is released.
pub type CommitHook<'a> = Box<dyn FnOnce(&PipelineInstance) + Send + 'a>;

#[async_trait]
pub trait PipelineStore: Send + Sync {
    async fn create(&self, instance: PipelineInstance) -> Result<PipelineInstance, PipelineError>;

    async fn get(&self, id: PipelineId) -> Result<PipelineInstance, PipelineError>;

    /// Apply `mutation` atomically, run `on_commit` under the instance lock
    /// once the change is committed, and return the committed instance.
    /// `on_commit` is not called when the mutation or the commit fails.
    async fn update_then<'a>(
        &self,
        id: PipelineId,
        mutation: Mutation<'a>,
        on_commit: CommitHook<'a>,
    ) -> Result<PipelineInstance, PipelineError>;

    /// Apply `mutation` atomically and return the committed instance.
    async fn update<'a>(
        &self,
        id: PipelineId,
        mutation: Mutation<'a>,
    ) -> Result<PipelineInstance, PipelineError> {
        self.update_then(id, mutation, Box::new(|_| {})).await
    }

    /// Newest first, optionally filtered by status.
    async fn list(
        &self,
        status: Option<PipelineStatus>,
    ) -> Result<Vec<PipelineInstance>, PipelineError>;
}

/// In-memory store: one async mutex per instance inside a concurrent map.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<PipelineId, Arc<Mutex<PipelineInstance>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert an instance, failing if the id is taken.
    pub(crate) fn insert(&self, instance: PipelineInstance) -> Result<(), PipelineError> {
        use dashmap::mapref::entry::Entry;
        match self.entries.entry(instance.id) {
            Entry::Occupied(_) => Err(PipelineError::Validation(format!(
                "pipeline {} already exists",
                instance.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(instance)));
                Ok(())
            }
        }
    }

    fn entry(&self, id: PipelineId) -> Result<Arc<Mutex<PipelineInstance>>, PipelineError> {
        // Clone the Arc out so no map shard guard is held across an await.
        self.entries
            .get(&id)
            .map(|e| Arc::clone(e.value()))
            .ok_or(PipelineError::NotFound { id })
    }

    /// Run `mutation` on a copy under the instance lock, then `commit` the copy
    /// (still under the lock) before making it visible and calling `on_commit`.
    pub(crate) async fn apply<'a, C, Fut>(
        &self,
        id: PipelineId,
        mutation: Mutation<'a>,
        commit: C,
        on_commit: CommitHook<'a>,
    ) -> Result<PipelineInstance, PipelineError>
    where
        C: FnOnce(PipelineInstance) -> Fut,
        Fut: Future<Output = Result<(), PipelineError>>,
    {
        let entry = self.entry(id)?;
        let mut guard = entry.lock().await;
        let mut draft = guard.clone();
        mutation(&mut draft)?;
        commit(draft.clone()).await?;
        *guard = draft.clone();
        on_commit(&draft);
        Ok(draft)
    }
}

#[async_trait]
impl PipelineStore for MemoryStore {
    async fn create(&self, instance: PipelineInstance) -> Result<PipelineInstance, PipelineError> {
        self.insert(instance.clone())?;
        Ok(instance)
    }

    async fn get(&self, id: PipelineId) -> Result<PipelineInstance, PipelineError> {
        let entry = self.entry(id)?;
        let guard = entry.lock().await;
        Ok(guard.clone())
    }

    async fn update_then<'a>(
        &self,
        id: PipelineId,
        mutation: Mutation<'a>,
        on_commit: CommitHook<'a>,
    ) -> Result<PipelineInstance, PipelineError> {
        self.apply(id, mutation, |_| async { Ok(()) }, on_commit).await
    }

    async fn list(
        &self,
        status: Option<PipelineStatus>,
    ) -> Result<Vec<PipelineInstance>, PipelineError> {
        let entries: Vec<_> = self.entries.iter().map(|e| Arc::clone(e.value())).collect();
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let instance = entry.lock().await.clone();
            if status.is_none_or(|s| instance.status == s) {
                out.push(instance);
            }
        }
        sort_newest_first(&mut out);
        Ok(out)
    }
}

pub(crate) fn sort_newest_first(instances: &mut [PipelineInstance]) {
    instances.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::PhaseCatalog;
    use crate::pipeline::models::PipelineConfig;
    use std::time::Duration;

    fn instance(niche: &str) -> PipelineInstance {
        PipelineInstance::new(niche, None, PipelineConfig::default(), &PhaseCatalog::default())
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = MemoryStore::new();
        let created = store.create(instance("Keto Diet")).await.unwrap();
        let fetched = store.get(created.id).await.unwrap();
        assert_eq!(fetched, created);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_create_rejected() {
        let store = MemoryStore::new();
        let inst = instance("Keto Diet");
        store.create(inst.clone()).await.unwrap();
        assert!(matches!(
            store.create(inst).await,
            Err(PipelineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_get_unknown_is_not_found() {
        let store = MemoryStore::new();
        let id = PipelineId::new();
        assert!(matches!(
            store.get(id).await,
            Err(PipelineError::NotFound { id: missing }) if missing == id
        ));
    }

    #[tokio::test]
    async fn test_failed_mutation_leaves_no_partial_write() {
        let store = MemoryStore::new();
        let created = store.create(instance("Keto Diet")).await.unwrap();

        let result = store
            .update(
                created.id,
                Box::new(|inst| {
                    inst.niche = "half-written".to_string();
                    inst.status = PipelineStatus::Running;
                    Err(PipelineError::Validation("nope".into()))
                }),
            )
            .await;
        assert!(result.is_err());
        assert_eq!(store.get(created.id).await.unwrap(), created);
    }

    #[tokio::test]
    async fn test_commit_hook_sees_committed_instance_only() {
        let store = MemoryStore::new();
        let created = store.create(instance("Keto Diet")).await.unwrap();
        let seen = std::sync::Mutex::new(Vec::new());

        store
            .update_then(
                created.id,
                Box::new(|inst| {
                    inst.topic = Some("Breakfast".into());
                    Ok(())
                }),
                Box::new(|committed| seen.lock().unwrap().push(committed.topic.clone())),
            )
            .await
            .unwrap();
        let failed = store
            .update_then(
                created.id,
                Box::new(|_| Err(PipelineError::Validation("nope".into()))),
                Box::new(|committed| seen.lock().unwrap().push(committed.topic.clone())),
            )
            .await;
        assert!(failed.is_err());
        assert_eq!(*seen.lock().unwrap(), vec![Some("Breakfast".to_string())]);
    }

    #[tokio::test]
    async fn test_update_returns_committed_instance() {
        let store = MemoryStore::new();
        let created = store.create(instance("Keto Diet")).await.unwrap();
        let updated = store
            .update(
                created.id,
                Box::new(|inst| {
                    inst.topic = Some("Breakfast".into());
                    Ok(())
                }),
            )
            .await
            .unwrap();
        assert_eq!(updated.topic.as_deref(), Some("Breakfast"));
        assert_eq!(store.get(created.id).await.unwrap().topic.as_deref(), Some("Breakfast"));
    }

    #[tokio::test]
    async fn test_list_filters_and_orders_newest_first() {
        let store = MemoryStore::new();
        let first = store.create(instance("First")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        let second = store.create(instance("Second")).await.unwrap();
        store
            .update(
                first.id,
                Box::new(|inst| {
                    inst.status = PipelineStatus::Paused;
                    Ok(())
                }),
            )
            .await
            .unwrap();

        let all = store.list(None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, second.id);

        let paused = store.list(Some(PipelineStatus::Paused)).await.unwrap();
        assert_eq!(paused.len(), 1);
        assert_eq!(paused[0].id, first.id);
    }

    #[tokio::test]
    async fn test_same_id_updates_are_serialized() {
        let store = Arc::new(MemoryStore::new());
        let created = store.create(instance("Counter")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .update(
                        created.id,
                        Box::new(|inst| {
                            let n: u32 = inst.topic.as_deref().unwrap_or("0").parse().unwrap_or(0);
                            inst.topic = Some((n + 1).to_string());
                            Ok(())
                        }),
                    )
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.get(created.id).await.unwrap().topic.as_deref(), Some("50"));
    }

    #[tokio::test]
    async fn test_different_ids_do_not_block_each_other() {
        let store = Arc::new(MemoryStore::new());
        let a = store.create(instance("A")).await.unwrap();
        let b = store.create(instance("B")).await.unwrap();

        // Hold A's lock while updating B.
        let entry = store.entry(a.id).unwrap();
        let _held = entry.lock().await;
        let updated = tokio::time::timeout(
            Duration::from_secs(1),
            store.update(
                b.id,
                Box::new(|inst| {
                    inst.topic = Some("done".into());
                    Ok(())
                }),
            ),
        )
        .await
        .expect("update of B must not wait on A")
        .unwrap();
        assert_eq!(updated.topic.as_deref(), Some("done"));
    }
}
