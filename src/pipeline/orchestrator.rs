//! The pipeline state machine and phase dispatch scheduler.
//!
//! Every command and every phase result is applied through
//! [`PipelineStore::update_then`], which holds that pipeline's lock for the
//! duration of the decision. Notifications are published from its commit
//! hook, so each pipeline's events arrive in commit order and carry a
//! strictly increasing `version`. Executor calls happen outside the lock on
//! tracked tasks, so `stop`/`approve`/`edit_output` stay responsive while a
//! phase runs. The record status `running` is the dispatch marker: a phase is
//! only dispatched on the `pending -> running` edge, which rules out double
//! dispatch.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::events::{EVENT_CHANNEL_CAPACITY, PipelineEvent, publish};
use super::executor::{
    PhaseExecutor, PhaseOutput, PhaseRequest, RetryPolicy, execute_with_deadline,
};
use super::models::{
    Command, PhaseStatus, PipelineConfig, PipelineId, PipelineInstance, PipelineStats,
    PipelineStatus, ReviewDecision,
};
use super::state::{check_invariants, set_phase_status, set_pipeline_status};
use super::store::PipelineStore;
use crate::errors::{ExecutorError, PipelineError};
use crate::phase::{PhaseCatalog, PhaseDefinition};

/// Default hard ceiling on a single phase dispatch.
pub const DEFAULT_PHASE_TIMEOUT: Duration = Duration::from_secs(600);

/// Retries for saving a phase result when the store fails.
const SAVE_RETRY: RetryPolicy = RetryPolicy {
    max_attempts: 5,
    min_backoff: Duration::from_millis(50),
    max_backoff: Duration::from_secs(2),
};

/// A phase dispatch decided under the instance lock and launched after it is released.
#[derive(Debug)]
struct Dispatch {
    request: PhaseRequest,
    /// Approval requirement captured at dispatch; catalog reloads do not affect it
    requires_approval: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminal {
    Completed,
    Failed,
}

/// Side effects collected while a mutation runs, released only after commit.
#[derive(Debug, Default)]
struct Effects {
    dispatch: Option<Dispatch>,
    events: Vec<PipelineEvent>,
    terminal: Option<Terminal>,
    /// Nothing changed; skip the timestamp bump and the update notification
    unchanged: bool,
}

struct Inner {
    store: Arc<dyn PipelineStore>,
    executor: Arc<dyn PhaseExecutor>,
    catalog: RwLock<Arc<PhaseCatalog>>,
    events: broadcast::Sender<PipelineEvent>,
    /// Number of dispatches launched and not yet applied
    in_flight: watch::Sender<usize>,
    phase_timeout: Duration,
}

/// Decrements the in-flight count when a dispatch task ends, even by panic.
struct InFlightGuard(Arc<Inner>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.in_flight.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Cheaply cloneable handle to the orchestrator.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        executor: Arc<dyn PhaseExecutor>,
        catalog: PhaseCatalog,
        phase_timeout: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (in_flight, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                store,
                executor,
                catalog: RwLock::new(Arc::new(catalog)),
                events,
                in_flight,
                phase_timeout,
            }),
        }
    }

    // ── Notifications ─────────────────────────────────────────────────

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.inner.events.subscribe()
    }

    pub fn event_sender(&self) -> broadcast::Sender<PipelineEvent> {
        self.inner.events.clone()
    }

    // ── Phase catalog ─────────────────────────────────────────────────

    /// Snapshot of the current catalog.
    pub fn catalog(&self) -> Arc<PhaseCatalog> {
        let guard = self.inner.catalog.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Swap in a new catalog. Phases already dispatched keep the definition
    /// they were dispatched with.
    pub fn reload_catalog(&self, catalog: PhaseCatalog) {
        let mut guard = self.inner.catalog.write().unwrap_or_else(|e| e.into_inner());
        info!(phases = catalog.len(), "catalog.reloaded");
        *guard = Arc::new(catalog);
    }

    /// Change one phase's approval/enabled flags by deriving a new catalog.
    pub fn set_phase_toggle(
        &self,
        phase_index: usize,
        requires_approval: Option<bool>,
        enabled: Option<bool>,
    ) -> Result<Arc<PhaseCatalog>, PipelineError> {
        let mut guard = self.inner.catalog.write().unwrap_or_else(|e| e.into_inner());
        let next = Arc::new(guard.with_toggle(phase_index, requires_approval, enabled)?);
        info!(
            phase = phase_index,
            requires_approval = ?requires_approval,
            enabled = ?enabled,
            "catalog.toggled"
        );
        *guard = Arc::clone(&next);
        Ok(next)
    }

    // ── Commands ──────────────────────────────────────────────────────

    /// Single entry point for the command gateway.
    pub async fn apply(&self, command: Command) -> Result<PipelineInstance, PipelineError> {
        debug!(command = command.name(), "command.received");
        match command {
            Command::Create {
                niche,
                topic,
                auto_start,
                config,
            } => self.create(&niche, topic, auto_start, config).await,
            Command::Start { id } => self.start(id).await,
            Command::Stop { id } => self.stop(id).await,
            Command::Approve { id, notes } => self.approve(id, notes).await,
            Command::Reject { id, notes } => self.reject(id, notes).await,
            Command::EditOutput {
                id,
                phase_index,
                output,
            } => self.edit_output(id, phase_index, output).await,
        }
    }

    /// Create a pipeline; with `auto_start` the first start is applied before
    /// the instance is stored, so no observer ever sees it `pending`.
    pub async fn create(
        &self,
        niche: &str,
        topic: Option<String>,
        auto_start: bool,
        config: PipelineConfig,
    ) -> Result<PipelineInstance, PipelineError> {
        let niche = niche.trim();
        if niche.is_empty() {
            return Err(PipelineError::Validation("niche is required".to_string()));
        }
        let catalog = self.catalog();
        if let Some(index) = config
            .approval_overrides
            .keys()
            .find(|&&i| i >= catalog.len())
        {
            return Err(PipelineError::Validation(format!(
                "approval override for phase {} but the catalog has {} phases",
                index,
                catalog.len()
            )));
        }
        let topic = topic
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        let mut instance = PipelineInstance::new(niche, topic, config, &catalog);
        let mut fx = Effects::default();
        if auto_start {
            start_in_place(&mut instance, &catalog, &mut fx)?;
        }
        check_invariants(&instance).map_err(|message| PipelineError::Invariant {
            id: instance.id,
            message,
        })?;

        let created = self.inner.store.create(instance).await?;
        info!(
            pipeline_id = %created.id,
            niche = %created.niche,
            auto_start,
            "pipeline.created"
        );
        publish(
            &self.inner.events,
            PipelineEvent::PipelineCreated {
                pipeline: created.clone(),
            },
        );
        self.publish_effects(&created, &mut fx);
        if let Some(dispatch) = fx.dispatch {
            self.launch(dispatch);
        }
        Ok(created)
    }

    /// Start or resume. A no-op on a running pipeline.
    pub async fn start(&self, id: PipelineId) -> Result<PipelineInstance, PipelineError> {
        let instance = self
            .mutate(id, |inst, catalog, fx| {
                if inst.status.is_terminal() {
                    return Err(PipelineError::invalid_state(
                        inst.id,
                        format!("cannot start a {} pipeline", inst.status),
                    ));
                }
                if inst.status == PipelineStatus::Running {
                    fx.unchanged = true;
                    return Ok(());
                }
                start_in_place(inst, catalog, fx)
            })
            .await?;
        info!(
            pipeline_id = %id,
            current_phase = instance.current_phase_index,
            status = %instance.status,
            "pipeline.start"
        );
        Ok(instance)
    }

    /// Soft stop: pause without cancelling a phase that is already executing.
    pub async fn stop(&self, id: PipelineId) -> Result<PipelineInstance, PipelineError> {
        let instance = self
            .mutate(id, |inst, _, _| {
                if inst.status != PipelineStatus::Running {
                    return Err(PipelineError::invalid_state(
                        inst.id,
                        format!("cannot stop a {} pipeline", inst.status),
                    ));
                }
                set_pipeline_status(inst, PipelineStatus::Paused)
            })
            .await?;
        info!(
            pipeline_id = %id,
            current_phase = instance.current_phase_index,
            "pipeline.stopped"
        );
        Ok(instance)
    }

    pub async fn approve(
        &self,
        id: PipelineId,
        notes: Option<String>,
    ) -> Result<PipelineInstance, PipelineError> {
        let instance = self
            .mutate(id, move |inst, catalog, fx| {
                let index = require_waiting_approval(inst)?;
                set_phase_status(inst, index, PhaseStatus::Completed)?;
                let now = Utc::now();
                let record = &mut inst.phase_records[index];
                record.approved_at = Some(now);
                record.completed_at = Some(now);
                record.resolve_gate(ReviewDecision::Approved, notes, now);
                fx.events.push(PipelineEvent::PhaseCompleted {
                    pipeline_id: inst.id,
                    phase_index: index,
                    duration_millis: record.duration_millis.unwrap_or_default(),
                });
                inst.current_phase_index = index + 1;
                if inst.status == PipelineStatus::Running {
                    advance(inst, catalog, fx)?;
                }
                Ok(())
            })
            .await?;
        info!(pipeline_id = %id, status = %instance.status, "phase.approved");
        Ok(instance)
    }

    /// Discard the waiting output and pause; the next start re-runs the same phase.
    pub async fn reject(
        &self,
        id: PipelineId,
        notes: Option<String>,
    ) -> Result<PipelineInstance, PipelineError> {
        let instance = self
            .mutate(id, move |inst, _, _| {
                let index = require_waiting_approval(inst)?;
                set_phase_status(inst, index, PhaseStatus::Pending)?;
                let record = &mut inst.phase_records[index];
                record.resolve_gate(ReviewDecision::Rejected, notes, Utc::now());
                record.output = None;
                record.duration_millis = None;
                record.completed_at = None;
                set_pipeline_status(inst, PipelineStatus::Paused)
            })
            .await?;
        info!(
            pipeline_id = %id,
            phase = instance.current_phase_index,
            "phase.rejected"
        );
        Ok(instance)
    }

    /// Replace a phase's stored output without changing any status.
    /// Allowed on terminal pipelines for manual correction. The replaced
    /// output is kept in the phase's review history.
    pub async fn edit_output(
        &self,
        id: PipelineId,
        phase_index: usize,
        output: PhaseOutput,
    ) -> Result<PipelineInstance, PipelineError> {
        let instance = self
            .mutate(id, move |inst, _, _| {
                let phase_count = inst.phase_count();
                let record = inst.phase_records.get_mut(phase_index).ok_or(
                    PipelineError::PhaseOutOfRange {
                        id: inst.id,
                        phase_index,
                        phase_count,
                    },
                )?;
                if !record.status.holds_output() {
                    return Err(PipelineError::invalid_state(
                        inst.id,
                        format!(
                            "phase {} is {}; only completed or waiting_approval output can be edited",
                            phase_index, record.status
                        ),
                    ));
                }
                record.edit_output(output, Utc::now());
                Ok(())
            })
            .await?;
        info!(pipeline_id = %id, phase = phase_index, "phase.output_edited");
        Ok(instance)
    }

    /// Re-dispatch phases a previous process left `running`. The attempt
    /// counter is bumped, so a late result from the lost run is stale.
    pub async fn recover_interrupted(&self) -> Result<usize, PipelineError> {
        let mut recovered = 0;
        for instance in self.inner.store.list(None).await? {
            let Some(index) = instance
                .phase_records
                .iter()
                .position(|r| r.status == PhaseStatus::Running)
            else {
                continue;
            };
            self.mutate(instance.id, move |inst, catalog, fx| {
                if inst.phase_records[index].status != PhaseStatus::Running {
                    fx.unchanged = true;
                    return Ok(());
                }
                queue_dispatch(inst, index, &catalog.resolve(index), fx);
                Ok(())
            })
            .await?;
            warn!(pipeline_id = %instance.id, phase = index, "phase.redispatched");
            recovered += 1;
        }
        Ok(recovered)
    }

    // ── Queries ───────────────────────────────────────────────────────

    pub async fn get(&self, id: PipelineId) -> Result<PipelineInstance, PipelineError> {
        self.inner.store.get(id).await
    }

    pub async fn list(
        &self,
        status: Option<PipelineStatus>,
    ) -> Result<Vec<PipelineInstance>, PipelineError> {
        self.inner.store.list(status).await
    }

    /// Pipelines whose current phase waits for a reviewer, newest first.
    pub async fn pending_approvals(&self) -> Result<Vec<PipelineInstance>, PipelineError> {
        let all = self.inner.store.list(None).await?;
        Ok(all.into_iter().filter(|p| p.is_waiting_approval()).collect())
    }

    pub async fn stats(&self) -> Result<PipelineStats, PipelineError> {
        let all = self.inner.store.list(None).await?;
        let mut stats = PipelineStats {
            total: all.len(),
            ..Default::default()
        };
        for p in &all {
            match p.status {
                PipelineStatus::Pending => stats.pending += 1,
                PipelineStatus::Running => stats.running += 1,
                PipelineStatus::Paused => stats.paused += 1,
                PipelineStatus::Completed => stats.completed += 1,
                PipelineStatus::Failed => stats.failed += 1,
            }
            if p.is_waiting_approval() {
                stats.waiting_approval += 1;
            }
        }
        Ok(stats)
    }

    /// Wait until no phase dispatch is in flight. A dispatch that launches
    /// the next phase keeps the count above zero, so this waits for whole
    /// chains of ungated phases.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.in_flight.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Number of phase dispatches currently executing.
    pub fn in_flight(&self) -> usize {
        *self.inner.in_flight.borrow()
    }

    // ── Internals ─────────────────────────────────────────────────────

    /// Apply `f` under the instance lock, check invariants and commit.
    /// Events are published before the lock is released; the dispatch, if
    /// any, is launched after.
    async fn mutate<F>(&self, id: PipelineId, f: F) -> Result<PipelineInstance, PipelineError>
    where
        F: FnOnce(&mut PipelineInstance, &PhaseCatalog, &mut Effects) -> Result<(), PipelineError>
            + Send,
    {
        let catalog = self.catalog();
        let effects = Mutex::new(Effects::default());
        let committed = self
            .inner
            .store
            .update_then(
                id,
                Box::new(|inst: &mut PipelineInstance| {
                    let mut fx = lock_effects(&effects);
                    f(inst, &catalog, &mut *fx)?;
                    if !fx.unchanged {
                        inst.touch();
                    }
                    check_invariants(inst)
                        .map_err(|message| PipelineError::Invariant { id, message })
                }),
                Box::new(|committed: &PipelineInstance| {
                    self.publish_effects(committed, &mut lock_effects(&effects));
                }),
            )
            .await?;
        let fx = effects.into_inner().unwrap_or_else(PoisonError::into_inner);
        if let Some(dispatch) = fx.dispatch {
            self.launch(dispatch);
        }
        Ok(committed)
    }

    /// Publish collected events followed by the pipeline snapshot.
    fn publish_effects(&self, committed: &PipelineInstance, fx: &mut Effects) {
        if fx.unchanged {
            return;
        }
        for event in std::mem::take(&mut fx.events) {
            publish(&self.inner.events, event);
        }
        let pipeline = committed.clone();
        let event = match fx.terminal {
            Some(Terminal::Completed) => PipelineEvent::PipelineCompleted { pipeline },
            Some(Terminal::Failed) => PipelineEvent::PipelineFailed { pipeline },
            None => PipelineEvent::PipelineUpdated { pipeline },
        };
        publish(&self.inner.events, event);
    }

    fn launch(&self, dispatch: Dispatch) {
        let this = self.clone();
        let span = info_span!(
            "phase",
            pipeline_id = %dispatch.request.pipeline_id,
            phase = dispatch.request.phase_index,
            attempt = dispatch.request.attempt,
            trace_id = %short_trace_id(),
        );
        self.inner.in_flight.send_modify(|n| *n += 1);
        let guard = InFlightGuard(Arc::clone(&self.inner));
        tokio::spawn(
            async move {
                let _guard = guard;
                this.run_dispatch(dispatch).await
            }
            .instrument(span),
        );
    }

    async fn run_dispatch(&self, dispatch: Dispatch) {
        let Dispatch {
            request,
            requires_approval,
        } = dispatch;
        let id = request.pipeline_id;
        let phase_index = request.phase_index;
        let attempt = request.attempt;
        info!(phase_name = %request.phase_name, "phase.start");

        let started = Instant::now();
        let result = execute_with_deadline(
            Arc::clone(&self.inner.executor),
            request,
            self.inner.phase_timeout,
        )
        .await;
        let duration_millis = started.elapsed().as_millis() as u64;

        match &result {
            Ok(_) => info!(duration_ms = duration_millis, "phase.finished"),
            Err(e) => error!(duration_ms = duration_millis, error = %e, "phase.failed"),
        }

        let outcome = PhaseOutcome {
            phase_index,
            attempt,
            requires_approval,
            duration_millis,
            result,
        };
        let Err(e) = self.complete_phase_with_retry(id, outcome).await else {
            return;
        };
        error!(error = %e, "phase.result_not_applied");

        // The record is still `running`; fail it so it does not stay stuck.
        let fallback = PhaseOutcome {
            phase_index,
            attempt,
            requires_approval,
            duration_millis,
            result: Err(ExecutorError::Permanent(format!(
                "result could not be saved: {}",
                e
            ))),
        };
        if let Err(e) = self.complete_phase_with_retry(id, fallback).await {
            error!(error = %e, "phase.failure_not_recorded");
        }
    }

    /// Apply a result, retrying with backoff while the store is failing.
    /// A failed commit leaves the instance untouched, so a retry is safe.
    async fn complete_phase_with_retry(
        &self,
        id: PipelineId,
        outcome: PhaseOutcome,
    ) -> Result<PipelineInstance, PipelineError> {
        let mut try_number = 1;
        loop {
            match self.complete_phase(id, outcome.clone()).await {
                Err(PipelineError::Store(e)) if try_number < SAVE_RETRY.max_attempts => {
                    let delay = SAVE_RETRY.backoff(try_number);
                    warn!(
                        try_number,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "phase.save_retry"
                    );
                    tokio::time::sleep(delay).await;
                    try_number += 1;
                }
                other => return other,
            }
        }
    }

    /// Apply an executor result. Results for a record that is no longer the
    /// running attempt are dropped.
    async fn complete_phase(
        &self,
        id: PipelineId,
        outcome: PhaseOutcome,
    ) -> Result<PipelineInstance, PipelineError> {
        self.mutate(id, move |inst, catalog, fx| {
            let PhaseOutcome {
                phase_index,
                attempt,
                requires_approval,
                duration_millis,
                result,
            } = outcome;

            let Some(record) = inst.phase_records.get(phase_index) else {
                fx.unchanged = true;
                return Ok(());
            };
            if record.status != PhaseStatus::Running || record.attempt != attempt {
                warn!(
                    status = %record.status,
                    current_attempt = record.attempt,
                    "phase.stale_result"
                );
                fx.unchanged = true;
                return Ok(());
            }

            let now = Utc::now();
            match result {
                Ok(output) if requires_approval => {
                    set_phase_status(inst, phase_index, PhaseStatus::WaitingApproval)?;
                    let record = &mut inst.phase_records[phase_index];
                    record.output = Some(output);
                    record.duration_millis = Some(duration_millis);
                    record.open_gate(now);
                    fx.events.push(PipelineEvent::PhaseWaitingApproval {
                        pipeline_id: inst.id,
                        phase_index,
                    });
                    info!(pipeline_id = %inst.id, phase = phase_index, "phase.waiting_approval");
                }
                Ok(output) => {
                    set_phase_status(inst, phase_index, PhaseStatus::Completed)?;
                    let record = &mut inst.phase_records[phase_index];
                    record.output = Some(output);
                    record.duration_millis = Some(duration_millis);
                    record.completed_at = Some(now);
                    fx.events.push(PipelineEvent::PhaseCompleted {
                        pipeline_id: inst.id,
                        phase_index,
                        duration_millis,
                    });
                    inst.current_phase_index = phase_index + 1;
                    if inst.status == PipelineStatus::Running {
                        advance(inst, catalog, fx)?;
                    }
                }
                Err(e) => fail_phase(inst, phase_index, duration_millis, &e, fx)?,
            }
            Ok(())
        })
        .await
    }
}

/// Result of one dispatch, carried back to the state machine.
#[derive(Clone)]
struct PhaseOutcome {
    phase_index: usize,
    attempt: u32,
    requires_approval: bool,
    duration_millis: u64,
    result: Result<PhaseOutput, ExecutorError>,
}

fn lock_effects(effects: &Mutex<Effects>) -> MutexGuard<'_, Effects> {
    effects.lock().unwrap_or_else(PoisonError::into_inner)
}

fn short_trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

fn require_waiting_approval(inst: &PipelineInstance) -> Result<usize, PipelineError> {
    match inst.current_record() {
        Some(record) if record.status == PhaseStatus::WaitingApproval => Ok(record.phase_index),
        Some(record) => Err(PipelineError::invalid_state(
            inst.id,
            format!(
                "phase {} ({}) is {}, not waiting for approval",
                record.phase_index, record.phase_name, record.status
            ),
        )),
        None => Err(PipelineError::invalid_state(
            inst.id,
            "all phases are completed; nothing is waiting for approval",
        )),
    }
}

/// `pending`/`paused` → `running`, then advance from the current phase.
fn start_in_place(
    inst: &mut PipelineInstance,
    catalog: &PhaseCatalog,
    fx: &mut Effects,
) -> Result<(), PipelineError> {
    set_pipeline_status(inst, PipelineStatus::Running)?;
    inst.started_at.get_or_insert_with(Utc::now);
    advance(inst, catalog, fx)
}

/// Walk forward from the current phase while the pipeline is running:
/// skip disabled phases, dispatch the first enabled pending phase, or
/// complete the pipeline when no phases remain.
fn advance(
    inst: &mut PipelineInstance,
    catalog: &PhaseCatalog,
    fx: &mut Effects,
) -> Result<(), PipelineError> {
    loop {
        let index = inst.current_phase_index;
        if inst.is_past_end() {
            set_pipeline_status(inst, PipelineStatus::Completed)?;
            inst.completed_at = Some(Utc::now());
            fx.terminal = Some(Terminal::Completed);
            info!(pipeline_id = %inst.id, niche = %inst.niche, "pipeline.completed");
            return Ok(());
        }

        match inst.phase_records[index].status {
            PhaseStatus::Running | PhaseStatus::WaitingApproval => return Ok(()),
            PhaseStatus::Completed => {
                inst.current_phase_index += 1;
            }
            PhaseStatus::Failed => {
                return Err(PipelineError::invalid_state(
                    inst.id,
                    format!("phase {} has failed", index),
                ));
            }
            PhaseStatus::Pending => {
                let def = catalog.resolve(index);
                if !def.enabled {
                    set_phase_status(inst, index, PhaseStatus::Completed)?;
                    let record = &mut inst.phase_records[index];
                    record.output = Some(serde_json::json!({}));
                    record.duration_millis = Some(0);
                    record.completed_at = Some(Utc::now());
                    fx.events.push(PipelineEvent::PhaseCompleted {
                        pipeline_id: inst.id,
                        phase_index: index,
                        duration_millis: 0,
                    });
                    debug!(pipeline_id = %inst.id, phase = index, "phase.skipped");
                    inst.current_phase_index += 1;
                    continue;
                }

                set_phase_status(inst, index, PhaseStatus::Running)?;
                queue_dispatch(inst, index, &def, fx);
                return Ok(());
            }
        }
    }
}

/// Bump the attempt of a `running` record and queue its dispatch.
fn queue_dispatch(
    inst: &mut PipelineInstance,
    index: usize,
    def: &PhaseDefinition,
    fx: &mut Effects,
) {
    let record = &mut inst.phase_records[index];
    record.attempt += 1;
    record.started_at = Some(Utc::now());
    record.error = None;
    let attempt = record.attempt;
    let phase_name = record.phase_name.clone();

    fx.events.push(PipelineEvent::PhaseStarted {
        pipeline_id: inst.id,
        phase_index: index,
        phase_name: phase_name.clone(),
        attempt,
    });
    fx.dispatch = Some(Dispatch {
        request: phase_request(inst, index, &phase_name, attempt),
        requires_approval: inst.config.requires_approval(index, def.requires_approval),
    });
}

fn fail_phase(
    inst: &mut PipelineInstance,
    phase_index: usize,
    duration_millis: u64,
    error: &ExecutorError,
    fx: &mut Effects,
) -> Result<(), PipelineError> {
    set_phase_status(inst, phase_index, PhaseStatus::Failed)?;
    let record = &mut inst.phase_records[phase_index];
    record.duration_millis = Some(duration_millis);
    record.error = Some(error.to_string());
    let message = format!(
        "Phase {} ({}) failed: {}",
        phase_index, record.phase_name, error
    );
    set_pipeline_status(inst, PipelineStatus::Failed)?;
    inst.error_message = Some(message);
    fx.events.push(PipelineEvent::PhaseFailed {
        pipeline_id: inst.id,
        phase_index,
        error: error.to_string(),
    });
    fx.terminal = Some(Terminal::Failed);
    Ok(())
}

/// Snapshot of everything a phase needs: pipeline inputs plus the outputs
/// of all earlier completed phases.
fn phase_request(
    inst: &PipelineInstance,
    phase_index: usize,
    phase_name: &str,
    attempt: u32,
) -> PhaseRequest {
    let phase_outputs: BTreeMap<usize, PhaseOutput> = inst.phase_records[..phase_index]
        .iter()
        .filter(|r| r.status == PhaseStatus::Completed)
        .filter_map(|r| r.output.clone().map(|o| (r.phase_index, o)))
        .collect();
    PhaseRequest {
        pipeline_id: inst.id,
        phase_index,
        phase_name: phase_name.to_string(),
        attempt,
        niche: inst.niche.clone(),
        topic: inst.topic.clone(),
        config: inst.config.clone(),
        phase_outputs,
    }
}
