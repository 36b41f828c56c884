//! Pipeline orchestration core.
//!
//! ## Overview
//!
//! A pipeline instance walks one niche through the ordered phases of the
//! catalog. Each phase is handed to a `PhaseExecutor`; its result either
//! advances the pipeline or parks it until a reviewer approves or rejects
//! the output. Many instances run concurrently; each one is mutated only
//! under its own lock.
//!
//! ## Module Map
//!
//! ```text
//!   Command ──> orchestrator.rs  (Orchestrator: commands, advance loop)
//!                    │      │
//!                    │      │ state.rs  (transition tables, invariants)
//!                    │      v
//!                    │   store.rs  (PipelineStore: MemoryStore, per-id lock)
//!                    │      └─ db.rs  (SqliteStore write-through, DbHandle)
//!                    │
//!                    │ tracked task, no lock held
//!                    v
//!               executor.rs  (PhaseExecutor: Stub, Http, Retrying)
//!
//!   every committed change ──> events.rs  (PipelineEvent broadcast)
//! ```
//!
//! ## Typical Flow (create with auto start)
//!
//! 1. `Orchestrator::create` builds a `pending` instance, applies the first
//!    start in place and stores it; phase 0 is now `running`.
//! 2. The dispatch runs on a tracked task under a hard deadline.
//! 3. The result is applied under the instance lock: `waiting_approval` if
//!    the phase is gated, otherwise `completed` and the next phase dispatches.
//! 4. `approve` completes the waiting phase and advances; `reject` discards
//!    the output and pauses so the next `start` re-runs the phase.

pub mod db;
pub mod events;
pub mod executor;
pub mod models;
pub mod orchestrator;
pub mod state;
pub mod store;

pub use models::{Command, PipelineId, PipelineInstance, PipelineStatus};
pub use orchestrator::Orchestrator;
