use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::phase::PhaseCatalog;

/// Opaque pipeline identifier, generated at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineId(Uuid);

impl PipelineId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PipelineId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PipelineId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| format!("Invalid pipeline id '{}': {}", s, e))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl PipelineStatus {
    pub const ALL: [PipelineStatus; 5] = [
        Self::Pending,
        Self::Running,
        Self::Paused,
        Self::Completed,
        Self::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// No further phase advances happen from a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid pipeline status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Running,
    WaitingApproval,
    Completed,
    Failed,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::WaitingApproval => "waiting_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Running or waiting for a reviewer: the phase currently holding the pipeline.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::WaitingApproval)
    }

    /// Statuses whose record may carry an output.
    pub fn holds_output(&self) -> bool {
        matches!(self, Self::WaitingApproval | Self::Completed)
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "waiting_approval" => Ok(Self::WaitingApproval),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid phase status: {}", s)),
        }
    }
}

/// Per-pipeline settings supplied at creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Phase index → approval requirement. Takes priority over the catalog flag.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub approval_overrides: BTreeMap<usize, bool>,
}

impl PipelineConfig {
    pub fn requires_approval(&self, phase_index: usize, catalog_default: bool) -> bool {
        self.approval_overrides
            .get(&phase_index)
            .copied()
            .unwrap_or(catalog_default)
    }
}

/// Outcome of one review gate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    /// Gate is open; the phase is waiting for a reviewer
    Pending,
    Approved,
    Rejected,
    /// Approved with an edited output, or a correction made after completion
    Edited,
}

/// One entry in a phase's review history.
///
/// A gate opens when a phase result lands in `waiting_approval` and is
/// resolved by approve or reject. Edits of a completed phase are appended
/// as already-resolved `Edited` entries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReviewEntry {
    /// Dispatch attempt whose output was reviewed
    pub attempt: u32,
    pub decision: ReviewDecision,
    /// Output as produced, before any edit
    pub original_output: Option<serde_json::Value>,
    /// Latest reviewer replacement, if any
    pub edited_output: Option<serde_json::Value>,
    pub notes: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ReviewEntry {
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseRecord {
    pub phase_index: usize,
    pub phase_name: String,
    pub status: PhaseStatus,
    /// Present only while waiting for approval or once completed
    pub output: Option<serde_json::Value>,
    pub duration_millis: Option<u64>,
    /// Number of times this phase has been dispatched
    pub attempt: u32,
    pub error: Option<String>,
    /// Review gates and manual corrections, oldest first
    #[serde(default)]
    pub reviews: Vec<ReviewEntry>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub approved_at: Option<DateTime<Utc>>,
}

impl PhaseRecord {
    pub fn new(phase_index: usize, phase_name: &str) -> Self {
        Self {
            phase_index,
            phase_name: phase_name.to_string(),
            status: PhaseStatus::Pending,
            output: None,
            duration_millis: None,
            attempt: 0,
            error: None,
            reviews: Vec::new(),
            started_at: None,
            completed_at: None,
            approved_at: None,
        }
    }

    pub fn open_review(&self) -> Option<&ReviewEntry> {
        self.reviews.iter().rev().find(|r| r.is_open())
    }

    /// Open a review gate for the output now waiting for approval.
    pub fn open_gate(&mut self, at: DateTime<Utc>) {
        self.reviews.push(ReviewEntry {
            attempt: self.attempt,
            decision: ReviewDecision::Pending,
            original_output: self.output.clone(),
            edited_output: None,
            notes: None,
            opened_at: at,
            resolved_at: None,
        });
    }

    fn open_review_mut(&mut self, at: DateTime<Utc>) -> &mut ReviewEntry {
        if self.open_review().is_none() {
            self.open_gate(at);
        }
        let index = self
            .reviews
            .iter()
            .rposition(ReviewEntry::is_open)
            .unwrap_or(self.reviews.len() - 1);
        &mut self.reviews[index]
    }

    /// Close the open gate. An approval of an edited output is recorded as `Edited`.
    pub fn resolve_gate(&mut self, decision: ReviewDecision, notes: Option<String>, at: DateTime<Utc>) {
        let entry = self.open_review_mut(at);
        entry.decision = match decision {
            ReviewDecision::Approved if entry.edited_output.is_some() => ReviewDecision::Edited,
            other => other,
        };
        entry.notes = notes;
        entry.resolved_at = Some(at);
    }

    /// Replace the output, keeping what it replaced in the review history.
    pub fn edit_output(&mut self, output: serde_json::Value, at: DateTime<Utc>) {
        if self.status == PhaseStatus::WaitingApproval {
            self.open_review_mut(at).edited_output = Some(output.clone());
        } else {
            self.reviews.push(ReviewEntry {
                attempt: self.attempt,
                decision: ReviewDecision::Edited,
                original_output: self.output.clone(),
                edited_output: Some(output.clone()),
                notes: None,
                opened_at: at,
                resolved_at: Some(at),
            });
        }
        self.output = Some(output);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineInstance {
    pub id: PipelineId,
    pub niche: String,
    pub topic: Option<String>,
    pub status: PipelineStatus,
    /// Index of the first non-completed phase record; equals `phase_records.len()` when all are done
    pub current_phase_index: usize,
    #[serde(default)]
    pub config: PipelineConfig,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
    /// Bumped on every committed change; orders snapshots of one pipeline
    #[serde(default)]
    pub version: u64,
    pub phase_records: Vec<PhaseRecord>,
}

impl PipelineInstance {
    /// A fresh `pending` instance with one pending record per catalog phase.
    pub fn new(
        niche: &str,
        topic: Option<String>,
        config: PipelineConfig,
        catalog: &PhaseCatalog,
    ) -> Self {
        let now = Utc::now();
        let phase_records = catalog
            .phases()
            .iter()
            .enumerate()
            .map(|(i, def)| PhaseRecord::new(i, &def.name))
            .collect();
        Self {
            id: PipelineId::new(),
            niche: niche.to_string(),
            topic,
            status: PipelineStatus::Pending,
            current_phase_index: 0,
            config,
            error_message: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            last_updated: now,
            version: 0,
            phase_records,
        }
    }

    pub fn phase_count(&self) -> usize {
        self.phase_records.len()
    }

    pub fn current_record(&self) -> Option<&PhaseRecord> {
        self.phase_records.get(self.current_phase_index)
    }

    /// True once every phase record is completed.
    pub fn is_past_end(&self) -> bool {
        self.current_phase_index >= self.phase_records.len()
    }

    pub fn is_waiting_approval(&self) -> bool {
        self.current_record()
            .is_some_and(|r| r.status == PhaseStatus::WaitingApproval)
    }

    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
        self.version += 1;
    }
}

/// External request applied by the orchestrator. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Create {
        niche: String,
        topic: Option<String>,
        auto_start: bool,
        config: PipelineConfig,
    },
    Start {
        id: PipelineId,
    },
    Stop {
        id: PipelineId,
    },
    Approve {
        id: PipelineId,
        notes: Option<String>,
    },
    Reject {
        id: PipelineId,
        notes: Option<String>,
    },
    EditOutput {
        id: PipelineId,
        phase_index: usize,
        output: serde_json::Value,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Start { .. } => "start",
            Self::Stop { .. } => "stop",
            Self::Approve { .. } => "approve",
            Self::Reject { .. } => "reject",
            Self::EditOutput { .. } => "edit_output",
        }
    }
}

/// Per-status counts for dashboards.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub waiting_approval: usize,
}
