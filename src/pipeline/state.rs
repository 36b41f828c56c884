//! Pipeline state machine tables and the invariant checker.
//!
//! The orchestrator changes statuses only through [`set_pipeline_status`] and
//! [`set_phase_status`], and checks [`check_invariants`] before any mutation is
//! committed to the store.

use super::models::{PhaseStatus, PipelineInstance, PipelineStatus};
use crate::errors::PipelineError;

/// Valid pipeline-level transitions. Setting the same status again is always allowed.
pub fn can_transition_pipeline(from: PipelineStatus, to: PipelineStatus) -> bool {
    use PipelineStatus::*;
    from == to
        || matches!(
            (from, to),
            (Pending, Running)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Paused, Running)
                | (Paused, Failed)
        )
}

/// Valid phase-record transitions.
pub fn can_transition_phase(from: PhaseStatus, to: PhaseStatus) -> bool {
    use PhaseStatus::*;
    matches!(
        (from, to),
        (Pending, Running)
            // disabled phases are skipped straight to completed
            | (Pending, Completed)
            | (Running, WaitingApproval)
            | (Running, Completed)
            | (Running, Failed)
            | (WaitingApproval, Completed)
            // rejected output is discarded for a re-run
            | (WaitingApproval, Pending)
    )
}

pub fn set_pipeline_status(
    instance: &mut PipelineInstance,
    to: PipelineStatus,
) -> Result<(), PipelineError> {
    if !can_transition_pipeline(instance.status, to) {
        return Err(PipelineError::Invariant {
            id: instance.id,
            message: format!("illegal pipeline transition {} -> {}", instance.status, to),
        });
    }
    instance.status = to;
    Ok(())
}

pub fn set_phase_status(
    instance: &mut PipelineInstance,
    phase_index: usize,
    to: PhaseStatus,
) -> Result<(), PipelineError> {
    let id = instance.id;
    let record = instance
        .phase_records
        .get_mut(phase_index)
        .ok_or_else(|| PipelineError::Invariant {
            id,
            message: format!("no phase record {}", phase_index),
        })?;
    if !can_transition_phase(record.status, to) {
        return Err(PipelineError::Invariant {
            id,
            message: format!(
                "illegal transition of phase {} ({}): {} -> {}",
                phase_index, record.phase_name, record.status, to
            ),
        });
    }
    record.status = to;
    Ok(())
}

/// Index of the first record that is not completed, or `len` when all are.
pub fn first_incomplete(instance: &PipelineInstance) -> usize {
    instance
        .phase_records
        .iter()
        .position(|r| r.status != PhaseStatus::Completed)
        .unwrap_or(instance.phase_records.len())
}

/// Check the structural invariants of a pipeline instance.
pub fn check_invariants(instance: &PipelineInstance) -> Result<(), String> {
    let active: Vec<usize> = instance
        .phase_records
        .iter()
        .filter(|r| r.status.is_active())
        .map(|r| r.phase_index)
        .collect();
    if active.len() > 1 {
        return Err(format!("more than one active phase: {:?}", active));
    }

    let expected = first_incomplete(instance);
    if instance.current_phase_index != expected {
        return Err(format!(
            "current phase index {} but first incomplete phase is {}",
            instance.current_phase_index, expected
        ));
    }

    for (i, record) in instance.phase_records.iter().enumerate() {
        if record.phase_index != i {
            return Err(format!("record at {} claims phase index {}", i, record.phase_index));
        }
        if record.output.is_some() && !record.status.holds_output() {
            return Err(format!("phase {} is {} but holds output", i, record.status));
        }
        let open_reviews = record.reviews.iter().filter(|r| r.is_open()).count();
        if open_reviews > 1 {
            return Err(format!("phase {} has {} open reviews", i, open_reviews));
        }
        if open_reviews == 1 && record.status != PhaseStatus::WaitingApproval {
            return Err(format!("phase {} is {} but has an open review", i, record.status));
        }
        if record.status == PhaseStatus::Failed && instance.status != PipelineStatus::Failed {
            return Err(format!(
                "phase {} failed but pipeline is {}",
                i, instance.status
            ));
        }
    }

    let current = instance.current_record().map(|r| r.status);
    match instance.status {
        PipelineStatus::Pending => {
            if instance.current_phase_index != 0 || !active.is_empty() {
                return Err("pending pipeline has started phases".to_string());
            }
        }
        PipelineStatus::Running => {
            if !current.is_some_and(|s| s.is_active()) {
                return Err(format!(
                    "running pipeline has no active current phase (current: {:?})",
                    current
                ));
            }
        }
        PipelineStatus::Paused => {}
        PipelineStatus::Completed => {
            if !instance.is_past_end() {
                return Err("completed pipeline has incomplete phases".to_string());
            }
        }
        PipelineStatus::Failed => {
            if current != Some(PhaseStatus::Failed) {
                return Err("failed pipeline's current phase is not failed".to_string());
            }
        }
    }

    Ok(())
}
