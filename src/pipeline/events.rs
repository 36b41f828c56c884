use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::models::{PipelineId, PipelineInstance};

/// Capacity of the notification channel; slow subscribers lag rather than block.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// State-change notification published after every committed change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PipelineEvent {
    PipelineCreated {
        pipeline: PipelineInstance,
    },
    PipelineUpdated {
        pipeline: PipelineInstance,
    },
    PhaseStarted {
        pipeline_id: PipelineId,
        phase_index: usize,
        phase_name: String,
        attempt: u32,
    },
    PhaseCompleted {
        pipeline_id: PipelineId,
        phase_index: usize,
        duration_millis: u64,
    },
    PhaseWaitingApproval {
        pipeline_id: PipelineId,
        phase_index: usize,
    },
    PhaseFailed {
        pipeline_id: PipelineId,
        phase_index: usize,
        error: String,
    },
    PipelineCompleted {
        pipeline: PipelineInstance,
    },
    PipelineFailed {
        pipeline: PipelineInstance,
    },
}

impl PipelineEvent {
    pub fn pipeline_id(&self) -> PipelineId {
        match self {
            Self::PipelineCreated { pipeline }
            | Self::PipelineUpdated { pipeline }
            | Self::PipelineCompleted { pipeline }
            | Self::PipelineFailed { pipeline } => pipeline.id,
            Self::PhaseStarted { pipeline_id, .. }
            | Self::PhaseCompleted { pipeline_id, .. }
            | Self::PhaseWaitingApproval { pipeline_id, .. }
            | Self::PhaseFailed { pipeline_id, .. } => *pipeline_id,
        }
    }
}

/// Publish an event. Having no subscribers is not an error.
pub fn publish(tx: &broadcast::Sender<PipelineEvent>, event: PipelineEvent) {
    let _ = tx.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::PhaseCatalog;
    use crate::pipeline::models::PipelineConfig;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let id = PipelineId::new();
        let event = PipelineEvent::PhaseStarted {
            pipeline_id: id,
            phase_index: 2,
            phase_name: "Audience & Pain Points".to_string(),
            attempt: 1,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"PhaseStarted\""));
        assert!(json.contains("\"data\""));
        assert!(json.contains("\"phase_index\":2"));
        assert_eq!(event.pipeline_id(), id);
    }

    #[test]
    fn test_pipeline_event_carries_snapshot() {
        let pipeline =
            PipelineInstance::new("Keto Diet", None, PipelineConfig::default(), &PhaseCatalog::default());
        let id = pipeline.id;
        let event = PipelineEvent::PipelineCreated { pipeline };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "PipelineCreated");
        assert_eq!(json["data"]["pipeline"]["niche"], "Keto Diet");
        assert_eq!(event.pipeline_id(), id);
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let (tx, rx) = broadcast::channel(4);
        drop(rx);
        publish(
            &tx,
            PipelineEvent::PhaseWaitingApproval {
                pipeline_id: PipelineId::new(),
                phase_index: 0,
            },
        );
    }
}
