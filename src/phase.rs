//! Phase catalog for the pipeline orchestrator.
//!
//! This module provides:
//! - `PhaseDefinition` describing a single named phase
//! - `PhaseCatalog`, the validated, ordered sequence of definitions
//! - The default eight-phase product pipeline used when no catalog is configured
//!
//! A definition's position in the sorted catalog is the phase index that
//! pipeline instances use to address their phase records.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::errors::PipelineError;

/// A single phase in the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhaseDefinition {
    /// Unique ordering key. Phases run in ascending order of this value.
    pub sequence_index: u32,
    /// Human-readable name, unique within the catalog
    pub name: String,
    /// Whether a successful run waits for explicit approval before advancing
    #[serde(default = "default_requires_approval")]
    pub requires_approval: bool,
    /// Disabled phases are skipped: marked completed with empty output
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_requires_approval() -> bool {
    true
}

fn default_enabled() -> bool {
    true
}

impl PhaseDefinition {
    pub fn new(sequence_index: u32, name: &str, requires_approval: bool, enabled: bool) -> Self {
        Self {
            sequence_index,
            name: name.to_string(),
            requires_approval,
            enabled,
        }
    }

    /// Definition used when a pipeline addresses a phase the catalog no longer has.
    /// Approval is required so nothing advances unreviewed.
    pub fn fallback(phase_index: usize) -> Self {
        Self {
            sequence_index: phase_index as u32,
            name: format!("Phase {}", phase_index + 1),
            requires_approval: true,
            enabled: true,
        }
    }
}

/// The default phases of the content-production pipeline.
const DEFAULT_PHASES: [&str; 8] = [
    "Trend Discovery",
    "Niche Validation",
    "Audience & Pain Points",
    "Product Structure",
    "Content Writing",
    "Visual Design",
    "Funnel & Copy",
    "Campaign Launch",
];

/// Immutable, validated, ordered set of phase definitions.
///
/// Hot reload replaces the whole catalog; a catalog value is never mutated
/// in place.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct PhaseCatalog {
    phases: Vec<PhaseDefinition>,
}

impl PhaseCatalog {
    /// Validate and sort a set of definitions.
    pub fn new(mut phases: Vec<PhaseDefinition>) -> Result<Self, PipelineError> {
        if phases.is_empty() {
            return Err(PipelineError::Catalog(
                "catalog must contain at least one phase".to_string(),
            ));
        }

        let mut indices = HashSet::new();
        let mut names = HashSet::new();
        for phase in &phases {
            if phase.name.trim().is_empty() {
                return Err(PipelineError::Catalog(format!(
                    "phase with sequence index {} has an empty name",
                    phase.sequence_index
                )));
            }
            if !indices.insert(phase.sequence_index) {
                return Err(PipelineError::Catalog(format!(
                    "duplicate sequence index {}",
                    phase.sequence_index
                )));
            }
            if !names.insert(phase.name.as_str()) {
                return Err(PipelineError::Catalog(format!(
                    "duplicate phase name '{}'",
                    phase.name
                )));
            }
        }

        phases.sort_by_key(|p| p.sequence_index);
        Ok(Self { phases })
    }

    /// The eight-phase product pipeline, every phase enabled and approval-gated.
    pub fn default_catalog() -> Self {
        let phases = DEFAULT_PHASES
            .iter()
            .enumerate()
            .map(|(i, name)| PhaseDefinition::new(i as u32, name, true, true))
            .collect();
        Self { phases }
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn get(&self, phase_index: usize) -> Option<&PhaseDefinition> {
        self.phases.get(phase_index)
    }

    /// Look up a definition, falling back to an approval-gated placeholder.
    pub fn resolve(&self, phase_index: usize) -> PhaseDefinition {
        self.get(phase_index)
            .cloned()
            .unwrap_or_else(|| PhaseDefinition::fallback(phase_index))
    }

    pub fn phases(&self) -> &[PhaseDefinition] {
        &self.phases
    }

    /// Derive a new catalog with one phase's flags changed.
    pub fn with_toggle(
        &self,
        phase_index: usize,
        requires_approval: Option<bool>,
        enabled: Option<bool>,
    ) -> Result<Self, PipelineError> {
        let mut phases = self.phases.clone();
        let phase = phases.get_mut(phase_index).ok_or_else(|| {
            PipelineError::Validation(format!(
                "phase index {} out of range (catalog has {} phases)",
                phase_index,
                self.phases.len()
            ))
        })?;
        if let Some(requires_approval) = requires_approval {
            phase.requires_approval = requires_approval;
        }
        if let Some(enabled) = enabled {
            phase.enabled = enabled;
        }
        Self::new(phases)
    }
}

impl Default for PhaseCatalog {
    fn default() -> Self {
        Self::default_catalog()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_catalog_has_eight_gated_phases() {
        let catalog = PhaseCatalog::default_catalog();
        assert_eq!(catalog.len(), 8);
        assert_eq!(catalog.get(0).unwrap().name, "Trend Discovery");
        assert_eq!(catalog.get(7).unwrap().name, "Campaign Launch");
        assert!(catalog.phases().iter().all(|p| p.requires_approval && p.enabled));
    }

    #[test]
    fn test_new_sorts_by_sequence_index() {
        let catalog = PhaseCatalog::new(vec![
            PhaseDefinition::new(20, "Write", false, true),
            PhaseDefinition::new(5, "Research", true, true),
            PhaseDefinition::new(10, "Outline", false, false),
        ])
        .unwrap();
        let names: Vec<_> = catalog.phases().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Research", "Outline", "Write"]);
    }

    #[test]
    fn test_new_rejects_empty_catalog() {
        let err = PhaseCatalog::new(vec![]).unwrap_err();
        assert!(matches!(err, PipelineError::Catalog(_)));
    }

    #[test]
    fn test_new_rejects_duplicate_sequence_index() {
        let err = PhaseCatalog::new(vec![
            PhaseDefinition::new(1, "A", true, true),
            PhaseDefinition::new(1, "B", true, true),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("duplicate sequence index 1"));
    }

    #[test]
    fn test_new_rejects_duplicate_or_blank_names() {
        let dup = PhaseCatalog::new(vec![
            PhaseDefinition::new(1, "A", true, true),
            PhaseDefinition::new(2, "A", true, true),
        ]);
        assert!(dup.unwrap_err().to_string().contains("duplicate phase name"));

        let blank = PhaseCatalog::new(vec![PhaseDefinition::new(1, "  ", true, true)]);
        assert!(blank.unwrap_err().to_string().contains("empty name"));
    }

    #[test]
    fn test_resolve_falls_back_to_gated_phase() {
        let catalog = PhaseCatalog::new(vec![PhaseDefinition::new(0, "Only", false, true)]).unwrap();
        assert!(!catalog.resolve(0).requires_approval);
        let missing = catalog.resolve(3);
        assert!(missing.requires_approval);
        assert!(missing.enabled);
        assert_eq!(missing.name, "Phase 4");
    }

    #[test]
    fn test_with_toggle_returns_new_catalog() {
        let catalog = PhaseCatalog::default_catalog();
        let toggled = catalog.with_toggle(2, Some(false), Some(false)).unwrap();
        assert!(catalog.get(2).unwrap().requires_approval);
        assert!(!toggled.get(2).unwrap().requires_approval);
        assert!(!toggled.get(2).unwrap().enabled);
        assert!(catalog.with_toggle(8, Some(true), None).is_err());
    }
}
