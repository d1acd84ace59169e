//! Field-level change detection against the last snapshot.

use chrono::Utc;
use std::cmp::Ordering;

use sitesync_connector::ids::SystemId;

use super::impact::ImpactAnalyzer;
use super::record::{ChangeRecord, ChangeType, ImpactLevel, Priority};
use super::rules::ChangeRules;
use crate::entity::{FieldValue, UnifiedEntity};
use crate::ids::{ChangeId, RunId};
use crate::snapshot::EntitySnapshot;

/// Output of one detection pass.
#[derive(Debug, Clone)]
pub struct Detection {
    pub changes: Vec<ChangeRecord>,
    /// Snapshot to persist once the changes are recorded.
    pub snapshot: EntitySnapshot,
    /// Whether `snapshot` differs from the previous one.
    pub snapshot_changed: bool,
}

impl Detection {
    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }
}

/// Compares an entity's monitored fields with its previous snapshot.
#[derive(Debug, Clone, Default)]
pub struct ChangeDetector {
    rules: ChangeRules,
    impact: ImpactAnalyzer,
}

impl ChangeDetector {
    pub fn new(rules: ChangeRules, impact: ImpactAnalyzer) -> Self {
        Self { rules, impact }
    }

    pub fn rules(&self) -> &ChangeRules {
        &self.rules
    }

    /// Diff `entity` against `previous`.
    ///
    /// Without a previous snapshot nothing is reported; the returned snapshot
    /// becomes the baseline.
    pub fn detect(
        &self,
        system: &SystemId,
        run_id: RunId,
        entity: &UnifiedEntity,
        previous: Option<&EntitySnapshot>,
    ) -> Detection {
        let monitored = self.rules.monitored(entity.kind);
        let snapshot = EntitySnapshot::of(entity, &monitored);

        let Some(previous) = previous else {
            return Detection {
                changes: Vec::new(),
                snapshot,
                snapshot_changed: true,
            };
        };

        let detected_at = Utc::now();
        let mut changes = Vec::new();
        for field in monitored {
            let before = previous.get(field);
            let after = snapshot.get(field);
            if before == after {
                continue;
            }
            let Some(change_type) = classify_change(before, after) else {
                continue;
            };
            let Some(rule) = self.rules.rule(entity.kind, field) else {
                continue;
            };

            let impact = self.impact.assess(entity.kind, field, before, after);
            let priority = if impact.level == ImpactLevel::High {
                Priority::High
            } else {
                rule.priority
            };

            changes.push(ChangeRecord {
                id: ChangeId::new(),
                entity_id: entity.id,
                kind: entity.kind,
                system: system.clone(),
                run_id,
                field: field.to_string(),
                previous: before.cloned(),
                new: after.cloned(),
                change_type,
                priority,
                impact,
                approval_required: rule.approval_required,
                detected_at,
            });
        }

        Detection {
            snapshot_changed: !previous.same_values(&snapshot),
            changes,
            snapshot,
        }
    }
}

fn classify_change(before: Option<&FieldValue>, after: Option<&FieldValue>) -> Option<ChangeType> {
    match (before, after) {
        (None, None) => None,
        (None, Some(_)) => Some(ChangeType::Added),
        (Some(_), None) => Some(ChangeType::Removed),
        (Some(b), Some(a)) => match (b.as_decimal(), a.as_decimal()) {
            (Some(b), Some(a)) => match a.cmp(&b) {
                Ordering::Greater => Some(ChangeType::Increased),
                Ordering::Less => Some(ChangeType::Decreased),
                // Same value, different scale (100 vs 100.00).
                Ordering::Equal => None,
            },
            _ => Some(ChangeType::Modified),
        },
    }
}
