//! Change detection: field diffs, priorities, approvals and impact.

mod detector;
mod impact;
mod record;
mod rules;

pub use detector::{ChangeDetector, Detection};
pub use impact::{ImpactAnalyzer, ImpactThresholds};
pub use record::{ChangeRecord, ChangeType, ImpactAssessment, ImpactLevel, Priority};
pub use rules::{ChangeRules, MonitoredField};
