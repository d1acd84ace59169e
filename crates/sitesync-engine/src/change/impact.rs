//! Kind-specific impact heuristics.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use sitesync_connector::types::EntityKind;

use super::record::{ImpactAssessment, ImpactLevel};
use crate::entity::FieldValue;

/// Thresholds for the impact heuristics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImpactThresholds {
    /// Budget or amount change, in percent, above which impact is high.
    pub budget_change_pct: f64,
    /// Delay, in days, at or above which impact is high.
    pub schedule_delay_days: i64,
}

impl Default for ImpactThresholds {
    fn default() -> Self {
        Self {
            budget_change_pct: 10.0,
            schedule_delay_days: 14,
        }
    }
}

/// Assesses the business impact of a single field change.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImpactAnalyzer {
    thresholds: ImpactThresholds,
}

impl ImpactAnalyzer {
    pub fn new(thresholds: ImpactThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &ImpactThresholds {
        &self.thresholds
    }

    pub fn assess(
        &self,
        kind: EntityKind,
        field: &str,
        previous: Option<&FieldValue>,
        new: Option<&FieldValue>,
    ) -> ImpactAssessment {
        let (previous, new) = match (previous, new) {
            (Some(p), Some(n)) => (p, n),
            (None, Some(_)) => return ImpactAssessment::new(ImpactLevel::Low, format!("{field} set")),
            (Some(_), None) => {
                return ImpactAssessment::new(ImpactLevel::Low, format!("{field} cleared"))
            }
            (None, None) => return ImpactAssessment::none(),
        };

        match (kind, field) {
            (EntityKind::Project | EntityKind::Schedule, "end_date" | "start_date")
            | (EntityKind::Rfi, "due_date") => self.date_shift(field, previous, new),
            (EntityKind::Project, "budget" | "actual_cost")
            | (EntityKind::FinancialRecord | EntityKind::ChangeOrder, "amount") => {
                self.money_change(field, previous, new)
            }
            (EntityKind::ChangeOrder, "schedule_impact_days") => self.schedule_impact(new),
            (EntityKind::Project | EntityKind::ChangeOrder, "status") => ImpactAssessment::new(
                ImpactLevel::Medium,
                format!("status changed from {previous} to {new}"),
            ),
            _ => ImpactAssessment::new(ImpactLevel::Low, format!("{field} changed")),
        }
    }

    fn date_shift(&self, field: &str, previous: &FieldValue, new: &FieldValue) -> ImpactAssessment {
        let (Some(before), Some(after)) = (previous.as_date(), new.as_date()) else {
            return ImpactAssessment::new(ImpactLevel::Low, format!("{field} changed"));
        };
        let days = (after - before).num_days();

        let (level, summary) = if days >= self.thresholds.schedule_delay_days {
            (ImpactLevel::High, format!("{field} pushed out {days} days"))
        } else if days > 0 {
            (ImpactLevel::Medium, format!("{field} pushed out {days} days"))
        } else if days < 0 {
            (ImpactLevel::Low, format!("{field} pulled in {} days", -days))
        } else {
            (ImpactLevel::None, format!("{field} unchanged"))
        };
        ImpactAssessment::new(level, summary).with_delay_days(days)
    }

    fn money_change(&self, field: &str, previous: &FieldValue, new: &FieldValue) -> ImpactAssessment {
        let (Some(before), Some(after)) = (previous.as_decimal(), new.as_decimal()) else {
            return ImpactAssessment::new(ImpactLevel::Low, format!("{field} changed"));
        };
        if before.is_zero() {
            return ImpactAssessment::new(
                ImpactLevel::Medium,
                format!("{field} changed from zero to {}", after.normalize()),
            );
        }

        let pct = ((after - before) / before.abs() * Decimal::ONE_HUNDRED)
            .to_f64()
            .unwrap_or(0.0);
        let threshold = self.thresholds.budget_change_pct;
        let level = if pct.abs() > threshold {
            ImpactLevel::High
        } else if pct.abs() > threshold / 2.0 {
            ImpactLevel::Medium
        } else {
            ImpactLevel::Low
        };
        ImpactAssessment::new(level, format!("{field} changed by {pct:+.1}%"))
            .with_percent_change(pct)
    }

    fn schedule_impact(&self, new: &FieldValue) -> ImpactAssessment {
        let days = match new {
            FieldValue::Integer(days) => *days,
            _ => return ImpactAssessment::new(ImpactLevel::Low, "schedule impact changed"),
        };
        let level = if days >= self.thresholds.schedule_delay_days {
            ImpactLevel::High
        } else if days > 0 {
            ImpactLevel::Medium
        } else {
            ImpactLevel::Low
        };
        ImpactAssessment::new(level, format!("change order adds {days} days")).with_delay_days(days)
    }
}
