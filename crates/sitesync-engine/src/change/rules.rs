//! Monitored fields with their priority and approval requirements.

use std::collections::HashMap;

use sitesync_connector::types::EntityKind;

use super::record::Priority;

/// A field watched for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitoredField {
    pub field: &'static str,
    pub priority: Priority,
    pub approval_required: bool,
}

impl MonitoredField {
    pub const fn new(field: &'static str, priority: Priority) -> Self {
        Self {
            field,
            priority,
            approval_required: false,
        }
    }

    #[must_use]
    pub const fn needs_approval(mut self) -> Self {
        self.approval_required = true;
        self
    }
}

/// Per-(kind, field) priority and approval tables.
#[derive(Debug, Clone)]
pub struct ChangeRules {
    rules: HashMap<EntityKind, Vec<MonitoredField>>,
}

impl ChangeRules {
    /// Empty rule set; nothing is monitored.
    pub fn empty() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    /// Rules for general contracting workflows.
    pub fn construction_defaults() -> Self {
        use Priority::{High, Low, Medium};

        Self::empty()
            .with_rules(
                EntityKind::Project,
                [
                    MonitoredField::new("status", High).needs_approval(),
                    MonitoredField::new("budget", High).needs_approval(),
                    MonitoredField::new("actual_cost", Medium),
                    MonitoredField::new("end_date", High),
                    MonitoredField::new("start_date", Medium),
                    MonitoredField::new("name", Low),
                    MonitoredField::new("location", Low),
                ],
            )
            .with_rules(
                EntityKind::Document,
                [
                    MonitoredField::new("status", Medium),
                    MonitoredField::new("revision", Medium),
                    MonitoredField::new("title", Low),
                ],
            )
            .with_rules(
                EntityKind::Schedule,
                [
                    MonitoredField::new("end_date", High),
                    MonitoredField::new("start_date", Medium),
                    MonitoredField::new("status", Medium),
                    MonitoredField::new("critical_path", Medium),
                    MonitoredField::new("percent_complete", Low),
                ],
            )
            .with_rules(
                EntityKind::FinancialRecord,
                [
                    MonitoredField::new("amount", High).needs_approval(),
                    MonitoredField::new("status", Medium).needs_approval(),
                    MonitoredField::new("category", Low),
                ],
            )
            .with_rules(
                EntityKind::ChangeOrder,
                [
                    MonitoredField::new("status", High).needs_approval(),
                    MonitoredField::new("amount", High).needs_approval(),
                    MonitoredField::new("schedule_impact_days", Medium),
                ],
            )
            .with_rules(
                EntityKind::Rfi,
                [
                    MonitoredField::new("status", Medium),
                    MonitoredField::new("due_date", Medium),
                    MonitoredField::new("priority", Medium),
                    MonitoredField::new("answered_on", Low),
                ],
            )
    }

    /// Replace the rules of one kind.
    #[must_use]
    pub fn with_rules(
        mut self,
        kind: EntityKind,
        fields: impl IntoIterator<Item = MonitoredField>,
    ) -> Self {
        self.rules.insert(kind, fields.into_iter().collect());
        self
    }

    pub fn rule(&self, kind: EntityKind, field: &str) -> Option<&MonitoredField> {
        self.rules
            .get(&kind)
            .and_then(|fields| fields.iter().find(|f| f.field == field))
    }

    /// Names of the monitored fields of a kind.
    pub fn monitored(&self, kind: EntityKind) -> Vec<&'static str> {
        self.rules
            .get(&kind)
            .map(|fields| fields.iter().map(|f| f.field).collect())
            .unwrap_or_default()
    }
}

impl Default for ChangeRules {
    fn default() -> Self {
        Self::construction_defaults()
    }
}
