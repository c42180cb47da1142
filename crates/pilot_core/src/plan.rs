//! Execution plan and step types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::conversation::ConversationId;

/// Plan lifecycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    #[default]
    Draft,
    AwaitingApproval,
    Approved,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl PlanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Statuses that hold the conversation's single active-plan slot.
    pub fn holds_slot(&self) -> bool {
        matches!(
            self,
            Self::AwaitingApproval | Self::Approved | Self::Executing
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Approved => "approved",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Step lifecycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// pending -> running -> {completed | failed | skipped}
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running) => true,
            (Self::Running, Self::Completed | Self::Failed | Self::Skipped) => true,
            _ => false,
        }
    }
}

/// Input for a plan step, before the plan owns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDraft {
    pub service: String,
    pub action: String,
    pub description: String,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub estimated_duration_secs: u64,
}

impl StepDraft {
    pub fn new(
        service: impl Into<String>,
        action: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            action: action.into(),
            description: description.into(),
            parameters: serde_json::Map::new(),
            estimated_duration_secs: 0,
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn estimate_secs(mut self, secs: u64) -> Self {
        self.estimated_duration_secs = secs;
        self
    }
}

/// One atomic operation within a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub id: String,
    pub service: String,
    pub action: String,
    pub description: String,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    pub estimated_duration_secs: u64,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<StepDraft> for ExecutionStep {
    fn from(draft: StepDraft) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            service: draft.service,
            action: draft.action,
            description: draft.description,
            parameters: draft.parameters,
            estimated_duration_secs: draft.estimated_duration_secs,
            status: StepStatus::Pending,
            result: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// An ordered sequence of infrastructure operations for one objective.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub id: String,
    pub conversation_id: ConversationId,
    pub workspace_id: String,
    pub user_id: String,
    pub objective: String,
    pub steps: Vec<ExecutionStep>,
    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionPlan {
    pub fn new(
        conversation_id: impl Into<String>,
        user_id: impl Into<String>,
        workspace_id: impl Into<String>,
        objective: impl Into<String>,
        steps: Vec<ExecutionStep>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            workspace_id: workspace_id.into(),
            user_id: user_id.into(),
            objective: objective.into(),
            steps,
            status: PlanStatus::Draft,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&ExecutionStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub(crate) fn step_mut(&mut self, step_id: &str) -> Option<&mut ExecutionStep> {
        self.steps.iter_mut().find(|s| s.id == step_id)
    }

    /// True iff every step is completed or skipped.
    pub fn all_steps_succeeded(&self) -> bool {
        self.steps
            .iter()
            .all(|s| matches!(s.status, StepStatus::Completed | StepStatus::Skipped))
    }

    pub fn completed_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count()
    }

    pub fn failed_step(&self) -> Option<&ExecutionStep> {
        self.steps.iter().find(|s| s.status == StepStatus::Failed)
    }

    /// Next step that has not started yet, with its position in the plan.
    pub fn next_pending(&self) -> Option<(usize, &ExecutionStep)> {
        self.steps
            .iter()
            .enumerate()
            .find(|(_, s)| s.status == StepStatus::Pending)
    }

    pub fn total_estimated_secs(&self) -> u64 {
        self.steps.iter().map(|s| s.estimated_duration_secs).sum()
    }
}

/// Human-friendly duration like `2m 30s`.
pub fn format_duration(secs: u64) -> String {
    match (secs / 3600, (secs % 3600) / 60, secs % 60) {
        (0, 0, s) => format!("{}s", s),
        (0, m, 0) => format!("{}m", m),
        (0, m, s) => format!("{}m {}s", m, s),
        (h, 0, _) => format!("{}h", h),
        (h, m, _) => format!("{}h {}m", h, m),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_transitions() {
        assert!(StepStatus::Pending.can_transition_to(StepStatus::Running));
        assert!(StepStatus::Running.can_transition_to(StepStatus::Skipped));
        assert!(!StepStatus::Pending.can_transition_to(StepStatus::Completed));
        assert!(!StepStatus::Completed.can_transition_to(StepStatus::Running));
        assert!(!StepStatus::Failed.can_transition_to(StepStatus::Running));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(45), "45s");
        assert_eq!(format_duration(120), "2m");
        assert_eq!(format_duration(150), "2m 30s");
        assert_eq!(format_duration(3600), "1h");
        assert_eq!(format_duration(3900), "1h 5m");
    }

    #[test]
    fn test_plan_status_serialization() {
        let json = serde_json::to_string(&PlanStatus::AwaitingApproval).unwrap();
        assert_eq!(json, "\"awaiting_approval\"");
        assert!(PlanStatus::Executing.holds_slot());
        assert!(!PlanStatus::Draft.holds_slot());
    }
}
