//! Error types for the core module.

use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur while driving plans and conversations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conversation {conversation_id} already has an active plan: {plan_id}")]
    Conflict {
        conversation_id: String,
        plan_id: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Step not found: {step_id} in plan {plan_id}")]
    StepNotFound { plan_id: String, step_id: String },

    #[error("Invalid transition for {entity}: {from} -> {to}")]
    InvalidTransition {
        entity: String,
        from: String,
        to: String,
    },
}

impl CoreError {
    pub(crate) fn transition(
        entity: impl Into<String>,
        from: impl std::fmt::Debug,
        to: impl std::fmt::Debug,
    ) -> Self {
        Self::InvalidTransition {
            entity: entity.into(),
            from: format!("{:?}", from),
            to: format!("{:?}", to),
        }
    }

    /// Whether this error is a concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}
