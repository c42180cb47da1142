//! Error types for the coordinator crate.

use thiserror::Error;

use pilot_core::CoreError;

use crate::backend::BackendError;

/// Coordinator errors
#[derive(Error, Debug)]
pub enum ChatError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    /// Another loop or plan is already driving the conversation
    #[error("Conversation {conversation_id} is busy: {reason}")]
    Busy {
        conversation_id: String,
        reason: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid rule pattern '{pattern}': {message}")]
    Rule { pattern: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl ChatError {
    /// True for rejections caused by concurrent work on the same conversation.
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Busy { .. } => true,
            Self::Core(e) => e.is_conflict(),
            _ => false,
        }
    }
}

/// Result type for coordinator operations
pub type ChatResult<T> = Result<T, ChatError>;
