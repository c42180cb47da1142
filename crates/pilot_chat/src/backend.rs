//! Collaborator boundary: the LLM/tool backend and the tool-execution backend.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use pilot_core::{Credential, ExecutionPlan, ExecutionStep, Message, MessageRole};

/// Result type for backend calls.
pub type BackendResult<T> = Result<T, BackendError>;

/// Typed failures reported by a backend.
///
/// Adapters that can tell what went wrong return a specific variant;
/// anything else arrives as `Other` and is categorized once by the
/// error rule table.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("{0}")]
    MissingCredentials(String),

    #[error("{0}")]
    InvalidKey(String),

    #[error("{message}")]
    InsufficientCredits {
        provider: Option<String>,
        message: String,
    },

    #[error("{message}")]
    RateLimited {
        message: String,
        retry_after_secs: Option<u64>,
    },

    #[error("{0}")]
    Provisioning(String),

    #[error("{0}")]
    Other(String),
}

impl BackendError {
    /// The raw error text, without any category prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::MissingCredentials(m)
            | Self::InvalidKey(m)
            | Self::Provisioning(m)
            | Self::Other(m) => m,
            Self::InsufficientCredits { message, .. } | Self::RateLimited { message, .. } => {
                message
            }
        }
    }

    /// Category carried by the variant itself, if any.
    pub fn tag(&self) -> Option<ErrorCategory> {
        match self {
            Self::MissingCredentials(_) => Some(ErrorCategory::MissingCredentials),
            Self::InvalidKey(_) => Some(ErrorCategory::InvalidKey),
            Self::InsufficientCredits { .. } => Some(ErrorCategory::InsufficientCredits),
            Self::RateLimited { .. } => Some(ErrorCategory::RateLimited),
            Self::Provisioning(_) => Some(ErrorCategory::Provisioning),
            Self::Other(_) => None,
        }
    }

    /// Credential failures are never retried.
    pub fn is_credential(&self) -> bool {
        matches!(
            self.tag(),
            Some(ErrorCategory::MissingCredentials | ErrorCategory::InvalidKey)
        )
    }
}

/// Remediation category for a backend failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    MissingCredentials,
    InvalidKey,
    InsufficientCredits,
    RateLimited,
    Provisioning,
    Internal,
}

/// Role of a turn in the history sent to the backend
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    System,
    User,
    Assistant,
}

/// One entry of the message history sent to the backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: TurnRole,
    pub content: String,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
        }
    }
}

impl From<&Message> for ChatTurn {
    fn from(message: &Message) -> Self {
        match message.role {
            MessageRole::User => Self::user(message.content.clone()),
            MessageRole::Assistant => Self::assistant(message.content.clone()),
        }
    }
}

/// A chat call.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub history: Vec<ChatTurn>,
    pub credential: Option<Credential>,
    pub workspace_id: String,
    pub conversation_id: String,
}

/// A tool invocation reported by the backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

/// Token accounting for one call
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// Total, falling back to the sum of parts when the backend left it at zero.
    pub fn total(&self) -> u64 {
        if self.total_tokens > 0 {
            self.total_tokens
        } else {
            self.prompt_tokens + self.completion_tokens
        }
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total();
    }
}

/// Backend answer to a chat call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ChatReply {
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl ChatReply {
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_tool(mut self, call: ToolCall) -> Self {
        self.tool_calls.push(call);
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// The LLM/tool-calling backend.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> BackendResult<ChatReply>;
}

/// Request for a one-shot plan execution.
#[derive(Debug, Clone)]
pub struct PlanExecutionRequest {
    pub conversation_id: String,
    pub user_id: String,
    pub workspace_id: String,
    pub credential: Option<Credential>,
    pub request_text: String,
}

/// Request to run one step of an approved plan (or a recovery retry).
#[derive(Debug, Clone)]
pub struct StepInvocation {
    pub conversation_id: String,
    pub workspace_id: String,
    pub user_id: String,
    pub step: ExecutionStep,
    pub credential: Option<Credential>,
}

/// The tool-execution backend that performs provisioning operations.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Plan and execute a request in one go.
    async fn execute_plan(&self, request: PlanExecutionRequest) -> BackendResult<ExecutionPlan>;

    /// Execute a single step, returning its result payload.
    async fn execute_step(&self, invocation: StepInvocation) -> BackendResult<serde_json::Value>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_has_no_prefix() {
        let err = BackendError::MissingCredentials("No LLM credentials configured".to_string());
        assert_eq!(err.to_string(), "No LLM credentials configured");
        assert_eq!(err.message(), "No LLM credentials configured");
        assert!(err.is_credential());
    }

    #[test]
    fn test_typed_errors_carry_their_category() {
        let err = BackendError::RateLimited {
            message: "slow down".into(),
            retry_after_secs: None,
        };
        assert_eq!(err.tag(), Some(ErrorCategory::RateLimited));
        assert!(!err.is_credential());
        assert_eq!(BackendError::Other("x".into()).tag(), None);
    }

    #[test]
    fn test_usage_total_fallback() {
        let usage = TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 0,
        };
        assert_eq!(usage.total(), 15);

        let mut sum = TokenUsage::default();
        sum.add(&usage);
        sum.add(&TokenUsage::new(1, 1));
        assert_eq!(sum.total_tokens, 17);
    }
}
