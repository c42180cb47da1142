//! Conversation, message and context types.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a conversation
pub type ConversationId = String;

/// Backend credential attached to a single inbound message.
///
/// Never serialized and never printed: `Debug` is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Expose the raw token to a backend adapter.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// Message role in a conversation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// A single conversation message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Unique message ID (UUID)
    pub id: String,
    /// Conversation this message belongs to
    #[serde(rename = "conversationId")]
    pub conversation_id: ConversationId,
    /// Role of the message sender
    pub role: MessageRole,
    /// Message content
    pub content: String,
    /// When the message was created
    pub timestamp: DateTime<Utc>,
    /// Credential supplied with the message; lives only as long as the message
    #[serde(skip)]
    pub credential: Option<Credential>,
}

impl Message {
    fn new(conversation_id: &str, role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            credential: None,
        }
    }

    /// Create a new user message
    pub fn user(conversation_id: &str, content: impl Into<String>) -> Self {
        Self::new(conversation_id, MessageRole::User, content)
    }

    /// Create a new assistant message
    pub fn assistant(conversation_id: &str, content: impl Into<String>) -> Self {
        Self::new(conversation_id, MessageRole::Assistant, content)
    }

    pub fn with_credential(mut self, credential: Option<Credential>) -> Self {
        self.credential = credential;
        self
    }
}

/// Conversation health
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    #[default]
    Active,
    Error,
}

/// A handle to provisioned infrastructure the conversation knows about
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InfrastructureHandle {
    pub provider: String,
    pub kind: String,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

/// Spending limits for a conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CostLimits {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monthly: Option<f64>,
    /// Fraction of a limit (0.0 - 1.0) at which to alert
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert_threshold: Option<f64>,
}

/// Working context accumulated over a conversation
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConversationContext {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub active_infrastructure: Vec<InfrastructureHandle>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_operations: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preferred_regions: Vec<String>,
    #[serde(default)]
    pub cost_limits: CostLimits,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub mentioned_technologies: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deployment_requirements: Vec<String>,
    /// Opaque per-agent state, keyed by agent name
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub agent_state: HashMap<String, serde_json::Value>,
}

/// Full conversation state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    #[serde(rename = "workspaceId")]
    pub workspace_id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    pub status: ConversationStatus,
    pub messages: Vec<Message>,
    /// Plan/workflow ids started from this conversation
    #[serde(rename = "activeWorkflows", default)]
    pub active_workflows: BTreeSet<String>,
    #[serde(default)]
    pub context: ConversationContext,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Start a new conversation
    pub fn new(workspace_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), workspace_id, user_id)
    }

    /// Start a conversation under a caller-chosen id
    pub fn with_id(
        id: impl Into<String>,
        workspace_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            workspace_id: workspace_id.into(),
            user_id: user_id.into(),
            status: ConversationStatus::Active,
            messages: Vec::new(),
            active_workflows: BTreeSet::new(),
            context: ConversationContext::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a message. Messages are never edited after this point.
    pub fn append(&mut self, message: Message) {
        self.updated_at = message.timestamp;
        self.messages.push(message);
    }

    /// The last `window` messages, oldest first.
    pub fn recent(&self, window: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(window);
        &self.messages[start..]
    }

    /// Most recent user message matching `predicate`, newest first.
    pub fn last_user_message_where<F>(&self, predicate: F) -> Option<&Message>
    where
        F: Fn(&str) -> bool,
    {
        self.messages
            .iter()
            .rev()
            .filter(|m| m.role == MessageRole::User)
            .find(|m| predicate(&m.content))
    }

    pub fn mark_error(&mut self) {
        self.status = ConversationStatus::Error;
        self.updated_at = Utc::now();
    }
}
