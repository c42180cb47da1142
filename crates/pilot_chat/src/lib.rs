//! # pilot_chat - Conversation coordinator for infrapilot
//!
//! This crate turns chat messages into infrastructure work:
//! - Plain chat turns answered by the LLM backend
//! - Deployment requests driven by a bounded **autonomous loop**
//! - Multi-step plans gated on explicit user approval
//! - Provisioning failures handed to a bounded **recovery engine**
//! - Credential, billing and rate-limit errors mapped to remediation messages
//!
//! ## Key Features
//!
//! - **Rule tables**: loop signals, intent and error keywords live in a
//!   [`RuleBook`] that can be loaded from YAML
//! - **Event stream**: ordered per-conversation events over a broadcast hub
//! - **Pluggable backends**: [`ChatBackend`] and [`ToolExecutor`] traits, with
//!   an HTTP implementation and a scripted one for tests
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │     Message     │────▶│   Coordinator   │────▶│  Autonomous Loop│
//! └─────────────────┘     └────────┬────────┘     └────────┬────────┘
//!                                  │                       │
//!         ┌────────────────────────┼───────────────────────┘
//!         ▼                        ▼
//! ┌───────────────┐      ┌───────────────┐       ┌───────────────┐
//! │ Plan Machine  │      │  Classifier   │──────▶│   Recovery    │
//! └───────────────┘      └───────────────┘       └───────────────┘
//!         │                        │                        │
//!         └────────────────────────┼────────────────────────┘
//!                                  ▼
//!                        ┌───────────────┐
//!                        │   Event Hub   │
//!                        └───────────────┘
//! ```

pub mod autonomous;
pub mod backend;
pub mod classify;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod executor;
pub mod llm;
pub mod mock;
pub mod recovery;
pub mod remediation;
pub mod rules;
pub mod store;

pub use autonomous::{
    LoopConfig, LoopController, LoopOutcome, LoopRequest, LoopSummary, StopReason, Tone,
};
pub use backend::{
    BackendError, BackendResult, ChatBackend, ChatReply, ChatRequest, ChatTurn, ErrorCategory,
    PlanExecutionRequest, StepInvocation, TokenUsage, ToolCall, ToolExecutor, TurnRole,
};
pub use classify::{Classifier, Decision, ProvisioningFailure};
pub use config::{EventsConfig, LlmConfig, PilotConfig};
pub use coordinator::{Attachment, Coordinator, Response, ResponseType};
pub use error::{ChatError, ChatResult};
pub use events::{ConversationEvent, EventHub, EventKind, NotificationSink, WorkflowProgress};
pub use executor::BackendToolExecutor;
pub use llm::HttpChatBackend;
pub use mock::ScriptedBackend;
pub use recovery::{RecoveryConfig, RecoveryEngine, RecoverySession, RecoveryStatus};
pub use remediation::{remediation_for, ActionType, Remediation, SuggestedAction};
pub use rules::{Outcome, RuleBook, SignalClass};
pub use store::ConversationStore;
