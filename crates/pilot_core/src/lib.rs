//! # pilot_core
//!
//! Core model for infrapilot.
//!
//! This crate provides the conversation data model and the execution-plan
//! state machine with its human approval gate.
//!
//! # Architecture
//!
//! - **Conversation**: messages, context and workflow references for one user session
//! - **ExecutionPlan**: ordered steps for one objective, with a lifecycle
//! - **PlanMachine**: owns plans and enforces one active plan per conversation
//! - **Approval**: keyword classification of replies to an approval prompt
//!
//! # Example
//!
//! ```rust
//! use pilot_core::{PlanMachine, StepDraft, PlanStatus, parse_approval_response, ApprovalDecision};
//!
//! let mut machine = PlanMachine::new();
//! let plan = machine.create_plan(
//!     "conv-1", "user-1", "ws-1",
//!     "Deploy the API",
//!     vec![StepDraft::new("digitalocean", "create_droplet", "Create the API droplet")],
//! ).unwrap();
//! machine.request_approval(&plan.id).unwrap();
//!
//! if parse_approval_response("yes") == ApprovalDecision::Approve {
//!     let plan = machine.approve_plan(&plan.id).unwrap();
//!     assert_eq!(plan.status, PlanStatus::Approved);
//! }
//! ```

pub mod approval;
pub mod conversation;
pub mod error;
pub mod machine;
pub mod plan;

pub use approval::{parse_approval_response, ApprovalDecision, ApprovalLexicon};
pub use conversation::{
    Conversation, ConversationContext, ConversationId, ConversationStatus, CostLimits,
    Credential, InfrastructureHandle, Message, MessageRole,
};
pub use error::{CoreError, CoreResult};
pub use machine::{format_plan_for_approval, PlanMachine};
pub use plan::{
    format_duration, ExecutionPlan, ExecutionStep, PlanStatus, StepDraft, StepStatus,
};
