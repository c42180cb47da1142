//! Outbound notifications.
//!
//! Every conversation gets its own broadcast channel plus a bounded backlog
//! so late subscribers can catch up. Events for one conversation are
//! published under a single lock and therefore arrive in emission order.
//! Delivery is best-effort: a lagging or absent subscriber is not an error.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use pilot_core::{ExecutionPlan, Message, PlanStatus};

use crate::autonomous::LoopSummary;

/// Progress snapshot of a plan
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowProgress {
    pub plan_id: String,
    pub objective: String,
    pub status: PlanStatus,
    pub completed_steps: usize,
    pub total_steps: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
}

impl WorkflowProgress {
    pub fn of(plan: &ExecutionPlan) -> Self {
        Self {
            plan_id: plan.id.clone(),
            objective: plan.objective.clone(),
            status: plan.status,
            completed_steps: plan.completed_steps(),
            total_steps: plan.steps.len(),
            current_step: plan
                .steps
                .iter()
                .find(|s| s.status == pilot_core::StepStatus::Running)
                .map(|s| s.description.clone()),
        }
    }

    pub fn percent(&self) -> u8 {
        if self.total_steps == 0 {
            100
        } else {
            ((self.completed_steps * 100) / self.total_steps) as u8
        }
    }
}

/// Event payloads
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    ConversationMessage {
        message: Message,
    },
    WorkflowProgress(WorkflowProgress),
    ExecutionStarted {
        plan_id: String,
        objective: String,
        total_steps: usize,
    },
    ExecutionStepStarted {
        plan_id: String,
        step_id: String,
        index: usize,
        description: String,
    },
    ExecutionStepCompleted {
        plan_id: String,
        step_id: String,
        index: usize,
        result: serde_json::Value,
    },
    ExecutionStepFailed {
        plan_id: String,
        step_id: String,
        index: usize,
        error: String,
    },
    ExecutionCompleted {
        plan_id: String,
        status: PlanStatus,
        completed_steps: usize,
        total_steps: usize,
    },
    AutonomousProgress {
        iteration: u32,
        max_iterations: u32,
        total_tokens: u64,
        tools: Vec<String>,
    },
    AutonomousComplete {
        summary: LoopSummary,
    },
    RecoveryStarted {
        recovery_id: String,
        provider: String,
        operation: String,
    },
    RecoveryProgress {
        recovery_id: String,
        attempt: u32,
        max_attempts: u32,
        message: String,
    },
    RecoverySuccess {
        recovery_id: String,
        attempts: u32,
        message: String,
    },
    RecoveryEscalated {
        recovery_id: String,
        attempts: u32,
        message: String,
        guidance: Vec<String>,
    },
    TypingStatus {
        typing: bool,
    },
}

impl EventKind {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConversationMessage { .. } => "conversation_message",
            Self::WorkflowProgress(_) => "workflow_progress",
            Self::ExecutionStarted { .. } => "execution_started",
            Self::ExecutionStepStarted { .. } => "execution_step_started",
            Self::ExecutionStepCompleted { .. } => "execution_step_completed",
            Self::ExecutionStepFailed { .. } => "execution_step_failed",
            Self::ExecutionCompleted { .. } => "execution_completed",
            Self::AutonomousProgress { .. } => "autonomous_progress",
            Self::AutonomousComplete { .. } => "autonomous_complete",
            Self::RecoveryStarted { .. } => "recovery_started",
            Self::RecoveryProgress { .. } => "recovery_progress",
            Self::RecoverySuccess { .. } => "recovery_success",
            Self::RecoveryEscalated { .. } => "recovery_escalated",
            Self::TypingStatus { .. } => "typing_status",
        }
    }
}

/// An event addressed to one conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationEvent {
    pub id: String,
    #[serde(rename = "conversationId")]
    pub conversation_id: String,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl ConversationEvent {
    pub fn new(conversation_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            ts: Utc::now(),
            kind,
        }
    }
}

/// Subscriber-facing notification interface.
pub trait NotificationSink: Send + Sync {
    /// Publish an event to a conversation's subscribers.
    fn emit(&self, conversation_id: &str, kind: EventKind);

    /// Subscribe to a conversation's live events.
    fn create_event_stream(&self, conversation_id: &str) -> broadcast::Receiver<ConversationEvent>;

    /// The most recent `limit` events of a conversation, oldest first.
    fn conversation_history(&self, conversation_id: &str, limit: usize) -> Vec<ConversationEvent>;

    fn send_conversation_message(&self, message: &Message) {
        let mut message = message.clone();
        message.credential = None;
        let conversation_id = message.conversation_id.clone();
        self.emit(&conversation_id, EventKind::ConversationMessage { message });
    }

    fn send_workflow_progress(&self, conversation_id: &str, progress: WorkflowProgress) {
        self.emit(conversation_id, EventKind::WorkflowProgress(progress));
    }
}

struct Channel {
    tx: broadcast::Sender<ConversationEvent>,
    backlog: VecDeque<ConversationEvent>,
}

/// In-process notification hub backed by tokio broadcast channels.
pub struct EventHub {
    channels: Mutex<HashMap<String, Channel>>,
    capacity: usize,
    backlog_limit: usize,
}

impl EventHub {
    pub fn new(capacity: usize, backlog_limit: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            backlog_limit,
        }
    }

    /// Drop every channel. Existing receivers observe a closed stream.
    pub fn clear(&self) {
        self.channels.lock().clear();
    }

    fn with_channel<R>(&self, conversation_id: &str, f: impl FnOnce(&mut Channel) -> R) -> R {
        let mut channels = self.channels.lock();
        let channel = channels
            .entry(conversation_id.to_string())
            .or_insert_with(|| Channel {
                tx: broadcast::channel(self.capacity).0,
                backlog: VecDeque::new(),
            });
        f(channel)
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(256, 200)
    }
}

impl NotificationSink for EventHub {
    fn emit(&self, conversation_id: &str, kind: EventKind) {
        let event = ConversationEvent::new(conversation_id, kind);
        trace!(conversation_id, event = event.kind.name(), "Emitting event");
        let limit = self.backlog_limit;
        self.with_channel(conversation_id, move |channel| {
            if limit > 0 {
                if channel.backlog.len() == limit {
                    channel.backlog.pop_front();
                }
                channel.backlog.push_back(event.clone());
            }
            // No subscribers is fine; the backlog keeps recent history.
            let _ = channel.tx.send(event);
        });
    }

    fn create_event_stream(&self, conversation_id: &str) -> broadcast::Receiver<ConversationEvent> {
        self.with_channel(conversation_id, |channel| channel.tx.subscribe())
    }

    fn conversation_history(&self, conversation_id: &str, limit: usize) -> Vec<ConversationEvent> {
        let channels = self.channels.lock();
        match channels.get(conversation_id) {
            Some(channel) => {
                let skip = channel.backlog.len().saturating_sub(limit);
                channel.backlog.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_arrive_in_order_per_conversation() {
        let hub = EventHub::default();
        let mut rx = hub.create_event_stream("c1");

        hub.emit("c1", EventKind::TypingStatus { typing: true });
        hub.emit("c2", EventKind::TypingStatus { typing: true });
        hub.emit("c1", EventKind::TypingStatus { typing: false });

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.kind, EventKind::TypingStatus { typing: true });
        assert_eq!(second.kind, EventKind::TypingStatus { typing: false });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_history_is_bounded() {
        let hub = EventHub::new(8, 3);
        for i in 0..5 {
            hub.emit(
                "c1",
                EventKind::RecoveryProgress {
                    recovery_id: "r".into(),
                    attempt: i,
                    max_attempts: 3,
                    message: String::new(),
                },
            );
        }
        let history = hub.conversation_history("c1", 10);
        assert_eq!(history.len(), 3);
        assert!(matches!(history[0].kind, EventKind::RecoveryProgress { attempt: 2, .. }));
        assert_eq!(hub.conversation_history("c1", 1).len(), 1);
        assert!(hub.conversation_history("unknown", 5).is_empty());
    }

    #[test]
    fn test_conversation_message_drops_credential() {
        let hub = EventHub::default();
        let msg = Message::user("c1", "hi")
            .with_credential(Some(pilot_core::Credential::new("secret")));
        hub.send_conversation_message(&msg);

        let history = hub.conversation_history("c1", 1);
        match &history[0].kind {
            EventKind::ConversationMessage { message } => assert!(message.credential.is_none()),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_event_wire_format() {
        let event = ConversationEvent::new(
            "c1",
            EventKind::RecoveryStarted {
                recovery_id: "r1".into(),
                provider: "digitalocean".into(),
                operation: "provision_infrastructure".into(),
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "recovery_started");
        assert_eq!(json["conversationId"], "c1");
        assert_eq!(json["provider"], "digitalocean");
    }
}
