//! Autonomous loop controller.
//!
//! Drives repeated backend calls for a deployment request without a human
//! turn in between. After each reply the classifier's decision table says
//! continue or stop; the iteration and token budgets bound the loop no
//! matter what the backend says.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use pilot_core::Credential;

use crate::backend::{BackendError, ChatBackend, ChatRequest, ChatTurn, TokenUsage};
use crate::classify::Classifier;
use crate::events::{EventKind, NotificationSink};
use crate::rules::SignalClass;

/// System instructions for autonomous runs.
pub const AUTONOMOUS_SYSTEM_PROMPT: &str =
    "You are an infrastructure deployment agent operating in autonomous mode. \
Work through the user's request step by step using the tools available to you. \
After each step, state plainly what you did and what the next step is. \
When everything is done, say \"deployment completed successfully\". \
If you need a decision from the user, ask for it and stop. \
If an operation fails in a way you cannot fix, say so and stop.";

/// Budgets and pacing for one autonomous run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopConfig {
    pub max_iterations: u32,
    pub token_budget: u64,
    pub throttle_base_ms: u64,
    pub throttle_step_ms: u64,
    pub throttle_cap_ms: u64,
    /// Prior turns sent along with the system prompt.
    pub history_window: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            token_budget: 50_000,
            throttle_base_ms: 1000,
            throttle_step_ms: 200,
            throttle_cap_ms: 3000,
            history_window: 20,
        }
    }
}

impl LoopConfig {
    /// Pause after `iteration` before the next call.
    pub fn throttle(&self, iteration: u32) -> Duration {
        let ms = self
            .throttle_base_ms
            .saturating_add(self.throttle_step_ms.saturating_mul(iteration as u64))
            .min(self.throttle_cap_ms);
        Duration::from_millis(ms)
    }

    /// No pauses between calls.
    pub fn unthrottled(mut self) -> Self {
        self.throttle_base_ms = 0;
        self.throttle_step_ms = 0;
        self.throttle_cap_ms = 0;
        self
    }
}

/// Why the loop halted
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopReason {
    /// A rule in the decision table said stop.
    Signal { rule: String, class: SignalClass },
    IterationLimit { max_iterations: u32 },
    TokenBudget { budget: u64 },
    BackendFailure { message: String },
}

impl StopReason {
    pub fn tone(&self) -> Tone {
        match self {
            Self::Signal { class, .. } => match class {
                SignalClass::Completion | SignalClass::ShortReply => Tone::Success,
                SignalClass::UserDecision | SignalClass::Question => Tone::NeedsInput,
                SignalClass::CriticalFailure => Tone::Error,
                _ => Tone::Paused,
            },
            Self::IterationLimit { .. } | Self::TokenBudget { .. } => Tone::Paused,
            Self::BackendFailure { .. } => Tone::Error,
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Signal { rule, .. } => format!("signal '{}'", rule),
            Self::IterationLimit { max_iterations } => {
                format!("iteration limit of {} reached", max_iterations)
            }
            Self::TokenBudget { budget } => format!("token budget of {} reached", budget),
            Self::BackendFailure { message } => message.clone(),
        }
    }
}

/// How the summary should read to the user
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    Success,
    NeedsInput,
    Error,
    Paused,
}

/// Structured summary emitted when a run halts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoopSummary {
    pub iterations: u32,
    pub total_tokens: u64,
    /// Unique tool names keyed by originating service
    pub tools_by_service: BTreeMap<String, BTreeSet<String>>,
    pub stop_reason: StopReason,
    pub tone: Tone,
    pub text: String,
}

/// Input for one autonomous run.
#[derive(Debug, Clone)]
pub struct LoopRequest {
    pub conversation_id: String,
    pub workspace_id: String,
    pub credential: Option<Credential>,
    /// Prior conversation turns, ending with the triggering user message.
    pub history: Vec<ChatTurn>,
}

/// Everything a run produced. The caller decides what to persist.
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub summary: LoopSummary,
    /// Assistant replies in order.
    pub replies: Vec<String>,
    pub usage: TokenUsage,
    /// Backend failure that ended the run, for the caller to classify.
    pub error: Option<BackendError>,
}

impl LoopOutcome {
    pub fn last_reply(&self) -> Option<&str> {
        self.replies.last().map(|s| s.as_str())
    }

    /// Final user-facing text: last reply followed by the summary.
    pub fn response_text(&self) -> String {
        match self.last_reply() {
            Some(reply) if !reply.trim().is_empty() => {
                format!("{}\n\n{}", reply.trim_end(), self.summary.text)
            }
            _ => self.summary.text.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct LoopState {
    iteration: u32,
    usage: TokenUsage,
    tools: Vec<String>,
    replies: Vec<String>,
}

impl LoopState {
    fn total_tokens(&self) -> u64 {
        self.usage.total_tokens
    }

    fn record(&mut self, usage: Option<&TokenUsage>, tools: impl Iterator<Item = String>) {
        if let Some(usage) = usage {
            self.usage.add(usage);
        }
        self.tools.extend(tools);
    }
}

/// Runs autonomous loops. Holds no conversation state of its own.
pub struct LoopController {
    backend: Arc<dyn ChatBackend>,
    notifier: Arc<dyn NotificationSink>,
    classifier: Arc<Classifier>,
    config: LoopConfig,
}

impl LoopController {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        notifier: Arc<dyn NotificationSink>,
        classifier: Arc<Classifier>,
        config: LoopConfig,
    ) -> Self {
        Self {
            backend,
            notifier,
            classifier,
            config,
        }
    }

    /// Run until a stop signal, a budget, or a backend failure. Never fails.
    pub async fn run(&self, request: LoopRequest) -> LoopOutcome {
        let conversation_id = request.conversation_id.clone();
        let mut history = request.history;
        let mut state = LoopState::default();
        let mut error = None;

        info!(
            conversation_id = %conversation_id,
            max_iterations = self.config.max_iterations,
            "Starting autonomous run"
        );

        let stop_reason = loop {
            if state.iteration >= self.config.max_iterations {
                break StopReason::IterationLimit {
                    max_iterations: self.config.max_iterations,
                };
            }
            if state.total_tokens() >= self.config.token_budget {
                break StopReason::TokenBudget {
                    budget: self.config.token_budget,
                };
            }

            if state.iteration > 0 {
                let pause = self.config.throttle(state.iteration);
                if !pause.is_zero() {
                    tokio::time::sleep(pause).await;
                }
            }
            state.iteration += 1;

            let chat = ChatRequest {
                history: self.window(&history),
                credential: request.credential.clone(),
                workspace_id: request.workspace_id.clone(),
                conversation_id: conversation_id.clone(),
            };
            let reply = match self.backend.chat(chat).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(
                        conversation_id = %conversation_id,
                        iteration = state.iteration,
                        "Backend failed during autonomous run: {}",
                        e
                    );
                    let message = e.message().to_string();
                    error = Some(e);
                    break StopReason::BackendFailure { message };
                }
            };

            state.record(
                reply.usage.as_ref(),
                reply.tool_calls.iter().map(|call| call.name.clone()),
            );
            history.push(ChatTurn::assistant(reply.message.clone()));
            state.replies.push(reply.message.clone());

            self.notifier.emit(
                &conversation_id,
                EventKind::AutonomousProgress {
                    iteration: state.iteration,
                    max_iterations: self.config.max_iterations,
                    total_tokens: state.total_tokens(),
                    tools: reply.tool_calls.iter().map(|c| c.name.clone()).collect(),
                },
            );

            if state.total_tokens() >= self.config.token_budget {
                break StopReason::TokenBudget {
                    budget: self.config.token_budget,
                };
            }

            let decision = self.classifier.decide(&reply.message, state.iteration);
            debug!(
                conversation_id = %conversation_id,
                iteration = state.iteration,
                rule = %decision.rule,
                outcome = ?decision.outcome,
                "Loop decision"
            );
            if !decision.outcome.continues() {
                break StopReason::Signal {
                    rule: decision.rule,
                    class: decision.class,
                };
            }

            history.push(ChatTurn::user(
                self.classifier
                    .continuation_prompt(state.iteration, decision.outcome),
            ));
        };

        let summary = summarize(&self.classifier, &state, stop_reason);
        info!(
            conversation_id = %conversation_id,
            iterations = summary.iterations,
            total_tokens = summary.total_tokens,
            tone = ?summary.tone,
            "Autonomous run finished: {}",
            summary.stop_reason.describe()
        );
        self.notifier.emit(
            &conversation_id,
            EventKind::AutonomousComplete {
                summary: summary.clone(),
            },
        );

        LoopOutcome {
            summary,
            replies: state.replies,
            usage: state.usage,
            error,
        }
    }

    /// System prompt plus the trailing window of turns.
    fn window(&self, history: &[ChatTurn]) -> Vec<ChatTurn> {
        let start = history.len().saturating_sub(self.config.history_window);
        let mut turns = Vec::with_capacity(history.len() - start + 1);
        turns.push(ChatTurn::system(AUTONOMOUS_SYSTEM_PROMPT));
        turns.extend_from_slice(&history[start..]);
        turns
    }
}

fn summarize(classifier: &Classifier, state: &LoopState, stop_reason: StopReason) -> LoopSummary {
    let mut tools_by_service: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for tool in &state.tools {
        tools_by_service
            .entry(classifier.tool_service(tool))
            .or_default()
            .insert(tool.clone());
    }

    let tone = stop_reason.tone();
    let plural = if state.iteration == 1 { "" } else { "s" };
    let mut text = match tone {
        Tone::Success => format!(
            "✅ Finished after {} iteration{} ({} tokens).",
            state.iteration,
            plural,
            state.total_tokens()
        ),
        Tone::NeedsInput => format!(
            "💬 Paused after {} iteration{}: your input is needed to continue.",
            state.iteration, plural
        ),
        Tone::Error => format!(
            "❌ Stopped after {} iteration{}: {}",
            state.iteration,
            plural,
            stop_reason.describe()
        ),
        Tone::Paused => format!(
            "⏸️ Paused after {} iteration{} ({}). Send another message to keep going.",
            state.iteration,
            plural,
            stop_reason.describe()
        ),
    };

    if !tools_by_service.is_empty() {
        let groups: Vec<String> = tools_by_service
            .iter()
            .map(|(service, tools)| {
                let names: Vec<&str> = tools.iter().map(|t| t.as_str()).collect();
                format!("{} ({})", service, names.join(", "))
            })
            .collect();
        text.push_str(&format!("\nTools used: {}", groups.join("; ")));
    }

    LoopSummary {
        iterations: state.iteration,
        total_tokens: state.total_tokens(),
        tools_by_service,
        stop_reason,
        tone,
        text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ChatReply, ToolCall, TurnRole};
    use crate::events::EventHub;
    use crate::mock::ScriptedBackend;

    fn controller(
        backend: Arc<ScriptedBackend>,
        hub: Arc<EventHub>,
        config: LoopConfig,
    ) -> LoopController {
        LoopController::new(
            backend,
            hub,
            Arc::new(Classifier::standard().unwrap()),
            config.unthrottled(),
        )
    }

    fn request(text: &str) -> LoopRequest {
        LoopRequest {
            conversation_id: "c1".into(),
            workspace_id: "ws".into(),
            credential: None,
            history: vec![ChatTurn::user(text)],
        }
    }

    const WORKING: &str =
        "Configuring the firewall rules for the new droplet, the next step is the load balancer.";

    #[test]
    fn test_throttle_curve() {
        let config = LoopConfig::default();
        assert_eq!(config.throttle(0), Duration::from_millis(1000));
        assert_eq!(config.throttle(3), Duration::from_millis(1600));
        assert_eq!(config.throttle(10), Duration::from_millis(3000));
        assert_eq!(config.throttle(50), Duration::from_millis(3000));
    }

    #[tokio::test]
    async fn test_stops_on_completion_with_tools_grouped() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_reply(
            ChatReply::text(WORKING)
                .with_tool(ToolCall::new("digitalocean_create_droplet", serde_json::json!({})))
                .with_usage(TokenUsage::new(100, 50)),
        );
        backend.push_reply(
            ChatReply::text("All set, the deployment completed successfully and the site is live.")
                .with_tool(ToolCall::new("digitalocean_create_droplet", serde_json::json!({})))
                .with_tool(ToolCall::new("cloudflare.upsert_record", serde_json::json!({})))
                .with_tool(ToolCall::new("run_health_check", serde_json::json!({})))
                .with_usage(TokenUsage::new(200, 50)),
        );
        let hub = Arc::new(EventHub::default());
        let outcome = controller(backend.clone(), hub.clone(), LoopConfig::default())
            .run(request("deploy my app"))
            .await;

        assert_eq!(outcome.summary.iterations, 2);
        assert_eq!(outcome.summary.total_tokens, 400);
        assert_eq!(outcome.summary.tone, Tone::Success);
        assert_eq!(outcome.summary.tools_by_service["digitalocean"].len(), 1);
        assert!(outcome.summary.tools_by_service.contains_key("cloudflare"));
        assert!(outcome.summary.tools_by_service["general"].contains("run_health_check"));
        assert!(outcome.error.is_none());

        let requests = backend.requests();
        assert_eq!(requests[0].history[0].role, TurnRole::System);
        assert_eq!(requests[0].history[0].content, AUTONOMOUS_SYSTEM_PROMPT);
        // Second call carries the first reply and a continuation prompt.
        let second = &requests[1].history;
        assert_eq!(second[second.len() - 2].content, WORKING);
        assert_eq!(second.last().unwrap().role, TurnRole::User);

        let names: Vec<&str> = hub
            .conversation_history("c1", 10)
            .iter()
            .map(|e| e.kind.name())
            .collect();
        assert_eq!(
            names,
            vec!["autonomous_progress", "autonomous_progress", "autonomous_complete"]
        );
    }

    #[tokio::test]
    async fn test_iteration_limit_bounds_endless_activity() {
        let backend = Arc::new(ScriptedBackend::new().with_fallback(ChatReply::text(WORKING)));
        let hub = Arc::new(EventHub::default());
        let outcome = controller(backend.clone(), hub, LoopConfig::default())
            .run(request("deploy"))
            .await;

        assert_eq!(outcome.summary.iterations, 10);
        assert_eq!(
            outcome.summary.stop_reason,
            StopReason::IterationLimit { max_iterations: 10 }
        );
        assert_eq!(outcome.summary.tone, Tone::Paused);
        assert_eq!(backend.requests().len(), 10);
    }

    #[tokio::test]
    async fn test_token_budget_bounds_run() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .with_fallback(ChatReply::text(WORKING).with_usage(TokenUsage::new(15_000, 5_000))),
        );
        let hub = Arc::new(EventHub::default());
        let outcome = controller(backend.clone(), hub, LoopConfig::default())
            .run(request("deploy"))
            .await;

        assert_eq!(outcome.summary.iterations, 3);
        assert_eq!(outcome.summary.total_tokens, 60_000);
        assert!(matches!(outcome.summary.stop_reason, StopReason::TokenBudget { .. }));
    }

    #[tokio::test]
    async fn test_backend_failure_ends_turn_without_error() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_reply(ChatReply::text(WORKING));
        backend.push_error(BackendError::Other("connection reset".into()));
        let outcome = controller(backend, Arc::new(EventHub::default()), LoopConfig::default())
            .run(request("deploy"))
            .await;

        assert_eq!(outcome.summary.iterations, 2);
        assert_eq!(outcome.summary.tone, Tone::Error);
        assert_eq!(outcome.error, Some(BackendError::Other("connection reset".into())));
        assert!(outcome.summary.text.contains("connection reset"));
        assert_eq!(outcome.replies.len(), 1);
    }

    #[tokio::test]
    async fn test_window_keeps_system_prompt_and_tail() {
        let backend = Arc::new(ScriptedBackend::new().with_fallback(ChatReply::text("Done.")));
        let config = LoopConfig {
            history_window: 2,
            ..LoopConfig::default()
        };
        let mut req = request("first");
        req.history.push(ChatTurn::assistant("second"));
        req.history.push(ChatTurn::user("third"));
        controller(backend.clone(), Arc::new(EventHub::default()), config)
            .run(req)
            .await;

        let requests = backend.requests();
        let sent = &requests[0].history;
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].role, TurnRole::System);
        assert_eq!(sent[1].content, "second");
        assert_eq!(sent[2].content, "third");
    }
}
