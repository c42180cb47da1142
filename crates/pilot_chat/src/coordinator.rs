//! Orchestration coordinator.
//!
//! Single owner of conversation and plan state. Every inbound message is
//! routed through a fixed priority:
//!
//! 1. a plan awaiting approval takes the reply,
//! 2. a short execute command re-runs the latest deployment request in one shot,
//! 3. a deployment request starts the autonomous loop,
//! 4. anything else is a single backend chat turn.
//!
//! Backend failures are classified once: recoverable provisioning failures go
//! to the recovery engine, everything else gets a fixed remediation message.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use pilot_core::{
    format_plan_for_approval, ApprovalDecision, Conversation, CoreError, Credential,
    ExecutionPlan, Message, PlanMachine, PlanStatus, StepDraft,
};

use crate::autonomous::{LoopController, LoopRequest};
use crate::backend::{
    BackendError, ChatBackend, ChatRequest, ChatTurn, ErrorCategory, PlanExecutionRequest,
    StepInvocation, TokenUsage, ToolExecutor,
};
use crate::classify::Classifier;
use crate::config::PilotConfig;
use crate::error::{ChatError, ChatResult};
use crate::events::{ConversationEvent, EventKind, NotificationSink, WorkflowProgress};
use crate::recovery::{RecoveryEngine, RecoveryRequest, RecoverySession};
use crate::remediation::{remediation_for, SuggestedAction};
use crate::store::ConversationStore;

/// Kind of reply returned to the caller
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    Text,
    Error,
    RecoveryStarted,
}

/// Structured data attached to a reply
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: serde_json::Value,
}

/// Reply to an inbound message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub message: String,
    pub response_type: ResponseType,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_actions: Option<Vec<SuggestedAction>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_id: Option<String>,
}

impl Response {
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            response_type: ResponseType::Text,
            attachments: Vec::new(),
            suggested_actions: None,
            usage: None,
            recovery_id: None,
        }
    }

    pub fn error(message: impl Into<String>, actions: Vec<SuggestedAction>) -> Self {
        Self {
            response_type: ResponseType::Error,
            suggested_actions: Some(actions),
            ..Self::text(message)
        }
    }

    pub fn recovery_started(message: impl Into<String>, recovery_id: impl Into<String>) -> Self {
        Self {
            response_type: ResponseType::RecoveryStarted,
            recovery_id: Some(recovery_id.into()),
            ..Self::text(message)
        }
    }

    pub fn with_attachment(mut self, kind: impl Into<String>, data: impl Serialize) -> Self {
        if let Ok(data) = serde_json::to_value(data) {
            self.attachments.push(Attachment {
                kind: kind.into(),
                data,
            });
        }
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Marks a conversation as driven by an autonomous loop until dropped.
#[derive(Debug)]
struct LoopGuard {
    loops: Arc<Mutex<HashSet<String>>>,
    conversation_id: String,
}

impl LoopGuard {
    fn acquire(loops: &Arc<Mutex<HashSet<String>>>, conversation_id: &str) -> ChatResult<Self> {
        if !loops.lock().insert(conversation_id.to_string()) {
            return Err(ChatError::Busy {
                conversation_id: conversation_id.to_string(),
                reason: "an autonomous run is already in progress".to_string(),
            });
        }
        Ok(Self {
            loops: Arc::clone(loops),
            conversation_id: conversation_id.to_string(),
        })
    }
}

impl Drop for LoopGuard {
    fn drop(&mut self) {
        self.loops.lock().remove(&self.conversation_id);
    }
}

struct Inner {
    store: ConversationStore,
    plans: Mutex<PlanMachine>,
    active_loops: Arc<Mutex<HashSet<String>>>,
    backend: Arc<dyn ChatBackend>,
    executor: Arc<dyn ToolExecutor>,
    notifier: Arc<dyn NotificationSink>,
    classifier: Arc<Classifier>,
    loops: LoopController,
    recovery: RecoveryEngine,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    history_window: usize,
}

/// Per-conversation message router. Cheap to clone.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    /// Build a coordinator with the rule book named by the configuration.
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        executor: Arc<dyn ToolExecutor>,
        notifier: Arc<dyn NotificationSink>,
        config: &PilotConfig,
    ) -> ChatResult<Self> {
        let classifier = Arc::new(Classifier::new(config.rule_book()?)?);
        Ok(Self::with_classifier(backend, executor, notifier, classifier, config))
    }

    pub fn with_classifier(
        backend: Arc<dyn ChatBackend>,
        executor: Arc<dyn ToolExecutor>,
        notifier: Arc<dyn NotificationSink>,
        classifier: Arc<Classifier>,
        config: &PilotConfig,
    ) -> Self {
        let loops = LoopController::new(
            Arc::clone(&backend),
            Arc::clone(&notifier),
            Arc::clone(&classifier),
            config.autonomous.clone(),
        );
        let recovery = RecoveryEngine::new(
            Arc::clone(&backend),
            Arc::clone(&executor),
            Arc::clone(&notifier),
            config.recovery.clone(),
        );
        Self {
            inner: Arc::new(Inner {
                store: ConversationStore::new(),
                plans: Mutex::new(PlanMachine::new()),
                active_loops: Arc::new(Mutex::new(HashSet::new())),
                backend,
                executor,
                notifier,
                classifier,
                loops,
                recovery,
                tasks: Mutex::new(Vec::new()),
                history_window: config.autonomous.history_window,
            }),
        }
    }

    /// Open a new conversation.
    pub fn start_conversation(&self, workspace_id: &str, user_id: &str) -> Conversation {
        let conversation = self.inner.store.create(workspace_id, user_id);
        info!(conversation_id = %conversation.id, workspace_id, user_id, "Conversation started");
        conversation
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<Conversation> {
        self.inner.store.get(conversation_id)
    }

    pub fn plan(&self, plan_id: &str) -> Option<ExecutionPlan> {
        self.inner.plans.lock().get(plan_id).cloned()
    }

    /// The plan holding the conversation's approval/execution slot.
    pub fn active_plan(&self, conversation_id: &str) -> Option<ExecutionPlan> {
        self.inner.plans.lock().active_plan(conversation_id).cloned()
    }

    pub fn recovery_session(&self, recovery_id: &str) -> Option<RecoverySession> {
        self.inner.recovery.session(recovery_id)
    }

    /// Recovery sessions started for a conversation, oldest first.
    pub fn recovery_sessions(&self, conversation_id: &str) -> Vec<RecoverySession> {
        let mut sessions = self.inner.recovery.sessions_for(conversation_id);
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    pub fn subscribe(&self, conversation_id: &str) -> broadcast::Receiver<ConversationEvent> {
        self.inner.notifier.create_event_stream(conversation_id)
    }

    pub fn event_history(&self, conversation_id: &str, limit: usize) -> Vec<ConversationEvent> {
        self.inner.notifier.conversation_history(conversation_id, limit)
    }

    pub fn classifier(&self) -> &Classifier {
        &self.inner.classifier
    }

    /// Handle one inbound user message.
    pub async fn process_message(
        &self,
        conversation_id: &str,
        text: &str,
        credential: Option<Credential>,
    ) -> ChatResult<Response> {
        let conversation = self.inner.store.require(conversation_id)?;
        let message = Message::user(conversation_id, text).with_credential(credential.clone());
        self.inner
            .store
            .update(conversation_id, |c| c.append(message.clone()))?;
        self.inner.notifier.send_conversation_message(&message);

        self.typing(conversation_id, true);
        let result = self.dispatch(&conversation, text, credential).await;
        self.typing(conversation_id, false);

        if let Err(e) = &result {
            warn!(conversation_id, "Message rejected: {}", e);
        }
        result
    }

    /// Create a plan, put it up for approval and post it to the conversation.
    ///
    /// A plan may be proposed while an autonomous run is in progress, but it
    /// cannot be approved until that run returns.
    pub fn propose_plan(
        &self,
        conversation_id: &str,
        objective: &str,
        steps: Vec<StepDraft>,
    ) -> ChatResult<ExecutionPlan> {
        let conversation = self.inner.store.require(conversation_id)?;

        let plan = {
            let mut plans = self.inner.plans.lock();
            let draft = plans.create_plan(
                conversation_id,
                &conversation.user_id,
                &conversation.workspace_id,
                objective,
                steps,
            )?;
            match plans.request_approval(&draft.id) {
                Ok(plan) => plan,
                Err(e) => {
                    let _ = plans.cancel_plan(&draft.id);
                    return Err(e.into());
                }
            }
        };

        self.inner.store.update(conversation_id, |c| {
            c.active_workflows.insert(plan.id.clone());
        })?;
        self.post(conversation_id, format_plan_for_approval(&plan))?;
        self.inner
            .notifier
            .send_workflow_progress(conversation_id, WorkflowProgress::of(&plan));
        Ok(plan)
    }

    /// Cancel a plan, releasing its conversation's slot.
    pub fn cancel_plan(&self, plan_id: &str) -> ChatResult<ExecutionPlan> {
        let plan = self.inner.plans.lock().cancel_plan(plan_id)?;
        self.release_workflow(&plan)?;
        self.inner
            .notifier
            .send_workflow_progress(&plan.conversation_id, WorkflowProgress::of(&plan));
        self.post(
            &plan.conversation_id,
            format!(
                "🛑 Plan cancelled: {} ({}/{} steps completed).",
                plan.objective,
                plan.completed_steps(),
                plan.steps.len()
            ),
        )?;
        Ok(plan)
    }

    /// Wait for background plan executions and recovery follow-ups.
    pub async fn settle(&self) {
        loop {
            let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
            if tasks.is_empty() {
                break;
            }
            for task in tasks {
                if let Err(e) = task.await {
                    warn!("Background task ended abnormally: {}", e);
                }
            }
        }
    }

    /// Stop background work and drop all in-memory state.
    pub fn shutdown(&self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.recovery.shutdown();
        self.inner.plans.lock().clear();
        self.inner.active_loops.lock().clear();
        self.inner.store.clear();
        info!("Coordinator shut down");
    }

    async fn dispatch(
        &self,
        conversation: &Conversation,
        text: &str,
        credential: Option<Credential>,
    ) -> ChatResult<Response> {
        let conversation_id = conversation.id.as_str();

        let pending = self.inner.plans.lock().pending_approval(conversation_id).cloned();
        if let Some(plan) = pending {
            debug!(conversation_id, plan_id = %plan.id, "Routing to approval handler");
            return self.handle_approval(conversation, plan, text, credential);
        }

        if self.inner.classifier.is_execute_command(text) {
            let request = conversation
                .last_user_message_where(|t| self.inner.classifier.is_deployment_request(t))
                .map(|m| m.content.clone());
            if let Some(request) = request {
                debug!(conversation_id, "Routing to one-shot execution");
                return self.execute_request(conversation, &request, credential).await;
            }
        }

        if self.inner.classifier.is_deployment_request(text) {
            debug!(conversation_id, "Routing to autonomous loop");
            return self.run_autonomous(conversation, text, credential).await;
        }

        debug!(conversation_id, "Routing to plain chat");
        self.chat_turn(conversation, text, credential).await
    }

    fn handle_approval(
        &self,
        conversation: &Conversation,
        plan: ExecutionPlan,
        text: &str,
        credential: Option<Credential>,
    ) -> ChatResult<Response> {
        let conversation_id = conversation.id.as_str();
        match self.inner.classifier.approval(text) {
            ApprovalDecision::Approve => {
                self.ensure_no_loop(conversation_id)?;
                let approved = self.inner.plans.lock().approve_plan(&plan.id);
                let plan = match approved {
                    Ok(plan) => plan,
                    Err(CoreError::NotFound(_)) => {
                        let message = "That plan is no longer waiting for approval.".to_string();
                        self.post(conversation_id, message.clone())?;
                        return Ok(Response::text(message));
                    }
                    Err(e) => return Err(e.into()),
                };

                self.spawn_execution(conversation, plan.id.clone(), credential);
                let message = format!(
                    "✅ Plan approved. Starting execution of {} step{}: {}",
                    plan.steps.len(),
                    if plan.steps.len() == 1 { "" } else { "s" },
                    plan.objective
                );
                self.post(conversation_id, message.clone())?;
                Ok(Response::text(message).with_attachment("execution_plan", &plan))
            }
            ApprovalDecision::Reject => {
                let plan = self.inner.plans.lock().cancel_plan(&plan.id)?;
                self.release_workflow(&plan)?;
                self.inner
                    .notifier
                    .send_workflow_progress(conversation_id, WorkflowProgress::of(&plan));
                let message = "🛑 Plan cancelled. Nothing was executed.".to_string();
                self.post(conversation_id, message.clone())?;
                Ok(Response::text(message))
            }
            ApprovalDecision::Modify => {
                let message = "✏️ Got it, you'd like changes. Reply \"no\" to cancel this plan \
                    and describe what you want instead, or \"yes\" to run it as is."
                    .to_string();
                self.post(conversation_id, message.clone())?;
                Ok(Response::text(message).with_attachment("execution_plan", &plan))
            }
            ApprovalDecision::Unclear => {
                let message = format!(
                    "I didn't catch whether you want to run this plan.\n\n{}",
                    format_plan_for_approval(&plan)
                );
                self.post(conversation_id, message.clone())?;
                Ok(Response::text(message).with_attachment("execution_plan", &plan))
            }
        }
    }

    async fn execute_request(
        &self,
        conversation: &Conversation,
        request_text: &str,
        credential: Option<Credential>,
    ) -> ChatResult<Response> {
        let conversation_id = conversation.id.as_str();
        self.ensure_no_loop(conversation_id)?;

        let request = PlanExecutionRequest {
            conversation_id: conversation_id.to_string(),
            user_id: conversation.user_id.clone(),
            workspace_id: conversation.workspace_id.clone(),
            credential: credential.clone(),
            request_text: request_text.to_string(),
        };
        match self.inner.executor.execute_plan(request).await {
            Ok(plan) => {
                info!(
                    conversation_id,
                    plan_id = %plan.id,
                    status = plan.status.as_str(),
                    "One-shot execution finished"
                );
                self.inner.store.update(conversation_id, |c| {
                    if !plan.status.is_terminal() {
                        c.active_workflows.insert(plan.id.clone());
                    }
                })?;
                self.inner
                    .notifier
                    .send_workflow_progress(conversation_id, WorkflowProgress::of(&plan));
                let message = format!(
                    "Executed \"{}\": {} ({}/{} steps completed).",
                    plan.objective,
                    plan.status.as_str(),
                    plan.completed_steps(),
                    plan.steps.len()
                );
                self.post(conversation_id, message.clone())?;
                Ok(Response::text(message).with_attachment("execution_plan", &plan))
            }
            Err(e) => self.handle_backend_error(conversation, request_text, e, credential),
        }
    }

    async fn run_autonomous(
        &self,
        conversation: &Conversation,
        text: &str,
        credential: Option<Credential>,
    ) -> ChatResult<Response> {
        let conversation_id = conversation.id.as_str();
        let _guard = LoopGuard::acquire(&self.inner.active_loops, conversation_id)?;

        let request = LoopRequest {
            conversation_id: conversation_id.to_string(),
            workspace_id: conversation.workspace_id.clone(),
            credential: credential.clone(),
            history: self.history(conversation, text),
        };
        let outcome = self.inner.loops.run(request).await;

        let summary = serde_json::to_value(&outcome.summary).unwrap_or_default();
        self.inner.store.update(conversation_id, |c| {
            c.context
                .agent_state
                .insert("autonomous".to_string(), summary);
        })?;

        if let Some(e) = outcome.error.clone() {
            return self.handle_backend_error(conversation, text, e, credential);
        }

        let message = outcome.response_text();
        self.post(conversation_id, message.clone())?;
        Ok(Response::text(message)
            .with_usage(outcome.usage)
            .with_attachment("autonomous_summary", &outcome.summary))
    }

    async fn chat_turn(
        &self,
        conversation: &Conversation,
        text: &str,
        credential: Option<Credential>,
    ) -> ChatResult<Response> {
        let conversation_id = conversation.id.as_str();
        let request = ChatRequest {
            history: self.history(conversation, text),
            credential: credential.clone(),
            workspace_id: conversation.workspace_id.clone(),
            conversation_id: conversation_id.to_string(),
        };
        match self.inner.backend.chat(request).await {
            Ok(reply) => {
                self.post(conversation_id, reply.message.clone())?;
                let mut response = Response::text(reply.message);
                if let Some(usage) = reply.usage {
                    response = response.with_usage(usage);
                }
                Ok(response)
            }
            Err(e) => self.handle_backend_error(conversation, text, e, credential),
        }
    }

    /// Recovery for provisioning failures, remediation for everything else.
    fn handle_backend_error(
        &self,
        conversation: &Conversation,
        input: &str,
        error: BackendError,
        credential: Option<Credential>,
    ) -> ChatResult<Response> {
        let conversation_id = conversation.id.as_str();
        let category = self.inner.classifier.categorize(&error);
        warn!(conversation_id, category = ?category, "Backend error: {}", error.message());

        if let Some(failure) = self.inner.classifier.provisioning_failure(&error, input) {
            let recovery_id = self.inner.recovery.start_recovery(RecoveryRequest {
                conversation_id: conversation_id.to_string(),
                workspace_id: conversation.workspace_id.clone(),
                user_id: conversation.user_id.clone(),
                error: error.message().to_string(),
                provider: failure.provider.clone(),
                operation: failure.operation.clone(),
                params: failure.params.clone(),
                credential,
            });
            self.inner.store.update(conversation_id, |c| {
                c.context
                    .pending_operations
                    .push(pending_recovery(&recovery_id));
            })?;
            self.spawn_recovery_followup(conversation_id, recovery_id.clone());

            let message = format!(
                "🔧 The {} step on {} failed ({}). \
                 I'm attempting an automatic recovery and will report back.",
                failure.operation,
                failure.provider,
                error.message()
            );
            self.post(conversation_id, message.clone())?;
            return Ok(Response::recovery_started(message, recovery_id)
                .with_attachment("provisioning_failure", &failure));
        }

        if category == ErrorCategory::Internal {
            error!(conversation_id, "Unclassified backend failure: {}", error.message());
            self.inner.store.update(conversation_id, |c| c.mark_error())?;
        }

        let remediation = remediation_for(category, &error);
        self.post(conversation_id, remediation.message.clone())?;
        Ok(Response::error(remediation.message, remediation.actions))
    }

    fn spawn_execution(
        &self,
        conversation: &Conversation,
        plan_id: String,
        credential: Option<Credential>,
    ) {
        let recorded = self.inner.store.update(&conversation.id, |c| {
            c.active_workflows.insert(plan_id.clone());
        });
        if let Err(e) = recorded {
            warn!(plan_id = %plan_id, "Could not record workflow: {}", e);
        }

        let coordinator = self.clone();
        let conversation = conversation.clone();
        let handle = tokio::spawn(async move {
            coordinator.run_plan(&conversation, &plan_id, credential).await;
        });
        self.inner.tasks.lock().push(handle);
    }

    /// Drive an approved plan step by step, stopping at the first failure.
    /// A cancelled plan stops before its next step.
    async fn run_plan(
        &self,
        conversation: &Conversation,
        plan_id: &str,
        credential: Option<Credential>,
    ) {
        let conversation_id = conversation.id.as_str();
        let Some(plan) = self.plan(plan_id) else {
            return;
        };
        let notifier = &self.inner.notifier;
        notifier.emit(
            conversation_id,
            EventKind::ExecutionStarted {
                plan_id: plan.id.clone(),
                objective: plan.objective.clone(),
                total_steps: plan.steps.len(),
            },
        );

        loop {
            let started = {
                let mut plans = self.inner.plans.lock();
                let next = plans
                    .get(plan_id)
                    .filter(|p| !p.status.is_terminal())
                    .and_then(|p| p.next_pending())
                    .map(|(index, step)| (index, step.id.clone()));
                next.map(|(index, step_id)| (index, plans.execute_step(plan_id, &step_id)))
            };
            let Some((index, started)) = started else {
                break;
            };
            let step = match started {
                Ok(step) => step,
                Err(e) => {
                    warn!(plan_id, "Could not start step {}: {}", index + 1, e);
                    if let Err(err) = self.inner.plans.lock().fail_plan(plan_id) {
                        warn!(plan_id, "Could not mark plan failed: {}", err);
                    }
                    break;
                }
            };
            notifier.emit(
                conversation_id,
                EventKind::ExecutionStepStarted {
                    plan_id: plan_id.to_string(),
                    step_id: step.id.clone(),
                    index,
                    description: step.description.clone(),
                },
            );
            self.publish_progress(conversation_id, plan_id);

            let invocation = StepInvocation {
                conversation_id: conversation_id.to_string(),
                workspace_id: conversation.workspace_id.clone(),
                user_id: conversation.user_id.clone(),
                step: step.clone(),
                credential: credential.clone(),
            };
            match self.inner.executor.execute_step(invocation).await {
                Ok(result) => {
                    let recorded = self
                        .inner
                        .plans
                        .lock()
                        .complete_step(plan_id, &step.id, result.clone());
                    if let Err(e) = recorded {
                        warn!(plan_id, step_id = %step.id, "Could not record step result: {}", e);
                    }
                    notifier.emit(
                        conversation_id,
                        EventKind::ExecutionStepCompleted {
                            plan_id: plan_id.to_string(),
                            step_id: step.id.clone(),
                            index,
                            result,
                        },
                    );
                }
                Err(e) => {
                    let recorded = self
                        .inner
                        .plans
                        .lock()
                        .fail_step(plan_id, &step.id, e.message());
                    if let Err(err) = recorded {
                        warn!(
                            plan_id,
                            step_id = %step.id,
                            "Could not record step failure: {}",
                            err
                        );
                    }
                    notifier.emit(
                        conversation_id,
                        EventKind::ExecutionStepFailed {
                            plan_id: plan_id.to_string(),
                            step_id: step.id.clone(),
                            index,
                            error: e.message().to_string(),
                        },
                    );
                    break;
                }
            }
        }

        let Some(plan) = self.plan(plan_id) else {
            return;
        };
        notifier.emit(
            conversation_id,
            EventKind::ExecutionCompleted {
                plan_id: plan.id.clone(),
                status: plan.status,
                completed_steps: plan.completed_steps(),
                total_steps: plan.steps.len(),
            },
        );
        notifier.send_workflow_progress(conversation_id, WorkflowProgress::of(&plan));

        let message = match plan.status {
            PlanStatus::Completed => format!(
                "✅ Plan completed: {} ({} steps).",
                plan.objective,
                plan.steps.len()
            ),
            PlanStatus::Cancelled => format!(
                "🛑 Plan cancelled after {} of {} steps.",
                plan.completed_steps(),
                plan.steps.len()
            ),
            PlanStatus::Failed => format!(
                "❌ Plan failed: {} ({}/{} steps completed).",
                plan.objective,
                plan.completed_steps(),
                plan.steps.len()
            ),
            _ => {
                let failure = plan
                    .failed_step()
                    .map(|s| {
                        format!(
                            " at \"{}\": {}",
                            s.description,
                            s.error.as_deref().unwrap_or("unknown error")
                        )
                    })
                    .unwrap_or_default();
                format!(
                    "⏹️ Execution stopped{}. {}/{} steps completed. \
                     The plan stays open until you cancel it.",
                    failure,
                    plan.completed_steps(),
                    plan.steps.len()
                )
            }
        };
        info!(plan_id, status = plan.status.as_str(), "Plan execution finished");
        if plan.status.is_terminal() {
            if let Err(e) = self.release_workflow(&plan) {
                warn!(plan_id, "Could not release workflow: {}", e);
            }
        }
        if let Err(e) = self.post(conversation_id, message) {
            warn!(plan_id, "Could not post execution result: {}", e);
        }
    }

    fn spawn_recovery_followup(&self, conversation_id: &str, recovery_id: String) {
        let coordinator = self.clone();
        let conversation_id = conversation_id.to_string();
        let handle = tokio::spawn(async move {
            let Some(session) = coordinator.inner.recovery.join(&recovery_id).await else {
                return;
            };
            let pending = pending_recovery(&recovery_id);
            let updated = coordinator.inner.store.update(&conversation_id, |c| {
                c.context.pending_operations.retain(|op| op != &pending);
            });
            if updated.is_ok() {
                if let Err(e) = coordinator.post(&conversation_id, session.outcome_message()) {
                    warn!(recovery_id = %recovery_id, "Could not post recovery result: {}", e);
                }
            }
        });
        self.inner.tasks.lock().push(handle);
    }

    fn publish_progress(&self, conversation_id: &str, plan_id: &str) {
        if let Some(plan) = self.plan(plan_id) {
            self.inner
                .notifier
                .send_workflow_progress(conversation_id, WorkflowProgress::of(&plan));
        }
    }

    fn release_workflow(&self, plan: &ExecutionPlan) -> ChatResult<()> {
        self.inner.store.update(&plan.conversation_id, |c| {
            c.active_workflows.remove(&plan.id);
        })
    }

    fn ensure_no_loop(&self, conversation_id: &str) -> ChatResult<()> {
        if self.inner.active_loops.lock().contains(conversation_id) {
            return Err(ChatError::Busy {
                conversation_id: conversation_id.to_string(),
                reason: "an autonomous run is in progress".to_string(),
            });
        }
        Ok(())
    }

    /// Trailing window of the conversation plus the new user turn.
    fn history(&self, conversation: &Conversation, text: &str) -> Vec<ChatTurn> {
        let mut turns: Vec<ChatTurn> = conversation
            .recent(self.inner.history_window)
            .iter()
            .map(ChatTurn::from)
            .collect();
        turns.push(ChatTurn::user(text));
        turns
    }

    /// Append an assistant message and notify subscribers.
    fn post(&self, conversation_id: &str, content: String) -> ChatResult<Message> {
        let message = Message::assistant(conversation_id, content);
        self.inner
            .store
            .update(conversation_id, |c| c.append(message.clone()))?;
        self.inner.notifier.send_conversation_message(&message);
        Ok(message)
    }

    fn typing(&self, conversation_id: &str, typing: bool) {
        self.inner
            .notifier
            .emit(conversation_id, EventKind::TypingStatus { typing });
    }
}

fn pending_recovery(recovery_id: &str) -> String {
    format!("recovery:{}", recovery_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_wire_format() {
        let response = Response::recovery_started("fixing", "r1")
            .with_attachment("note", serde_json::json!({"a": 1}));
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["response_type"], "recovery_started");
        assert_eq!(json["recovery_id"], "r1");
        assert_eq!(json["attachments"][0]["type"], "note");
        assert!(json.get("suggested_actions").is_none());
    }

    #[test]
    fn test_loop_guard_is_exclusive_and_released() {
        let loops = Arc::new(Mutex::new(HashSet::new()));
        let guard = LoopGuard::acquire(&loops, "c1").unwrap();
        assert!(LoopGuard::acquire(&loops, "c1").unwrap_err().is_conflict());
        assert!(LoopGuard::acquire(&loops, "c2").is_ok());
        drop(guard);
        assert!(LoopGuard::acquire(&loops, "c1").is_ok());
    }
}
