//! Error recovery engine.
//!
//! Retries a failed provisioning operation a bounded number of times,
//! asking the backend for adjusted parameters before each retry, and
//! escalates to the user with manual remediation guidance when the
//! attempts run out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use pilot_core::{Credential, ExecutionStep, StepDraft};

use crate::backend::{ChatBackend, ChatRequest, ChatTurn, StepInvocation, ToolExecutor};
use crate::classify::extract_json_object;
use crate::events::{EventKind, NotificationSink};

const ANALYSIS_PROMPT: &str = "You are an infrastructure recovery assistant. \
Given a failed provisioning operation, explain the most likely cause in one or two sentences, \
then give a corrected parameter set as a single JSON object. Only change what is needed.";

/// Retry policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RecoveryConfig {
    pub max_attempts: u32,
    /// Pause between a failed attempt and the next one.
    pub retry_delay_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_ms: 1000,
        }
    }
}

/// Recovery session lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    Analyzing,
    Retrying,
    Succeeded,
    Escalated,
}

impl RecoveryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Escalated)
    }
}

/// One bounded retry workflow for a provisioning failure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecoverySession {
    pub id: String,
    pub conversation_id: String,
    pub provider: String,
    pub operation: String,
    /// Parameters of the failed call
    pub original_params: serde_json::Value,
    /// Parameters used by the latest attempt
    pub params: serde_json::Value,
    pub attempts: u32,
    pub status: RecoveryStatus,
    pub last_error: String,
    /// Result of the successful retry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Guidance shown on escalation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub guidance: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RecoverySession {
    /// User-facing line describing how the session ended.
    pub fn outcome_message(&self) -> String {
        match self.status {
            RecoveryStatus::Succeeded => format!(
                "✅ Recovered: {} on {} succeeded after {} attempt{}.",
                self.operation,
                self.provider,
                self.attempts,
                if self.attempts == 1 { "" } else { "s" }
            ),
            RecoveryStatus::Escalated => {
                let mut text = format!(
                    "⚠️ I couldn't recover {} on {} after {} attempt{}. \
                     Last error: {}\n\nTo fix it manually:",
                    self.operation,
                    self.provider,
                    self.attempts,
                    if self.attempts == 1 { "" } else { "s" },
                    self.last_error
                );
                for line in &self.guidance {
                    text.push_str("\n- ");
                    text.push_str(line);
                }
                text
            }
            _ => format!(
                "🔧 Recovering {} on {} (attempt {}).",
                self.operation, self.provider, self.attempts
            ),
        }
    }
}

/// Everything needed to retry a failed operation.
#[derive(Debug, Clone)]
pub struct RecoveryRequest {
    pub conversation_id: String,
    pub workspace_id: String,
    pub user_id: String,
    pub error: String,
    pub provider: String,
    pub operation: String,
    pub params: serde_json::Value,
    pub credential: Option<Credential>,
}

/// Runs recovery sessions on background tasks.
#[derive(Clone)]
pub struct RecoveryEngine {
    backend: Arc<dyn ChatBackend>,
    executor: Arc<dyn ToolExecutor>,
    notifier: Arc<dyn NotificationSink>,
    config: RecoveryConfig,
    sessions: Arc<RwLock<HashMap<String, RecoverySession>>>,
    tasks: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl RecoveryEngine {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        executor: Arc<dyn ToolExecutor>,
        notifier: Arc<dyn NotificationSink>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            backend,
            executor,
            notifier,
            config,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Open a session and start retrying in the background.
    ///
    /// Returns the session id immediately. Must be called from within a
    /// tokio runtime.
    pub fn start_recovery(&self, request: RecoveryRequest) -> String {
        let now = Utc::now();
        let session = RecoverySession {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: request.conversation_id.clone(),
            provider: request.provider.clone(),
            operation: request.operation.clone(),
            original_params: request.params.clone(),
            params: request.params.clone(),
            attempts: 0,
            status: RecoveryStatus::Analyzing,
            last_error: request.error.clone(),
            result: None,
            guidance: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        let id = session.id.clone();
        self.sessions.write().insert(id.clone(), session);

        info!(
            recovery_id = %id,
            conversation_id = %request.conversation_id,
            provider = %request.provider,
            operation = %request.operation,
            "Starting recovery"
        );
        self.notifier.emit(
            &request.conversation_id,
            EventKind::RecoveryStarted {
                recovery_id: id.clone(),
                provider: request.provider.clone(),
                operation: request.operation.clone(),
            },
        );

        let engine = self.clone();
        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            engine.drive(&task_id, request).await;
        });
        self.tasks.lock().insert(id.clone(), handle);
        id
    }

    pub fn session(&self, id: &str) -> Option<RecoverySession> {
        self.sessions.read().get(id).cloned()
    }

    pub fn sessions_for(&self, conversation_id: &str) -> Vec<RecoverySession> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    /// Wait for a session's background task and return its final state.
    pub async fn join(&self, id: &str) -> Option<RecoverySession> {
        let handle = self.tasks.lock().remove(id);
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(recovery_id = %id, "Recovery task ended abnormally: {}", e);
            }
        }
        self.session(id)
    }

    /// Abort every running session task.
    pub fn shutdown(&self) {
        for (id, handle) in self.tasks.lock().drain() {
            debug!(recovery_id = %id, "Aborting recovery task");
            handle.abort();
        }
    }

    async fn drive(&self, id: &str, request: RecoveryRequest) {
        let max_attempts = self.config.max_attempts.max(1);
        let mut params = request.params.clone();
        let mut last_error = request.error.clone();

        for attempt in 1..=max_attempts {
            self.update(id, |s| {
                s.attempts = attempt;
                s.status = RecoveryStatus::Analyzing;
            });
            self.progress(&request, id, attempt, max_attempts, format!(
                "Analyzing the {} failure on {} (attempt {}/{})",
                request.operation, request.provider, attempt, max_attempts
            ));

            if let Some(adjusted) = self.analyze(&request, &params, &last_error).await {
                merge_params(&mut params, adjusted);
            }

            self.update(id, |s| {
                s.status = RecoveryStatus::Retrying;
                s.params = params.clone();
            });
            self.progress(&request, id, attempt, max_attempts, format!(
                "Retrying {} on {} with adjusted parameters",
                request.operation, request.provider
            ));

            match self.executor.execute_step(self.invocation(&request, &params)).await {
                Ok(result) => {
                    info!(recovery_id = %id, attempt, "Recovery succeeded");
                    self.update(id, |s| {
                        s.status = RecoveryStatus::Succeeded;
                        s.result = Some(result);
                    });
                    self.notifier.emit(
                        &request.conversation_id,
                        EventKind::RecoverySuccess {
                            recovery_id: id.to_string(),
                            attempts: attempt,
                            message: format!(
                                "{} on {} succeeded after recovery",
                                request.operation, request.provider
                            ),
                        },
                    );
                    return;
                }
                Err(e) => {
                    warn!(recovery_id = %id, attempt, "Recovery attempt failed: {}", e);
                    last_error = e.message().to_string();
                    self.update(id, |s| s.last_error = last_error.clone());
                    if e.is_credential() {
                        break;
                    }
                }
            }

            if attempt < max_attempts && self.config.retry_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
            }
        }

        let guidance = guidance(&request.provider, &request.operation, &params);
        let attempts = self.session(id).map(|s| s.attempts).unwrap_or(max_attempts);
        warn!(recovery_id = %id, attempts, "Recovery escalated");
        self.update(id, |s| {
            s.status = RecoveryStatus::Escalated;
            s.guidance = guidance.clone();
        });
        self.notifier.emit(
            &request.conversation_id,
            EventKind::RecoveryEscalated {
                recovery_id: id.to_string(),
                attempts,
                message: format!(
                    "Automatic recovery of {} on {} failed: {}",
                    request.operation, request.provider, last_error
                ),
                guidance,
            },
        );
    }

    /// Ask the backend for adjusted parameters. Failures are logged and ignored.
    async fn analyze(
        &self,
        request: &RecoveryRequest,
        params: &serde_json::Value,
        error: &str,
    ) -> Option<serde_json::Value> {
        let prompt = format!(
            "Provider: {}\nOperation: {}\nParameters: {}\nError: {}",
            request.provider, request.operation, params, error
        );
        let chat = ChatRequest {
            history: vec![ChatTurn::system(ANALYSIS_PROMPT), ChatTurn::user(prompt)],
            credential: request.credential.clone(),
            workspace_id: request.workspace_id.clone(),
            conversation_id: request.conversation_id.clone(),
        };
        match self.backend.chat(chat).await {
            Ok(reply) => extract_json_object(&reply.message),
            Err(e) => {
                debug!("Recovery analysis unavailable: {}", e);
                None
            }
        }
    }

    fn invocation(&self, request: &RecoveryRequest, params: &serde_json::Value) -> StepInvocation {
        let mut draft = StepDraft::new(
            request.provider.as_str(),
            request.operation.as_str(),
            format!("Retry {} on {}", request.operation, request.provider),
        );
        if let Some(map) = params.as_object() {
            for (key, value) in map {
                draft = draft.param(key.as_str(), value.clone());
            }
        }
        StepInvocation {
            conversation_id: request.conversation_id.clone(),
            workspace_id: request.workspace_id.clone(),
            user_id: request.user_id.clone(),
            step: ExecutionStep::from(draft),
            credential: request.credential.clone(),
        }
    }

    fn progress(
        &self,
        request: &RecoveryRequest,
        id: &str,
        attempt: u32,
        max_attempts: u32,
        message: String,
    ) {
        self.notifier.emit(
            &request.conversation_id,
            EventKind::RecoveryProgress {
                recovery_id: id.to_string(),
                attempt,
                max_attempts,
                message,
            },
        );
    }

    fn update(&self, id: &str, f: impl FnOnce(&mut RecoverySession)) {
        if let Some(session) = self.sessions.write().get_mut(id) {
            f(session);
            session.updated_at = Utc::now();
        }
    }
}

fn merge_params(params: &mut serde_json::Value, adjusted: serde_json::Value) {
    match (params.as_object_mut(), adjusted) {
        (Some(base), serde_json::Value::Object(changes)) => {
            for (key, value) in changes {
                base.insert(key, value);
            }
        }
        (_, adjusted) => *params = adjusted,
    }
}

fn console_url(provider: &str) -> Option<&'static str> {
    match provider {
        "digitalocean" => Some("https://cloud.digitalocean.com"),
        "aws" => Some("https://console.aws.amazon.com"),
        "gcp" => Some("https://console.cloud.google.com"),
        "azure" => Some("https://portal.azure.com"),
        _ => None,
    }
}

/// Manual remediation steps for an escalated session.
pub fn guidance(provider: &str, operation: &str, params: &serde_json::Value) -> Vec<String> {
    let mut lines = Vec::new();
    match console_url(provider) {
        Some(url) => lines.push(format!(
            "Open the {} console ({}) and look for partially created resources \
             from the {} operation",
            provider, url, operation
        )),
        None => lines.push(format!(
            "Check {} for partially created resources from the {} operation",
            provider, operation
        )),
    }
    lines.push(format!("Check account limits, quotas and billing status for {}", provider));
    lines.push(format!("Review the parameters that were tried: {}", params));
    lines.push("Fix the cause, then ask me to try the deployment again".to_string());
    lines
}
