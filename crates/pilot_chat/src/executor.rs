//! Tool executor backed by the chat backend.
//!
//! Planning and step execution are both delegated to the model with a JSON
//! reply contract. Used when no dedicated execution service is wired in.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use pilot_core::{ExecutionPlan, PlanMachine, StepDraft};

use crate::backend::{
    BackendError, BackendResult, ChatBackend, ChatRequest, ChatTurn, PlanExecutionRequest,
    StepInvocation, ToolExecutor,
};
use crate::classify::extract_json_object;

pub const PLANNER_PROMPT: &str = "You are an infrastructure planner. \
    Turn the user's request into an execution plan. \
    Reply with a single JSON object: {\"objective\": string, \"steps\": [{\"service\": string, \
    \"action\": string, \"description\": string, \"parameters\": object, \
    \"estimated_duration_secs\": number}]}. \
    Use the cloud provider name as the service.";

pub const STEP_PROMPT: &str = "You are an infrastructure operator. \
    Carry out the given step with your tools and reply with a single JSON object \
    describing the created or changed resources.";

#[derive(Debug, Deserialize)]
struct PlanDraft {
    #[serde(default)]
    objective: String,
    #[serde(default)]
    steps: Vec<StepSpec>,
}

#[derive(Debug, Deserialize)]
struct StepSpec {
    #[serde(default = "general")]
    service: String,
    action: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    parameters: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    estimated_duration_secs: u64,
}

fn general() -> String {
    "general".to_string()
}

impl From<StepSpec> for StepDraft {
    fn from(spec: StepSpec) -> Self {
        let description = if spec.description.trim().is_empty() {
            format!("{} {}", spec.service, spec.action)
        } else {
            spec.description
        };
        let mut draft = StepDraft::new(spec.service, spec.action, description)
            .estimate_secs(spec.estimated_duration_secs);
        draft.parameters = spec.parameters;
        draft
    }
}

/// [`ToolExecutor`] that asks a [`ChatBackend`] to plan and run steps
pub struct BackendToolExecutor {
    backend: Arc<dyn ChatBackend>,
}

impl BackendToolExecutor {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self { backend }
    }

    /// Ask the backend for a plan's objective and steps. A reply without
    /// usable steps becomes a single step carrying the request text.
    pub async fn draft_plan(
        &self,
        request: &PlanExecutionRequest,
    ) -> BackendResult<(String, Vec<StepDraft>)> {
        let reply = self
            .backend
            .chat(ChatRequest {
                history: vec![
                    ChatTurn::system(PLANNER_PROMPT),
                    ChatTurn::user(request.request_text.clone()),
                ],
                credential: request.credential.clone(),
                workspace_id: request.workspace_id.clone(),
                conversation_id: request.conversation_id.clone(),
            })
            .await?;

        let draft = extract_json_object(&reply.message)
            .and_then(|value| serde_json::from_value::<PlanDraft>(value).ok())
            .filter(|d| d.steps.iter().any(|s| !s.action.trim().is_empty()));

        Ok(match draft {
            Some(draft) => {
                let objective = if draft.objective.trim().is_empty() {
                    request.request_text.clone()
                } else {
                    draft.objective
                };
                let steps = draft
                    .steps
                    .into_iter()
                    .filter(|s| !s.action.trim().is_empty())
                    .map(StepDraft::from)
                    .collect();
                (objective, steps)
            }
            None => {
                warn!(
                    conversation_id = %request.conversation_id,
                    "Planner reply had no steps, running request as one step"
                );
                (
                    request.request_text.clone(),
                    vec![StepDraft::new("general", "execute", request.request_text.clone())],
                )
            }
        })
    }
}

#[async_trait]
impl ToolExecutor for BackendToolExecutor {
    /// Plan and run in one shot. The explicit execute command stands in for
    /// approval. A failing step aborts the run with that step's error.
    async fn execute_plan(&self, request: PlanExecutionRequest) -> BackendResult<ExecutionPlan> {
        let (objective, steps) = self.draft_plan(&request).await?;

        let internal = |e: pilot_core::CoreError| BackendError::Other(e.to_string());
        let mut machine = PlanMachine::new();
        let plan = machine
            .create_plan(
                &request.conversation_id,
                &request.user_id,
                &request.workspace_id,
                &objective,
                steps,
            )
            .map_err(internal)?;
        machine.request_approval(&plan.id).map_err(internal)?;
        machine.approve_plan(&plan.id).map_err(internal)?;

        for step in &plan.steps {
            let step = machine.execute_step(&plan.id, &step.id).map_err(internal)?;
            let invocation = StepInvocation {
                conversation_id: request.conversation_id.clone(),
                workspace_id: request.workspace_id.clone(),
                user_id: request.user_id.clone(),
                step: step.clone(),
                credential: request.credential.clone(),
            };
            match self.execute_step(invocation).await {
                Ok(result) => {
                    machine.complete_step(&plan.id, &step.id, result).map_err(internal)?;
                }
                Err(e) => {
                    warn!(plan_id = %plan.id, step_id = %step.id, "One-shot step failed: {}", e);
                    return Err(e);
                }
            }
        }

        let plan = machine.get_required(&plan.id).map_err(internal)?.clone();
        info!(plan_id = %plan.id, steps = plan.steps.len(), "One-shot plan executed");
        Ok(plan)
    }

    async fn execute_step(&self, invocation: StepInvocation) -> BackendResult<serde_json::Value> {
        let step = &invocation.step;
        let instruction = json!({
            "service": step.service,
            "action": step.action,
            "description": step.description,
            "parameters": step.parameters,
        });
        let reply = self
            .backend
            .chat(ChatRequest {
                history: vec![
                    ChatTurn::system(STEP_PROMPT),
                    ChatTurn::user(instruction.to_string()),
                ],
                credential: invocation.credential.clone(),
                workspace_id: invocation.workspace_id.clone(),
                conversation_id: invocation.conversation_id.clone(),
            })
            .await?;

        let mut result = extract_json_object(&reply.message)
            .unwrap_or_else(|| json!({ "message": reply.message }));
        if !reply.tool_calls.is_empty() {
            if let Some(object) = result.as_object_mut() {
                let tools: Vec<&str> = reply.tool_calls.iter().map(|c| c.name.as_str()).collect();
                object.insert("tools".to_string(), json!(tools));
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ChatReply, ToolCall};
    use crate::mock::ScriptedBackend;
    use pilot_core::{ExecutionStep, PlanStatus};

    fn request() -> PlanExecutionRequest {
        PlanExecutionRequest {
            conversation_id: "c1".into(),
            user_id: "u1".into(),
            workspace_id: "ws".into(),
            credential: None,
            request_text: "deploy my api to digitalocean".into(),
        }
    }

    #[tokio::test]
    async fn test_plans_and_runs_every_step() {
        let backend = ScriptedBackend::new();
        backend.push_reply(ChatReply::text(
            r#"Plan: {"objective": "Deploy API", "steps": [
                {"service": "digitalocean", "action": "create_droplet",
                 "parameters": {"region": "nyc1"}},
                {"service": "digitalocean", "action": "configure_dns", "description": "Point DNS"}
            ]}"#,
        ));
        backend.push_reply(ChatReply::text(r#"{"droplet_id": 42}"#));
        backend.push_reply(
            ChatReply::text("DNS updated").with_tool(ToolCall::new("digitalocean.dns", json!({}))),
        );

        let executor = BackendToolExecutor::new(Arc::new(backend.clone()));
        let plan = executor.execute_plan(request()).await.unwrap();

        assert_eq!(plan.objective, "Deploy API");
        assert_eq!(plan.status, PlanStatus::Completed);
        assert_eq!(plan.steps[0].description, "digitalocean create_droplet");
        assert_eq!(plan.steps[0].result.as_ref().unwrap()["droplet_id"], 42);
        assert_eq!(plan.steps[1].result.as_ref().unwrap()["tools"][0], "digitalocean.dns");
        assert_eq!(backend.call_count(), 3);
    }

    #[tokio::test]
    async fn test_draft_plan_only_plans() {
        let backend = ScriptedBackend::new();
        backend.push_reply(ChatReply::text(
            r#"{"objective": "Ship it", "steps": [{"service": "gcp", "action": "create_vm"}]}"#,
        ));
        let executor = BackendToolExecutor::new(Arc::new(backend.clone()));

        let (objective, steps) = executor.draft_plan(&request()).await.unwrap();
        assert_eq!(objective, "Ship it");
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].service, "gcp");
        assert_eq!(backend.call_count(), 1);
        let requests = backend.requests();
        assert_eq!(requests[0].history[0].content, PLANNER_PROMPT);
    }

    #[tokio::test]
    async fn test_unstructured_plan_becomes_single_step() {
        let backend = ScriptedBackend::new().with_fallback(ChatReply::text("done"));
        let executor = BackendToolExecutor::new(Arc::new(backend));
        let plan = executor.execute_plan(request()).await.unwrap();

        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].action, "execute");
        assert_eq!(plan.objective, "deploy my api to digitalocean");
    }

    #[tokio::test]
    async fn test_step_error_aborts_run() {
        let backend = ScriptedBackend::new();
        backend.push_reply(ChatReply::text(
            r#"{"steps": [{"service": "aws", "action": "run_instances"}]}"#,
        ));
        backend.push_error(BackendError::Provisioning("droplet creation failed".into()));

        let executor = BackendToolExecutor::new(Arc::new(backend));
        let err = executor.execute_plan(request()).await.unwrap_err();
        assert_eq!(err, BackendError::Provisioning("droplet creation failed".into()));
    }

    #[tokio::test]
    async fn test_step_instruction_carries_parameters() {
        let backend = ScriptedBackend::new().with_fallback(ChatReply::text("ok"));
        let executor = BackendToolExecutor::new(Arc::new(backend.clone()));
        let step = ExecutionStep::from(
            StepDraft::new("digitalocean", "create_droplet", "Create droplet")
                .param("size", json!("s-1vcpu-1gb")),
        );

        let result = executor
            .execute_step(StepInvocation {
                conversation_id: "c1".into(),
                workspace_id: "ws".into(),
                user_id: "u1".into(),
                step,
                credential: None,
            })
            .await
            .unwrap();

        assert_eq!(result, json!({"message": "ok"}));
        let requests = backend.requests();
        assert!(requests[0].history[1].content.contains("s-1vcpu-1gb"));
    }
}
