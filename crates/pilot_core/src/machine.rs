//! Execution plan state machine.
//!
//! The machine owns every plan it creates plus an index of the one plan per
//! conversation that currently holds the approval/execution slot. A plan
//! leaves the index when it reaches a terminal status.

use std::collections::HashMap;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};
use crate::plan::{
    format_duration, ExecutionPlan, ExecutionStep, PlanStatus, StepDraft, StepStatus,
};

/// Owner of plan state and the per-conversation active-plan index.
#[derive(Debug, Default)]
pub struct PlanMachine {
    plans: HashMap<String, ExecutionPlan>,
    /// conversation id -> plan id holding the slot
    active: HashMap<String, String>,
}

impl PlanMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a plan in `draft`.
    pub fn create_plan(
        &mut self,
        conversation_id: &str,
        user_id: &str,
        workspace_id: &str,
        objective: &str,
        steps: Vec<StepDraft>,
    ) -> CoreResult<ExecutionPlan> {
        if steps.is_empty() {
            return Err(CoreError::Validation(
                "a plan needs at least one step".to_string(),
            ));
        }
        if objective.trim().is_empty() {
            return Err(CoreError::Validation("plan objective is empty".to_string()));
        }
        if let Some(index) = steps.iter().position(|s| s.action.trim().is_empty()) {
            return Err(CoreError::Validation(format!(
                "step {} has no action",
                index + 1
            )));
        }

        let steps: Vec<ExecutionStep> = steps.into_iter().map(ExecutionStep::from).collect();
        let plan = ExecutionPlan::new(conversation_id, user_id, workspace_id, objective, steps);
        debug!(plan_id = %plan.id, conversation_id, "Created plan with {} steps", plan.steps.len());
        self.plans.insert(plan.id.clone(), plan.clone());
        Ok(plan)
    }

    /// `draft -> awaiting_approval`, claiming the conversation's slot.
    pub fn request_approval(&mut self, plan_id: &str) -> CoreResult<ExecutionPlan> {
        let (conversation_id, status) = {
            let plan = self.get_required(plan_id)?;
            (plan.conversation_id.clone(), plan.status)
        };

        if status != PlanStatus::Draft {
            return Err(CoreError::transition(
                format!("plan {}", plan_id),
                status,
                PlanStatus::AwaitingApproval,
            ));
        }

        if let Some(holder) = self.slot_holder(&conversation_id) {
            if holder != plan_id {
                return Err(CoreError::Conflict {
                    conversation_id,
                    plan_id: holder.to_string(),
                });
            }
        }

        self.active.insert(conversation_id, plan_id.to_string());
        let plan = self.set_status(plan_id, PlanStatus::AwaitingApproval)?;
        info!(plan_id, "Plan awaiting approval");
        Ok(plan)
    }

    /// `awaiting_approval -> approved`. Any other status is reported as
    /// not found, so a repeated approval is ignored.
    pub fn approve_plan(&mut self, plan_id: &str) -> CoreResult<ExecutionPlan> {
        match self.plans.get(plan_id) {
            Some(plan) if plan.status == PlanStatus::AwaitingApproval => {}
            _ => {
                return Err(CoreError::NotFound(format!(
                    "no plan awaiting approval with id {}",
                    plan_id
                )))
            }
        }
        let plan = self.set_status(plan_id, PlanStatus::Approved)?;
        info!(plan_id, "Plan approved");
        Ok(plan)
    }

    /// Any non-terminal status -> `cancelled`.
    pub fn cancel_plan(&mut self, plan_id: &str) -> CoreResult<ExecutionPlan> {
        let status = self.get_required(plan_id)?.status;
        if status.is_terminal() {
            return Err(CoreError::transition(
                format!("plan {}", plan_id),
                status,
                PlanStatus::Cancelled,
            ));
        }
        let plan = self.set_status(plan_id, PlanStatus::Cancelled)?;
        info!(plan_id, "Plan cancelled");
        Ok(plan)
    }

    /// Mark a plan failed. Used when its next step cannot be started.
    pub fn fail_plan(&mut self, plan_id: &str) -> CoreResult<ExecutionPlan> {
        let status = self.get_required(plan_id)?.status;
        if status.is_terminal() {
            return Err(CoreError::transition(
                format!("plan {}", plan_id),
                status,
                PlanStatus::Failed,
            ));
        }
        self.set_status(plan_id, PlanStatus::Failed)
    }

    /// Start a step. The plan moves to `executing` on its first step.
    pub fn execute_step(&mut self, plan_id: &str, step_id: &str) -> CoreResult<ExecutionStep> {
        let plan = self.get_required_mut(plan_id)?;
        if !matches!(plan.status, PlanStatus::Approved | PlanStatus::Executing) {
            return Err(CoreError::transition(
                format!("plan {}", plan_id),
                plan.status,
                PlanStatus::Executing,
            ));
        }
        plan.status = PlanStatus::Executing;
        plan.updated_at = Utc::now();

        let step = transition_step(plan, step_id, StepStatus::Running)?;
        debug!(plan_id, step_id, "Step running");
        Ok(step)
    }

    /// `running -> completed`; completes the plan once every step is done.
    pub fn complete_step(
        &mut self,
        plan_id: &str,
        step_id: &str,
        result: serde_json::Value,
    ) -> CoreResult<ExecutionStep> {
        let plan = self.get_required_mut(plan_id)?;
        let step = transition_step(plan, step_id, StepStatus::Completed)?;
        if let Some(s) = plan.step_mut(step_id) {
            s.result = Some(result.clone());
        }
        self.settle(plan_id)?;
        Ok(ExecutionStep {
            result: Some(result),
            ..step
        })
    }

    /// `running -> failed`. Remaining steps are left untouched.
    pub fn fail_step(
        &mut self,
        plan_id: &str,
        step_id: &str,
        error: impl Into<String>,
    ) -> CoreResult<ExecutionStep> {
        let error = error.into();
        let plan = self.get_required_mut(plan_id)?;
        let step = transition_step(plan, step_id, StepStatus::Failed)?;
        if let Some(s) = plan.step_mut(step_id) {
            s.error = Some(error.clone());
        }
        warn!(plan_id, step_id, "Step failed: {}", error);
        Ok(ExecutionStep {
            error: Some(error),
            ..step
        })
    }

    /// `running -> skipped`.
    pub fn skip_step(
        &mut self,
        plan_id: &str,
        step_id: &str,
        reason: impl Into<String>,
    ) -> CoreResult<ExecutionStep> {
        let plan = self.get_required_mut(plan_id)?;
        let step = transition_step(plan, step_id, StepStatus::Skipped)?;
        if let Some(s) = plan.step_mut(step_id) {
            s.result = Some(serde_json::json!({ "skipped": reason.into() }));
        }
        self.settle(plan_id)?;
        Ok(step)
    }

    pub fn get(&self, plan_id: &str) -> Option<&ExecutionPlan> {
        self.plans.get(plan_id)
    }

    pub fn get_required(&self, plan_id: &str) -> CoreResult<&ExecutionPlan> {
        self.plans
            .get(plan_id)
            .ok_or_else(|| CoreError::NotFound(format!("plan {}", plan_id)))
    }

    /// The plan holding the conversation's slot, if any.
    pub fn active_plan(&self, conversation_id: &str) -> Option<&ExecutionPlan> {
        self.active
            .get(conversation_id)
            .and_then(|id| self.plans.get(id))
            .filter(|p| p.status.holds_slot())
    }

    /// The conversation's plan if it is waiting on the user.
    pub fn pending_approval(&self, conversation_id: &str) -> Option<&ExecutionPlan> {
        self.active_plan(conversation_id)
            .filter(|p| p.status == PlanStatus::AwaitingApproval)
    }

    /// Every plan ever created for a conversation, oldest first.
    pub fn plans_for(&self, conversation_id: &str) -> Vec<&ExecutionPlan> {
        let mut plans: Vec<&ExecutionPlan> = self
            .plans
            .values()
            .filter(|p| p.conversation_id == conversation_id)
            .collect();
        plans.sort_by_key(|p| p.created_at);
        plans
    }

    /// Drop all state.
    pub fn clear(&mut self) {
        self.plans.clear();
        self.active.clear();
    }

    fn slot_holder(&self, conversation_id: &str) -> Option<&str> {
        self.active_plan(conversation_id).map(|p| p.id.as_str())
    }

    fn get_required_mut(&mut self, plan_id: &str) -> CoreResult<&mut ExecutionPlan> {
        self.plans
            .get_mut(plan_id)
            .ok_or_else(|| CoreError::NotFound(format!("plan {}", plan_id)))
    }

    fn set_status(&mut self, plan_id: &str, status: PlanStatus) -> CoreResult<ExecutionPlan> {
        let plan = self.get_required_mut(plan_id)?;
        plan.status = status;
        plan.updated_at = Utc::now();
        let plan = plan.clone();
        if status.is_terminal() {
            self.evict(&plan);
        }
        Ok(plan)
    }

    /// Complete the plan if all steps succeeded and the plan is still live.
    fn settle(&mut self, plan_id: &str) -> CoreResult<()> {
        let plan = self.get_required(plan_id)?;
        if plan.status == PlanStatus::Executing && plan.all_steps_succeeded() {
            self.set_status(plan_id, PlanStatus::Completed)?;
            info!(plan_id, "Plan completed");
        }
        Ok(())
    }

    fn evict(&mut self, plan: &ExecutionPlan) {
        if self.active.get(&plan.conversation_id) == Some(&plan.id) {
            self.active.remove(&plan.conversation_id);
        }
    }
}

fn transition_step(
    plan: &mut ExecutionPlan,
    step_id: &str,
    next: StepStatus,
) -> CoreResult<ExecutionStep> {
    let plan_id = plan.id.clone();
    let step = plan
        .step_mut(step_id)
        .ok_or_else(|| CoreError::StepNotFound {
            plan_id,
            step_id: step_id.to_string(),
        })?;

    if !step.status.can_transition_to(next) {
        return Err(CoreError::transition(
            format!("step {}", step_id),
            step.status,
            next,
        ));
    }

    let now = Utc::now();
    match next {
        StepStatus::Running => step.started_at = Some(now),
        _ => step.finished_at = Some(now),
    }
    step.status = next;
    let snapshot = step.clone();
    plan.updated_at = now;
    Ok(snapshot)
}

/// Render a plan for the approval prompt. Output depends only on the plan.
pub fn format_plan_for_approval(plan: &ExecutionPlan) -> String {
    let mut out = String::new();
    out.push_str(&format!("**Execution plan:** {}\n\n", plan.objective));

    for (i, step) in plan.steps.iter().enumerate() {
        out.push_str(&format!(
            "{}. [{}] {}: {}",
            i + 1,
            step.service,
            step.action,
            step.description
        ));
        if step.estimated_duration_secs > 0 {
            out.push_str(&format!(" (~{})", format_duration(step.estimated_duration_secs)));
        }
        out.push('\n');
    }

    let total = plan.total_estimated_secs();
    if total > 0 {
        out.push_str(&format!("\nEstimated total time: ~{}\n", format_duration(total)));
    }
    out.push_str(
        "\nReply \"yes\" to approve, \"no\" to cancel, or describe what you'd like to change.",
    );
    out
}
