//! Chat command - Interactive session with the coordinator.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{debug, info};

use pilot_chat::{
    BackendToolExecutor, ConversationEvent, Coordinator, EventHub, EventKind, HttpChatBackend,
    NotificationSink, PlanExecutionRequest, Response, ResponseType,
};
use pilot_core::{Conversation, Credential};

#[derive(Args)]
pub struct ChatArgs {
    /// Workspace the conversation belongs to
    #[arg(short, long, default_value = "default")]
    workspace: String,

    /// User id recorded on the conversation
    #[arg(short, long, default_value = "local")]
    user: String,

    /// API key sent with every message (overrides the environment key)
    #[arg(long, env = "INFRAPILOT_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Send a single message and exit
    #[arg(short, long)]
    message: Option<String>,
}

pub async fn execute(args: ChatArgs, config_path: Option<PathBuf>) -> Result<()> {
    let config = super::load_config(config_path.as_deref())?;

    let backend = Arc::new(HttpChatBackend::new(config.llm.clone())?);
    let model = backend.model().to_string();
    info!(model = %model, base_url = %config.llm.base_url, "Starting chat session");

    let executor = Arc::new(BackendToolExecutor::new(backend.clone()));
    let hub = Arc::new(EventHub::new(config.events.capacity, config.events.backlog));
    let coordinator = Coordinator::new(backend, executor.clone(), hub.clone(), &config)?;

    let conversation = coordinator.start_conversation(&args.workspace, &args.user);
    let credential = args.api_key.map(Credential::new);

    let printer = tokio::spawn(print_events(hub.create_event_stream(&conversation.id)));

    if let Some(message) = args.message {
        let response = coordinator
            .process_message(&conversation.id, &message, credential)
            .await?;
        print_response(&response);
        coordinator.settle().await;
        coordinator.shutdown();
        printer.abort();
        return Ok(());
    }

    println!("🤖 infrapilot chat (model: {})", model);
    println!("   Commands: /propose <request>, /plan, /cancel, /status, /quit");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print_prompt();
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line {
            "/quit" | "/exit" => break,
            "/plan" => match coordinator.active_plan(&conversation.id) {
                Some(plan) => println!("{}", pilot_core::format_plan_for_approval(&plan)),
                None => println!("No active plan."),
            },
            "/cancel" => match coordinator.active_plan(&conversation.id) {
                Some(plan) => {
                    coordinator.cancel_plan(&plan.id)?;
                }
                None => println!("No active plan."),
            },
            "/status" => {
                if let Some(current) = coordinator.conversation(&conversation.id) {
                    println!(
                        "Conversation {} · {} messages · status {:?}",
                        current.id,
                        current.messages.len(),
                        current.status
                    );
                    for op in &current.context.pending_operations {
                        println!("   pending: {}", op);
                    }
                    for plan in &current.active_workflows {
                        println!("   workflow: {}", plan);
                    }
                }
                for session in coordinator.recovery_sessions(&conversation.id) {
                    let state = if session.status.is_terminal() {
                        "finished"
                    } else {
                        "running"
                    };
                    println!(
                        "   recovery {} ({}): {} on {} · {:?} after {} attempt(s)",
                        session.id,
                        state,
                        session.operation,
                        session.provider,
                        session.status,
                        session.attempts
                    );
                }
            }
            text if text.starts_with("/propose") => {
                let request = text.trim_start_matches("/propose").trim();
                if request.is_empty() {
                    println!("Usage: /propose <what to deploy>");
                    continue;
                }
                propose(&coordinator, &executor, &conversation, request, credential.clone())
                    .await?;
            }
            text => match coordinator
                .process_message(&conversation.id, text, credential.clone())
                .await
            {
                Ok(response) => print_response(&response),
                Err(e) if e.is_conflict() => println!("⏳ {}", e),
                Err(e) => return Err(e.into()),
            },
        }
    }

    debug!("Ending chat session");
    coordinator.shutdown();
    printer.abort();
    Ok(())
}

/// Draft a plan for `request` and put it up for approval.
async fn propose(
    coordinator: &Coordinator,
    executor: &BackendToolExecutor,
    conversation: &Conversation,
    request: &str,
    credential: Option<Credential>,
) -> Result<()> {
    let draft = executor
        .draft_plan(&PlanExecutionRequest {
            conversation_id: conversation.id.clone(),
            user_id: conversation.user_id.clone(),
            workspace_id: conversation.workspace_id.clone(),
            credential,
            request_text: request.to_string(),
        })
        .await;
    let (objective, steps) = match draft {
        Ok(draft) => draft,
        Err(e) => {
            println!("❌ Could not draft a plan: {}", e);
            return Ok(());
        }
    };

    match coordinator.propose_plan(&conversation.id, &objective, steps) {
        Ok(plan) => {
            println!();
            println!("{}", pilot_core::format_plan_for_approval(&plan));
            println!();
            Ok(())
        }
        Err(e) if e.is_conflict() => {
            println!("⏳ {}", e);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn print_prompt() {
    use std::io::Write;
    print!("> ");
    let _ = std::io::stdout().flush();
}

fn print_response(response: &Response) {
    println!();
    println!("{}", response.message);
    if let Some(actions) = &response.suggested_actions {
        for action in actions {
            match &action.target {
                Some(target) => println!("   → {} ({})", action.label, target),
                None => println!("   → {}", action.label),
            }
        }
    }
    if response.response_type == ResponseType::RecoveryStarted {
        if let Some(id) = &response.recovery_id {
            println!("   recovery id: {}", id);
        }
    }
    if let Some(usage) = &response.usage {
        println!("   ({} tokens)", usage.total());
    }
    println!();
}

/// Print progress for background work as it happens.
async fn print_events(mut rx: broadcast::Receiver<ConversationEvent>) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("Event printer skipped {} events", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if let Some(line) = describe(&event.kind) {
            println!("{}", line);
        }
    }
}

fn describe(kind: &EventKind) -> Option<String> {
    match kind {
        EventKind::AutonomousProgress {
            iteration,
            max_iterations,
            total_tokens,
            tools,
        } => {
            let mut line = format!(
                "   ⏳ step {}/{} · {} tokens",
                iteration, max_iterations, total_tokens
            );
            if !tools.is_empty() {
                line.push_str(&format!(" · {}", tools.join(", ")));
            }
            Some(line)
        }
        EventKind::ExecutionStepStarted { index, description, .. } => {
            Some(format!("   ▶️  {}. {}", index + 1, description))
        }
        EventKind::ExecutionStepCompleted { index, .. } => {
            Some(format!("   ✅ step {} done", index + 1))
        }
        EventKind::ExecutionStepFailed { index, error, .. } => {
            Some(format!("   ❌ step {} failed: {}", index + 1, error))
        }
        EventKind::ExecutionCompleted {
            status,
            completed_steps,
            total_steps,
            ..
        } => Some(format!(
            "   🏁 execution {} ({}/{} steps)",
            status.as_str(),
            completed_steps,
            total_steps
        )),
        EventKind::WorkflowProgress(progress) if progress.current_step.is_none() => Some(format!(
            "   📊 {}: {}% ({})",
            progress.objective,
            progress.percent(),
            progress.status.as_str()
        )),
        EventKind::RecoveryProgress { message, .. } => Some(format!("   🔧 {}", message)),
        EventKind::RecoverySuccess { message, .. } => Some(format!("   ✅ {}", message)),
        EventKind::RecoveryEscalated { message, guidance, .. } => {
            let mut text = format!("   ⚠️  {}", message);
            for line in guidance {
                text.push_str(&format!("\n      - {}", line));
            }
            Some(text)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pilot_chat::WorkflowProgress;
    use pilot_core::PlanStatus;

    #[test]
    fn test_describe_skips_chat_messages() {
        assert!(describe(&EventKind::TypingStatus { typing: true }).is_none());
        let line = describe(&EventKind::ExecutionCompleted {
            plan_id: "p1".into(),
            status: PlanStatus::Completed,
            completed_steps: 2,
            total_steps: 2,
        })
        .unwrap();
        assert!(line.contains("completed (2/2 steps)"));
    }

    #[test]
    fn test_describe_reports_plan_percentage() {
        let progress = WorkflowProgress {
            plan_id: "p1".into(),
            objective: "Deploy the API".into(),
            status: PlanStatus::Cancelled,
            completed_steps: 1,
            total_steps: 4,
            current_step: None,
        };
        let line = describe(&EventKind::WorkflowProgress(progress.clone())).unwrap();
        assert_eq!(line, "   📊 Deploy the API: 25% (cancelled)");

        let running = WorkflowProgress {
            current_step: Some("Create droplet".into()),
            ..progress
        };
        assert!(describe(&EventKind::WorkflowProgress(running)).is_none());
    }
}
