//! Classify command - Show how the rule book judges a message.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use serde::Serialize;

use pilot_chat::{BackendError, Classifier, Decision, ErrorCategory, ProvisioningFailure};
use pilot_core::ApprovalDecision;

#[derive(Args)]
pub struct ClassifyArgs {
    /// Message text to classify
    text: String,

    /// Loop iteration the text would be judged at (as an assistant reply)
    #[arg(short, long, default_value_t = 1)]
    iteration: u32,

    /// Also treat the text as a backend error raised for this user input
    #[arg(long)]
    error_for: Option<String>,

    /// Print JSON instead of text
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct Report {
    deployment_request: bool,
    execute_command: bool,
    approval: ApprovalDecision,
    loop_decision: Decision,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_category: Option<ErrorCategory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    provisioning_failure: Option<ProvisioningFailure>,
}

fn report(classifier: &Classifier, args: &ClassifyArgs) -> Report {
    let error = BackendError::Other(args.text.clone());
    let error_category = args.error_for.as_ref().map(|_| classifier.categorize(&error));
    let provisioning_failure = args
        .error_for
        .as_deref()
        .and_then(|input| classifier.provisioning_failure(&error, input));
    Report {
        deployment_request: classifier.is_deployment_request(&args.text),
        execute_command: classifier.is_execute_command(&args.text),
        approval: classifier.approval(&args.text),
        loop_decision: classifier.decide(&args.text, args.iteration),
        error_category,
        provisioning_failure,
    }
}

pub async fn execute(args: ClassifyArgs, config_path: Option<PathBuf>) -> Result<()> {
    let config = super::load_config(config_path.as_deref())?;
    let classifier = Classifier::new(config.rule_book()?)?;
    let report = report(&classifier, &args);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("🔎 \"{}\"", args.text);
    println!("   deployment request: {}", report.deployment_request);
    println!("   execute command:    {}", report.execute_command);
    println!("   approval reply:     {:?}", report.approval);
    println!(
        "   loop (iteration {}): {:?} via '{}' ({:?})",
        args.iteration,
        report.loop_decision.outcome,
        report.loop_decision.rule,
        report.loop_decision.class
    );
    if let Some(category) = &report.error_category {
        println!("   error category:     {:?}", category);
    }
    if let Some(failure) = &report.provisioning_failure {
        println!(
            "   recoverable:        {} on {} with {}",
            failure.operation, failure.provider, failure.params
        );
    } else if args.error_for.is_some() {
        println!("   recoverable:        no");
    }
    Ok(())
}
