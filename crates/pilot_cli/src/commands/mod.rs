//! CLI command definitions.
//!
//! This module defines the command structure for the infrapilot CLI.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use pilot_chat::PilotConfig;

pub mod chat;
pub mod classify;
pub mod rules;

/// infrapilot - conversational infrastructure orchestration
#[derive(Parser)]
#[command(name = "infrapilot")]
#[command(version, about = "infrapilot - conversational infrastructure orchestration")]
#[command(long_about = r#"
infrapilot turns chat messages into infrastructure work: deployment requests
run an autonomous loop against the configured LLM backend, multi-step plans
wait for explicit approval, and provisioning failures are retried before
they are escalated.

COMMANDS:
  chat      → Interactive session against the configured backend
  classify  → Show how a message would be routed and judged
  rules     → Print or check the heuristic rule book

ENVIRONMENT:
  OPENAI_API_KEY            Fallback LLM API key
  INFRAPILOT_LLM_MODEL      Model name override
  INFRAPILOT_LLM_BASE_URL   OpenAI-compatible API base URL
  INFRAPILOT_MAX_ITERATIONS Autonomous loop iteration cap
  INFRAPILOT_TOKEN_BUDGET   Autonomous loop token budget
  INFRAPILOT_RULES          Rule book YAML file
  RUST_LOG                  Log filter

EXIT CODES:
  0 - Success
  1 - General error
  2 - Invalid arguments
  3 - Configuration error
  4 - Credentials error
  5 - Conversation busy
"#)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Configuration file (YAML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start an interactive chat session
    Chat(chat::ChatArgs),

    /// Classify a message with the active rule book
    Classify(classify::ClassifyArgs),

    /// Print or validate the rule book
    Rules(rules::RulesArgs),
}

/// Configuration file plus environment overrides.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<PilotConfig> {
    Ok(PilotConfig::load(path)?)
}
