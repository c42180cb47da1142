//! infrapilot CLI - Main entry point.
//!
//! Exit codes:
//! - 0: Success
//! - 1: General error
//! - 2: Invalid arguments
//! - 3: Configuration error
//! - 4: Credentials error
//! - 5: Conversation busy

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pilot_chat::{BackendError, ChatError};

mod commands;

use commands::{Cli, Commands};

/// Script-friendly exit codes
pub struct ExitCodes;

impl ExitCodes {
    pub const SUCCESS: u8 = 0;
    pub const GENERAL_ERROR: u8 = 1;
    pub const INVALID_ARGS: u8 = 2;
    pub const CONFIG_ERROR: u8 = 3;
    pub const CREDENTIALS_ERROR: u8 = 4;
    pub const BUSY: u8 = 5;
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Logs go to stderr so chat output stays readable
    let default_filter = if cli.verbose {
        "infrapilot=debug,pilot_chat=debug,pilot_core=debug,warn"
    } else if cli.quiet {
        "error"
    } else {
        "infrapilot=info,pilot_chat=info,warn"
    };
    let log_result = tracing_subscriber::registry()
        .with(cli.log_json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!cli.log_json).then(|| fmt::layer().with_target(false).with_writer(std::io::stderr)))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .try_init();

    if log_result.is_err() {
        // Logging already initialized, continue
    }

    let config = cli.config.clone();
    let result = match cli.command {
        Commands::Chat(args) => commands::chat::execute(args, config).await,
        Commands::Classify(args) => commands::classify::execute(args, config).await,
        Commands::Rules(args) => commands::rules::execute(args, config).await,
    };

    match result {
        Ok(()) => ExitCode::from(ExitCodes::SUCCESS),
        Err(e) => {
            let exit_code = categorize_error(&e);
            eprintln!("❌ Error: {:#}", e);
            ExitCode::from(exit_code)
        }
    }
}

/// Categorize error to determine exit code
fn categorize_error(e: &anyhow::Error) -> u8 {
    if let Some(err) = e.downcast_ref::<ChatError>() {
        return match err {
            ChatError::Config(_) | ChatError::Rule { .. } | ChatError::Yaml(_) => {
                ExitCodes::CONFIG_ERROR
            }
            ChatError::Backend(b) if b.is_credential() => ExitCodes::CREDENTIALS_ERROR,
            ChatError::ConversationNotFound(_) => ExitCodes::INVALID_ARGS,
            err if err.is_conflict() => ExitCodes::BUSY,
            _ => ExitCodes::GENERAL_ERROR,
        };
    }
    if let Some(err) = e.downcast_ref::<BackendError>() {
        if err.is_credential() {
            return ExitCodes::CREDENTIALS_ERROR;
        }
    }

    let msg = e.to_string().to_lowercase();
    if msg.contains("argument") || msg.contains("option") || msg.contains("not found") {
        ExitCodes::INVALID_ARGS
    } else {
        ExitCodes::GENERAL_ERROR
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_error() {
        let config = anyhow::Error::new(ChatError::Config("bad".into()));
        assert_eq!(categorize_error(&config), ExitCodes::CONFIG_ERROR);

        let busy = anyhow::Error::new(ChatError::Busy {
            conversation_id: "c1".into(),
            reason: "loop".into(),
        });
        assert_eq!(categorize_error(&busy), ExitCodes::BUSY);

        let creds = anyhow::Error::new(BackendError::InvalidKey("nope".into()));
        assert_eq!(categorize_error(&creds), ExitCodes::CREDENTIALS_ERROR);

        let other = anyhow::anyhow!("something odd");
        assert_eq!(categorize_error(&other), ExitCodes::GENERAL_ERROR);
    }
}
