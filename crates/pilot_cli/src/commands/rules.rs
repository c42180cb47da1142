//! Rules command - Print or validate the heuristic rule book.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use pilot_chat::{Classifier, RuleBook};

#[derive(Args)]
pub struct RulesArgs {
    /// Validate a rule book file instead of printing the active one
    #[arg(long)]
    check: Option<PathBuf>,

    /// Print the effective configuration as well
    #[arg(long)]
    with_config: bool,
}

pub async fn execute(args: RulesArgs, config_path: Option<PathBuf>) -> Result<()> {
    if let Some(path) = args.check {
        let book = RuleBook::from_yaml_file(&path)
            .with_context(|| format!("Failed to load rule book {}", path.display()))?;
        let rules = book.loop_rules.len();
        Classifier::new(book)?;
        println!("✅ {} is valid ({} loop rules)", path.display(), rules);
        return Ok(());
    }

    let config = super::load_config(config_path.as_deref())?;
    if args.with_config {
        println!("# Configuration");
        println!("{}", config.to_yaml()?);
    }
    let book = config.rule_book()?;
    println!("# Rule book");
    println!("{}", book.to_yaml()?);
    Ok(())
}
