//! Runtime configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::autonomous::LoopConfig;
use crate::error::{ChatError, ChatResult};
use crate::recovery::RecoveryConfig;
use crate::rules::RuleBook;

/// Event channel sizing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EventsConfig {
    /// Per-conversation broadcast capacity
    pub capacity: usize,
    /// Events kept per conversation for history queries
    pub backlog: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            backlog: 200,
        }
    }
}

/// HTTP chat backend settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible API
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the fallback API key
    pub api_key_env: String,
    /// Retries on 5xx and transport errors
    pub max_retries: u32,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            max_retries: 2,
            timeout_secs: 120,
        }
    }
}

impl LlmConfig {
    /// API key from the configured environment variable, if set and non-empty.
    pub fn api_key_from_env(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct PilotConfig {
    pub autonomous: LoopConfig,
    pub recovery: RecoveryConfig,
    pub events: EventsConfig,
    pub llm: LlmConfig,
    /// Rule book YAML replacing the built-in rules
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules: Option<PathBuf>,
}

impl PilotConfig {
    /// Load from a YAML file.
    pub fn from_yaml_file(path: &Path) -> ChatResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Defaults overlaid with `INFRAPILOT_*` environment variables.
    pub fn from_env() -> ChatResult<Self> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Optional file, then environment overrides.
    pub fn load(path: Option<&Path>) -> ChatResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> ChatResult<()> {
        if let Some(value) = lookup("INFRAPILOT_MAX_ITERATIONS") {
            self.autonomous.max_iterations = parse_number("INFRAPILOT_MAX_ITERATIONS", &value)?;
        }
        if let Some(value) = lookup("INFRAPILOT_TOKEN_BUDGET") {
            self.autonomous.token_budget = parse_number("INFRAPILOT_TOKEN_BUDGET", &value)?;
        }
        if let Some(value) = lookup("INFRAPILOT_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = lookup("INFRAPILOT_LLM_BASE_URL") {
            self.llm.base_url = value.trim_end_matches('/').to_string();
        }
        if let Some(value) = lookup("INFRAPILOT_RULES") {
            self.rules = Some(PathBuf::from(value));
        }
        Ok(())
    }

    /// The rule book named by `rules`, or the built-in one.
    pub fn rule_book(&self) -> ChatResult<RuleBook> {
        match &self.rules {
            Some(path) => RuleBook::from_yaml_file(path),
            None => Ok(RuleBook::standard()),
        }
    }

    pub fn to_yaml(&self) -> ChatResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> ChatResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ChatError::Config(format!("{} must be a number, got '{}'", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = PilotConfig::default();
        assert_eq!(config.autonomous.max_iterations, 10);
        assert_eq!(config.autonomous.token_budget, 50_000);
        assert_eq!(config.recovery.max_attempts, 3);
        assert!(config.rules.is_none());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(
            file.path(),
            "autonomous:\n  max_iterations: 4\nllm:\n  model: local-model\n",
        )
        .unwrap();

        let config = PilotConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.autonomous.max_iterations, 4);
        assert_eq!(config.autonomous.throttle_cap_ms, 3000);
        assert_eq!(config.llm.model, "local-model");
        assert_eq!(config.llm.api_key_env, "OPENAI_API_KEY");
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("INFRAPILOT_MAX_ITERATIONS", "5"),
            ("INFRAPILOT_LLM_BASE_URL", "http://localhost:8080/v1/"),
            ("INFRAPILOT_RULES", "/etc/infrapilot/rules.yaml"),
        ]
        .into_iter()
        .collect();

        let mut config = PilotConfig::default();
        config
            .apply_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.autonomous.max_iterations, 5);
        assert_eq!(config.llm.base_url, "http://localhost:8080/v1");
        assert_eq!(config.rules, Some(PathBuf::from("/etc/infrapilot/rules.yaml")));
    }

    #[test]
    fn test_bad_number_is_config_error() {
        let mut config = PilotConfig::default();
        let err = config
            .apply_overrides(|k| (k == "INFRAPILOT_TOKEN_BUDGET").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ChatError::Config(_)));
    }

    #[test]
    fn test_rule_book_from_configured_path() {
        let file = NamedTempFile::new().unwrap();
        let mut book = RuleBook::standard();
        book.intent.execute_max_words = 2;
        std::fs::write(file.path(), book.to_yaml().unwrap()).unwrap();

        let config = PilotConfig {
            rules: Some(file.path().to_path_buf()),
            ..PilotConfig::default()
        };
        assert_eq!(config.rule_book().unwrap().intent.execute_max_words, 2);
    }
}
