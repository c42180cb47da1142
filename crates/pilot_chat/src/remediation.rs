//! User-facing remediation for classified backend errors.

use serde::{Deserialize, Serialize};

use crate::backend::{BackendError, ErrorCategory};

/// Settings section holding backend credentials
pub const CREDENTIALS_SETTINGS: &str = "/settings#credentials";
/// Settings section holding billing and usage limits
pub const BILLING_SETTINGS: &str = "/settings#billing";

/// Kind of action offered next to an error message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Deep link into the settings UI
    Settings,
    /// External link
    Link,
    /// Resend the last message
    Retry,
}

/// An action the user can take to resolve an error
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SuggestedAction {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl SuggestedAction {
    pub fn settings(label: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            action_type: ActionType::Settings,
            label: label.into(),
            target: Some(target.into()),
        }
    }

    pub fn link(label: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            action_type: ActionType::Link,
            label: label.into(),
            target: Some(url.into()),
        }
    }

    pub fn retry() -> Self {
        Self {
            action_type: ActionType::Retry,
            label: "Try again".to_string(),
            target: None,
        }
    }
}

/// Message template and actions for one error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remediation {
    pub category: ErrorCategory,
    pub message: String,
    pub actions: Vec<SuggestedAction>,
}

fn billing_url(provider: Option<&str>) -> String {
    match provider.map(|p| p.to_lowercase()).as_deref() {
        Some("openai") => "https://platform.openai.com/account/billing".to_string(),
        Some("anthropic") => "https://console.anthropic.com/settings/billing".to_string(),
        Some("digitalocean") => "https://cloud.digitalocean.com/account/billing".to_string(),
        _ => BILLING_SETTINGS.to_string(),
    }
}

/// Select the remediation for a categorized error.
pub fn remediation_for(category: ErrorCategory, error: &BackendError) -> Remediation {
    let (message, actions) = match category {
        ErrorCategory::MissingCredentials => (
            "🔑 No AI provider credentials are configured for this workspace. \
             Add an API key in Settings to continue."
                .to_string(),
            vec![SuggestedAction::settings("Add API key", CREDENTIALS_SETTINGS)],
        ),
        ErrorCategory::InvalidKey => (
            "🔑 The configured API key was rejected. \
             Check that it is correct and has not been revoked."
                .to_string(),
            vec![SuggestedAction::settings("Update API key", CREDENTIALS_SETTINGS)],
        ),
        ErrorCategory::InsufficientCredits => {
            let provider = match error {
                BackendError::InsufficientCredits { provider, .. } => provider.as_deref(),
                _ => None,
            };
            let who = provider.unwrap_or("AI provider");
            (
                format!(
                    "💳 Your {} account has run out of credits. \
                     Top up your balance and try again.",
                    who
                ),
                vec![
                    SuggestedAction::link("Open billing", billing_url(provider)),
                    SuggestedAction::settings("Switch provider", CREDENTIALS_SETTINGS),
                ],
            )
        }
        ErrorCategory::RateLimited => {
            let wait = match error {
                BackendError::RateLimited {
                    retry_after_secs: Some(secs),
                    ..
                } => format!("about {} seconds", secs),
                _ => "a moment".to_string(),
            };
            (
                format!(
                    "⏳ The AI provider is rate limiting requests. Wait {} and try again.",
                    wait
                ),
                vec![
                    SuggestedAction::retry(),
                    SuggestedAction::link("View usage limits", BILLING_SETTINGS),
                ],
            )
        }
        ErrorCategory::Provisioning => (
            format!("⚠️ The provisioning operation failed: {}", error.message()),
            vec![SuggestedAction::retry()],
        ),
        ErrorCategory::Internal => (
            "😕 Sorry, something went wrong while processing your message. \
             Please try again in a moment."
                .to_string(),
            vec![SuggestedAction::retry()],
        ),
    };

    Remediation {
        category,
        message,
        actions,
    }
}
