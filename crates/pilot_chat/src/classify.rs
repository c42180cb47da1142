//! Compiled form of a [`RuleBook`].

use regex::{Regex, RegexBuilder};
use serde::Serialize;
use tracing::debug;

use pilot_core::approval::{contains_any, normalize};
use pilot_core::ApprovalDecision;

use crate::backend::{BackendError, ErrorCategory};
use crate::error::{ChatError, ChatResult};
use crate::rules::{InferenceRule, Matcher, Outcome, RuleBook, SignalClass};

/// Result of running the loop decision table over one reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub rule: String,
    pub class: SignalClass,
    pub outcome: Outcome,
}

/// A backend failure recognised as a recoverable provisioning failure
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProvisioningFailure {
    pub provider: String,
    pub operation: String,
    pub params: serde_json::Value,
}

enum CompiledMatcher {
    Phrases(Vec<String>),
    Patterns(Vec<Regex>),
    ShortReply(usize),
    Question(Vec<String>),
    Iterations(u32, Option<u32>),
    Always,
}

impl CompiledMatcher {
    fn compile(matcher: &Matcher) -> ChatResult<Self> {
        Ok(match matcher {
            Matcher::Phrases { phrases } => Self::Phrases(phrases.clone()),
            Matcher::Patterns { patterns } => Self::Patterns(compile_all(patterns)?),
            Matcher::ShortReply { max_words } => Self::ShortReply(*max_words),
            Matcher::Question { openers } => {
                Self::Question(openers.iter().map(|o| o.to_lowercase()).collect())
            }
            Matcher::Iterations { from, to } => Self::Iterations(*from, *to),
            Matcher::Always => Self::Always,
        })
    }

    fn matches(&self, text: &str, normalized: &str, iteration: u32) -> bool {
        match self {
            Self::Phrases(phrases) => contains_any(normalized, phrases),
            Self::Patterns(patterns) => patterns.iter().any(|re| re.is_match(text)),
            Self::ShortReply(max_words) => text.split_whitespace().count() < *max_words,
            Self::Question(openers) => {
                let trimmed = text.trim_end();
                trimmed.ends_with('?')
                    || normalized
                        .split_whitespace()
                        .next()
                        .map(|first| openers.iter().any(|o| o == first))
                        .unwrap_or(false)
            }
            Self::Iterations(from, to) => {
                iteration >= *from && to.map(|to| iteration <= to).unwrap_or(true)
            }
            Self::Always => true,
        }
    }
}

struct CompiledRule {
    name: String,
    class: SignalClass,
    matcher: CompiledMatcher,
    outcome: Outcome,
}

/// Runs every heuristic table of a [`RuleBook`].
pub struct Classifier {
    book: RuleBook,
    loop_rules: Vec<CompiledRule>,
    deployment_patterns: Vec<Regex>,
}

impl Classifier {
    /// Compile a rule book. Fails on the first invalid regex.
    pub fn new(book: RuleBook) -> ChatResult<Self> {
        let loop_rules = book
            .loop_rules
            .iter()
            .map(|rule| {
                Ok(CompiledRule {
                    name: rule.name.clone(),
                    class: rule.class,
                    matcher: CompiledMatcher::compile(&rule.matcher)?,
                    outcome: rule.outcome,
                })
            })
            .collect::<ChatResult<Vec<_>>>()?;
        let deployment_patterns = compile_all(&book.intent.deployment_patterns)?;

        debug!(
            "Compiled rule book: {} loop rules, {} deployment patterns",
            loop_rules.len(),
            deployment_patterns.len()
        );

        Ok(Self {
            book,
            loop_rules,
            deployment_patterns,
        })
    }

    pub fn standard() -> ChatResult<Self> {
        Self::new(RuleBook::standard())
    }

    pub fn book(&self) -> &RuleBook {
        &self.book
    }

    /// Continue/stop decision for an assistant reply at a 1-based iteration.
    /// The first matching rule wins; an empty table stops.
    pub fn decide(&self, content: &str, iteration: u32) -> Decision {
        let normalized = normalize(content);
        self.loop_rules
            .iter()
            .find(|rule| rule.matcher.matches(content, &normalized, iteration))
            .map(|rule| Decision {
                rule: rule.name.clone(),
                class: rule.class,
                outcome: rule.outcome,
            })
            .unwrap_or(Decision {
                rule: "empty-table".to_string(),
                class: SignalClass::Default,
                outcome: Outcome::Stop,
            })
    }

    /// Short explicit "go" messages.
    ///
    /// A message that is also a deployment request ("start a new droplet")
    /// only counts when it holds nothing beyond execute phrases and filler.
    pub fn is_execute_command(&self, text: &str) -> bool {
        let intent = &self.book.intent;
        let words = text.split_whitespace().count();
        if words == 0 || words > intent.execute_max_words {
            return false;
        }
        let normalized = normalize(text);
        if !contains_any(&normalized, &intent.execute_commands) {
            return false;
        }
        !self.is_deployment_request(text) || self.is_bare_execute_command(&normalized)
    }

    fn is_bare_execute_command(&self, normalized: &str) -> bool {
        let intent = &self.book.intent;
        let mut phrases: Vec<String> =
            intent.execute_commands.iter().map(|p| normalize(p)).collect();
        phrases.sort_by_key(|p| std::cmp::Reverse(p.len()));

        let mut rest = normalized.to_string();
        for phrase in phrases.iter().filter(|p| !p.trim().is_empty()) {
            while rest.contains(phrase.as_str()) {
                rest = rest.replacen(phrase.as_str(), " ", 1);
            }
        }
        rest.split_whitespace()
            .all(|word| intent.execute_filler.iter().any(|f| f == word))
    }

    pub fn is_deployment_request(&self, text: &str) -> bool {
        contains_any(&normalize(text), &self.book.intent.deployment_keywords)
            || self.deployment_patterns.iter().any(|re| re.is_match(text))
    }

    pub fn approval(&self, text: &str) -> ApprovalDecision {
        self.book.approval.parse(text)
    }

    /// Remediation category of a backend error.
    ///
    /// Typed errors keep their own tag; untyped ones go through the
    /// keyword table once and fall back to `Internal`.
    pub fn categorize(&self, error: &BackendError) -> ErrorCategory {
        if let Some(tag) = error.tag() {
            return tag;
        }
        let normalized = normalize(error.message());
        self.book
            .errors
            .iter()
            .find(|rule| contains_any(&normalized, &rule.phrases))
            .map(|rule| rule.category)
            .unwrap_or(ErrorCategory::Internal)
    }

    /// Recognise a recoverable provisioning failure.
    ///
    /// Credential failures never qualify. Otherwise the error must be
    /// typed as provisioning or mention a provisioning keyword, and the
    /// user's input must be about deployment.
    pub fn provisioning_failure(
        &self,
        error: &BackendError,
        input: &str,
    ) -> Option<ProvisioningFailure> {
        if matches!(
            self.categorize(error),
            ErrorCategory::MissingCredentials | ErrorCategory::InvalidKey
        ) {
            return None;
        }
        let rules = &self.book.provisioning;
        let error_text = normalize(error.message());
        let typed = error.tag() == Some(ErrorCategory::Provisioning);
        if !typed && !contains_any(&error_text, &rules.error_keywords) {
            return None;
        }
        if !contains_any(&normalize(input), &rules.input_keywords) {
            return None;
        }

        let combined = normalize(&format!("{} {}", error.message(), input));
        let provider = infer(&rules.providers, &combined);
        let operation = infer(&rules.operations, &combined)
            .map(|rule| rule.name.clone())
            .unwrap_or_else(|| rules.default_operation.clone());
        let provider_name = provider
            .map(|rule| rule.name.clone())
            .unwrap_or_else(|| rules.default_provider.clone());

        let params = extract_json_object(error.message()).unwrap_or_else(|| {
            provider
                .or_else(|| rules.providers.iter().find(|r| r.name == provider_name))
                .map(|rule| rule.defaults.clone())
                .filter(|v| !v.is_null())
                .unwrap_or_else(|| serde_json::json!({}))
        });

        Some(ProvisioningFailure {
            provider: provider_name,
            operation,
            params,
        })
    }

    /// Service a tool belongs to.
    ///
    /// Provider keywords in the tool name win, then an explicit `ns.tool` or
    /// `ns:tool` namespace. Bare verb-style names fall back to `general`.
    pub fn tool_service(&self, name: &str) -> String {
        if let Some(provider) = infer(&self.book.provisioning.providers, &normalize(name)) {
            return provider.name.clone();
        }
        match name.split_once(['.', ':']) {
            Some((namespace, _)) if !namespace.is_empty() => namespace.to_lowercase(),
            _ => "general".to_string(),
        }
    }

    /// Continuation prompt for the turn after `iteration`, rotating.
    pub fn continuation_prompt(&self, iteration: u32, outcome: Outcome) -> String {
        if outcome == Outcome::ContinueCautiously {
            return self.book.cautious_prompt.clone();
        }
        let prompts = &self.book.continuation_prompts;
        if prompts.is_empty() {
            return "Continue.".to_string();
        }
        let index = (iteration.saturating_sub(1) as usize) % prompts.len();
        prompts[index].clone()
    }
}

/// First `{` to last `}` of `text`, if that slice parses as a JSON object.
pub fn extract_json_object(text: &str) -> Option<serde_json::Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<serde_json::Value>(&text[start..=end])
        .ok()
        .filter(|v| v.is_object())
}

fn infer<'a>(rules: &'a [InferenceRule], normalized: &str) -> Option<&'a InferenceRule> {
    rules.iter().find(|rule| contains_any(normalized, &rule.keywords))
}

fn compile_all(patterns: &[String]) -> ChatResult<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            RegexBuilder::new(p)
                .case_insensitive(true)
                .build()
                .map_err(|e| ChatError::Rule {
                    pattern: p.clone(),
                    message: e.to_string(),
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> Classifier {
        Classifier::standard().unwrap()
    }

    const FILLER: &str = "The database schema looks reasonable and the application code \
        has a clear structure overall";

    #[test]
    fn test_completion_stops() {
        let d = classifier().decide(
            "Great news: deployment completed successfully and the app is reachable.",
            2,
        );
        assert_eq!(d.class, SignalClass::Completion);
        assert_eq!(d.outcome, Outcome::Stop);
    }

    #[test]
    fn test_failure_beats_activity() {
        let d = classifier().decide(
            "Configuring the firewall when authentication failed for the provider, next step blocked.",
            1,
        );
        assert_eq!(d.class, SignalClass::CriticalFailure);
    }

    #[test]
    fn test_external_wait_beats_active_provisioning() {
        let c = classifier();
        let wait = c.decide(
            "The droplet is created and provisioning in progress, this can take a few minutes.",
            1,
        );
        assert_eq!(wait.class, SignalClass::ExternalWait);

        let active = c.decide(
            "I am now provisioning the database cluster and will attach it to the private network.",
            1,
        );
        assert_eq!(active.class, SignalClass::ActiveWork);
        assert_eq!(active.outcome, Outcome::Continue);
    }

    #[test]
    fn test_tool_execution_and_progress_markers() {
        let c = classifier();
        let tool = c.decide(
            "Executing create_droplet with the size you picked, results will follow in a moment.",
            5,
        );
        assert_eq!(tool.class, SignalClass::ToolExecution);

        let progress = c.decide(
            "Step 2 of 5 finished. The container registry is ready for the image push now.",
            5,
        );
        assert_eq!(progress.class, SignalClass::ProgressMarker);
    }

    #[test]
    fn test_short_reply_and_question() {
        let c = classifier();
        assert_eq!(c.decide("Done.", 1).class, SignalClass::ShortReply);
        let q = c.decide(
            "The image built fine and the registry accepted it, shall I also wire up staging?",
            1,
        );
        assert_eq!(q.class, SignalClass::Question);
        assert_eq!(q.outcome, Outcome::Stop);
    }

    #[test]
    fn test_iteration_fallback_bands() {
        let c = classifier();
        assert_eq!(c.decide(FILLER, 1).outcome, Outcome::Continue);
        assert_eq!(c.decide(FILLER, 3).outcome, Outcome::Continue);
        assert_eq!(c.decide(FILLER, 4).outcome, Outcome::ContinueCautiously);
        assert_eq!(c.decide(FILLER, 6).outcome, Outcome::ContinueCautiously);
        assert_eq!(c.decide(FILLER, 7).class, SignalClass::Default);
        assert_eq!(c.decide(FILLER, 7).outcome, Outcome::Stop);
        assert_eq!(c.decide(FILLER, 9).class, SignalClass::IterationFallback);
        assert_eq!(c.decide(FILLER, 9).outcome, Outcome::Stop);
    }

    #[test]
    fn test_intent() {
        let c = classifier();
        assert!(c.is_deployment_request("deploy my React app to production"));
        assert!(c.is_deployment_request("Can you create a small server for my blog?"));
        assert!(!c.is_deployment_request("what does this error mean"));

        assert!(c.is_execute_command("yes"));
        assert!(c.is_execute_command("OK go ahead"));
        assert!(!c.is_execute_command("yesterday the build broke"));
        assert!(!c.is_execute_command(
            "yes I think we should talk about the pricing of the managed database first"
        ));
    }

    #[test]
    fn test_new_deployment_request_is_not_an_execute_command() {
        let c = classifier();
        assert!(!c.is_execute_command("start a new droplet in fra1"));
        assert!(!c.is_execute_command("go deploy my blog to aws"));

        assert!(c.is_execute_command("deploy it"));
        assert!(c.is_execute_command("Yes, deploy it now"));
        assert!(c.is_execute_command("ok, let's go"));
    }

    #[test]
    fn test_categorize_untyped_errors() {
        let c = classifier();
        assert_eq!(
            c.categorize(&BackendError::Other("No LLM credentials configured".into())),
            ErrorCategory::MissingCredentials
        );
        assert_eq!(
            c.categorize(&BackendError::Other("HTTP 429: Too Many Requests".into())),
            ErrorCategory::RateLimited
        );
        assert_eq!(
            c.categorize(&BackendError::Other("socket closed".into())),
            ErrorCategory::Internal
        );
        assert_eq!(
            c.categorize(&BackendError::InvalidKey("bad".into())),
            ErrorCategory::InvalidKey
        );
    }

    #[test]
    fn test_provisioning_failure_inference() {
        let c = classifier();
        let err = BackendError::Other("droplet create failed: rate limit reached".into());
        let failure = c
            .provisioning_failure(&err, "deploy my React app to production")
            .unwrap();
        assert_eq!(failure.provider, "digitalocean");
        assert_eq!(failure.operation, "provision_infrastructure");
        assert_eq!(failure.params["region"], "nyc1");

        let err = BackendError::Other(
            r#"instance launch failed {"region": "eu-west-1", "instance_type": "t3.large"}"#.into(),
        );
        let failure = c.provisioning_failure(&err, "provision an ec2 box on aws").unwrap();
        assert_eq!(failure.provider, "aws");
        assert_eq!(failure.params["instance_type"], "t3.large");

        let dns = BackendError::Provisioning("record update rejected".into());
        let failure = c.provisioning_failure(&dns, "deploy and point my domain at it").unwrap();
        assert_eq!(failure.operation, "configure_dns");
    }

    #[test]
    fn test_provisioning_requires_deployment_input_and_no_credential_error() {
        let c = classifier();
        let err = BackendError::Other("droplet limit reached".into());
        assert!(c.provisioning_failure(&err, "tell me a joke").is_none());

        let creds = BackendError::Other("No LLM credentials for droplet tools".into());
        assert!(c.provisioning_failure(&creds, "deploy it").is_none());
    }

    #[test]
    fn test_untyped_invalid_key_is_never_recoverable() {
        let c = classifier();
        for text in [
            "droplet create failed: invalid api key",
            "droplet provisioning failed: 401 unauthorized",
        ] {
            let err = BackendError::Other(text.into());
            assert_eq!(c.categorize(&err), ErrorCategory::InvalidKey, "{}", text);
            assert!(c.provisioning_failure(&err, "deploy my app to digitalocean").is_none());
        }
        let typed = BackendError::InvalidKey("droplet create failed".into());
        assert!(c.provisioning_failure(&typed, "deploy my app").is_none());
    }

    #[test]
    fn test_tool_service_uses_provider_keywords() {
        let c = classifier();
        assert_eq!(c.tool_service("digitalocean_create_droplet"), "digitalocean");
        assert_eq!(c.tool_service("create_droplet"), "digitalocean");
        assert_eq!(c.tool_service("aws.ec2.run_instances"), "aws");
        assert_eq!(c.tool_service("github.create_repo"), "github");
        assert_eq!(c.tool_service("run_instances"), "general");
        assert_eq!(c.tool_service("ping"), "general");
    }

    #[test]
    fn test_extract_json_object() {
        assert_eq!(
            extract_json_object(r#"failed with {"size": "s-2vcpu"} (retryable)"#),
            Some(serde_json::json!({"size": "s-2vcpu"}))
        );
        assert_eq!(extract_json_object("no braces"), None);
        assert_eq!(extract_json_object("{not json}"), None);
    }

    #[test]
    fn test_continuation_prompts_rotate() {
        let c = classifier();
        let first = c.continuation_prompt(1, Outcome::Continue);
        let second = c.continuation_prompt(2, Outcome::Continue);
        assert_ne!(first, second);
        assert_eq!(c.continuation_prompt(5, Outcome::Continue), first);
        assert_eq!(
            c.continuation_prompt(4, Outcome::ContinueCautiously),
            c.book().cautious_prompt
        );
    }

    #[test]
    fn test_bad_pattern_is_reported() {
        let mut book = RuleBook::standard();
        book.intent.deployment_patterns.push("(unclosed".into());
        assert!(matches!(Classifier::new(book), Err(ChatError::Rule { .. })));
    }
}
