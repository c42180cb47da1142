//! Heuristic rule tables.
//!
//! Every free-text judgement the coordinator makes (loop continue/stop,
//! deployment intent, execute commands, approval replies, error
//! categories, provisioning failures) is driven by the data in a
//! [`RuleBook`]. The standard book is built in; a YAML file with the same
//! shape replaces it wholesale.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use pilot_core::ApprovalLexicon;

use crate::backend::ErrorCategory;
use crate::error::ChatResult;

/// What the loop controller should do after a reply.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Continue,
    /// Keep going, but ask the backend to check in if it is stuck.
    ContinueCautiously,
    Stop,
}

impl Outcome {
    pub fn continues(&self) -> bool {
        !matches!(self, Self::Stop)
    }
}

/// Signal classes of the loop decision table, in their standard priority.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SignalClass {
    CriticalFailure,
    Completion,
    UserDecision,
    ExternalWait,
    ActiveWork,
    ToolExecution,
    ProgressMarker,
    ShortReply,
    Question,
    IterationFallback,
    Default,
}

/// How a loop rule recognises its signal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Matcher {
    /// Any of the phrases, matched on word boundaries, case-insensitive.
    Phrases { phrases: Vec<String> },
    /// Any of the regexes, case-insensitive.
    Patterns { patterns: Vec<String> },
    /// Fewer than `max_words` whitespace-separated tokens.
    ShortReply { max_words: usize },
    /// Trailing `?` or an interrogative first word.
    Question { openers: Vec<String> },
    /// Current iteration (1-based) within `from..=to`.
    Iterations { from: u32, to: Option<u32> },
    Always,
}

/// One row of the loop decision table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoopRule {
    pub name: String,
    pub class: SignalClass,
    pub matcher: Matcher,
    pub outcome: Outcome,
}

impl LoopRule {
    pub fn new(
        name: impl Into<String>,
        class: SignalClass,
        matcher: Matcher,
        outcome: Outcome,
    ) -> Self {
        Self {
            name: name.into(),
            class,
            matcher,
            outcome,
        }
    }
}

/// Deployment intent and execute-command lexicons
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntentRules {
    pub deployment_keywords: Vec<String>,
    pub deployment_patterns: Vec<String>,
    pub execute_commands: Vec<String>,
    /// Execute commands only count in messages up to this many words.
    pub execute_max_words: usize,
    /// Words allowed next to an execute command that also reads as a
    /// deployment request ("yes, deploy it now").
    #[serde(default)]
    pub execute_filler: Vec<String>,
}

/// Keyword row of the error categorization table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorRule {
    pub category: ErrorCategory,
    pub phrases: Vec<String>,
}

/// A named choice inferred from keywords (provider or operation).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InferenceRule {
    pub name: String,
    pub keywords: Vec<String>,
    /// Parameters to fall back on when the error carries none.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub defaults: serde_json::Value,
}

impl InferenceRule {
    fn new(name: &str, keywords: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            keywords: strings(keywords),
            defaults: serde_json::Value::Null,
        }
    }

    fn with_defaults(mut self, defaults: serde_json::Value) -> Self {
        self.defaults = defaults;
        self
    }
}

/// Provisioning-failure classifier
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProvisioningRules {
    /// Error text must contain one of these.
    pub error_keywords: Vec<String>,
    /// The user's input must contain one of these.
    pub input_keywords: Vec<String>,
    pub providers: Vec<InferenceRule>,
    pub default_provider: String,
    pub operations: Vec<InferenceRule>,
    pub default_operation: String,
}

/// The complete set of heuristic tables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleBook {
    pub loop_rules: Vec<LoopRule>,
    pub intent: IntentRules,
    pub approval: ApprovalLexicon,
    pub errors: Vec<ErrorRule>,
    pub provisioning: ProvisioningRules,
    /// Synthetic user turns injected between loop iterations, used in rotation.
    pub continuation_prompts: Vec<String>,
    /// Injected instead when the decision was `continue_cautiously`.
    pub cautious_prompt: String,
}

impl Default for RuleBook {
    fn default() -> Self {
        Self::standard()
    }
}

impl RuleBook {
    /// The built-in rule book.
    pub fn standard() -> Self {
        Self {
            loop_rules: standard_loop_rules(),
            intent: IntentRules {
                deployment_keywords: strings(&[
                    "deploy", "deploying", "deployment", "redeploy", "provision",
                    "provisioning", "spin up", "infrastructure", "droplet", "kubernetes",
                    "k8s", "load balancer", "hosting", "go live",
                ]),
                deployment_patterns: strings(&[
                    r"\bdeploy\w*\b.*\b(to|on|onto)\b",
                    concat!(
                        r"\b(create|launch|set up|setup|spin up|provision|start)\b.*",
                        r"\b(server|droplet|instance|cluster|database|vm|bucket|app)s?\b",
                    ),
                    r"\bhost\b.*\b(app|site|api|service)\b",
                ]),
                execute_commands: strings(&[
                    "execute", "proceed", "yes", "go ahead", "do it", "run it", "let's go",
                    "start", "make it so", "deploy it", "go",
                ]),
                execute_max_words: 6,
                execute_filler: strings(&[
                    "please", "now", "ok", "okay", "sure", "then", "and", "it", "that",
                    "this", "the", "plan", "right", "away",
                ]),
            },
            approval: ApprovalLexicon::default(),
            errors: vec![
                ErrorRule {
                    category: ErrorCategory::MissingCredentials,
                    phrases: strings(&[
                        "no llm credentials", "missing credentials", "no api key",
                        "api key not configured", "credentials not configured",
                        "no credentials",
                    ]),
                },
                ErrorRule {
                    category: ErrorCategory::InvalidKey,
                    phrases: strings(&[
                        "invalid api key", "invalid key", "incorrect api key",
                        "invalid x-api-key", "unauthorized", "401",
                    ]),
                },
                ErrorRule {
                    category: ErrorCategory::InsufficientCredits,
                    phrases: strings(&[
                        "insufficient credits", "insufficient funds", "credit balance",
                        "payment required", "402", "billing",
                    ]),
                },
                ErrorRule {
                    category: ErrorCategory::RateLimited,
                    phrases: strings(&["rate limit", "rate limited", "too many requests", "429"]),
                },
            ],
            provisioning: ProvisioningRules {
                error_keywords: strings(&[
                    "droplet", "instance", "provision", "provisioning", "cluster", "volume",
                    "load balancer", "vpc", "deployment failed", "resource", "quota",
                ]),
                input_keywords: strings(&[
                    "deploy", "deploying", "deployment", "provision", "provisioning",
                    "create", "launch", "spin up", "infrastructure", "server", "droplet",
                ]),
                providers: vec![
                    InferenceRule::new(
                        "digitalocean",
                        &["digitalocean", "digital ocean", "droplet", "droplets", "doks"],
                    )
                    .with_defaults(serde_json::json!({
                        "region": "nyc1",
                        "size": "s-1vcpu-1gb",
                        "image": "ubuntu-22-04-x64",
                    })),
                    InferenceRule::new("aws", &["aws", "amazon", "ec2", "s3", "lambda", "eks"])
                        .with_defaults(serde_json::json!({
                            "region": "us-east-1",
                            "instance_type": "t3.micro",
                        })),
                    InferenceRule::new("gcp", &["gcp", "google cloud", "gce", "gke", "cloud run"])
                        .with_defaults(serde_json::json!({
                            "region": "us-central1",
                            "machine_type": "e2-micro",
                        })),
                    InferenceRule::new("azure", &["azure", "aks", "microsoft"])
                        .with_defaults(serde_json::json!({
                            "region": "eastus",
                            "vm_size": "Standard_B1s",
                        })),
                ],
                default_provider: "digitalocean".to_string(),
                operations: vec![
                    InferenceRule::new(
                        "deploy_application",
                        &[
                            "app platform",
                            "application deployment",
                            "deploy application",
                            "build failed",
                        ],
                    ),
                    InferenceRule::new(
                        "scale_resources",
                        &["scale", "scaling", "resize", "autoscale"],
                    ),
                    InferenceRule::new("configure_dns", &["dns", "domain", "cname", "nameserver"]),
                ],
                default_operation: "provision_infrastructure".to_string(),
            },
            continuation_prompts: strings(&[
                "Continue with the next step.",
                "Please proceed with the deployment.",
                "Keep going with the remaining work.",
                "Carry on where you left off.",
            ]),
            cautious_prompt: "Continue if you can. If you are blocked or need a decision from me, \
                stop and summarize where things stand."
                .to_string(),
        }
    }

    /// Load a rule book from a YAML file.
    pub fn from_yaml_file(path: &Path) -> ChatResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let book: Self = serde_yaml::from_str(&content)?;
        debug!(
            "Loaded rule book from {} ({} loop rules)",
            path.display(),
            book.loop_rules.len()
        );
        Ok(book)
    }

    pub fn to_yaml(&self) -> ChatResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

fn standard_loop_rules() -> Vec<LoopRule> {
    use Outcome::*;
    use SignalClass::*;

    let phrases = |list: &[&str]| Matcher::Phrases {
        phrases: strings(list),
    };

    vec![
        LoopRule::new(
            "critical-failure",
            CriticalFailure,
            phrases(&[
                "authentication failed", "quota exceeded", "permission denied",
                "access denied", "fatal error", "cannot continue", "unable to proceed",
            ]),
            Stop,
        ),
        LoopRule::new(
            "completion",
            Completion,
            phrases(&[
                "deployment completed successfully", "all steps completed",
                "successfully deployed", "deployment is complete", "is now live",
                "all tasks completed",
            ]),
            Stop,
        ),
        LoopRule::new(
            "user-decision",
            UserDecision,
            phrases(&[
                "which would you prefer", "please confirm", "would you like me to",
                "do you want me to", "please provide", "let me know which",
                "need your input",
            ]),
            Stop,
        ),
        LoopRule::new(
            "external-wait",
            ExternalWait,
            phrases(&[
                "provisioning in progress", "dns propagation in progress", "waiting for",
                "propagation can take", "check back",
            ]),
            Stop,
        ),
        LoopRule::new(
            "active-work",
            ActiveWork,
            phrases(&[
                "next step", "configuring", "provisioning the", "now creating",
                "setting up", "installing", "proceeding to", "i will now",
            ]),
            Continue,
        ),
        LoopRule::new(
            "tool-execution",
            ToolExecution,
            Matcher::Patterns {
                patterns: strings(&[
                    r"\b(executing|calling|running|invoking)\s+(the\s+)?[a-z_][\w.\-]*",
                ]),
            },
            Continue,
        ),
        LoopRule::new(
            "progress-marker",
            ProgressMarker,
            Matcher::Patterns {
                patterns: strings(&[r"\bstep\s+\d+\s+of\b", r"\bphase\s+\d+\s*:"]),
            },
            Continue,
        ),
        LoopRule::new("short-reply", ShortReply, Matcher::ShortReply { max_words: 10 }, Stop),
        LoopRule::new(
            "question",
            Question,
            Matcher::Question {
                openers: strings(&[
                    "what", "which", "how", "should", "would", "could", "do", "does", "can",
                    "shall", "is", "are", "where", "when", "who",
                ]),
            },
            Stop,
        ),
        LoopRule::new(
            "early-iterations",
            IterationFallback,
            Matcher::Iterations { from: 1, to: Some(3) },
            Continue,
        ),
        LoopRule::new(
            "middle-iterations",
            IterationFallback,
            Matcher::Iterations { from: 4, to: Some(6) },
            ContinueCautiously,
        ),
        LoopRule::new(
            "late-iterations",
            IterationFallback,
            Matcher::Iterations { from: 8, to: None },
            Stop,
        ),
        LoopRule::new("default", Default, Matcher::Always, Stop),
    ]
}

fn strings(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}
