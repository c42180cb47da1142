//! Free-text classification of replies to a plan awaiting approval.

use serde::{Deserialize, Serialize};

/// What the user meant when replying to an approval prompt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    Approve,
    Reject,
    Modify,
    Unclear,
}

/// Keyword lexicon used by [`ApprovalLexicon::parse`].
///
/// Entries are matched as whole words or whole phrases. Modify is checked
/// first, then reject, then approve.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApprovalLexicon {
    pub approve: Vec<String>,
    pub reject: Vec<String>,
    pub modify: Vec<String>,
}

impl Default for ApprovalLexicon {
    fn default() -> Self {
        let words = |list: &[&str]| list.iter().map(|s| s.to_string()).collect();
        Self {
            approve: words(&[
                "yes", "y", "yep", "yeah", "sure", "ok", "okay", "approve", "approved",
                "proceed", "go ahead", "go", "sounds good", "lgtm", "confirm", "confirmed",
                "do it", "execute", "ship it",
            ]),
            reject: words(&[
                "no", "n", "nope", "reject", "rejected", "cancel", "stop", "abort",
                "don't", "do not", "never mind", "nevermind",
            ]),
            modify: words(&[
                "change", "modify", "instead", "update", "adjust", "edit", "rather",
                "switch to", "use a different",
            ]),
        }
    }
}

impl ApprovalLexicon {
    /// Classify a reply to an approval prompt.
    pub fn parse(&self, text: &str) -> ApprovalDecision {
        let normalized = normalize(text);
        if normalized.trim().is_empty() {
            return ApprovalDecision::Unclear;
        }

        if contains_any(&normalized, &self.modify) {
            ApprovalDecision::Modify
        } else if contains_any(&normalized, &self.reject) {
            ApprovalDecision::Reject
        } else if contains_any(&normalized, &self.approve) {
            ApprovalDecision::Approve
        } else {
            ApprovalDecision::Unclear
        }
    }
}

/// Classify with the default lexicon.
pub fn parse_approval_response(text: &str) -> ApprovalDecision {
    ApprovalLexicon::default().parse(text)
}

/// Lowercase, collapse non-word characters to single spaces and pad both
/// ends so that phrase lookups match on word boundaries.
pub fn normalize(text: &str) -> String {
    let words: Vec<String> = text
        .to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .filter(|w| !w.is_empty())
        .map(|w| w.to_string())
        .collect();
    format!(" {} ", words.join(" "))
}

/// Whole-word / whole-phrase lookup against a string produced by [`normalize`].
pub fn contains_any(normalized: &str, phrases: &[String]) -> bool {
    phrases.iter().any(|p| {
        let needle = normalize(p);
        !needle.trim().is_empty() && normalized.contains(&needle)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affirmative_replies_approve() {
        for reply in ["yes", "Yes!", "ok, go ahead", "LGTM", "sounds good to me"] {
            assert_eq!(parse_approval_response(reply), ApprovalDecision::Approve, "{}", reply);
        }
    }

    #[test]
    fn test_negative_replies_reject() {
        for reply in ["no", "Nope.", "cancel that", "please abort", "don't"] {
            assert_eq!(parse_approval_response(reply), ApprovalDecision::Reject, "{}", reply);
        }
    }

    #[test]
    fn test_modify_wins_over_yes_and_no() {
        assert_eq!(
            parse_approval_response("yes but change the region to fra1"),
            ApprovalDecision::Modify
        );
        assert_eq!(
            parse_approval_response("no, use aws instead"),
            ApprovalDecision::Modify
        );
    }

    #[test]
    fn test_unclear() {
        assert_eq!(parse_approval_response(""), ApprovalDecision::Unclear);
        assert_eq!(parse_approval_response("what does step 2 do"), ApprovalDecision::Unclear);
        // "yesterday" must not match "yes"
        assert_eq!(parse_approval_response("yesterday"), ApprovalDecision::Unclear);
    }
}
