//! "Said it, didn't do it" detection.
//!
//! When a turn ends with text only, the loop checks whether the model
//! described an action ("let me list the directory") instead of calling the
//! tool for it. A match injects one corrective system message and the loop
//! goes around again, up to `max_nudges` times per turn.
//!
//! Everything here is heuristic, so the rules are data: the built-in set can
//! be disabled and extended from `[nudge]` config.

use kestrel_config::{NudgeConfig, NudgeRuleConfig};

/// Replies longer than this are treated as real answers and not checked.
pub const MAX_CHECKED_CHARS: usize = 4000;

/// Phrases that mean the model is talking to the operator, not narrating
/// its next step.
const IGNORE_PHRASES: &[&str] = &[
    "let me know",
    "would you like",
    "do you want",
    "if you'd like",
    "if you want",
    "should i",
    "shall i",
];

/// Fires when the text contains any trigger and, if `requires_any` is
/// non-empty, also one of those.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NudgeRule {
    pub triggers: Vec<String>,
    pub requires_any: Vec<String>,
    pub message: String,
}

impl NudgeRule {
    pub fn new(triggers: &[&str], requires_any: &[&str], message: &str) -> Self {
        Self {
            triggers: triggers.iter().map(|s| s.to_lowercase()).collect(),
            requires_any: requires_any.iter().map(|s| s.to_lowercase()).collect(),
            message: message.to_string(),
        }
    }

    fn matches(&self, lowered: &str) -> bool {
        self.triggers.iter().any(|t| lowered.contains(t.as_str()))
            && (self.requires_any.is_empty()
                || self.requires_any.iter().any(|r| lowered.contains(r.as_str())))
    }
}

impl From<&NudgeRuleConfig> for NudgeRule {
    fn from(c: &NudgeRuleConfig) -> Self {
        Self {
            triggers: c.triggers.iter().map(|s| s.to_lowercase()).collect(),
            requires_any: c.requires_any.iter().map(|s| s.to_lowercase()).collect(),
            message: c.message.clone(),
        }
    }
}

/// The built-in rules: todo checks, directory listing, opening files.
pub fn builtin_rules() -> Vec<NudgeRule> {
    vec![
        NudgeRule::new(
            &["todo.md", "todo list", "my todos", "the todos"],
            &["check", "update", "look at", "review", "mark"],
            "You said you would check or update the todo list but did not call a tool. \
             Call todo_write now instead of describing it.",
        ),
        NudgeRule::new(
            &[
                "let me list",
                "i'll list",
                "i will list",
                "let me explore",
                "let me look at the directory",
                "let me see what files",
            ],
            &[],
            "You said you would list a directory but did not call a tool. \
             Call list_dir now instead of describing it.",
        ),
        NudgeRule::new(
            &[
                "let me open",
                "let me read",
                "i'll open",
                "i'll read",
                "i will open",
                "i will read",
                "let me check the file",
            ],
            &[],
            "You said you would open a file but did not call a tool. \
             Call file_read now instead of describing it.",
        ),
    ]
}

#[derive(Debug, Clone, Default)]
pub struct NudgeDetector {
    rules: Vec<NudgeRule>,
}

impl NudgeDetector {
    pub fn new(rules: Vec<NudgeRule>) -> Self {
        Self { rules }
    }

    /// A detector that never fires.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn from_config(config: &NudgeConfig) -> Self {
        if !config.enabled {
            return Self::disabled();
        }
        let mut rules = if config.builtin_rules {
            builtin_rules()
        } else {
            Vec::new()
        };
        rules.extend(config.rules.iter().map(NudgeRule::from));
        Self::new(rules)
    }

    pub fn is_enabled(&self) -> bool {
        !self.rules.is_empty()
    }

    /// The corrective message for `text`, if any rule fires.
    pub fn check(&self, text: &str) -> Option<&str> {
        let text = text.trim();
        if text.is_empty() || text.chars().count() > MAX_CHECKED_CHARS {
            return None;
        }

        let lowered = text.to_lowercase();
        if IGNORE_PHRASES.iter().any(|p| lowered.contains(p)) {
            return None;
        }

        self.rules
            .iter()
            .find(|r| r.matches(&lowered))
            .map(|r| r.message.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> NudgeDetector {
        NudgeDetector::new(builtin_rules())
    }

    #[test]
    fn described_listing_fires() {
        let d = detector();
        let msg = d.check("Sure. Let me list the files in src first.");
        assert!(msg.unwrap().contains("list_dir"));
    }

    #[test]
    fn todo_rule_needs_an_action_word() {
        let d = detector();
        assert!(d.check("I'll check todo.md before continuing.").is_some());
        assert!(d.check("The todo list format is markdown.").is_none());
    }

    #[test]
    fn questions_to_the_operator_are_ignored() {
        assert!(detector()
            .check("Would you like me to read the config next? Let me know.")
            .is_none());
    }

    #[test]
    fn long_answers_are_not_checked() {
        let text = format!("let me read it. {}", "x".repeat(MAX_CHECKED_CHARS));
        assert!(detector().check(&text).is_none());
    }

    #[test]
    fn config_rules_extend_or_replace_builtins() {
        let config = NudgeConfig {
            enabled: true,
            builtin_rules: false,
            rules: vec![NudgeRuleConfig {
                triggers: vec!["Running The Tests".into()],
                requires_any: vec![],
                message: "Call shell to run the tests.".into(),
            }],
        };
        let d = NudgeDetector::from_config(&config);
        assert_eq!(d.check("I am running the tests now."), Some("Call shell to run the tests."));
        assert!(d.check("Let me list the files.").is_none());

        let off = NudgeDetector::from_config(&NudgeConfig {
            enabled: false,
            ..NudgeConfig::default()
        });
        assert!(!off.is_enabled());
    }
}
