//! Operator approval for guarded tool calls.
//!
//! The tool pipeline asks an [`Approver`] before running any call whose
//! policy requires it. Terminal and bridge front-ends each provide their own.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What the operator decided about a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    /// Run this call
    Accept,
    /// Skip this call
    Deny,
    /// Run this call and every later call of the same tool this session
    Always,
    /// Skip this call and every later call of the same tool this session
    Never,
}

impl ApprovalDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Accept | Self::Always)
    }

    /// Whether the decision should be remembered for the tool.
    pub fn is_sticky(&self) -> bool {
        matches!(self, Self::Always | Self::Never)
    }

    /// Parse an operator answer. Accepts the long names plus the terminal
    /// shorthands `y`, `n`, `a` and `N`.
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim() {
            "N" => Some(Self::Never),
            other => match other.to_lowercase().as_str() {
                "y" | "yes" | "accept" | "approve" => Some(Self::Accept),
                "n" | "no" | "deny" | "reject" => Some(Self::Deny),
                "a" | "always" => Some(Self::Always),
                "never" => Some(Self::Never),
                _ => None,
            },
        }
    }
}

/// A pending approval, as shown to the operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

impl ApprovalRequest {
    /// One-line rendering of the call for prompts.
    pub fn preview(&self) -> String {
        let args = serde_json::to_string(&self.arguments).unwrap_or_default();
        format!("{}({})", self.tool_name, args)
    }
}

/// The operator's answer, optionally with a note that is passed to the model
/// when the call is denied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalReply {
    pub decision: ApprovalDecision,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl ApprovalReply {
    pub fn new(decision: ApprovalDecision) -> Self {
        Self {
            decision,
            note: None,
        }
    }
}

/// Something that can answer approval requests.
#[async_trait]
pub trait Approver: Send + Sync {
    async fn request(&self, request: ApprovalRequest) -> ApprovalReply;
}

/// Answers every request with the same decision. Used for non-interactive
/// runs and tests.
pub struct AutoApprover {
    decision: ApprovalDecision,
}

impl AutoApprover {
    pub fn new(decision: ApprovalDecision) -> Self {
        Self { decision }
    }

    pub fn accept_all() -> Self {
        Self::new(ApprovalDecision::Accept)
    }

    pub fn deny_all() -> Self {
        Self::new(ApprovalDecision::Deny)
    }
}

#[async_trait]
impl Approver for AutoApprover {
    async fn request(&self, _request: ApprovalRequest) -> ApprovalReply {
        ApprovalReply::new(self.decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_shorthands() {
        assert_eq!(ApprovalDecision::parse("y"), Some(ApprovalDecision::Accept));
        assert_eq!(ApprovalDecision::parse(" Yes "), Some(ApprovalDecision::Accept));
        assert_eq!(ApprovalDecision::parse("n"), Some(ApprovalDecision::Deny));
        assert_eq!(ApprovalDecision::parse("a"), Some(ApprovalDecision::Always));
        assert_eq!(ApprovalDecision::parse("N"), Some(ApprovalDecision::Never));
        assert_eq!(ApprovalDecision::parse("never"), Some(ApprovalDecision::Never));
        assert_eq!(ApprovalDecision::parse("maybe"), None);
    }

    #[test]
    fn decision_flags() {
        assert!(ApprovalDecision::Always.is_approved());
        assert!(ApprovalDecision::Always.is_sticky());
        assert!(!ApprovalDecision::Deny.is_approved());
        assert!(!ApprovalDecision::Deny.is_sticky());
    }

    #[test]
    fn preview_includes_arguments() {
        let req = ApprovalRequest {
            call_id: "call_1".into(),
            tool_name: "shell".into(),
            arguments: serde_json::json!({"command": "ls -la"}),
        };
        assert_eq!(req.preview(), r#"shell({"command":"ls -la"})"#);
    }

    #[tokio::test]
    async fn auto_approver_is_constant() {
        let approver = AutoApprover::deny_all();
        let reply = approver
            .request(ApprovalRequest {
                call_id: "c".into(),
                tool_name: "shell".into(),
                arguments: serde_json::json!({}),
            })
            .await;
        assert_eq!(reply.decision, ApprovalDecision::Deny);
    }
}
