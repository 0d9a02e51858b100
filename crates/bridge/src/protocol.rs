//! Bridge wire messages.
//!
//! Inbound commands are one JSON object per line, tagged by `type`.
//! Outbound messages are either an `AgentEvent` or a [`BridgeEvent`], both
//! serialized as `{"type": .., "data": ..}` inside a frame.

use kestrel_core::approval::ApprovalDecision;
use serde::{Deserialize, Serialize};

/// A command from the UI process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundCommand {
    /// Start a turn (or queue one if a turn is running).
    UserInput { message: String },

    /// Answer a pending `tool_approval_requested` event.
    ToolApproval {
        call_id: String,
        decision: ApprovalDecision,
        #[serde(default)]
        content: Option<String>,
    },

    /// Stop the running turn.
    StopAgent,

    /// Redirect the running turn with a new instruction.
    ForceInterrupt { message: String },
}

impl InboundCommand {
    /// Parse one input line. Blank lines yield `None`.
    pub fn parse_line(line: &str) -> Result<Option<Self>, serde_json::Error> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        serde_json::from_str(line).map(Some)
    }
}

/// Bridge-level messages that do not come from the agent loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum BridgeEvent {
    /// Sent once, before any input is read.
    Ready {
        working_directory: String,
        model: String,
    },

    /// An input line could not be understood.
    InvalidInput { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_each_command() {
        let cmd = InboundCommand::parse_line(r#"{"type":"user_input","message":"hi"}"#).unwrap();
        assert_eq!(
            cmd,
            Some(InboundCommand::UserInput {
                message: "hi".into()
            })
        );

        let cmd = InboundCommand::parse_line(
            r#"{"type":"tool_approval","call_id":"c1","decision":"never","content":"too risky"}"#,
        )
        .unwrap();
        assert_eq!(
            cmd,
            Some(InboundCommand::ToolApproval {
                call_id: "c1".into(),
                decision: ApprovalDecision::Never,
                content: Some("too risky".into()),
            })
        );

        assert_eq!(
            InboundCommand::parse_line(r#"{"type":"stop_agent"}"#).unwrap(),
            Some(InboundCommand::StopAgent)
        );
        assert!(InboundCommand::parse_line("   ").unwrap().is_none());
    }

    #[test]
    fn unknown_type_is_an_error() {
        assert!(InboundCommand::parse_line(r#"{"type":"reboot"}"#).is_err());
        assert!(InboundCommand::parse_line("not json").is_err());
    }

    #[test]
    fn bridge_events_share_the_event_shape() {
        let v = serde_json::to_value(BridgeEvent::InvalidInput {
            message: "bad".into(),
        })
        .unwrap();
        assert_eq!(v, json!({"type": "invalid_input", "data": {"message": "bad"}}));
    }
}
