//! Message domain types.
//!
//! A [`Message`] is one turn's contribution to the conversation. The agent's
//! history store owns every message; everything else sees snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The operator
    User,
    /// The language model
    Assistant,
    /// Instructions and notices injected by the runtime
    System,
    /// Tool execution result
    Tool,
}

/// Why the runtime (rather than the operator or the model) produced a message.
///
/// Stored under the `kind` metadata key so it survives serialization into
/// transcripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Situational grounding appended after a tool batch
    Reminder,
    /// Corrective nudge after the model described an action without acting
    Nudge,
    /// Terminal notice recorded when the operator stops a turn
    Stopped,
    /// Synthetic summary standing in for compressed history
    Summary,
    /// Operator instruction injected mid-turn
    Interrupt,
    /// Outcome of a delegated task, recorded in the parent conversation
    TaskResult,
}

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,

    /// Who sent this message
    pub role: Role,

    /// The text content (assistant turns that only call tools may have none)
    #[serde(default)]
    pub content: Option<String>,

    /// Tool calls requested by the assistant (if any)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,

    /// If this is a tool result, which tool call it responds to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Timestamp
    pub timestamp: DateTime<Utc>,

    /// Optional metadata (message kind, provider info, etc.)
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Message {
    fn with_role(role: Role, content: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            timestamp: Utc::now(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, Some(content.into()))
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, Some(content.into()))
    }

    /// Create an assistant message carrying tool calls. Empty text is
    /// stored as `None`.
    pub fn assistant_with_calls(content: Option<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        let content = content.filter(|c| !c.is_empty());
        let mut msg = Self::with_role(Role::Assistant, content);
        msg.tool_calls = tool_calls;
        msg
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, Some(content.into()))
    }

    /// Create a tool result message.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut msg = Self::with_role(Role::Tool, Some(content.into()));
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }

    /// Tag this message with a runtime kind.
    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        if let Ok(value) = serde_json::to_value(kind) {
            self.metadata.insert("kind".into(), value);
        }
        self
    }

    /// The runtime kind, if this message was produced by the runtime.
    pub fn kind(&self) -> Option<MessageKind> {
        self.metadata
            .get("kind")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// The text content, or an empty string.
    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }

    /// Whether this is an assistant message that requested tools.
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// A tool call embedded in an assistant message.
///
/// `arguments` is the raw accumulated text exactly as the model produced it;
/// it is valid JSON once the call is complete, but nothing here guarantees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Opaque, provider-issued call ID
    pub id: String,

    /// Name of the tool to invoke
    pub name: String,

    /// Arguments as raw JSON text
    pub arguments: String,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_user_message() {
        let msg = Message::user("Hello, agent!");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.text(), "Hello, agent!");
        assert!(msg.tool_calls.is_empty());
        assert!(msg.kind().is_none());
    }

    #[test]
    fn assistant_with_calls_drops_empty_text() {
        let msg = Message::assistant_with_calls(
            Some(String::new()),
            vec![ToolCallRequest::new("call_1", "list_dir", "{}")],
        );
        assert!(msg.content.is_none());
        assert!(msg.has_tool_calls());
    }

    #[test]
    fn kind_survives_serialization() {
        let msg = Message::system("stopped").with_kind(MessageKind::Stopped);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""kind":"stopped""#));

        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind(), Some(MessageKind::Stopped));
        assert_eq!(back.role, Role::System);
    }

    #[test]
    fn tool_result_references_call() {
        let msg = Message::tool_result("call_9", "ok");
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_9"));
    }

    #[test]
    fn null_content_deserializes() {
        let json = r#"{"id":"m1","role":"assistant","content":null,"timestamp":"2025-01-01T00:00:00Z"}"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert!(msg.content.is_none());
        assert_eq!(msg.text(), "");
    }
}
