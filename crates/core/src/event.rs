//! Agent events: everything the UI collaborator gets to see.
//!
//! The loop publishes events; front-ends (terminal renderer, process
//! bridge, transcript writer) subscribe. The core never reads UI state back.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Loop controller state, as reported to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    Thinking,
    ToolExecuting,
    AwaitingApproval,
    Interrupted,
}

/// Which class of failure an [`AgentEvent::Error`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Backend unreachable after the non-streaming fallback
    Transport,
    /// Tool arguments that did not parse
    MalformedArguments,
    /// Repeated identical tool failures tripped the circuit breaker
    ToolFailure,
    /// Depth limit reached before the model converged
    RecursionExhausted,
    /// No room left for model output
    Budget,
    /// Invalid configuration
    Config,
}

/// Events emitted by the agent loop.
///
/// Serialized adjacently tagged (`{"type": .., "data": ..}`), which is also
/// the payload format of the process bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum AgentEvent {
    /// A model request is about to be sent.
    ThinkingStarted { depth: u32 },

    /// Partial text from the model, in arrival order.
    TextChunk { text: String },

    /// A guarded tool call is waiting for the operator.
    ToolApprovalRequested {
        call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },

    /// A tool call is starting.
    ToolExecuting {
        call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },

    /// A tool call finished (or was denied, skipped, or cancelled).
    ToolResult {
        call_id: String,
        tool_name: String,
        ok: bool,
        content: String,
    },

    /// The turn converged; the loop is idle again.
    TurnComplete { text: Option<String> },

    /// The operator stopped the turn.
    Stopped,

    /// Something went wrong; the loop keeps running.
    Error { kind: ErrorKind, message: String },

    /// End-of-turn usage summary.
    StatusLine {
        summary: String,
        input_tokens: u64,
        output_tokens: u64,
        context_percent: f64,
        cost_usd: f64,
    },

    /// Informational notice (fallbacks, compression).
    Notice { message: String },

    /// Loop controller state transition.
    StateChanged { state: LoopState },
}

impl AgentEvent {
    /// Stable event name, used for logging and bridge routing.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ThinkingStarted { .. } => "thinking_started",
            Self::TextChunk { .. } => "text_chunk",
            Self::ToolApprovalRequested { .. } => "tool_approval_requested",
            Self::ToolExecuting { .. } => "tool_executing",
            Self::ToolResult { .. } => "tool_result",
            Self::TurnComplete { .. } => "turn_complete",
            Self::Stopped => "stopped",
            Self::Error { .. } => "error",
            Self::StatusLine { .. } => "status_line",
            Self::Notice { .. } => "notice",
            Self::StateChanged { .. } => "state_changed",
        }
    }
}

/// A broadcast-based event bus for agent events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub. A subscriber
/// that falls more than `capacity` events behind loses the oldest ones.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<AgentEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: AgentEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<AgentEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn event_bus_publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(AgentEvent::ToolResult {
            call_id: "call_1".into(),
            tool_name: "shell".into(),
            ok: true,
            content: "done".into(),
        });

        let event = rx.recv().await.unwrap();
        match event.as_ref() {
            AgentEvent::ToolResult { tool_name, ok, .. } => {
                assert_eq!(tool_name, "shell");
                assert!(ok);
            }
            _ => panic!("Expected ToolResult event"),
        }
    }

    #[test]
    fn event_bus_no_subscribers_doesnt_panic() {
        let bus = EventBus::new(16);
        bus.publish(AgentEvent::Stopped);
    }

    #[test]
    fn events_serialize_adjacently_tagged() {
        let json = serde_json::to_value(AgentEvent::TextChunk { text: "hi".into() }).unwrap();
        assert_eq!(json["type"], "text_chunk");
        assert_eq!(json["data"]["text"], "hi");

        let json = serde_json::to_value(AgentEvent::Stopped).unwrap();
        assert_eq!(json["type"], "stopped");

        let json = serde_json::to_value(AgentEvent::Error {
            kind: ErrorKind::RecursionExhausted,
            message: "too deep".into(),
        })
        .unwrap();
        assert_eq!(json["data"]["kind"], "recursion_exhausted");
    }

    #[test]
    fn event_type_matches_serde_tag() {
        let events = vec![
            AgentEvent::ThinkingStarted { depth: 0 },
            AgentEvent::StateChanged { state: LoopState::Idle },
            AgentEvent::TurnComplete { text: None },
            AgentEvent::Notice { message: "x".into() },
        ];
        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["type"], event.event_type());
        }
    }
}
