//! The stream processor.
//!
//! Drives one model turn: consumes text and tool-call deltas, surfaces text
//! as it arrives, reassembles tool calls by index, and races every delta
//! against the interrupt channel.
//!
//! Per turn the processor moves `Empty -> Streaming -> Finalizing -> Sealed`.
//! A transport failure (at connect time or mid-stream) and a stream that
//! ends with nothing in it both get one non-streaming retry.

use crate::interrupt::{InterruptReceiver, Signal};
use kestrel_core::error::ProviderError;
use kestrel_core::event::{AgentEvent, EventBus};
use kestrel_core::message::{Message, ToolCallRequest};
use kestrel_core::provider::{ModelRequest, ModelResponse, Provider, StreamChunk, Usage};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Assistant text used when the model produced nothing usable.
pub const FALLBACK_APOLOGY: &str =
    "Sorry, I encountered a technical problem and could not produce a response.";

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The stream ran to its end.
    Completed,
    /// The operator stopped the turn.
    Stopped,
    /// The operator injected an instruction; the loop should continue with it.
    Interrupted(String),
}

/// A tool call whose argument text is complete.
#[derive(Debug, Clone, PartialEq)]
pub struct SealedToolCall {
    pub request: ToolCallRequest,
    /// Parsed arguments, or why they did not parse
    pub arguments: Result<serde_json::Value, String>,
}

impl SealedToolCall {
    fn seal(request: ToolCallRequest) -> Self {
        let raw = request.arguments.trim();
        let arguments = if raw.is_empty() {
            Ok(serde_json::Value::Object(serde_json::Map::new()))
        } else {
            match serde_json::from_str::<serde_json::Value>(raw) {
                Ok(v) if v.is_object() => Ok(v),
                Ok(_) => Err("arguments must be a JSON object".to_string()),
                Err(e) => Err(format!("invalid JSON arguments: {e}")),
            }
        };
        Self { request, arguments }
    }
}

/// Everything the loop needs from one turn.
#[derive(Debug, Clone)]
pub struct TurnResult {
    /// The sealed assistant message (content + tool calls)
    pub message: Message,
    pub calls: Vec<SealedToolCall>,
    pub outcome: StreamOutcome,
    pub usage: Option<Usage>,
    /// Model name reported by the backend, if any
    pub model: Option<String>,
    /// Set when both the stream and the fallback failed
    pub transport_error: Option<ProviderError>,
}

impl TurnResult {
    /// Whether the assistant produced neither text nor tool calls.
    pub fn is_empty(&self) -> bool {
        self.message.text().trim().is_empty() && self.calls.is_empty()
    }
}

#[derive(Debug)]
struct PartialCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Accumulates deltas for one turn.
#[derive(Debug, Default)]
struct TurnBuffer {
    text: String,
    calls: BTreeMap<u32, PartialCall>,
    usage: Option<Usage>,
}

impl TurnBuffer {
    fn apply(&mut self, chunk: StreamChunk, events: &EventBus) {
        if let Some(text) = chunk.text
            && !text.is_empty()
        {
            self.text.push_str(&text);
            events.publish(AgentEvent::TextChunk { text });
        }

        for delta in chunk.tool_calls {
            let call = self.calls.entry(delta.index).or_insert_with(|| {
                trace!(index = delta.index, "Tool call opened");
                PartialCall {
                    id: None,
                    name: String::new(),
                    arguments: String::new(),
                }
            });
            if let Some(id) = delta.id.filter(|id| !id.is_empty()) {
                call.id = Some(id);
            }
            if let Some(name) = delta.name.filter(|n| !n.is_empty()) {
                call.name = name;
            }
            if let Some(fragment) = delta.arguments {
                call.arguments.push_str(&fragment);
            }
        }

        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }
    }

    fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.calls.is_empty()
    }

    /// Seal every call in index order and build the assistant message.
    fn seal(self) -> (Message, Vec<SealedToolCall>, Option<Usage>) {
        let calls: Vec<SealedToolCall> = self
            .calls
            .into_values()
            .map(|c| {
                let id = c
                    .id
                    .unwrap_or_else(|| format!("call_{}", Uuid::new_v4().simple()));
                SealedToolCall::seal(ToolCallRequest::new(id, c.name, c.arguments))
            })
            .collect();
        let requests = calls.iter().map(|c| c.request.clone()).collect();
        let message = Message::assistant_with_calls(Some(self.text), requests);
        (message, calls, self.usage)
    }

    /// Partial text only; unfinished tool calls are dropped.
    fn into_partial(self) -> Message {
        Message::assistant_with_calls(Some(self.text), vec![])
    }

    fn from_response(response: ModelResponse, events: &EventBus) -> Self {
        let mut buffer = TurnBuffer::default();
        buffer.apply(kestrel_core::provider::response_as_chunk(response), events);
        buffer
    }
}

enum Drive {
    Ended,
    Signal(Signal),
    Failed(ProviderError),
}

/// Consumes one model turn.
pub struct StreamProcessor {
    provider: Arc<dyn Provider>,
    events: EventBus,
}

impl StreamProcessor {
    pub fn new(provider: Arc<dyn Provider>, events: EventBus) -> Self {
        Self { provider, events }
    }

    pub async fn run(
        &self,
        request: ModelRequest,
        interrupts: &mut InterruptReceiver,
    ) -> TurnResult {
        let mut buffer = TurnBuffer::default();

        // Signals that arrived before the request went out still count.
        if let Some(signal) = interrupts.poll() {
            return self.interrupted(signal, buffer);
        }

        let drive = match self.provider.stream(request.clone()).await {
            Ok(mut rx) => {
                trace!("Streaming");
                let mut listening = true;
                loop {
                    tokio::select! {
                        biased;
                        signal = interrupts.recv(), if listening => match signal {
                            Some(signal) => break Drive::Signal(signal),
                            None => listening = false,
                        },
                        item = rx.recv() => match item {
                            Some(Ok(chunk)) => buffer.apply(chunk, &self.events),
                            Some(Err(e)) => break Drive::Failed(e),
                            None => break Drive::Ended,
                        },
                    }
                }
                // dropping `rx` here cancels the producer task
            }
            Err(e) => Drive::Failed(e),
        };

        match drive {
            Drive::Signal(signal) => self.interrupted(signal, buffer),
            Drive::Failed(e) => {
                warn!(error = %e, streamed_chars = buffer.text.len(), "Model stream failed, retrying without streaming");
                self.events.publish(AgentEvent::Notice {
                    message: format!("Streaming failed ({e}); retrying without streaming"),
                });
                self.fallback(request, interrupts).await
            }
            Drive::Ended if buffer.is_empty() => {
                debug!("Stream ended empty, retrying without streaming");
                self.events.publish(AgentEvent::Notice {
                    message: "Model returned an empty response; retrying without streaming".into(),
                });
                let mut result = self.fallback(request, interrupts).await;
                if result.usage.is_none() {
                    result.usage = buffer.usage;
                }
                result
            }
            Drive::Ended => {
                trace!(calls = buffer.calls.len(), "Finalizing turn");
                let (message, calls, usage) = buffer.seal();
                TurnResult {
                    message,
                    calls,
                    outcome: StreamOutcome::Completed,
                    usage,
                    model: None,
                    transport_error: None,
                }
            }
        }
    }

    /// One non-streaming attempt, still interruptible.
    async fn fallback(&self, request: ModelRequest, interrupts: &mut InterruptReceiver) -> TurnResult {
        let response = tokio::select! {
            biased;
            Some(signal) = interrupts.recv() => {
                return self.interrupted(signal, TurnBuffer::default());
            }
            response = self.provider.complete(request) => response,
        };

        match response {
            Ok(response) => {
                let model = Some(response.model.clone()).filter(|m| !m.is_empty());
                let buffer = TurnBuffer::from_response(response, &self.events);
                if buffer.is_empty() {
                    warn!("Fallback response was empty too");
                    return self.apology(buffer.usage, None);
                }
                let (message, calls, usage) = buffer.seal();
                TurnResult {
                    message,
                    calls,
                    outcome: StreamOutcome::Completed,
                    usage,
                    model,
                    transport_error: None,
                }
            }
            Err(e) => {
                warn!(error = %e, "Non-streaming fallback failed");
                self.apology(None, Some(e))
            }
        }
    }

    fn apology(&self, usage: Option<Usage>, error: Option<ProviderError>) -> TurnResult {
        self.events.publish(AgentEvent::TextChunk {
            text: FALLBACK_APOLOGY.to_string(),
        });
        TurnResult {
            message: Message::assistant(FALLBACK_APOLOGY),
            calls: Vec::new(),
            outcome: StreamOutcome::Completed,
            usage,
            model: None,
            transport_error: error,
        }
    }

    fn interrupted(&self, signal: Signal, buffer: TurnBuffer) -> TurnResult {
        let usage = buffer.usage;
        let message = buffer.into_partial();
        let outcome = match signal {
            Signal::Stop => StreamOutcome::Stopped,
            Signal::Instruction(text) => StreamOutcome::Interrupted(text),
        };
        debug!(?outcome, partial_chars = message.text().len(), "Turn interrupted");
        TurnResult {
            message,
            calls: Vec::new(),
            outcome,
            usage,
            model: None,
            transport_error: None,
        }
    }
}
