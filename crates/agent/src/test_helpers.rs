//! Shared test helpers.
//!
//! Only depends on `kestrel_core`, so the integration tests can include
//! this file directly.

#![allow(dead_code)]

use async_trait::async_trait;
use kestrel_core::error::ProviderError;
use kestrel_core::message::{Message, ToolCallRequest};
use kestrel_core::provider::{
    ChunkReceiver, ModelRequest, ModelResponse, Provider, StreamChunk, ToolCallDelta, Usage,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, mpsc};

enum StreamScript {
    Chunks {
        chunks: Vec<StreamChunk>,
        /// Hold back everything from this chunk index until `release()`
        gate_at: Option<usize>,
    },
    Error(ProviderError),
}

/// A provider that replays scripted turns.
///
/// `stream()` pops the next stream script; when none are left it replays
/// the next scripted response as one chunk. `complete()` pops the next
/// scripted response. Running out of script is a provider error, which
/// the loop reports like any other transport failure.
pub struct ScriptedProvider {
    streams: Mutex<VecDeque<StreamScript>>,
    responses: Mutex<VecDeque<Result<ModelResponse, ProviderError>>>,
    requests: Mutex<Vec<ModelRequest>>,
    gate: Arc<Notify>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(VecDeque::new()),
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            gate: Arc::new(Notify::new()),
        }
    }

    /// Queue a streamed turn.
    pub fn stream(self, chunks: Vec<StreamChunk>) -> Self {
        self.streams.lock().unwrap().push_back(StreamScript::Chunks {
            chunks,
            gate_at: None,
        });
        self
    }

    /// Queue a streamed turn that pauses before chunk `gate_at` until
    /// [`release`](Self::release) is called.
    pub fn stream_gated(self, chunks: Vec<StreamChunk>, gate_at: usize) -> Self {
        self.streams.lock().unwrap().push_back(StreamScript::Chunks {
            chunks,
            gate_at: Some(gate_at),
        });
        self
    }

    /// Queue a stream that fails to open.
    pub fn stream_error(self, error: ProviderError) -> Self {
        self.streams.lock().unwrap().push_back(StreamScript::Error(error));
        self
    }

    /// Queue a streamed turn of plain text, one chunk per piece.
    pub fn text_turn(self, pieces: &[&str]) -> Self {
        self.stream(pieces.iter().map(|p| StreamChunk::text(*p)).collect())
    }

    /// Queue a streamed turn that calls one tool, arguments in one delta.
    pub fn tool_turn(self, id: &str, name: &str, args: serde_json::Value) -> Self {
        self.tools_turn(&[(id, name, args)])
    }

    /// Queue a streamed turn that calls several tools.
    pub fn tools_turn(self, calls: &[(&str, &str, serde_json::Value)]) -> Self {
        let mut chunks = Vec::new();
        for (i, (id, name, args)) in calls.iter().enumerate() {
            chunks.push(StreamChunk::tool_delta(ToolCallDelta::start(i as u32, *id, *name)));
            chunks.push(StreamChunk::tool_delta(ToolCallDelta::args(i as u32, args.to_string())));
        }
        self.stream(chunks)
    }

    /// Queue a non-streamed response.
    pub fn response(self, message: Message) -> Self {
        self.responses.lock().unwrap().push_back(Ok(ModelResponse {
            message,
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
            model: "scripted-model".into(),
        }));
        self
    }

    /// Queue a failing non-streamed response.
    pub fn complete_error(self, error: ProviderError) -> Self {
        self.responses.lock().unwrap().push_back(Err(error));
        self
    }

    /// Let a gated stream continue.
    pub fn release(&self) {
        self.gate.notify_one();
    }

    /// Every request received so far (streamed and not).
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next_response(&self) -> Result<ModelResponse, ProviderError> {
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::NotConfigured("script exhausted".into())))
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-model"
    }

    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, ProviderError> {
        self.requests.lock().unwrap().push(request);
        self.next_response()
    }

    async fn stream(&self, request: ModelRequest) -> Result<ChunkReceiver, ProviderError> {
        self.requests.lock().unwrap().push(request);
        let script = self.streams.lock().unwrap().pop_front();

        let (chunks, gate_at) = match script {
            Some(StreamScript::Chunks { chunks, gate_at }) => (chunks, gate_at),
            Some(StreamScript::Error(e)) => return Err(e),
            None => {
                let response = self.next_response()?;
                (vec![kestrel_core::provider::response_as_chunk(response)], None)
            }
        };

        let (tx, rx) = mpsc::channel(16);
        let gate = self.gate.clone();
        tokio::spawn(async move {
            for (i, chunk) in chunks.into_iter().enumerate() {
                if gate_at == Some(i) {
                    gate.notified().await;
                }
                if tx.send(Ok(chunk)).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}

/// An assistant message that calls one tool.
pub fn tool_call_message(id: &str, name: &str, args: serde_json::Value) -> Message {
    Message::assistant_with_calls(None, vec![ToolCallRequest::new(id, name, args.to_string())])
}
