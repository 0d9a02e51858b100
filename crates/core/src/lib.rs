//! # Kestrel Core
//!
//! Domain types, traits, and error definitions for the Kestrel coding
//! assistant. This crate has **no transport dependencies**: it defines the
//! model that the orchestration loop, providers, tools, and front-ends all
//! build against.
//!
//! ## Seams
//!
//! - [`Provider`]: the language-model backend (one-shot or streamed)
//! - [`Tool`] / [`TypedTool`]: named capabilities with a schema
//! - [`Approver`]: operator approval for guarded tool calls
//! - [`ReminderSource`]: situational context appended after tool batches
//! - [`EventBus`]: everything the UI collaborator gets to see

pub mod approval;
pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod reminder;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use approval::{ApprovalDecision, ApprovalReply, ApprovalRequest, Approver, AutoApprover};
pub use error::{BudgetError, ProviderError, ToolError};
pub use event::{AgentEvent, ErrorKind, EventBus, LoopState};
pub use message::{Message, MessageKind, Role, ToolCallRequest};
pub use provider::{
    ChunkReceiver, ModelRequest, ModelResponse, Provider, StreamChunk, ToolCallDelta, ToolChoice,
    ToolDefinition, Usage,
};
pub use reminder::{CompositeReminder, ReminderSource};
pub use tool::{Tool, ToolOutcome, ToolPolicy, ToolRegistry, Typed, TypedTool};
