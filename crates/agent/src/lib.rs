//! The Kestrel orchestration core.
//!
//! A turn runs through these pieces:
//!
//! 1. [`RequestBuilder`] snapshots the [`HistoryStore`] and fits the output
//!    budget into what is left of the context window
//! 2. [`StreamProcessor`] streams the model reply, reassembling tool calls
//!    and watching the interrupt channel
//! 3. [`ToolPipeline`] approves and runs the requested tools
//! 4. [`LoopController`] decides whether to go around again
//!
//! Everything observable is published on the core `EventBus`.

pub mod context;
pub mod interrupt;
pub mod loop_runner;
pub mod nudge;
pub mod pipeline;
pub mod request;
pub mod stream;
pub mod transcript;

#[cfg(test)]
mod test_helpers;

pub use context::{CompressionPolicy, CompressionReport, HistoryStore, ModelSummarizer, Summarizer};
pub use interrupt::{InterruptReceiver, InterruptSender, Signal};
pub use loop_runner::{LoopController, STOPPED_NOTICE, TurnEnd, TurnReport};
pub use nudge::{NudgeDetector, NudgeRule};
pub use pipeline::{BatchHalt, BatchReport, CallRecord, CallStatus, ToolPipeline};
pub use request::{RequestBuilder, TokenBudget};
pub use stream::{SealedToolCall, StreamOutcome, StreamProcessor, TurnResult};
pub use transcript::Transcript;
