//! Conversation history and token accounting.

pub mod history;
pub mod summary;
pub mod token;

pub use history::{CLEARED_TOOL_RESULT, CompressionPolicy, CompressionReport, HistoryStore};
pub use summary::{ModelSummarizer, Summarizer};
