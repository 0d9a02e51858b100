//! Process bridge for running the agent loop behind a separate UI process.
//!
//! The UI writes one JSON command per line to our stdin and reads framed
//! events from our stdout:
//!
//! ```text
//! __MSG__{"type":"text_chunk","data":{"text":"Hel"}}__END__
//! ```
//!
//! Frames can arrive split across reads or surrounded by unrelated output;
//! [`FrameCodec`] handles both directions.

pub mod approver;
pub mod frame;
pub mod protocol;
pub mod server;

pub use approver::ChannelApprover;
pub use frame::{FRAME_PREFIX, FRAME_SUFFIX, FrameCodec, FrameError};
pub use protocol::{BridgeEvent, InboundCommand};
pub use server::{BridgeError, BridgeServer};
