//! `PREFIX + JSON + SUFFIX` framing over a byte stream.

use bytes::{Buf, BufMut, BytesMut};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace, warn};

pub const FRAME_PREFIX: &str = "__MSG__";
pub const FRAME_SUFFIX: &str = "__END__";

/// Largest unterminated frame we keep buffering.
const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Unterminated frame exceeds {max} bytes")]
    TooLarge { max: usize },
}

/// Codec for sentinel-delimited JSON frames.
///
/// Decoding scans the buffer for complete `__MSG__…__END__` spans. Bytes
/// outside a frame are skipped, an incomplete frame stays buffered until
/// the rest arrives, and a frame whose body is not valid JSON is dropped
/// with a warning. Encoding writes one frame per item followed by a newline.
///
/// The server only encodes; the decoder is the reading half a UI process
/// (or a test harness) wraps around the bridge's stdout with `FramedRead`.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_len: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub fn with_max_frame_len(mut self, max: usize) -> Self {
        self.max_frame_len = max;
        self
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if haystack.len() < from + needle.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

impl Decoder for FrameCodec {
    type Item = Value;
    type Error = FrameError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Value>, FrameError> {
        let prefix = FRAME_PREFIX.as_bytes();
        let suffix = FRAME_SUFFIX.as_bytes();

        loop {
            let Some(start) = find(buf, prefix, 0) else {
                // The tail may be the first bytes of a prefix.
                let noise = buf.len().saturating_sub(prefix.len() - 1);
                if noise > 0 {
                    trace!(bytes = noise, "Skipping unframed output");
                    buf.advance(noise);
                }
                return Ok(None);
            };
            if start > 0 {
                trace!(bytes = start, "Skipping unframed output");
                buf.advance(start);
            }

            let Some(end) = find(buf, suffix, prefix.len()) else {
                if buf.len() > self.max_frame_len {
                    return Err(FrameError::TooLarge {
                        max: self.max_frame_len,
                    });
                }
                return Ok(None);
            };

            let parsed = serde_json::from_slice::<Value>(&buf[prefix.len()..end]);
            buf.advance(end + suffix.len());
            match parsed {
                Ok(value) => return Ok(Some(value)),
                Err(e) => warn!(error = %e, "Dropping frame with invalid JSON"),
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Value>, FrameError> {
        match self.decode(buf)? {
            Some(value) => Ok(Some(value)),
            None => {
                if !buf.is_empty() {
                    debug!(bytes = buf.len(), "Stream ended inside a frame");
                    buf.clear();
                }
                Ok(None)
            }
        }
    }
}

impl<T: Serialize> Encoder<T> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), FrameError> {
        let json = serde_json::to_vec(&item)?;
        dst.reserve(FRAME_PREFIX.len() + json.len() + FRAME_SUFFIX.len() + 1);
        dst.put_slice(FRAME_PREFIX.as_bytes());
        dst.put_slice(&json);
        dst.put_slice(FRAME_SUFFIX.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn drain(codec: &mut FrameCodec, buf: &mut BytesMut) -> Vec<Value> {
        let mut out = Vec::new();
        while let Some(v) = codec.decode(buf).unwrap() {
            out.push(v);
        }
        out
    }

    #[test]
    fn frame_split_across_reads_is_kept() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(br#"__MSG__{"type":"text_ch"#);
        assert!(drain(&mut codec, &mut buf).is_empty());
        assert_eq!(&buf[..7], b"__MSG__");

        buf.extend_from_slice(br#"unk","data":{"text":"hi"}}__END__"#);
        let frames = drain(&mut codec, &mut buf);
        assert_eq!(frames, vec![json!({"type": "text_chunk", "data": {"text": "hi"}})]);
        assert!(buf.is_empty());
    }

    #[test]
    fn prefix_split_at_read_boundary() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"log line\n__MS"[..]);
        assert!(drain(&mut codec, &mut buf).is_empty());
        assert_eq!(&buf[..], b"__MS");

        buf.extend_from_slice(br#"G__{"a":1}__END__"#);
        assert_eq!(drain(&mut codec, &mut buf), vec![json!({"a": 1})]);
    }

    #[test]
    fn several_frames_with_noise_between() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(
            &br#"warning: x
__MSG__{"n":1}__END__
junk __MSG__{"n":2}__END____MSG__{"n":3"#[..],
        );
        let frames = drain(&mut codec, &mut buf);
        assert_eq!(frames, vec![json!({"n": 1}), json!({"n": 2})]);
        // consumed through the last suffix; the partial third frame remains
        assert_eq!(&buf[..], br#"__MSG__{"n":3"#);
    }

    #[test]
    fn invalid_json_frame_is_skipped() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&br#"__MSG__{nope__END____MSG__{"ok":true}__END__"#[..]);
        assert_eq!(drain(&mut codec, &mut buf), vec![json!({"ok": true})]);
    }

    #[test]
    fn oversized_partial_frame_is_an_error() {
        let mut codec = FrameCodec::new().with_max_frame_len(16);
        let mut buf = BytesMut::from(&br#"__MSG__{"text":"0123456789"#[..]);
        assert!(matches!(codec.decode(&mut buf), Err(FrameError::TooLarge { max: 16 })));
    }

    #[test]
    fn encoder_output_decodes() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(json!({"type": "stopped"}), &mut buf).unwrap();
        assert_eq!(&buf[..], b"__MSG__{\"type\":\"stopped\"}__END__\n");
        assert_eq!(drain(&mut codec, &mut buf), vec![json!({"type": "stopped"})]);
    }
}
