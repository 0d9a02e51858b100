//! Append-only JSONL audit of a session.
//!
//! One line per appended message and per emitted event, each stamped with
//! the session id and a UTC timestamp. Write failures are logged and
//! otherwise ignored; the audit never stops the loop.

use chrono::Utc;
use kestrel_core::event::EventBus;
use kestrel_core::message::Message;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Serialize)]
struct Line<'a, T: Serialize> {
    event: &'a str,
    session_id: &'a str,
    ts: String,
    #[serde(flatten)]
    body: T,
}

#[derive(Serialize)]
struct MessageBody<'a> {
    message: &'a Message,
}

#[derive(Serialize)]
struct DetailsBody<T: Serialize> {
    details: T,
}

pub struct Transcript {
    session_id: String,
    path: PathBuf,
    file: Mutex<File>,
}

impl Transcript {
    /// Open (or create) `path` for appending and write the session header.
    pub fn open(path: impl Into<PathBuf>, session_id: impl Into<String>) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let transcript = Self {
            session_id: session_id.into(),
            path,
            file: Mutex::new(file),
        };
        transcript.write("session_start", DetailsBody { details: serde_json::json!({}) });
        debug!(path = %transcript.path.display(), "Transcript opened");
        Ok(transcript)
    }

    /// `<dir>/<session_id>.jsonl`
    pub fn in_dir(dir: &Path, session_id: &str) -> std::io::Result<Self> {
        Self::open(dir.join(format!("{session_id}.jsonl")), session_id)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn record_message(&self, message: &Message) {
        self.write("message", MessageBody { message });
    }

    pub fn record_event<T: Serialize>(&self, name: &str, details: T) {
        self.write(name, DetailsBody { details });
    }

    /// Mirror every bus event into the transcript until the bus closes.
    pub fn follow(self: &Arc<Self>, bus: &EventBus) -> JoinHandle<()> {
        let mut rx = bus.subscribe();
        let transcript = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => transcript.record_event(event.event_type(), event.as_ref()),
                    Err(RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Transcript fell behind the event bus");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn write<T: Serialize>(&self, event: &str, body: T) {
        let line = Line {
            event,
            session_id: &self.session_id,
            ts: Utc::now().to_rfc3339(),
            body,
        };
        let json = match serde_json::to_string(&line) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "Failed to serialize transcript line");
                return;
            }
        };
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writeln!(file, "{json}") {
            warn!(error = %e, path = %self.path.display(), "Failed to write transcript");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::event::AgentEvent;

    fn lines(path: &Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn messages_are_appended_as_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let transcript = Transcript::in_dir(dir.path(), "s1").unwrap();
        transcript.record_message(&Message::user("hello"));

        let lines = lines(transcript.path());
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "session_start");
        assert_eq!(lines[1]["event"], "message");
        assert_eq!(lines[1]["session_id"], "s1");
        assert_eq!(lines[1]["message"]["content"], "hello");
        assert!(lines[1]["ts"].as_str().is_some());
    }

    #[tokio::test]
    async fn follows_the_event_bus() {
        let dir = tempfile::tempdir().unwrap();
        let transcript = Arc::new(Transcript::in_dir(dir.path(), "s2").unwrap());
        let bus = EventBus::default();
        let handle = transcript.follow(&bus);

        bus.publish(AgentEvent::TextChunk { text: "hi".into() });
        drop(bus);
        handle.await.unwrap();

        let lines = lines(transcript.path());
        assert_eq!(lines[1]["event"], "text_chunk");
        assert_eq!(lines[1]["details"]["data"]["text"], "hi");
    }
}
