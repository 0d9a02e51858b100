//! Out-of-band operator input.
//!
//! Whatever reads raw operator input (terminal line reader, bridge stdin
//! task) holds the [`InterruptSender`]; the loop holds the single
//! [`InterruptReceiver`] and polls it once per stream delta and before each
//! tool call. Signals are FIFO and each one is consumed at most once.
//! Anything left over when a turn ends is picked up by the next turn.

use tokio::sync::mpsc;

/// A pending interrupt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// Abort the current turn and go idle.
    Stop,
    /// Inject a new user message right away; the loop keeps going.
    Instruction(String),
}

/// Create a connected sender/receiver pair.
pub fn channel() -> (InterruptSender, InterruptReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (InterruptSender { tx }, InterruptReceiver { rx })
}

/// Producer half. Cheap to clone; every clone feeds the same queue.
#[derive(Debug, Clone)]
pub struct InterruptSender {
    tx: mpsc::UnboundedSender<Signal>,
}

impl InterruptSender {
    /// Queue a signal. Returns `false` if the loop has gone away.
    pub fn enqueue(&self, signal: Signal) -> bool {
        self.tx.send(signal).is_ok()
    }

    pub fn stop(&self) -> bool {
        self.enqueue(Signal::Stop)
    }

    pub fn instruct(&self, text: impl Into<String>) -> bool {
        self.enqueue(Signal::Instruction(text.into()))
    }
}

/// Consumer half, owned by the loop controller.
#[derive(Debug)]
pub struct InterruptReceiver {
    rx: mpsc::UnboundedReceiver<Signal>,
}

impl InterruptReceiver {
    /// Take the oldest pending signal without waiting.
    pub fn poll(&mut self) -> Option<Signal> {
        self.rx.try_recv().ok()
    }

    /// Wait for the next signal. `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<Signal> {
        self.rx.recv().await
    }

    /// Take everything pending, oldest first.
    pub fn drain(&mut self) -> Vec<Signal> {
        let mut out = Vec::new();
        while let Ok(signal) = self.rx.try_recv() {
            out.push(signal);
        }
        out
    }
}
