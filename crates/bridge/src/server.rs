//! Runs a [`LoopController`] behind framed stdio.
//!
//! Three tasks cooperate: a reader that routes inbound commands, a writer
//! that frames every bus event, and the turn loop itself (on the caller's
//! task). Stop and instruction commands reach a running turn through the
//! interrupt channel, so they are seen even while the loop is awaiting the
//! model or a tool.

use crate::approver::ChannelApprover;
use crate::frame::{FrameCodec, FrameError};
use crate::protocol::{BridgeEvent, InboundCommand};
use futures::SinkExt;
use kestrel_agent::{InterruptSender, LoopController};
use kestrel_core::event::AgentEvent;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio_util::codec::FramedWrite;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Frame output failed: {0}")]
    Frame(#[from] FrameError),

    #[error("Bridge task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub struct BridgeServer {
    controller: LoopController,
    interrupts: InterruptSender,
    approvals: Arc<ChannelApprover>,
}

impl BridgeServer {
    /// `approvals` must be the approver the controller was built with.
    pub fn new(
        controller: LoopController,
        interrupts: InterruptSender,
        approvals: Arc<ChannelApprover>,
    ) -> Self {
        Self {
            controller,
            interrupts,
            approvals,
        }
    }

    /// Serve on the process's own stdin/stdout.
    pub async fn serve_stdio(self) -> Result<(), BridgeError> {
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve until `input` closes and the last turn has finished.
    pub async fn serve<R, W>(self, input: R, output: W) -> Result<(), BridgeError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let Self {
            mut controller,
            interrupts,
            approvals,
        } = self;

        let (notes_tx, notes_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_frames(output, controller.events().subscribe(), notes_rx));

        let working_directory = std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let _ = notes_tx.send(BridgeEvent::Ready {
            working_directory,
            model: controller.usage().model().to_string(),
        });

        let busy = Arc::new(AtomicBool::new(false));
        let (turns_tx, mut turns_rx) = mpsc::unbounded_channel();
        let router = Router {
            turns: turns_tx,
            interrupts,
            approvals,
            notes: notes_tx,
            busy: busy.clone(),
        };
        let reader = tokio::spawn(read_commands(input, router));
        info!("Bridge ready");

        let mut next = turns_rx.recv().await;
        while let Some(input) = next {
            busy.store(true, Ordering::SeqCst);
            let report = controller.run_turn(&input).await;
            debug!(end = ?report.end, depth = report.depth, "Bridge turn finished");

            // Instructions sent as the turn was ending start the next one.
            next = match controller.take_pending_input() {
                Some(carried) => Some(carried),
                None => {
                    busy.store(false, Ordering::SeqCst);
                    turns_rx.recv().await
                }
            };
        }

        reader.await?;
        // Dropping the controller closes the event bus, which ends the writer.
        drop(controller);
        writer.await??;
        info!("Bridge closed");
        Ok(())
    }
}

struct Router {
    turns: mpsc::UnboundedSender<String>,
    interrupts: InterruptSender,
    approvals: Arc<ChannelApprover>,
    notes: mpsc::UnboundedSender<BridgeEvent>,
    busy: Arc<AtomicBool>,
}

impl Router {
    fn busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    fn route(&self, command: InboundCommand) {
        match command {
            InboundCommand::UserInput { message } => self.start_turn(message),
            InboundCommand::ToolApproval {
                call_id,
                decision,
                content,
            } => {
                self.approvals.resolve(&call_id, decision, content);
            }
            InboundCommand::StopAgent => {
                let denied = self.approvals.deny_all("agent stopped");
                if self.busy() {
                    self.interrupts.stop();
                } else {
                    debug!("Stop while idle ignored");
                }
                debug!(denied, "Stop requested");
            }
            InboundCommand::ForceInterrupt { message } => {
                if self.busy() {
                    self.interrupts.instruct(message);
                } else {
                    self.start_turn(message);
                }
            }
        }
    }

    fn start_turn(&self, message: String) {
        if self.turns.send(message).is_err() {
            warn!("Turn loop is gone, dropping input");
        }
    }

    fn invalid(&self, message: String) {
        let _ = self.notes.send(BridgeEvent::InvalidInput { message });
    }

    /// Input closed: release anything blocked on the UI.
    fn shutdown(&self) {
        self.approvals.deny_all("bridge input closed");
        if self.busy() {
            self.interrupts.stop();
        }
    }
}

async fn read_commands<R: AsyncRead + Unpin>(input: R, router: Router) {
    let mut lines = BufReader::new(input).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match InboundCommand::parse_line(&line) {
                Ok(Some(command)) => router.route(command),
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "Invalid bridge input");
                    router.invalid(format!("Invalid JSON input: {e}"));
                }
            },
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read bridge input");
                break;
            }
        }
    }
    debug!("Bridge input closed");
    router.shutdown();
}

async fn write_frames<W: AsyncWrite + Unpin>(
    output: W,
    mut events: broadcast::Receiver<Arc<AgentEvent>>,
    mut notes: mpsc::UnboundedReceiver<BridgeEvent>,
) -> Result<(), FrameError> {
    let mut frames = FramedWrite::new(output, FrameCodec::new());
    let mut notes_open = true;

    loop {
        tokio::select! {
            biased;
            note = notes.recv(), if notes_open => match note {
                Some(note) => frames.send(&note).await?,
                None => notes_open = false,
            },
            event = events.recv() => match event {
                Ok(event) => frames.send(event.as_ref()).await?,
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "Bridge writer fell behind the event bus"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    while let Ok(note) = notes.try_recv() {
        frames.send(&note).await?;
    }
    Ok(())
}
