//! `kestrel chat`: interactive terminal session.
//!
//! One task reads stdin and routes each line by what the loop is doing:
//! idle lines start a turn, lines typed while a turn runs become
//! instructions (`/stop` or ESC stops instead), and while an approval is
//! pending the line answers it. A second task renders bus events.
//!
//! `/task <description>` runs a delegated task in a fresh conversation; its
//! result is recorded in the main one.

use super::session::{self, Session};
use async_trait::async_trait;
use kestrel_core::approval::{ApprovalDecision, ApprovalReply, ApprovalRequest, Approver};
use kestrel_core::event::{AgentEvent, EventBus, LoopState};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot};

/// What a line of input means right now.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LineAction {
    Ignore,
    Exit,
    StartTurn(String),
    StartTask(String),
    Stop,
    Instruct(String),
    Answer(ApprovalReply),
}

fn classify(line: &str, busy: bool, awaiting_approval: bool) -> LineAction {
    let raw = line.trim_end_matches(['\r', '\n']);
    if raw.starts_with('\u{1b}') {
        return if busy { LineAction::Stop } else { LineAction::Ignore };
    }
    let line = raw.trim();

    if awaiting_approval {
        if line == "/stop" {
            return LineAction::Stop;
        }
        // Anything that is not a decision denies, and becomes the reason.
        return LineAction::Answer(match ApprovalDecision::parse(line) {
            Some(decision) => ApprovalReply::new(decision),
            None => ApprovalReply {
                decision: ApprovalDecision::Deny,
                note: (!line.is_empty()).then(|| line.to_string()),
            },
        });
    }

    match line {
        "" => LineAction::Ignore,
        "exit" | "quit" | "/exit" | "/quit" => LineAction::Exit,
        "/stop" if busy => LineAction::Stop,
        "/stop" | "/task" => LineAction::Ignore,
        _ if busy => LineAction::Instruct(line.to_string()),
        _ if line.starts_with("/task ") => {
            LineAction::StartTask(line["/task ".len()..].trim().to_string())
        }
        _ => LineAction::StartTurn(line.to_string()),
    }
}

/// Work for the turn loop.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Job {
    Turn(String),
    Task(String),
}

/// Asks on the terminal; the stdin router delivers the answer.
#[derive(Default)]
struct TerminalApprover {
    pending: Mutex<Option<oneshot::Sender<ApprovalReply>>>,
}

impl TerminalApprover {
    fn is_waiting(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn answer(&self, reply: ApprovalReply) -> bool {
        let waiter = self.pending.lock().unwrap_or_else(PoisonError::into_inner).take();
        waiter.is_some_and(|w| w.send(reply).is_ok())
    }
}

#[async_trait]
impl Approver for TerminalApprover {
    async fn request(&self, request: ApprovalRequest) -> ApprovalReply {
        let (tx, rx) = oneshot::channel();
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);

        println!();
        println!("  Approve {}?", request.preview());
        print!("  [y]es / [n]o / [a]lways / [N]ever > ");
        let _ = std::io::stdout().flush();

        rx.await.unwrap_or_else(|_| ApprovalReply {
            decision: ApprovalDecision::Deny,
            note: Some("input closed".into()),
        })
    }
}

pub async fn run(
    config_path: Option<&Path>,
    message: Option<String>,
    task: Option<String>,
) -> anyhow::Result<()> {
    let config = session::load_config(config_path)?;
    session::require_api_key(&config)?;

    let approver = Arc::new(TerminalApprover::default());
    let Session {
        mut controller,
        interrupts,
        transcript,
    } = session::build(&config, approver.clone())?;

    let first = match (message, task) {
        (_, Some(task)) => Some(Job::Task(task)),
        (Some(message), None) => Some(Job::Turn(message)),
        (None, None) => None,
    };
    let one_shot = first.is_some();
    if !one_shot {
        println!();
        println!("  Kestrel, interactive mode");
        println!();
        println!("  Provider:  {}", config.provider);
        println!("  Model:     {}", config.model);
        println!("  Tools:     list_dir, file_read, file_write, shell, todo_write");
        if let Some(t) = &transcript {
            println!("  Transcript: {}", t.path().display());
        }
        println!();
        println!("  Type a message and press Enter. While the assistant works, type");
        println!("  to redirect it, or /stop (or ESC) to stop. '/task <what>' delegates");
        println!("  a self-contained task. 'exit' quits.");
        println!();
        prompt();
    }

    let renderer = tokio::spawn(render_events(controller.events().clone(), !one_shot));

    let busy = Arc::new(AtomicBool::new(false));
    let (turns_tx, mut turns_rx) = mpsc::unbounded_channel::<Job>();
    if let Some(job) = first {
        let _ = turns_tx.send(job);
    }

    // Same shape as a channel reader: stdin lines in, routed actions out.
    let reader = {
        let busy = busy.clone();
        let approver = approver.clone();
        let turns = (!one_shot).then_some(turns_tx);
        tokio::spawn(async move {
            let mut lines = BufReader::new(io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match classify(&line, busy.load(Ordering::SeqCst), approver.is_waiting()) {
                    LineAction::Ignore => {}
                    LineAction::Exit => break,
                    LineAction::StartTurn(text) => {
                        if let Some(turns) = &turns
                            && turns.send(Job::Turn(text)).is_err()
                        {
                            break;
                        }
                    }
                    LineAction::StartTask(text) => {
                        if let Some(turns) = &turns
                            && turns.send(Job::Task(text)).is_err()
                        {
                            break;
                        }
                    }
                    LineAction::Stop => {
                        approver.answer(ApprovalReply {
                            decision: ApprovalDecision::Deny,
                            note: Some("agent stopped".into()),
                        });
                        interrupts.stop();
                    }
                    LineAction::Instruct(text) => {
                        interrupts.instruct(text);
                    }
                    LineAction::Answer(reply) => {
                        approver.answer(reply);
                    }
                }
            }
            // Unblock a turn waiting on us.
            approver.answer(ApprovalReply {
                decision: ApprovalDecision::Deny,
                note: Some("input closed".into()),
            });
            if busy.load(Ordering::SeqCst) {
                interrupts.stop();
            }
        })
    };

    let mut next = turns_rx.recv().await;
    while let Some(job) = next {
        busy.store(true, Ordering::SeqCst);
        match job {
            Job::Turn(input) => {
                controller.run_turn(&input).await;
            }
            Job::Task(task) => {
                controller.run_task(session::TASK_SYSTEM_PROMPT, &task).await;
            }
        }
        if one_shot {
            break;
        }
        // Lines typed as the turn was ending become the next turn.
        next = match controller.take_pending_input() {
            Some(carried) => Some(Job::Turn(carried)),
            None => {
                busy.store(false, Ordering::SeqCst);
                turns_rx.recv().await
            }
        };
    }

    reader.abort();
    drop(controller);
    let _ = renderer.await;
    if !one_shot {
        println!();
        println!("  Goodbye!");
        println!();
    }
    Ok(())
}

fn prompt() {
    print!("  You > ");
    let _ = std::io::stdout().flush();
}

async fn render_events(events: EventBus, interactive: bool) {
    let mut rx = events.subscribe();
    drop(events);
    let mut mid_line = false;

    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        };
        let mut out = std::io::stdout().lock();
        match event.as_ref() {
            AgentEvent::TextChunk { text } => {
                if !mid_line {
                    let _ = write!(out, "\n  ");
                    mid_line = true;
                }
                let _ = write!(out, "{}", text.replace('\n', "\n  "));
            }
            AgentEvent::ToolExecuting {
                tool_name,
                arguments,
                ..
            } => {
                if mid_line {
                    let _ = writeln!(out);
                    mid_line = false;
                }
                let _ = writeln!(out, "  > {tool_name} {arguments}");
            }
            AgentEvent::ToolResult {
                tool_name,
                ok,
                content,
                ..
            } => {
                let first = content.lines().next().unwrap_or_default();
                let mark = if *ok { "ok" } else { "failed" };
                let _ = writeln!(out, "    {tool_name} {mark}: {}", clip(first, 120));
            }
            AgentEvent::Notice { message } => {
                let _ = writeln!(out, "\n  [{message}]");
            }
            AgentEvent::Error { message, .. } => {
                mid_line = false;
                let _ = writeln!(out, "\n  [Error] {message}");
            }
            AgentEvent::Stopped => {
                mid_line = false;
                let _ = writeln!(out, "\n  [stopped]");
            }
            AgentEvent::StatusLine { summary, .. } => {
                if mid_line {
                    let _ = writeln!(out);
                    mid_line = false;
                }
                let _ = writeln!(out, "\n  {summary}");
            }
            AgentEvent::StateChanged {
                state: LoopState::Idle,
            } if interactive => {
                let _ = writeln!(out);
                drop(out);
                prompt();
                continue;
            }
            _ => {}
        }
        let _ = out.flush();
    }
}

fn clip(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max).collect();
    format!("{cut}...")
}
