//! The tool execution pipeline.
//!
//! Takes the sealed calls of one assistant turn and produces exactly one
//! tool-result message per call, in request order, followed by an optional
//! reminder. Along the way each call is approval-gated if its policy says so,
//! consecutive parallel-safe calls run concurrently, and everything else runs
//! one at a time. A group's approvals are asked in request order before any
//! of its calls start, so the operator answers one prompt at a time.
//!
//! The interrupt channel is polled before each group starts. Calls that were
//! already running finish; calls that had not started are marked cancelled
//! (stop) or skipped (instruction).

use crate::interrupt::{InterruptReceiver, Signal};
use crate::stream::SealedToolCall;
use futures::future::join_all;
use kestrel_core::approval::{ApprovalDecision, ApprovalRequest, Approver};
use kestrel_core::event::{AgentEvent, EventBus, LoopState};
use kestrel_core::message::{Message, MessageKind};
use kestrel_core::reminder::ReminderSource;
use kestrel_core::tool::ToolRegistry;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Argument key that forces an approval prompt for a single call.
pub const FORCE_APPROVAL_KEY: &str = "need_user_approve";

pub const FAILURE_PREFIX: &str = "Tool call failed, fail reason: ";
pub const SKIPPED_TEXT: &str = "Tool execution skipped: interrupted by user instruction";
pub const CANCELLED_TEXT: &str = "Tool execution cancelled: stopped by user";

/// Failure reasons longer than this are compacted.
const MAX_FAILURE_CHARS: usize = 800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Succeeded,
    Failed,
    /// Arguments did not parse; the tool never ran
    Malformed,
    Denied,
    /// An instruction arrived before the call started
    Skipped,
    /// A stop arrived before the call started
    Cancelled,
}

/// What happened to one call.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub call_id: String,
    pub tool_name: String,
    /// Canonical argument text (sorted keys, no whitespace) when the
    /// arguments parsed, the raw text otherwise
    pub arguments: String,
    pub status: CallStatus,
    /// Tool message content sent back to the model
    pub content: String,
}

impl CallRecord {
    fn new(call: &SealedToolCall, status: CallStatus, content: String) -> Self {
        Self {
            call_id: call.request.id.clone(),
            tool_name: call.request.name.clone(),
            arguments: match &call.arguments {
                Ok(value) => value.to_string(),
                Err(_) => call.request.arguments.trim().to_string(),
            },
            status,
            content,
        }
    }

    pub fn ok(&self) -> bool {
        self.status == CallStatus::Succeeded
    }

    /// Whether the tool actually ran.
    pub fn executed(&self) -> bool {
        matches!(self.status, CallStatus::Succeeded | CallStatus::Failed)
    }

    /// `name + arguments` key for failures the circuit breaker tracks.
    pub fn failure_key(&self) -> Option<String> {
        matches!(self.status, CallStatus::Failed | CallStatus::Malformed)
            .then(|| format!("{}:{}", self.tool_name, self.arguments))
    }
}

/// An interrupt observed while the batch ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchHalt {
    Stopped,
    Instruction(String),
}

/// Output of one batch.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    /// One per call, in request order
    pub records: Vec<CallRecord>,
    /// Tool-result messages (plus the trailing reminder), ready to append
    pub messages: Vec<Message>,
    pub halt: Option<BatchHalt>,
}

impl BatchReport {
    pub fn executed(&self) -> usize {
        self.records.iter().filter(|r| r.executed()).count()
    }
}

pub struct ToolPipeline {
    registry: Arc<ToolRegistry>,
    approver: Arc<dyn Approver>,
    reminder: Option<Arc<dyn ReminderSource>>,
    events: EventBus,
    /// Sticky `always` / `never` decisions, by tool name
    remembered: Mutex<HashMap<String, bool>>,
}

impl ToolPipeline {
    pub fn new(registry: Arc<ToolRegistry>, approver: Arc<dyn Approver>, events: EventBus) -> Self {
        Self {
            registry,
            approver,
            reminder: None,
            events,
            remembered: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_reminder(mut self, reminder: Arc<dyn ReminderSource>) -> Self {
        self.reminder = Some(reminder);
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Sticky decision for a tool, if one was made this session.
    pub fn remembered(&self, tool: &str) -> Option<bool> {
        self.remembered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tool)
            .copied()
    }

    pub async fn run(
        &self,
        calls: &[SealedToolCall],
        interrupts: &mut InterruptReceiver,
    ) -> BatchReport {
        if calls.is_empty() {
            return BatchReport::default();
        }

        self.events.publish(AgentEvent::StateChanged {
            state: LoopState::ToolExecuting,
        });

        let mut records: Vec<Option<CallRecord>> = vec![None; calls.len()];
        let mut halt: Option<BatchHalt> = None;

        for group in self.partition(calls) {
            if halt.is_none() {
                halt = poll_halt(interrupts, group.len());
            }
            if let Some(h) = &halt {
                for i in group {
                    records[i] = Some(halted_record(&calls[i], h));
                }
                continue;
            }

            // Approvals are asked one at a time, in request order, before
            // any call of the group starts.
            let mut ready: Vec<(usize, Value)> = Vec::with_capacity(group.len());
            for i in group {
                match self.admit(&calls[i]).await {
                    Ok(args) => ready.push((i, args)),
                    Err(record) => records[i] = Some(record),
                }
            }

            // A stop typed while an approval was pending must not let the
            // approved calls start.
            if halt.is_none() && !ready.is_empty() {
                halt = poll_halt(interrupts, ready.len());
            }
            if let Some(h) = &halt {
                for (i, _) in ready {
                    records[i] = Some(halted_record(&calls[i], h));
                }
                continue;
            }

            if ready.len() > 1 {
                debug!(calls = ready.len(), "Running parallel-safe group");
            }
            let done = join_all(
                ready
                    .into_iter()
                    .map(|(i, args)| async move { (i, self.execute(&calls[i], args).await) }),
            )
            .await;
            for (i, record) in done {
                records[i] = Some(record);
            }
        }

        let records: Vec<CallRecord> = records.into_iter().flatten().collect();
        let mut messages: Vec<Message> = Vec::with_capacity(records.len() + 1);
        for record in &records {
            self.events.publish(AgentEvent::ToolResult {
                call_id: record.call_id.clone(),
                tool_name: record.tool_name.clone(),
                ok: record.ok(),
                content: record.content.clone(),
            });
            messages.push(Message::tool_result(&record.call_id, &record.content));
        }

        if let Some(text) = self.reminder.as_ref().and_then(|r| r.reminder()) {
            messages.push(Message::system(text).with_kind(MessageKind::Reminder));
        }

        BatchReport {
            records,
            messages,
            halt,
        }
    }

    /// Split into execution groups, keeping request order: each run of
    /// consecutive parallel-safe calls is one group, every other call is a
    /// group of its own.
    fn partition(&self, calls: &[SealedToolCall]) -> Vec<Vec<usize>> {
        let mut groups: Vec<Vec<usize>> = Vec::new();
        let mut open_parallel = false;

        for (i, call) in calls.iter().enumerate() {
            let parallel = call.arguments.is_ok()
                && self
                    .registry
                    .policy(&call.request.name)
                    .is_some_and(|p| p.parallel_safe);

            match groups.last_mut() {
                Some(group) if parallel && open_parallel => group.push(i),
                _ => groups.push(vec![i]),
            }
            open_parallel = parallel;
        }
        groups
    }

    /// Parse and approval-gate one call. `Ok` carries the arguments the
    /// tool will see; `Err` is the final record for a call that never runs.
    async fn admit(&self, call: &SealedToolCall) -> Result<Value, CallRecord> {
        let name = call.request.name.as_str();
        let args = match &call.arguments {
            Ok(args) => args.clone(),
            Err(reason) => {
                warn!(tool = %name, reason = %reason, "Malformed tool arguments");
                return Err(CallRecord::new(call, CallStatus::Malformed, failure_text(reason)));
            }
        };

        let (args, forced) = strip_force_flag(args);
        let needs_approval = forced
            || self
                .registry
                .policy(name)
                .is_some_and(|p| p.needs_approval);

        if needs_approval && let Err(reason) = self.approve(call, &args).await {
            info!(tool = %name, "Tool call denied");
            return Err(CallRecord::new(
                call,
                CallStatus::Denied,
                format!("user denied to execute tool, user input: {reason}"),
            ));
        }
        Ok(args)
    }

    async fn execute(&self, call: &SealedToolCall, args: Value) -> CallRecord {
        let name = call.request.name.as_str();
        self.events.publish(AgentEvent::ToolExecuting {
            call_id: call.request.id.clone(),
            tool_name: name.to_string(),
            arguments: args.clone(),
        });

        let outcome = self.registry.execute(name, args).await;
        if outcome.ok {
            CallRecord::new(call, CallStatus::Succeeded, outcome.message)
        } else {
            CallRecord::new(call, CallStatus::Failed, failure_text(&outcome.message))
        }
    }

    /// `Ok` to run, `Err(reason)` when denied.
    async fn approve(&self, call: &SealedToolCall, args: &Value) -> Result<(), String> {
        let name = call.request.name.as_str();
        if let Some(approved) = self.remembered(name) {
            debug!(tool = %name, approved, "Using remembered approval");
            return if approved {
                Ok(())
            } else {
                Err("never (remembered)".to_string())
            };
        }

        self.events.publish(AgentEvent::StateChanged {
            state: LoopState::AwaitingApproval,
        });
        self.events.publish(AgentEvent::ToolApprovalRequested {
            call_id: call.request.id.clone(),
            tool_name: name.to_string(),
            arguments: args.clone(),
        });

        let reply = self
            .approver
            .request(ApprovalRequest {
                call_id: call.request.id.clone(),
                tool_name: name.to_string(),
                arguments: args.clone(),
            })
            .await;

        self.events.publish(AgentEvent::StateChanged {
            state: LoopState::ToolExecuting,
        });

        if reply.decision.is_sticky() {
            self.remembered
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(name.to_string(), reply.decision.is_approved());
        }

        if reply.decision.is_approved() {
            Ok(())
        } else {
            Err(reply.note.unwrap_or_else(|| decision_label(reply.decision).to_string()))
        }
    }
}

fn poll_halt(interrupts: &mut InterruptReceiver, remaining: usize) -> Option<BatchHalt> {
    let halt = match interrupts.poll()? {
        Signal::Stop => BatchHalt::Stopped,
        Signal::Instruction(text) => BatchHalt::Instruction(text),
    };
    info!(halt = ?halt, remaining, "Tool batch interrupted");
    Some(halt)
}

fn halted_record(call: &SealedToolCall, halt: &BatchHalt) -> CallRecord {
    match halt {
        BatchHalt::Stopped => CallRecord::new(call, CallStatus::Cancelled, CANCELLED_TEXT.into()),
        BatchHalt::Instruction(_) => {
            CallRecord::new(call, CallStatus::Skipped, SKIPPED_TEXT.into())
        }
    }
}

fn decision_label(decision: ApprovalDecision) -> &'static str {
    match decision {
        ApprovalDecision::Accept => "accept",
        ApprovalDecision::Deny => "deny",
        ApprovalDecision::Always => "always",
        ApprovalDecision::Never => "never",
    }
}

/// Remove the per-call approval flag so the tool never sees it.
fn strip_force_flag(mut args: Value) -> (Value, bool) {
    let forced = args
        .as_object_mut()
        .and_then(|o| o.remove(FORCE_APPROVAL_KEY))
        .is_some_and(|v| v.as_bool().unwrap_or(false));
    (args, forced)
}

fn failure_text(reason: &str) -> String {
    format!("{FAILURE_PREFIX}{}", compact_error(reason, MAX_FAILURE_CHARS))
}

/// Shorten long error output: keep the first two and last three lines,
/// then hard-cap at `max` characters.
fn compact_error(error: &str, max: usize) -> String {
    let error = error.trim();
    if error.chars().count() <= max {
        return error.to_string();
    }

    let lines: Vec<&str> = error.lines().filter(|l| !l.trim().is_empty()).collect();
    let compacted = if lines.len() > 6 {
        format!(
            "{}\n[...{} lines omitted...]\n{}",
            lines[..2].join("\n"),
            lines.len() - 5,
            lines[lines.len() - 3..].join("\n")
        )
    } else {
        lines.join("\n")
    };

    match compacted.char_indices().nth(max) {
        Some((cut, _)) => compacted[..cut].to_string(),
        None => compacted,
    }
}
