//! The agent reasoning loop.
//!
//! `Idle -> Thinking -> {ToolExecuting -> Thinking}* -> Idle`, with
//! `Interrupted` reachable from either working state when the operator
//! injects an instruction. The think/act/observe cycle is an explicit loop:
//! depth is a counter, not stack frames.

use crate::context::history::{CompressionPolicy, HistoryStore};
use crate::context::summary::Summarizer;
use crate::context::token::estimate_tools_tokens;
use crate::interrupt::{InterruptReceiver, Signal};
use crate::nudge::NudgeDetector;
use crate::pipeline::{BatchHalt, CallStatus, ToolPipeline};
use crate::request::{RequestBuilder, TokenBudget};
use crate::stream::{StreamOutcome, StreamProcessor};
use crate::transcript::Transcript;
use kestrel_config::{ConfigError, LoopSettings};
use kestrel_core::approval::Approver;
use kestrel_core::event::{AgentEvent, ErrorKind, EventBus, LoopState};
use kestrel_core::message::{Message, MessageKind, Role};
use kestrel_core::provider::Provider;
use kestrel_core::reminder::ReminderSource;
use kestrel_core::tool::ToolRegistry;
use kestrel_telemetry::{PricingTable, UsageTracker};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Recorded when the operator stops a turn.
pub const STOPPED_NOTICE: &str = "Execution was interrupted by the user before it completed. \
When you respond next, briefly acknowledge the interruption and wait for the user's \
instructions before resuming any outstanding work.";

/// Why a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnEnd {
    /// The model answered without calling tools.
    Completed,
    /// The operator stopped the turn.
    Stopped,
    /// `max_depth` tool rounds without converging.
    DepthExceeded,
    /// Stream and non-streaming fallback both failed.
    TransportFailed,
    /// The same tool call kept failing.
    RepeatedFailure,
    /// No room left for model output.
    BudgetExceeded,
}

/// Summary of one user- or task-initiated turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnReport {
    pub end: TurnEnd,
    /// Text of the last assistant message, if it had any
    pub text: Option<String>,
    /// Tool rounds taken since the last reset
    pub depth: u32,
    pub nudges: u32,
    pub tool_calls: usize,
}

/// The core loop that orchestrates model calls and tool execution.
pub struct LoopController {
    stream: StreamProcessor,
    pipeline: ToolPipeline,
    builder: RequestBuilder,
    history: HistoryStore,
    interrupts: InterruptReceiver,
    events: EventBus,
    nudges: NudgeDetector,
    summarizer: Option<Arc<dyn Summarizer>>,
    usage: Arc<UsageTracker>,
    transcript: Option<Arc<Transcript>>,
    system_prompt: Option<String>,
    max_depth: u32,
    max_nudges: u32,
    max_identical_failures: u32,
    state: LoopState,
}

impl LoopController {
    /// Create a loop. Invalid `settings` are a configuration error.
    pub fn new(
        settings: &LoopSettings,
        provider: Arc<dyn Provider>,
        registry: Arc<ToolRegistry>,
        approver: Arc<dyn Approver>,
        interrupts: InterruptReceiver,
        events: EventBus,
    ) -> Result<Self, ConfigError> {
        settings.validate()?;

        let usage = Arc::new(UsageTracker::new(provider.model(), PricingTable::with_defaults()));
        Ok(Self {
            stream: StreamProcessor::new(provider, events.clone()),
            pipeline: ToolPipeline::new(registry, approver, events.clone()),
            builder: RequestBuilder::new(TokenBudget::from(settings)),
            history: HistoryStore::new(CompressionPolicy::from(settings)),
            interrupts,
            events,
            nudges: NudgeDetector::disabled(),
            summarizer: None,
            usage,
            transcript: None,
            system_prompt: None,
            max_depth: settings.max_depth,
            max_nudges: settings.max_nudges,
            max_identical_failures: settings.max_identical_failures.max(1),
            state: LoopState::Idle,
        })
    }

    /// System prompt placed at the start of a fresh conversation.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Source of the reminder appended after each tool batch.
    pub fn with_reminder(mut self, reminder: Arc<dyn ReminderSource>) -> Self {
        self.pipeline = self.pipeline.with_reminder(reminder);
        self
    }

    pub fn with_nudges(mut self, nudges: NudgeDetector) -> Self {
        self.nudges = nudges;
        self
    }

    /// Write compression summaries with `summarizer` instead of the offline
    /// digest.
    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Share a usage tracker (e.g. one with config pricing applied).
    pub fn with_usage_tracker(mut self, usage: Arc<UsageTracker>) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_transcript(mut self, transcript: Arc<Transcript>) -> Self {
        self.transcript = Some(transcript);
        self
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn usage(&self) -> &Arc<UsageTracker> {
        &self.usage
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Handle one operator message and run until the loop is idle again.
    ///
    /// Instructions that arrived after the previous turn ended are added
    /// ahead of `input`; stale stops are dropped with a notice.
    pub async fn run_turn(&mut self, input: &str) -> TurnReport {
        if self.history.is_empty()
            && let Some(prompt) = self.system_prompt.clone()
        {
            self.append(Message::system(prompt));
        }
        for instruction in self.take_between_turns() {
            self.append(Message::user(instruction).with_kind(MessageKind::Interrupt));
        }
        self.append(Message::user(input));
        self.drive().await
    }

    /// Run a delegated task in a fresh history, then return to the parent
    /// conversation and record the outcome there. The report carries the
    /// task's final text.
    pub async fn run_task(&mut self, system_prompt: &str, input: &str) -> TurnReport {
        let fresh = self.history.fresh();
        let parent = std::mem::replace(&mut self.history, fresh);
        info!(parent_messages = parent.len(), "Starting delegated task");

        self.append(Message::system(system_prompt));
        self.append(Message::user(input));
        let report = self.drive().await;

        self.history = parent;
        let outcome = match (&report.end, &report.text) {
            (TurnEnd::Completed, Some(text)) => text.clone(),
            (end, _) => format!("Task did not complete ({end:?})."),
        };
        self.append(
            Message::system(format!("Delegated task: {input}\n\nResult:\n{outcome}"))
                .with_kind(MessageKind::TaskResult),
        );
        debug!(end = ?report.end, "Delegated task finished");
        report
    }

    /// Input that reached the interrupt channel after the last turn ended,
    /// joined into one message. Callers use it to start a follow-up turn
    /// right away instead of waiting for the operator. Stale stops are
    /// dropped with a notice.
    pub fn take_pending_input(&mut self) -> Option<String> {
        let instructions = self.take_between_turns();
        (!instructions.is_empty()).then(|| instructions.join("\n"))
    }

    fn take_between_turns(&mut self) -> Vec<String> {
        let mut instructions = Vec::new();
        let mut stops = 0usize;
        for signal in self.interrupts.drain() {
            match signal {
                Signal::Stop => stops += 1,
                Signal::Instruction(text) => instructions.push(text),
            }
        }
        if stops > 0 {
            debug!(stops, "Dropped stop requests that arrived after the turn ended");
            self.events.publish(AgentEvent::Notice {
                message: "Stop ignored: no turn was running".to_string(),
            });
        }
        if !instructions.is_empty() {
            info!(count = instructions.len(), "Carrying late instructions into the next turn");
            self.events.publish(AgentEvent::Notice {
                message: format!(
                    "{} instruction(s) arrived after the turn ended; carried into the next turn",
                    instructions.len()
                ),
            });
        }
        instructions
    }

    async fn drive(&mut self) -> TurnReport {
        let usage_before = self.usage.snapshot();
        let mut depth: u32 = 0;
        let mut nudges: u32 = 0;
        let mut tool_calls: usize = 0;
        let mut failures: HashMap<String, u32> = HashMap::new();

        let end = loop {
            self.set_state(LoopState::Thinking);

            if depth >= self.max_depth {
                warn!(depth, max_depth = self.max_depth, "Recursion depth exhausted");
                self.report_error(
                    ErrorKind::RecursionExhausted,
                    format!(
                        "Stopped after {depth} tool rounds without a final answer (max_depth = {}).",
                        self.max_depth
                    ),
                );
                break TurnEnd::DepthExceeded;
            }

            let tools = self.pipeline.registry().schemas_for_request();
            let overhead = estimate_tools_tokens(&tools);
            let compressed = match self.summarizer.clone() {
                Some(summarizer) => self.history.compress_with(overhead, summarizer.as_ref()).await,
                None => self.history.compress_if_needed(overhead),
            };
            if let Some(report) = compressed {
                self.events.publish(AgentEvent::Notice {
                    message: format!(
                        "History compressed from ~{} to ~{} tokens",
                        report.tokens_before, report.tokens_after
                    ),
                });
            }

            let request = match self.builder.build(self.history.snapshot(), tools) {
                Ok(request) => request,
                Err(e) => {
                    warn!(error = %e, "Request does not fit the context window");
                    self.report_error(ErrorKind::Budget, e.to_string());
                    break TurnEnd::BudgetExceeded;
                }
            };

            debug!(depth, messages = request.messages.len(), "Requesting model turn");
            self.events.publish(AgentEvent::ThinkingStarted { depth });
            let turn = self.stream.run(request, &mut self.interrupts).await;

            match turn.usage {
                Some(u) => {
                    self.history.record_usage(u);
                    self.usage.record_llm_call(
                        turn.model.as_deref().unwrap_or(""),
                        u.prompt_tokens,
                        u.completion_tokens,
                    );
                }
                None if turn.outcome == StreamOutcome::Completed => {
                    self.usage.record_unmetered_call()
                }
                None => {}
            }

            match turn.outcome {
                StreamOutcome::Stopped => {
                    self.append_partial(turn.message);
                    self.record_stop();
                    break TurnEnd::Stopped;
                }
                StreamOutcome::Interrupted(instruction) => {
                    self.append_partial(turn.message);
                    self.inject_instruction(instruction);
                    depth = 0;
                    nudges = 0;
                    continue;
                }
                StreamOutcome::Completed => {}
            }

            let text = turn.message.text().to_string();
            self.append(turn.message);

            if let Some(e) = turn.transport_error {
                self.report_error(ErrorKind::Transport, e.to_string());
                break TurnEnd::TransportFailed;
            }

            if !turn.calls.is_empty() {
                // the pipeline announces its own state changes
                self.state = LoopState::ToolExecuting;
                let batch = self.pipeline.run(&turn.calls, &mut self.interrupts).await;
                tool_calls += batch.records.len();
                for _ in 0..batch.executed() {
                    self.usage.record_tool_execution();
                }
                for message in batch.messages {
                    self.append(message);
                }

                let mut tripped = None;
                for record in &batch.records {
                    if record.status == CallStatus::Malformed {
                        self.report_error(
                            ErrorKind::MalformedArguments,
                            format!("{}: {}", record.tool_name, record.content),
                        );
                    }
                    if let Some(key) = record.failure_key() {
                        let count = failures.entry(key).or_insert(0);
                        *count += 1;
                        if *count >= self.max_identical_failures {
                            tripped = Some((record.clone(), *count));
                        }
                    }
                }

                match batch.halt {
                    Some(BatchHalt::Stopped) => {
                        self.record_stop();
                        break TurnEnd::Stopped;
                    }
                    Some(BatchHalt::Instruction(instruction)) => {
                        self.inject_instruction(instruction);
                        depth = 0;
                        nudges = 0;
                        continue;
                    }
                    None => {}
                }

                if let Some((record, count)) = tripped {
                    warn!(tool = %record.tool_name, count, "Repeated identical tool failure");
                    self.report_error(
                        ErrorKind::ToolFailure,
                        format!(
                            "{} failed {count} times with the same arguments: {}",
                            record.tool_name, record.content
                        ),
                    );
                    break TurnEnd::RepeatedFailure;
                }

                depth += 1;
                continue;
            }

            if nudges < self.max_nudges
                && let Some(nudge) = self.nudges.check(&text)
            {
                nudges += 1;
                info!(nudges, "Assistant described an action without calling a tool");
                let nudge = nudge.to_string();
                self.append(Message::system(nudge).with_kind(MessageKind::Nudge));
                continue;
            }

            break TurnEnd::Completed;
        };

        self.finish(end, depth, nudges, tool_calls, usage_before)
    }

    fn finish(
        &mut self,
        end: TurnEnd,
        depth: u32,
        nudges: u32,
        tool_calls: usize,
        usage_before: kestrel_telemetry::UsageSnapshot,
    ) -> TurnReport {
        let text = self
            .history
            .messages()
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .and_then(|m| m.content.clone())
            .filter(|t| !t.trim().is_empty());

        if end != TurnEnd::Stopped {
            self.events.publish(AgentEvent::TurnComplete { text: text.clone() });
        }

        let turn = self.usage.snapshot().since(&usage_before);
        let context_percent = self.history.context_usage_percent();
        self.events.publish(AgentEvent::StatusLine {
            summary: self.usage.status_line(&turn, context_percent),
            input_tokens: turn.input_tokens,
            output_tokens: turn.output_tokens,
            context_percent,
            cost_usd: turn.cost_usd,
        });

        self.set_state(LoopState::Idle);
        info!(end = ?end, depth, tool_calls, "Turn finished");

        TurnReport {
            end,
            text,
            depth,
            nudges,
            tool_calls,
        }
    }

    fn append(&mut self, message: Message) {
        if let Some(transcript) = &self.transcript {
            transcript.record_message(&message);
        }
        self.history.append(message);
    }

    /// Keep whatever the model said before it was cut off.
    fn append_partial(&mut self, message: Message) {
        if !message.text().trim().is_empty() {
            self.append(message);
        }
    }

    fn record_stop(&mut self) {
        info!("Turn stopped by operator");
        self.append(Message::system(STOPPED_NOTICE).with_kind(MessageKind::Stopped));
        self.events.publish(AgentEvent::Stopped);
    }

    fn inject_instruction(&mut self, instruction: String) {
        info!("Operator instruction injected");
        self.set_state(LoopState::Interrupted);
        self.append(Message::user(instruction).with_kind(MessageKind::Interrupt));
    }

    fn report_error(&self, kind: ErrorKind, message: String) {
        self.events.publish(AgentEvent::Error { kind, message });
    }

    fn set_state(&mut self, state: LoopState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "Loop state");
            self.state = state;
            self.events.publish(AgentEvent::StateChanged { state });
        }
    }
}
