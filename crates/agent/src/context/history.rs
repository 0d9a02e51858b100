//! The conversation history store.
//!
//! An ordered log of [`Message`]s owned by the loop controller. It grows by
//! appending; the only other mutation is compression, which runs in two
//! phases when the estimated input reaches the configured fraction of the
//! context window:
//!
//! 1. Tool results older than the retention window are replaced with a
//!    placeholder.
//! 2. If that is not enough, the non-system messages of a contiguous middle
//!    range are collapsed into one summary message. The range is narrowed so
//!    it always covers whole assistant + tool-result groups. System messages
//!    in the range stay; earlier summaries are folded into the new one.
//!
//! The first message and the most recent user message are never touched.

use super::summary::{self, Summarizer};
use super::token::{estimate_message_tokens, estimate_messages_tokens};
use kestrel_config::LoopSettings;
use kestrel_core::message::{Message, MessageKind, Role};
use kestrel_core::provider::Usage;
use tracing::{debug, info, warn};

/// Replaces tool results dropped by compression or periodic clearing.
pub const CLEARED_TOOL_RESULT: &str = "[Tool result cleared to save context]";

/// Compression knobs, taken from `[loop]` settings.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressionPolicy {
    pub context_limit: u32,
    /// Fraction of `context_limit` at which compression starts
    pub threshold: f64,
    /// Most recent tool results kept verbatim
    pub tool_result_retention: usize,
    /// Trailing messages never folded into a summary
    pub keep_recent: usize,
    pub summary_max_chars: usize,
    /// Clear old tool results every this many appended results (0 = never)
    pub auto_clear_every: usize,
}

impl From<&LoopSettings> for CompressionPolicy {
    fn from(s: &LoopSettings) -> Self {
        Self {
            context_limit: s.context_limit,
            threshold: s.compression_threshold,
            tool_result_retention: s.tool_result_retention,
            keep_recent: s.keep_recent_messages,
            summary_max_chars: s.summary_max_chars,
            auto_clear_every: s.auto_clear_every,
        }
    }
}

impl Default for CompressionPolicy {
    fn default() -> Self {
        Self::from(&LoopSettings::default())
    }
}

/// What a compression pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionReport {
    pub tokens_before: usize,
    pub tokens_after: usize,
    /// Tool results replaced with the placeholder in phase 1
    pub cleared_tool_results: usize,
    /// Messages folded into the summary in phase 2
    pub summarized_messages: usize,
}

impl CompressionReport {
    /// Whether the pass got under the threshold it was aiming for.
    pub fn below(&self, threshold_tokens: f64) -> bool {
        (self.tokens_after as f64) < threshold_tokens
    }
}

#[derive(Debug, Clone)]
pub struct HistoryStore {
    messages: Vec<Message>,
    policy: CompressionPolicy,
    tool_results_since_clear: usize,
    last_usage: Option<Usage>,
}

impl HistoryStore {
    pub fn new(policy: CompressionPolicy) -> Self {
        Self {
            messages: Vec::new(),
            policy,
            tool_results_since_clear: 0,
            last_usage: None,
        }
    }

    /// An empty store with the same policy (used for delegated tasks).
    pub fn fresh(&self) -> Self {
        Self::new(self.policy.clone())
    }

    pub fn policy(&self) -> &CompressionPolicy {
        &self.policy
    }

    /// Append a message. Every `auto_clear_every` tool results, older
    /// results beyond the retention window are cleared.
    pub fn append(&mut self, message: Message) {
        let is_tool = message.role == Role::Tool;
        self.messages.push(message);

        if is_tool && self.policy.auto_clear_every > 0 {
            self.tool_results_since_clear += 1;
            if self.tool_results_since_clear >= self.policy.auto_clear_every {
                let cleared = self.clear_old_tool_results(self.policy.tool_result_retention);
                if cleared > 0 {
                    debug!(cleared, "Cleared old tool results");
                }
                self.tool_results_since_clear = 0;
            }
        }
    }

    /// A copy of the current messages, in order.
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Estimated input tokens for the whole history.
    pub fn estimate_tokens(&self) -> usize {
        estimate_messages_tokens(&self.messages)
    }

    /// Remember the provider-reported usage of the last request.
    pub fn record_usage(&mut self, usage: Usage) {
        self.last_usage = Some(usage);
    }

    pub fn last_usage(&self) -> Option<Usage> {
        self.last_usage
    }

    /// Context window usage in percent. Prefers the provider's own count
    /// from the last request and falls back to the local estimate.
    pub fn context_usage_percent(&self) -> f64 {
        if self.policy.context_limit == 0 {
            return 0.0;
        }
        let used = match self.last_usage {
            Some(u) if u.total_tokens > 0 => u.total_tokens as f64,
            _ => self.estimate_tokens() as f64,
        };
        100.0 * used / f64::from(self.policy.context_limit)
    }

    fn threshold_tokens(&self) -> f64 {
        self.policy.threshold * f64::from(self.policy.context_limit)
    }

    /// Whether `overhead_tokens` (tool schemas) plus the history reach the
    /// compression threshold.
    pub fn needs_compression(&self, overhead_tokens: usize) -> bool {
        (self.estimate_tokens() + overhead_tokens) as f64 >= self.threshold_tokens()
    }

    /// Compress when over threshold, summarizing offline. Never fails: if
    /// both phases together cannot get below the threshold, the history is
    /// left as small as they made it and the request proceeds anyway.
    pub fn compress_if_needed(&mut self, overhead_tokens: usize) -> Option<CompressionReport> {
        let (tokens_before, cleared) = self.begin_compression(overhead_tokens)?;
        let summarized = match self.plan_summary(overhead_tokens) {
            Some(plan) => {
                let text = summary::digest(&plan.folded, self.policy.summary_max_chars);
                self.apply_summary(plan, text)
            }
            None => 0,
        };
        Some(self.end_compression(overhead_tokens, tokens_before, cleared, summarized))
    }

    /// Like [`compress_if_needed`](Self::compress_if_needed), but phase 2
    /// asks `summarizer` for the summary and falls back to the offline
    /// digest if that fails.
    pub async fn compress_with(
        &mut self,
        overhead_tokens: usize,
        summarizer: &dyn Summarizer,
    ) -> Option<CompressionReport> {
        let (tokens_before, cleared) = self.begin_compression(overhead_tokens)?;
        let summarized = match self.plan_summary(overhead_tokens) {
            Some(plan) => {
                let text = match summarizer.summarize(&plan.folded).await {
                    Ok(body) => format!("{}\n{body}", summary::header(plan.folded.len())),
                    Err(e) => {
                        warn!(error = %e, "Summary request failed, using digest");
                        summary::digest(&plan.folded, self.policy.summary_max_chars)
                    }
                };
                self.apply_summary(plan, text)
            }
            None => 0,
        };
        Some(self.end_compression(overhead_tokens, tokens_before, cleared, summarized))
    }

    /// Phase 1. `None` when under threshold.
    fn begin_compression(&mut self, overhead_tokens: usize) -> Option<(usize, usize)> {
        if !self.needs_compression(overhead_tokens) {
            return None;
        }

        let tokens_before = self.estimate_tokens() + overhead_tokens;
        info!(
            tokens = tokens_before,
            limit = self.policy.context_limit,
            "History over threshold, compressing"
        );
        let cleared = self.clear_old_tool_results(self.policy.tool_result_retention);
        Some((tokens_before, cleared))
    }

    fn end_compression(
        &self,
        overhead_tokens: usize,
        tokens_before: usize,
        cleared_tool_results: usize,
        summarized_messages: usize,
    ) -> CompressionReport {
        let report = CompressionReport {
            tokens_before,
            tokens_after: self.estimate_tokens() + overhead_tokens,
            cleared_tool_results,
            summarized_messages,
        };

        if report.below(self.threshold_tokens()) {
            debug!(?report, "Compression finished");
        } else {
            warn!(
                tokens = report.tokens_after,
                limit = self.policy.context_limit,
                "History still over threshold after compression"
            );
        }
        report
    }

    /// Replace all but the newest `keep_last` tool results with the
    /// placeholder. Returns how many were newly cleared.
    pub fn clear_old_tool_results(&mut self, keep_last: usize) -> usize {
        let tool_indices: Vec<usize> = self
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.role == Role::Tool)
            .map(|(i, _)| i)
            .collect();

        if tool_indices.len() <= keep_last {
            return 0;
        }

        let mut cleared = 0;
        for &idx in &tool_indices[..tool_indices.len() - keep_last] {
            let msg = &mut self.messages[idx];
            if msg.text() != CLEARED_TOOL_RESULT {
                msg.content = Some(CLEARED_TOOL_RESULT.to_string());
                cleared += 1;
            }
        }
        cleared
    }

    fn latest_user_index(&self) -> Option<usize> {
        self.messages.iter().rposition(|m| m.role == Role::User)
    }

    /// Pick the range to collapse: everything between the first message and
    /// the protected tail, minus the latest user message. When that message
    /// sits inside the range, the larger side of it is used.
    fn summary_range(&self) -> Option<(usize, usize)> {
        let n = self.messages.len();
        let start = 1;
        let tail = n.saturating_sub(self.policy.keep_recent).max(start);

        let (start, end) = match self.latest_user_index() {
            Some(u) if u >= start && u < tail => {
                let before = estimate_messages_tokens(&self.messages[start..u]);
                let after = estimate_messages_tokens(&self.messages[u + 1..tail]);
                if before >= after { (start, u) } else { (u + 1, tail) }
            }
            _ => (start, tail),
        };

        let (start, end) = self.align_to_groups(start, end);
        (end > start).then_some((start, end))
    }

    /// Shrink `[start, end)` so no tool result is separated from the
    /// assistant message that issued it.
    fn align_to_groups(&self, mut start: usize, mut end: usize) -> (usize, usize) {
        // A tool result at the start belongs to an assistant outside the range.
        while start < end && self.messages[start].role == Role::Tool {
            start += 1;
        }
        // A tool result just past the end pulls its whole group out; `end`
        // stops on the issuing assistant, which stays outside.
        if end < self.messages.len() {
            while end > start && self.messages[end].role == Role::Tool {
                end -= 1;
            }
        }
        (start, end)
    }

    /// Phase 2 input, if phase 1 was not enough and there is something to
    /// fold.
    fn plan_summary(&self, overhead_tokens: usize) -> Option<SummaryPlan> {
        if !self.needs_compression(overhead_tokens) {
            return None;
        }
        let Some((start, end)) = self.summary_range() else {
            debug!("Nothing compressible between first message and recent tail");
            return None;
        };

        let mut folded = Vec::new();
        let mut kept = Vec::new();
        for msg in &self.messages[start..end] {
            match (msg.role, msg.kind()) {
                (Role::System, Some(MessageKind::Summary)) => folded.push(msg.clone()),
                (Role::System, _) => kept.push(msg.clone()),
                _ => folded.push(msg.clone()),
            }
        }
        if folded.iter().all(|m| m.role == Role::System) {
            debug!("Range holds only system messages, nothing to fold");
            return None;
        }

        Some(SummaryPlan {
            start,
            end,
            folded,
            kept,
        })
    }

    /// Replace the planned range with its system messages followed by the
    /// summary. Returns how many messages were folded (0 if the summary
    /// would not shrink the history).
    fn apply_summary(&mut self, plan: SummaryPlan, text: String) -> usize {
        let count = plan.folded.len();
        let saved = estimate_messages_tokens(&plan.folded);

        let summary = Message::system(text).with_kind(MessageKind::Summary);
        let added = estimate_message_tokens(&summary);
        if added >= saved {
            debug!(messages = count, "Summary would not shrink history, skipping");
            return 0;
        }

        self.messages.splice(
            plan.start..plan.end,
            plan.kept.into_iter().chain(std::iter::once(summary)),
        );
        info!(
            messages = count,
            tokens_saved = saved - added,
            "Collapsed history into summary"
        );
        count
    }
}

/// A range chosen for phase 2, split into what gets folded (non-system
/// messages and earlier summaries) and the system messages that stay.
struct SummaryPlan {
    start: usize,
    end: usize,
    folded: Vec<Message>,
    kept: Vec<Message>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::message::ToolCallRequest;

    fn policy(limit: u32) -> CompressionPolicy {
        CompressionPolicy {
            context_limit: limit,
            threshold: 0.8,
            tool_result_retention: 2,
            keep_recent: 4,
            summary_max_chars: 400,
            auto_clear_every: 0,
        }
    }

    fn call_group(id: &str, payload: &str) -> Vec<Message> {
        vec![
            Message::assistant_with_calls(
                Some(format!("checking {id}")),
                vec![ToolCallRequest::new(id, "file_read", r#"{"path":"a"}"#)],
            ),
            Message::tool_result(id, payload),
        ]
    }

    fn assert_pairing(messages: &[Message]) {
        for (i, m) in messages.iter().enumerate() {
            if m.role == Role::Tool {
                let id = m.tool_call_id.as_deref().unwrap();
                let issuer = messages[..i]
                    .iter()
                    .rev()
                    .find(|p| p.role != Role::Tool)
                    .unwrap();
                assert!(
                    issuer.tool_calls.iter().any(|c| c.id == id),
                    "orphaned tool result {id}"
                );
            }
            if m.has_tool_calls() {
                for (k, call) in m.tool_calls.iter().enumerate() {
                    assert_eq!(messages[i + 1 + k].tool_call_id.as_deref(), Some(call.id.as_str()));
                }
            }
        }
    }

    #[test]
    fn below_threshold_is_a_no_op() {
        let mut store = HistoryStore::new(policy(100_000));
        store.append(Message::system("sys"));
        store.append(Message::user("hi"));
        let before = store.snapshot();

        assert!(store.compress_if_needed(0).is_none());
        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn phase_one_clears_old_tool_results_only() {
        let mut store = HistoryStore::new(policy(400));
        store.append(Message::system("sys"));
        store.append(Message::user("go"));
        for i in 0..4 {
            for m in call_group(&format!("c{i}"), &"x".repeat(400)) {
                store.append(m);
            }
        }

        let report = store.compress_if_needed(0).unwrap();
        assert_eq!(report.cleared_tool_results, 2);
        assert_eq!(report.summarized_messages, 0);
        assert!(report.tokens_after < report.tokens_before);

        let tools: Vec<_> = store
            .messages()
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| m.text().to_string())
            .collect();
        assert_eq!(tools[0], CLEARED_TOOL_RESULT);
        assert_eq!(tools[1], CLEARED_TOOL_RESULT);
        assert_eq!(tools[3].len(), 400);
    }

    #[test]
    fn phase_two_keeps_first_and_latest_user_and_pairs() {
        let mut store = HistoryStore::new(policy(300));
        store.append(Message::system("you are a coding assistant"));
        store.append(Message::user("first task ".repeat(30)));
        for i in 0..3 {
            for m in call_group(&format!("a{i}"), &"r".repeat(80)) {
                store.append(m);
            }
        }
        store.append(Message::assistant("done with the first task ".repeat(10)));
        store.append(Message::user("second task please"));
        for i in 0..2 {
            for m in call_group(&format!("b{i}"), "ok") {
                store.append(m);
            }
        }

        let first = store.messages()[0].clone();
        let latest_user = store
            .messages()
            .iter()
            .rfind(|m| m.role == Role::User)
            .cloned()
            .unwrap();

        let report = store.compress_if_needed(0).unwrap();
        assert_eq!(report.cleared_tool_results, 3);
        assert!(report.summarized_messages > 0);
        assert!(report.below(240.0), "{report:?}");

        assert_eq!(store.messages()[0], first);
        assert!(store.messages().contains(&latest_user));
        assert_eq!(store.messages()[1].kind(), Some(MessageKind::Summary));
        assert_pairing(store.messages());

        // already compressed and below threshold: nothing more to do
        let before = store.snapshot();
        assert!(store.compress_if_needed(0).is_none());
        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn tail_boundary_never_splits_a_group() {
        let mut store = HistoryStore::new(CompressionPolicy {
            keep_recent: 1,
            ..policy(100)
        });
        store.append(Message::system("sys"));
        store.append(Message::user("u"));
        store.append(Message::assistant("a".repeat(200)));
        for m in call_group("z", "result") {
            store.append(m);
        }

        store.compress_if_needed(0);
        assert_pairing(store.messages());
        assert_eq!(store.last().unwrap().tool_call_id.as_deref(), Some("z"));
    }

    #[test]
    fn auto_clear_runs_periodically() {
        let mut store = HistoryStore::new(CompressionPolicy {
            auto_clear_every: 3,
            tool_result_retention: 1,
            ..policy(1_000_000)
        });
        for i in 0..3 {
            for m in call_group(&format!("c{i}"), "payload") {
                store.append(m);
            }
        }
        let cleared = store
            .messages()
            .iter()
            .filter(|m| m.text() == CLEARED_TOOL_RESULT)
            .count();
        assert_eq!(cleared, 2);
    }

    #[test]
    fn usage_percent_prefers_reported_usage() {
        let mut store = HistoryStore::new(policy(1000));
        store.append(Message::user("x".repeat(396))); // 99 + 4 tokens
        assert!((store.context_usage_percent() - 10.3).abs() < 1e-9);

        store.record_usage(Usage {
            prompt_tokens: 200,
            completion_tokens: 50,
            total_tokens: 250,
        });
        assert!((store.context_usage_percent() - 25.0).abs() < 1e-9);
    }

    fn with_earlier_summary() -> HistoryStore {
        let mut store = HistoryStore::new(CompressionPolicy {
            keep_recent: 2,
            ..policy(300)
        });
        store.append(Message::system("sys"));
        store.append(
            Message::system("[Earlier conversation compressed: 6 messages summarized]\nUSER: MARKER_EARLIER_GOAL")
                .with_kind(MessageKind::Summary),
        );
        store.append(Message::user("port the parser ".repeat(50)));
        store.append(Message::system("<reminder>1 todo open</reminder>").with_kind(MessageKind::Reminder));
        store.append(Message::assistant("working on the parser ".repeat(40)));
        store.append(Message::user("latest"));
        store.append(Message::assistant("ok"));
        store
    }

    #[test]
    fn second_compression_keeps_earlier_summary_and_system_messages() {
        let mut store = with_earlier_summary();

        let report = store.compress_if_needed(0).unwrap();
        assert_eq!(report.summarized_messages, 3);

        let summaries: Vec<_> = store
            .messages()
            .iter()
            .filter(|m| m.kind() == Some(MessageKind::Summary))
            .collect();
        assert_eq!(summaries.len(), 1);
        assert!(summaries[0].text().contains("MARKER_EARLIER_GOAL"));

        let kinds: Vec<_> = store.messages().iter().map(|m| m.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                None,
                Some(MessageKind::Reminder),
                Some(MessageKind::Summary),
                None,
                None
            ]
        );
        assert_eq!(store.messages()[3].text(), "latest");
    }

    struct Fixed(Result<&'static str, ()>);

    #[async_trait::async_trait]
    impl Summarizer for Fixed {
        async fn summarize(&self, messages: &[Message]) -> Result<String, kestrel_core::error::ProviderError> {
            assert!(messages.iter().all(|m| m.role != Role::System || m.kind() == Some(MessageKind::Summary)));
            self.0
                .map(str::to_string)
                .map_err(|()| kestrel_core::error::ProviderError::Network("offline".into()))
        }
    }

    #[tokio::test]
    async fn summarizer_writes_the_summary_body() {
        let mut store = with_earlier_summary();
        let report = store.compress_with(0, &Fixed(Ok("Porting the parser."))).await.unwrap();
        assert_eq!(report.summarized_messages, 3);

        let summary = store
            .messages()
            .iter()
            .find(|m| m.kind() == Some(MessageKind::Summary))
            .unwrap();
        assert_eq!(
            summary.text(),
            "[Earlier conversation compressed: 3 messages summarized]\nPorting the parser."
        );
    }

    #[tokio::test]
    async fn failed_summarizer_falls_back_to_digest() {
        let mut store = with_earlier_summary();
        store.compress_with(0, &Fixed(Err(()))).await.unwrap();

        let summary = store
            .messages()
            .iter()
            .find(|m| m.kind() == Some(MessageKind::Summary))
            .unwrap();
        assert!(summary.text().contains("MARKER_EARLIER_GOAL"));
        assert!(summary.text().contains("USER: port the parser"));
    }
}
