//! Summary text for compressed history.
//!
//! Compression folds a middle range of the conversation into one system
//! message. The text comes from a [`Summarizer`] when one is configured;
//! [`digest`] is the offline fallback and never fails.

use async_trait::async_trait;
use kestrel_core::error::ProviderError;
use kestrel_core::message::{Message, MessageKind, Role};
use kestrel_core::provider::{ModelRequest, Provider, ToolChoice};
use std::sync::Arc;
use tracing::debug;

use super::history::CLEARED_TOOL_RESULT;

/// Characters of each tool result kept in a transcript line.
const TOOL_PREVIEW: usize = 200;

const SUMMARY_PROMPT: &str = "\
Analyze this conversation and write a concise summary that preserves:

1. Key architectural decisions
2. Unresolved bugs or issues
3. Important implementation details
4. User preferences and requirements
5. Context needed to continue the work

Drop redundant tool output and repeated information. Earlier summaries are \
part of the conversation; fold what still matters from them into yours.";

/// Writes the body of a compression summary.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, messages: &[Message]) -> Result<String, ProviderError>;
}

/// Asks the model for the summary with a single non-streaming request.
pub struct ModelSummarizer {
    provider: Arc<dyn Provider>,
    max_tokens: u32,
}

impl ModelSummarizer {
    pub fn new(provider: Arc<dyn Provider>, max_tokens: u32) -> Self {
        Self {
            provider,
            max_tokens,
        }
    }
}

#[async_trait]
impl Summarizer for ModelSummarizer {
    async fn summarize(&self, messages: &[Message]) -> Result<String, ProviderError> {
        let prompt = format!(
            "{SUMMARY_PROMPT}\n\nConversation:\n{}\n\nProvide a focused summary (200-400 tokens):",
            transcript_lines(messages).join("\n")
        );
        let request = ModelRequest {
            messages: vec![Message::user(prompt)],
            tools: Vec::new(),
            tool_choice: ToolChoice::None,
            max_output_tokens: self.max_tokens,
        };

        let response = self.provider.complete(request).await?;
        let text = response.message.text().trim();
        if text.is_empty() {
            return Err(ProviderError::ApiError {
                status_code: 200,
                message: "empty summary".into(),
            });
        }
        debug!(chars = text.len(), "Model wrote a history summary");
        Ok(text.to_string())
    }
}

/// One line per message, tool output shortened. Earlier summaries are
/// rendered in full so nothing they carried is lost.
pub(crate) fn transcript_lines(messages: &[Message]) -> Vec<String> {
    let mut lines = Vec::with_capacity(messages.len());
    for msg in messages {
        let line = match msg.role {
            Role::System if msg.kind() == Some(MessageKind::Summary) => {
                format!("EARLIER SUMMARY: {}", msg.text())
            }
            Role::System => continue,
            Role::Tool => {
                if msg.text() == CLEARED_TOOL_RESULT {
                    continue;
                }
                format!("TOOL: {}", preview(msg.text(), TOOL_PREVIEW))
            }
            Role::User => format!("USER: {}", msg.text()),
            Role::Assistant => {
                let mut line = format!("ASSISTANT: {}", msg.text());
                for call in &msg.tool_calls {
                    line.push_str(&format!(" [called {}]", call.name));
                }
                line
            }
        };
        lines.push(line);
    }
    lines
}

/// Header line of every summary message.
pub(crate) fn header(count: usize) -> String {
    format!("[Earlier conversation compressed: {count} messages summarized]")
}

/// Offline summary: earlier summaries verbatim, then a capped digest of
/// the other messages.
pub fn digest(messages: &[Message], max_chars: usize) -> String {
    let (earlier, rest): (Vec<&Message>, Vec<&Message>) = messages
        .iter()
        .partition(|m| m.kind() == Some(MessageKind::Summary));

    let rest: Vec<Message> = rest.into_iter().cloned().collect();
    let mut body = header(rest.len());
    for line in transcript_lines(&rest) {
        body.push('\n');
        body.push_str(&line);
    }
    let body = preview(&body, max_chars);

    if earlier.is_empty() {
        return body;
    }
    let mut out: Vec<&str> = earlier.iter().map(|m| m.text()).collect();
    out.push(&body);
    out.join("\n")
}

/// First `max` characters, with an ellipsis when cut.
fn preview(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::ScriptedProvider;

    #[test]
    fn digest_is_capped() {
        let msgs = vec![Message::user("y".repeat(1000))];
        let text = digest(&msgs, 100);
        assert_eq!(text.chars().count(), 103);
        assert!(text.ends_with("..."));
    }

    #[test]
    fn digest_carries_earlier_summaries() {
        let msgs = vec![
            Message::system("[Earlier conversation compressed: 4 messages summarized]\nUSER: MARKER_EARLIER_GOAL")
                .with_kind(MessageKind::Summary),
            Message::user("z".repeat(500)),
        ];
        let text = digest(&msgs, 60);
        assert!(text.contains("MARKER_EARLIER_GOAL"));
        assert!(text.contains("1 messages summarized"));
    }

    #[tokio::test]
    async fn model_summary_uses_a_capped_request() {
        let provider = Arc::new(
            ScriptedProvider::new().response(Message::assistant("  The user wants X.  ")),
        );
        let summarizer = ModelSummarizer::new(provider.clone(), 500);

        let text = summarizer
            .summarize(&[Message::user("please build X"), Message::assistant("on it")])
            .await
            .unwrap();
        assert_eq!(text, "The user wants X.");

        let requests = provider.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].max_output_tokens, 500);
        assert!(requests[0].tools.is_empty());
        assert!(requests[0].messages[0].text().contains("USER: please build X"));
    }

    #[tokio::test]
    async fn empty_model_summary_is_an_error() {
        let provider = Arc::new(ScriptedProvider::new().response(Message::assistant("   ")));
        let summarizer = ModelSummarizer::new(provider, 100);
        assert!(summarizer.summarize(&[Message::user("hi")]).await.is_err());
    }
}
