//! Request assembly under a token budget.

use crate::context::token::{estimate_messages_tokens, estimate_tools_tokens};
use kestrel_config::LoopSettings;
use kestrel_core::error::BudgetError;
use kestrel_core::message::Message;
use kestrel_core::provider::{ModelRequest, ToolChoice, ToolDefinition};
use tracing::trace;

/// Output budget for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBudget {
    pub context_limit: u32,
    /// Upper bound on output tokens regardless of free space
    pub output_cap: u32,
    /// Held back from the window on top of the input
    pub output_reserve: u32,
    /// Below this the request is not worth sending
    pub min_output_tokens: u32,
}

impl From<&LoopSettings> for TokenBudget {
    fn from(s: &LoopSettings) -> Self {
        Self {
            context_limit: s.context_limit,
            output_cap: s.output_cap,
            output_reserve: s.output_reserve,
            min_output_tokens: s.min_output_tokens,
        }
    }
}

impl TokenBudget {
    /// `min(cap, limit - input - reserve)`, or an error when that falls
    /// under the minimum.
    pub fn max_output_tokens(&self, input_tokens: usize) -> Result<u32, BudgetError> {
        let available = i64::from(self.context_limit)
            - i64::try_from(input_tokens).unwrap_or(i64::MAX)
            - i64::from(self.output_reserve);

        if available < i64::from(self.min_output_tokens) {
            return Err(BudgetError::OutputFloor {
                available,
                minimum: self.min_output_tokens,
                input_tokens,
                context_limit: self.context_limit,
                reserve: self.output_reserve,
            });
        }

        let available = u32::try_from(available).unwrap_or(u32::MAX);
        Ok(available.min(self.output_cap))
    }
}

/// Builds the next model request from a history snapshot and tool schemas.
#[derive(Debug, Clone, Copy)]
pub struct RequestBuilder {
    budget: TokenBudget,
}

impl RequestBuilder {
    pub fn new(budget: TokenBudget) -> Self {
        Self { budget }
    }

    pub fn budget(&self) -> TokenBudget {
        self.budget
    }

    pub fn build(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
    ) -> Result<ModelRequest, BudgetError> {
        let input_tokens = estimate_messages_tokens(&messages) + estimate_tools_tokens(&tools);
        let max_output_tokens = self.budget.max_output_tokens(input_tokens)?;
        trace!(input_tokens, max_output_tokens, "Built model request");

        Ok(ModelRequest {
            messages,
            tools,
            tool_choice: ToolChoice::Auto,
            max_output_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget() -> TokenBudget {
        TokenBudget {
            context_limit: 1000,
            output_cap: 300,
            output_reserve: 100,
            min_output_tokens: 50,
        }
    }

    #[test]
    fn cap_applies_when_space_is_plentiful() {
        assert_eq!(budget().max_output_tokens(10), Ok(300));
    }

    #[test]
    fn free_space_applies_when_tight() {
        // 1000 - 800 - 100
        assert_eq!(budget().max_output_tokens(800), Ok(100));
    }

    #[test]
    fn floor_violation_is_an_error() {
        let err = budget().max_output_tokens(880).unwrap_err();
        match err {
            BudgetError::OutputFloor { available, minimum, .. } => {
                assert_eq!(available, 20);
                assert_eq!(minimum, 50);
            }
        }
        assert!(budget().max_output_tokens(5000).is_err());
    }

    #[test]
    fn build_uses_auto_tool_choice_and_keeps_order() {
        let builder = RequestBuilder::new(budget());
        let tools = vec![
            ToolDefinition {
                name: "b".into(),
                description: "second".into(),
                parameters: serde_json::json!({"type": "object"}),
            },
            ToolDefinition {
                name: "a".into(),
                description: "first".into(),
                parameters: serde_json::json!({"type": "object"}),
            },
        ];
        let req = builder
            .build(vec![Message::system("s"), Message::user("u")], tools)
            .unwrap();
        assert_eq!(req.tool_choice, ToolChoice::Auto);
        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.tools[0].name, "b");
        assert_eq!(req.max_output_tokens, 300);
    }
}
