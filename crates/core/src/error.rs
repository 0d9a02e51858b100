//! Error types for the Kestrel domain.
//!
//! Uses `thiserror` for ergonomic error definitions. Each seam has its own
//! error type; binaries wrap them in `anyhow`.

use thiserror::Error;

/// Failures talking to the model backend. All of these are transport-level
/// from the loop's point of view and are recovered by the non-streaming
/// fallback before being surfaced.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Permission denied: {tool_name}: {reason}")]
    PermissionDenied { tool_name: String, reason: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("Tool panicked: {0}")]
    Panicked(String),
}

/// The request builder could not fit a usable output window into the
/// model's context. Retrying does not help; the configuration or the
/// history has to change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BudgetError {
    #[error(
        "output window of {available} tokens is below the minimum of {minimum} \
         (input ≈ {input_tokens}, context limit {context_limit}, reserve {reserve})"
    )]
    OutputFloor {
        available: i64,
        minimum: u32,
        input_tokens: usize,
        context_limit: u32,
        reserve: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_displays_correctly() {
        let err = ProviderError::ApiError {
            status_code: 429,
            message: "Too many requests".into(),
        };
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("Too many requests"));
    }

    #[test]
    fn tool_error_displays_correctly() {
        let err = ToolError::PermissionDenied {
            tool_name: "shell".into(),
            reason: "command not in allowlist".into(),
        };
        assert!(err.to_string().contains("shell"));
        assert!(err.to_string().contains("allowlist"));
    }

    #[test]
    fn budget_error_reports_numbers() {
        let err = BudgetError::OutputFloor {
            available: 12,
            minimum: 256,
            input_tokens: 990,
            context_limit: 1000,
            reserve: 0,
        };
        let text = err.to_string();
        assert!(text.contains("12"));
        assert!(text.contains("256"));
        assert!(text.contains("1000"));
    }
}
