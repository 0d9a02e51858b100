//! Shell tool: execute system commands.
//!
//! Supports command allowlisting and a per-call timeout. Every call needs
//! operator approval unless the config exempts it.

use async_trait::async_trait;
use kestrel_core::error::ToolError;
use kestrel_core::tool::{ToolOutcome, TypedTool};
use serde::Deserialize;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
pub struct ShellArgs {
    pub command: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Execute shell commands with safety constraints.
pub struct ShellTool {
    /// If non-empty, only these commands are allowed.
    allowed_commands: Vec<String>,
    default_timeout: Duration,
}

impl ShellTool {
    pub fn new(allowed_commands: Vec<String>, default_timeout: Duration) -> Self {
        Self {
            allowed_commands,
            default_timeout,
        }
    }

    fn is_command_allowed(&self, command: &str) -> bool {
        if self.allowed_commands.is_empty() {
            return true;
        }

        let base_cmd = command.split_whitespace().next().unwrap_or("").trim();
        self.allowed_commands.iter().any(|a| a == base_cmd)
    }
}

#[async_trait]
impl TypedTool for ShellTool {
    type Args = ShellArgs;
    const NAME: &'static str = "shell";
    const DESCRIPTION: &'static str = "Execute a shell command and return stdout/stderr. Use this for running programs, builds, tests, git operations, etc.";
    const NEEDS_APPROVAL: bool = true;

    fn schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Kill the command after this many seconds"
                }
            },
            "required": ["command"]
        })
    }

    async fn run(&self, args: ShellArgs) -> Result<ToolOutcome, ToolError> {
        let command = args.command.as_str();
        if !self.is_command_allowed(command) {
            return Err(ToolError::PermissionDenied {
                tool_name: Self::NAME.into(),
                reason: format!(
                    "Command '{}' not in allowlist",
                    command.split_whitespace().next().unwrap_or("")
                ),
            });
        }

        debug!(command = %command, "Executing shell command");

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        cmd.kill_on_drop(true);

        let timeout = args
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ToolError::ExecutionFailed {
                    tool_name: Self::NAME.into(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                warn!(command = %command, timeout_secs = timeout.as_secs(), "Command timed out");
                return Ok(ToolOutcome::failure(format!(
                    "Command timed out after {}s",
                    timeout.as_secs()
                )));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let success = output.status.success();

        let result_text = if success {
            if stderr.is_empty() {
                stdout
            } else {
                format!("{stdout}\n[stderr]: {stderr}")
            }
        } else {
            let code = output.status.code().unwrap_or(-1);
            warn!(command = %command, exit_code = code, "Command failed");
            format!("[exit code: {code}]\n{stdout}\n{stderr}")
        };

        Ok(ToolOutcome {
            ok: success,
            message: result_text.trim().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(allowed: &[&str]) -> ShellTool {
        ShellTool::new(
            allowed.iter().map(|s| s.to_string()).collect(),
            Duration::from_secs(10),
        )
    }

    #[test]
    fn allowlist_check() {
        let tool = tool(&["ls", "cat", "git"]);
        assert!(tool.is_command_allowed("ls -la"));
        assert!(tool.is_command_allowed("git status"));
        assert!(!tool.is_command_allowed("rm -rf /"));
    }

    #[test]
    fn empty_allowlist_allows_all() {
        assert!(tool(&[]).is_command_allowed("anything goes"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn execute_echo() {
        let result = tool(&[])
            .run(ShellArgs {
                command: "echo hello".into(),
                timeout_secs: None,
            })
            .await
            .unwrap();
        assert!(result.ok);
        assert_eq!(result.message, "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_command_reports_exit_code() {
        let result = tool(&[])
            .run(ShellArgs {
                command: "exit 3".into(),
                timeout_secs: None,
            })
            .await
            .unwrap();
        assert!(!result.ok);
        assert!(result.message.contains("[exit code: 3]"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_command() {
        let result = tool(&[])
            .run(ShellArgs {
                command: "sleep 5".into(),
                timeout_secs: Some(1),
            })
            .await
            .unwrap();
        assert!(!result.ok);
        assert!(result.message.contains("timed out"));
    }

    #[tokio::test]
    async fn blocked_command() {
        let result = tool(&["ls"])
            .run(ShellArgs {
                command: "rm -rf /".into(),
                timeout_secs: None,
            })
            .await;
        assert!(matches!(result, Err(ToolError::PermissionDenied { .. })));
    }
}
