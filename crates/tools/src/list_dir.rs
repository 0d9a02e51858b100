//! Directory listing tool.

use async_trait::async_trait;
use kestrel_core::error::ToolError;
use kestrel_core::tool::{ToolOutcome, TypedTool};
use serde::Deserialize;

/// Listings longer than this are cut off.
const MAX_ENTRIES: usize = 500;

#[derive(Debug, Deserialize)]
pub struct ListDirArgs {
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub show_hidden: bool,
}

fn default_path() -> String {
    ".".into()
}

#[derive(Default)]
pub struct ListDirTool;

#[async_trait]
impl TypedTool for ListDirTool {
    type Args = ListDirArgs;
    const NAME: &'static str = "list_dir";
    const DESCRIPTION: &'static str =
        "List the entries of a directory. Directories are shown with a trailing '/'.";
    const PARALLEL_SAFE: bool = true;

    fn schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory to list (default: current directory)"
                },
                "show_hidden": {
                    "type": "boolean",
                    "description": "Include entries starting with '.'"
                }
            }
        })
    }

    async fn run(&self, args: ListDirArgs) -> Result<ToolOutcome, ToolError> {
        let mut dir = match tokio::fs::read_dir(&args.path).await {
            Ok(dir) => dir,
            Err(e) => {
                return Ok(ToolOutcome::failure(format!(
                    "Failed to list {}: {e}",
                    args.path
                )));
            }
        };

        let mut entries = Vec::new();
        loop {
            let entry = match dir.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    return Err(ToolError::ExecutionFailed {
                        tool_name: Self::NAME.into(),
                        reason: e.to_string(),
                    });
                }
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            if !args.show_hidden && name.starts_with('.') {
                continue;
            }
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            entries.push(if is_dir { format!("{name}/") } else { name });
        }

        entries.sort();
        let total = entries.len();
        if total == 0 {
            return Ok(ToolOutcome::success(format!("{} is empty", args.path)));
        }
        entries.truncate(MAX_ENTRIES);
        let mut output = entries.join("\n");
        if total > MAX_ENTRIES {
            output.push_str(&format!("\n[{} more entries not shown]", total - MAX_ENTRIES));
        }
        Ok(ToolOutcome::success(output))
    }
}
