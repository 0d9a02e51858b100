//! File read tool: read file contents, optionally a line range.

use async_trait::async_trait;
use kestrel_core::error::ToolError;
use kestrel_core::tool::{ToolOutcome, TypedTool};
use serde::Deserialize;

/// Files larger than this are truncated in the output.
const MAX_BYTES: usize = 256 * 1024;

#[derive(Debug, Deserialize)]
pub struct FileReadArgs {
    pub path: String,
    /// First line to return (1-based)
    #[serde(default)]
    pub offset: Option<usize>,
    /// Maximum number of lines to return
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Default)]
pub struct FileReadTool;

#[async_trait]
impl TypedTool for FileReadTool {
    type Args = FileReadArgs;
    const NAME: &'static str = "file_read";
    const DESCRIPTION: &'static str =
        "Read the contents of a file. Use offset/limit to read a range of lines from large files.";
    const PARALLEL_SAFE: bool = true;

    fn schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The file path to read"
                },
                "offset": {
                    "type": "integer",
                    "description": "First line to return, starting at 1"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to return"
                }
            },
            "required": ["path"]
        })
    }

    async fn run(&self, args: FileReadArgs) -> Result<ToolOutcome, ToolError> {
        let content = match tokio::fs::read_to_string(&args.path).await {
            Ok(content) => content,
            Err(e) => return Ok(ToolOutcome::failure(format!("Failed to read file: {e}"))),
        };

        let selected = if args.offset.is_some() || args.limit.is_some() {
            let start = args.offset.unwrap_or(1).max(1) - 1;
            let limit = args.limit.unwrap_or(usize::MAX);
            content
                .lines()
                .skip(start)
                .take(limit)
                .collect::<Vec<_>>()
                .join("\n")
        } else {
            content
        };

        Ok(ToolOutcome::success(truncate(selected)))
    }
}

fn truncate(mut text: String) -> String {
    if text.len() <= MAX_BYTES {
        return text;
    }
    let mut cut = MAX_BYTES;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let total = text.len();
    text.truncate(cut);
    text.push_str(&format!("\n[truncated: showing {cut} of {total} bytes]"));
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::tool::{Tool, Typed};
    use std::io::Write;

    #[test]
    fn tool_definition() {
        let tool = Typed(FileReadTool);
        assert_eq!(tool.name(), "file_read");
        assert!(tool.parallel_safe());
        assert!(!tool.needs_approval());
        let schema = tool.parameters_schema();
        assert!(schema["properties"]["path"].is_object());
    }

    #[tokio::test]
    async fn read_existing_file() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        write!(tmp, "hello from kestrel").unwrap();

        let tool = Typed(FileReadTool);
        let result = tool
            .execute(serde_json::json!({"path": tmp.path().to_str().unwrap()}))
            .await
            .unwrap();
        assert!(result.ok);
        assert_eq!(result.message, "hello from kestrel");
    }

    #[tokio::test]
    async fn read_line_range() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        write!(tmp, "one\ntwo\nthree\nfour").unwrap();

        let result = FileReadTool
            .run(FileReadArgs {
                path: tmp.path().to_string_lossy().into_owned(),
                offset: Some(2),
                limit: Some(2),
            })
            .await
            .unwrap();
        assert_eq!(result.message, "two\nthree");
    }

    #[tokio::test]
    async fn read_nonexistent_file() {
        let result = FileReadTool
            .run(FileReadArgs {
                path: "/tmp/kestrel_nonexistent_test_file_12345.txt".into(),
                offset: None,
                limit: None,
            })
            .await
            .unwrap();
        assert!(!result.ok);
        assert!(result.message.contains("Failed to read"));
    }

    #[tokio::test]
    async fn missing_path_is_invalid_arguments() {
        let tool = Typed(FileReadTool);
        let err = tool.execute(serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let text = "é".repeat(MAX_BYTES);
        let out = truncate(text);
        assert!(out.contains("[truncated"));
    }
}
