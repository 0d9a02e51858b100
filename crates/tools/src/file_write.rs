//! File write tool: create, overwrite, or append to files.

use async_trait::async_trait;
use kestrel_core::error::ToolError;
use kestrel_core::tool::{ToolOutcome, TypedTool};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Deserialize)]
pub struct FileWriteArgs {
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub append: bool,
}

#[derive(Default)]
pub struct FileWriteTool;

#[async_trait]
impl TypedTool for FileWriteTool {
    type Args = FileWriteArgs;
    const NAME: &'static str = "file_write";
    const DESCRIPTION: &'static str =
        "Write content to a file. Creates the file (and parent directories) if needed, overwrites unless append is set.";
    const NEEDS_APPROVAL: bool = true;

    fn schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The file path to write to"
                },
                "content": {
                    "type": "string",
                    "description": "The content to write"
                },
                "append": {
                    "type": "boolean",
                    "description": "Append instead of overwriting"
                }
            },
            "required": ["path", "content"]
        })
    }

    async fn run(&self, args: FileWriteArgs) -> Result<ToolOutcome, ToolError> {
        let path = std::path::Path::new(&args.path);

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            return Ok(ToolOutcome::failure(format!("Failed to create directory: {e}")));
        }

        let written = if args.append {
            append(path, args.content.as_bytes()).await
        } else {
            tokio::fs::write(path, &args.content).await
        };

        match written {
            Ok(()) => Ok(ToolOutcome::success(format!(
                "Successfully wrote {} bytes to {}",
                args.content.len(),
                args.path
            ))),
            Err(e) => Ok(ToolOutcome::failure(format!("Failed to write file: {e}"))),
        }
    }
}

async fn append(path: &std::path::Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::tool::{Tool, Typed};

    #[test]
    fn tool_policy() {
        let tool = Typed(FileWriteTool);
        assert_eq!(tool.name(), "file_write");
        assert!(tool.needs_approval());
        assert!(!tool.parallel_safe());
    }

    #[tokio::test]
    async fn write_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/out.txt");

        let result = FileWriteTool
            .run(FileWriteArgs {
                path: path.to_string_lossy().into_owned(),
                content: "hello".into(),
                append: false,
            })
            .await
            .unwrap();
        assert!(result.ok);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
    }

    #[tokio::test]
    async fn append_keeps_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");
        std::fs::write(&path, "a\n").unwrap();

        let tool = Typed(FileWriteTool);
        let result = tool
            .execute(serde_json::json!({
                "path": path.to_str().unwrap(),
                "content": "b\n",
                "append": true
            }))
            .await
            .unwrap();
        assert!(result.ok);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a\nb\n");
    }
}
