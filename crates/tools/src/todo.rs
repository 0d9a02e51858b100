//! Todo tool: a session task list the model keeps up to date.
//!
//! The same [`TodoList`] is handed to the agent as a [`ReminderSource`], so
//! every tool batch ends with a short status block of open work.

use async_trait::async_trait;
use kestrel_core::error::ToolError;
use kestrel_core::reminder::ReminderSource;
use kestrel_core::tool::{ToolOutcome, TypedTool};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: u32,
    pub task: String,
    pub completed: bool,
}

/// Shared, in-memory task list.
#[derive(Debug, Default)]
pub struct TodoList {
    items: Mutex<Vec<TodoItem>>,
}

impl TodoList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, task: impl Into<String>) -> TodoItem {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        let id = items.iter().map(|t| t.id).max().unwrap_or(0) + 1;
        let item = TodoItem {
            id,
            task: task.into(),
            completed: false,
        };
        items.push(item.clone());
        item
    }

    /// Mark an item done. `None` if the id is unknown.
    pub fn complete(&self, id: u32) -> Option<TodoItem> {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        let item = items.iter_mut().find(|t| t.id == id)?;
        item.completed = true;
        Some(item.clone())
    }

    pub fn remove(&self, id: u32) -> Option<TodoItem> {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        let pos = items.iter().position(|t| t.id == id)?;
        Some(items.remove(pos))
    }

    pub fn items(&self) -> Vec<TodoItem> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn pending(&self) -> usize {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|t| !t.completed)
            .count()
    }

    fn render(&self) -> String {
        let items = self.items();
        if items.is_empty() {
            return "No tasks found. Use action='add' to create tasks.".into();
        }

        let (done, open): (Vec<_>, Vec<_>) = items.iter().partition(|t| t.completed);
        let mut out = String::from("TODO List:\n");
        if !open.is_empty() {
            out.push_str("\nPending:\n");
            for t in &open {
                out.push_str(&format!("  [{}] {}\n", t.id, t.task));
            }
        }
        if !done.is_empty() {
            out.push_str("\nCompleted:\n");
            for t in &done {
                out.push_str(&format!("  [{}] {}\n", t.id, t.task));
            }
        }
        out.push_str(&format!(
            "\nTotal: {} pending, {} completed",
            open.len(),
            done.len()
        ));
        out
    }
}

impl ReminderSource for TodoList {
    fn reminder(&self) -> Option<String> {
        Some(format!(
            "<reminder>\n## Current Todo Status\nready ({} pending tasks)\nRemember to check and update your todos using tool todo_write regularly to stay organized and productive.\n</reminder>",
            self.pending()
        ))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TodoAction {
    Add,
    #[default]
    List,
    Complete,
    Remove,
}

#[derive(Debug, Deserialize)]
pub struct TodoArgs {
    #[serde(default)]
    pub action: TodoAction,
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub task_id: Option<u32>,
}

pub struct TodoWriteTool {
    list: Arc<TodoList>,
}

impl TodoWriteTool {
    pub fn new(list: Arc<TodoList>) -> Self {
        Self { list }
    }
}

#[async_trait]
impl TypedTool for TodoWriteTool {
    type Args = TodoArgs;
    const NAME: &'static str = "todo_write";
    const DESCRIPTION: &'static str = "Structured task management for tracking work items. Actions: add (requires 'task'), list (default), complete (requires 'task_id'), remove (requires 'task_id').";

    fn schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "description": "Action to perform",
                    "enum": ["add", "list", "complete", "remove"],
                    "default": "list"
                },
                "task": {
                    "type": "string",
                    "description": "Task description (required for 'add')"
                },
                "task_id": {
                    "type": "integer",
                    "description": "Task ID (required for 'complete' and 'remove')"
                }
            },
            "required": []
        })
    }

    async fn run(&self, args: TodoArgs) -> Result<ToolOutcome, ToolError> {
        let outcome = match args.action {
            TodoAction::List => ToolOutcome::success(self.list.render()),
            TodoAction::Add => match args.task.filter(|t| !t.trim().is_empty()) {
                Some(task) => {
                    let item = self.list.add(task);
                    ToolOutcome::success(format!("Task added with ID {}: {}", item.id, item.task))
                }
                None => ToolOutcome::failure("task parameter required for 'add' action"),
            },
            TodoAction::Complete => match args.task_id {
                Some(id) => match self.list.complete(id) {
                    Some(item) => ToolOutcome::success(format!(
                        "Task {id} marked as complete: {}",
                        item.task
                    )),
                    None => ToolOutcome::failure(format!("Task {id} not found")),
                },
                None => ToolOutcome::failure("task_id parameter required for 'complete' action"),
            },
            TodoAction::Remove => match args.task_id {
                Some(id) => match self.list.remove(id) {
                    Some(item) => ToolOutcome::success(format!("Task {id} removed: {}", item.task)),
                    None => ToolOutcome::failure(format!("Task {id} not found")),
                },
                None => ToolOutcome::failure("task_id parameter required for 'remove' action"),
            },
        };
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::tool::{Tool, Typed};
    use serde_json::json;

    #[tokio::test]
    async fn add_complete_remove() {
        let list = Arc::new(TodoList::new());
        let tool = Typed(TodoWriteTool::new(list.clone()));

        let added = tool
            .execute(json!({"action": "add", "task": "write tests"}))
            .await
            .unwrap();
        assert!(added.ok);
        assert!(added.message.contains("ID 1"));
        tool.execute(json!({"action": "add", "task": "ship"})).await.unwrap();
        assert_eq!(list.pending(), 2);

        let done = tool
            .execute(json!({"action": "complete", "task_id": 1}))
            .await
            .unwrap();
        assert!(done.ok);
        assert_eq!(list.pending(), 1);

        let listed = tool.execute(json!({})).await.unwrap();
        assert!(listed.message.contains("[2] ship"));
        assert!(listed.message.contains("1 pending, 1 completed"));

        let removed = tool
            .execute(json!({"action": "remove", "task_id": 2}))
            .await
            .unwrap();
        assert!(removed.ok);
        assert_eq!(list.items().len(), 1);
    }

    #[tokio::test]
    async fn missing_parameters_fail_softly() {
        let tool = TodoWriteTool::new(Arc::new(TodoList::new()));
        let out = tool
            .run(TodoArgs {
                action: TodoAction::Complete,
                task: None,
                task_id: None,
            })
            .await
            .unwrap();
        assert!(!out.ok);

        let out = tool
            .run(TodoArgs {
                action: TodoAction::Remove,
                task: None,
                task_id: Some(9),
            })
            .await
            .unwrap();
        assert!(!out.ok);
        assert!(out.message.contains("not found"));
    }

    #[test]
    fn reminder_reports_pending_count() {
        let list = TodoList::new();
        list.add("a");
        list.add("b");
        list.complete(1);
        let text = list.reminder().unwrap();
        assert!(text.starts_with("<reminder>"));
        assert!(text.contains("ready (1 pending tasks)"));
        assert!(text.ends_with("</reminder>"));
    }

    #[test]
    fn unknown_action_is_rejected() {
        let parsed: Result<TodoArgs, _> = serde_json::from_value(json!({"action": "explode"}));
        assert!(parsed.is_err());
    }
}
