//! Built-in tool implementations for Kestrel.
//!
//! Tools give the agent the ability to act on the workspace:
//! list directories, read and write files, run shell commands, and keep
//! a todo list that doubles as the per-batch reminder.

pub mod file_read;
pub mod file_write;
pub mod list_dir;
pub mod shell;
pub mod todo;

use kestrel_core::tool::ToolRegistry;
use std::sync::Arc;
use std::time::Duration;

pub use todo::{TodoList, TodoWriteTool};

/// Create a registry with all built-in tools.
///
/// `allowed_commands` restricts the shell tool to those base commands; an
/// empty list allows anything (every call still needs approval).
pub fn default_registry(
    allowed_commands: Vec<String>,
    shell_timeout: Duration,
    todos: Arc<TodoList>,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register_typed(list_dir::ListDirTool);
    registry.register_typed(file_read::FileReadTool);
    registry.register_typed(file_write::FileWriteTool);
    registry.register_typed(shell::ShellTool::new(allowed_commands, shell_timeout));
    registry.register_typed(todo::TodoWriteTool::new(todos));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_policies() {
        let registry = default_registry(vec![], Duration::from_secs(5), Arc::new(TodoList::new()));
        assert_eq!(
            registry.names(),
            vec!["list_dir", "file_read", "file_write", "shell", "todo_write"]
        );

        let read = registry.policy("file_read").unwrap();
        assert!(read.parallel_safe && !read.needs_approval);

        let shell = registry.policy("shell").unwrap();
        assert!(shell.needs_approval && !shell.parallel_safe);

        let todo = registry.policy("todo_write").unwrap();
        assert!(!todo.needs_approval && !todo.parallel_safe);
    }
}
