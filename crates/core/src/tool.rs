//! Tool trait: the abstraction over agent capabilities.
//!
//! Tools are what give the agent the ability to act: list directories,
//! read and write files, run shell commands, keep a todo list.
//!
//! Two ways to implement one:
//! - [`Tool`] takes raw JSON arguments and is fully dynamic.
//! - [`TypedTool`] declares an `Args` type; the registry deserializes into it
//!   before calling `run`, so the schema's shape and the executor's input are
//!   checked against each other at compile time.

use crate::error::ToolError;
use crate::provider::ToolDefinition;
use async_trait::async_trait;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use tracing::{debug, warn};

/// The result of a tool execution, as reported back to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutcome {
    /// Whether the tool did what was asked
    pub ok: bool,

    /// Output on success, reason on failure
    pub message: String,
}

impl ToolOutcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

/// Static per-tool execution policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPolicy {
    /// Operator must approve each call (unless remembered as always/never)
    pub needs_approval: bool,

    /// Safe to run concurrently with other parallel-safe calls
    pub parallel_safe: bool,
}

/// The core Tool trait.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "shell", "file_read").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the model).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Whether calls need operator approval by default.
    fn needs_approval(&self) -> bool {
        false
    }

    /// Whether calls may run concurrently with other parallel-safe calls.
    /// Anything with side effects should leave this `false`.
    fn parallel_safe(&self) -> bool {
        false
    }

    /// Execute the tool with the given arguments.
    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutcome, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the model.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// A tool with a typed argument struct.
#[async_trait]
pub trait TypedTool: Send + Sync + 'static {
    /// Deserialized form of the model's arguments.
    type Args: DeserializeOwned + Send + 'static;

    const NAME: &'static str;
    const DESCRIPTION: &'static str;
    const NEEDS_APPROVAL: bool = false;
    const PARALLEL_SAFE: bool = false;

    /// JSON Schema for `Args`.
    fn schema(&self) -> serde_json::Value;

    async fn run(&self, args: Self::Args) -> Result<ToolOutcome, ToolError>;
}

/// Adapter that exposes a [`TypedTool`] through the dynamic [`Tool`] trait.
pub struct Typed<T>(pub T);

#[async_trait]
impl<T: TypedTool> Tool for Typed<T> {
    fn name(&self) -> &str {
        T::NAME
    }

    fn description(&self) -> &str {
        T::DESCRIPTION
    }

    fn parameters_schema(&self) -> serde_json::Value {
        self.0.schema()
    }

    fn needs_approval(&self) -> bool {
        T::NEEDS_APPROVAL
    }

    fn parallel_safe(&self) -> bool {
        T::PARALLEL_SAFE
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutcome, ToolError> {
        let args: T::Args = serde_json::from_value(arguments)
            .map_err(|e| ToolError::InvalidArguments(format!("{}: {e}", T::NAME)))?;
        self.0.run(args).await
    }
}

struct Entry {
    tool: Box<dyn Tool>,
    policy: ToolPolicy,
}

/// A registry of available tools.
///
/// Keeps registration order so the tool list sent to the model is stable
/// from request to request.
pub struct ToolRegistry {
    order: Vec<String>,
    entries: HashMap<String, Entry>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            order: Vec::new(),
            entries: HashMap::new(),
        }
    }

    /// Register a tool. Replaces any existing tool with the same name,
    /// keeping its original position.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        let policy = ToolPolicy {
            needs_approval: tool.needs_approval(),
            parallel_safe: tool.parallel_safe(),
        };
        if self.entries.insert(name.clone(), Entry { tool, policy }).is_none() {
            self.order.push(name);
        }
    }

    /// Register a typed tool.
    pub fn register_typed<T: TypedTool>(&mut self, tool: T) {
        self.register(Box::new(Typed(tool)));
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.entries.get(name).map(|e| e.tool.as_ref())
    }

    /// Effective policy for a tool.
    pub fn policy(&self, name: &str) -> Option<ToolPolicy> {
        self.entries.get(name).map(|e| e.policy)
    }

    /// Override whether a tool needs approval. Returns `false` if unknown.
    pub fn set_needs_approval(&mut self, name: &str, needs_approval: bool) -> bool {
        match self.entries.get_mut(name) {
            Some(entry) => {
                entry.policy.needs_approval = needs_approval;
                true
            }
            None => false,
        }
    }

    /// Override whether a tool is parallel-safe. Returns `false` if unknown.
    pub fn set_parallel_safe(&mut self, name: &str, parallel_safe: bool) -> bool {
        match self.entries.get_mut(name) {
            Some(entry) => {
                entry.policy.parallel_safe = parallel_safe;
                true
            }
            None => false,
        }
    }

    /// Tool definitions in registration order (for sending to the model).
    pub fn schemas_for_request(&self) -> Vec<ToolDefinition> {
        self.order
            .iter()
            .filter_map(|name| self.entries.get(name))
            .map(|e| e.tool.to_definition())
            .collect()
    }

    /// Execute a tool by name.
    ///
    /// Never fails: unknown tools, executor errors, and panics inside the
    /// executor all come back as a failed [`ToolOutcome`].
    pub async fn execute(&self, name: &str, arguments: serde_json::Value) -> ToolOutcome {
        let Some(entry) = self.entries.get(name) else {
            warn!(tool = %name, "Unknown tool requested");
            return ToolOutcome::failure(ToolError::NotFound(name.to_string()).to_string());
        };

        debug!(tool = %name, "Executing tool");
        match AssertUnwindSafe(entry.tool.execute(arguments)).catch_unwind().await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!(tool = %name, error = %e, "Tool execution failed");
                ToolOutcome::failure(e.to_string())
            }
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                warn!(tool = %name, reason = %reason, "Tool panicked");
                ToolOutcome::failure(ToolError::Panicked(reason).to_string())
            }
        }
    }

    /// List all registered tool names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.order.iter().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A simple test tool for unit tests.
    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str { "echo" }
        fn description(&self) -> &str { "Echoes back the input" }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string" }
                },
                "required": ["text"]
            })
        }
        fn parallel_safe(&self) -> bool { true }
        async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutcome, ToolError> {
            let text = arguments["text"].as_str().unwrap_or("").to_string();
            Ok(ToolOutcome::success(text))
        }
    }

    struct PanickyTool;

    #[async_trait]
    impl Tool for PanickyTool {
        fn name(&self) -> &str { "panicky" }
        fn description(&self) -> &str { "Always panics" }
        fn parameters_schema(&self) -> serde_json::Value { serde_json::json!({"type": "object"}) }
        async fn execute(&self, _arguments: serde_json::Value) -> Result<ToolOutcome, ToolError> {
            panic!("boom");
        }
    }

    #[derive(Deserialize)]
    struct AddArgs {
        a: i64,
        b: i64,
    }

    struct AddTool;

    #[async_trait]
    impl TypedTool for AddTool {
        type Args = AddArgs;
        const NAME: &'static str = "add";
        const DESCRIPTION: &'static str = "Adds two integers";
        const NEEDS_APPROVAL: bool = true;

        fn schema(&self) -> serde_json::Value {
            serde_json::json!({
                "type": "object",
                "properties": { "a": {"type": "integer"}, "b": {"type": "integer"} },
                "required": ["a", "b"]
            })
        }

        async fn run(&self, args: AddArgs) -> Result<ToolOutcome, ToolError> {
            Ok(ToolOutcome::success((args.a + args.b).to_string()))
        }
    }

    #[test]
    fn registry_register_and_lookup() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(EchoTool));
        assert!(registry.get("echo").is_some());
        assert!(registry.get("nonexistent").is_none());
    }

    #[test]
    fn schemas_keep_registration_order() {
        let mut registry = ToolRegistry::new();
        registry.register_typed(AddTool);
        registry.register(Box::new(EchoTool));
        registry.register(Box::new(PanickyTool));
        // re-registering keeps the original slot
        registry.register_typed(AddTool);

        let names: Vec<String> = registry
            .schemas_for_request()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["add", "echo", "panicky"]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn policy_defaults_and_overrides() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(EchoTool));
        registry.register_typed(AddTool);

        let echo = registry.policy("echo").unwrap();
        assert!(echo.parallel_safe);
        assert!(!echo.needs_approval);

        let add = registry.policy("add").unwrap();
        assert!(add.needs_approval);
        assert!(!add.parallel_safe);

        assert!(registry.set_parallel_safe("echo", false));
        assert!(!registry.policy("echo").unwrap().parallel_safe);
        assert!(!registry.set_needs_approval("missing", true));
    }

    #[tokio::test]
    async fn registry_execute_tool() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(EchoTool));

        let result = registry
            .execute("echo", serde_json::json!({"text": "hello world"}))
            .await;
        assert!(result.ok);
        assert_eq!(result.message, "hello world");
    }

    #[tokio::test]
    async fn typed_tool_rejects_bad_arguments() {
        let mut registry = ToolRegistry::new();
        registry.register_typed(AddTool);

        let good = registry.execute("add", serde_json::json!({"a": 2, "b": 3})).await;
        assert_eq!(good, ToolOutcome::success("5"));

        let bad = registry.execute("add", serde_json::json!({"a": "two"})).await;
        assert!(!bad.ok);
        assert!(bad.message.contains("Invalid tool arguments"));
    }

    #[tokio::test]
    async fn registry_execute_missing_tool() {
        let registry = ToolRegistry::new();
        let result = registry.execute("nonexistent", serde_json::json!({})).await;
        assert!(!result.ok);
        assert!(result.message.contains("nonexistent"));
    }

    #[tokio::test]
    async fn panics_become_failures() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(PanickyTool));
        let result = registry.execute("panicky", serde_json::json!({})).await;
        assert!(!result.ok);
        assert!(result.message.contains("boom"));
    }
}
