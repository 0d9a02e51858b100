//! Wiring shared by `chat` and `bridge`: config, provider, tools, loop.

use anyhow::Context;
use kestrel_agent::{
    InterruptSender, LoopController, ModelSummarizer, NudgeDetector, Transcript, interrupt,
};
use kestrel_config::{AppConfig, ToolsConfig};
use kestrel_core::approval::Approver;
use kestrel_core::event::EventBus;
use kestrel_core::tool::ToolRegistry;
use kestrel_telemetry::{ModelPricing, PricingTable, UsageTracker};
use kestrel_tools::{TodoList, default_registry};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_SYSTEM_PROMPT: &str = "\
You are Kestrel, a coding assistant working in the user's current directory.

Use your tools instead of guessing: list_dir to explore, file_read before \
editing, file_write to change files, shell to build and test. Keep a todo list \
with todo_write for anything that takes more than a couple of steps, and mark \
items done as you go.

Do the work rather than describing it. When you say you will look at \
something, call the tool in the same reply. Be concise; report what you \
changed and anything left undone.";

/// System prompt for a delegated task, which starts with no conversation.
pub const TASK_SYSTEM_PROMPT: &str = "\
You are Kestrel, working on a single delegated task in the user's current \
directory. You have no earlier conversation; everything you need is in the \
task description and the files around you.

Use your tools to do the work, then finish with a short report of what you \
found or changed. That report is all the caller will see.";

pub struct Session {
    pub controller: LoopController,
    pub interrupts: InterruptSender,
    pub transcript: Option<Arc<Transcript>>,
}

/// Load configuration from `path` or the default location. Any error here
/// is fatal for the command.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    };
    config.context("Failed to load config")
}

/// Fail early with setup instructions when a hosted provider has no key.
pub fn require_api_key(config: &AppConfig) -> anyhow::Result<()> {
    if config.has_api_key() || matches!(config.provider.as_str(), "ollama" | "custom") {
        return Ok(());
    }
    eprintln!();
    eprintln!("  ERROR: No API key configured!");
    eprintln!();
    eprintln!("  Set one of these environment variables:");
    eprintln!("    OPENROUTER_API_KEY=sk-or-v1-...   (provider = \"openrouter\")");
    eprintln!("    OPENAI_API_KEY=sk-...             (provider = \"openai\")");
    eprintln!("    KESTREL_API_KEY=...               (any provider)");
    eprintln!();
    eprintln!("  Or add it to your config file:");
    eprintln!("    {}", AppConfig::config_dir().join("config.toml").display());
    eprintln!();
    anyhow::bail!("No API key found. See above for setup instructions.")
}

pub fn build(config: &AppConfig, approver: Arc<dyn Approver>) -> anyhow::Result<Session> {
    let provider =
        kestrel_providers::build_from_config(config).context("Failed to create provider")?;

    let todos = Arc::new(TodoList::new());
    let mut registry = default_registry(
        config.tools.allowed_commands.clone(),
        Duration::from_secs(config.tools.shell_timeout_secs),
        todos.clone(),
    );
    apply_tool_overrides(&mut registry, &config.tools);

    let pricing = PricingTable::with_defaults();
    for (model, p) in &config.pricing {
        pricing.set(model.clone(), ModelPricing::new(p.input_per_m, p.output_per_m));
    }
    let usage = Arc::new(UsageTracker::new(config.model.clone(), pricing));

    let events = EventBus::default();
    let (interrupts, receiver) = interrupt::channel();
    let system_prompt = config
        .system_prompt
        .clone()
        .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());

    let summarizer = config.loop_settings.model_summary.then(|| {
        Arc::new(ModelSummarizer::new(
            provider.clone(),
            config.loop_settings.summary_max_tokens,
        ))
    });

    let mut controller = LoopController::new(
        &config.loop_settings,
        provider,
        Arc::new(registry),
        approver,
        receiver,
        events,
    )
    .context("Invalid loop settings")?
    .with_system_prompt(system_prompt)
    .with_reminder(todos)
    .with_nudges(NudgeDetector::from_config(&config.nudge))
    .with_usage_tracker(usage);
    if let Some(summarizer) = summarizer {
        controller = controller.with_summarizer(summarizer);
    }

    let transcript = if config.transcript.enabled {
        let session_id = uuid::Uuid::new_v4().to_string();
        let transcript = match &config.transcript.path {
            Some(path) => Transcript::open(path, &session_id),
            None => Transcript::in_dir(&AppConfig::transcript_dir(), &session_id),
        }
        .context("Failed to open transcript")?;
        let transcript = Arc::new(transcript);
        transcript.follow(controller.events());
        info!(path = %transcript.path().display(), "Recording transcript");
        controller = controller.with_transcript(transcript.clone());
        Some(transcript)
    } else {
        None
    };

    info!(
        provider = %config.provider,
        model = %config.model,
        context_limit = config.loop_settings.context_limit,
        "Session ready"
    );
    Ok(Session {
        controller,
        interrupts,
        transcript,
    })
}

fn apply_tool_overrides(registry: &mut ToolRegistry, tools: &ToolsConfig) {
    let lists: [(&[String], fn(&mut ToolRegistry, &str) -> bool); 4] = [
        (&tools.approval_required, |r, n| r.set_needs_approval(n, true)),
        (&tools.approval_exempt, |r, n| r.set_needs_approval(n, false)),
        (&tools.parallel_safe, |r, n| r.set_parallel_safe(n, true)),
        (&tools.sequential, |r, n| r.set_parallel_safe(n, false)),
    ];
    for (names, apply) in lists {
        for name in names {
            if !apply(registry, name) {
                warn!(tool = %name, "Tool override names an unknown tool");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::approval::AutoApprover;

    #[test]
    fn overrides_change_policy() {
        let mut registry = default_registry(vec![], Duration::from_secs(1), Arc::new(TodoList::new()));
        let tools = ToolsConfig {
            approval_required: vec!["file_read".into()],
            approval_exempt: vec!["file_write".into()],
            sequential: vec!["list_dir".into(), "missing".into()],
            ..ToolsConfig::default()
        };
        apply_tool_overrides(&mut registry, &tools);

        assert!(registry.policy("file_read").unwrap().needs_approval);
        assert!(!registry.policy("file_write").unwrap().needs_approval);
        assert!(!registry.policy("list_dir").unwrap().parallel_safe);
    }

    #[tokio::test]
    async fn builds_a_session_with_transcript() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.provider = "ollama".into();
        config.transcript.enabled = true;
        config.transcript.path = Some(dir.path().join("session.jsonl"));

        let session = build(&config, Arc::new(AutoApprover::accept_all())).unwrap();
        let transcript = session.transcript.unwrap();
        assert_eq!(transcript.path(), dir.path().join("session.jsonl"));
        assert!(session.controller.history().is_empty());
    }
}
