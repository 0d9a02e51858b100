//! Configuration loading, validation, and management for Kestrel.
//!
//! Loads configuration from `~/.kestrel/config.toml` (or an explicit path)
//! with environment variable overrides. Validates all settings at startup;
//! an invalid configuration never reaches the loop.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.kestrel/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key for the model backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Backend flavour: openai, openrouter, ollama, or custom
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Base URL override (required for `custom`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    /// Model name sent with every request
    #[serde(default = "default_model")]
    pub model: String,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Optional system prompt prepended to every session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Loop controller limits and token budget
    #[serde(default, rename = "loop")]
    pub loop_settings: LoopSettings,

    /// Tool policy overrides
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Nudge heuristics
    #[serde(default)]
    pub nudge: NudgeConfig,

    /// JSONL transcript
    #[serde(default)]
    pub transcript: TranscriptConfig,

    /// Custom model pricing, keyed by model name
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub pricing: HashMap<String, PricingOverrideConfig>,
}

fn default_provider() -> String {
    "openai".into()
}
fn default_model() -> String {
    "gpt-4o".into()
}
fn default_temperature() -> f32 {
    0.2
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("provider", &self.provider)
            .field("api_url", &self.api_url)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("system_prompt", &self.system_prompt.as_ref().map(|p| p.len()))
            .field("loop_settings", &self.loop_settings)
            .field("tools", &self.tools)
            .field("nudge", &self.nudge)
            .field("transcript", &self.transcript)
            .field("pricing", &self.pricing)
            .finish()
    }
}

/// Limits and budget the loop controller is constructed with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopSettings {
    /// Model context window, in tokens
    #[serde(default = "default_context_limit")]
    pub context_limit: u32,

    /// Fraction of the context window that triggers compression
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: f64,

    /// Upper bound on output tokens per request
    #[serde(default = "default_output_cap")]
    pub output_cap: u32,

    /// Tokens held back from the output window as a safety margin
    #[serde(default = "default_output_reserve")]
    pub output_reserve: u32,

    /// Smallest output window worth sending a request for
    #[serde(default = "default_min_output_tokens")]
    pub min_output_tokens: u32,

    /// Maximum tool round-trips per user turn
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    /// Maximum corrective nudges per user turn
    #[serde(default = "default_max_nudges")]
    pub max_nudges: u32,

    /// Identical failing tool calls tolerated before surfacing to the user
    #[serde(default = "default_max_identical_failures")]
    pub max_identical_failures: u32,

    /// Most recent tool results kept verbatim by compression
    #[serde(default = "default_tool_result_retention")]
    pub tool_result_retention: usize,

    /// Most recent messages never collapsed by compression
    #[serde(default = "default_keep_recent_messages")]
    pub keep_recent_messages: usize,

    /// Length cap for the synthetic summary message
    #[serde(default = "default_summary_max_chars")]
    pub summary_max_chars: usize,

    /// Clear stale tool results every N appended results (0 = never)
    #[serde(default = "default_auto_clear_every")]
    pub auto_clear_every: usize,

    /// Ask the model to write compression summaries (falls back to a
    /// plain digest when the request fails)
    #[serde(default = "default_true")]
    pub model_summary: bool,

    /// Output cap for a model-written summary
    #[serde(default = "default_summary_max_tokens")]
    pub summary_max_tokens: u32,
}

fn default_context_limit() -> u32 {
    120_000
}
fn default_compression_threshold() -> f64 {
    0.8
}
fn default_output_cap() -> u32 {
    8_000
}
fn default_output_reserve() -> u32 {
    1_024
}
fn default_min_output_tokens() -> u32 {
    256
}
fn default_max_depth() -> u32 {
    50
}
fn default_max_nudges() -> u32 {
    2
}
fn default_max_identical_failures() -> u32 {
    3
}
fn default_tool_result_retention() -> usize {
    5
}
fn default_keep_recent_messages() -> usize {
    6
}
fn default_summary_max_chars() -> usize {
    2_000
}
fn default_auto_clear_every() -> usize {
    10
}
fn default_summary_max_tokens() -> u32 {
    500
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            context_limit: default_context_limit(),
            compression_threshold: default_compression_threshold(),
            output_cap: default_output_cap(),
            output_reserve: default_output_reserve(),
            min_output_tokens: default_min_output_tokens(),
            max_depth: default_max_depth(),
            max_nudges: default_max_nudges(),
            max_identical_failures: default_max_identical_failures(),
            tool_result_retention: default_tool_result_retention(),
            keep_recent_messages: default_keep_recent_messages(),
            summary_max_chars: default_summary_max_chars(),
            auto_clear_every: default_auto_clear_every(),
            model_summary: true,
            summary_max_tokens: default_summary_max_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Tools that always ask before running
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub approval_required: Vec<String>,

    /// Tools that never ask
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub approval_exempt: Vec<String>,

    /// Tools forced into the concurrent group
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parallel_safe: Vec<String>,

    /// Tools forced into the sequential group
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sequential: Vec<String>,

    /// Shell allowlist. Empty = allow all (every call still needs approval).
    #[serde(default)]
    pub allowed_commands: Vec<String>,

    /// Shell command timeout
    #[serde(default = "default_shell_timeout_secs")]
    pub shell_timeout_secs: u64,
}

fn default_shell_timeout_secs() -> u64 {
    120
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            approval_required: vec![],
            approval_exempt: vec![],
            parallel_safe: vec![],
            sequential: vec![],
            allowed_commands: vec![],
            shell_timeout_secs: default_shell_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NudgeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Keep the built-in rules in addition to `rules`
    #[serde(default = "default_true")]
    pub builtin_rules: bool,

    /// Extra rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<NudgeRuleConfig>,
}

fn default_true() -> bool {
    true
}

impl Default for NudgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            builtin_rules: true,
            rules: vec![],
        }
    }
}

/// One configurable "described but did not act" rule.
///
/// Fires when the assistant text contains any of `triggers` and, if
/// `requires_any` is non-empty, also one of those phrases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NudgeRuleConfig {
    pub triggers: Vec<String>,

    #[serde(default)]
    pub requires_any: Vec<String>,

    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscriptConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Output file; defaults to `~/.kestrel/transcripts/<session>.jsonl`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Custom pricing for a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingOverrideConfig {
    /// Price per 1M input tokens in USD
    pub input_per_m: f64,
    /// Price per 1M output tokens in USD
    pub output_per_m: f64,
}

impl AppConfig {
    /// Load configuration from the default path (~/.kestrel/config.toml).
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        Self::load_from(&config_path)
    }

    /// Load configuration from a specific file path, then apply environment
    /// overrides and validate.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::read_file(path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn read_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Apply environment variable overrides (highest priority).
    ///
    /// `lookup` is the environment; tests pass a map instead.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if self.api_key.is_none() {
            self.api_key = lookup("KESTREL_API_KEY")
                .or_else(|| lookup("OPENAI_API_KEY"))
                .or_else(|| lookup("OPENROUTER_API_KEY"));
        }
        if let Some(provider) = lookup("KESTREL_PROVIDER") {
            self.provider = provider;
        }
        if let Some(model) = lookup("KESTREL_MODEL") {
            self.model = model;
        }
        if let Some(url) = lookup("KESTREL_API_URL") {
            self.api_url = Some(url);
        }

        let settings = &mut self.loop_settings;
        if let Some(v) = parse_env(&lookup, "KESTREL_CONTEXT_LIMIT")? {
            settings.context_limit = v;
        }
        if let Some(v) = parse_env(&lookup, "KESTREL_MAX_OUTPUT_TOKENS")? {
            settings.output_cap = v;
        }
        if let Some(v) = parse_env(&lookup, "KESTREL_OUTPUT_RESERVE")? {
            settings.output_reserve = v;
        }
        if let Some(v) = parse_env(&lookup, "KESTREL_MAX_DEPTH")? {
            settings.max_depth = v;
        }
        if let Some(v) = parse_env(&lookup, "KESTREL_COMPRESSION_THRESHOLD")? {
            settings.compression_threshold = v;
        }
        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".kestrel")
    }

    /// Default directory for JSONL transcripts.
    pub fn transcript_dir() -> PathBuf {
        Self::config_dir().join("transcripts")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::ValidationError(
                "temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.model.trim().is_empty() {
            return Err(ConfigError::ValidationError("model must not be empty".into()));
        }

        match self.provider.as_str() {
            "openai" | "openrouter" | "ollama" => {}
            "custom" if self.api_url.is_some() => {}
            "custom" => {
                return Err(ConfigError::ValidationError(
                    "provider 'custom' requires api_url".into(),
                ));
            }
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "unknown provider '{other}' (expected openai, openrouter, ollama or custom)"
                )));
            }
        }

        self.loop_settings.validate()
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Generate a default config TOML string (for `config init`).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl LoopSettings {
    /// Reject values the loop controller cannot be constructed with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: &str| Err(ConfigError::ValidationError(msg.into()));

        if self.context_limit == 0 {
            return fail("loop.context_limit must be > 0");
        }
        if !(self.compression_threshold > 0.0 && self.compression_threshold <= 1.0) {
            return fail("loop.compression_threshold must be in (0, 1]");
        }
        if self.output_cap == 0 {
            return fail("loop.output_cap must be > 0");
        }
        if self.max_depth == 0 {
            return fail("loop.max_depth must be > 0");
        }
        if self.model_summary && self.summary_max_tokens == 0 {
            return fail("loop.summary_max_tokens must be > 0 when loop.model_summary is on");
        }
        if self.min_output_tokens > self.output_cap {
            return fail("loop.min_output_tokens must not exceed loop.output_cap");
        }
        if u64::from(self.output_reserve) + u64::from(self.min_output_tokens)
            >= u64::from(self.context_limit)
        {
            return fail("loop.output_reserve + loop.min_output_tokens must be below loop.context_limit");
        }
        if self.max_identical_failures == 0 {
            return fail("loop.max_identical_failures must be > 0");
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            provider: default_provider(),
            api_url: None,
            model: default_model(),
            temperature: default_temperature(),
            system_prompt: None,
            loop_settings: LoopSettings::default(),
            tools: ToolsConfig::default(),
            nudge: NudgeConfig::default(),
            transcript: TranscriptConfig::default(),
            pricing: HashMap::new(),
        }
    }
}

fn parse_env<F, T>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
            ConfigError::ValidationError(format!("environment variable {key}={raw:?} is not valid"))
        }),
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors. Any of these is fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
