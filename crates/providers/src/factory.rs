//! Provider construction from configuration.

use crate::openai_compat::OpenAiCompatProvider;
use kestrel_config::AppConfig;
use kestrel_core::error::ProviderError;
use kestrel_core::provider::Provider;
use std::sync::Arc;

/// Build the configured provider.
///
/// Fails when a hosted provider has no API key; local ones (ollama, custom)
/// run without one.
pub fn build_from_config(config: &AppConfig) -> Result<Arc<dyn Provider>, ProviderError> {
    let needs_key = matches!(config.provider.as_str(), "openai" | "openrouter");
    let api_key = match (&config.api_key, needs_key) {
        (Some(key), _) => key.clone(),
        (None, false) => String::new(),
        (None, true) => {
            return Err(ProviderError::NotConfigured(format!(
                "no API key for '{}' (set KESTREL_API_KEY or OPENAI_API_KEY)",
                config.provider
            )));
        }
    };

    let base_url = config
        .api_url
        .clone()
        .or_else(|| default_base_url(&config.provider).map(String::from))
        .ok_or_else(|| {
            ProviderError::NotConfigured(format!("no api_url for provider '{}'", config.provider))
        })?;

    let provider = OpenAiCompatProvider::new(&config.provider, base_url, api_key, &config.model)
        .with_temperature(config.temperature);
    Ok(Arc::new(provider))
}

/// Get the default base URL for well-known providers.
fn default_base_url(provider_name: &str) -> Option<&'static str> {
    match provider_name {
        "openai" => Some("https://api.openai.com/v1"),
        "openrouter" => Some("https://openrouter.ai/api/v1"),
        "ollama" => Some("http://localhost:11434/v1"),
        _ => None,
    }
}
