//! `kestrel config`: configuration management commands.

use super::session;
use anyhow::Context;
use kestrel_config::AppConfig;
use std::path::{Path, PathBuf};

fn config_path(path: Option<&Path>) -> PathBuf {
    path.map(Path::to_path_buf)
        .unwrap_or_else(|| AppConfig::config_dir().join("config.toml"))
}

pub fn validate(path: Option<&Path>) -> anyhow::Result<()> {
    println!("Validating {}...", config_path(path).display());

    let config = match session::load_config(path) {
        Ok(config) => config,
        Err(e) => {
            println!("   Config error: {e:#}");
            return Err(e);
        }
    };
    println!("   Config parsed and validated");

    if !config.has_api_key() && !matches!(config.provider.as_str(), "ollama" | "custom") {
        println!("   Warning: no API key set (KESTREL_API_KEY, OPENAI_API_KEY or OPENROUTER_API_KEY)");
    }

    let l = &config.loop_settings;
    println!();
    println!("   Provider:     {}", config.provider);
    println!("   Model:        {}", config.model);
    println!(
        "   Context:      {} tokens, compress at {:.0}%",
        l.context_limit,
        l.compression_threshold * 100.0
    );
    println!("   Output:       cap {}, reserve {}, floor {}", l.output_cap, l.output_reserve, l.min_output_tokens);
    println!("   Max depth:    {}", l.max_depth);
    println!("   Nudges:       {}", if config.nudge.enabled { "on" } else { "off" });
    println!("   Transcript:   {}", if config.transcript.enabled { "on" } else { "off" });
    Ok(())
}

pub fn show(path: Option<&Path>) -> anyhow::Result<()> {
    let mut config = session::load_config(path)?;
    if config.api_key.is_some() {
        config.api_key = Some("***".into());
    }
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

pub fn init(path: Option<&Path>, force: bool) -> anyhow::Result<()> {
    let path = config_path(path);
    write_default(&path, force)?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn write_default(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    std::fs::write(path, AppConfig::default_toml())
        .with_context(|| format!("Failed to write {}", path.display()))
}

pub fn path(path: Option<&Path>) {
    println!("{}", config_path(path).display());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_writes_a_loadable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        write_default(&path, false).unwrap();
        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.loop_settings, AppConfig::default().loop_settings);

        assert!(write_default(&path, false).is_err());
        write_default(&path, true).unwrap();
    }

    #[test]
    fn explicit_path_wins() {
        let p = Path::new("/tmp/kestrel-test.toml");
        assert_eq!(config_path(Some(p)), p);
        assert!(config_path(None).ends_with("config.toml"));
    }
}
