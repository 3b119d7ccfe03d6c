use std::{fs, path::Path};

use anyhow::Context;
use outbox::{ConflictStrategy, OutboxConfig};
use serde::Deserialize;
use tracing::warn;

pub const DEFAULT_SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub database_url: String,
    pub server_url: String,
    pub max_retries: u32,
    pub reconcile_window: u32,
    pub conflict_strategy: ConflictStrategy,
}

impl Default for Settings {
    fn default() -> Self {
        let outbox = OutboxConfig::default();
        Self {
            database_url: "sqlite://./data/outbox.db".into(),
            server_url: "http://127.0.0.1:8443".into(),
            max_retries: outbox.max_retries,
            reconcile_window: outbox.reconcile_window,
            conflict_strategy: outbox.conflict_strategy,
        }
    }
}

impl Settings {
    pub fn outbox_config(&self) -> OutboxConfig {
        OutboxConfig {
            max_retries: self.max_retries,
            reconcile_window: self.reconcile_window,
            conflict_strategy: self.conflict_strategy,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    database_url: Option<String>,
    server_url: Option<String>,
    max_retries: Option<u32>,
    reconcile_window: Option<u32>,
    conflict_strategy: Option<ConflictStrategy>,
}

/// Defaults, then `client.toml` in the working directory, then the
/// environment.
pub fn load_settings() -> Settings {
    let mut settings = Settings::default();
    if let Err(err) = apply_file(&mut settings, Path::new(DEFAULT_SETTINGS_FILE)) {
        warn!(error = %format!("{err:#}"), "ignoring unreadable settings file");
    }
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings
}

/// Like [`load_settings`] with an explicit file, which must exist.
pub fn load_settings_from(path: &Path) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read settings file '{}'", path.display()))?;
    merge_file(&mut settings, &raw)
        .with_context(|| format!("invalid settings file '{}'", path.display()))?;
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

fn apply_file(settings: &mut Settings, path: &Path) -> anyhow::Result<()> {
    let Ok(raw) = fs::read_to_string(path) else {
        return Ok(());
    };
    merge_file(settings, &raw)
}

fn merge_file(settings: &mut Settings, raw: &str) -> anyhow::Result<()> {
    let file_cfg: FileSettings = toml::from_str(raw)?;
    if let Some(v) = file_cfg.database_url {
        settings.database_url = v;
    }
    if let Some(v) = file_cfg.server_url {
        settings.server_url = v;
    }
    if let Some(v) = file_cfg.max_retries {
        settings.max_retries = v;
    }
    if let Some(v) = file_cfg.reconcile_window {
        settings.reconcile_window = v;
    }
    if let Some(v) = file_cfg.conflict_strategy {
        settings.conflict_strategy = v;
    }
    Ok(())
}

/// `APP__*` names win over the shorter `OUTBOX_*` aliases. Unparseable
/// values are logged and skipped.
pub fn apply_env_overrides(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("OUTBOX_DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = lookup("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Some(v) = lookup("OUTBOX_SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = lookup("APP__SERVER_URL") {
        settings.server_url = v;
    }

    if let Some(v) = lookup("APP__MAX_RETRIES") {
        match v.parse() {
            Ok(parsed) => settings.max_retries = parsed,
            Err(_) => warn!(value = %v, "ignoring invalid APP__MAX_RETRIES"),
        }
    }
    if let Some(v) = lookup("APP__RECONCILE_WINDOW") {
        match v.parse() {
            Ok(parsed) => settings.reconcile_window = parsed,
            Err(_) => warn!(value = %v, "ignoring invalid APP__RECONCILE_WINDOW"),
        }
    }
    if let Some(v) = lookup("APP__CONFLICT_STRATEGY") {
        match v.parse() {
            Ok(parsed) => settings.conflict_strategy = parsed,
            Err(err) => warn!(value = %v, error = %err, "ignoring invalid APP__CONFLICT_STRATEGY"),
        }
    }
}

pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
