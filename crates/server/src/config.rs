use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;
use server_api::RequestLimits;

const SETTINGS_FILE: &str = "gametime.toml";
const ENV_PREFIX: &str = "GAMETIME__";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub request_timeout_secs: u64,
    pub max_conflict_retries: u32,
    pub heartbeat_secs: u64,
    pub log_filter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8080".into(),
            database_url: "sqlite://./data/gametime.db".into(),
            request_timeout_secs: 30,
            max_conflict_retries: 3,
            heartbeat_secs: 15,
            log_filter: "info".into(),
        }
    }
}

impl Settings {
    pub fn request_limits(&self) -> RequestLimits {
        RequestLimits {
            budget: Duration::from_secs(self.request_timeout_secs.max(1)),
            max_conflict_retries: self.max_conflict_retries,
            ..RequestLimits::default()
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }
}

/// Keys accepted in `gametime.toml`; anything missing keeps its default.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSettings {
    server_bind: Option<String>,
    database_url: Option<String>,
    request_timeout_secs: Option<u64>,
    max_conflict_retries: Option<u32>,
    heartbeat_secs: Option<u64>,
    log_filter: Option<String>,
}

pub fn load_settings() -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(SETTINGS_FILE) {
        apply_file(&mut settings, &raw)
            .with_context(|| format!("failed to parse {SETTINGS_FILE}"))?;
    }
    apply_env(&mut settings, |key| std::env::var(key).ok())?;

    Ok(settings)
}

fn apply_file(settings: &mut Settings, raw: &str) -> anyhow::Result<()> {
    let file: FileSettings = toml::from_str(raw)?;

    if let Some(v) = file.server_bind {
        settings.server_bind = v;
    }
    if let Some(v) = file.database_url {
        settings.database_url = v;
    }
    if let Some(v) = file.request_timeout_secs {
        settings.request_timeout_secs = v;
    }
    if let Some(v) = file.max_conflict_retries {
        settings.max_conflict_retries = v;
    }
    if let Some(v) = file.heartbeat_secs {
        settings.heartbeat_secs = v;
    }
    if let Some(v) = file.log_filter {
        settings.log_filter = v;
    }
    Ok(())
}

fn apply_env(
    settings: &mut Settings,
    lookup: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<()> {
    let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

    if let Some(v) = var("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Some(v) = lookup("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = var("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = var("REQUEST_TIMEOUT_SECS") {
        settings.request_timeout_secs = parse_env("REQUEST_TIMEOUT_SECS", &v)?;
    }
    if let Some(v) = var("MAX_CONFLICT_RETRIES") {
        settings.max_conflict_retries = parse_env("MAX_CONFLICT_RETRIES", &v)?;
    }
    if let Some(v) = var("HEARTBEAT_SECS") {
        settings.heartbeat_secs = parse_env("HEARTBEAT_SECS", &v)?;
    }
    if let Some(v) = var("LOG_FILTER") {
        settings.log_filter = v;
    }
    Ok(())
}

fn parse_env<T>(name: &str, value: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("{ENV_PREFIX}{name} has invalid value '{value}'"))
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:") || raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        return format!("sqlite://{}", path.replace('\\', "/"));
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(parent) = sqlite_path(database_url)
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
    else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    fs::create_dir_all(&parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    (!path.is_empty()).then(|| PathBuf::from(path))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
