use serde::Deserialize;
use std::{env, path::Path, path::PathBuf};
use thiserror::Error;

use crate::gmail::oauth::DEFAULT_SCOPES;
use crate::responder::SendMode;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    pub app: AppConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    pub model: ModelConfig,
    #[serde(default)]
    pub gmail: GmailConfig,
    #[serde(default)]
    pub responder: ResponderConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AppConfig {
    pub service_name: String,
    pub env: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 17900 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TelemetryConfig {
    pub otlp_endpoint: Option<String>,
    #[serde(default)]
    pub export_traces: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ModelConfig {
    pub provider: String,
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct GmailConfig {
    #[serde(default = "default_credentials_file")]
    pub credentials_file: PathBuf,
    #[serde(default = "default_token_file")]
    pub token_file: PathBuf,
    #[serde(default = "default_user_id")]
    pub user_id: String,
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
}

impl Default for GmailConfig {
    fn default() -> Self {
        Self {
            credentials_file: default_credentials_file(),
            token_file: default_token_file(),
            user_id: default_user_id(),
            fetch_concurrency: default_fetch_concurrency(),
            scopes: default_scopes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ResponderConfig {
    #[serde(default)]
    pub send_mode: SendMode,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub query: Option<String>,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            send_mode: SendMode::default(),
            poll_interval_secs: default_poll_interval(),
            query: None,
        }
    }
}

fn default_credentials_file() -> PathBuf {
    PathBuf::from("credentials.json")
}

fn default_token_file() -> PathBuf {
    PathBuf::from("token.json")
}

fn default_user_id() -> String {
    "me".to_string()
}

fn default_fetch_concurrency() -> usize {
    12
}

fn default_scopes() -> Vec<String> {
    DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect()
}

fn default_poll_interval() -> u64 {
    10
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    ConfigBuild(config::ConfigError),
    #[error("failed to parse configuration: {0}")]
    Deserialize(config::ConfigError),
    #[error("missing required environment variable {0}")]
    MissingEnvVar(String),
    #[error("invalid APP_PORT override: {0}")]
    InvalidPort(std::num::ParseIntError),
    #[error("invalid MIRAMAIL_SEND_MODE override: {0}")]
    InvalidSendMode(String),
    #[error("fetch_concurrency must be at least 1")]
    InvalidConcurrency,
}

impl Config {
    /// Load configuration from the provided path, apply environment overrides, and
    /// resolve any `env:` indirections.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()
            .map_err(ConfigError::ConfigBuild)?;

        let mut cfg: Config = raw.try_deserialize().map_err(ConfigError::Deserialize)?;
        cfg.apply_env_overrides()?;
        cfg.resolve_env_markers()?;
        cfg.expand_paths();
        if cfg.gmail.fetch_concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency);
        }
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(port) = env::var("APP_PORT") {
            let port: u16 = port.parse().map_err(ConfigError::InvalidPort)?;
            self.server.port = port;
        }

        if let Ok(otlp) = env::var("OTLP_ENDPOINT") {
            self.telemetry.otlp_endpoint = Some(otlp);
        }

        if let Ok(model) = env::var("MODEL") {
            self.model.model = model;
        }

        if let Ok(mode) = env::var("MIRAMAIL_SEND_MODE") {
            self.responder.send_mode = mode
                .parse()
                .map_err(|_| ConfigError::InvalidSendMode(mode.clone()))?;
        }

        Ok(())
    }

    fn resolve_env_markers(&mut self) -> Result<(), ConfigError> {
        apply_env_marker(&mut self.app.service_name)?;
        apply_env_marker(&mut self.app.env)?;
        apply_env_marker(&mut self.model.provider)?;
        apply_env_marker(&mut self.model.model)?;
        apply_env_marker(&mut self.gmail.user_id)?;
        apply_env_marker_path(&mut self.gmail.credentials_file)?;
        apply_env_marker_path(&mut self.gmail.token_file)?;
        if let Some(query) = &mut self.responder.query {
            apply_env_marker(query)?;
        }
        if let Some(endpoint) = &mut self.telemetry.otlp_endpoint {
            apply_env_marker(endpoint)?;
        }
        Ok(())
    }

    fn expand_paths(&mut self) {
        expand_tilde(&mut self.gmail.credentials_file);
        expand_tilde(&mut self.gmail.token_file);
    }
}

fn expand_tilde(path: &mut PathBuf) {
    let raw = path.to_string_lossy().to_string();
    let expanded = shellexpand::tilde(&raw);
    *path = PathBuf::from(expanded.as_ref());
}

fn apply_env_marker(value: &mut String) -> Result<(), ConfigError> {
    if let Some(rest) = value.strip_prefix("env:") {
        let resolved = env::var(rest).map_err(|_| ConfigError::MissingEnvVar(rest.to_string()))?;
        *value = resolved;
    }
    Ok(())
}

fn apply_env_marker_path(path: &mut PathBuf) -> Result<(), ConfigError> {
    let mut value = path.to_string_lossy().to_string();
    apply_env_marker(&mut value)?;
    *path = PathBuf::from(value);
    Ok(())
}
