//! Configuration parsing and validation for llmpool.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Root configuration structure.
///
/// `server` and `apis` have no defaults: a document missing either is not a
/// valid endpoint configuration and is rejected at parse time.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub apis: Vec<EndpointConfig>,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "0.0.0.0:3000")
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "0.0.0.0:3000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// API key wrapper that redacts in Debug/Display/Serialize and zeroizes on drop.
///
/// Only accessible via `.expose_secret()` so every use is grep-auditable.
#[derive(Clone)]
pub struct ApiKey(SecretString);

impl ApiKey {
    /// Access the raw key value.
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }

    pub fn is_empty(&self) -> bool {
        self.expose_secret().is_empty()
    }
}

impl Default for ApiKey {
    fn default() -> Self {
        ApiKey(SecretString::from(String::new()))
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Serialize for ApiKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("[REDACTED]")
    }
}

impl<'de> serde::Deserialize<'de> for ApiKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(|s| ApiKey(SecretString::from(s)))
    }
}

impl From<String> for ApiKey {
    fn from(s: String) -> Self {
        ApiKey(SecretString::from(s))
    }
}

impl From<&str> for ApiKey {
    fn from(s: &str) -> Self {
        ApiKey(SecretString::from(s))
    }
}

/// Sentinel for "no ceiling" on `rpm` / `rpd`.
pub const UNLIMITED: i64 = -1;

fn default_unlimited() -> i64 {
    UNLIMITED
}

fn default_true() -> bool {
    true
}

/// One upstream OpenAI-compatible provider.
///
/// Field names follow the `apis.json` layout (`baseUrl`, `apiKey`,
/// `modelMapping`); snake_case spellings are accepted as aliases. Required
/// strings default to empty so a malformed entry still loads and is skipped
/// by the registry's structural check instead of rejecting the whole file.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    /// Unique identifier, the key for health, rate and token state.
    #[serde(default)]
    pub id: String,
    /// Display name used in logs and status output.
    #[serde(default)]
    pub name: String,
    /// Base URL (e.g., "https://api.example.com" or "https://api.example.com/v1")
    #[serde(default, alias = "base_url")]
    pub base_url: String,
    /// Credential sent upstream as a bearer token.
    #[serde(default, alias = "api_key")]
    pub api_key: ApiKey,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Requests per minute ceiling, -1 for unlimited.
    #[serde(default = "default_unlimited")]
    pub rpm: i64,
    /// Requests per day ceiling, -1 for unlimited.
    #[serde(default = "default_unlimited")]
    pub rpd: i64,
    /// Models served under their own names.
    #[serde(default)]
    pub models: Vec<String>,
    /// Client-facing model name -> provider-specific model name.
    #[serde(default, alias = "model_mapping")]
    pub model_mapping: HashMap<String, String>,
}

impl EndpointConfig {
    /// Whether all fields needed to forward a request are present.
    pub fn is_structurally_valid(&self) -> bool {
        !self.id.is_empty()
            && !self.name.is_empty()
            && !self.base_url.is_empty()
            && !self.api_key.is_empty()
    }

    /// Whether this endpoint can serve `model`, directly or through a mapping.
    pub fn supports_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model) || self.model_mapping.contains_key(model)
    }

    /// Provider-specific name for `model`, if this endpoint remaps it.
    pub fn mapped_model(&self, model: &str) -> Option<&str> {
        self.model_mapping.get(model).map(String::as_str)
    }
}

/// Failover loop tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Maximum endpoints tried for one inbound request.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Fixed pause between attempts, in milliseconds.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Per-attempt upstream timeout, in seconds.
    #[serde(default = "default_upstream_timeout_secs")]
    pub upstream_timeout_secs: u64,
}

fn default_max_attempts() -> u32 {
    10
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_upstream_timeout_secs() -> u64 {
    60
}

impl DispatchConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            upstream_timeout_secs: default_upstream_timeout_secs(),
        }
    }
}

/// Token ledger persistence.
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    /// Path of the JSON snapshot file
    #[serde(default = "default_ledger_path")]
    pub path: String,
    /// Seconds between bucket pruning sweeps
    #[serde(default = "default_prune_interval_secs")]
    pub prune_interval_secs: u64,
}

fn default_ledger_path() -> String {
    "./data/token_stats.json".to_string()
}

fn default_prune_interval_secs() -> u64 {
    3600
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: default_ledger_path(),
            prune_interval_secs: default_prune_interval_secs(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a file.
    ///
    /// `.json` files are parsed as JSON, everything else as TOML. `${VAR}`
    /// references in endpoint keys and URLs are expanded from the environment.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        if is_json {
            Self::parse_json(&content)
        } else {
            Self::parse_str(&content)
        }
    }

    /// Parse configuration from a TOML string.
    pub fn parse_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.finish()
    }

    /// Parse configuration from a JSON string (the `apis.json` layout).
    pub fn parse_json(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(content).map_err(ConfigError::Json)?;
        config.finish()
    }

    fn finish(mut self) -> Result<Self, ConfigError> {
        self.expand_env()?;
        self.validate()?;
        Ok(self)
    }

    /// Expand `${VAR}` references in endpoint credentials and base URLs.
    fn expand_env(&mut self) -> Result<(), ConfigError> {
        for api in &mut self.apis {
            let label = if api.id.is_empty() { &api.name } else { &api.id };
            let key = api.api_key.expose_secret();
            if key.contains("${") {
                let expanded = expand_env_vars(key, label)?;
                api.api_key = ApiKey::from(expanded);
            }
            if api.base_url.contains("${") {
                api.base_url = expand_env_vars(&api.base_url, label)?;
            }
        }
        Ok(())
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.apis.is_empty() {
            tracing::warn!("No endpoints configured - proxy will reject all requests");
        }

        let mut seen = HashSet::new();
        for api in &self.apis {
            if api.id.is_empty() {
                continue;
            }
            if !seen.insert(api.id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate endpoint id '{}'",
                    api.id
                )));
            }
        }

        if self.dispatch.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "dispatch.max_attempts must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to parse JSON config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment variable '{var}' not set for endpoint '{endpoint}': {message}")]
    EnvVar {
        var: String,
        endpoint: String,
        message: String,
    },
}

/// Expand all `${VAR}` references in a string using a custom lookup function.
///
/// Supports multiple `${VAR}` in one string (e.g., `${SCHEME}://${HOST}/v1`).
/// Fails on first missing variable, unclosed `${`, or empty variable name.
fn expand_env_vars_with<F>(input: &str, endpoint: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if !input.contains("${") {
        return Ok(input.to_string());
    }

    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let end = after.find('}').ok_or_else(|| ConfigError::EnvVar {
            var: "<unclosed>".to_string(),
            endpoint: endpoint.to_string(),
            message: "Unclosed '${' in config value".to_string(),
        })?;

        let var_name = &after[..end];
        if var_name.is_empty() {
            return Err(ConfigError::EnvVar {
                var: "".to_string(),
                endpoint: endpoint.to_string(),
                message: "Empty variable name in '${}' reference".to_string(),
            });
        }

        let value = lookup(var_name).ok_or_else(|| ConfigError::EnvVar {
            var: var_name.to_string(),
            endpoint: endpoint.to_string(),
            message: format!("Environment variable '{}' is not set", var_name),
        })?;

        result.push_str(&value);
        rest = &after[end + 1..];
    }

    result.push_str(rest);
    Ok(result)
}

fn expand_env_vars(input: &str, endpoint: &str) -> Result<String, ConfigError> {
    expand_env_vars_with(input, endpoint, |name| std::env::var(name).ok())
}
