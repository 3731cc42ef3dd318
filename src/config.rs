use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,
    /// Environment variable holding the key callers must present. Unset means no check.
    #[serde(default = "default_client_api_key_env")]
    pub client_api_key_env: String,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub tiers: TiersConfig,
    #[serde(default)]
    pub tokens: TokenLimits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure_api_version: Option<String>,
    /// Whether the backend accepts `image_url` content parts.
    #[serde(default = "default_true")]
    pub multimodal: bool,
    /// Optional separate endpoint for the small tier.
    #[serde(default)]
    pub small: SmallBackendConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmallBackendConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default = "default_small_api_key_env")]
    pub api_key_env: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TiersConfig {
    #[serde(default = "default_small_tier")]
    pub small: TierConfig,
    #[serde(default = "default_big_tier")]
    pub middle: TierConfig,
    #[serde(default = "default_big_tier")]
    pub large: TierConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierConfig {
    pub model: String,
    /// Extra body parameters sent with every request routed to this tier.
    #[serde(default)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenLimits {
    #[serde(default = "default_min_tokens")]
    pub min: u64,
    #[serde(default = "default_max_tokens")]
    pub max: u64,
}

/// A fully resolved backend endpoint, secrets included.
#[derive(Clone, PartialEq, Eq)]
pub struct BackendEndpoint {
    pub base_url: String,
    pub api_key: String,
    pub azure_api_version: Option<String>,
}

impl BackendEndpoint {
    /// Local backends often run with the key variable set but empty.
    pub fn has_api_key(&self) -> bool {
        !self.api_key.trim().is_empty()
    }
}

impl std::fmt::Debug for BackendEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendEndpoint")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("azure_api_version", &self.azure_api_version)
            .finish()
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8082
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_request_timeout() -> u64 {
    90
}

fn default_heartbeat() -> u64 {
    15
}

fn default_client_api_key_env() -> String {
    "ANTHROPIC_API_KEY".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_small_api_key_env() -> String {
    "SMALL_MODEL_API_KEY".to_string()
}

fn default_true() -> bool {
    true
}

fn default_small_tier() -> TierConfig {
    TierConfig {
        model: "gpt-4o-mini".to_string(),
        extra: Map::new(),
    }
}

fn default_big_tier() -> TierConfig {
    TierConfig {
        model: "gpt-4o".to_string(),
        extra: Map::new(),
    }
}

fn default_min_tokens() -> u64 {
    100
}

fn default_max_tokens() -> u64 {
    4096
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            request_timeout_secs: default_request_timeout(),
            heartbeat_secs: default_heartbeat(),
            client_api_key_env: default_client_api_key_env(),
            backend: BackendConfig::default(),
            tiers: TiersConfig::default(),
            tokens: TokenLimits::default(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            azure_api_version: None,
            multimodal: true,
            small: SmallBackendConfig::default(),
        }
    }
}

impl Default for SmallBackendConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key_env: default_small_api_key_env(),
        }
    }
}

impl Default for TiersConfig {
    fn default() -> Self {
        Self {
            small: default_small_tier(),
            middle: default_big_tier(),
            large: default_big_tier(),
        }
    }
}

impl Default for TokenLimits {
    fn default() -> Self {
        Self {
            min: default_min_tokens(),
            max: default_max_tokens(),
        }
    }
}

impl TokenLimits {
    pub fn clamp(&self, requested: u64) -> u64 {
        requested.clamp(self.min, self.max)
    }
}

impl GatewayConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Search standard locations for a config file, then apply environment overrides.
    /// Priority: CLI arg > CWD > XDG config > home dir > built-in defaults.
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<Self> {
        let mut config = match explicit_path {
            Some(path) => Self::load(path)?,
            None => match config_search_paths().into_iter().find(|p| p.exists()) {
                Some(candidate) => {
                    tracing::info!(path = %candidate.display(), "Loading config");
                    Self::load(&candidate)?
                }
                None => {
                    tracing::info!("No config file found, using defaults and environment");
                    Self::default()
                }
            },
        };

        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply the environment overrides. `lookup` is `std::env::var` outside of tests.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("OPENAI_BASE_URL") {
            self.backend.base_url = v;
        }
        if let Some(v) = get("SMALL_MODEL_BASE_URL") {
            self.backend.small.base_url = Some(v);
        }
        if let Some(v) = get("AZURE_API_VERSION") {
            self.backend.azure_api_version = Some(v);
        }
        if let Some(v) = get("HOST") {
            self.host = v;
        }
        if let Some(v) = get("PORT") {
            self.port = parse_env("PORT", &v)?;
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = get("MAX_TOKENS_LIMIT") {
            self.tokens.max = parse_env("MAX_TOKENS_LIMIT", &v)?;
        }
        if let Some(v) = get("MIN_TOKENS_LIMIT") {
            self.tokens.min = parse_env("MIN_TOKENS_LIMIT", &v)?;
        }
        if let Some(v) = get("REQUEST_TIMEOUT") {
            self.request_timeout_secs = parse_env("REQUEST_TIMEOUT", &v)?;
        }
        if let Some(v) = get("HEARTBEAT_INTERVAL") {
            self.heartbeat_secs = parse_env("HEARTBEAT_INTERVAL", &v)?;
        }

        if let Some(v) = get("BIG_MODEL") {
            self.tiers.large.model = v.clone();
            if get("MIDDLE_MODEL").is_none() {
                self.tiers.middle.model = v;
            }
        }
        if let Some(v) = get("MIDDLE_MODEL") {
            self.tiers.middle.model = v;
        }
        if let Some(v) = get("SMALL_MODEL") {
            self.tiers.small.model = v;
        }

        for (var, tier) in [
            ("BIG_MODEL_EXTRA_BODY", &mut self.tiers.large),
            ("MIDDLE_MODEL_EXTRA_BODY", &mut self.tiers.middle),
            ("SMALL_MODEL_EXTRA_BODY", &mut self.tiers.small),
        ] {
            if let Some(raw) = get(var) {
                match serde_json::from_str::<Value>(&raw) {
                    Ok(Value::Object(map)) => tier.extra = map,
                    _ => tracing::warn!(var, "Ignoring extra body that is not a JSON object"),
                }
            }
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.tokens.min > self.tokens.max {
            return Err(GatewayError::config(format!(
                "tokens.min ({}) is greater than tokens.max ({})",
                self.tokens.min, self.tokens.max
            )));
        }
        if self.heartbeat_secs == 0 {
            return Err(GatewayError::config("heartbeat_secs must be at least 1"));
        }
        for (name, tier) in [
            ("small", &self.tiers.small),
            ("middle", &self.tiers.middle),
            ("large", &self.tiers.large),
        ] {
            if tier.model.trim().is_empty() {
                return Err(GatewayError::config(format!("tiers.{name}.model is empty")));
            }
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    /// Resolve the main backend endpoint, reading the API key from the environment.
    pub fn backend_endpoint(&self) -> Result<BackendEndpoint> {
        let api_key = std::env::var(&self.backend.api_key_env).map_err(|_| {
            GatewayError::config(format!(
                "Environment variable '{}' not set. Set it with your backend API key.",
                self.backend.api_key_env
            ))
        })?;

        Ok(BackendEndpoint {
            base_url: self.backend.base_url.clone(),
            api_key,
            azure_api_version: self.backend.azure_api_version.clone(),
        })
    }

    /// The small-tier endpoint, or `None` when it is identical to the main one.
    pub fn small_backend_endpoint(&self) -> Result<Option<BackendEndpoint>> {
        let main = self.backend_endpoint()?;
        let small = BackendEndpoint {
            base_url: self
                .backend
                .small
                .base_url
                .clone()
                .unwrap_or_else(|| main.base_url.clone()),
            api_key: std::env::var(&self.backend.small.api_key_env)
                .ok()
                .filter(|k| !k.is_empty())
                .unwrap_or_else(|| main.api_key.clone()),
            azure_api_version: main.azure_api_version.clone(),
        };

        Ok((small != main).then_some(small))
    }

    /// The key callers must present, if validation is enabled.
    pub fn client_api_key(&self) -> Option<String> {
        std::env::var(&self.client_api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| GatewayError::config(format!("{name} has an invalid value: '{value}'")))
}

pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // CWD
    paths.push(PathBuf::from("claude-bridge.toml"));

    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        paths.push(PathBuf::from(xdg).join("claude-bridge").join("config.toml"));
    }

    if let Some(home) = home_dir() {
        paths.push(home.join(".config").join("claude-bridge").join("config.toml"));
        paths.push(home.join(".claude-bridge.toml"));
    }

    paths
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
