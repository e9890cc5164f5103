use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::router::{DEFAULT_MODEL, ProviderCredentials};
use super::{CacheConfig, LimitsConfig};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_UPGRADE_LIMIT: i64 = 1_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Environment lookups layered over an optional dotenv file. Values are
/// trimmed and blank values count as unset.
#[derive(Clone, Default)]
pub struct Env {
    pub dotenv: BTreeMap<String, String>,
    isolated: bool,
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<&str> = self.dotenv.keys().map(|key| key.as_str()).collect();
        f.debug_struct("Env")
            .field("dotenv_keys", &keys)
            .field("isolated", &self.isolated)
            .finish()
    }
}

impl Env {
    pub fn parse_dotenv(contents: &str) -> Self {
        Self {
            dotenv: parse_dotenv(contents),
            isolated: false,
        }
    }

    pub fn load_dotenv(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::parse_dotenv(&contents))
    }

    /// Only the given pairs are visible; the process environment is ignored.
    pub fn isolated<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            dotenv: pairs
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
            isolated: true,
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(value) = self.dotenv.get(key) {
            let value = value.trim();
            return (!value.is_empty()).then(|| value.to_string());
        }
        if self.isolated {
            return None;
        }
        std::env::var(key)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &'static str) -> Result<Option<T>, ConfigError> {
        let Some(raw) = self.get(key) else {
            return Ok(None);
        };
        raw.parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value: raw })
    }

    fn flag(&self, key: &'static str) -> Result<Option<bool>, ConfigError> {
        let Some(raw) = self.get(key) else {
            return Ok(None);
        };
        match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidValue { key, value: raw }),
        }
    }
}

/// Shared `.env` reader behind [`Env::parse_dotenv`] and [`Env::load_dotenv`].
/// Accepts `export` prefixes and single or double quotes; blank values and
/// comment lines are skipped.
pub fn parse_dotenv(contents: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::<String, String>::new();

    for raw_line in contents.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let line = line.strip_prefix("export ").unwrap_or(line).trim();
        let Some((raw_key, raw_value)) = line.split_once('=') else {
            continue;
        };
        let key = raw_key.trim();
        if key.is_empty() {
            continue;
        }

        let mut value = raw_value.trim().to_string();
        if let Some(stripped) = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
        {
            value = stripped.to_string();
        }

        if value.trim().is_empty() {
            continue;
        }

        out.insert(key.to_string(), value);
    }

    out
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub listen: String,
    pub openai_api_key: String,
    pub anthropic_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    pub anthropic_base_url: Option<String>,
    pub redis_url: Option<String>,
    pub database_url: Option<String>,
    pub pinecone_api_key: Option<String>,
    pub pinecone_host: Option<String>,
    pub default_model: String,
    pub limits: LimitsConfig,
    pub cache: CacheConfig,
    pub upstream_timeout_secs: u64,
    pub store_timeout_ms: u64,
    pub upgrade_limit: i64,
    pub admin_token: Option<String>,
    pub json_logs: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: listen_on_port(DEFAULT_PORT),
            openai_api_key: String::new(),
            anthropic_api_key: None,
            openai_base_url: None,
            anthropic_base_url: None,
            redis_url: None,
            database_url: None,
            pinecone_api_key: None,
            pinecone_host: None,
            default_model: DEFAULT_MODEL.to_string(),
            limits: LimitsConfig::default(),
            cache: CacheConfig::default(),
            upstream_timeout_secs: DEFAULT_UPSTREAM_TIMEOUT_SECS,
            store_timeout_ms: DEFAULT_STORE_TIMEOUT_MS,
            upgrade_limit: DEFAULT_UPGRADE_LIMIT,
            admin_token: None,
            json_logs: false,
        }
    }
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn redacted(value: &Option<String>) -> Option<&'static str> {
            value.as_ref().map(|_| "<redacted>")
        }

        f.debug_struct("GatewayConfig")
            .field("listen", &self.listen)
            .field("openai_api_key", &"<redacted>")
            .field("anthropic_api_key", &redacted(&self.anthropic_api_key))
            .field("openai_base_url", &self.openai_base_url)
            .field("anthropic_base_url", &self.anthropic_base_url)
            .field("redis_url", &redacted(&self.redis_url))
            .field("database_url", &redacted(&self.database_url))
            .field("pinecone_api_key", &redacted(&self.pinecone_api_key))
            .field("pinecone_host", &self.pinecone_host)
            .field("default_model", &self.default_model)
            .field("limits", &self.limits)
            .field("cache", &self.cache)
            .field("upstream_timeout_secs", &self.upstream_timeout_secs)
            .field("store_timeout_ms", &self.store_timeout_ms)
            .field("upgrade_limit", &self.upgrade_limit)
            .field("admin_token", &redacted(&self.admin_token))
            .field("json_logs", &self.json_logs)
            .finish()
    }
}

fn listen_on_port(port: u16) -> String {
    format!("0.0.0.0:{port}")
}

impl GatewayConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// File settings first, then the environment on top, then validation.
    pub fn load(path: Option<&Path>, env: &Env) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env(env)?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self, env: &Env) -> Result<(), ConfigError> {
        if let Some(value) = env.get("OPENAI_API_KEY") {
            self.openai_api_key = value;
        }
        set_opt(&mut self.anthropic_api_key, env.get("ANTHROPIC_API_KEY"));
        set_opt(&mut self.openai_base_url, env.get("OPENAI_BASE_URL"));
        set_opt(&mut self.anthropic_base_url, env.get("ANTHROPIC_BASE_URL"));
        set_opt(&mut self.redis_url, env.get("REDIS_URL"));
        set_opt(&mut self.database_url, env.get("DB_URL"));
        set_opt(&mut self.pinecone_api_key, env.get("PINECONE_API_KEY"));
        set_opt(&mut self.pinecone_host, env.get("PINECONE_HOST"));
        set_opt(&mut self.admin_token, env.get("NEXUS_ADMIN_TOKEN"));

        if let Some(port) = env.parse::<u16>("PORT")? {
            self.listen = listen_on_port(port);
        }
        if let Some(listen) = env.get("NEXUS_LISTEN") {
            self.listen = listen;
        }
        if let Some(model) = env.get("NEXUS_DEFAULT_MODEL") {
            self.default_model = model;
        }
        if let Some(rpm) = env.parse("NEXUS_RATE_LIMIT_PER_MINUTE")? {
            self.limits.requests_per_minute = rpm;
        }
        if let Some(threshold) = env.parse("NEXUS_SEMANTIC_THRESHOLD")? {
            self.cache.semantic_threshold = threshold;
        }
        if let Some(ttl) = env.parse("NEXUS_EXACT_CACHE_TTL_SECS")? {
            self.cache.exact_ttl_seconds = ttl;
        }
        if let Some(secs) = env.parse("NEXUS_UPSTREAM_TIMEOUT_SECS")? {
            self.upstream_timeout_secs = secs;
        }
        if let Some(ms) = env.parse("NEXUS_STORE_TIMEOUT_MS")? {
            self.store_timeout_ms = ms;
        }
        if let Some(limit) = env.parse("NEXUS_UPGRADE_LIMIT")? {
            self.upgrade_limit = limit;
        }
        if let Some(json_logs) = env.flag("NEXUS_JSON_LOGS")? {
            self.json_logs = json_logs;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.openai_api_key.trim().is_empty() {
            return Err(ConfigError::Missing("OPENAI_API_KEY"));
        }
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Invalid("listen address must not be empty".into()));
        }
        let threshold = self.cache.semantic_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::Invalid(format!(
                "semantic_threshold must be within [0, 1], got {threshold}"
            )));
        }
        if self.limits.requests_per_minute == 0 {
            return Err(ConfigError::Invalid(
                "requests_per_minute must be greater than zero".into(),
            ));
        }
        if self.cache.exact_enabled && self.cache.exact_ttl_seconds == 0 {
            return Err(ConfigError::Invalid(
                "exact_ttl_seconds must be greater than zero".into(),
            ));
        }
        if self.upstream_timeout_secs == 0 || self.store_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be greater than zero".into()));
        }
        if self.upgrade_limit <= 0 {
            return Err(ConfigError::Invalid(
                "upgrade_limit must be greater than zero".into(),
            ));
        }
        if self.pinecone_api_key.is_some() != self.pinecone_host.is_some() {
            return Err(ConfigError::Invalid(
                "PINECONE_API_KEY and PINECONE_HOST must be set together".into(),
            ));
        }
        Ok(())
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn exact_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.exact_ttl_seconds)
    }

    pub fn provider_credentials(&self) -> ProviderCredentials {
        ProviderCredentials {
            openai_api_key: self.openai_api_key.clone(),
            anthropic_api_key: self.anthropic_api_key.clone(),
            openai_base_url: self.openai_base_url.clone(),
            anthropic_base_url: self.anthropic_base_url.clone(),
        }
    }

    /// Semantic caching needs both a vector index and the embeddings API.
    pub fn semantic_cache_ready(&self) -> bool {
        self.cache.semantic_enabled && self.pinecone_api_key.is_some() && self.pinecone_host.is_some()
    }
}

fn set_opt(slot: &mut Option<String>, value: Option<String>) {
    if value.is_some() {
        *slot = value;
    }
}
