//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The upstream API key is loaded from GEMINI_API_KEY or api_key_file,
//! never stored in the TOML directly to avoid leaking secrets.

use common::Secret;
use quota::QuotaLimits;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use upstream::RetryPolicy;

const DEFAULT_CONFIG_FILE: &str = "gemini-relay.toml";

const DEFAULT_UPSTREAM_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/gemini-pro:generateContent";

/// Root configuration. Every table is optional.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// Inbound HTTP settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Generative-text API settings
#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_url")]
    pub url: String,
    /// Local deadline per upstream call. Unset means wait for the upstream.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(skip)]
    pub api_key: Option<Secret<String>>,
    /// Path to a file containing the API key (alternative to GEMINI_API_KEY)
    #[serde(default)]
    pub api_key_file: Option<PathBuf>,
    /// Instruction prepended to every prompt
    #[serde(default)]
    pub prompt_prefix: Option<String>,
}

/// Overload retry settings
#[derive(Debug, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

/// Local quota ceilings (defaults follow the Gemini free tier)
#[derive(Debug, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_rpm")]
    pub requests_per_minute: u64,
    #[serde(default = "default_tpm")]
    pub tokens_per_minute: u64,
    #[serde(default = "default_rpd")]
    pub requests_per_day: u64,
    #[serde(default = "default_tpd")]
    pub tokens_per_day: u64,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3000))
}

fn default_max_connections() -> usize {
    1000
}

fn default_upstream_url() -> String {
    DEFAULT_UPSTREAM_URL.to_string()
}

fn default_max_retries() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_rpm() -> u64 {
    15
}

fn default_tpm() -> u64 {
    1_000_000
}

fn default_rpd() -> u64 {
    1500
}

fn default_tpd() -> u64 {
    50_000_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            timeout_secs: None,
            api_key: None,
            api_key_file: None,
            prompt_prefix: None,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_rpm(),
            tokens_per_minute: default_tpm(),
            requests_per_day: default_rpd(),
            tokens_per_day: default_tpd(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.finish()
    }

    /// Built-in defaults with environment overlay, for deployments that
    /// configure only through the environment.
    pub fn from_env() -> common::Result<Self> {
        Config::default().finish()
    }

    /// Load from the resolved path, falling back to defaults when the path
    /// was not given explicitly and the default file does not exist.
    pub fn load_resolved(cli_path: Option<&str>) -> common::Result<(Self, Option<PathBuf>)> {
        let (path, explicit) = Self::resolve_path(cli_path);
        if !explicit && !path.exists() {
            return Ok((Self::from_env()?, None));
        }
        Ok((Self::load(&path)?, Some(path)))
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var. The
    /// flag reports whether the path was chosen explicitly.
    pub fn resolve_path(cli_path: Option<&str>) -> (PathBuf, bool) {
        if let Some(p) = cli_path {
            return (PathBuf::from(p), true);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return (PathBuf::from(p), true);
        }
        (PathBuf::from(DEFAULT_CONFIG_FILE), false)
    }

    fn finish(mut self) -> common::Result<Self> {
        self.apply_env()?;
        self.validate()?;
        Ok(self)
    }

    /// Overlay PORT and resolve the API key.
    ///
    /// API key resolution order:
    /// 1. GEMINI_API_KEY env var
    /// 2. api_key_file path from config
    fn apply_env(&mut self) -> common::Result<()> {
        if let Ok(port) = std::env::var("PORT") {
            let port: u16 = port.trim().parse().map_err(|e| {
                common::Error::Config(format!("PORT must be a valid port number, got {port:?}: {e}"))
            })?;
            self.server.listen_addr.set_port(port);
        }

        if let Ok(key) = std::env::var("GEMINI_API_KEY") {
            let key = key.trim().to_owned();
            if !key.is_empty() {
                self.upstream.api_key = Some(Secret::new(key));
                return Ok(());
            }
        }
        if let Some(ref key_file) = self.upstream.api_key_file {
            let key = std::fs::read_to_string(key_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read api_key_file {}: {e}",
                    key_file.display()
                ))
            })?;
            let key = key.trim().to_owned();
            if !key.is_empty() {
                self.upstream.api_key = Some(Secret::new(key));
            }
        }
        Ok(())
    }

    fn validate(&self) -> common::Result<()> {
        if !self.upstream.url.starts_with("http://") && !self.upstream.url.starts_with("https://") {
            return Err(common::Error::Config(format!(
                "upstream url must start with http:// or https://, got: {}",
                self.upstream.url
            )));
        }
        if self.upstream.timeout_secs == Some(0) {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        if self.retry.base_delay_ms == 0 {
            return Err(common::Error::Config(
                "base_delay_ms must be greater than 0".into(),
            ));
        }
        self.quota_limits()?;
        Ok(())
    }

    pub fn quota_limits(&self) -> common::Result<QuotaLimits> {
        QuotaLimits::new(
            self.limits.requests_per_minute,
            self.limits.tokens_per_minute,
            self.limits.requests_per_day,
            self.limits.tokens_per_day,
        )
        .map_err(|e| common::Error::Config(e.to_string()))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
        }
    }

    pub fn upstream_timeout(&self) -> Option<Duration> {
        self.upstream.timeout_secs.map(Duration::from_secs)
    }

    /// The API key, required before serving.
    pub fn api_key(&self) -> common::Result<Secret<String>> {
        self.upstream.api_key.clone().ok_or_else(|| {
            common::Error::MissingSecret(
                "set GEMINI_API_KEY or upstream.api_key_file".into(),
            )
        })
    }
}
