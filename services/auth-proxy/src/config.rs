//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Tokens are never read from the TOML: `ACCESS_TOKEN` / `REFRESH_TOKEN`
//! env vars seed the credential store, everything else comes from login.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use common::Secret;
use serde::Deserialize;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    pub auth: AuthConfig,
    /// Default headers sent with every upstream request.
    #[serde(default)]
    pub headers: Vec<HeaderInjection>,
}

/// HTTP proxy settings
#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub upstream_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Session and refresh settings
#[derive(Debug, Deserialize)]
pub struct AuthConfig {
    pub login_url: String,
    /// Without it, expired tokens are reported instead of refreshed.
    #[serde(default)]
    pub refresh_url: Option<String>,
    #[serde(default = "default_expiry_status_code")]
    pub expiry_status_code: u16,
    #[serde(default = "default_refresh_timeout")]
    pub refresh_timeout_secs: u64,
    /// Token file. In-memory storage when absent.
    #[serde(default)]
    pub credentials_file: Option<PathBuf>,
    #[serde(skip)]
    pub seed: SeedTokens,
}

/// Tokens supplied through the environment at startup.
#[derive(Debug, Default)]
pub struct SeedTokens {
    pub access: Option<Secret<String>>,
    pub refresh: Option<Secret<String>>,
}

/// Header added to proxied requests
#[derive(Debug, Clone, Deserialize)]
pub struct HeaderInjection {
    pub name: String,
    pub value: String,
}

fn default_timeout() -> u64 {
    60
}

fn default_max_connections() -> usize {
    1000
}

fn default_expiry_status_code() -> u16 {
    401
}

fn default_refresh_timeout() -> u64 {
    30
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        config.auth.seed = SeedTokens {
            access: non_empty_env("ACCESS_TOKEN"),
            refresh: non_empty_env("REFRESH_TOKEN"),
        };

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        require_http_url("upstream_url", &self.proxy.upstream_url)?;
        require_http_url("login_url", &self.auth.login_url)?;
        if let Some(ref url) = self.auth.refresh_url {
            require_http_url("refresh_url", url)?;
        }

        if self.proxy.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }
        if self.proxy.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        if self.auth.refresh_timeout_secs == 0 {
            return Err(common::Error::Config(
                "refresh_timeout_secs must be greater than 0".into(),
            ));
        }
        if !(400..=599).contains(&self.auth.expiry_status_code) {
            return Err(common::Error::Config(format!(
                "expiry_status_code must be in 400..=599, got {}",
                self.auth.expiry_status_code
            )));
        }

        self.default_headers().map(|_| ())
    }

    /// Configured headers as a `HeaderMap`. Invalid names or values are
    /// configuration errors.
    pub fn default_headers(&self) -> common::Result<HeaderMap> {
        let mut map = HeaderMap::new();
        for header in &self.headers {
            let name = HeaderName::from_str(&header.name).map_err(|e| {
                common::Error::Config(format!("invalid header name {:?}: {e}", header.name))
            })?;
            if name == axum::http::header::AUTHORIZATION {
                return Err(common::Error::Config(
                    "authorization cannot be set as a default header".into(),
                ));
            }
            let value = HeaderValue::from_str(&header.value).map_err(|e| {
                common::Error::Config(format!("invalid value for header {}: {e}", header.name))
            })?;
            map.insert(name, value);
        }
        Ok(map)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy.timeout_secs)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.auth.refresh_timeout_secs)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("bearer-auth-proxy.toml")
    }
}

fn require_http_url(field: &str, url: &str) -> common::Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(common::Error::Config(format!(
            "{field} must start with http:// or https://, got: {url}"
        )))
    }
}

fn non_empty_env(key: &str) -> Option<Secret<String>> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
        .map(Secret::new)
}
