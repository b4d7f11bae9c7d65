//! Client configuration: endpoint, credentials, TLS policy and tuning knobs.
//!
//! Configuration comes from one of:
//! - environment variables (`ClientConfig::from_env`)
//! - a JSON resource description (`ClientConfig::from_file`)
//! - code, starting from `ClientConfig::default()`

use std::net::Ipv6Addr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PerfError;
use crate::stats::QueryMode;

/// Default management endpoint port.
pub const DEFAULT_PORT: u16 = 443;

/// Whether peer certificates are validated on the TLS connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsPolicy {
    #[default]
    Validate,
    /// Accept any certificate and host name. For lab endpoints with
    /// self-signed certificates.
    Bypass,
}

/// Username and secret used to open a session.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Host and port of a management endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Parses `host`, `host:port`, `[v6addr]:port` or a URL such as
    /// `https://vc.example.com:8443/sdk`. Scheme and path are ignored.
    pub fn parse(s: &str) -> Result<Self, PerfError> {
        let s = s.trim();
        let rest = match s.find("://") {
            Some(pos) => &s[pos + 3..],
            None => s,
        };
        let authority = rest.split('/').next().unwrap_or_default();
        if authority.is_empty() {
            return Err(PerfError::Config(format!("invalid endpoint '{}'", s)));
        }

        let (host, port) = if let Some(v6) = authority.strip_prefix('[') {
            let Some((host, tail)) = v6.split_once(']') else {
                return Err(PerfError::Config(format!("invalid endpoint '{}'", s)));
            };
            (host, tail.strip_prefix(':'))
        } else if authority.matches(':').count() > 1 {
            // Unbracketed IPv6 address: no port can be given.
            if authority.parse::<Ipv6Addr>().is_err() {
                return Err(PerfError::Config(format!(
                    "invalid endpoint '{}' (bracket IPv6 addresses: [addr]:port)",
                    s
                )));
            }
            (authority, None)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };

        if host.is_empty() {
            return Err(PerfError::Config(format!("invalid endpoint '{}'", s)));
        }

        let port = match port {
            Some(p) => p
                .parse::<u16>()
                .map_err(|e| PerfError::Config(format!("invalid port '{}': {}", p, e)))?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Retry tuning for remote calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per call, including the first one.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 200,
            backoff_cap_ms: 5_000,
        }
    }
}

/// Stats query tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub mode: QueryMode,
    /// Upper bound on how far back an incremental query may reach.
    pub max_window_secs: u64,
    /// Sampling interval requested from the endpoint.
    pub interval_secs: u32,
    /// Highest statistics level whose counters are queried (1..=4).
    pub max_level: u8,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            mode: QueryMode::Latest,
            max_window_secs: 3600,
            interval_secs: 20,
            max_level: 4,
        }
    }
}

/// Full client configuration.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub endpoint: String,
    #[serde(flatten)]
    pub credentials: Credentials,
    pub tls: TlsPolicy,
    pub timeout_ms: u64,
    pub retry: RetryConfig,
    pub query: QueryConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            credentials: Credentials::default(),
            tls: TlsPolicy::Validate,
            timeout_ms: 30_000,
            retry: RetryConfig::default(),
            query: QueryConfig::default(),
        }
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("endpoint", &self.endpoint)
            .field("credentials", &self.credentials)
            .field("tls", &self.tls)
            .field("timeout_ms", &self.timeout_ms)
            .field("retry", &self.retry)
            .field("query", &self.query)
            .finish()
    }
}

impl ClientConfig {
    /// Creates a configuration from environment variables:
    /// - PERFWATCH_ENDPOINT (required)
    /// - PERFWATCH_USER (default: $USER)
    /// - PERFWATCH_PASSWORD (default: empty)
    /// - PERFWATCH_INSECURE (default: false)
    /// - PERFWATCH_TIMEOUT_SECS (default: 30)
    pub fn from_env() -> Result<Self, PerfError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, PerfError> {
        let endpoint = lookup("PERFWATCH_ENDPOINT")
            .ok_or_else(|| PerfError::Config("PERFWATCH_ENDPOINT not set".to_string()))?;
        let username = lookup("PERFWATCH_USER")
            .or_else(|| lookup("USER"))
            .ok_or_else(|| PerfError::Config("PERFWATCH_USER or USER not set".to_string()))?;
        let password = lookup("PERFWATCH_PASSWORD").unwrap_or_default();

        let tls = match lookup("PERFWATCH_INSECURE").as_deref() {
            Some("1" | "true" | "yes") => TlsPolicy::Bypass,
            _ => TlsPolicy::Validate,
        };

        let mut config = Self {
            endpoint,
            credentials: Credentials::new(username, password),
            tls,
            ..Self::default()
        };

        if let Some(secs) = lookup("PERFWATCH_TIMEOUT_SECS") {
            let secs = secs.parse::<u64>().map_err(|e| {
                PerfError::Config(format!("invalid PERFWATCH_TIMEOUT_SECS '{}': {}", secs, e))
            })?;
            config.timeout_ms = secs.checked_mul(1000).ok_or_else(|| {
                PerfError::Config(format!("PERFWATCH_TIMEOUT_SECS {} is too large", secs))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a JSON resource description.
    pub fn from_file(path: &Path) -> Result<Self, PerfError> {
        let config = Self::load_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a JSON resource description without validating it, for
    /// callers that fill in missing fields before calling `validate`.
    pub fn load_file(path: &Path) -> Result<Self, PerfError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PerfError::Config(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&content)
            .map_err(|e| PerfError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Checks that the configuration can be used to open a session.
    pub fn validate(&self) -> Result<(), PerfError> {
        Endpoint::parse(&self.endpoint)?;
        if self.credentials.username.is_empty() {
            return Err(PerfError::Config("username is empty".to_string()));
        }
        if self.timeout_ms == 0 {
            return Err(PerfError::Config("timeout must be positive".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(PerfError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.backoff_base_ms > self.retry.backoff_cap_ms {
            return Err(PerfError::Config(format!(
                "retry.backoff_base_ms ({}) exceeds retry.backoff_cap_ms ({})",
                self.retry.backoff_base_ms, self.retry.backoff_cap_ms
            )));
        }
        if !(1..=4).contains(&self.query.max_level) {
            return Err(PerfError::Config(format!(
                "query.max_level must be 1..=4, got {}",
                self.query.max_level
            )));
        }
        if self.query.interval_secs == 0 {
            return Err(PerfError::Config(
                "query.interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
