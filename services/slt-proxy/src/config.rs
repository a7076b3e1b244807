//! Proxy configuration.
//!
//! The YAML file is deserialized into raw serde structs and then validated
//! into an immutable [`Configuration`]. Example:
//!
//! ```yaml
//! bind_addr: ":443"
//! frontends:
//!   a.example.com:
//!     strategy: round-robin
//!     backends:
//!       - addr: 10.0.0.1:443
//!       - addr: 10.0.0.2:443
//!         connect_timeout: 2000
//!   secure.example.com:
//!     tls_crt: /etc/slt/secure.crt
//!     tls_key: /etc/slt/secure.key
//!     backends:
//!       - addr: 127.0.0.1:8080
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rustls::ServerConfig;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::proxy::{normalize_hostname, Backend, StrategyKind, DEFAULT_SNIFF_TIMEOUT};
use crate::tls::load_server_config;

/// Connect timeout applied when a backend sets none (or zero), in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Validated proxy configuration.
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Address the muxer binds (`host:port`).
    pub bind_addr: String,
    /// Deadline for reading a client's ClientHello.
    pub mux_timeout: Duration,
    /// Frontends keyed by normalized hostname (or `*.` wildcard).
    pub frontends: BTreeMap<String, Frontend>,
}

/// One routed hostname.
#[derive(Debug, Clone)]
pub struct Frontend {
    /// Backends in configuration order. Never empty.
    pub backends: Vec<Backend>,
    pub strategy: StrategyKind,
    /// Present when this frontend terminates TLS itself.
    pub tls: Option<Arc<ServerConfig>>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    bind_addr: String,
    #[serde(default)]
    mux_timeout_ms: u64,
    #[serde(default)]
    frontends: BTreeMap<String, RawFrontend>,
}

#[derive(Debug, Deserialize)]
struct RawFrontend {
    #[serde(default)]
    backends: Vec<RawBackend>,
    #[serde(default)]
    strategy: String,
    #[serde(default)]
    tls_crt: Option<PathBuf>,
    #[serde(default)]
    tls_key: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct RawBackend {
    #[serde(default)]
    addr: String,
    #[serde(default)]
    connect_timeout: u64,
}

impl Configuration {
    /// Read and validate a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents, path)
    }

    /// Validate configuration held in memory.
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        Self::parse(contents, Path::new("<inline>"))
    }

    fn parse(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_yaml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        raw.validate()
    }
}

impl RawConfig {
    fn validate(self) -> Result<Configuration, ConfigError> {
        let bind_addr = self.bind_addr.trim();
        if bind_addr.is_empty() {
            return Err(ConfigError::MissingBindAddr);
        }
        if self.frontends.is_empty() {
            return Err(ConfigError::NoFrontends);
        }

        let mut frontends = BTreeMap::new();
        for (name, raw) in self.frontends {
            let key = normalize_hostname(&name);
            if key.is_empty() || key == "*" {
                return Err(ConfigError::InvalidFrontendName(name));
            }
            let frontend = raw.validate(&name)?;
            if frontends.insert(key, frontend).is_some() {
                return Err(ConfigError::DuplicateFrontend(name));
            }
        }

        let mux_timeout = match self.mux_timeout_ms {
            0 => DEFAULT_SNIFF_TIMEOUT,
            ms => Duration::from_millis(ms),
        };

        Ok(Configuration {
            bind_addr: normalize_bind_addr(bind_addr),
            mux_timeout,
            frontends,
        })
    }
}

impl RawFrontend {
    fn validate(self, name: &str) -> Result<Frontend, ConfigError> {
        if self.backends.is_empty() {
            return Err(ConfigError::NoBackends(name.to_string()));
        }

        let backends = self
            .backends
            .into_iter()
            .map(|b| {
                let addr = b.addr.trim();
                if addr.is_empty() {
                    return Err(ConfigError::MissingBackendAddr(name.to_string()));
                }
                let timeout_ms = match b.connect_timeout {
                    0 => DEFAULT_CONNECT_TIMEOUT_MS,
                    ms => ms,
                };
                Ok(Backend::with_timeout(addr, Duration::from_millis(timeout_ms)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let strategy =
            StrategyKind::parse(&self.strategy).ok_or_else(|| ConfigError::UnknownStrategy {
                frontend: name.to_string(),
                strategy: self.strategy.clone(),
            })?;

        let tls_crt = self.tls_crt.filter(|p| !p.as_os_str().is_empty());
        let tls_key = self.tls_key.filter(|p| !p.as_os_str().is_empty());
        let tls = match (tls_crt, tls_key) {
            (None, None) => None,
            (Some(crt), Some(key)) => Some(load_server_config(&crt, &key).map_err(|source| {
                ConfigError::Tls {
                    frontend: name.to_string(),
                    source,
                }
            })?),
            _ => return Err(ConfigError::IncompleteTls(name.to_string())),
        };

        Ok(Frontend {
            backends,
            strategy,
            tls,
        })
    }
}

/// Expand a port-only address (`:443`) to all IPv4 interfaces.
fn normalize_bind_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}
