//! Startup error types.
//!
//! Everything here is fatal: the process reports it and exits before
//! serving. Per-connection failures live next to the code that produces them
//! (`proxy::muxer::MuxError`, `proxy::splice::ProxyError`).

use std::path::PathBuf;

use thiserror::Error;

/// Errors reading or validating the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("error parsing configuration file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("you must specify a bind_addr")]
    MissingBindAddr,

    #[error("you must specify at least one frontend")]
    NoFrontends,

    #[error("invalid frontend name '{0}'")]
    InvalidFrontendName(String),

    #[error("frontend '{0}' is defined more than once")]
    DuplicateFrontend(String),

    #[error("you must specify at least one backend for frontend '{0}'")]
    NoBackends(String),

    #[error("you must specify an addr for each backend on frontend '{0}'")]
    MissingBackendAddr(String),

    #[error("unknown strategy '{strategy}' for frontend '{frontend}'")]
    UnknownStrategy { frontend: String, strategy: String },

    #[error("frontend '{0}' must set both tls_crt and tls_key")]
    IncompleteTls(String),

    #[error("failed to load TLS configuration for frontend '{frontend}': {source}")]
    Tls {
        frontend: String,
        #[source]
        source: TlsLoadError,
    },
}

impl ConfigError {
    /// Stable reason code for logs.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ConfigError::Read { .. } => "config_read_failed",
            ConfigError::Parse { .. } => "config_parse_failed",
            ConfigError::Tls { .. } => "tls_load_failed",
            _ => "config_invalid",
        }
    }
}

/// Errors loading a certificate/key pair for TLS termination.
#[derive(Debug, Error)]
pub enum TlsLoadError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("invalid certificate/key pair: {0}")]
    Rustls(#[from] rustls::Error),
}
