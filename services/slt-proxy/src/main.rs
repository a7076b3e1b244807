//! slt
//!
//! TLS reverse proxy routing by SNI.
//!
//! This binary:
//! - Loads and validates the YAML configuration
//! - Binds one listening port and sniffs each ClientHello for its hostname
//! - Hands connections to the matching frontend without decrypting them
//! - Terminates TLS only for frontends that carry their own certificate
//! - Splices each connection to a backend chosen by the frontend's strategy

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use slt_proxy::{Configuration, Server};

/// SNI-routing TLS reverse proxy.
#[derive(Debug, Parser)]
#[command(name = "slt", version, about)]
struct Cli {
    /// Path to the YAML configuration file.
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, env = "SLT_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // --help and --version are not failures.
            let code = if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
            let _ = e.print();
            return code;
        }
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| cli.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = match Configuration::from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(reason = e.reason_code(), error = %e, "Invalid configuration");
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        config = %cli.config.display(),
        bind_addr = %config.bind_addr,
        frontend_count = config.frontends.len(),
        "Configuration loaded"
    );

    let server = match Server::bind(&config).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Failed to start");
            return ExitCode::FAILURE;
        }
    };

    match server.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Server stopped");
            ExitCode::FAILURE
        }
    }
}
