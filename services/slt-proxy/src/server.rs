//! Server composition: binds the listener, wires frontends to the muxer and
//! drains the muxer's error channel for the lifetime of the process.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Configuration;
use crate::proxy::{FrontendRunner, FrontendStats, MuxError, MuxErrors, Muxer};

/// A server whose listener is bound and whose frontends are registered.
pub struct Server {
    muxer: Muxer,
    errors: MuxErrors,
    runners: Vec<FrontendRunner>,
    local_addr: SocketAddr,
}

impl Server {
    /// Bind `config.bind_addr` and register one virtual listener per frontend.
    pub async fn bind(config: &Configuration) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .with_context(|| format!("failed to bind {}", config.bind_addr))?;
        let local_addr = listener.local_addr()?;
        info!(bind_addr = %local_addr, "Serving connections");

        let (muxer, errors) = Muxer::new(listener, config.mux_timeout);

        let mut runners = Vec::with_capacity(config.frontends.len());
        for (name, frontend) in &config.frontends {
            let listener = muxer
                .listen(name)
                .with_context(|| format!("failed to register frontend '{name}'"))?;
            info!(
                frontend = %name,
                strategy = %frontend.strategy,
                backend_count = frontend.backends.len(),
                terminates_tls = frontend.tls.is_some(),
                "Frontend registered"
            );
            runners.push(FrontendRunner::new(name.clone(), frontend, listener));
        }

        Ok(Self {
            muxer,
            errors,
            runners,
            local_addr,
        })
    }

    /// Address the muxer is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Per-frontend counters, keyed by frontend name.
    pub fn stats(&self) -> BTreeMap<String, Arc<FrontendStats>> {
        self.runners
            .iter()
            .map(|r| (r.name().to_string(), r.stats()))
            .collect()
    }

    /// Start all frontends and the muxer, then report dispatch failures until
    /// the muxer stops.
    pub async fn run(self) -> Result<()> {
        let Self {
            muxer,
            mut errors,
            runners,
            ..
        } = self;

        for runner in runners {
            let name = runner.name().to_string();
            tokio::spawn(async move {
                runner.run().await;
                debug!(frontend = %name, "Frontend loop ended");
            });
        }

        let muxer: JoinHandle<std::io::Result<()>> = tokio::spawn(muxer.run());

        while let Some(err) = errors.next_error().await {
            report(&err);
        }

        muxer
            .await
            .context("muxer task panicked")?
            .context("muxer stopped")
    }
}

/// Log a dispatch failure. Clients never see anything beyond a closed socket.
fn report(err: &MuxError) {
    match err {
        MuxError::ListenerFatal(e) => {
            error!(kind = err.kind(), error = %e, "Listener failed");
        }
        MuxError::NotFound {
            peer_addr,
            hostname,
        } => {
            info!(
                kind = err.kind(),
                peer_addr = %peer_addr,
                hostname = %hostname,
                "No frontend for hostname"
            );
        }
        MuxError::SniffTimeout { peer_addr } => {
            warn!(kind = err.kind(), peer_addr = %peer_addr, "Timed out sniffing connection");
        }
        MuxError::Unsniffable { peer_addr, source } => {
            debug!(
                kind = err.kind(),
                peer_addr = %peer_addr,
                error = %source,
                "Failed to sniff connection"
            );
        }
        MuxError::NoServerName { peer_addr } => {
            debug!(kind = err.kind(), peer_addr = %peer_addr, "ClientHello without server name");
        }
    }
}
