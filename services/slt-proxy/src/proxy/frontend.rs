//! Per-frontend accept loop.
//!
//! A [`FrontendRunner`] drains its [`VirtualListener`], picks a backend for
//! each connection, optionally terminates TLS and spawns the proxy session.
//! Backend selection happens on the accept loop itself, so the strategy is
//! only ever touched by one task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn, Instrument};

use super::backend::{Backend, BackendStrategy};
use super::muxer::{SniffedConn, VirtualListener};
use super::splice::proxy_connection;
use crate::config::Frontend;

/// Counters for one frontend.
#[derive(Debug, Default)]
pub struct FrontendStats {
    /// Connections handed to this frontend by the muxer.
    pub connections_accepted: AtomicU64,
    /// Proxy sessions currently running.
    pub connections_active: AtomicU64,
    /// TLS termination handshakes that failed.
    pub handshakes_failed: AtomicU64,
    /// Backend dials that failed or timed out.
    pub backend_failed: AtomicU64,
    /// Proxy sessions that ran to completion.
    pub sessions_completed: AtomicU64,
    /// Bytes proxied to backends.
    pub bytes_to_backend: AtomicU64,
    /// Bytes proxied from backends.
    pub bytes_from_backend: AtomicU64,
}

/// Accept loop for one frontend.
pub struct FrontendRunner {
    name: String,
    listener: VirtualListener,
    strategy: Box<dyn BackendStrategy>,
    acceptor: Option<TlsAcceptor>,
    stats: Arc<FrontendStats>,
}

impl FrontendRunner {
    /// Build the runtime state for `frontend`, fed by `listener`.
    pub fn new(name: impl Into<String>, frontend: &Frontend, listener: VirtualListener) -> Self {
        Self {
            name: name.into(),
            listener,
            strategy: frontend.strategy.build(frontend.backends.clone()),
            acceptor: frontend.tls.clone().map(TlsAcceptor::from),
            stats: Arc::new(FrontendStats::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> Arc<FrontendStats> {
        Arc::clone(&self.stats)
    }

    /// Serve connections until the virtual listener closes.
    ///
    /// The hand-off queue has no transient failure mode: it either yields a
    /// connection or is closed for good.
    pub async fn run(mut self) {
        info!(
            frontend = %self.name,
            terminates_tls = self.acceptor.is_some(),
            "Handling connections"
        );

        while let Some(conn) = self.listener.accept().await {
            self.stats
                .connections_accepted
                .fetch_add(1, Ordering::Relaxed);

            let backend = self.strategy.next_backend();
            let acceptor = self.acceptor.clone();
            let stats = Arc::clone(&self.stats);
            let span = tracing::info_span!(
                "connection",
                frontend = %self.name,
                peer = %conn.peer_addr,
                backend = %backend.addr,
            );

            debug!(parent: &span, sni = %conn.hostname, "Accepted connection");
            tokio::spawn(serve(conn, backend, acceptor, stats).instrument(span));
        }

        info!(frontend = %self.name, "Frontend stopped");
    }
}

/// Terminate TLS if configured, then proxy to `backend`.
async fn serve(
    conn: SniffedConn,
    backend: Backend,
    acceptor: Option<TlsAcceptor>,
    stats: Arc<FrontendStats>,
) {
    match acceptor {
        Some(acceptor) => match acceptor.accept(conn.stream).await {
            Ok(tls) => run_session(tls, &backend, &stats).await,
            Err(e) => {
                stats.handshakes_failed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "TLS handshake failed");
            }
        },
        None => run_session(conn.stream, &backend, &stats).await,
    }
}

async fn run_session<S>(client: S, backend: &Backend, stats: &FrontendStats)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stats.connections_active.fetch_add(1, Ordering::Relaxed);

    match proxy_connection(client, backend).await {
        Ok(report) => {
            let up = &report.client_to_backend;
            let down = &report.backend_to_client;
            stats.sessions_completed.fetch_add(1, Ordering::Relaxed);
            stats.bytes_to_backend.fetch_add(up.bytes, Ordering::Relaxed);
            stats
                .bytes_from_backend
                .fetch_add(down.bytes, Ordering::Relaxed);

            if report.has_error() {
                debug!(
                    backend_addr = %report.backend_addr,
                    bytes_to_backend = up.bytes,
                    bytes_from_backend = down.bytes,
                    upstream_error = ?up.error.as_ref().map(ToString::to_string),
                    downstream_error = ?down.error.as_ref().map(ToString::to_string),
                    "Connection closed with error"
                );
            } else {
                debug!(
                    backend_addr = %report.backend_addr,
                    bytes_to_backend = up.bytes,
                    bytes_from_backend = down.bytes,
                    "Connection closed"
                );
            }
        }
        Err(e) => {
            stats.backend_failed.fetch_add(1, Ordering::Relaxed);
            warn!(kind = e.kind(), error = %e, "Failed to dial backend");
        }
    }

    stats.connections_active.fetch_sub(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::backend::StrategyKind;
    use crate::proxy::muxer::Muxer;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const HELLO: &[u8] = &[
        0x16, 0x03, 0x01, 0x00, 0x3d, // record header
        0x01, 0x00, 0x00, 0x39, // ClientHello, 57 bytes
        0x03, 0x03, // version
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, // random
        0x00, // session id
        0x00, 0x02, 0x00, 0x2f, // cipher suites
        0x01, 0x00, // compression
        0x00, 0x0e, // extensions length
        0x00, 0x00, 0x00, 0x0a, // server_name, 10 bytes
        0x00, 0x08, 0x00, 0x00, 0x05, b'a', b'.', b'c', b'o', b'm',
    ];

    #[tokio::test]
    async fn test_runner_proxies_replayed_hello() {
        let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend_listener.local_addr().unwrap();

        let mux_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mux_addr = mux_listener.local_addr().unwrap();
        let (muxer, _errors) = Muxer::new(mux_listener, Duration::from_secs(5));

        let frontend = Frontend {
            backends: vec![Backend::new(backend_addr.to_string())],
            strategy: StrategyKind::RoundRobin,
            tls: None,
        };
        let runner = FrontendRunner::new("a.com", &frontend, muxer.listen("a.com").unwrap());
        let stats = runner.stats();
        tokio::spawn(runner.run());
        tokio::spawn(muxer.run());

        let mut client = TcpStream::connect(mux_addr).await.unwrap();
        client.write_all(HELLO).await.unwrap();
        client.write_all(b"payload").await.unwrap();

        let (mut upstream, _) = backend_listener.accept().await.unwrap();
        let mut received = vec![0u8; HELLO.len() + 7];
        upstream.read_exact(&mut received).await.unwrap();
        assert_eq!(&received[..HELLO.len()], HELLO);
        assert_eq!(&received[HELLO.len()..], b"payload");

        upstream.write_all(b"reply").await.unwrap();
        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"reply");

        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_runner_stops_when_muxer_is_gone() {
        let mux_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (muxer, _errors) = Muxer::new(mux_listener, Duration::from_secs(5));

        let frontend = Frontend {
            backends: vec![Backend::new("127.0.0.1:1")],
            strategy: StrategyKind::RoundRobin,
            tls: None,
        };
        let runner = FrontendRunner::new("a.com", &frontend, muxer.listen("a.com").unwrap());
        let stats = runner.stats();
        drop(muxer);

        tokio::time::timeout(Duration::from_secs(1), runner.run())
            .await
            .expect("runner kept waiting on a closed listener");
        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 0);
    }
}
