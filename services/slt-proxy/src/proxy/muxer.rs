//! Connection demultiplexing by SNI hostname.
//!
//! The [`Muxer`] owns the bound TCP listener. Every accepted connection is
//! sniffed on its own task under a deadline and then handed to the
//! [`VirtualListener`] registered for its hostname. Connections that cannot be
//! routed are closed without writing anything and reported as [`MuxError`]s
//! on a channel drained through [`MuxErrors`].

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};

use super::replay::ReplayStream;
use super::sni::{read_server_name, SniError};

/// Default deadline for reading the ClientHello.
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_secs(10);

/// Back-off after a transient accept failure.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Longest routable hostname (RFC 1035 presentation form, no trailing dot).
pub const MAX_HOSTNAME_LEN: usize = 253;

/// A connection whose ClientHello has been read and is queued for replay.
#[derive(Debug)]
pub struct SniffedConn {
    /// Client stream, in replay mode.
    pub stream: ReplayStream<TcpStream>,
    pub peer_addr: SocketAddr,
    /// Hostname as sent by the client.
    pub hostname: String,
}

/// Per-connection dispatch failures and listener shutdown.
#[derive(Debug, Error)]
pub enum MuxError {
    /// The client did not deliver a ClientHello within the deadline.
    #[error("timed out sniffing connection from {peer_addr}")]
    SniffTimeout { peer_addr: SocketAddr },

    /// The first record is not a parsable ClientHello.
    #[error("malformed ClientHello from {peer_addr}: {source}")]
    Unsniffable {
        peer_addr: SocketAddr,
        #[source]
        source: SniError,
    },

    /// Well-formed ClientHello without a server_name.
    #[error("ClientHello from {peer_addr} carries no server name")]
    NoServerName { peer_addr: SocketAddr },

    /// No virtual listener matches the requested hostname.
    #[error("no frontend for {hostname} (from {peer_addr})")]
    NotFound {
        peer_addr: SocketAddr,
        hostname: String,
    },

    /// The bound listener failed permanently; no more connections are accepted.
    #[error("listener failed: {0}")]
    ListenerFatal(#[source] io::Error),
}

impl MuxError {
    /// Stable classification code for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            MuxError::SniffTimeout { .. } => "sniff_timeout",
            MuxError::Unsniffable { .. } => "unsniffable",
            MuxError::NoServerName { .. } => "unsniffable",
            MuxError::NotFound { .. } => "unrouted",
            MuxError::ListenerFatal(_) => "listener_fatal",
        }
    }
}

/// Errors registering a virtual listener.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegisterError {
    #[error("a listener for '{0}' is already registered")]
    Duplicate(String),

    #[error("invalid listener name '{0}'")]
    InvalidName(String),
}

/// Errors accepting from the bound listener.
#[derive(Debug, Error)]
pub enum AcceptError {
    /// Temporary condition; the accept loop should retry.
    #[error("transient accept error: {0}")]
    Transient(#[source] io::Error),

    /// Unrecoverable socket error.
    #[error("accept failed: {0}")]
    Fatal(#[source] io::Error),
}

impl AcceptError {
    /// Classify an OS accept error.
    pub fn from_io(e: io::Error) -> Self {
        if is_transient_accept_error(&e) {
            AcceptError::Transient(e)
        } else {
            AcceptError::Fatal(e)
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, AcceptError::Transient(_))
    }
}

/// Errors worth retrying: the failure belongs to one pending connection or to
/// a momentary resource shortage, not to the listening socket.
fn is_transient_accept_error(e: &io::Error) -> bool {
    use io::ErrorKind::*;
    if matches!(
        e.kind(),
        ConnectionAborted | ConnectionReset | ConnectionRefused | Interrupted | WouldBlock | TimedOut
    ) {
        return true;
    }
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM | libc::EPROTO)
    )
}

/// Normalize a hostname for matching: lowercase, trailing dot trimmed.
pub fn normalize_hostname(hostname: &str) -> String {
    hostname.trim().to_lowercase().trim_end_matches('.').to_string()
}

type ConnSender = mpsc::UnboundedSender<SniffedConn>;

/// Hostname → virtual listener queue.
#[derive(Default)]
struct Registry {
    listeners: RwLock<HashMap<String, ConnSender>>,
}

impl Registry {
    fn insert(&self, name: String, tx: ConnSender) -> Result<(), RegisterError> {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        if listeners.contains_key(&name) {
            return Err(RegisterError::Duplicate(name));
        }
        listeners.insert(name, tx);
        Ok(())
    }

    fn remove(&self, name: &str) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }

    /// Find the queue for `hostname`: exact name first, then wildcards from
    /// the most to the least specific (`*.b.example.com`, `*.example.com`, ...).
    ///
    /// Names longer than [`MAX_HOSTNAME_LEN`] never match.
    fn lookup(&self, hostname: &str) -> Option<ConnSender> {
        if hostname.len() > MAX_HOSTNAME_LEN {
            return None;
        }

        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = listeners.get(hostname) {
            return Some(tx.clone());
        }

        let mut pattern = String::with_capacity(hostname.len() + 1);
        for (dot, _) in hostname.match_indices('.') {
            pattern.clear();
            pattern.push_str("*.");
            pattern.push_str(&hostname[dot + 1..]);
            if let Some(tx) = listeners.get(&pattern) {
                return Some(tx.clone());
            }
        }
        None
    }
}

/// Demultiplexes one TCP listener into per-hostname virtual listeners.
pub struct Muxer {
    listener: TcpListener,
    sniff_timeout: Duration,
    registry: Arc<Registry>,
    errors: mpsc::UnboundedSender<MuxError>,
}

/// Receiving side of the muxer's error channel.
pub struct MuxErrors {
    rx: mpsc::UnboundedReceiver<MuxError>,
}

impl MuxErrors {
    /// Wait for the next dispatch failure. Returns `None` once the muxer and
    /// every in-flight sniff task have finished.
    pub async fn next_error(&mut self) -> Option<MuxError> {
        self.rx.recv().await
    }
}

impl Muxer {
    /// Wrap a bound listener.
    pub fn new(listener: TcpListener, sniff_timeout: Duration) -> (Self, MuxErrors) {
        let (errors, rx) = mpsc::unbounded_channel();
        let muxer = Self {
            listener,
            sniff_timeout,
            registry: Arc::new(Registry::default()),
            errors,
        };
        (muxer, MuxErrors { rx })
    }

    /// Register a virtual listener for `name` (an exact hostname or a
    /// `*.`-prefixed wildcard).
    pub fn listen(&self, name: &str) -> Result<VirtualListener, RegisterError> {
        let name = normalize_hostname(name);
        if name.is_empty() || name == "*" {
            return Err(RegisterError::InvalidName(name));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.registry.insert(name.clone(), tx)?;
        debug!(name = %name, "Virtual listener registered");

        Ok(VirtualListener {
            name,
            rx,
            registry: Arc::downgrade(&self.registry),
        })
    }

    /// Accept connections until the listener fails permanently.
    ///
    /// Only ever returns with the fatal accept error.
    pub async fn run(self) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Muxer started");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer_addr = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
                    }

                    let registry = Arc::clone(&self.registry);
                    let errors = self.errors.clone();
                    let sniff_timeout = self.sniff_timeout;

                    tokio::spawn(
                        async move {
                            if let Err(e) =
                                dispatch(stream, peer_addr, sniff_timeout, &registry).await
                            {
                                let _ = errors.send(e);
                            }
                        }
                        .instrument(tracing::debug_span!("sniff", peer = %peer_addr)),
                    );
                }
                Err(e) => match AcceptError::from_io(e) {
                    AcceptError::Transient(e) => {
                        warn!(error = %e, "Transient accept error, retrying");
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                    AcceptError::Fatal(e) => {
                        error!(error = %e, "Accept failed, muxer stopping");
                        let err = io::Error::new(e.kind(), e.to_string());
                        let _ = self.errors.send(MuxError::ListenerFatal(e));
                        return Err(err);
                    }
                },
            }
        }
    }
}

/// Sniff one connection and hand it to its virtual listener.
async fn dispatch(
    stream: TcpStream,
    peer_addr: SocketAddr,
    sniff_timeout: Duration,
    registry: &Registry,
) -> Result<(), MuxError> {
    let mut stream = ReplayStream::new(stream);

    let hostname = match timeout(sniff_timeout, read_server_name(&mut stream)).await {
        Ok(Ok(Some(hostname))) => hostname,
        Ok(Ok(None)) => return Err(MuxError::NoServerName { peer_addr }),
        Ok(Err(source)) => return Err(MuxError::Unsniffable { peer_addr, source }),
        Err(_) => return Err(MuxError::SniffTimeout { peer_addr }),
    };
    stream.replay();

    let not_found = |hostname: String| MuxError::NotFound {
        peer_addr,
        hostname,
    };

    let Some(tx) = registry.lookup(&normalize_hostname(&hostname)) else {
        return Err(not_found(hostname));
    };

    debug!(hostname = %hostname, "Dispatching connection");
    tx.send(SniffedConn {
        stream,
        peer_addr,
        hostname,
    })
    // The listener was dropped between lookup and send.
    .map_err(|rejected| not_found(rejected.0.hostname))
}

/// A listener fed by the [`Muxer`] with connections for one hostname.
///
/// Dropping it unregisters the hostname.
pub struct VirtualListener {
    name: String,
    rx: mpsc::UnboundedReceiver<SniffedConn>,
    registry: Weak<Registry>,
}

impl VirtualListener {
    /// Wait for the next connection routed to this listener.
    ///
    /// Returns `None` once the muxer and all in-flight dispatches are gone.
    pub async fn accept(&mut self) -> Option<SniffedConn> {
        self.rx.recv().await
    }
}

impl Drop for VirtualListener {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.name);
        }
    }
}
