//! SNI-routing TCP proxy.
//!
//! This module provides:
//! - ClientHello sniffing with byte-exact replay
//! - Demultiplexing of one listener into per-hostname virtual listeners
//! - Backend selection strategies
//! - Per-frontend accept loops with optional TLS termination
//! - Full-duplex connection splicing
//!
//! ## Architecture
//!
//! ```text
//! Client -> Muxer (sniff SNI) -> VirtualListener -> FrontendRunner -> Backend
//!                                                        |
//!                                         TLS termination (if configured)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let listener = TcpListener::bind("0.0.0.0:443").await?;
//! let (muxer, mut errors) = Muxer::new(listener, DEFAULT_SNIFF_TIMEOUT);
//!
//! let vl = muxer.listen("a.example.com")?;
//! tokio::spawn(FrontendRunner::new("a.example.com", &frontend, vl).run());
//! tokio::spawn(muxer.run());
//!
//! while let Some(err) = errors.next_error().await { /* log */ }
//! ```

mod backend;
mod frontend;
mod muxer;
mod replay;
mod sni;
mod splice;

pub use backend::{
    Backend, BackendStrategy, RandomChoice, RoundRobin, StrategyKind, DEFAULT_CONNECT_TIMEOUT,
};
pub use frontend::{FrontendRunner, FrontendStats};
pub use muxer::{
    normalize_hostname, AcceptError, MuxError, MuxErrors, Muxer, RegisterError, SniffedConn,
    VirtualListener, DEFAULT_SNIFF_TIMEOUT, MAX_HOSTNAME_LEN,
};
pub use replay::ReplayStream;
pub use sni::{parse_client_hello, read_server_name, SniError, MAX_RECORD_LEN};
pub use splice::{dial, proxy_connection, splice, HalfReport, ProxyError, SpliceReport};
