pub mod config;
pub mod error;
pub mod proxy;
pub mod server;
pub mod tls;

pub use config::{Configuration, Frontend};
pub use error::{ConfigError, TlsLoadError};
pub use proxy::{
    Backend, BackendStrategy, FrontendRunner, FrontendStats, MuxError, Muxer, ProxyError,
    ReplayStream, SniError, SpliceReport, StrategyKind, VirtualListener,
};
pub use server::Server;
