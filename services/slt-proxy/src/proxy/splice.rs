//! Backend dialing and full-duplex splicing.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::backend::Backend;

const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Failure to establish the upstream connection.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The backend refused or the address could not be resolved.
    #[error("failed to dial backend {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The backend did not accept within its connect timeout.
    #[error("timed out dialing backend {addr} after {timeout:?}")]
    DialTimeout { addr: String, timeout: Duration },
}

impl ProxyError {
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::Dial { .. } => "backend_dial_failed",
            ProxyError::DialTimeout { .. } => "backend_dial_timeout",
        }
    }
}

/// Outcome of one copy direction.
#[derive(Debug, Default)]
pub struct HalfReport {
    /// Bytes written to the destination.
    pub bytes: u64,
    /// Error that ended the copy, if it did not end by EOF or by the other
    /// direction closing.
    pub error: Option<io::Error>,
}

/// Outcome of a finished proxy session.
#[derive(Debug)]
pub struct SpliceReport {
    /// Backend the session was connected to.
    pub backend_addr: SocketAddr,
    pub client_to_backend: HalfReport,
    pub backend_to_client: HalfReport,
}

impl SpliceReport {
    /// Whether either direction ended in an I/O error.
    pub fn has_error(&self) -> bool {
        self.client_to_backend.error.is_some() || self.backend_to_client.error.is_some()
    }
}

/// Dial `backend` and splice `client` to it until both directions finish.
///
/// On dial failure the client connection is dropped (closed) before returning.
pub async fn proxy_connection<S>(client: S, backend: &Backend) -> Result<SpliceReport, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let upstream = dial(backend).await?;
    let backend_addr = upstream
        .peer_addr()
        .map_err(|source| ProxyError::Dial {
            addr: backend.addr.clone(),
            source,
        })?;

    debug!(
        backend_addr = %backend_addr,
        local_addr = ?upstream.local_addr().ok(),
        "Connected to backend"
    );

    let (client_to_backend, backend_to_client) = splice(client, upstream).await;

    Ok(SpliceReport {
        backend_addr,
        client_to_backend,
        backend_to_client,
    })
}

/// Connect to a backend within its connect timeout.
pub async fn dial(backend: &Backend) -> Result<TcpStream, ProxyError> {
    match timeout(backend.connect_timeout, TcpStream::connect(&backend.addr)).await {
        Ok(Ok(stream)) => {
            if let Err(e) = stream.set_nodelay(true) {
                warn!(error = %e, "Failed to set TCP_NODELAY on backend connection");
            }
            Ok(stream)
        }
        Ok(Err(source)) => Err(ProxyError::Dial {
            addr: backend.addr.clone(),
            source,
        }),
        Err(_) => Err(ProxyError::DialTimeout {
            addr: backend.addr.clone(),
            timeout: backend.connect_timeout,
        }),
    }
}

/// Copy bytes in both directions between `a` and `b`.
///
/// When either direction finishes, both write sides are shut down and the
/// other direction is told to stop, so neither side can outlive its peer.
/// Returns `(a_to_b, b_to_a)`.
pub async fn splice<A, B>(a: A, b: B) -> (HalfReport, HalfReport)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    let (closed_tx, closed_rx) = watch::channel(false);

    let a_to_b = copy_half(a_read, b_write, &closed_tx, closed_rx.clone());
    let b_to_a = copy_half(b_read, a_write, &closed_tx, closed_rx);

    tokio::join!(a_to_b, b_to_a)
}

async fn copy_half<R, W>(
    mut src: R,
    mut dst: W,
    closed_tx: &watch::Sender<bool>,
    mut closed_rx: watch::Receiver<bool>,
) -> HalfReport
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut report = HalfReport::default();
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];

    loop {
        let step = async {
            let n = src.read(&mut buf).await?;
            if n > 0 {
                dst.write_all(&buf[..n]).await?;
            }
            Ok::<usize, io::Error>(n)
        };

        tokio::select! {
            _ = closed_rx.wait_for(|closed| *closed) => break,
            result = step => match result {
                Ok(0) => break,
                Ok(n) => report.bytes += n as u64,
                Err(e) => {
                    report.error = Some(e);
                    break;
                }
            },
        }
    }

    closed_tx.send_replace(true);
    let _ = dst.shutdown().await;
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_splice_copies_both_directions() {
        let (client, mut client_peer) = duplex(1024);
        let (backend, mut backend_peer) = duplex(1024);

        let splice_task = tokio::spawn(async move { splice(client, backend).await });

        client_peer.write_all(b"hello backend").await.unwrap();
        let mut buf = [0u8; 13];
        backend_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello backend");

        backend_peer.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        client_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        // Closing one side tears down the whole session.
        drop(client_peer);
        let (up, down) = splice_task.await.unwrap();
        assert_eq!(up.bytes, 13);
        assert_eq!(down.bytes, 2);
        assert!(up.error.is_none());

        let mut rest = Vec::new();
        backend_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_splice_ends_when_backend_closes() {
        let (client, mut client_peer) = duplex(1024);
        let (backend, backend_peer) = duplex(1024);

        let splice_task = tokio::spawn(async move { splice(client, backend).await });
        drop(backend_peer);

        let (_, down) = splice_task.await.unwrap();
        assert_eq!(down.bytes, 0);

        let mut rest = Vec::new();
        client_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let backend = Backend::with_timeout(addr.to_string(), Duration::from_secs(1));
        let err = dial(&backend).await.unwrap_err();
        assert_eq!(err.kind(), "backend_dial_failed");
    }

    #[tokio::test]
    async fn test_proxy_connection_reports_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(b"pong!").await.unwrap();
        });

        let (client, mut client_peer) = duplex(1024);
        let task = tokio::spawn(async move {
            proxy_connection(client, &Backend::new(addr.to_string())).await
        });

        client_peer.write_all(b"ping").await.unwrap();
        let mut reply = Vec::new();
        client_peer.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"pong!");
        drop(client_peer);

        let report = task.await.unwrap().unwrap();
        assert_eq!(report.backend_addr, addr);
        assert_eq!(report.client_to_backend.bytes, 4);
        assert_eq!(report.backend_to_client.bytes, 5);
    }
}
