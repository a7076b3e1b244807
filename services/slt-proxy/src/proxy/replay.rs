//! Replay buffering for sniffed connections.
//!
//! SNI inspection has to read the ClientHello off the socket before we know
//! where the connection goes, but whoever ends up owning the connection (the
//! backend, or our own TLS acceptor) must still see the handshake from its
//! first byte. [`ReplayStream`] records everything read while peeking and
//! serves it again, in order, once peeking stops.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A stream wrapper that records bytes while peeking and replays them afterwards.
#[derive(Debug)]
pub struct ReplayStream<S> {
    inner: S,
    buffer: Vec<u8>,
    /// Read position into `buffer` while replaying.
    pos: usize,
    peeking: bool,
}

impl<S> ReplayStream<S> {
    /// Wrap `inner`, starting in peek mode.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            pos: 0,
            peeking: true,
        }
    }

    /// Leave peek mode. The next reads return the recorded bytes first, then
    /// fall through to the underlying stream.
    pub fn replay(&mut self) {
        self.peeking = false;
    }

    /// Whether the wrapper is still recording.
    pub fn is_peeking(&self) -> bool {
        self.peeking
    }

    /// Bytes recorded while peeking that have not been replayed yet.
    pub fn pending(&self) -> &[u8] {
        &self.buffer[self.pos..]
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ReplayStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        if this.peeking {
            let start = buf.filled().len();
            let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
            if let Poll::Ready(Ok(())) = poll {
                this.buffer.extend_from_slice(&buf.filled()[start..]);
            }
            return poll;
        }

        if this.pos < this.buffer.len() {
            let available = &this.buffer[this.pos..];
            let n = available.len().min(buf.remaining());
            buf.put_slice(&available[..n]);
            this.pos += n;

            if this.pos == this.buffer.len() {
                // Fully replayed; release the memory.
                this.buffer = Vec::new();
                this.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ReplayStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const DATA: &[u8] = b"the quick brown fox jumps over the lazy dog";

    async fn peek_then_read_all(peek_len: usize) -> Vec<u8> {
        let mut stream = ReplayStream::new(DATA);

        let mut peeked = vec![0u8; peek_len];
        stream.read_exact(&mut peeked).await.unwrap();
        assert_eq!(&peeked[..], &DATA[..peek_len]);

        stream.replay();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_replay_after_partial_peek() {
        assert_eq!(peek_then_read_all(9).await, DATA);
    }

    #[tokio::test]
    async fn test_replay_after_empty_peek() {
        assert_eq!(peek_then_read_all(0).await, DATA);
    }

    #[tokio::test]
    async fn test_replay_after_peeking_everything() {
        assert_eq!(peek_then_read_all(DATA.len()).await, DATA);
    }

    #[tokio::test]
    async fn test_replay_with_small_reads() {
        let mut stream = ReplayStream::new(DATA);
        let mut peeked = [0u8; 20];
        stream.read_exact(&mut peeked).await.unwrap();
        stream.replay();
        assert_eq!(stream.pending().len(), 20);

        let mut out = Vec::new();
        let mut chunk = [0u8; 3];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(out, DATA);
        assert!(stream.pending().is_empty());
    }

    #[tokio::test]
    async fn test_replay_preserves_chunked_source() {
        let mock = tokio_test::io::Builder::new()
            .read(b"\x16\x03")
            .read(b"\x01\x00")
            .read(b"tail")
            .build();
        let mut stream = ReplayStream::new(mock);

        let mut peeked = [0u8; 3];
        stream.read_exact(&mut peeked).await.unwrap();
        stream.replay();

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"\x16\x03\x01\x00tail");
    }

    #[tokio::test]
    async fn test_writes_pass_through_while_peeking() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut stream = ReplayStream::new(client);
        assert!(stream.is_peeking());

        stream.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }
}
