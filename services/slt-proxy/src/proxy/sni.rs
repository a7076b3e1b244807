//! SNI (Server Name Indication) extraction from TLS ClientHello.
//!
//! Reads exactly one TLS record off a stream and pulls the `host_name` entry
//! out of the ClientHello's `server_name` extension. Nothing past the end of
//! that record is consumed, so a [`ReplayStream`](super::ReplayStream) can
//! hand the complete handshake to whoever takes the connection next.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// TLS record content type for handshake messages.
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;

/// Handshake message type for ClientHello.
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;

/// Extension type of `server_name` (RFC 6066).
const EXTENSION_SERVER_NAME: u16 = 0x0000;

/// `NameType` value for a DNS host name.
const NAME_TYPE_HOST_NAME: u8 = 0x00;

/// Largest record payload a peer may send (2^14 bytes of plaintext).
pub const MAX_RECORD_LEN: usize = 16_384;

const RECORD_HEADER_LEN: usize = 5;

/// Reasons a stream could not be parsed as a ClientHello.
#[derive(Debug, Error)]
pub enum SniError {
    /// The first record is not a handshake record (plaintext, alerts, ...).
    #[error("not a TLS handshake record (content type {0:#04x})")]
    NotHandshake(u8),

    /// The handshake message is something other than a ClientHello.
    #[error("not a ClientHello (handshake type {0:#04x})")]
    NotClientHello(u8),

    /// Declared record length exceeds the TLS maximum.
    #[error("record length {0} exceeds maximum")]
    RecordTooLarge(usize),

    /// A length prefix points past the end of the available input.
    #[error("truncated {0}")]
    Truncated(&'static str),

    /// The host name is not valid UTF-8.
    #[error("server name is not valid UTF-8")]
    InvalidHostname,

    /// Reading the record from the stream failed (including early EOF).
    #[error("read error: {0}")]
    Io(#[from] std::io::Error),
}

/// Read one TLS record from `stream` and return the SNI host name it carries.
///
/// `Ok(None)` means a well-formed ClientHello without a host name.
pub async fn read_server_name<R>(stream: &mut R) -> Result<Option<String>, SniError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; RECORD_HEADER_LEN];
    stream.read_exact(&mut header).await?;

    if header[0] != CONTENT_TYPE_HANDSHAKE {
        return Err(SniError::NotHandshake(header[0]));
    }

    let record_len = u16::from_be_bytes([header[3], header[4]]) as usize;
    if record_len > MAX_RECORD_LEN {
        return Err(SniError::RecordTooLarge(record_len));
    }

    let mut record = vec![0u8; record_len];
    stream.read_exact(&mut record).await?;

    parse_client_hello(&record)
}

/// Parse the payload of a handshake record holding a ClientHello.
///
/// ClientHello layout after the 4-byte handshake header:
/// - 2 bytes: client version
/// - 32 bytes: random
/// - 1 byte length + session ID
/// - 2 byte length + cipher suites
/// - 1 byte length + compression methods
/// - optional: 2 byte length + extensions
pub fn parse_client_hello(record: &[u8]) -> Result<Option<String>, SniError> {
    let mut r = Reader::new(record);

    let msg_type = r.u8("handshake type")?;
    if msg_type != HANDSHAKE_CLIENT_HELLO {
        return Err(SniError::NotClientHello(msg_type));
    }
    let body_len = r.u24("handshake length")?;
    let mut hello = Reader::new(r.take(body_len, "handshake body")?);

    hello.take(2, "client version")?;
    hello.take(32, "random")?;
    let len = hello.u8("session id length")? as usize;
    hello.take(len, "session id")?;
    let len = hello.u16("cipher suites length")? as usize;
    hello.take(len, "cipher suites")?;
    let len = hello.u8("compression methods length")? as usize;
    hello.take(len, "compression methods")?;

    if hello.is_empty() {
        return Ok(None);
    }

    let len = hello.u16("extensions length")? as usize;
    let mut extensions = Reader::new(hello.take(len, "extensions")?);

    while !extensions.is_empty() {
        let ext_type = extensions.u16("extension type")?;
        let ext_len = extensions.u16("extension length")? as usize;
        let payload = extensions.take(ext_len, "extension payload")?;

        if ext_type == EXTENSION_SERVER_NAME {
            return parse_server_name_list(payload);
        }
    }

    Ok(None)
}

/// Parse a `ServerNameList` and return the first `host_name` entry.
fn parse_server_name_list(payload: &[u8]) -> Result<Option<String>, SniError> {
    let mut r = Reader::new(payload);
    let list_len = r.u16("server name list length")? as usize;
    let mut list = Reader::new(r.take(list_len, "server name list")?);

    while !list.is_empty() {
        let name_type = list.u8("server name type")?;
        let name_len = list.u16("server name length")? as usize;
        let name = list.take(name_len, "server name")?;

        if name_type == NAME_TYPE_HOST_NAME {
            return std::str::from_utf8(name)
                .map(|s| Some(s.to_string()))
                .map_err(|_| SniError::InvalidHostname);
        }
    }

    Ok(None)
}

/// Bounds-checked big-endian cursor over a byte slice.
struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], SniError> {
        if n > self.data.len() {
            return Err(SniError::Truncated(what));
        }
        let (head, rest) = self.data.split_at(n);
        self.data = rest;
        Ok(head)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, SniError> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, SniError> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self, what: &'static str) -> Result<usize, SniError> {
        let b = self.take(3, what)?;
        Ok(((b[0] as usize) << 16) | ((b[1] as usize) << 8) | (b[2] as usize))
    }
}
