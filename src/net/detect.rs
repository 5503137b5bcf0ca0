//! Protocol classification from the peeked head of a connection.
//!
//! Classification is a pure function of the first bytes of the stream and
//! never consumes them: HTTP is recognized from the request line, TLS from a
//! ClientHello record whose SNI extension names the target host.

use once_cell::sync::Lazy;
use regex::bytes::Regex;
use rustls::server::Acceptor;
use tokio::io::AsyncRead;

use crate::net::peek::{PeekableStream, PEEK_BUFFER_SIZE};

static HTTP_REQUEST_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\A[A-Z]+\s+\S+\s+HTTP/(1\.0|1\.1|2\.0)\r?\n").expect("static regex")
});

const RECORD_HEADER_LEN: usize = 5;
const RECORD_TYPE_HANDSHAKE: u8 = 0x16;

/// The HTTP protocol versions the L7 proxy can serve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    /// HTTP/1.0
    Http10,
    /// HTTP/1.1
    Http11,
    /// HTTP/2 cleartext (h2c)
    H2c,
}

impl std::fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpVersion::Http10 => write!(f, "1.0"),
            HttpVersion::Http11 => write!(f, "1.1"),
            HttpVersion::H2c => write!(f, "2.0"),
        }
    }
}

/// Peek at the connection and decide whether it carries HTTP.
///
/// Returns the recognized version, or `None` for anything that does not look
/// like an HTTP request line.
pub async fn http_version<S: AsyncRead + Unpin>(
    conn: &mut PeekableStream<S>,
) -> Option<HttpVersion> {
    // The head buffer fills with as much as is available on first peek, so
    // jump straight to the largest peek rather than growing iteratively.
    let head = conn.peek(PEEK_BUFFER_SIZE).await.ok()?;
    let captures = HTTP_REQUEST_LINE.captures(head)?;
    match captures.get(1)?.as_bytes() {
        b"1.0" => Some(HttpVersion::Http10),
        b"1.1" => Some(HttpVersion::Http11),
        b"2.0" => Some(HttpVersion::H2c),
        _ => None,
    }
}

/// Peek at the connection and, if it opens with a TLS ClientHello, extract
/// the SNI server name.
///
/// The record is run through a partial TLS accept purely to parse the hello;
/// the handshake is never completed.
pub async fn tls_server_name<S: AsyncRead + Unpin>(
    conn: &mut PeekableStream<S>,
) -> Option<String> {
    let header = conn.peek(RECORD_HEADER_LEN).await.ok()?;
    if header.len() < RECORD_HEADER_LEN || header[0] != RECORD_TYPE_HANDSHAKE {
        return None;
    }
    // Record length sits in bytes [3..5]; the version in [1..3] is irrelevant.
    let record_len = usize::from(u16::from_be_bytes([header[3], header[4]]));
    let hello = conn.peek(RECORD_HEADER_LEN + record_len).await.ok()?;
    sni_from_client_hello(hello)
}

fn sni_from_client_hello(record: &[u8]) -> Option<String> {
    let mut acceptor = Acceptor::default();
    let mut reader = record;
    acceptor.read_tls(&mut reader).ok()?;
    match acceptor.accept() {
        Ok(Some(accepted)) => accepted
            .client_hello()
            .server_name()
            .map(|name| name.to_string()),
        _ => None,
    }
}
