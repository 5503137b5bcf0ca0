//! A byte stream whose head can be inspected without being consumed.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Size of the head buffer. Large enough for a TLS ClientHello and for any
/// reasonable HTTP request line plus first header.
pub const PEEK_BUFFER_SIZE: usize = 4096;

/// Wraps a stream and buffers its head so protocol classifiers can look at
/// the first bytes without consuming them.
///
/// The first call to [`PeekableStream::peek`] performs a single read to pull
/// in whatever is already available (never blocking for more), and later
/// peeks serve from that buffer. Reading from the stream drains the buffered
/// head first and permanently fuses peeking.
pub struct PeekableStream<S> {
    inner: S,
    head: Vec<u8>,
    pos: usize,
    filled: bool,
    fused: bool,
}

impl<S> PeekableStream<S> {
    /// Wrap `inner` with an empty head buffer.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            head: Vec::new(),
            pos: 0,
            filled: false,
            fused: false,
        }
    }
}

impl<S: AsyncRead + Unpin> PeekableStream<S> {
    /// Return up to `n` bytes from the front of the stream without consuming
    /// them.
    ///
    /// If more bytes are requested than are currently buffered, only the
    /// buffered bytes are returned; this never waits for additional data
    /// beyond the initial fill. Fails once the stream has been read from.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        if self.fused {
            return Err(io::Error::other(
                "cannot peek at a stream that has been read from",
            ));
        }
        if !self.filled {
            let mut buf = vec![0u8; PEEK_BUFFER_SIZE];
            let read = self.inner.read(&mut buf).await?;
            buf.truncate(read);
            self.head = buf;
            self.filled = true;
        }
        Ok(&self.head[..n.min(self.head.len())])
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekableStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.fused = true;
        if this.pos < this.head.len() {
            let available = &this.head[this.pos..];
            let n = available.len().min(buf.remaining());
            buf.put_slice(&available[..n]);
            this.pos += n;
            if this.pos == this.head.len() {
                this.head = Vec::new();
                this.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekableStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
