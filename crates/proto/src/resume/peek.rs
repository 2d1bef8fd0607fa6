//! Socket adapters for the version probe.
//!
//! [`PeekStream`] buffers bytes read ahead of consumption so the probe can
//! classify a client without eating its first bytes. [`BannerSkipStream`]
//! hands a legacy connection back to the inner SSH server while hiding the
//! fact that the identification banner is already on the wire: the inner
//! server believes it still owes the banner, and its re-emission is
//! swallowed after being verified byte-for-byte.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Returns true for errors that are routine network closes rather than
/// faults worth logging.
pub(crate) fn is_ok_network_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

/// Buffered adapter that can peek ahead without consuming.
///
/// Reads drain the peek buffer before touching the underlying socket;
/// writes pass straight through.
#[derive(Debug)]
pub struct PeekStream<S> {
    inner: S,
    buffer: BytesMut,
}

impl<S> PeekStream<S> {
    /// Wraps a socket with an empty peek buffer.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(64),
        }
    }

    /// Returns a reference to the underlying socket.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Consumes `n` bytes from the peek buffer.
    ///
    /// # Panics
    ///
    /// Panics if fewer than `n` bytes are buffered; callers discard only
    /// what a successful peek has already confirmed.
    pub fn discard(&mut self, n: usize) {
        assert!(self.buffer.len() >= n, "discarding more than was peeked");
        self.buffer.advance(n);
    }
}

impl<S> PeekStream<S>
where
    S: AsyncRead + Unpin,
{
    /// Compares the client's first bytes against `expected` without
    /// consuming them.
    ///
    /// The comparison is incremental: the first divergent byte decides,
    /// so a legacy client that never sends `expected.len()` bytes is still
    /// classified promptly (its version string diverges at the NUL).
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error, or `UnexpectedEof` if the client
    /// closed before a decision was possible.
    pub async fn peek_prelude(&mut self, expected: &[u8]) -> io::Result<bool> {
        loop {
            let overlap = self.buffer.len().min(expected.len());
            if self.buffer[..overlap] != expected[..overlap] {
                return Ok(false);
            }
            if overlap == expected.len() {
                return Ok(true);
            }

            let n = self.inner.read_buf(&mut self.buffer).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed during protocol detection",
                ));
            }
        }
    }
}

impl<S> AsyncRead for PeekStream<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.buffer.is_empty() {
            let n = self.buffer.len().min(buf.remaining());
            buf.put_slice(&self.buffer[..n]);
            self.buffer.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S> AsyncWrite for PeekStream<S>
where
    S: AsyncWrite + Unpin,
{
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
}

/// Legacy passthrough that hides the already-sent banner.
///
/// The wrapped connection is handed to the inner SSH server, which is
/// expected to emit the identification line reported by
/// [`BannerSkipStream::server_version`]. Those bytes are verified against
/// the banner already on the wire and swallowed; everything after passes
/// through. A mismatch is an error: the inner server tried to commit to a
/// different identification than the one the client saw.
#[derive(Debug)]
pub struct BannerSkipStream<S> {
    inner: S,
    banner: Vec<u8>,
    skipped: usize,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
}

impl<S> BannerSkipStream<S> {
    /// Wraps a connection whose banner (including CRLF) is already sent.
    pub fn new(
        inner: S,
        banner: String,
        local_addr: Option<SocketAddr>,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            inner,
            banner: banner.into_bytes(),
            skipped: 0,
            local_addr,
            remote_addr,
        }
    }

    /// The identification line the inner SSH server must present, without
    /// the trailing CRLF.
    pub fn server_version(&self) -> &str {
        let line = std::str::from_utf8(&self.banner).unwrap_or_default();
        line.trim_end_matches("\r\n")
    }

    /// Local address of the underlying socket, if known.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Remote address of the underlying socket, if known.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }
}

impl<S> AsyncRead for BannerSkipStream<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S> AsyncWrite for BannerSkipStream<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.as_mut().get_mut();
        let remaining = this.banner.len() - this.skipped;
        if remaining > 0 {
            let n = remaining.min(buf.len());
            if buf[..n] != this.banner[this.skipped..this.skipped + n] {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "inner SSH server version differs from the banner on the wire",
                )));
            }
            this.skipped += n;
            return Poll::Ready(Ok(n));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
