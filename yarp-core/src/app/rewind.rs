//! Peek-and-replay stream.
//!
//! [`RewindStream`] lets the sniffers consume the opening bytes of a
//! connection and then put them back, so the proxied stream that follows is
//! byte-identical to what the client sent. The replayed bytes live in an
//! in-memory prefix composed in front of a buffered reader; `unread` never
//! performs I/O.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, BufReader, ReadBuf};

/// Read buffer sized for the sniffers' needs.
const SNIFF_BUFFER: usize = 8 * 1024;

/// A stream wrapper with an `unread` operation. Reads drain the replay
/// prefix first, then the buffered reader, then the underlying stream;
/// writes go straight through.
pub struct RewindStream<S> {
    prefix: Vec<u8>,
    pos: usize,
    inner: BufReader<S>,
}

impl<S: AsyncRead> RewindStream<S> {
    pub fn new(stream: S) -> Self {
        RewindStream {
            prefix: Vec::new(),
            pos: 0,
            inner: BufReader::with_capacity(SNIFF_BUFFER, stream),
        }
    }

    /// Pushes `bytes` back onto the stream. Subsequent reads return `bytes`,
    /// then anything already un-read but not yet consumed, then the rest of
    /// the stream.
    pub fn unread(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        if self.pos >= self.prefix.len() {
            self.prefix.clear();
            self.prefix.extend_from_slice(bytes);
        } else {
            let mut replay = Vec::with_capacity(bytes.len() + self.prefix.len() - self.pos);
            replay.extend_from_slice(bytes);
            replay.extend_from_slice(&self.prefix[self.pos..]);
            self.prefix = replay;
        }
        self.pos = 0;
    }

    pub fn get_ref(&self) -> &S {
        self.inner.get_ref()
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for RewindStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.prefix.len() {
            let n = buf.remaining().min(this.prefix.len() - this.pos);
            buf.put_slice(&this.prefix[this.pos..this.pos + n]);
            this.pos += n;
            if this.pos == this.prefix.len() {
                this.prefix.clear();
                this.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for RewindStream<S> {
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
