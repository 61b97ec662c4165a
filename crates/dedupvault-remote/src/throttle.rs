//! Bandwidth throttling for streaming transfers.
//!
//! [`Throttled`] wraps an async reader or writer and delays each poll until
//! the bytes moved so far fit under the configured rate, measured from the
//! first poll.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};

/// Rate-limited wrapper around an `AsyncRead` or `AsyncWrite`.
pub struct Throttled<S> {
    inner: S,
    bytes_per_second: Option<u64>,
    started: Option<Instant>,
    transferred: u64,
    delay: Option<Pin<Box<Sleep>>>,
}

impl<S> Throttled<S> {
    /// Wrap `inner`; `None` or `Some(0)` disables throttling.
    pub fn new(inner: S, bytes_per_second: Option<u64>) -> Self {
        Self {
            inner,
            bytes_per_second: bytes_per_second.filter(|r| *r > 0),
            started: None,
            transferred: 0,
            delay: None,
        }
    }

    /// Bytes passed through so far.
    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    /// Unwrap the inner stream.
    pub fn into_inner(self) -> S {
        self.inner
    }

    fn poll_budget(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        let Some(rate) = self.bytes_per_second else {
            return Poll::Ready(());
        };
        let started = *self.started.get_or_insert_with(Instant::now);
        loop {
            if let Some(delay) = self.delay.as_mut() {
                ready!(delay.as_mut().poll(cx));
                self.delay = None;
            }
            let due = started + Duration::from_secs_f64(self.transferred as f64 / rate as f64);
            if due <= Instant::now() {
                return Poll::Ready(());
            }
            self.delay = Some(Box::pin(tokio::time::sleep_until(due)));
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Throttled<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_budget(cx));
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.transferred += (buf.filled().len() - before) as u64;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Throttled<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_budget(cx));
        let n = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
        this.transferred += n as u64;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
