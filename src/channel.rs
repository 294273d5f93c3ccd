//! Async stream over a non-blocking ssh2 channel.
//!
//! libssh2 reports `EAGAIN` instead of registering interest with a reactor,
//! so a pending read or write parks on a short timer and retries.

use std::future::Future;
use std::io::{self, Read, Write};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};

/// Retry interval while libssh2 has nothing to offer.
pub const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// `LIBSSH2_ERROR_EAGAIN`
const EAGAIN: i32 = -37;

pub fn would_block(err: &ssh2::Error) -> bool {
    err.code() == ssh2::ErrorCode::Session(EAGAIN)
}

/// Run a libssh2 call until it stops returning `EAGAIN`.
pub async fn retry<T, F>(mut f: F) -> Result<T, ssh2::Error>
where
    F: FnMut() -> Result<T, ssh2::Error>,
{
    loop {
        match f() {
            Err(err) if would_block(&err) => tokio::time::sleep(POLL_INTERVAL).await,
            res => return res,
        }
    }
}

/// An ssh2 channel usable with tokio's io traits.
pub struct ChannelStream {
    channel: ssh2::Channel,
    backoff: Pin<Box<Sleep>>,
    eof_sent: bool,
}

impl ChannelStream {
    pub fn new(channel: ssh2::Channel) -> Self {
        Self {
            channel,
            backoff: Box::pin(tokio::time::sleep(Duration::ZERO)),
            eof_sent: false,
        }
    }

    /// Register a timer wakeup. `Ready` means retry immediately.
    fn park(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        self.backoff.as_mut().reset(Instant::now() + POLL_INTERVAL);
        self.backoff.as_mut().poll(cx)
    }
}

impl AsyncRead for ChannelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match this.channel.read(buf.initialize_unfilled()) {
                Ok(n) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if this.park(cx).is_pending() {
                        return Poll::Pending;
                    }
                }
                Err(err) => return Poll::Ready(Err(err)),
            }
        }
    }
}

impl AsyncWrite for ChannelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            match this.channel.write(buf) {
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if this.park(cx).is_pending() {
                        return Poll::Pending;
                    }
                }
                res => return Poll::Ready(res),
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match this.channel.flush() {
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if this.park(cx).is_pending() {
                        return Poll::Pending;
                    }
                }
                res => return Poll::Ready(res),
            }
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.eof_sent {
            return Poll::Ready(Ok(()));
        }
        loop {
            match this.channel.send_eof() {
                Ok(()) => {
                    this.eof_sent = true;
                    return Poll::Ready(Ok(()));
                }
                Err(err) if would_block(&err) => {
                    if this.park(cx).is_pending() {
                        return Poll::Pending;
                    }
                }
                Err(err) => return Poll::Ready(Err(err.into())),
            }
        }
    }
}
