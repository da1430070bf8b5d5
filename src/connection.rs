//! A raw stream wrapper that meters reads and writes through two buckets.

use std::{
    future::Future,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
    time::Duration,
};

use conv::ValueFrom;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    time::{sleep, Instant, Sleep},
};

use crate::{bucket::TokenBucket, limits::RateLimit, registry::Registration};

/// Grant state for one transfer direction.
///
/// A grant is taken in two stages, global bucket then private bucket, and
/// survives across `Poll::Pending` so that a pending inner I/O never
/// re-charges the buckets.
#[derive(Debug)]
struct Gate {
    phase: Phase,
    sleep: Pin<Box<Sleep>>,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Idle,
    /// Waiting on the global bucket.
    Global { allowed: u64 },
    /// Waiting on the private bucket.
    Local { allowed: u64 },
    /// Both buckets paid; the grant is ready to spend on I/O.
    Granted { allowed: u64 },
}

impl Gate {
    fn new() -> Self {
        Self {
            phase: Phase::Idle,
            sleep: Box::pin(sleep(Duration::ZERO)),
        }
    }

    /// Drive the two-stage consume until up to `want` bytes are granted.
    fn poll_grant(
        &mut self,
        cx: &mut Context<'_>,
        global: &TokenBucket,
        local: &TokenBucket,
        want: u64,
    ) -> Poll<u64> {
        loop {
            match self.phase {
                Phase::Idle => {
                    self.phase = Phase::Global {
                        allowed: want.min(local.burst()),
                    };
                }
                Phase::Global { allowed } => match global.try_consume(allowed) {
                    Ok(granted) => {
                        // The private burst may have shrunk while we waited on
                        // the global bucket; asking it for more than its
                        // capacity would never complete.
                        self.phase = Phase::Local {
                            allowed: granted.min(local.burst()),
                        };
                    }
                    Err(wait) => ready!(self.poll_sleep(cx, wait)),
                },
                Phase::Local { allowed } => match local.try_consume(allowed) {
                    Ok(granted) => self.phase = Phase::Granted { allowed: granted },
                    Err(wait) => ready!(self.poll_sleep(cx, wait)),
                },
                Phase::Granted { allowed } => return Poll::Ready(allowed),
            }
        }
    }

    fn poll_sleep(&mut self, cx: &mut Context<'_>, wait: Duration) -> Poll<()> {
        self.sleep.as_mut().reset(Instant::now() + wait);
        self.sleep.as_mut().poll(cx)
    }

    /// The grant was spent; the next poll starts a fresh one.
    fn spend(&mut self) {
        self.phase = Phase::Idle;
    }
}

/// One throttled connection.
///
/// Wraps a raw stream and meters **both directions**: each read or write
/// first takes its byte count out of the listener-wide global bucket, then
/// out of the connection's private bucket, waiting in each for the bytes to
/// accrue. A single transfer is capped to the private burst, so large caller
/// buffers are served in rate-sized slices.
///
/// The type is a drop-in [`AsyncRead`] + [`AsyncWrite`] substitute for the
/// raw stream. Transport errors pass through unchanged, and a wait is
/// cancelled by dropping the read/write future, losing no tokens.
///
/// Shutting the connection down (or dropping it) removes it from the
/// listener's registry; repeated shutdowns only reach the raw stream.
#[derive(Debug)]
pub struct ThrottledConnection<C> {
    inner: C,
    peer_addr: SocketAddr,
    global: Arc<TokenBucket>,
    local: Arc<TokenBucket>,
    /// Dropped to deregister; taken at most once, by shutdown.
    registration: Option<Registration>,
    read_gate: Gate,
    write_gate: Gate,
}

impl<C> ThrottledConnection<C> {
    pub(crate) fn new(
        inner: C,
        peer_addr: SocketAddr,
        global: Arc<TokenBucket>,
        local: Arc<TokenBucket>,
        registration: Registration,
    ) -> Self {
        Self {
            inner,
            peer_addr,
            global,
            local,
            registration: Some(registration),
            read_gate: Gate::new(),
            write_gate: Gate::new(),
        }
    }

    /// Address of the remote peer, captured at accept time.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// The connection's current private limit.
    pub fn limit(&self) -> RateLimit {
        self.local.limit()
    }

    /// The raw stream.
    pub fn get_ref(&self) -> &C {
        &self.inner
    }
}

impl<C: AsyncRead + Unpin> AsyncRead for ThrottledConnection<C> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let want = u64::value_from(buf.remaining()).unwrap_or(u64::MAX);
        let granted = ready!(this
            .read_gate
            .poll_grant(cx, &this.global, &this.local, want));
        let allowed =
            usize::value_from(granted).expect("grant never exceeds the requested read size");

        let mut limited = buf.take(allowed);
        match Pin::new(&mut this.inner).poll_read(cx, &mut limited) {
            // The grant is kept for the retry.
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) => {
                this.read_gate.spend();
                Poll::Ready(Err(e))
            }
            Poll::Ready(Ok(())) => {
                let filled = limited.filled().len();
                let initialized = limited.initialized().len();
                // `limited` borrows the unfilled tail of `buf`, so whatever it
                // initialized and filled is initialized and filled in `buf`.
                unsafe { buf.assume_init(initialized) };
                buf.advance(filled);
                this.read_gate.spend();
                Poll::Ready(Ok(()))
            }
        }
    }
}

impl<C: AsyncWrite + Unpin> AsyncWrite for ThrottledConnection<C> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        }

        let want = u64::value_from(buf.len()).unwrap_or(u64::MAX);
        let granted = ready!(this
            .write_gate
            .poll_grant(cx, &this.global, &this.local, want));
        // A held grant can outlive the buffer it was sized for: dropping a
        // pending write future and retrying with a smaller buffer must never
        // slice past it. The surplus tokens are forfeit.
        let allowed = usize::value_from(granted)
            .expect("grants are sized from usize buffers")
            .min(buf.len());

        // The raw stream may accept fewer bytes than granted; the surplus
        // tokens are forfeit, as with a short raw read.
        let result = ready!(Pin::new(&mut this.inner).poll_write(cx, &buf[..allowed]));
        this.write_gate.spend();
        Poll::Ready(result)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.inner).poll_shutdown(cx))?;
        // Deregister exactly once; dropping the registration removes us.
        this.registration.take();
        Poll::Ready(Ok(()))
    }
}
