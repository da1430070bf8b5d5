//! A listener wrapper that seeds, registers and throttles accepted
//! connections.

use std::{
    io,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
};
use tracing::debug;

use crate::{
    bucket::TokenBucket,
    connection::ThrottledConnection,
    limits::{LimitError, RateLimit},
    registry::{ConnectionRegistry, Registration},
};

/// The accept capability of a raw transport.
///
/// Implemented for [`tokio::net::TcpListener`]; tests supply in-memory
/// implementations.
#[async_trait]
pub trait RawListener {
    /// The stream type produced by [`accept`](Self::accept).
    type Conn: AsyncRead + AsyncWrite + Send + Unpin;

    /// Wait for the next connection. Errors (including a closed listener)
    /// propagate to the caller unchanged.
    async fn accept(&self) -> io::Result<(Self::Conn, SocketAddr)>;

    /// The local address this listener is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl RawListener for TcpListener {
    type Conn = TcpStream;

    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// A listener that throttles every accepted connection.
///
/// Owns the global bucket shared by all of its connections and the
/// per-connection limit seeded into each new one. Both can be replaced at
/// runtime with [`set_limits`](Self::set_limits) without dropping anything.
///
/// Dropping the listener closes the accept capability only: connections
/// already handed out continue under their assigned buckets until their
/// handlers close them.
///
/// ```no_run
/// use throttled_listener::{limits::RateLimit, listener::ThrottledListener};
/// use tokio::io;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> io::Result<()> {
/// let raw = tokio::net::TcpListener::bind("127.0.0.1:4040").await?;
/// let listener = ThrottledListener::new(
///     raw,
///     RateLimit::per_second(1024 * 1024),
///     RateLimit::per_second(64 * 1024),
/// )
/// .expect("limits are positive and ordered");
///
/// loop {
///     let conn = listener.accept().await?;
///     tokio::spawn(async move {
///         let (mut reader, mut writer) = io::split(conn);
///         let _ = io::copy(&mut reader, &mut writer).await;
///     });
/// }
/// # }
/// ```
#[derive(Debug)]
pub struct ThrottledListener<L> {
    inner: L,
    global: Arc<TokenBucket>,
    per_conn: Mutex<RateLimit>,
    registry: Arc<ConnectionRegistry>,
}

impl<L: RawListener> ThrottledListener<L> {
    /// Wrap `inner`, enforcing `global` across all connections together and
    /// `per_conn` on each one individually.
    ///
    /// # Errors
    ///
    /// [`LimitError::OutOfRange`] if any rate or burst is zero,
    /// [`LimitError::GlobalBelowPerConn`] if the global rate is below the
    /// per-connection rate.
    pub fn new(inner: L, global: RateLimit, per_conn: RateLimit) -> Result<Self, LimitError> {
        RateLimit::validate_pair(global, per_conn)?;
        Ok(Self {
            inner,
            global: Arc::new(TokenBucket::new(global)?),
            per_conn: Mutex::new(per_conn),
            registry: ConnectionRegistry::new(),
        })
    }

    /// Wait for the next connection, wrap it and register it.
    ///
    /// The connection's private bucket is seeded with the per-connection
    /// limit current at this moment; later [`set_limits`](Self::set_limits)
    /// calls reach it through the registry.
    ///
    /// # Errors
    ///
    /// Whatever the raw listener's accept returns, unchanged.
    pub async fn accept(&self) -> io::Result<ThrottledConnection<L::Conn>> {
        let (raw, peer_addr) = self.inner.accept().await?;

        let limit = *self.lock_per_conn();
        let local = Arc::new(TokenBucket::from_validated(limit));
        let registration = Registration::new(Arc::clone(&self.registry), Arc::clone(&local));

        debug!(peer = %peer_addr, rate = limit.bytes_per_sec, "accepted throttled connection");

        Ok(ThrottledConnection::new(
            raw,
            peer_addr,
            Arc::clone(&self.global),
            local,
            registration,
        ))
    }

    /// Replace both limits at runtime.
    ///
    /// Valid limits take effect immediately: the global bucket is
    /// reconfigured, the stored per-connection limit seeds all future
    /// accepts, and every currently open connection adopts the new
    /// per-connection limit on its next read or write.
    ///
    /// Invalid limits (a zero field, or a global rate below the
    /// per-connection rate) are silently discarded: no error, no change.
    pub fn set_limits(&self, global: RateLimit, per_conn: RateLimit) {
        if let Err(reason) = RateLimit::validate_pair(global, per_conn) {
            debug!(%reason, "ignoring invalid limit update");
            return;
        }

        self.global.reconfigure(global);
        *self.lock_per_conn() = per_conn;
        self.registry.broadcast(per_conn);

        debug!(
            global_rate = global.bytes_per_sec,
            per_conn_rate = per_conn.bytes_per_sec,
            "bandwidth limits updated"
        );
    }

    /// The current (global, per-connection) limits.
    pub fn limits(&self) -> (RateLimit, RateLimit) {
        (self.global.limit(), *self.lock_per_conn())
    }

    /// Number of open throttled connections: accepted and not yet closed.
    pub fn open_connections(&self) -> usize {
        self.registry.len()
    }

    /// The local address of the raw listener.
    ///
    /// # Errors
    ///
    /// Whatever the raw listener returns, unchanged.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// The raw listener.
    pub fn get_ref(&self) -> &L {
        &self.inner
    }

    fn lock_per_conn(&self) -> MutexGuard<'_, RateLimit> {
        self.per_conn.lock().expect("lock should not be poisoned")
    }
}

#[cfg(test)]
mod tests {
    use std::{io, net::SocketAddr, time::Duration};

    use async_trait::async_trait;
    use tokio::{
        io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream},
        sync::{mpsc, Mutex},
        time::Instant,
    };
    use tokio_test::assert_ok;

    use crate::limits::{LimitError, RateLimit};

    use super::{RawListener, ThrottledListener};

    /// An in-memory listener fed through a channel.
    struct ChannelListener {
        incoming: Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
    }

    #[async_trait]
    impl RawListener for ChannelListener {
        type Conn = DuplexStream;

        async fn accept(&self) -> io::Result<(DuplexStream, SocketAddr)> {
            let conn = self
                .incoming
                .lock()
                .await
                .recv()
                .await
                .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "listener closed"))?;
            Ok((conn, peer()))
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(peer())
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:4040".parse().expect("valid address")
    }

    fn channel_listener() -> (ChannelListener, mpsc::UnboundedSender<DuplexStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ChannelListener {
                incoming: Mutex::new(rx),
            },
            tx,
        )
    }

    fn throttled(
        global: u64,
        per_conn: u64,
    ) -> (
        ThrottledListener<ChannelListener>,
        mpsc::UnboundedSender<DuplexStream>,
    ) {
        let (raw, tx) = channel_listener();
        let listener = ThrottledListener::new(
            raw,
            RateLimit::per_second(global),
            RateLimit::per_second(per_conn),
        )
        .expect("limits are valid");
        (listener, tx)
    }

    /// Hand a fresh duplex pair to the listener and accept it.
    async fn connect(
        listener: &ThrottledListener<ChannelListener>,
        tx: &mpsc::UnboundedSender<DuplexStream>,
    ) -> (
        crate::connection::ThrottledConnection<DuplexStream>,
        DuplexStream,
    ) {
        let (near, far) = duplex(64 * 1024);
        tx.send(near).expect("listener is alive");
        let conn = listener.accept().await.expect("accept");
        (conn, far)
    }

    #[test]
    fn construction_validates_the_limit_pair() {
        for (global, per_conn, want) in [
            (100, 50, Ok(())),
            (100, 100, Ok(())),
            (1, 1, Ok(())),
            (0, 10, Err(LimitError::OutOfRange)),
            (10, 0, Err(LimitError::OutOfRange)),
            (0, 0, Err(LimitError::OutOfRange)),
            (10, 100, Err(LimitError::GlobalBelowPerConn)),
        ] {
            let (raw, _tx) = channel_listener();
            let result = ThrottledListener::new(
                raw,
                RateLimit::per_second(global),
                RateLimit::per_second(per_conn),
            );
            assert_eq!(
                result.as_ref().map(|_| ()).map_err(|e| *e),
                want,
                "global={global}, per_conn={per_conn}"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn accept_registers_and_seeds_the_current_limit() {
        let (listener, tx) = throttled(100, 50);

        let (conn, _far) = connect(&listener, &tx).await;

        assert_eq!(listener.open_connections(), 1);
        assert_eq!(conn.limit(), RateLimit::per_second(50));
        assert_eq!(conn.peer_addr(), peer());
    }

    #[tokio::test(start_paused = true)]
    async fn accept_propagates_listener_errors() {
        let (listener, tx) = throttled(100, 50);
        drop(tx);

        let err = listener.accept().await.expect_err("listener closed");
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test(start_paused = true)]
    async fn open_connections_balances_accepts_and_closes() {
        let (listener, tx) = throttled(100, 50);

        let (mut first, _far1) = connect(&listener, &tx).await;
        let (second, _far2) = connect(&listener, &tx).await;
        let (third, _far3) = connect(&listener, &tx).await;
        assert_eq!(listener.open_connections(), 3);

        assert_ok!(first.shutdown().await);
        assert_eq!(listener.open_connections(), 2);

        drop(second);
        assert_eq!(listener.open_connections(), 1);

        // A second close on an already-closed connection changes nothing.
        assert_ok!(first.shutdown().await);
        assert_eq!(listener.open_connections(), 1);

        drop(third);
        assert_eq!(listener.open_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn set_limits_reaches_open_and_future_connections() {
        let (listener, tx) = throttled(100, 50);
        let (open_conn, _far) = connect(&listener, &tx).await;

        listener.set_limits(RateLimit::per_second(20), RateLimit::per_second(10));

        assert_eq!(open_conn.limit(), RateLimit::per_second(10));
        let (new_conn, _far2) = connect(&listener, &tx).await;
        assert_eq!(new_conn.limit(), RateLimit::per_second(10));
        assert_eq!(
            listener.limits(),
            (RateLimit::per_second(20), RateLimit::per_second(10))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_set_limits_changes_nothing() {
        let (listener, tx) = throttled(100, 50);
        let (conn, _far) = connect(&listener, &tx).await;
        let before = listener.limits();

        listener.set_limits(RateLimit::per_second(0), RateLimit::per_second(10));
        listener.set_limits(RateLimit::per_second(10), RateLimit::per_second(0));
        listener.set_limits(RateLimit::per_second(10), RateLimit::per_second(100));

        assert_eq!(listener.limits(), before);
        assert_eq!(conn.limit(), RateLimit::per_second(50));
    }

    #[tokio::test(start_paused = true)]
    async fn transfer_is_paced_by_the_tighter_limit() {
        // Per-connection 50 bytes/s binds a single connection even though the
        // global limit would allow 100.
        let (listener, tx) = throttled(100, 50);
        let (mut conn, mut far) = connect(&listener, &tx).await;

        far.write_all(&[0u8; 1000]).await.expect("duplex write");

        let start = Instant::now();
        let mut out = [0u8; 1000];
        conn.read_exact(&mut out).await.expect("throttled read");

        // 50 bytes banked up front, then 950 at 50 bytes/s.
        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_secs(18) && elapsed <= Duration::from_secs(20),
            "expected ~19s, took {elapsed:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn matched_limits_transfer_at_the_global_rate() {
        let (listener, tx) = throttled(100, 100);
        let (mut conn, mut far) = connect(&listener, &tx).await;

        far.write_all(&[0u8; 1000]).await.expect("duplex write");

        let start = Instant::now();
        let mut out = [0u8; 1000];
        conn.read_exact(&mut out).await.expect("throttled read");

        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_millis(8900) && elapsed <= Duration::from_millis(9500),
            "expected ~9s, took {elapsed:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn lowered_limits_pace_the_next_reads() {
        let (listener, tx) = throttled(100, 50);
        let (mut conn, mut far) = connect(&listener, &tx).await;

        // Drain the initial burst so the new rate is all that is left.
        far.write_all(&[0u8; 150]).await.expect("duplex write");
        let mut out = [0u8; 50];
        conn.read_exact(&mut out).await.expect("burst read");

        listener.set_limits(RateLimit::per_second(20), RateLimit::per_second(10));

        let start = Instant::now();
        let mut out = [0u8; 100];
        conn.read_exact(&mut out).await.expect("throttled read");

        // 100 bytes at the new 10 bytes/s rate.
        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_millis(9000) && elapsed <= Duration::from_millis(11000),
            "expected ~10s, took {elapsed:?}"
        );
    }
}
