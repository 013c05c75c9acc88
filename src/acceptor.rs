//! The accept loop: one backend dial and one connection pair per inbound
//! connection

use crate::activity::ActivityMonitor;
use crate::dialer::RetryDialer;
use crate::error::{is_transient_accept_error, DialError, GateError};
use crate::listener::Listener;
use crate::pump::ConnectionPair;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Top-level loop: accept, dial the backend, start a pair
pub struct ConnectionAcceptor {
    listener: Listener,
    dialer: RetryDialer,
    activity: ActivityMonitor,
    shutdown: CancellationToken,
    pairs: TaskTracker,
}

impl ConnectionAcceptor {
    pub fn new(
        listener: Listener,
        dialer: RetryDialer,
        activity: ActivityMonitor,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            listener,
            dialer,
            activity,
            shutdown,
            pairs: TaskTracker::new(),
        }
    }

    /// Tracks the close of every pair this acceptor opens
    pub fn pairs(&self) -> TaskTracker {
        self.pairs.clone()
    }

    /// Accept until the global scope is cancelled or the listener fails.
    /// Cancellation ends the loop with `Ok(())`.
    ///
    /// Each cycle reports one activity event before waiting on accept.
    /// Transient accept errors are logged and skipped; any other accept
    /// error ends the loop with `GateError::Accept`. A connection whose
    /// backend dial is exhausted is dropped and the loop carries on.
    pub async fn run(self) -> Result<(), GateError> {
        info!(
            listen = %self.listener.local_addr(),
            backend = %self.dialer.addr(),
            "Accepting connections"
        );

        loop {
            self.activity.record();

            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested, no longer accepting");
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted,
            };

            let (inbound, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) if is_transient_accept_error(&e) => {
                    warn!(error = %e, "Transient accept error");
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    return Err(GateError::Accept(e));
                }
            };
            debug!(peer = %peer, "Accepted connection");

            let outbound = match self.dialer.dial(&self.shutdown).await {
                Ok(outbound) => outbound,
                Err(DialError::Cancelled) => {
                    debug!(peer = %peer, "Dropping connection, shutting down");
                    continue;
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Dropping connection, backend unreachable");
                    continue;
                }
            };

            let pair = ConnectionPair::spawn(
                inbound,
                outbound,
                self.activity.clone(),
                self.shutdown.child_token(),
            );
            debug!(peer = %peer, pair_id = pair.id(), "Proxying connection");
            self.pairs.spawn(pair.closed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity;
    use crate::dialer::{BackendAddr, RetryPolicy};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn dialer_to(addr: std::net::SocketAddr) -> RetryDialer {
        RetryDialer::new(
            BackendAddr::Tcp(addr.to_string()),
            RetryPolicy {
                max_attempts: 3,
                delay: Duration::from_millis(20),
            },
        )
    }

    #[tokio::test]
    async fn test_relays_to_backend() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front.local_addr().unwrap();

        let (monitor, _events) = activity::channel();
        let shutdown = CancellationToken::new();
        let acceptor = ConnectionAcceptor::new(
            Listener::from(front),
            dialer_to(backend_addr),
            monitor,
            shutdown.clone(),
        );
        let pairs = acceptor.pairs();
        let handle = tokio::spawn(acceptor.run());

        let mut client = TcpStream::connect(front_addr).await.unwrap();
        let (mut server, _) = backend.accept().await.unwrap();

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        shutdown.cancel();
        handle.await.unwrap().unwrap();
        pairs.close();
        tokio::time::timeout(Duration::from_secs(2), pairs.wait())
            .await
            .unwrap();

        // Global shutdown closes the live pair too
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_accept_cycle_reports_activity() {
        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (monitor, mut events) = activity::channel();
        let shutdown = CancellationToken::new();
        let acceptor = ConnectionAcceptor::new(
            Listener::from(front),
            dialer_to("127.0.0.1:1".parse().unwrap()),
            monitor,
            shutdown.clone(),
        );
        let handle = tokio::spawn(acceptor.run());

        assert!(events.next().await);
        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }
}
