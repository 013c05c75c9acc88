//! Byte pumps for one accepted connection pair and the watcher that closes
//! both ends when the pair is cancelled.
//!
//! Each pump owns the read half of one endpoint and the write half of the
//! other. When the pair's token fires, both pumps hand their halves back and
//! the canceller reunites and shuts down each endpoint. Ownership makes the
//! close happen exactly once no matter how many sides failed.

use crate::activity::ActivityMonitor;
use crate::listener::BoxedEndpoint;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Bytes read per pump iteration
pub const PUMP_BUFFER_SIZE: usize = 1024;

type Reader = ReadHalf<BoxedEndpoint>;
type Writer = WriteHalf<BoxedEndpoint>;

static NEXT_PAIR_ID: AtomicU64 = AtomicU64::new(1);

/// Direction a pump copies in, for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Inbound peer to backend
    Upstream,
    /// Backend to inbound peer
    Downstream,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Upstream => "upstream",
            Direction::Downstream => "downstream",
        }
    }
}

/// Copy from `from` to `to` until a read fails, reaches EOF, or `cancel`
/// fires. Any read failure cancels the pair. Every successful read is
/// reported to `activity` before the bytes are written on. Write errors are
/// logged only; a broken destination shows up as a read failure on the
/// opposite pump.
///
/// Returns the halves so the canceller can close them.
pub async fn pump(
    mut from: Reader,
    mut to: Writer,
    activity: ActivityMonitor,
    cancel: CancellationToken,
    pair_id: u64,
    direction: Direction,
) -> (Reader, Writer) {
    let mut buffer = [0u8; PUMP_BUFFER_SIZE];
    let mut total: u64 = 0;

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = from.read(&mut buffer) => read,
        };

        let n = match read {
            Ok(0) => {
                trace!(pair_id, direction = direction.as_str(), "EOF");
                cancel.cancel();
                break;
            }
            Ok(n) => n,
            Err(e) => {
                trace!(pair_id, direction = direction.as_str(), error = %e, "Read failed");
                cancel.cancel();
                break;
            }
        };

        activity.record();
        total += n as u64;

        tokio::select! {
            _ = cancel.cancelled() => break,
            written = to.write_all(&buffer[..n]) => {
                if let Err(e) = written {
                    trace!(pair_id, direction = direction.as_str(), error = %e, "Write failed");
                }
            }
        }
    }

    debug!(pair_id, direction = direction.as_str(), bytes = total, "Pump finished");
    (from, to)
}

/// Wait for `cancel`, then close both endpoints once their pumps have
/// returned them.
pub async fn close_on_cancel(
    cancel: CancellationToken,
    upstream: JoinHandle<(Reader, Writer)>,
    downstream: JoinHandle<(Reader, Writer)>,
    pair_id: u64,
) {
    cancel.cancelled().await;

    let (upstream, downstream) = tokio::join!(upstream, downstream);
    match (upstream, downstream) {
        (Ok((inbound_rd, outbound_wr)), Ok((outbound_rd, inbound_wr))) => {
            let mut inbound = inbound_rd.unsplit(inbound_wr);
            let mut outbound = outbound_rd.unsplit(outbound_wr);
            let _ = inbound.shutdown().await;
            let _ = outbound.shutdown().await;
        }
        // A panicked pump already dropped its halves, which closed them
        _ => debug!(pair_id, "Pump task did not return its endpoints"),
    }

    debug!(pair_id, "Connection pair closed");
}

/// One accepted connection bound to its backend connection
#[derive(Debug)]
pub struct ConnectionPair {
    id: u64,
    cancel: CancellationToken,
    closed: JoinHandle<()>,
}

impl ConnectionPair {
    /// Start both pumps and the canceller. `cancel` should be a child of
    /// the global shutdown token.
    pub fn spawn(
        inbound: BoxedEndpoint,
        outbound: BoxedEndpoint,
        activity: ActivityMonitor,
        cancel: CancellationToken,
    ) -> Self {
        let id = NEXT_PAIR_ID.fetch_add(1, Ordering::Relaxed);
        let (inbound_rd, inbound_wr) = tokio::io::split(inbound);
        let (outbound_rd, outbound_wr) = tokio::io::split(outbound);

        let upstream = tokio::spawn(pump(
            inbound_rd,
            outbound_wr,
            activity.clone(),
            cancel.clone(),
            id,
            Direction::Upstream,
        ));
        let downstream = tokio::spawn(pump(
            outbound_rd,
            inbound_wr,
            activity,
            cancel.clone(),
            id,
            Direction::Downstream,
        ));
        let closed = tokio::spawn(close_on_cancel(cancel.clone(), upstream, downstream, id));

        debug!(pair_id = id, "Connection pair opened");
        Self { id, cancel, closed }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Tear down this pair only
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until both endpoints have been closed
    pub async fn closed(self) {
        let _ = self.closed.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn endpoints() -> (BoxedEndpoint, DuplexStream) {
        let (ours, theirs) = duplex(8 * 1024);
        (Box::new(ours), theirs)
    }

    async fn assert_closed(peer: &mut DuplexStream) {
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), peer.read(&mut buf))
            .await
            .expect("peer was not closed")
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_bytes_flow_both_ways() {
        let (inbound, mut client) = endpoints();
        let (outbound, mut backend) = endpoints();
        let (monitor, _events) = activity::channel();
        let pair = ConnectionPair::spawn(inbound, outbound, monitor, CancellationToken::new());

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        backend.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        backend.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        assert!(!pair.is_cancelled());
        pair.cancel();
        pair.closed().await;
    }

    #[tokio::test]
    async fn test_large_payload_is_unmodified() {
        let (inbound, mut client) = endpoints();
        let (outbound, mut backend) = endpoints();
        let (monitor, _events) = activity::channel();
        let _pair = ConnectionPair::spawn(inbound, outbound, monitor, CancellationToken::new());

        let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client
        });

        let mut received = vec![0u8; expected.len()];
        backend.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_close_closes_both_ends() {
        let (inbound, client) = endpoints();
        let (outbound, mut backend) = endpoints();
        let (monitor, _events) = activity::channel();
        let pair = ConnectionPair::spawn(inbound, outbound, monitor, CancellationToken::new());

        drop(client);
        assert_closed(&mut backend).await;
        assert!(pair.is_cancelled());
        pair.closed().await;
    }

    #[tokio::test]
    async fn test_backend_close_closes_client() {
        let (inbound, mut client) = endpoints();
        let (outbound, backend) = endpoints();
        let (monitor, _events) = activity::channel();
        let pair = ConnectionPair::spawn(inbound, outbound, monitor, CancellationToken::new());

        drop(backend);
        assert_closed(&mut client).await;
        pair.closed().await;
    }

    #[tokio::test]
    async fn test_parent_cancel_closes_every_pair_but_child_cancel_does_not_spread() {
        let root = CancellationToken::new();
        let (monitor, _events) = activity::channel();

        let mut peers = Vec::new();
        let mut pairs = Vec::new();
        for _ in 0..3 {
            let (inbound, client) = endpoints();
            let (outbound, backend) = endpoints();
            pairs.push(ConnectionPair::spawn(
                inbound,
                outbound,
                monitor.clone(),
                root.child_token(),
            ));
            peers.push((client, backend));
        }

        pairs[0].cancel();
        assert!(!root.is_cancelled());
        assert!(!pairs[1].is_cancelled());
        assert!(!pairs[2].is_cancelled());

        root.cancel();
        for pair in pairs {
            pair.closed().await;
        }
        for (client, backend) in peers.iter_mut() {
            assert_closed(client).await;
            assert_closed(backend).await;
        }
    }

    #[tokio::test]
    async fn test_each_read_reports_activity() {
        let (inbound, mut client) = endpoints();
        let (outbound, mut backend) = endpoints();
        let (monitor, mut events) = activity::channel();
        let _pair = ConnectionPair::spawn(inbound, outbound, monitor, CancellationToken::new());

        client.write_all(b"a").await.unwrap();
        let mut buf = [0u8; 1];
        backend.read_exact(&mut buf).await.unwrap();
        assert!(events.next().await);
    }

    #[tokio::test]
    async fn test_pair_ids_are_unique() {
        let (a_in, _a_client) = endpoints();
        let (a_out, _a_backend) = endpoints();
        let (b_in, _b_client) = endpoints();
        let (b_out, _b_backend) = endpoints();
        let (monitor, _events) = activity::channel();
        let a = ConnectionPair::spawn(a_in, a_out, monitor.clone(), CancellationToken::new());
        let b = ConnectionPair::spawn(b_in, b_out, monitor, CancellationToken::new());
        assert_ne!(a.id(), b.id());
    }
}
