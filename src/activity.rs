//! Activity events funnelled from every pump and the accept loop into the
//! idle controller.
//!
//! Events carry no payload, so delivery is coalescing: `record` never
//! blocks, and when the queue is already full the new event is folded into
//! the ones still pending. The controller therefore observes at least one
//! event after any burst of activity. No ordering is promised across
//! emitters.

use tokio::sync::mpsc;

/// Depth of the activity queue before events start coalescing
const ACTIVITY_QUEUE_DEPTH: usize = 64;

/// Sending side, cloned into every emitter
#[derive(Debug, Clone)]
pub struct ActivityMonitor {
    tx: mpsc::Sender<()>,
}

/// Receiving side, owned by the idle controller
#[derive(Debug)]
pub struct ActivityEvents {
    rx: mpsc::Receiver<()>,
}

/// Create a connected monitor/events pair
pub fn channel() -> (ActivityMonitor, ActivityEvents) {
    let (tx, rx) = mpsc::channel(ACTIVITY_QUEUE_DEPTH);
    (ActivityMonitor { tx }, ActivityEvents { rx })
}

impl ActivityMonitor {
    /// Report that bytes moved or a new accept cycle began
    pub fn record(&self) {
        // Full: coalesced with pending events. Closed: nobody is watching.
        let _ = self.tx.try_send(());
    }
}

impl ActivityEvents {
    /// Wait for the next event. Returns `false` once every monitor is gone.
    pub async fn next(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }
}
