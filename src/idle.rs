//! Stops the unit and cancels every connection once the idle window passes
//!
//! With [`IdlePolicy::Fixed`] the deadline is taken once, when the
//! controller starts, and activity never moves it. With
//! [`IdlePolicy::Sliding`] each activity event re-arms the deadline to
//! `now + window`.

use crate::activity::ActivityEvents;
use crate::config::IdlePolicy;
use crate::error::SupervisorError;
use crate::supervisor::ServiceController;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleState {
    /// Waiting for the deadline
    Armed { deadline: Instant },
    /// Idle window is zero; never expires
    Disarmed,
    /// Unit stopped and global scope cancelled
    Expired,
}

/// Process-wide idle controller
pub struct IdleController {
    window: Option<Duration>,
    policy: IdlePolicy,
    events: ActivityEvents,
    service: ServiceController,
    shutdown: CancellationToken,
}

impl IdleController {
    /// `window` of `None` disarms the controller
    pub fn new(
        window: Option<Duration>,
        policy: IdlePolicy,
        events: ActivityEvents,
        service: ServiceController,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            window,
            policy,
            events,
            service,
            shutdown,
        }
    }

    fn initial_state(&self) -> IdleState {
        match self.window {
            Some(window) => IdleState::Armed {
                deadline: Instant::now() + window,
            },
            None => IdleState::Disarmed,
        }
    }

    /// Run until expiry. A disarmed controller drains events until every
    /// emitter is gone and then returns `Disarmed`.
    ///
    /// On expiry the unit is stopped and `shutdown` is cancelled. The scope
    /// is cancelled even when the stop request fails, so no pair is left
    /// open; the stop error is then returned.
    pub async fn run(mut self) -> Result<IdleState, SupervisorError> {
        let mut state = self.initial_state();
        let mut events_open = true;

        match state {
            IdleState::Armed { .. } => {
                info!(
                    window_ms = self.window.map(|w| w.as_millis() as u64),
                    policy = ?self.policy,
                    "Idle controller armed"
                );
            }
            _ => debug!("Idle shutdown disabled"),
        }

        loop {
            match state {
                IdleState::Disarmed => {
                    if !self.events.next().await {
                        return Ok(state);
                    }
                }
                IdleState::Armed { deadline } => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {
                            state = IdleState::Expired;
                        }
                        open = self.events.next(), if events_open => {
                            if !open {
                                events_open = false;
                            } else if let (IdlePolicy::Sliding, Some(window)) = (self.policy, self.window) {
                                state = IdleState::Armed { deadline: Instant::now() + window };
                            }
                        }
                    }
                }
                IdleState::Expired => return self.expire().await,
            }
        }
    }

    async fn expire(self) -> Result<IdleState, SupervisorError> {
        info!(unit = %self.service.unit(), "Idle window elapsed, stopping unit");
        let stopped = self.service.stop().await;
        self.shutdown.cancel();

        match stopped {
            Ok(()) => Ok(IdleState::Expired),
            Err(e) => {
                error!(unit = %self.service.unit(), error = %e, "Failed to stop idle unit");
                Err(e)
            }
        }
    }
}
