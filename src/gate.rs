//! Wires the components together and decides how the process ends

use crate::acceptor::ConnectionAcceptor;
use crate::activity;
use crate::config::Config;
use crate::dialer::RetryDialer;
use crate::error::GateError;
use crate::idle::{IdleController, IdleState};
use crate::listener::Listener;
use crate::supervisor::{ServiceController, UnitControl};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How long to wait for live pairs to close before returning
const PAIR_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Normal ways for the proxy to finish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateExit {
    /// The idle window elapsed and the unit was stopped
    Idle,
    /// `stop_signal` resolved and the unit was stopped
    Signal,
}

/// Start the unit, then proxy connections from `listener` until the idle
/// window elapses, `stop_signal` resolves, or the listener fails.
///
/// The unit is stopped on every way out once it has been started. The
/// returned error decides the exit status.
pub async fn run(
    config: &Config,
    listener: Listener,
    control: Arc<dyn UnitControl>,
    stop_signal: impl Future<Output = ()>,
) -> Result<GateExit, GateError> {
    let dialer = RetryDialer::from_config(config).map_err(|e| GateError::Config(e.to_string()))?;
    let service = ServiceController::new(config.unit.as_str(), control);
    let shutdown = CancellationToken::new();
    let (monitor, events) = activity::channel();

    let idle = tokio::spawn(
        IdleController::new(
            config.idle_window(),
            config.idle_policy,
            events,
            service.clone(),
            shutdown.clone(),
        )
        .run(),
    );

    // Fails with `AlreadyStopped` if the idle window ran out first
    if let Err(e) = service.start().await {
        idle.abort();
        return Err(e.into());
    }

    let acceptor = ConnectionAcceptor::new(listener, dialer, monitor, shutdown.clone());
    let pairs = acceptor.pairs();

    let accepted = tokio::select! {
        result = acceptor.run() => Some(result),
        _ = stop_signal => None,
    };

    let outcome = match accepted {
        Some(Ok(())) => match idle.await {
            Ok(Ok(IdleState::Expired)) => Ok(GateExit::Idle),
            Ok(Ok(state)) => Err(GateError::Task(format!(
                "idle controller ended in unexpected state {:?}",
                state
            ))),
            Ok(Err(e)) => Err(e.into()),
            Err(e) => Err(GateError::Task(e.to_string())),
        },
        // An idle stop still in flight is dropped here; `service.stop()`
        // sends it again unless it had already completed
        Some(Err(e)) => {
            idle.abort();
            shutdown.cancel();
            // Keep the backend from running with nothing in front of it
            if let Err(stop_err) = service.stop().await {
                warn!(error = %stop_err, "Failed to stop unit after accept failure");
            }
            Err(e)
        }
        None => {
            info!("Stop signal received");
            idle.abort();
            shutdown.cancel();
            service.stop().await.map(|()| GateExit::Signal).map_err(GateError::from)
        }
    };

    pairs.close();
    if tokio::time::timeout(PAIR_DRAIN_TIMEOUT, pairs.wait()).await.is_err() {
        warn!(remaining = pairs.len(), "Timed out waiting for connections to close");
    }

    if let Err(ref e) = outcome {
        error!(error = %e, "Proxy stopped with an error");
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SupervisorError;
    use crate::supervisor::testing::RecordingControl;
    use std::io;
    use tokio::net::TcpListener;

    fn config() -> Config {
        Config {
            unit: "app.service".to_string(),
            address: "127.0.0.1:1".to_string(),
            retries: 1,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_terminal_accept_error_stops_unit() {
        let control = Arc::new(RecordingControl::default());
        let listener = Listener::Failing(io::ErrorKind::PermissionDenied);

        let result = run(&config(), listener, control.clone(), std::future::pending()).await;

        match result {
            Err(GateError::Accept(e)) => assert_eq!(e.kind(), io::ErrorKind::PermissionDenied),
            other => panic!("expected accept error, got {:?}", other),
        }
        assert_eq!(
            *control.calls.lock(),
            vec!["start app.service".to_string(), "stop app.service".to_string()]
        );
    }

    #[tokio::test]
    async fn test_signal_during_idle_stop_completes_the_stop() {
        let control = Arc::new(RecordingControl {
            stop_delay: Duration::from_millis(300),
            ..Default::default()
        });
        let listener = Listener::from(TcpListener::bind("127.0.0.1:0").await.unwrap());
        let config = Config {
            idle_timeout: Duration::from_millis(100),
            ..config()
        };

        // The idle stop begins at ~100ms and is still running at 200ms
        let result = run(
            &config,
            listener,
            control.clone(),
            tokio::time::sleep(Duration::from_millis(200)),
        )
        .await;

        assert_eq!(result.unwrap(), GateExit::Signal);
        let calls = control.calls.lock().clone();
        assert_eq!(calls.first().map(String::as_str), Some("start app.service"));
        assert_eq!(calls.last().map(String::as_str), Some("stopped app.service"));
    }

    #[tokio::test]
    async fn test_failed_stop_on_signal_is_reported() {
        let control = Arc::new(RecordingControl {
            fail_stop: true,
            ..Default::default()
        });
        let listener = Listener::from(TcpListener::bind("127.0.0.1:0").await.unwrap());

        let result = run(&config(), listener, control, std::future::ready(())).await;

        assert!(matches!(
            result,
            Err(GateError::Supervisor(SupervisorError::Stop { .. }))
        ));
    }
}
