//! Error types for the proxy core and its boundary adapters

use std::io;
use thiserror::Error;

/// Failure to obtain a backend connection
#[derive(Debug, Error)]
pub enum DialError {
    /// The configured mode/address pair cannot be dialed at all
    #[error("invalid backend address '{address}' for mode '{mode}': {reason}")]
    InvalidAddress {
        mode: String,
        address: String,
        reason: String,
    },
    /// Every attempt failed; carries the error of the last one
    #[error("backend unreachable after {attempts} attempt(s): {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: io::Error,
    },
    /// Global shutdown fired while retrying
    #[error("dial cancelled by shutdown")]
    Cancelled,
}

/// Failure talking to the service supervisor
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The supervisor bus could not be reached
    #[error("failed to connect to the {bus} bus: {source}")]
    Connect {
        bus: &'static str,
        #[source]
        source: zbus::Error,
    },
    /// The start job for the unit was rejected
    #[error("failed to start unit '{unit}': {reason}")]
    Start { unit: String, reason: String },
    /// The stop job for the unit was rejected
    #[error("failed to stop unit '{unit}': {reason}")]
    Stop { unit: String, reason: String },
    /// The unit was stopped by this process and is not started again
    #[error("unit '{unit}' was already stopped")]
    AlreadyStopped { unit: String },
}

/// Top-level errors surfaced to the process driver
#[derive(Debug, Error)]
pub enum GateError {
    /// The configuration is unusable
    #[error("configuration error: {0}")]
    Config(String),
    /// No activated socket was handed over
    #[error("socket activation failed: {0}")]
    Listener(String),
    /// The listener stopped producing connections
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
    /// Starting or stopping the unit failed
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    /// A background task panicked or was aborted
    #[error("task failed: {0}")]
    Task(String),
}

/// Whether an accept error leaves the listener usable.
///
/// Aborted or reset handshakes and interrupted syscalls affect only the
/// connection being accepted, not the listening socket.
pub fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_accept_errors() {
        assert!(is_transient_accept_error(&io::Error::from(
            io::ErrorKind::ConnectionAborted
        )));
        assert!(is_transient_accept_error(&io::Error::from(
            io::ErrorKind::Interrupted
        )));
        assert!(!is_transient_accept_error(&io::Error::from(
            io::ErrorKind::InvalidInput
        )));
        assert!(!is_transient_accept_error(&io::Error::other("listener gone")));
    }

    #[test]
    fn test_exhausted_message() {
        let err = DialError::Exhausted {
            attempts: 3,
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        let msg = err.to_string();
        assert!(msg.contains("3 attempt(s)"));
    }

    #[test]
    fn test_supervisor_error_converts() {
        let err: GateError = SupervisorError::Start {
            unit: "web.service".to_string(),
            reason: "no such unit".to_string(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "failed to start unit 'web.service': no such unit"
        );
    }
}
