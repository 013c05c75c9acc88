//! Unitgate - a socket-activated proxy that runs a systemd unit on demand
//!
//! This library provides the connection-lifecycle engine behind the proxy:
//! - Takes over a listening socket passed in by the init system
//! - Starts the backend unit through the service manager before proxying
//! - Dials the backend with bounded, fixed-delay retries per connection
//! - Relays bytes in both directions without interpreting them
//! - Stops the unit again and closes every connection once the idle window
//!   elapses

pub mod acceptor;
pub mod activity;
pub mod config;
pub mod dialer;
pub mod error;
pub mod gate;
pub mod idle;
pub mod listener;
pub mod pump;
pub mod supervisor;
