//! Backend dialing with a bounded number of fixed-delay retries

use crate::config::Config;
use crate::error::DialError;
use crate::listener::BoxedEndpoint;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::{TcpStream, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Where backend connections go, parsed once from mode and address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendAddr {
    /// `host:port`, any address family
    Tcp(String),
    /// `host:port`, IPv4 addresses only
    Tcp4(String),
    /// `host:port`, IPv6 addresses only
    Tcp6(String),
    /// Filesystem path of a stream socket
    Unix(PathBuf),
}

impl BackendAddr {
    pub fn parse(mode: &str, address: &str) -> Result<Self, DialError> {
        let invalid = |reason: &str| DialError::InvalidAddress {
            mode: mode.to_string(),
            address: address.to_string(),
            reason: reason.to_string(),
        };

        if address.is_empty() {
            return Err(invalid("address is empty"));
        }

        match mode {
            "tcp" | "tcp4" | "tcp6" => {
                let (host, port) = address
                    .rsplit_once(':')
                    .ok_or_else(|| invalid("expected host:port"))?;
                if port.parse::<u16>().is_err() {
                    return Err(invalid("port is not a number in 0-65535"));
                }
                if host.is_empty() {
                    return Err(invalid("host is empty"));
                }
                let address = address.to_string();
                Ok(match mode {
                    "tcp4" => BackendAddr::Tcp4(address),
                    "tcp6" => BackendAddr::Tcp6(address),
                    _ => BackendAddr::Tcp(address),
                })
            }
            "unix" => Ok(BackendAddr::Unix(PathBuf::from(address))),
            _ => Err(invalid("unsupported mode")),
        }
    }

    /// Open one connection, trying every resolved address in turn
    pub async fn connect(&self) -> io::Result<BoxedEndpoint> {
        match self {
            BackendAddr::Tcp(addr) => connect_tcp(addr, |_| true).await,
            BackendAddr::Tcp4(addr) => connect_tcp(addr, |a| a.is_ipv4()).await,
            BackendAddr::Tcp6(addr) => connect_tcp(addr, |a| a.is_ipv6()).await,
            BackendAddr::Unix(path) => {
                let stream = UnixStream::connect(path).await?;
                Ok(Box::new(stream))
            }
        }
    }
}

impl fmt::Display for BackendAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendAddr::Tcp(a) => write!(f, "tcp://{}", a),
            BackendAddr::Tcp4(a) => write!(f, "tcp4://{}", a),
            BackendAddr::Tcp6(a) => write!(f, "tcp6://{}", a),
            BackendAddr::Unix(p) => write!(f, "unix://{}", p.display()),
        }
    }
}

async fn connect_tcp(
    addr: &str,
    family: impl Fn(&SocketAddr) -> bool,
) -> io::Result<BoxedEndpoint> {
    let mut last_err = None;
    for candidate in tokio::net::lookup_host(addr).await?.filter(|a| family(a)) {
        match TcpStream::connect(candidate).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                return Ok(Box::new(stream));
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no address of the requested family for {}", addr),
        )
    }))
}

/// Attempt bound and constant pause between failed attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay: Duration::from_millis(100),
        }
    }
}

/// Dials the fixed backend address with retries
#[derive(Debug, Clone)]
pub struct RetryDialer {
    addr: BackendAddr,
    policy: RetryPolicy,
}

impl RetryDialer {
    pub fn new(addr: BackendAddr, policy: RetryPolicy) -> Self {
        Self { addr, policy }
    }

    pub fn from_config(config: &Config) -> Result<Self, DialError> {
        let addr = BackendAddr::parse(&config.mode, &config.address)?;
        Ok(Self::new(
            addr,
            RetryPolicy {
                max_attempts: config.retries,
                delay: config.retry_delay,
            },
        ))
    }

    pub fn addr(&self) -> &BackendAddr {
        &self.addr
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Return the first successful connection, or `Exhausted` once
    /// `max_attempts` attempts have failed. Sleeps `delay` between
    /// failures, never after the last one. Stops early with `Cancelled`
    /// when `shutdown` fires.
    pub async fn dial(&self, shutdown: &CancellationToken) -> Result<BoxedEndpoint, DialError> {
        let max_attempts = self.policy.max_attempts;
        let mut last_err = io::Error::other("no dial attempted");

        for attempt in 1..=max_attempts {
            let result = tokio::select! {
                _ = shutdown.cancelled() => return Err(DialError::Cancelled),
                result = self.addr.connect() => result,
            };

            match result {
                Ok(stream) => {
                    debug!(backend = %self.addr, attempt, "Connected to backend");
                    return Ok(stream);
                }
                Err(e) => {
                    debug!(backend = %self.addr, attempt, max_attempts, error = %e, "Backend dial failed");
                    last_err = e;
                }
            }

            if attempt < max_attempts {
                tokio::select! {
                    _ = shutdown.cancelled() => return Err(DialError::Cancelled),
                    _ = tokio::time::sleep(self.policy.delay) => {}
                }
            }
        }

        warn!(backend = %self.addr, attempts = max_attempts, error = %last_err, "Giving up on backend");
        Err(DialError::Exhausted {
            attempts: max_attempts,
            source: last_err,
        })
    }
}
