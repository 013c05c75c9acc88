//! The inherited listening socket and the byte streams it produces

use crate::error::GateError;
use listenfd::ListenFd;
use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tracing::info;

/// Index of the socket taken from the activation hand-off
const ACTIVATED_FD_INDEX: usize = 0;

/// A connected byte stream on either side of a pair
pub trait Endpoint: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Endpoint for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Boxed endpoint so TCP and Unix streams can share one pump
pub type BoxedEndpoint = Box<dyn Endpoint>;

/// The sole accept source
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
    /// Fails every accept with the given error kind
    #[cfg(test)]
    Failing(io::ErrorKind),
}

impl Listener {
    /// Take over the first socket passed via `LISTEN_FDS`.
    ///
    /// The descriptor is tried as a TCP listener first, then as a Unix
    /// stream listener.
    pub fn from_activation() -> Result<Self, GateError> {
        let mut fds = ListenFd::from_env();
        if fds.len() == 0 {
            return Err(GateError::Listener(
                "no sockets passed (LISTEN_FDS unset or for another process)".to_string(),
            ));
        }
        if fds.len() > 1 {
            info!(count = fds.len(), "Multiple sockets passed, using the first");
        }

        let tcp_err = match fds.take_tcp_listener(ACTIVATED_FD_INDEX) {
            Ok(Some(std_listener)) => {
                std_listener
                    .set_nonblocking(true)
                    .map_err(|e| GateError::Listener(e.to_string()))?;
                let listener = TcpListener::from_std(std_listener)
                    .map_err(|e| GateError::Listener(e.to_string()))?;
                return Ok(Self::Tcp(listener));
            }
            Ok(None) => {
                return Err(GateError::Listener(
                    "activated socket was already taken".to_string(),
                ))
            }
            Err(e) => e,
        };

        match fds.take_unix_listener(ACTIVATED_FD_INDEX) {
            Ok(Some(std_listener)) => {
                std_listener
                    .set_nonblocking(true)
                    .map_err(|e| GateError::Listener(e.to_string()))?;
                let listener = UnixListener::from_std(std_listener)
                    .map_err(|e| GateError::Listener(e.to_string()))?;
                Ok(Self::Unix(listener))
            }
            Ok(None) => Err(GateError::Listener(
                "activated socket was already taken".to_string(),
            )),
            Err(unix_err) => Err(GateError::Listener(format!(
                "activated socket is neither a TCP ({}) nor a Unix stream ({}) listener",
                tcp_err, unix_err
            ))),
        }
    }

    /// Wait for the next inbound connection
    pub async fn accept(&self) -> io::Result<(BoxedEndpoint, Peer)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                let _ = stream.set_nodelay(true);
                Ok((Box::new(stream), Peer::Tcp(addr)))
            }
            Listener::Unix(listener) => {
                let (stream, _addr) = listener.accept().await?;
                Ok((Box::new(stream), Peer::Unix))
            }
            #[cfg(test)]
            Listener::Failing(kind) => Err(io::Error::from(*kind)),
        }
    }

    /// Human-readable local address for logging
    pub fn local_addr(&self) -> String {
        match self {
            Listener::Tcp(listener) => listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "tcp:?".to_string()),
            Listener::Unix(listener) => listener
                .local_addr()
                .ok()
                .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
                .unwrap_or_else(|| "unix:(unnamed)".to_string()),
            #[cfg(test)]
            Listener::Failing(_) => "failing".to_string(),
        }
    }
}

impl From<TcpListener> for Listener {
    fn from(listener: TcpListener) -> Self {
        Listener::Tcp(listener)
    }
}

impl From<UnixListener> for Listener {
    fn from(listener: UnixListener) -> Self {
        Listener::Unix(listener)
    }
}

/// Remote side of an accepted connection
#[derive(Debug, Clone)]
pub enum Peer {
    Tcp(std::net::SocketAddr),
    Unix,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Peer::Tcp(addr) => write!(f, "{}", addr),
            Peer::Unix => write!(f, "unix"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpStream, UnixStream};

    #[tokio::test]
    async fn test_tcp_accept() {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        let listener = Listener::from(tcp);
        assert_eq!(listener.local_addr(), addr.to_string());

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"hi").await.unwrap();
        });

        let (mut endpoint, peer) = listener.accept().await.unwrap();
        assert!(matches!(peer, Peer::Tcp(_)));
        let mut buf = [0u8; 2];
        endpoint.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_unix_accept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gate.sock");
        let listener = Listener::from(UnixListener::bind(&path).unwrap());
        assert_eq!(listener.local_addr(), path.display().to_string());

        let client_path = path.clone();
        let client = tokio::spawn(async move { UnixStream::connect(client_path).await.unwrap() });

        let (_endpoint, peer) = listener.accept().await.unwrap();
        assert_eq!(peer.to_string(), "unix");
        client.await.unwrap();
    }
}
