//! Upstream dialing for raw routes.
//!
//! - TCP targets are connected with a bounded connect timeout
//! - UDP targets get a fresh connected socket per client peer
//! - Targets are `host:port` strings resolved at dial time

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::debug;

/// Default connect timeout for upstream connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// A raw forwarding target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    /// Target address as configured (`host:port`).
    pub addr: String,
    /// Connect timeout.
    pub connect_timeout: Duration,
}

impl Backend {
    /// Create a backend with the default connect timeout.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Override the connect timeout.
    pub fn with_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Open a TCP connection to the target.
    pub async fn connect_tcp(&self) -> io::Result<TcpStream> {
        debug!(backend_addr = %self.addr, "Connecting to backend");

        match timeout(self.connect_timeout, TcpStream::connect(self.addr.as_str())).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
        }
    }

    /// Open a UDP socket connected to the target.
    pub async fn connect_udp(&self) -> io::Result<UdpSocket> {
        debug!(backend_addr = %self.addr, "Connecting UDP socket to backend");

        let connect = async {
            let target = self.resolve().await?;
            let local: SocketAddr = if target.is_ipv4() {
                (Ipv4Addr::UNSPECIFIED, 0).into()
            } else {
                (Ipv6Addr::UNSPECIFIED, 0).into()
            };
            let socket = UdpSocket::bind(local).await?;
            socket.connect(target).await?;
            Ok(socket)
        };

        match timeout(self.connect_timeout, connect).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
        }
    }

    async fn resolve(&self) -> io::Result<SocketAddr> {
        lookup_host(self.addr.as_str()).await?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address found for {}", self.addr),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let backend = Backend::new(addr.to_string());
        let stream = backend.connect_tcp().await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn test_connect_tcp_refused() {
        // Bind then drop to find a port with nothing listening.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let backend = Backend::new(addr.to_string()).with_timeout(Duration::from_millis(500));
        assert!(backend.connect_tcp().await.is_err());
    }

    #[tokio::test]
    async fn test_connect_udp() {
        let target = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = target.local_addr().unwrap();

        let socket = Backend::new(addr.to_string()).connect_udp().await.unwrap();
        socket.send(b"ping").await.unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = target.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, socket.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_unresolvable_target() {
        let backend = Backend::new("not-an-address");
        assert!(backend.connect_udp().await.is_err());
    }
}
