//! Web listeners.
//!
//! Each web port gets one listener. Depending on the hosts routed on it the
//! port speaks plain HTTP, HTTPS, or both: a mixed port peeks the first byte
//! of every connection and terminates TLS when it is a handshake record.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::ServiceExt;
use tracing::{debug, error, info, Instrument};

use super::ConnectionMeta;
use crate::error::GatewayError;
use crate::proxy::{WebPort, WebPortMode};

/// First byte of a TLS handshake record.
const TLS_HANDSHAKE_RECORD: u8 = 0x16;

/// How long a mixed port waits for the first byte.
const SNIFF_TIMEOUT: Duration = Duration::from_secs(5);

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A bound web port.
pub struct WebListener {
    listener: TcpListener,
    mode: WebPortMode,
    acceptor: Option<TlsAcceptor>,
    router: Router,
}

impl WebListener {
    /// Bind `port`. Ports with TLS hosts need `tls`.
    pub async fn bind(
        port: &WebPort,
        tls: Option<Arc<ServerConfig>>,
        router: Router,
    ) -> Result<Self, GatewayError> {
        let mode = port.mode();
        let acceptor = match (mode, tls) {
            (WebPortMode::Plain, _) => None,
            (_, Some(config)) => Some(TlsAcceptor::from(config)),
            (_, None) => {
                return Err(GatewayError::Tls(format!(
                    "port {} routes TLS hosts but no certificate is loaded",
                    port.port
                )))
            }
        };

        let listener = TcpListener::bind(port.bind_addr)
            .await
            .map_err(|source| GatewayError::Bind {
                addr: port.bind_addr,
                source,
            })?;

        info!(
            bind_addr = %port.bind_addr,
            mode = ?mode,
            tls_hosts = port.tls_hosts,
            plain_hosts = port.plain_hosts,
            "Web listener bound"
        );

        Ok(Self {
            listener,
            mode,
            acceptor,
            router,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn mode(&self) -> WebPortMode {
        self.mode
    }

    /// Accept connections until `shutdown` is cancelled. Open connections
    /// finish their in-flight requests and then close.
    pub async fn run(self, shutdown: CancellationToken, tracker: TaskTracker) {
        let local_addr = match self.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                error!(error = %e, "Web listener has no local address");
                return;
            }
        };
        info!(bind_addr = %local_addr, "Web listener started");

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);

            let span = tracing::debug_span!("web_connection", peer = %peer);
            tracker.spawn(
                handle_connection(
                    stream,
                    peer,
                    local_addr,
                    self.mode,
                    self.acceptor.clone(),
                    self.router.clone(),
                    shutdown.clone(),
                )
                .instrument(span),
            );
        }

        info!(bind_addr = %local_addr, "Web listener closed");
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    local: SocketAddr,
    mode: WebPortMode,
    acceptor: Option<TlsAcceptor>,
    router: Router,
    shutdown: CancellationToken,
) {
    let use_tls = match mode {
        WebPortMode::Plain => false,
        WebPortMode::Tls => true,
        WebPortMode::Mixed => match sniff_tls(&stream, &shutdown).await {
            Some(is_tls) => is_tls,
            None => return,
        },
    };
    let meta = ConnectionMeta {
        peer,
        local,
        tls: use_tls,
    };

    if !use_tls {
        serve_io(stream, meta, router, shutdown).await;
        return;
    }

    let Some(acceptor) = acceptor else {
        return;
    };
    let handshake = tokio::select! {
        _ = shutdown.cancelled() => return,
        handshake = timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)) => handshake,
    };
    match handshake {
        Ok(Ok(tls_stream)) => serve_io(tls_stream, meta, router, shutdown).await,
        Ok(Err(e)) => debug!(error = %e, "TLS handshake failed"),
        Err(_) => debug!("TLS handshake timed out"),
    }
}

/// Peek the first byte. `None` when the client sends nothing in time.
async fn sniff_tls(stream: &TcpStream, shutdown: &CancellationToken) -> Option<bool> {
    let mut first = [0u8; 1];
    let peeked = tokio::select! {
        _ = shutdown.cancelled() => return None,
        peeked = timeout(SNIFF_TIMEOUT, stream.peek(&mut first)) => peeked,
    };
    match peeked {
        Ok(Ok(1)) => Some(first[0] == TLS_HANDSHAKE_RECORD),
        Ok(Ok(_)) => None,
        Ok(Err(e)) => {
            debug!(error = %e, "Peek failed");
            None
        }
        Err(_) => {
            debug!("No data before sniff timeout");
            None
        }
    }
}

async fn serve_io<I>(io: I, meta: ConnectionMeta, router: Router, shutdown: CancellationToken)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |mut req: hyper::Request<Incoming>| {
        req.extensions_mut().insert(meta);
        router.clone().oneshot(req)
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection_with_upgrades(TokioIo::new(io), service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                debug!(error = %e, "Connection closed with error");
            }
            return;
        }
        _ = shutdown.cancelled() => {}
    }

    conn.as_mut().graceful_shutdown();
    if let Err(e) = conn.await {
        debug!(error = %e, "Connection closed with error during shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::Extension;

    async fn meta_echo(Extension(meta): Extension<ConnectionMeta>) -> String {
        format!("tls={}", meta.tls)
    }

    fn web_port(tls_hosts: usize, plain_hosts: usize) -> WebPort {
        WebPort {
            port: 0,
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            tls_hosts,
            plain_hosts,
        }
    }

    #[tokio::test]
    async fn test_tls_port_requires_certificate() {
        let result = WebListener::bind(&web_port(1, 0), None, Router::new()).await;
        assert!(matches!(result, Err(GatewayError::Tls(_))));
    }

    #[tokio::test]
    async fn test_plain_port_serves_and_stops() {
        let router = Router::new().fallback(meta_echo);
        let listener = WebListener::bind(&web_port(0, 1), None, router)
            .await
            .unwrap();
        assert_eq!(listener.mode(), WebPortMode::Plain);
        let addr = listener.local_addr().unwrap();

        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let handle = tokio::spawn(listener.run(shutdown.clone(), tracker.clone()));

        let resp = reqwest::get(format!("http://{}/", addr)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.text().await.unwrap(), "tls=false");

        shutdown.cancel();
        handle.await.unwrap();
        tracker.close();
        timeout(Duration::from_secs(2), tracker.wait()).await.unwrap();
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_mixed_port_sniffs_plain_http() {
        let dir = tempfile::tempdir().unwrap();
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        std::fs::write(&cert_path, certified.cert.pem()).unwrap();
        std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();
        let tls = crate::web::load_server_config(&crate::proxy::TlsPolicy {
            enabled: true,
            cert_file: cert_path.display().to_string(),
            key_file: key_path.display().to_string(),
            domains: vec!["localhost".to_string()],
        })
        .unwrap();

        let router = Router::new().fallback(meta_echo);
        let listener = WebListener::bind(&web_port(1, 1), Some(tls), router)
            .await
            .unwrap();
        assert_eq!(listener.mode(), WebPortMode::Mixed);
        let addr = listener.local_addr().unwrap();

        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        tokio::spawn(listener.run(shutdown.clone(), tracker.clone()));

        let plain = reqwest::get(format!("http://{}/", addr)).await.unwrap();
        assert_eq!(plain.text().await.unwrap(), "tls=false");

        let client = reqwest::Client::builder()
            .resolve("localhost", addr)
            .danger_accept_invalid_certs(true)
            .build()
            .unwrap();
        let secure = client
            .get(format!("https://localhost:{}/", addr.port()))
            .send()
            .await
            .unwrap();
        assert_eq!(secure.text().await.unwrap(), "tls=true");

        shutdown.cancel();
    }
}
