//! Keep-alive session: a server-sent event stream that holds the client's
//! whitelist entry for as long as it stays open.
//!
//! Wire format:
//! - `: ok` comment right after the stream opens
//! - `event: ping` with the current unix time in milliseconds as data, once
//!   per heartbeat interval
//! - `event: close` with `{"reason":"server shutdown"}` when the gateway
//!   stops
//!
//! When the stream ends for any reason the client's IP is revoked, which also
//! closes its raw connections.

use std::convert::Infallible;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::{header, HeaderValue, Method},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

use super::{ApiError, WebState};
use crate::firewall::AccessRegistry;

/// Default interval between `ping` events.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How long the `close` event gets to reach the client before the stream ends.
pub const CLOSE_GRACE: Duration = Duration::from_millis(100);

const SHUTDOWN_PAYLOAD: &str = r#"{"reason":"server shutdown"}"#;

type EventSender = mpsc::Sender<Result<Event, Infallible>>;

/// Open a keep-alive stream for `client_ip`.
///
/// Only whitelisted clients may open one; authenticate first. `secure` is
/// whether the portal was reached over TLS and picks the allowed origin's
/// scheme.
pub(crate) fn open(
    state: &WebState,
    method: &Method,
    client_ip: IpAddr,
    secure: bool,
) -> Response {
    if method != Method::GET {
        return ApiError::method_not_allowed().into_response();
    }
    if !state.registry.check_only(client_ip) {
        info!(client_ip = %client_ip, "Keep-alive refused for client without whitelist entry");
        return ApiError::unauthorized().into_response();
    }

    let (tx, rx) = mpsc::channel(8);
    if tx.try_send(Ok(Event::default().comment("ok"))).is_err() {
        return ApiError::internal().into_response();
    }

    // The stream owns the entry from here on.
    state.registry.grant(client_ip);
    let lease = Lease {
        registry: Arc::clone(&state.registry),
        ip: client_ip,
    };

    let span = info_span!("keepalive", client_ip = %client_ip);
    state.sessions.spawn(
        run_session(
            tx,
            lease,
            state.shutdown.clone(),
            state.heartbeat_interval,
        )
        .instrument(span),
    );
    info!(client_ip = %client_ip, "Keep-alive session opened");

    let mut response = Sse::new(ReceiverStream::new(rx)).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    let scheme = if secure { "https" } else { "http" };
    if let Some(origin) = state
        .portal
        .as_ref()
        .and_then(|portal| HeaderValue::from_str(&format!("{}://{}", scheme, portal.host)).ok())
    {
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    }
    response
}

/// Holds a client's whitelist entry; dropping it revokes the IP.
struct Lease {
    registry: Arc<AccessRegistry>,
    ip: IpAddr,
}

impl Drop for Lease {
    fn drop(&mut self) {
        let closed = self.registry.revoke(self.ip);
        info!(
            client_ip = %self.ip,
            closed_connections = closed,
            "Keep-alive session ended, access revoked"
        );
    }
}

async fn run_session(
    tx: EventSender,
    _lease: Lease,
    shutdown: CancellationToken,
    heartbeat: Duration,
) {
    let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let close = Event::default().event("close").data(SHUTDOWN_PAYLOAD);
                if tx.try_send(Ok(close)).is_ok() {
                    tokio::select! {
                        _ = tokio::time::sleep(CLOSE_GRACE) => {}
                        _ = tx.closed() => {}
                    }
                }
                debug!("Keep-alive session closed by shutdown");
                return;
            }
            _ = tx.closed() => {
                debug!("Keep-alive client disconnected");
                return;
            }
            _ = ticker.tick() => {
                let now = chrono::Utc::now().timestamp_millis();
                let ping = Event::default().event("ping").data(now.to_string());
                // A full queue means the client stopped reading; the session
                // must not wait on it.
                match tx.try_send(Ok(ping)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        info!("Keep-alive client stopped reading, ending session");
                        return;
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!("Keep-alive client gone during ping");
                        return;
                    }
                }
            }
        }
    }
}
