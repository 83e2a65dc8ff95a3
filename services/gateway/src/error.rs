//! Error types for the gateway.

use std::net::SocketAddr;

use thiserror::Error;

/// Conflicting claims found while building the route table.
///
/// Every variant is a startup error: the gateway refuses to run rather than
/// silently picking a winner.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteConflict {
    /// A raw (tcp/udp) endpoint and a web endpoint claim the same port.
    #[error("port {port}: tcp/udp and web endpoints cannot share a port")]
    RawAndWeb { port: u16 },

    /// Two raw endpoints claim the same port.
    #[error("port {port}: multiple tcp/udp endpoints on one port, use protocol \"web\" for host routing")]
    DuplicateRaw { port: u16 },

    /// The same host is claimed on one port over both http and https.
    #[error("port {port}: host '{host}' cannot be served as both http and https")]
    MixedTls { port: u16, host: String },

    /// The same host is claimed on one port by two different routes.
    #[error("port {port}: host '{host}' is claimed by two different routes")]
    DuplicateHost { port: u16, host: String },

    /// Web endpoints on one port disagree about the bind address.
    #[error("port {port}: web endpoints bind different addresses ({first} and {second})")]
    BindMismatch {
        port: u16,
        first: SocketAddr,
        second: SocketAddr,
    },

    /// An endpoint is missing a field its protocol requires.
    #[error("invalid endpoint on port {port}: {detail}")]
    InvalidEndpoint { port: u16, detail: String },
}

/// Gateway errors with standardized reason codes.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Route table construction failed.
    #[error("route_conflict: {0}")]
    Route(#[from] RouteConflict),

    /// A listener could not bind its address.
    #[error("bind_failed: {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// TLS material could not be loaded.
    #[error("tls_config_failed: {0}")]
    Tls(String),

    /// Configuration could not be parsed or expanded.
    #[error("config_invalid: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            GatewayError::Route(_) => "route_conflict",
            GatewayError::Bind { .. } => "bind_failed",
            GatewayError::Tls(_) => "tls_config_failed",
            GatewayError::Config(_) => "config_invalid",
            GatewayError::Io(_) => "io_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes() {
        let err = GatewayError::from(RouteConflict::DuplicateRaw { port: 25565 });
        assert_eq!(err.reason_code(), "route_conflict");
        assert!(err.to_string().contains("25565"));

        let err = GatewayError::Config("bad range".to_string());
        assert_eq!(err.reason_code(), "config_invalid");
    }
}
