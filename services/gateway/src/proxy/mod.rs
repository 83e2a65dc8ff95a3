//! Raw (L4) proxying and route resolution.
//!
//! This module provides:
//! - The immutable route table and its conflict checks
//! - TCP and UDP listeners gated by the firewall
//! - Upstream dialing with a connect timeout
//! - The bidirectional splice used by TCP sessions
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Firewall (admit + register) -> Backend dial -> Splice
//!                                |
//!                     revoke cancels the session token
//! ```

mod backend;
mod listener;
mod router;
mod splice;
mod udp;

pub use backend::{Backend, DEFAULT_CONNECT_TIMEOUT};
pub use listener::{Listener, ListenerConfig, ListenerStats, DEFAULT_MAX_CONNECTIONS};
pub use router::{
    Endpoint, FuncRoute, Protocol, RouteDescriptor, RouteFlags, RouteKey, RouteKind, RouteTable,
    TlsPolicy, WebPort, WebPortMode,
};
pub use splice::{splice, SpliceStats};
pub use udp::{udp_config, UdpListener, DEFAULT_UDP_IDLE_TIMEOUT};
