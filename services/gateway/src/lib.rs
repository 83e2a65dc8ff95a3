//! Mazarin gateway library.
//!
//! A self-hosted gateway that forwards raw TCP/UDP ports and routes HTTP(S)
//! by host, behind an IP whitelist firewall. Clients get on the whitelist by
//! authenticating at the portal and stay on it while their keep-alive stream
//! is open.

pub mod auth;
pub mod config;
pub mod error;
pub mod firewall;
pub mod gateway;
pub mod logging;
pub mod proxy;
pub mod web;

pub use auth::{Authenticator, KeyFile};
pub use error::{GatewayError, Result, RouteConflict};
pub use firewall::{AccessRegistry, FirewallPolicy};
pub use gateway::{BoundListener, Gateway, GatewaySettings};
pub use proxy::{Endpoint, Protocol, RouteTable, TlsPolicy};
