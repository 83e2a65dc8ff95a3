//! Gateway configuration.
//!
//! Two layers:
//! - [`Config`]: process settings from the environment (where the gateway
//!   file lives, log level, timeouts)
//! - [`GatewayFile`]: the JSON gateway file (proxies, TLS, firewall, portal,
//!   logging), expanded into [`Endpoint`]s before the route table is built

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::GatewayError;
use crate::firewall::FirewallPolicy;
use crate::proxy::{Endpoint, Protocol, RouteTable, TlsPolicy};

/// Gateway configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the gateway file.
    pub config_path: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// How long shutdown waits for listeners and sessions.
    pub shutdown_timeout: Duration,

    /// Keep-alive stream heartbeat interval.
    pub heartbeat_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let config_path = std::env::var("MAZARIN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.json"));

        let log_level = std::env::var("MAZARIN_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let shutdown_timeout_ms: u64 = std::env::var("MAZARIN_SHUTDOWN_TIMEOUT_MS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("MAZARIN_SHUTDOWN_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(5000);

        let heartbeat_secs: u64 = std::env::var("MAZARIN_HEARTBEAT_INTERVAL_SECS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("MAZARIN_HEARTBEAT_INTERVAL_SECS must be an integer (seconds).")?
            .unwrap_or(30);

        Ok(Self {
            config_path,
            log_level,
            shutdown_timeout: Duration::from_millis(shutdown_timeout_ms),
            heartbeat_interval: Duration::from_secs(heartbeat_secs.max(1)),
        })
    }
}

/// One `proxies` entry, before expansion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProxyEntry {
    pub listen_url: String,
    pub listen_urls: Vec<String>,
    pub port: String,
    pub ports: Vec<String>,
    pub target_addr: String,
    #[serde(rename = "type")]
    pub route_type: String,
    pub protocol: String,
    pub allow_insecure: bool,
    pub no_headers: bool,
    pub headers: BTreeMap<String, String>,
    /// Path prefix stripped before forwarding or serving.
    pub path: String,
}

/// Portal settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WebserverSettings {
    pub enable_webserver: bool,
    pub listen_port: String,
    pub listen_url: String,
    pub static_dir: PathBuf,
    pub keys_dir: PathBuf,
}

/// File logging settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub enable_logging: bool,
    pub log_dir: PathBuf,
}

/// The JSON gateway file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GatewayFile {
    pub proxies: Vec<ProxyEntry>,
    pub tls: TlsPolicy,
    pub firewall: FirewallPolicy,
    pub webserver: WebserverSettings,
    pub logging: LoggingSettings,
}

impl GatewayFile {
    /// Read and parse the gateway file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read gateway file {}", path.display()))?;
        Self::from_json(&raw)
            .with_context(|| format!("Failed to parse gateway file {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Expand every entry into endpoints, adding the portal endpoint when
    /// the portal is enabled.
    pub fn endpoints(&self) -> std::result::Result<Vec<Endpoint>, GatewayError> {
        let mut entries = expand_entries(&self.proxies)?;

        if self.webserver.enable_webserver {
            entries.push(ProxyEntry {
                listen_url: self.webserver.listen_url.clone(),
                port: self.webserver.listen_port.clone(),
                route_type: "func".to_string(),
                protocol: "web".to_string(),
                ..ProxyEntry::default()
            });
        }

        entries.iter().map(to_endpoint).collect()
    }

    /// Normalized portal host, when the portal is enabled.
    pub fn portal_host(&self) -> Option<String> {
        self.webserver
            .enable_webserver
            .then(|| RouteTable::normalize_hostname(&self.webserver.listen_url))
    }
}

/// Fan out `listen_urls`, then `ports`, then `start-end` port ranges.
///
/// Every other field is copied unchanged. Range bounds are inclusive and the
/// start must be lower than the end.
pub fn expand_entries(entries: &[ProxyEntry]) -> std::result::Result<Vec<ProxyEntry>, GatewayError> {
    let after_urls = entries.iter().flat_map(|entry| {
        if entry.listen_urls.is_empty() {
            vec![entry.clone()]
        } else {
            entry
                .listen_urls
                .iter()
                .map(|url| ProxyEntry {
                    listen_url: url.clone(),
                    ..entry.clone()
                })
                .collect()
        }
    });

    let after_ports: Vec<ProxyEntry> = after_urls
        .flat_map(|entry| {
            if entry.ports.is_empty() {
                vec![entry]
            } else {
                entry
                    .ports
                    .iter()
                    .map(|port| ProxyEntry {
                        port: port.clone(),
                        ..entry.clone()
                    })
                    .collect()
            }
        })
        .collect();

    let mut expanded = Vec::with_capacity(after_ports.len());
    for entry in after_ports {
        match port_range(&entry.port)? {
            Some((start, end)) => {
                for port in start..=end {
                    expanded.push(ProxyEntry {
                        port: format!(":{}", port),
                        ..entry.clone()
                    });
                }
            }
            None => expanded.push(entry),
        }
    }
    Ok(expanded)
}

fn port_range(port: &str) -> std::result::Result<Option<(u16, u16)>, GatewayError> {
    let Some((start, end)) = port.trim().trim_start_matches(':').split_once('-') else {
        return Ok(None);
    };
    let parse = |value: &str| {
        value
            .trim()
            .parse::<u16>()
            .map_err(|_| GatewayError::Config(format!("invalid port range '{}'", port)))
    };
    let (start, end) = (parse(start)?, parse(end)?);
    if start >= end {
        return Err(GatewayError::Config(format!(
            "port range '{}' must start lower than it ends",
            port
        )));
    }
    Ok(Some((start, end)))
}

/// Parse a listen address: `:8080` and `8080` bind every interface.
pub fn parse_listen_addr(port: &str) -> std::result::Result<SocketAddr, GatewayError> {
    let port = port.trim();
    let invalid = || GatewayError::Config(format!("invalid listen address '{}'", port));

    if let Some(bare) = port.strip_prefix(':') {
        let port: u16 = bare.parse().map_err(|_| invalid())?;
        return Ok((Ipv4Addr::UNSPECIFIED, port).into());
    }
    if let Ok(port) = port.parse::<u16>() {
        return Ok((Ipv4Addr::UNSPECIFIED, port).into());
    }
    port.parse().map_err(|_| invalid())
}

fn to_endpoint(entry: &ProxyEntry) -> std::result::Result<Endpoint, GatewayError> {
    let protocol = match entry.protocol.trim() {
        "tcp" => Protocol::Tcp,
        "udp" => Protocol::Udp,
        "web" => Protocol::Web,
        other => {
            return Err(GatewayError::Config(format!(
                "unknown protocol '{}' for port '{}'",
                other, entry.port
            )))
        }
    };
    let listen_addr = parse_listen_addr(&entry.port)?;

    let mut endpoint = match protocol {
        Protocol::Web => Endpoint::web(
            listen_addr,
            entry.listen_url.clone(),
            entry.route_type.clone(),
            entry.target_addr.clone(),
        ),
        raw => Endpoint::raw(raw, listen_addr, entry.target_addr.clone()),
    };
    endpoint.allow_insecure = entry.allow_insecure;
    endpoint.no_headers = entry.no_headers;
    endpoint.headers = entry.headers.clone();
    endpoint.strip_prefix = (!entry.path.is_empty()).then(|| entry.path.clone());
    if protocol == Protocol::Web && entry.route_type.trim().is_empty() {
        endpoint.route_type = None;
    }
    Ok(endpoint)
}
