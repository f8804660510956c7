//! Backend discovery
//!
//! The backend pair binds fresh ports on every restart. Its RPC port and auth
//! token are read from the process table, the UI port is found by probing a
//! short list of candidates, and the loopback ports it listens on come from
//! the socket table.

use crate::config::DiscoveryConfig;
use crate::control::run_checked;
use crate::error::DiscoveryError;
use crate::routes::RouteTable;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::Instant;
use tracing::{debug, info};

/// Source of the raw process and socket tables
#[async_trait]
pub trait SystemInspector: Send + Sync {
    /// Process list with full command lines
    async fn process_table(&self) -> Result<String, DiscoveryError>;
    /// Listening sockets with their owning process names
    async fn socket_table(&self) -> Result<String, DiscoveryError>;
}

/// [`SystemInspector`] running the configured `ps`/`ss` commands
pub struct CommandInspector {
    process_command: String,
    socket_command: String,
    timeout: Duration,
}

impl CommandInspector {
    pub fn new(config: &DiscoveryConfig) -> Self {
        Self {
            process_command: config.process_command.clone(),
            socket_command: config.socket_command.clone(),
            timeout: config.inspect_timeout(),
        }
    }
}

#[async_trait]
impl SystemInspector for CommandInspector {
    async fn process_table(&self) -> Result<String, DiscoveryError> {
        Ok(run_checked(&self.process_command, &[], self.timeout).await?.stdout)
    }

    async fn socket_table(&self) -> Result<String, DiscoveryError> {
        Ok(run_checked(&self.socket_command, &[], self.timeout).await?.stdout)
    }
}

/// Where the backend currently lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredEndpoint {
    pub rpc_port: Option<u16>,
    pub auth_token: Option<String>,
    pub ui_port: u16,
    pub discovered_at: DateTime<Utc>,
}

impl DiscoveredEndpoint {
    /// First 16 characters of the token followed by `...`
    pub fn token_preview(&self) -> Option<String> {
        self.auth_token
            .as_ref()
            .map(|t| format!("{}...", t.chars().take(16).collect::<String>()))
    }
}

/// RPC port and token read from a single process-table line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessMatch {
    pub rpc_port: u16,
    pub auth_token: Option<String>,
}

/// Value following `name` on a command line, as `name value`, `--name value`
/// or `--name=value`.
fn argument_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let mut words = line.split_whitespace();
    while let Some(word) = words.next() {
        let bare = word.trim_start_matches('-');
        if bare == name {
            return words.next();
        }
        if let Some(value) = bare.strip_prefix(name).and_then(|r| r.strip_prefix('=')) {
            return Some(value);
        }
    }
    None
}

fn leading_port(value: &str) -> Option<u16> {
    let end = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    value[..end].parse().ok()
}

fn leading_token(value: &str) -> Option<String> {
    let token: String = value
        .chars()
        .take_while(|c| c.is_ascii_hexdigit() || *c == '-')
        .collect();
    (!token.is_empty()).then_some(token)
}

/// Pick the backend's RPC process out of a `ps`-style listing.
///
/// A line carrying the workspace marker wins (the first one found);
/// otherwise the last matching line is used.
pub fn parse_process_table(text: &str, config: &DiscoveryConfig) -> Option<ProcessMatch> {
    let mut chosen = None;

    for line in text.lines() {
        if !line.contains(&config.process_token) || !line.contains(&config.port_argument) {
            continue;
        }
        let Some(rpc_port) = argument_value(line, &config.port_argument).and_then(leading_port)
        else {
            continue;
        };
        let auth_token = if config.token_argument.is_empty() {
            None
        } else {
            argument_value(line, &config.token_argument).and_then(leading_token)
        };

        chosen = Some(ProcessMatch {
            rpc_port,
            auth_token,
        });
        if !config.workspace_marker.is_empty() && line.contains(&config.workspace_marker) {
            break;
        }
    }

    chosen
}

/// Ports bound on `listen_host` by processes whose line mentions `process_token`
pub fn parse_listening_ports(text: &str, process_token: &str, listen_host: &str) -> BTreeSet<u16> {
    let needle = format!("{}:", listen_host);
    let mut ports = BTreeSet::new();

    for line in text.lines().filter(|l| l.contains(process_token)) {
        let mut rest = line;
        while let Some(idx) = rest.find(&needle) {
            rest = &rest[idx + needle.len()..];
            if let Some(port) = leading_port(rest) {
                ports.insert(port);
            }
        }
    }

    ports
}

/// Address other machines use to reach this host.
///
/// Connecting a UDP socket sends no packets but selects the outbound
/// interface; falls back to loopback when there is no route.
pub async fn detect_external_ip() -> IpAddr {
    async fn outbound() -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect("8.8.8.8:80").await?;
        Ok(socket.local_addr()?.ip())
    }

    match outbound().await {
        Ok(ip) if !ip.is_unspecified() => ip,
        Ok(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        Err(e) => {
            debug!(error = %e, "No outbound route, using loopback");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

struct CachedEndpoint {
    endpoint: DiscoveredEndpoint,
    refreshed_at: Instant,
}

/// Owner of the discovered endpoint
pub struct Discovery {
    config: DiscoveryConfig,
    inspector: Arc<dyn SystemInspector>,
    routes: Arc<RouteTable>,
    cache: RwLock<Option<CachedEndpoint>>,
    // When the last inspection found nothing; debounced like a success
    failed_at: Mutex<Option<Instant>>,
    // Serializes inspections so concurrent requests share one refresh
    refresh_lock: tokio::sync::Mutex<()>,
}

impl Discovery {
    pub fn new(
        config: DiscoveryConfig,
        inspector: Arc<dyn SystemInspector>,
        routes: Arc<RouteTable>,
    ) -> Self {
        Self {
            config,
            inspector,
            routes,
            cache: RwLock::new(None),
            failed_at: Mutex::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// The cached endpoint, without inspecting anything
    pub fn get(&self) -> Option<DiscoveredEndpoint> {
        self.cache.read().as_ref().map(|c| c.endpoint.clone())
    }

    fn fresh(&self) -> Option<DiscoveredEndpoint> {
        let cache = self.cache.read();
        cache
            .as_ref()
            .filter(|c| c.refreshed_at.elapsed() < self.config.debounce())
            .map(|c| c.endpoint.clone())
    }

    /// Result of an inspection still inside the debounce window
    fn debounced(&self) -> Option<Result<DiscoveredEndpoint, DiscoveryError>> {
        if let Some(endpoint) = self.fresh() {
            return Some(Ok(endpoint));
        }
        let failed_at = *self.failed_at.lock();
        failed_at
            .filter(|at| at.elapsed() < self.config.debounce())
            .map(|_| Err(DiscoveryError::NotFound))
    }

    /// Re-inspect the system unless the cache is younger than the debounce
    /// interval. A failed inspection is debounced too and reported as
    /// [`DiscoveryError::NotFound`] until the interval passes. `force` skips
    /// the debounce.
    pub async fn refresh(&self, force: bool) -> Result<DiscoveredEndpoint, DiscoveryError> {
        if !force {
            if let Some(result) = self.debounced() {
                return result;
            }
        }

        let _guard = self.refresh_lock.lock().await;
        if !force {
            if let Some(result) = self.debounced() {
                return result;
            }
        }

        let result = self.inspect().await;
        *self.failed_at.lock() = result.is_err().then(Instant::now);
        result
    }

    async fn inspect(&self) -> Result<DiscoveredEndpoint, DiscoveryError> {
        let table = self.inspector.process_table().await?;
        let process = parse_process_table(&table, &self.config);
        let ui_port = self.probe_ui_ports().await;

        if process.is_none() && ui_port.is_none() {
            debug!("No backend process or UI port found");
            return Err(DiscoveryError::NotFound);
        }

        let previous = self.get();
        let (rpc_port, auth_token) = match process {
            Some(m) => (Some(m.rpc_port), m.auth_token),
            // Keep the last known RPC address while the process listing misses it
            None => previous
                .as_ref()
                .map(|p| (p.rpc_port, p.auth_token.clone()))
                .unwrap_or((None, None)),
        };
        let ui_port = ui_port
            .or(previous.as_ref().map(|p| p.ui_port))
            .unwrap_or_else(|| self.config.fallback_ui_port());

        let endpoint = DiscoveredEndpoint {
            rpc_port,
            auth_token,
            ui_port,
            discovered_at: Utc::now(),
        };

        let changed = previous.as_ref().map_or(true, |p| {
            p.rpc_port != endpoint.rpc_port
                || p.ui_port != endpoint.ui_port
                || p.auth_token != endpoint.auth_token
        });
        if changed {
            info!(
                rpc_port = ?endpoint.rpc_port,
                ui_port = endpoint.ui_port,
                token = endpoint.token_preview().as_deref().unwrap_or("none"),
                "Backend discovered"
            );
        }

        self.routes.apply_endpoint(&endpoint);
        *self.cache.write() = Some(CachedEndpoint {
            endpoint: endpoint.clone(),
            refreshed_at: Instant::now(),
        });

        Ok(endpoint)
    }

    /// First candidate UI port that accepts a TCP connection
    async fn probe_ui_ports(&self) -> Option<u16> {
        for &port in &self.config.ui_ports {
            let addr = (self.config.listen_host.as_str(), port);
            match tokio::time::timeout(self.config.connect_timeout(), TcpStream::connect(addr)).await {
                Ok(Ok(_)) => return Some(port),
                Ok(Err(e)) => debug!(port, error = %e, "UI port not accepting"),
                Err(_) => debug!(port, "UI port probe timed out"),
            }
        }
        None
    }

    /// Loopback ports the backend process currently listens on
    pub async fn listening_ports(&self) -> Result<BTreeSet<u16>, DiscoveryError> {
        let table = self.inspector.socket_table().await?;
        Ok(parse_listening_ports(
            &table,
            &self.config.process_token,
            &self.config.listen_host,
        ))
    }

    /// Fill in RPC port and token learned from an embedded configuration
    /// blob. Values already known from the process table are kept.
    pub fn observe_embedded(&self, rpc_port: Option<u16>, auth_token: Option<String>) {
        let updated = {
            let mut cache = self.cache.write();
            let Some(cached) = cache.as_mut() else {
                return;
            };
            let endpoint = &mut cached.endpoint;
            let mut updated = false;
            if endpoint.rpc_port.is_none() && rpc_port.is_some() {
                endpoint.rpc_port = rpc_port;
                updated = true;
            }
            if endpoint.auth_token.is_none() && auth_token.is_some() {
                endpoint.auth_token = auth_token;
                updated = true;
            }
            updated.then(|| endpoint.clone())
        };

        if let Some(endpoint) = updated {
            info!(rpc_port = ?endpoint.rpc_port, "Backend address learned from UI document");
            self.routes.apply_endpoint(&endpoint);
        }
    }
}
