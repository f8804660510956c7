use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Listening ports and their upstreams (defaults to UI 8890 + RPC 8891)
    #[serde(default = "default_routes")]
    pub routes: Vec<RouteConfig>,

    /// How the backend is located on this machine
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Embedded client configuration rewriting
    #[serde(default)]
    pub rewrite: RewriteConfig,

    /// Liveness probing and recovery
    #[serde(default)]
    pub health: HealthConfig,

    /// Push channel and send endpoint
    #[serde(default)]
    pub observe: ObserveConfig,

    /// External collaborator commands
    #[serde(default)]
    pub control: ControlConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            routes: default_routes(),
            discovery: DiscoveryConfig::default(),
            rewrite: RewriteConfig::default(),
            health: HealthConfig::default(),
            observe: ObserveConfig::default(),
            control: ControlConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Host clients use to reach the proxy. Detected from the outbound
    /// interface when unset.
    pub public_host: Option<String>,

    /// Port for the loopback admin API
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Bearer token for the admin API. Generated at startup when unset.
    pub admin_token: Option<String>,

    /// Maximum idle connections per upstream (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Upper bound for a forwarded request, including long RPC streams
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            public_host: None,
            admin_port: default_admin_port(),
            admin_token: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
            pid_file: None,
        }
    }
}

/// What kind of traffic a listening port carries
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteKind {
    /// The UI document server; HTML responses are rewritten
    Ui,
    /// The RPC/LSP server; responses are streamed and captured
    Rpc,
}

/// Presentation assets injected into the UI document
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    #[default]
    Desktop,
    Mobile,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RouteConfig {
    /// Port the proxy listens on
    pub listen_port: u16,

    /// Which backend this port fronts
    pub kind: RouteKind,

    /// Upstream host (default: 127.0.0.1)
    #[serde(default = "default_upstream_host")]
    pub upstream_host: String,

    /// Initial upstream port, replaced by discovery once it runs
    pub upstream_port: Option<u16>,

    /// Presentation profile (UI routes only)
    #[serde(default)]
    pub profile: Profile,
}

impl RouteConfig {
    pub fn new(listen_port: u16, kind: RouteKind) -> Self {
        Self {
            listen_port,
            kind,
            upstream_host: default_upstream_host(),
            upstream_port: None,
            profile: Profile::default(),
        }
    }

    /// Set the presentation profile (builder pattern)
    pub fn with_profile(mut self, profile: Profile) -> Self {
        self.profile = profile;
        self
    }

    /// Set the initial upstream port (builder pattern)
    pub fn with_upstream_port(mut self, port: u16) -> Self {
        self.upstream_port = Some(port);
        self
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscoveryConfig {
    /// Substring identifying the backend's RPC process in the process table
    #[serde(default = "default_process_token")]
    pub process_token: String,

    /// Command-line argument carrying the RPC port
    #[serde(default = "default_port_argument")]
    pub port_argument: String,

    /// Command-line argument carrying the auth token
    #[serde(default = "default_token_argument")]
    pub token_argument: String,

    /// Argument marking a workspace-scoped server (preferred over others)
    #[serde(default = "default_workspace_marker")]
    pub workspace_marker: String,

    /// Candidate UI ports in preference order
    #[serde(default = "default_ui_ports")]
    pub ui_ports: Vec<u16>,

    /// Minimum age of the cached endpoint before re-inspecting
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Connect timeout when probing UI ports
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Command listing processes with full arguments
    #[serde(default = "default_process_command")]
    pub process_command: String,

    /// Command listing listening sockets with owning process names
    #[serde(default = "default_socket_command")]
    pub socket_command: String,

    /// Address the backend binds its RPC ports on
    #[serde(default = "default_listen_host")]
    pub listen_host: String,

    /// Timeout for the inspection commands
    #[serde(default = "default_inspect_timeout")]
    pub inspect_timeout_secs: u64,
}

impl DiscoveryConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn inspect_timeout(&self) -> Duration {
        Duration::from_secs(self.inspect_timeout_secs)
    }

    /// UI port assumed when none of the candidates accepts a connection
    pub fn fallback_ui_port(&self) -> u16 {
        self.ui_ports.last().copied().unwrap_or(9090)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            process_token: default_process_token(),
            port_argument: default_port_argument(),
            token_argument: default_token_argument(),
            workspace_marker: default_workspace_marker(),
            ui_ports: default_ui_ports(),
            debounce_ms: default_debounce_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            process_command: default_process_command(),
            socket_command: default_socket_command(),
            listen_host: default_listen_host(),
            inspect_timeout_secs: default_inspect_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RewriteConfig {
    /// Script variable the blob is assigned to
    #[serde(default = "default_config_variable")]
    pub variable: String,

    /// Blob fields holding the RPC base URL; all are pointed at the proxy
    #[serde(default = "default_url_fields")]
    pub url_fields: Vec<String>,

    /// Blob field holding the auth token
    #[serde(default = "default_token_field")]
    pub token_field: String,

    /// Marker after which presentation assets are injected
    #[serde(default = "default_head_marker")]
    pub head_marker: String,

    /// Paths on a UI port that are forwarded to the RPC backend
    #[serde(default = "default_rpc_path_prefix")]
    pub rpc_path_prefix: String,

    /// Request header carrying the auth token to the RPC backend
    #[serde(default = "default_token_header")]
    pub token_header: String,
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            variable: default_config_variable(),
            url_fields: default_url_fields(),
            token_field: default_token_field(),
            head_marker: default_head_marker(),
            rpc_path_prefix: default_rpc_path_prefix(),
            token_header: default_token_header(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    /// Run the supervisor (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between probes; also the stabilization sample interval
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,

    /// Timeout of a single probe request
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Consecutive failed probes before the backend counts as stalled
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Text the UI document must contain to count as healthy
    #[serde(default = "default_config_marker")]
    pub config_marker: String,

    /// Consecutive identical port samples required for stability
    #[serde(default = "default_stabilize_samples")]
    pub stabilize_samples: u32,

    /// Minimum number of ports a stable set must contain
    #[serde(default = "default_stabilize_min_ports")]
    pub stabilize_min_ports: usize,

    /// Upper bound on waiting for the port set to settle
    #[serde(default = "default_stabilize_timeout")]
    pub stabilize_timeout_secs: u64,

    /// Seconds between embedded configuration polls
    #[serde(default = "default_config_poll_interval")]
    pub config_poll_interval_secs: u64,

    /// Upper bound on waiting for a valid embedded configuration
    #[serde(default = "default_config_poll_timeout")]
    pub config_poll_timeout_secs: u64,
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn stabilize_timeout(&self) -> Duration {
        Duration::from_secs(self.stabilize_timeout_secs)
    }

    pub fn config_poll_interval(&self) -> Duration {
        Duration::from_secs(self.config_poll_interval_secs)
    }

    pub fn config_poll_timeout(&self) -> Duration {
        Duration::from_secs(self.config_poll_timeout_secs)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_health_interval(),
            probe_timeout_secs: default_probe_timeout(),
            failure_threshold: default_failure_threshold(),
            config_marker: default_config_marker(),
            stabilize_samples: default_stabilize_samples(),
            stabilize_min_ports: default_stabilize_min_ports(),
            stabilize_timeout_secs: default_stabilize_timeout(),
            config_poll_interval_secs: default_config_poll_interval(),
            config_poll_timeout_secs: default_config_poll_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ObserveConfig {
    /// Paths serving the event stream
    #[serde(default = "default_observe_paths")]
    pub paths: Vec<String>,

    /// Paths accepting `{message}` for the input collaborator
    #[serde(default = "default_send_paths")]
    pub send_paths: Vec<String>,

    /// Per-observer queue capacity
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Seconds of silence before a session emits a ping
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
}

impl ObserveConfig {
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn is_observe_path(&self, path: &str) -> bool {
        self.paths.iter().any(|p| p == path)
    }

    pub fn is_send_path(&self, path: &str) -> bool {
        self.send_paths.iter().any(|p| p == path)
    }
}

impl Default for ObserveConfig {
    fn default() -> Self {
        Self {
            paths: default_observe_paths(),
            send_paths: default_send_paths(),
            queue_capacity: default_queue_capacity(),
            keepalive_secs: default_keepalive(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ControlConfig {
    /// Command restarting the backend service
    pub restart_command: Option<String>,

    /// Command exiting 0 while the backend process is alive
    pub alive_command: Option<String>,

    /// Command receiving a message as its final argument
    pub input_command: Option<String>,

    /// Timeout for any collaborator command
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

impl ControlConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            restart_command: None,
            alive_command: None,
            input_command: None,
            command_timeout_secs: default_command_timeout(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        let mut seen = HashSet::new();
        for route in &self.routes {
            if route.listen_port == 0 {
                errors.push("route 'listen_port' must be greater than 0".to_string());
            } else if !seen.insert(route.listen_port) {
                errors.push(format!(
                    "listen port {} is used by more than one route",
                    route.listen_port
                ));
            }
            if route.listen_port == self.server.admin_port {
                errors.push(format!(
                    "listen port {} collides with the admin port",
                    route.listen_port
                ));
            }
        }

        if !self.routes.iter().any(|r| r.kind == RouteKind::Ui) {
            errors.push("at least one 'ui' route is required".to_string());
        }

        if self.discovery.port_argument.is_empty() || self.discovery.process_token.is_empty() {
            errors.push("discovery 'process_token' and 'port_argument' must not be empty".to_string());
        }

        if self.rewrite.url_fields.is_empty() {
            errors.push("rewrite 'url_fields' must list at least one field".to_string());
        }

        if self.health.enabled {
            if self.health.failure_threshold == 0 {
                errors.push("health 'failure_threshold' must be greater than 0".to_string());
            }
            if self.health.interval_secs == 0 {
                errors.push("health 'interval_secs' must be greater than 0".to_string());
            }
            if self.discovery.ui_ports.is_empty() {
                errors.push("discovery 'ui_ports' must not be empty when health probing is enabled".to_string());
            }
        }

        if self.observe.queue_capacity == 0 {
            errors.push("observe 'queue_capacity' must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Settings that load fine but leave a feature unable to act
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.health.enabled && self.control.restart_command.is_none() {
            warnings.push(
                "health supervision is enabled but control 'restart_command' is not set; \
                 recovery will fail instead of restarting the backend"
                    .to_string(),
            );
        }
        if self.control.input_command.is_none() {
            warnings.push("control 'input_command' is not set; sent messages will be rejected".to_string());
        }
        warnings
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    9999
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_request_timeout() -> u64 {
    300 // RPC streams can stay open for minutes
}

fn default_routes() -> Vec<RouteConfig> {
    vec![
        RouteConfig::new(8890, RouteKind::Ui),
        RouteConfig::new(8891, RouteKind::Rpc),
    ]
}

fn default_upstream_host() -> String {
    "127.0.0.1".to_string()
}

fn default_process_token() -> String {
    "language_server".to_string()
}

fn default_port_argument() -> String {
    "extension_server_port".to_string()
}

fn default_token_argument() -> String {
    "csrf_token".to_string()
}

fn default_workspace_marker() -> String {
    "workspace_id".to_string()
}

fn default_ui_ports() -> Vec<u16> {
    vec![9092, 9091, 9090]
}

fn default_debounce_ms() -> u64 {
    3000
}

fn default_connect_timeout_ms() -> u64 {
    500
}

fn default_process_command() -> String {
    "ps auxww".to_string()
}

fn default_socket_command() -> String {
    "ss -tlnp".to_string()
}

fn default_listen_host() -> String {
    "127.0.0.1".to_string()
}

fn default_inspect_timeout() -> u64 {
    5
}

fn default_config_variable() -> String {
    "window.chatParams".to_string()
}

fn default_url_fields() -> Vec<String> {
    vec![
        "languageServerUrl".to_string(),
        "httpLanguageServerUrl".to_string(),
    ]
}

fn default_token_field() -> String {
    "csrfToken".to_string()
}

fn default_head_marker() -> String {
    "<head>".to_string()
}

fn default_rpc_path_prefix() -> String {
    "/exa.".to_string()
}

fn default_token_header() -> String {
    "x-codeium-csrf-token".to_string()
}

fn default_true() -> bool {
    true
}

fn default_health_interval() -> u64 {
    5
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_config_marker() -> String {
    "chatParams".to_string()
}

fn default_stabilize_samples() -> u32 {
    3
}

fn default_stabilize_min_ports() -> usize {
    2 // the RPC server listens on a pair of loopback ports
}

fn default_stabilize_timeout() -> u64 {
    150
}

fn default_config_poll_interval() -> u64 {
    3
}

fn default_config_poll_timeout() -> u64 {
    60
}

fn default_observe_paths() -> Vec<String> {
    vec!["/sse".to_string(), "/wasl".to_string()]
}

fn default_send_paths() -> Vec<String> {
    vec!["/send".to_string(), "/irsaal".to_string()]
}

fn default_queue_capacity() -> usize {
    256
}

fn default_keepalive() -> u64 {
    25
}

fn default_command_timeout() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
bind = "127.0.0.1"
public_host = "10.0.0.5"
admin_port = 9000

[[routes]]
listen_port = 8890
kind = "ui"

[[routes]]
listen_port = 8892
kind = "ui"
profile = "mobile"
upstream_port = 9090

[[routes]]
listen_port = 8891
kind = "rpc"

[discovery]
ui_ports = [9091, 9090]
debounce_ms = 1000

[health]
failure_threshold = 5

[control]
restart_command = "systemctl --user restart antigravity"
"#;

        let config = Config::parse(toml).unwrap();
        assert_eq!(config.server.admin_port, 9000);
        assert_eq!(config.server.public_host.as_deref(), Some("10.0.0.5"));
        assert_eq!(config.routes.len(), 3);
        assert_eq!(config.routes[1].profile, Profile::Mobile);
        assert_eq!(config.routes[1].upstream_port, Some(9090));
        assert_eq!(config.routes[2].kind, RouteKind::Rpc);
        assert_eq!(config.discovery.ui_ports, vec![9091, 9090]);
        assert_eq!(config.discovery.debounce(), Duration::from_secs(1));
        assert_eq!(config.health.failure_threshold, 5);
        assert!(config.control.restart_command.is_some());
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.request_timeout(), Duration::from_secs(300));
        assert_eq!(config.routes.len(), 2);
        assert_eq!(config.routes[0].listen_port, 8890);
        assert_eq!(config.routes[0].kind, RouteKind::Ui);
        assert_eq!(config.routes[1].listen_port, 8891);
        assert_eq!(config.routes[1].kind, RouteKind::Rpc);
    }

    #[test]
    fn test_default_discovery_config() {
        let config = DiscoveryConfig::default();
        assert_eq!(config.process_token, "language_server");
        assert_eq!(config.port_argument, "extension_server_port");
        assert_eq!(config.token_argument, "csrf_token");
        assert_eq!(config.ui_ports, vec![9092, 9091, 9090]);
        assert_eq!(config.debounce(), Duration::from_secs(3));
        assert_eq!(config.fallback_ui_port(), 9090);
    }

    #[test]
    fn test_default_health_config() {
        let config = HealthConfig::default();
        assert!(config.enabled);
        assert_eq!(config.interval(), Duration::from_secs(5));
        assert_eq!(config.probe_timeout(), Duration::from_secs(5));
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.stabilize_samples, 3);
        assert_eq!(config.stabilize_timeout(), Duration::from_secs(150));
        assert_eq!(config.config_poll_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_default_observe_config() {
        let config = ObserveConfig::default();
        assert!(config.is_observe_path("/sse"));
        assert!(config.is_observe_path("/wasl"));
        assert!(config.is_send_path("/irsaal"));
        assert!(!config.is_send_path("/sse"));
        assert_eq!(config.keepalive(), Duration::from_secs(25));
    }

    #[test]
    fn test_warnings_for_missing_commands() {
        let mut config = Config::default();
        let warnings = config.warnings();
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("restart_command"));

        config.control.restart_command = Some("systemctl --user restart antigravity".to_string());
        config.control.input_command = Some("xdotool type".to_string());
        assert!(config.warnings().is_empty());

        config.control.restart_command = None;
        config.health.enabled = false;
        assert!(config.warnings().is_empty());
    }

    #[test]
    fn test_duplicate_listen_port_rejected() {
        let toml = r#"
[[routes]]
listen_port = 8890
kind = "ui"

[[routes]]
listen_port = 8890
kind = "rpc"
"#;
        let err = Config::parse(toml).unwrap_err().to_string();
        assert!(err.contains("more than one route"), "{}", err);
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let toml = r#"
[[routes]]
listen_port = 8891
kind = "rpc"

[health]
failure_threshold = 0

[observe]
queue_capacity = 0
"#;
        let err = Config::parse(toml).unwrap_err().to_string();
        assert!(err.contains("'ui' route"));
        assert!(err.contains("failure_threshold"));
        assert!(err.contains("queue_capacity"));
    }

    #[test]
    fn test_invalid_route_kind_rejected() {
        let toml = r#"
[[routes]]
listen_port = 8890
kind = "websocket"
"#;
        assert!(Config::parse(toml).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gravitygate.toml");
        std::fs::write(&path, "[server]\nadmin_port = 9100\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.admin_port, 9100);
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(Config::load("/nonexistent/gravitygate.toml").is_err());
    }
}
