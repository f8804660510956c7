use gravitygate::admin::{AdminServer, PKG_NAME, VERSION};
use gravitygate::config::Config;
use gravitygate::context::AppContext;
use gravitygate::control::{CommandControl, CommandInjector};
use gravitygate::discovery::{detect_external_ip, CommandInspector};
use gravitygate::proxy::ProxyServer;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("gravitygate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration; a missing default file means built-in defaults
    let explicit_path = std::env::args().nth(1).map(PathBuf::from);
    let config_path = explicit_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("gravitygate.toml"));

    let config = if explicit_path.is_some() || config_path.exists() {
        let config = Config::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?;
        info!(path = %config_path.display(), "Configuration loaded");
        config
    } else {
        info!("No configuration file, using defaults");
        Config::default()
    };

    print_startup_banner(&config);
    for warning in config.warnings() {
        warn!("{}", warning);
    }

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = write_pid_file(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let public_host = match config.server.public_host.clone() {
        Some(host) => host,
        None => detect_external_ip().await.to_string(),
    };
    info!(public_host = %public_host, "Public address for rewritten UI documents");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let ctx = AppContext::build(
        config.clone(),
        public_host,
        Arc::new(CommandInspector::new(&config.discovery)),
        Arc::new(CommandControl::new(&config.control)),
        Arc::new(CommandInjector::new(&config.control)),
    )?;

    match ctx.discovery.refresh(true).await {
        Ok(endpoint) => info!(
            rpc_port = ?endpoint.rpc_port,
            ui_port = endpoint.ui_port,
            token = ?endpoint.token_preview(),
            "Backend discovered"
        ),
        Err(e) => warn!(error = %e, "Backend not found yet, will retry on first request"),
    }

    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    for route in ctx.routes.list() {
        let addr: SocketAddr = format!("{}:{}", config.server.bind, route.listen_port)
            .parse()
            .map_err(|e| {
                error!(bind = %config.server.bind, port = route.listen_port, error = %e, "Invalid bind address");
                anyhow::anyhow!("Invalid bind address: {}", e)
            })?;

        let proxy = ProxyServer::new(addr, Arc::clone(&ctx), shutdown_rx.clone());
        handles.push(tokio::spawn(async move {
            if let Err(e) = proxy.run().await {
                error!(addr = %addr, error = %e, "Proxy listener error");
            }
        }));
    }

    let admin_addr: SocketAddr = format!("127.0.0.1:{}", config.server.admin_port)
        .parse()
        .map_err(|e| {
            error!(admin_port = config.server.admin_port, error = %e, "Invalid admin bind address");
            anyhow::anyhow!("Invalid admin bind address: {}", e)
        })?;

    // Generate or use configured admin token
    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
        token
    });

    let admin_server = AdminServer::new(admin_addr, Arc::clone(&ctx), shutdown_rx.clone(), admin_token);
    handles.push(tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Admin server error");
        }
    }));

    if config.health.enabled {
        let supervisor = Arc::clone(&ctx.supervisor);
        let shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(supervisor.run(shutdown)));
    } else {
        info!("Health supervision disabled");
    }

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or forced discovery (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, refreshing backend discovery...");
                    match ctx.discovery.refresh(true).await {
                        Ok(endpoint) => info!(
                            rpc_port = ?endpoint.rpc_port,
                            ui_port = endpoint.ui_port,
                            "Discovery refreshed"
                        ),
                        Err(e) => warn!(error = %e, "Discovery refresh failed"),
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for listeners and the supervisor to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        for handle in handles {
            let _ = handle.await;
        }
    })
    .await;

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Try to acquire exclusive lock (non-blocking)
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another gravitygate instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        writeln!(&file, "{}", std::process::id())?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self)
    }
}

fn write_pid_file(path: &Path) -> anyhow::Result<PidFile> {
    PidFile::create(path)
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gravitygate");
    info!(
        bind = %config.server.bind,
        admin_port = config.server.admin_port,
        request_timeout_secs = config.server.request_timeout_secs,
        "Server configuration"
    );
    for route in &config.routes {
        info!(
            listen_port = route.listen_port,
            kind = ?route.kind,
            profile = ?route.profile,
            upstream_host = %route.upstream_host,
            upstream_port = ?route.upstream_port,
            "Route"
        );
    }
    info!(
        process_token = %config.discovery.process_token,
        ui_ports = ?config.discovery.ui_ports,
        debounce_ms = config.discovery.debounce_ms,
        "Discovery settings"
    );
    info!(
        enabled = config.health.enabled,
        interval_secs = config.health.interval_secs,
        failure_threshold = config.health.failure_threshold,
        "Health supervision settings"
    );
    info!(
        observe_paths = ?config.observe.paths,
        send_paths = ?config.observe.send_paths,
        keepalive_secs = config.observe.keepalive_secs,
        "Observer settings"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
}
