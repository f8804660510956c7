//! Backend liveness supervision and recovery
//!
//! A backend can keep its ports open while no longer serving anything useful.
//! The supervisor fetches the UI document on every tick and counts
//! consecutive failures; at the threshold the backend counts as stalled and
//! is recovered. A change of the backend's listening port set (a restart that
//! happened behind our back) runs the same recovery.

use crate::config::HealthConfig;
use crate::control::BackendControl;
use crate::discovery::Discovery;
use crate::pool::ConnectionPool;
use crate::rewrite::ConfigRewriter;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Stalled,
}

/// Consecutive probe results for the backend
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthState {
    pub consecutive_failures: u32,
    pub last_healthy_at: DateTime<Utc>,
    pub status: HealthStatus,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            last_healthy_at: Utc::now(),
            status: HealthStatus::Healthy,
        }
    }
}

impl HealthState {
    /// Any success resets to healthy. Returns the failures that preceded it.
    pub fn record_success(&mut self) -> u32 {
        let previous = self.consecutive_failures;
        self.reset();
        previous
    }

    /// Count a failed probe. Returns true only on the transition into
    /// [`HealthStatus::Stalled`].
    pub fn record_failure(&mut self, threshold: u32) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let was_stalled = self.status == HealthStatus::Stalled;
        self.status = if self.consecutive_failures >= threshold {
            HealthStatus::Stalled
        } else {
            HealthStatus::Degraded
        };
        !was_stalled && self.status == HealthStatus::Stalled
    }

    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.last_healthy_at = Utc::now();
        self.status = HealthStatus::Healthy;
    }
}

/// Result of one liveness probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy { port: u16 },
    Unhealthy { reason: String },
}

/// Liveness view of the backend's UI document
#[async_trait]
pub trait BackendProbe: Send + Sync {
    async fn probe(&self) -> ProbeOutcome;
    /// RPC port named by the UI document's embedded configuration
    async fn embedded_rpc_port(&self) -> Option<u16>;
}

/// [`BackendProbe`] fetching the UI document through the connection pool
pub struct HttpProbe {
    pool: Arc<ConnectionPool>,
    rewriter: Arc<ConfigRewriter>,
    host: String,
    ui_ports: Vec<u16>,
    timeout: Duration,
    marker: String,
}

impl HttpProbe {
    pub fn new(
        pool: Arc<ConnectionPool>,
        rewriter: Arc<ConfigRewriter>,
        host: impl Into<String>,
        ui_ports: Vec<u16>,
        config: &HealthConfig,
    ) -> Self {
        Self {
            pool,
            rewriter,
            host: host.into(),
            ui_ports,
            timeout: config.probe_timeout(),
            marker: config.config_marker.clone(),
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

#[async_trait]
impl BackendProbe for HttpProbe {
    async fn probe(&self) -> ProbeOutcome {
        for &port in &self.ui_ports {
            match self.pool.fetch(&self.host, port, "/", self.timeout).await {
                Ok((_, body)) if contains(&body, self.marker.as_bytes()) => {
                    return ProbeOutcome::Healthy { port };
                }
                // A port that answers without the configuration is the verdict
                Ok((_, body)) if !body.is_empty() => {
                    return ProbeOutcome::Unhealthy {
                        reason: format!("port {} answered without {}", port, self.marker),
                    };
                }
                Ok(_) => debug!(port, "Empty UI document"),
                Err(e) => debug!(port, error = %e, "UI port probe failed"),
            }
        }
        ProbeOutcome::Unhealthy {
            reason: "all UI ports unresponsive".to_string(),
        }
    }

    async fn embedded_rpc_port(&self) -> Option<u16> {
        for &port in &self.ui_ports {
            let Ok((_, body)) = self.pool.fetch(&self.host, port, "/", self.timeout).await else {
                continue;
            };
            match self.rewriter.extract(&body) {
                Ok(Some(found)) => return found.upstream_port,
                Ok(None) => continue,
                Err(e) => debug!(port, error = %e, "Embedded configuration unreadable"),
            }
        }
        None
    }
}

/// What started a recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryTrigger {
    Stalled,
    PortChange,
    Manual,
}

/// Summary of a finished recovery
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    pub trigger: RecoveryTrigger,
    pub stable_ports: BTreeSet<u16>,
    pub ports_stable: bool,
    pub config_port: Option<u16>,
    pub config_valid: bool,
    pub restarted: bool,
    /// Liveness reported right after the restart; `None` when it could not be checked
    pub alive: Option<bool>,
}

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("a recovery is already in progress")]
    InProgress,
}

/// What a single tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Healthy,
    Failed { failures: u32 },
    Recovered(RecoveryTrigger),
    Skipped,
}

/// Clears the in-flight flag even when the recovery future is dropped
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct HealthSupervisor {
    config: HealthConfig,
    probe: Arc<dyn BackendProbe>,
    control: Arc<dyn BackendControl>,
    discovery: Arc<Discovery>,
    state: Arc<RwLock<HealthState>>,
    last_ports: Mutex<Option<BTreeSet<u16>>>,
    recovering: AtomicBool,
    recoveries: AtomicU64,
}

impl HealthSupervisor {
    pub fn new(
        config: HealthConfig,
        probe: Arc<dyn BackendProbe>,
        control: Arc<dyn BackendControl>,
        discovery: Arc<Discovery>,
    ) -> Self {
        Self {
            config,
            probe,
            control,
            discovery,
            state: Arc::new(RwLock::new(HealthState::default())),
            last_ports: Mutex::new(None),
            recovering: AtomicBool::new(false),
            recoveries: AtomicU64::new(0),
        }
    }

    /// Snapshot of the current health state
    pub fn state(&self) -> HealthState {
        self.state.read().clone()
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::Acquire)
    }

    pub fn recoveries(&self) -> u64 {
        self.recoveries.load(Ordering::Relaxed)
    }

    /// Probe on every interval until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval_secs,
            failure_threshold = self.config.failure_threshold,
            "Health supervisor started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval()) => {
                    self.tick().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Health supervisor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One probe plus the port-set comparison
    pub async fn tick(&self) -> TickOutcome {
        let current_ports = match self.discovery.listening_ports().await {
            Ok(ports) => Some(ports),
            Err(e) => {
                warn!(error = %e, "Failed to read listening ports");
                None
            }
        };

        let failures = match self.probe.probe().await {
            ProbeOutcome::Healthy { port } => {
                let previous = self.state.write().record_success();
                if previous > 0 {
                    info!(port, failures = previous, "Backend healthy again");
                }
                None
            }
            ProbeOutcome::Unhealthy { reason } => {
                let (entered_stall, failures, unhealthy_secs) = {
                    let mut state = self.state.write();
                    let entered = state.record_failure(self.config.failure_threshold);
                    let secs = (Utc::now() - state.last_healthy_at).num_seconds();
                    (entered, state.consecutive_failures, secs)
                };
                warn!(
                    failures,
                    threshold = self.config.failure_threshold,
                    unhealthy_secs,
                    reason = %reason,
                    "Backend probe failed"
                );

                if entered_stall {
                    warn!("Backend stalled, starting recovery");
                    let initial = current_ports.unwrap_or_default();
                    return match self.recover(RecoveryTrigger::Stalled, initial).await {
                        Ok(_) => TickOutcome::Recovered(RecoveryTrigger::Stalled),
                        Err(e) => {
                            debug!(error = %e, "Recovery not started");
                            TickOutcome::Skipped
                        }
                    };
                }
                Some(failures)
            }
        };

        if let Some(current) = current_ports {
            if self.port_set_changed(current.clone()) {
                return match self.recover(RecoveryTrigger::PortChange, current).await {
                    Ok(_) => TickOutcome::Recovered(RecoveryTrigger::PortChange),
                    Err(e) => {
                        debug!(error = %e, "Recovery not started");
                        TickOutcome::Skipped
                    }
                };
            }
        }

        match failures {
            Some(failures) => TickOutcome::Failed { failures },
            None => TickOutcome::Healthy,
        }
    }

    /// Compare against the last seen set; true when recovery is needed.
    ///
    /// The first observation only sets the baseline. Ports vanishing entirely
    /// are recorded without action; ports appearing from nothing, or a set
    /// that is not a subset of the previous one, need recovery.
    fn port_set_changed(&self, current: BTreeSet<u16>) -> bool {
        let mut last_ports = self.last_ports.lock();
        let Some(last) = last_ports.as_ref() else {
            info!(ports = ?current, "Initial backend port set");
            *last_ports = Some(current);
            return false;
        };
        if *last == current {
            return false;
        }

        if current.is_empty() {
            warn!(previous = ?last, "All backend ports disappeared");
            *last_ports = Some(current);
            return false;
        }

        if last.is_empty() || !current.is_subset(last) {
            info!(old = ?last, new = ?current, "Backend port set changed");
            return true;
        }

        debug!(old = ?last, new = ?current, "Backend port set shrank");
        *last_ports = Some(current);
        false
    }

    /// Stabilize, wait for the UI document to name a live RPC port, restart
    /// the backend, then reset health and force a discovery refresh.
    ///
    /// Never runs concurrently; a second caller gets
    /// [`RecoveryError::InProgress`].
    pub async fn recover(
        &self,
        trigger: RecoveryTrigger,
        initial_ports: BTreeSet<u16>,
    ) -> Result<RecoveryReport, RecoveryError> {
        if self.recovering.swap(true, Ordering::AcqRel) {
            return Err(RecoveryError::InProgress);
        }
        let _in_flight = InFlight(&self.recovering);

        info!(?trigger, ports = ?initial_ports, "Recovery started");

        let (stable_ports, ports_stable) = self.wait_for_stable_ports(initial_ports).await;
        let (config_valid, config_port) = self.wait_for_embedded_config(&stable_ports).await;

        let restarted = match self.control.restart_backend().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Backend restart failed");
                false
            }
        };
        let alive = if restarted {
            match self.control.is_alive().await {
                Ok(alive) => Some(alive),
                Err(e) => {
                    debug!(error = %e, "Liveness check after restart failed");
                    None
                }
            }
        } else {
            None
        };

        self.state.write().reset();
        if let Err(e) = self.discovery.refresh(true).await {
            warn!(error = %e, "Discovery after recovery failed");
        }
        *self.last_ports.lock() = Some(stable_ports.clone());
        self.recoveries.fetch_add(1, Ordering::Relaxed);

        info!(
            ?trigger,
            ports = ?stable_ports,
            config_port = ?config_port,
            config_valid,
            restarted,
            alive = ?alive,
            "Recovery finished"
        );

        Ok(RecoveryReport {
            trigger,
            stable_ports,
            ports_stable,
            config_port,
            config_valid,
            restarted,
            alive,
        })
    }

    /// Sample the listening ports until they stay identical for the required
    /// number of samples. Gives up after the stabilization timeout and
    /// returns the last sample.
    async fn wait_for_stable_ports(&self, initial: BTreeSet<u16>) -> (BTreeSet<u16>, bool) {
        let interval = self.config.interval();
        let max_samples = (self.config.stabilize_timeout().as_secs() / interval.as_secs().max(1)).max(1);
        let mut last = initial;
        let mut stable_count = 0;

        for _ in 0..max_samples {
            tokio::time::sleep(interval).await;
            let current = self.discovery.listening_ports().await.unwrap_or_default();

            if current == last && current.len() >= self.config.stabilize_min_ports {
                stable_count += 1;
                debug!(stable_count, required = self.config.stabilize_samples, "Port set stable");
                if stable_count >= self.config.stabilize_samples {
                    return (current, true);
                }
            } else {
                stable_count = 0;
                if current != last {
                    debug!(ports = current.len(), "Port set still changing");
                }
                last = current;
            }
        }

        warn!(
            timeout_secs = self.config.stabilize_timeout_secs,
            "Ports did not stabilize, continuing"
        );
        (last, false)
    }

    /// Poll the embedded configuration until it names one of `valid_ports`
    async fn wait_for_embedded_config(&self, valid_ports: &BTreeSet<u16>) -> (bool, Option<u16>) {
        let start = Instant::now();

        while start.elapsed() < self.config.config_poll_timeout() {
            match self.probe.embedded_rpc_port().await {
                Some(port) if valid_ports.contains(&port) => {
                    info!(port, "Embedded configuration names a live port");
                    return (true, Some(port));
                }
                Some(port) => debug!(port, "Embedded configuration still stale"),
                None => debug!("No embedded configuration yet"),
            }
            tokio::time::sleep(self.config.config_poll_interval()).await;
        }

        let port = self.probe.embedded_rpc_port().await;
        warn!(
            timeout_secs = self.config.config_poll_timeout_secs,
            port = ?port,
            "Embedded configuration did not update, continuing"
        );
        (false, port)
    }
}
