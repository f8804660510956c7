//! Shared state handed to every listener and the supervisor

use crate::config::{Config, RouteKind};
use crate::control::{BackendControl, InputInjector};
use crate::discovery::{Discovery, SystemInspector};
use crate::health::{HealthSupervisor, HttpProbe};
use crate::hub::BroadcastHub;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::rewrite::ConfigRewriter;
use crate::routes::RouteTable;
use std::sync::Arc;
use std::time::Duration;

pub struct AppContext {
    pub config: Config,
    pub routes: Arc<RouteTable>,
    pub discovery: Arc<Discovery>,
    pub hub: BroadcastHub,
    pub pool: Arc<ConnectionPool>,
    pub rewriter: Arc<ConfigRewriter>,
    pub injector: Arc<dyn InputInjector>,
    pub supervisor: Arc<HealthSupervisor>,
    /// Host remote clients use to reach the proxy
    pub public_host: String,
}

impl AppContext {
    /// Wire all components together around the given collaborators
    pub fn build(
        config: Config,
        public_host: String,
        inspector: Arc<dyn SystemInspector>,
        control: Arc<dyn BackendControl>,
        injector: Arc<dyn InputInjector>,
    ) -> anyhow::Result<Arc<Self>> {
        let routes = Arc::new(RouteTable::from_config(&config.routes)?);
        let discovery = Arc::new(Discovery::new(
            config.discovery.clone(),
            inspector,
            Arc::clone(&routes),
        ));

        let pool = Arc::new(ConnectionPool::new(PoolConfig {
            max_idle_per_host: config.server.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
        }));
        let rewriter = Arc::new(ConfigRewriter::new(&config.rewrite));
        let hub = BroadcastHub::new(config.observe.queue_capacity, config.observe.keepalive());

        let probe = Arc::new(HttpProbe::new(
            Arc::clone(&pool),
            Arc::clone(&rewriter),
            config.discovery.listen_host.clone(),
            config.discovery.ui_ports.clone(),
            &config.health,
        ));
        let supervisor = Arc::new(HealthSupervisor::new(
            config.health.clone(),
            probe,
            control,
            Arc::clone(&discovery),
        ));

        Ok(Arc::new(Self {
            config,
            routes,
            discovery,
            hub,
            pool,
            rewriter,
            injector,
            supervisor,
            public_host,
        }))
    }

    /// Base URL written into the UI document's embedded configuration.
    ///
    /// Points at the RPC listener when there is one, otherwise at the UI
    /// listener itself, which forwards RPC paths.
    pub fn proxy_base_url(&self, ui_listen_port: u16) -> String {
        let port = self
            .routes
            .first_listen_port(RouteKind::Rpc)
            .unwrap_or(ui_listen_port);
        format!("http://{}:{}/", self.public_host, port)
    }
}
