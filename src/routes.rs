//! Listening-port route table
//!
//! Maps each listening port to its upstream. Upstream ports of routes without
//! a static port are filled in by discovery.

use crate::config::{Profile, RouteConfig, RouteKind};
use crate::discovery::DiscoveredEndpoint;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use tracing::info;

/// A single listening port and where its traffic goes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub listen_port: u16,
    pub upstream_host: String,
    /// Unset until the first discovery for routes without a static port
    pub upstream_port: Option<u16>,
    pub kind: RouteKind,
    pub profile: Profile,
}

impl From<&RouteConfig> for Route {
    fn from(config: &RouteConfig) -> Self {
        Self {
            listen_port: config.listen_port,
            upstream_host: config.upstream_host.clone(),
            upstream_port: config.upstream_port,
            kind: config.kind,
            profile: config.profile,
        }
    }
}

/// Shared table of routes keyed by listening port
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: RwLock<HashMap<u16, Route>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from configuration
    pub fn from_config(routes: &[RouteConfig]) -> anyhow::Result<Self> {
        let table = Self::new();
        for route in routes {
            table.insert(Route::from(route))?;
        }
        Ok(table)
    }

    /// Add a route; listening ports are unique
    pub fn insert(&self, route: Route) -> anyhow::Result<()> {
        let mut routes = self.routes.write();
        if routes.contains_key(&route.listen_port) {
            anyhow::bail!("listen port {} already has a route", route.listen_port);
        }
        routes.insert(route.listen_port, route);
        Ok(())
    }

    pub fn get(&self, listen_port: u16) -> Option<Route> {
        self.routes.read().get(&listen_port).cloned()
    }

    /// All routes ordered by listening port
    pub fn list(&self) -> Vec<Route> {
        let mut routes: Vec<Route> = self.routes.read().values().cloned().collect();
        routes.sort_by_key(|r| r.listen_port);
        routes
    }

    /// Listening port of the first route of the given kind
    pub fn first_listen_port(&self, kind: RouteKind) -> Option<u16> {
        self.list()
            .into_iter()
            .find(|r| r.kind == kind)
            .map(|r| r.listen_port)
    }

    /// Point routes at a freshly discovered backend.
    ///
    /// UI routes follow the UI port; RPC routes follow the RPC port when one
    /// was found and keep their previous upstream otherwise.
    pub fn apply_endpoint(&self, endpoint: &DiscoveredEndpoint) {
        let mut routes = self.routes.write();
        for route in routes.values_mut() {
            let target = match route.kind {
                RouteKind::Ui => Some(endpoint.ui_port),
                RouteKind::Rpc => endpoint.rpc_port,
            };
            if let Some(port) = target {
                if route.upstream_port != Some(port) {
                    info!(
                        listen_port = route.listen_port,
                        old = ?route.upstream_port,
                        new = port,
                        "Route upstream updated"
                    );
                    route.upstream_port = Some(port);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn endpoint(rpc_port: Option<u16>, ui_port: u16) -> DiscoveredEndpoint {
        DiscoveredEndpoint {
            rpc_port,
            auth_token: None,
            ui_port,
            discovered_at: Utc::now(),
        }
    }

    #[test]
    fn test_duplicate_listen_port_rejected() {
        let table = RouteTable::new();
        table
            .insert(Route::from(&RouteConfig::new(8890, RouteKind::Ui)))
            .unwrap();
        assert!(table
            .insert(Route::from(&RouteConfig::new(8890, RouteKind::Rpc)))
            .is_err());
    }

    #[test]
    fn test_upstream_unset_until_discovery() {
        let table = RouteTable::from_config(&[
            RouteConfig::new(8890, RouteKind::Ui),
            RouteConfig::new(8891, RouteKind::Rpc),
        ])
        .unwrap();
        assert_eq!(table.get(8890).unwrap().upstream_port, None);
        assert_eq!(table.get(8891).unwrap().upstream_port, None);

        table.apply_endpoint(&endpoint(Some(37417), 9090));
        assert_eq!(table.get(8890).unwrap().upstream_port, Some(9090));
        assert_eq!(table.get(8891).unwrap().upstream_port, Some(37417));
    }

    #[test]
    fn test_rpc_route_kept_when_rpc_port_missing() {
        let table = RouteTable::from_config(&[
            RouteConfig::new(8890, RouteKind::Ui),
            RouteConfig::new(8891, RouteKind::Rpc).with_upstream_port(40000),
        ])
        .unwrap();

        table.apply_endpoint(&endpoint(None, 9091));
        assert_eq!(table.get(8890).unwrap().upstream_port, Some(9091));
        assert_eq!(table.get(8891).unwrap().upstream_port, Some(40000));
    }

    #[test]
    fn test_list_is_ordered() {
        let table = RouteTable::from_config(&[
            RouteConfig::new(8892, RouteKind::Ui).with_profile(Profile::Mobile),
            RouteConfig::new(8890, RouteKind::Ui),
            RouteConfig::new(8891, RouteKind::Rpc),
        ])
        .unwrap();
        let ports: Vec<u16> = table.list().iter().map(|r| r.listen_port).collect();
        assert_eq!(ports, vec![8890, 8891, 8892]);
        assert_eq!(table.first_listen_port(RouteKind::Rpc), Some(8891));
        assert_eq!(table.first_listen_port(RouteKind::Ui), Some(8890));
    }
}
