//! mcrouter routing configuration
//!
//! A validated [`Rule`] tree becomes an mcrouter config with one pool per
//! backend service and a route tree mirroring the rule tree:
//! `sharded` nodes become `HashRoute`, `replicated` nodes `AllSyncRoute`.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};

use k8s_openapi::api::core::v1::Endpoints;
use serde::{Deserialize, Serialize};

use crate::crd::{BackendPort, Rule, RuleType, ServiceRef};

/// Resolved `ip:port` servers per backend service
pub type BackendEndpoints = BTreeMap<ServiceRef, Vec<String>>;

/// Top-level mcrouter configuration file
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct McRouterConfig {
    /// Server pools, keyed by pool name
    pub pools: BTreeMap<String, PoolConfig>,
    /// Root route
    pub route: Route,
}

/// A named list of memcached servers
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// `ip:port` addresses
    pub servers: Vec<String>,
}

/// An mcrouter route handle
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Route {
    /// Send each key to one child chosen by hash
    HashRoute {
        /// Destinations
        children: RouteChildren,
    },
    /// Send every request to all children and wait for all replies
    AllSyncRoute {
        /// Destinations
        children: RouteChildren,
    },
    /// Answer every request with a miss
    NullRoute,
}

/// Destinations of a route: a whole pool or an ordered list of routes
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RouteChildren {
    /// `Pool|<name>` reference
    Pool(String),
    /// Nested routes, in rule order
    Routes(Vec<Route>),
}

impl Route {
    fn for_type(type_: RuleType, children: RouteChildren) -> Self {
        match type_ {
            RuleType::Sharded => Route::HashRoute { children },
            RuleType::Replicated => Route::AllSyncRoute { children },
        }
    }
}

/// Build the mcrouter config for a rule tree.
///
/// Backends with no resolved servers get no pool and their leaves route to
/// `NullRoute`.
pub fn build_config(rule: &Rule, endpoints: &BackendEndpoints) -> McRouterConfig {
    let mut pools = BTreeMap::new();
    for service in rule.services() {
        if let Some(servers) = endpoints.get(service).filter(|s| !s.is_empty()) {
            pools.insert(
                service.pool_name(),
                PoolConfig {
                    servers: servers.clone(),
                },
            );
        }
    }

    McRouterConfig {
        route: build_route(rule, &pools),
        pools,
    }
}

fn build_route(rule: &Rule, pools: &BTreeMap<String, PoolConfig>) -> Route {
    let children = match rule {
        Rule::Pool { children, .. } => {
            RouteChildren::Routes(children.iter().map(|c| build_route(c, pools)).collect())
        }
        Rule::Service { service, .. } => {
            let pool = service.pool_name();
            if !pools.contains_key(&pool) {
                return Route::NullRoute;
            }
            RouteChildren::Pool(format!("Pool|{}", pool))
        }
    };
    Route::for_type(rule.rule_type(), children)
}

/// Ready `ip:port` servers of an Endpoints object for a service port.
///
/// A named port matches endpoint ports by name; a numeric port matches by
/// number, or the only port of a single-port subset. The result is sorted
/// and free of duplicates.
pub fn resolve_endpoints(endpoints: &Endpoints, port: &BackendPort) -> Vec<String> {
    let mut servers: Vec<String> = endpoints
        .subsets
        .iter()
        .flatten()
        .filter_map(|subset| {
            let ports = subset.ports.as_deref().unwrap_or_default();
            let matched = match port {
                BackendPort::Name(name) => ports
                    .iter()
                    .find(|p| p.name.as_deref() == Some(name.as_str())),
                BackendPort::Number(number) => ports
                    .iter()
                    .find(|p| p.port == *number)
                    .or(match ports {
                        [only] => Some(only),
                        _ => None,
                    }),
            }?;
            Some((subset, matched.port))
        })
        .flat_map(|(subset, port)| {
            subset
                .addresses
                .iter()
                .flatten()
                .map(move |addr| format_server(&addr.ip, port))
        })
        .collect();

    servers.sort();
    servers.dedup();
    servers
}

fn format_server(ip: &str, port: i32) -> String {
    match (ip.parse::<IpAddr>(), u16::try_from(port)) {
        (Ok(ip), Ok(port)) => SocketAddr::new(ip, port).to_string(),
        _ => format!("{}:{}", ip, port),
    }
}
