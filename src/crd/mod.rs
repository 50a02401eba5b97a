//! Custom Resource Definitions for the memcached operator
//!
//! This module contains the MemcachedProxy resource and its routing rule tree.

mod proxy;
mod rule;

pub use proxy::{
    McRouterSpec, MemcachedProxy, MemcachedProxySpec, MemcachedProxyStatus, MAX_PROXY_NAME_LEN,
};
pub use rule::{
    BackendPort, Rule, RuleSpec, RuleType, ServiceRef, ServiceSpec, MAX_RULE_DEPTH,
};
