//! MemcachedProxy controller
//!
//! The controller is three cooperating parts sharing one work queue:
//!
//! - [`Dispatcher`] watches proxies, their children and backend Endpoints
//!   and enqueues the affected proxy keys
//! - [`WorkerPool`] pulls keys and runs [`reconcile`], at most once per key
//!   at a time
//! - [`reconcile`] converges one proxy through the [`ProxyKubeClient`]
//!   collaborator

mod client;
mod dispatcher;
mod proxy;
mod worker;

use std::sync::Arc;

use kube::runtime::reflector;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use client::{KubeProxyClient, ProxyKubeClient};
#[cfg(test)]
pub use client::MockProxyKubeClient;
pub use dispatcher::{
    child_event_keys, endpoints_event_keys, owner_key, proxies_referencing, proxy_event_keys,
    Dispatcher, GenerationFilter, ObjectKey,
};
pub use proxy::{reconcile, ChildPlan, Context, ReconcileOutcome, SyncSummary};
pub use worker::WorkerPool;

use crate::crd::MemcachedProxy;
use crate::queue::WorkQueue;
use crate::retry::RetryConfig;
use crate::{DEFAULT_MAX_RETRIES, DEFAULT_WORKERS};

/// Startup parameters of the controller
#[derive(Clone, Debug, PartialEq)]
pub struct ControllerConfig {
    /// Number of reconcile workers
    pub workers: usize,
    /// Retries for a failing key before it is dropped
    pub max_retries: u32,
    /// Requeue backoff for failing keys
    pub backoff: RetryConfig,
    /// Namespace to watch, all namespaces if `None`
    pub namespace: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: RetryConfig::default(),
            namespace: None,
        }
    }
}

/// Run the controller until `shutdown` is cancelled
pub async fn run(client: Client, config: ControllerConfig, shutdown: CancellationToken) {
    let (store, writer) = reflector::store::<MemcachedProxy>();
    let queue = WorkQueue::new(config.backoff.clone());
    let ctx = Arc::new(Context::from_client(client.clone(), store.clone()));

    let dispatcher = Dispatcher::new(client, config.namespace.clone(), queue.clone(), store);
    let pool = WorkerPool::new(queue, ctx, config.workers, config.max_retries);

    info!(
        workers = config.workers,
        max_retries = config.max_retries,
        namespace = config.namespace.as_deref().unwrap_or("*"),
        "memcached-operator controller running"
    );

    tokio::join!(
        dispatcher.run(writer, shutdown.clone()),
        pool.run(shutdown)
    );
}
