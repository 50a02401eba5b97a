//! Change dispatcher
//!
//! Turns watch events into proxy keys on the work queue:
//!
//! - MemcachedProxy changes enqueue the proxy itself, unless only its status
//!   changed (the generation did not move); every proxy seen by an initial
//!   list or a relist after a desync is enqueued regardless
//! - changes to managed ConfigMaps, Deployments and Services enqueue the
//!   proxy named by their controller owner reference
//! - Endpoints changes enqueue every cached proxy routing to that service
//!
//! The proxy watch also feeds the reflector store the reconciler reads from.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Service};
use kube::runtime::reflector::{self, Store};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, Resource, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::crd::MemcachedProxy;
use crate::queue::WorkQueue;
use crate::{managed_selector, Error};

/// Server-side watch timeout in seconds
const WATCH_TIMEOUT_SECS: u32 = 25;

// =============================================================================
// Object keys
// =============================================================================

/// `namespace/name` identity of a proxy
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace
    pub namespace: String,
    /// Name
    pub name: String,
}

impl ObjectKey {
    /// Create a key
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a namespaced object; `None` if it has no namespace
    pub fn for_object<K: ResourceExt>(object: &K) -> Option<Self> {
        Some(Self::new(object.namespace()?, object.name_any()))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ObjectKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((namespace, name))
                if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self::new(namespace, name))
            }
            _ => Err(Error::invalid_key(s)),
        }
    }
}

// =============================================================================
// Event mapping
// =============================================================================

/// Remembers the last seen generation per proxy
///
/// Status subresource writes do not bump `metadata.generation`, so an event
/// with an already seen generation carries no spec change.
#[derive(Default)]
pub struct GenerationFilter {
    seen: DashMap<ObjectKey, i64>,
}

impl GenerationFilter {
    /// Create an empty filter
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an object event should be processed. Objects without a
    /// generation always pass.
    pub fn admit(&self, key: &ObjectKey, generation: Option<i64>) -> bool {
        let Some(generation) = generation else {
            return true;
        };
        match self.seen.insert(key.clone(), generation) {
            Some(previous) => previous != generation,
            None => true,
        }
    }

    /// Record a generation without filtering on it
    pub fn observe(&self, key: &ObjectKey, generation: Option<i64>) {
        if let Some(generation) = generation {
            self.seen.insert(key.clone(), generation);
        }
    }

    /// Drop a deleted object
    pub fn forget(&self, key: &ObjectKey) {
        self.seen.remove(key);
    }
}

/// Keys to enqueue for a MemcachedProxy watch event
pub fn proxy_event_keys(
    event: Event<MemcachedProxy>,
    filter: &GenerationFilter,
) -> Vec<ObjectKey> {
    match event {
        Event::Apply(proxy) => {
            let Some(key) = ObjectKey::for_object(&proxy) else {
                return vec![];
            };
            if filter.admit(&key, proxy.meta().generation) {
                vec![key]
            } else {
                trace!(proxy = %key, "generation unchanged, skipping");
                vec![]
            }
        }
        // A relist may follow missed events, so children are rechecked even
        // when the generation is known
        Event::InitApply(proxy) => match ObjectKey::for_object(&proxy) {
            Some(key) => {
                filter.observe(&key, proxy.meta().generation);
                vec![key]
            }
            None => vec![],
        },
        Event::Delete(proxy) => match ObjectKey::for_object(&proxy) {
            Some(key) => {
                filter.forget(&key);
                vec![key]
            }
            None => vec![],
        },
        Event::Init | Event::InitDone => vec![],
    }
}

/// Key of the proxy that controls `object`, if any
pub fn owner_key<K: Resource>(object: &K) -> Option<ObjectKey> {
    let namespace = object.meta().namespace.as_deref()?;
    let owner = object
        .meta()
        .owner_references
        .as_ref()?
        .iter()
        .find(|o| o.controller == Some(true) && o.kind == MemcachedProxy::kind(&()))?;
    Some(ObjectKey::new(namespace, &owner.name))
}

/// Keys to enqueue for a managed child watch event
pub fn child_event_keys<K: Resource>(event: Event<K>) -> Vec<ObjectKey> {
    match event {
        Event::Apply(child) | Event::InitApply(child) | Event::Delete(child) => {
            owner_key(&child).into_iter().collect()
        }
        Event::Init | Event::InitDone => vec![],
    }
}

/// Keys of the proxies whose rule trees route to `namespace/name`.
///
/// Proxies with invalid specs reference nothing.
pub fn proxies_referencing(
    proxies: &[Arc<MemcachedProxy>],
    namespace: &str,
    name: &str,
) -> Vec<ObjectKey> {
    proxies
        .iter()
        .filter(|proxy| {
            proxy
                .defaulted_spec()
                .validate()
                .is_ok_and(|rule| rule.references(namespace, name))
        })
        .filter_map(|proxy| ObjectKey::for_object(proxy.as_ref()))
        .collect()
}

/// Keys to enqueue for an Endpoints watch event
pub fn endpoints_event_keys(
    event: Event<Endpoints>,
    proxies: &Store<MemcachedProxy>,
) -> Vec<ObjectKey> {
    match event {
        Event::Apply(ep) | Event::InitApply(ep) | Event::Delete(ep) => {
            let Some(namespace) = ep.namespace() else {
                return vec![];
            };
            proxies_referencing(&proxies.state(), &namespace, &ep.name_any())
        }
        Event::Init | Event::InitDone => vec![],
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Watches the cluster and feeds the work queue
pub struct Dispatcher {
    client: Client,
    namespace: Option<String>,
    queue: Arc<WorkQueue<ObjectKey>>,
    proxies: Store<MemcachedProxy>,
    generations: GenerationFilter,
}

impl Dispatcher {
    /// Create a dispatcher. `namespace` limits every watch; `None` watches
    /// all namespaces.
    pub fn new(
        client: Client,
        namespace: Option<String>,
        queue: Arc<WorkQueue<ObjectKey>>,
        proxies: Store<MemcachedProxy>,
    ) -> Self {
        Self {
            client,
            namespace,
            queue,
            proxies,
            generations: GenerationFilter::new(),
        }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    /// Run until `shutdown` is cancelled. `writer` is the write half of the
    /// store the reconciler reads proxies from.
    pub async fn run(
        self,
        writer: reflector::store::Writer<MemcachedProxy>,
        shutdown: CancellationToken,
    ) {
        let config = watcher::Config::default().timeout(WATCH_TIMEOUT_SECS);
        let managed = config.clone().labels(&managed_selector());

        let proxies = reflector::reflector(
            writer,
            watcher::watcher(self.api::<MemcachedProxy>(), config.clone()),
        )
        .default_backoff();
        let config_maps =
            watcher::watcher(self.api::<ConfigMap>(), managed.clone()).default_backoff();
        let deployments =
            watcher::watcher(self.api::<Deployment>(), managed.clone()).default_backoff();
        let services = watcher::watcher(self.api::<Service>(), managed).default_backoff();
        let endpoints = watcher::watcher(self.api::<Endpoints>(), config).default_backoff();

        let mut proxies = std::pin::pin!(proxies);
        let mut config_maps = std::pin::pin!(config_maps);
        let mut deployments = std::pin::pin!(deployments);
        let mut services = std::pin::pin!(services);
        let mut endpoints = std::pin::pin!(endpoints);

        info!(
            namespace = self.namespace.as_deref().unwrap_or("*"),
            "dispatcher started"
        );

        loop {
            let keys = tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(event) = proxies.next() => {
                    watch_keys("MemcachedProxy", event, |e| proxy_event_keys(e, &self.generations))
                }
                Some(event) = config_maps.next() => watch_keys("ConfigMap", event, child_event_keys),
                Some(event) = deployments.next() => watch_keys("Deployment", event, child_event_keys),
                Some(event) = services.next() => watch_keys("Service", event, child_event_keys),
                Some(event) = endpoints.next() => {
                    watch_keys("Endpoints", event, |e| endpoints_event_keys(e, &self.proxies))
                }
                else => break,
            };

            for key in keys {
                trace!(proxy = %key, "enqueue");
                self.queue.add(key);
            }
        }

        info!("dispatcher stopped");
    }
}

fn watch_keys<K>(
    resource_type: &str,
    event: Result<Event<K>, watcher::Error>,
    map: impl FnOnce(Event<K>) -> Vec<ObjectKey>,
) -> Vec<ObjectKey> {
    match event {
        Ok(event) => {
            let keys = map(event);
            if !keys.is_empty() {
                debug!(%resource_type, count = keys.len(), "watch event mapped to proxies");
            }
            keys
        }
        Err(e) => {
            warn!(error = %e, %resource_type, "watch error, backing off");
            vec![]
        }
    }
}
