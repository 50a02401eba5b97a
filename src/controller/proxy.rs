//! MemcachedProxy reconciliation
//!
//! One reconcile brings the children of one proxy in line with its spec:
//!
//! 1. read the proxy from the cache (gone means nothing to do)
//! 2. default and validate the spec and the proxy name
//! 3. fingerprint the defaulted spec
//! 4. resolve backend endpoints and build the target children
//! 5. diff against the live children by content hash and apply the plan;
//!    the hash is recomputed on live children so hand edits are repaired
//! 6. write back the defaulted spec and the status when they changed
//!
//! Running it again against an unchanged cluster writes nothing.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use futures::future::try_join_all;
use kube::runtime::events::EventType;
use kube::runtime::reflector::Store;
use kube::{Client, Resource};
use tracing::{debug, info, instrument, warn};

use super::{KubeProxyClient, ObjectKey, ProxyKubeClient};
use crate::builder::{self, resolve_endpoints, BackendEndpoints, Child, ChildId};
use crate::crd::{MemcachedProxy, MemcachedProxyStatus, Rule};
use crate::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use crate::{Error, CONTROLLER_NAME};

// =============================================================================
// Controller context
// =============================================================================

/// Collaborators shared by every reconcile
pub struct Context {
    /// Cluster access
    pub kube: Arc<dyn ProxyKubeClient>,
    /// Event publisher
    pub events: Arc<dyn EventPublisher>,
}

impl Context {
    /// Create a context from explicit collaborators
    pub fn new(kube: Arc<dyn ProxyKubeClient>, events: Arc<dyn EventPublisher>) -> Self {
        Self { kube, events }
    }

    /// Create the production context
    pub fn from_client(client: Client, proxies: Store<MemcachedProxy>) -> Self {
        Self {
            events: Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME)),
            kube: Arc::new(KubeProxyClient::new(client, proxies)),
        }
    }

    /// Create a context for testing with a mock client and no events
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn ProxyKubeClient>) -> Self {
        Self {
            kube,
            events: Arc::new(crate::events::NoopEventPublisher),
        }
    }
}

// =============================================================================
// Reconcile outcome
// =============================================================================

/// What a successful reconcile did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncSummary {
    /// Children created
    pub created: usize,
    /// Children brought back to their target content
    pub updated: usize,
    /// Stale children removed
    pub deleted: usize,
    /// Whether the defaulted spec was written back
    pub spec_written: bool,
    /// Whether status was written
    pub status_written: bool,
}

impl SyncSummary {
    /// Whether any child was created, updated or deleted
    pub fn children_changed(&self) -> bool {
        self.created + self.updated + self.deleted > 0
    }

    /// Whether the reconcile wrote nothing at all
    pub fn is_noop(&self) -> bool {
        !self.children_changed() && !self.spec_written && !self.status_written
    }
}

impl fmt::Display for SyncSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "created {}, updated {}, deleted {} children",
            self.created, self.updated, self.deleted
        )
    }
}

/// Result of a successful reconcile
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The proxy no longer exists; its children are left to garbage collection
    Deleted,
    /// The proxy was brought in sync
    Synced(SyncSummary),
}

// =============================================================================
// Child diff
// =============================================================================

/// Changes needed to turn the live children into the target children
#[derive(Debug, Default, PartialEq)]
pub struct ChildPlan<'a> {
    /// Targets with no live counterpart
    pub create: Vec<&'a Child>,
    /// Targets whose live counterpart carries another hash or was edited
    pub update: Vec<&'a Child>,
    /// Live children that are no longer targets
    pub delete: Vec<ChildId>,
}

impl<'a> ChildPlan<'a> {
    /// Diff `target` against `live` by identity and content hash.
    ///
    /// A live child is current only if its annotation matches and the hash
    /// of its owned fields, recomputed from the live object, matches too.
    pub fn diff(target: &'a [Child], live: &[Child]) -> Result<Self, Error> {
        let mut plan = ChildPlan::default();

        for child in target {
            let id = child.id();
            match live.iter().find(|l| l.id() == id) {
                None => plan.create.push(child),
                Some(current) => {
                    if !current.is_current(child)? {
                        plan.update.push(child);
                    }
                }
            }
        }

        let wanted: BTreeSet<ChildId> = target.iter().map(Child::id).collect();
        plan.delete = live
            .iter()
            .map(Child::id)
            .filter(|id| !wanted.contains(id))
            .collect();

        Ok(plan)
    }

    /// Whether the live children already match
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }
}

// =============================================================================
// Reconcile
// =============================================================================

/// Reconcile the proxy identified by `key`
#[instrument(skip(key, ctx), fields(proxy = %key))]
pub async fn reconcile(key: &ObjectKey, ctx: &Context) -> Result<ReconcileOutcome, Error> {
    let Some(proxy) = ctx.kube.get_proxy(key).await? else {
        debug!("proxy no longer exists");
        return Ok(ReconcileOutcome::Deleted);
    };

    let spec = proxy.defaulted_spec();
    let rule = match proxy.validate_name().and_then(|()| spec.validate()) {
        Ok(rule) => rule,
        Err(e) => {
            let e = e.for_proxy(key.to_string());
            warn!(error = %e, field = e.field(), "proxy spec is invalid");
            let note = match e.field() {
                Some(field) => format!("{}: {}", field, e),
                None => e.to_string(),
            };
            ctx.events
                .publish(
                    &proxy.object_ref(&()),
                    EventType::Warning,
                    reasons::VALIDATION_FAILED,
                    actions::RECONCILE,
                    Some(note),
                )
                .await;
            return Err(e);
        }
    };
    let hash = spec.fingerprint()?;

    let endpoints = resolve_backends(&rule, ctx.kube.as_ref()).await?;
    let target = builder::build(&proxy, &spec, &rule, &endpoints)?;
    let live = ctx.kube.list_children(&key.namespace, &key.name).await?;
    let plan = ChildPlan::diff(&target.children, &live)?;

    let mut summary = SyncSummary::default();
    for child in &plan.create {
        info!(child = %child.id(), "creating child");
        ctx.kube.create_child(child).await?;
        summary.created += 1;
    }
    for child in &plan.update {
        info!(child = %child.id(), "updating child");
        ctx.kube.update_child(child).await?;
        summary.updated += 1;
    }
    for id in &plan.delete {
        info!(child = %id, "deleting stale child");
        ctx.kube.delete_child(&key.namespace, id).await?;
        summary.deleted += 1;
    }

    if spec != proxy.spec {
        debug!("writing back defaulted spec");
        ctx.kube
            .update_spec(&key.namespace, &key.name, &spec)
            .await?;
        summary.spec_written = true;
    }

    if summary.children_changed() || !proxy.is_synced(&hash) {
        ctx.kube
            .patch_status(
                &key.namespace,
                &key.name,
                &MemcachedProxyStatus::synced(hash.clone()),
            )
            .await?;
        summary.status_written = true;
    }

    if summary.children_changed() {
        info!(%hash, %summary, "proxy synced");
        ctx.events
            .publish(
                &proxy.object_ref(&()),
                EventType::Normal,
                reasons::SYNCED,
                actions::RECONCILE,
                Some(summary.to_string()),
            )
            .await;
    } else {
        debug!(%hash, "children already in sync");
    }

    Ok(ReconcileOutcome::Synced(summary))
}

/// Resolve the servers of every backend in the rule tree
async fn resolve_backends(
    rule: &Rule,
    kube: &dyn ProxyKubeClient,
) -> Result<BackendEndpoints, Error> {
    let lookups = rule.services().into_iter().map(|service| async move {
        let servers = match kube.get_endpoints(&service.namespace, &service.name).await? {
            Some(endpoints) => resolve_endpoints(&endpoints, &service.port),
            None => {
                debug!(backend = %service, "backend has no endpoints");
                Vec::new()
            }
        };
        Ok::<_, Error>((service.clone(), servers))
    });

    Ok(try_join_all(lookups).await?.into_iter().collect())
}
