//! Child resource construction
//!
//! Turns a defaulted, validated proxy into the resources that run it:
//!
//! - ConfigMap `<proxy>-mcrouter` holding the mcrouter `config.json`
//! - Deployment `<proxy>-mcrouter` running mcrouter against that file
//! - Service `<proxy>-mcrouter` exposing the mcrouter port
//!
//! Everything here is pure. Each child carries a content hash annotation
//! computed over the fields the builder owns. The reconciler recomputes that
//! hash on the live child, so server-populated fields never count as drift
//! while a hand edit to an owned field does.
//!
//! The Deployment references the ConfigMap by name only. A routing change
//! rewrites the ConfigMap and leaves the Deployment alone; mcrouter picks up
//! the new file without a rollout.

mod routing;

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, PodSpec, PodTemplateSpec, Probe,
    Service, ServicePort, ServiceSpec, TCPSocketAction, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};
use serde_json::{json, Value};

pub use routing::{
    build_config, resolve_endpoints, BackendEndpoints, McRouterConfig, PoolConfig, Route,
    RouteChildren,
};

use crate::crd::{MemcachedProxy, MemcachedProxySpec, Rule};
use crate::{
    fingerprint, Error, APP_NAME, CONTROLLER_NAME, LABEL_INSTANCE, LABEL_MANAGED_BY, LABEL_NAME,
    LABEL_PROXY, SPEC_HASH_ANNOTATION,
};

/// Key of the routing config inside the ConfigMap
pub const CONFIG_FILE: &str = "config.json";

/// Where the ConfigMap is mounted in the mcrouter container
pub const CONFIG_MOUNT_PATH: &str = "/etc/mcrouter";

/// Name of the mcrouter container
pub const CONTAINER_NAME: &str = "mcrouter";

const CONFIG_VOLUME: &str = "config";
const PORT_NAME: &str = "memcache";

/// Name shared by all children of a proxy
pub fn child_name(proxy_name: &str) -> String {
    format!("{}-mcrouter", proxy_name)
}

/// Labels every child of `proxy_name` carries
pub fn child_labels(proxy_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_NAME.to_string(), APP_NAME.to_string()),
        (LABEL_INSTANCE.to_string(), proxy_name.to_string()),
        (LABEL_MANAGED_BY.to_string(), CONTROLLER_NAME.to_string()),
        (LABEL_PROXY.to_string(), proxy_name.to_string()),
    ])
}

/// Labels selecting the mcrouter pods of `proxy_name`
pub fn selector_labels(proxy_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_NAME.to_string(), APP_NAME.to_string()),
        (LABEL_PROXY.to_string(), proxy_name.to_string()),
    ])
}

/// Label selector string matching the children of `proxy_name`
pub fn proxy_selector(proxy_name: &str) -> String {
    format!(
        "{}={},{}={}",
        LABEL_MANAGED_BY, CONTROLLER_NAME, LABEL_PROXY, proxy_name
    )
}

// =============================================================================
// Child resources
// =============================================================================

/// Kind of a managed child
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChildKind {
    /// Routing config
    ConfigMap,
    /// mcrouter pods
    Deployment,
    /// Stable address of the proxy
    Service,
}

impl fmt::Display for ChildKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildKind::ConfigMap => write!(f, "ConfigMap"),
            ChildKind::Deployment => write!(f, "Deployment"),
            ChildKind::Service => write!(f, "Service"),
        }
    }
}

/// Identity of a child within its proxy's namespace
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChildId {
    /// Resource kind
    pub kind: ChildKind,
    /// Resource name
    pub name: String,
}

impl fmt::Display for ChildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// A managed child resource, target or live
#[derive(Clone, Debug, PartialEq)]
pub enum Child {
    /// Routing config
    ConfigMap(ConfigMap),
    /// mcrouter pods
    Deployment(Deployment),
    /// Proxy service
    Service(Service),
}

impl Child {
    /// Kind of this child
    pub fn kind(&self) -> ChildKind {
        match self {
            Child::ConfigMap(_) => ChildKind::ConfigMap,
            Child::Deployment(_) => ChildKind::Deployment,
            Child::Service(_) => ChildKind::Service,
        }
    }

    /// Object metadata
    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Child::ConfigMap(cm) => &cm.metadata,
            Child::Deployment(d) => &d.metadata,
            Child::Service(s) => &s.metadata,
        }
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Child::ConfigMap(cm) => &mut cm.metadata,
            Child::Deployment(d) => &mut d.metadata,
            Child::Service(s) => &mut s.metadata,
        }
    }

    /// Resource name
    pub fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    /// Resource namespace
    pub fn namespace(&self) -> &str {
        self.metadata().namespace.as_deref().unwrap_or_default()
    }

    /// Kind and name
    pub fn id(&self) -> ChildId {
        ChildId {
            kind: self.kind(),
            name: self.name().to_string(),
        }
    }

    /// Content hash recorded on this child, if any
    pub fn spec_hash(&self) -> Option<&str> {
        self.metadata()
            .annotations
            .as_ref()?
            .get(SPEC_HASH_ANNOTATION)
            .map(String::as_str)
    }

    /// Fingerprint of the fields the builder sets.
    ///
    /// Fields the API server or other controllers fill in (status, defaults,
    /// extra labels and annotations) are left out, so a freshly built child
    /// and its live copy hash the same until someone edits an owned field.
    pub fn content_hash(&self) -> Result<String, Error> {
        fingerprint::fingerprint_value(&self.owned_fields())
    }

    /// Whether this live child still matches `target`, both by the recorded
    /// annotation and by its actual content
    pub fn is_current(&self, target: &Child) -> Result<bool, Error> {
        let Some(want) = target.spec_hash() else {
            return Ok(false);
        };
        Ok(self.spec_hash() == Some(want) && self.content_hash()? == want)
    }

    fn owned_fields(&self) -> Value {
        match self {
            Child::ConfigMap(cm) => json!({
                "labels": managed_labels(&cm.metadata),
                "data": cm.data.clone().unwrap_or_default(),
            }),
            Child::Deployment(d) => {
                let spec = d.spec.as_ref();
                let template = spec.map(|s| &s.template);
                let pod = template.and_then(|t| t.spec.as_ref());
                json!({
                    "labels": managed_labels(&d.metadata),
                    "selector": spec.and_then(|s| s.selector.match_labels.as_ref()),
                    "templateLabels": template
                        .and_then(|t| t.metadata.as_ref())
                        .and_then(|m| m.labels.as_ref()),
                    "containers": pod
                        .into_iter()
                        .flat_map(|p| &p.containers)
                        .map(container_fields)
                        .collect::<Vec<_>>(),
                    "volumes": pod
                        .and_then(|p| p.volumes.as_ref())
                        .into_iter()
                        .flatten()
                        .map(|v| json!({
                            "name": v.name,
                            "configMap": v.config_map.as_ref().map(|c| &c.name),
                        }))
                        .collect::<Vec<_>>(),
                })
            }
            Child::Service(svc) => {
                let spec = svc.spec.as_ref();
                json!({
                    "labels": managed_labels(&svc.metadata),
                    "type": spec.and_then(|s| s.type_.as_ref()),
                    "selector": spec.and_then(|s| s.selector.as_ref()),
                    "ports": spec
                        .and_then(|s| s.ports.as_ref())
                        .into_iter()
                        .flatten()
                        .map(|p| json!({
                            "name": p.name,
                            "port": p.port,
                            "targetPort": p.target_port,
                            "protocol": p.protocol,
                        }))
                        .collect::<Vec<_>>(),
                })
            }
        }
    }

    /// Stamp the content hash of the child as built so far
    fn annotate_hash(mut self) -> Result<Self, Error> {
        let hash = self.content_hash()?;
        self.metadata_mut()
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(SPEC_HASH_ANNOTATION.to_string(), hash);
        Ok(self)
    }
}

const MANAGED_LABELS: [&str; 4] = [LABEL_NAME, LABEL_INSTANCE, LABEL_MANAGED_BY, LABEL_PROXY];

fn managed_labels(meta: &ObjectMeta) -> BTreeMap<&str, &str> {
    meta.labels
        .iter()
        .flatten()
        .filter(|(k, _)| MANAGED_LABELS.contains(&k.as_str()))
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect()
}

// Unset and empty are the same to the API server
fn container_fields(c: &Container) -> Value {
    json!({
        "name": c.name,
        "image": c.image,
        "args": c.args.iter().flatten().collect::<Vec<_>>(),
        "ports": c
            .ports
            .iter()
            .flatten()
            .map(|p| json!({
                "name": p.name,
                "containerPort": p.container_port,
                "protocol": p.protocol,
            }))
            .collect::<Vec<_>>(),
        "resources": c.resources.clone().unwrap_or_default(),
        "readinessProbe": c.readiness_probe.as_ref().map(|p| json!({
            "tcpSocket": p.tcp_socket.as_ref().map(|t| &t.port),
            "initialDelaySeconds": p.initial_delay_seconds,
            "periodSeconds": p.period_seconds,
        })),
        "volumeMounts": c
            .volume_mounts
            .iter()
            .flatten()
            .map(|m| json!({
                "name": m.name,
                "mountPath": m.mount_path,
                "readOnly": m.read_only,
            }))
            .collect::<Vec<_>>(),
    })
}

/// The full target state of one proxy
#[derive(Clone, Debug, PartialEq)]
pub struct ChildResources {
    /// Routing config the ConfigMap carries
    pub config: McRouterConfig,
    /// Children, each annotated with its content hash
    pub children: Vec<Child>,
}

impl ChildResources {
    /// Look up a child by identity
    pub fn get(&self, id: &ChildId) -> Option<&Child> {
        self.children.iter().find(|c| &c.id() == id)
    }
}

// =============================================================================
// Build
// =============================================================================

/// Build the target children of a proxy.
///
/// `spec` must be the defaulted spec and `rule` its validated rule tree.
/// Backends missing from `endpoints` are treated as having no servers.
pub fn build(
    proxy: &MemcachedProxy,
    spec: &MemcachedProxySpec,
    rule: &Rule,
    endpoints: &BackendEndpoints,
) -> Result<ChildResources, Error> {
    let proxy_name = proxy.name_any();
    let namespace = proxy.namespace_or_default();
    let owner = proxy.controller_owner_ref(&()).ok_or_else(|| {
        Error::internal_with_context(
            "builder",
            format!("proxy {}/{} has no uid yet", namespace, proxy_name),
        )
    })?;

    let meta = ChildMeta {
        name: child_name(&proxy_name),
        namespace,
        proxy_name,
        owner,
    };

    let config = build_config(rule, endpoints);
    let children = vec![
        Child::ConfigMap(build_config_map(&meta, &config)?).annotate_hash()?,
        Child::Deployment(build_deployment(&meta, spec)).annotate_hash()?,
        Child::Service(build_service(&meta, spec)).annotate_hash()?,
    ];

    Ok(ChildResources { config, children })
}

struct ChildMeta {
    name: String,
    namespace: String,
    proxy_name: String,
    owner: OwnerReference,
}

impl ChildMeta {
    fn object_meta(&self) -> ObjectMeta {
        ObjectMeta {
            name: Some(self.name.clone()),
            namespace: Some(self.namespace.clone()),
            labels: Some(child_labels(&self.proxy_name)),
            owner_references: Some(vec![self.owner.clone()]),
            ..Default::default()
        }
    }
}

fn build_config_map(meta: &ChildMeta, config: &McRouterConfig) -> Result<ConfigMap, Error> {
    let rendered = serde_json::to_string_pretty(config)
        .map_err(|e| Error::serialization_for_kind("ConfigMap", e.to_string()))?;

    Ok(ConfigMap {
        metadata: meta.object_meta(),
        data: Some(BTreeMap::from([(CONFIG_FILE.to_string(), rendered)])),
        ..Default::default()
    })
}

fn build_deployment(meta: &ChildMeta, spec: &MemcachedProxySpec) -> Deployment {
    let port = spec.mcrouter.port();

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(spec.mcrouter.image().to_string()),
        args: Some(vec![
            "-p".to_string(),
            port.to_string(),
            format!("--config-file={}/{}", CONFIG_MOUNT_PATH, CONFIG_FILE),
        ]),
        ports: Some(vec![ContainerPort {
            name: Some(PORT_NAME.to_string()),
            container_port: port,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        resources: spec.mcrouter.resources.clone(),
        readiness_probe: Some(Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::Int(port),
                ..Default::default()
            }),
            initial_delay_seconds: Some(2),
            period_seconds: Some(10),
            ..Default::default()
        }),
        volume_mounts: Some(vec![VolumeMount {
            name: CONFIG_VOLUME.to_string(),
            mount_path: CONFIG_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        }]),
        ..Default::default()
    };

    Deployment {
        metadata: meta.object_meta(),
        spec: Some(DeploymentSpec {
            selector: LabelSelector {
                match_labels: Some(selector_labels(&meta.proxy_name)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(child_labels(&meta.proxy_name)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(vec![Volume {
                        name: CONFIG_VOLUME.to_string(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: meta.name.clone(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_service(meta: &ChildMeta, spec: &MemcachedProxySpec) -> Service {
    let port = spec.mcrouter.port();

    Service {
        metadata: meta.object_meta(),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(selector_labels(&meta.proxy_name)),
            ports: Some(vec![ServicePort {
                name: Some(PORT_NAME.to_string()),
                port,
                target_port: Some(IntOrString::String(PORT_NAME.to_string())),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
