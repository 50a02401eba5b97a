//! Routing rule tree
//!
//! Users write rules in the loose wire shape [`RuleSpec`]
//! (`{type?, service?, children?}`). After defaulting, [`RuleSpec::validate`]
//! turns a well-formed tree into the typed [`Rule`], where a node is either a
//! pool of child rules or a single backend service, never both.

use std::fmt;

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use schemars::gen::SchemaGenerator;
use schemars::schema::{ArrayValidation, InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Error, DEFAULT_MEMCACHED_PORT};

/// Maximum nesting depth of a rule tree
pub const MAX_RULE_DEPTH: usize = 32;

/// How a rule fans requests out to its children
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash,
)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    /// Each key goes to exactly one child, chosen by hash
    #[default]
    Sharded,
    /// Every request goes to all children
    Replicated,
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleType::Sharded => write!(f, "sharded"),
            RuleType::Replicated => write!(f, "replicated"),
        }
    }
}

/// A routing rule as declared in `spec.rules`
///
/// Exactly one of `service` or `children` must be set. Child order is
/// significant: it decides shard and replica assignment.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuleSpec {
    /// Fan-out type, defaults to `sharded`
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<RuleType>,

    /// Backend service for a leaf rule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceSpec>,

    /// Child rules for an internal rule
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "rule_children_schema")]
    pub children: Vec<RuleSpec>,
}

/// Backend service reference as declared in a leaf rule
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    /// Service name
    pub name: String,

    /// Service namespace, defaults to the proxy's namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Port number or port name, defaults to 11211
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<IntOrString>,
}

/// Schema for `children`.
///
/// Structural CRD schemas cannot be recursive, so nested rules are accepted
/// as opaque objects and checked by [`RuleSpec::validate`] instead.
fn rule_children_schema(_: &mut SchemaGenerator) -> Schema {
    let mut item = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    item.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );

    SchemaObject {
        instance_type: Some(InstanceType::Array.into()),
        array: Some(Box::new(ArrayValidation {
            items: Some(Schema::Object(item).into()),
            ..Default::default()
        })),
        ..Default::default()
    }
    .into()
}

impl RuleSpec {
    /// Create a leaf rule pointing at a service
    pub fn leaf(service: ServiceSpec) -> Self {
        Self {
            service: Some(service),
            ..Default::default()
        }
    }

    /// Create an internal rule with the given children
    pub fn pool(type_: Option<RuleType>, children: Vec<RuleSpec>) -> Self {
        Self {
            type_,
            service: None,
            children,
        }
    }

    /// Fill in defaults for every node of the tree.
    ///
    /// Sets a missing `type` to `sharded` and fills service namespace and
    /// port. Tree shape and child order are never touched, so calling this
    /// on a defaulted tree is a no-op.
    pub fn apply_defaults(&mut self, namespace: &str) {
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            if node.type_.is_none() {
                node.type_ = Some(RuleType::Sharded);
            }
            if let Some(service) = node.service.as_mut() {
                service.apply_defaults(namespace);
            }
            stack.extend(node.children.iter_mut());
        }
    }

    /// Check the tree shape and convert it into a [`Rule`].
    ///
    /// Must run after [`Self::apply_defaults`]; a missing type or namespace
    /// is reported as an error rather than defaulted here.
    pub fn validate(&self) -> Result<Rule, Error> {
        self.validate_at("spec.rules", 0)
    }

    fn validate_at(&self, path: &str, depth: usize) -> Result<Rule, Error> {
        if depth >= MAX_RULE_DEPTH {
            return Err(Error::validation_field(
                path,
                format!("rule tree is nested deeper than {} levels", MAX_RULE_DEPTH),
            ));
        }

        let type_ = self.type_.ok_or_else(|| {
            Error::validation_field(format!("{}.type", path), "rule type is not set")
        })?;

        match (&self.service, self.children.as_slice()) {
            (Some(_), [_, ..]) => Err(Error::validation_field(
                path,
                "rule must have either a service or children, not both",
            )),
            (None, []) => Err(Error::validation_field(
                path,
                "rule must have either a service or children",
            )),
            (Some(service), []) => Ok(Rule::Service {
                type_,
                service: service.validate(&format!("{}.service", path))?,
            }),
            (None, children) => {
                let children = children
                    .iter()
                    .enumerate()
                    .map(|(i, child)| {
                        child.validate_at(&format!("{}.children[{}]", path, i), depth + 1)
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Rule::Pool { type_, children })
            }
        }
    }
}

impl ServiceSpec {
    /// Create a service reference with only a name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the namespace and return self for chaining
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Set the port and return self for chaining
    pub fn port(mut self, port: IntOrString) -> Self {
        self.port = Some(port);
        self
    }

    fn apply_defaults(&mut self, namespace: &str) {
        if self.namespace.as_deref().map_or(true, str::is_empty) {
            self.namespace = Some(namespace.to_string());
        }
        if self.port.is_none() {
            self.port = Some(IntOrString::Int(DEFAULT_MEMCACHED_PORT));
        }
    }

    fn validate(&self, path: &str) -> Result<ServiceRef, Error> {
        if self.name.is_empty() {
            return Err(Error::validation_field(
                format!("{}.name", path),
                "service name is required",
            ));
        }

        let namespace = match self.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => ns.to_string(),
            _ => {
                return Err(Error::validation_field(
                    format!("{}.namespace", path),
                    "service namespace is not set",
                ))
            }
        };

        let port = match &self.port {
            Some(IntOrString::Int(p)) if (1..=65535).contains(p) => BackendPort::Number(*p),
            Some(IntOrString::String(name)) if !name.is_empty() => {
                BackendPort::Name(name.clone())
            }
            Some(other) => {
                return Err(Error::validation_field(
                    format!("{}.port", path),
                    format!("invalid port {:?}", other),
                ))
            }
            None => {
                return Err(Error::validation_field(
                    format!("{}.port", path),
                    "service port is not set",
                ))
            }
        };

        Ok(ServiceRef {
            name: self.name.clone(),
            namespace,
            port,
        })
    }
}

// =============================================================================
// Validated rule tree
// =============================================================================

/// Port of a backend service, by number or by name
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BackendPort {
    /// Numeric port
    Number(i32),
    /// Named service port
    Name(String),
}

impl fmt::Display for BackendPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendPort::Number(p) => write!(f, "{}", p),
            BackendPort::Name(n) => write!(f, "{}", n),
        }
    }
}

/// A fully defaulted reference to a backend service
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceRef {
    /// Service name
    pub name: String,
    /// Service namespace
    pub namespace: String,
    /// Service port
    pub port: BackendPort,
}

impl ServiceRef {
    /// Name of the mcrouter pool serving this backend
    pub fn pool_name(&self) -> String {
        format!("{}.{}.{}", self.namespace, self.name, self.port)
    }
}

impl fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.namespace, self.name, self.port)
    }
}

/// A validated routing rule
#[derive(Clone, Debug, PartialEq)]
pub enum Rule {
    /// Internal node fanning out over child rules, in order
    Pool {
        /// Fan-out type
        type_: RuleType,
        /// Child rules
        children: Vec<Rule>,
    },
    /// Leaf node routing to the endpoints of one service
    Service {
        /// Fan-out type across the service's endpoints
        type_: RuleType,
        /// Backend service
        service: ServiceRef,
    },
}

impl Rule {
    /// Fan-out type of this node
    pub fn rule_type(&self) -> RuleType {
        match self {
            Rule::Pool { type_, .. } | Rule::Service { type_, .. } => *type_,
        }
    }

    /// All backend services in the tree, in first-seen order, without duplicates
    pub fn services(&self) -> Vec<&ServiceRef> {
        let mut out: Vec<&ServiceRef> = Vec::new();
        self.collect_services(&mut out);
        out
    }

    fn collect_services<'a>(&'a self, out: &mut Vec<&'a ServiceRef>) {
        match self {
            Rule::Pool { children, .. } => {
                for child in children {
                    child.collect_services(out);
                }
            }
            Rule::Service { service, .. } => {
                if !out.contains(&service) {
                    out.push(service);
                }
            }
        }
    }

    /// Whether any leaf routes to the service `namespace/name`
    pub fn references(&self, namespace: &str, name: &str) -> bool {
        match self {
            Rule::Pool { children, .. } => children.iter().any(|c| c.references(namespace, name)),
            Rule::Service { service, .. } => service.namespace == namespace && service.name == name,
        }
    }
}
