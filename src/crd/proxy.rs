//! MemcachedProxy Custom Resource Definition
//!
//! A MemcachedProxy declares an mcrouter deployment and the rule tree it
//! routes by. The operator owns everything the proxy turns into.

use k8s_openapi::api::core::v1::ResourceRequirements;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::rule::{Rule, RuleSpec};
use crate::{fingerprint, Error, DEFAULT_MCROUTER_IMAGE, DEFAULT_MCROUTER_PORT};

/// Longest accepted proxy name.
///
/// Children are named `<proxy>-mcrouter` and the Service name must be a DNS
/// label of at most 63 characters.
pub const MAX_PROXY_NAME_LEN: usize = 63 - "-mcrouter".len();

/// Specification for a MemcachedProxy
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "ianlewis.org",
    version = "v1alpha1",
    kind = "MemcachedProxy",
    plural = "memcachedproxies",
    shortname = "mcp",
    status = "MemcachedProxyStatus",
    namespaced,
    printcolumn = r#"{"name":"Initialized","type":"boolean","jsonPath":".status.initialized"}"#,
    printcolumn = r#"{"name":"Hash","type":"string","jsonPath":".status.observedSpecHash"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MemcachedProxySpec {
    /// Root of the routing rule tree
    pub rules: RuleSpec,

    /// mcrouter runtime settings
    #[serde(default)]
    pub mcrouter: McRouterSpec,
}

/// mcrouter container settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct McRouterSpec {
    /// Container image, defaults to [`DEFAULT_MCROUTER_IMAGE`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Compute resources for the mcrouter container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Listen port, defaults to [`DEFAULT_MCROUTER_PORT`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
}

impl McRouterSpec {
    fn apply_defaults(&mut self) {
        if self.image.as_deref().map_or(true, str::is_empty) {
            self.image = Some(DEFAULT_MCROUTER_IMAGE.to_string());
        }
        if self.port.is_none() {
            self.port = Some(DEFAULT_MCROUTER_PORT);
        }
    }

    /// Effective container image
    pub fn image(&self) -> &str {
        self.image.as_deref().unwrap_or(DEFAULT_MCROUTER_IMAGE)
    }

    /// Effective listen port
    pub fn port(&self) -> i32 {
        self.port.unwrap_or(DEFAULT_MCROUTER_PORT)
    }

    fn validate(&self) -> Result<(), Error> {
        let port = self.port();
        if !(1..=65535).contains(&port) {
            return Err(Error::validation_field(
                "spec.mcrouter.port",
                format!("port {} is out of range", port),
            ));
        }
        Ok(())
    }
}

impl MemcachedProxySpec {
    /// Fill in mcrouter and rule tree defaults. Idempotent.
    pub fn apply_defaults(&mut self, namespace: &str) {
        self.mcrouter.apply_defaults();
        self.rules.apply_defaults(namespace);
    }

    /// Validate a defaulted spec and return its typed rule tree
    pub fn validate(&self) -> Result<Rule, Error> {
        self.mcrouter.validate()?;
        self.rules.validate()
    }

    /// Stable fingerprint of this spec
    pub fn fingerprint(&self) -> Result<String, Error> {
        fingerprint::fingerprint(self)
    }
}

/// Status for a MemcachedProxy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemcachedProxyStatus {
    /// Fingerprint of the spec the children were last synced from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_spec_hash: Option<String>,

    /// Whether the children have been created at least once
    #[serde(default)]
    pub initialized: bool,
}

impl MemcachedProxyStatus {
    /// Status after a successful sync of the spec with the given fingerprint
    pub fn synced(hash: impl Into<String>) -> Self {
        Self {
            observed_spec_hash: Some(hash.into()),
            initialized: true,
        }
    }

    /// Whether this status already records a sync of `hash`
    pub fn is_current(&self, hash: &str) -> bool {
        self.initialized && self.observed_spec_hash.as_deref() == Some(hash)
    }
}

impl MemcachedProxy {
    /// Namespace the proxy lives in, used to default backend namespaces
    pub fn namespace_or_default(&self) -> String {
        self.namespace().unwrap_or_else(|| "default".to_string())
    }

    /// Copy of the spec with every default applied
    pub fn defaulted_spec(&self) -> MemcachedProxySpec {
        let mut spec = self.spec.clone();
        spec.apply_defaults(&self.namespace_or_default());
        spec
    }

    /// Apply defaults to this resource's spec in place
    pub fn apply_defaults(&mut self) {
        let namespace = self.namespace_or_default();
        self.spec.apply_defaults(&namespace);
    }

    /// Check that the children derived from this proxy's name are valid
    /// object names: a DNS label once `-mcrouter` is appended
    pub fn validate_name(&self) -> Result<(), Error> {
        let name = self.name_any();
        if name.len() > MAX_PROXY_NAME_LEN {
            return Err(Error::validation_field(
                "metadata.name",
                format!(
                    "name is {} characters long, at most {} are allowed",
                    name.len(),
                    MAX_PROXY_NAME_LEN
                ),
            ));
        }

        let is_alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
        if !name.starts_with(|c: char| c.is_ascii_lowercase())
            || !name.ends_with(is_alnum)
            || !name.chars().all(|c| is_alnum(c) || c == '-')
        {
            return Err(Error::validation_field(
                "metadata.name",
                format!(
                    "name {:?} must start with a lowercase letter, end with a letter or digit \
                     and contain only lowercase letters, digits and '-'",
                    name
                ),
            ));
        }
        Ok(())
    }

    /// Whether the stored status already records a sync of `hash`
    pub fn is_synced(&self, hash: &str) -> bool {
        self.status.as_ref().is_some_and(|s| s.is_current(hash))
    }
}
