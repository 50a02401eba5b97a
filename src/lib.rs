//! memcached-operator - CRD-driven Kubernetes operator for mcrouter proxy fleets
//!
//! Users declare a `MemcachedProxy` resource holding a tree of routing rules.
//! The operator turns each resource into an mcrouter routing config, a
//! Deployment running mcrouter and a Service in front of it, and keeps those
//! converged as the resource and its backend endpoints change.
//!
//! # Architecture
//!
//! - Watch streams feed object keys into a deduplicating, rate-limited
//!   [`queue::WorkQueue`]
//! - A fixed pool of workers pulls keys and runs the reconciler, never two
//!   reconciles of the same key at once
//! - The reconciler defaults, validates and fingerprints the spec, builds the
//!   target children and diffs them against the cluster
//!
//! # Modules
//!
//! - [`crd`] - The `MemcachedProxy` resource and its rule tree
//! - [`fingerprint`] - Canonical, stable spec hashing
//! - [`queue`] - Work queue with coalescing and per-key backoff
//! - [`controller`] - Dispatcher, worker pool and reconciler
//! - [`builder`] - Pure child resource construction
//! - [`events`] - Kubernetes event publishing
//! - [`retry`] - Backoff configuration
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod builder;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod queue;
pub mod retry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Name used as event reporter, field manager and `managed-by` label value
pub const CONTROLLER_NAME: &str = "memcached-operator";

/// Default mcrouter container image
pub const DEFAULT_MCROUTER_IMAGE: &str = "jphalip/mcrouter:0.36.0";

/// Default port mcrouter listens on
pub const DEFAULT_MCROUTER_PORT: i32 = 11211;

/// Default port of a backend memcached service
pub const DEFAULT_MEMCACHED_PORT: i32 = 11211;

/// Default number of reconcile workers
pub const DEFAULT_WORKERS: usize = 2;

/// Default number of retries for a failing key before giving up
pub const DEFAULT_MAX_RETRIES: u32 = 5;

// =============================================================================
// Labels and Annotations
// =============================================================================

/// Standard Kubernetes label for the application name
pub const LABEL_NAME: &str = "app.kubernetes.io/name";

/// Standard Kubernetes label for the instance name
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";

/// Standard Kubernetes label for the managing controller
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Label naming the proxy that owns a child resource
pub const LABEL_PROXY: &str = "memcached.ianlewis.org/proxy";

/// Annotation carrying the content hash of a child resource
pub const SPEC_HASH_ANNOTATION: &str = "memcached.ianlewis.org/spec-hash";

/// Value of [`LABEL_NAME`] on every managed child
pub const APP_NAME: &str = "mcrouter";

/// Label selector matching every child this operator manages
pub fn managed_selector() -> String {
    format!("{}={}", LABEL_MANAGED_BY, CONTROLLER_NAME)
}
