//! Hypnos - scale-to-zero for Kubernetes HTTP/TLS workloads
//!
//! Hypnos scales idle workloads down to zero replicas and wakes them back up
//! on the first inbound request. It is made of three cooperating roles, all
//! served by this one binary:
//!
//! - The **activator** is a dynamic L4/L7 proxy. Opted-in services whose
//!   workloads are scaled to zero have their endpoints pointed at the
//!   activator; when a request arrives, the activator scales the workload up,
//!   waits for a ready replica, and forwards the original connection.
//! - The **endpoints controller** takes over endpoint population for opted-in
//!   (selector-less) services: ready application pods when any exist,
//!   activator pods otherwise.
//! - The **zeroscaler** watches connection counters reported by each pod's
//!   sidecar proxy and scales workloads to zero once they have been idle for
//!   a full observation window.
//!
//! # Modules
//!
//! - [`net`] - protocol detection and the L4/L7 proxy data plane
//! - [`activator`] - host index, activation coordination, proxy wiring
//! - [`endpoints`] - endpoints controller and per-service managers
//! - [`zeroscaler`] - idleness evaluation and metrics scrapers
//! - [`annotations`] - the `hypnos.io/` annotation surface
//! - [`workloads`] - shared helpers for the scalable workload kinds
//! - [`healthz`] - the health endpoint served by every role
//! - [`error`] - error types

#![deny(missing_docs)]

pub mod activator;
pub mod annotations;
pub mod endpoints;
pub mod error;
pub mod healthz;
pub mod net;
pub mod workloads;
pub mod zeroscaler;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Default port the activator's dynamic proxy listens on.
///
/// The endpoints controller writes fallback endpoints targeting this port, so
/// both roles take it as configuration and only agree on the default.
pub const DEFAULT_ACTIVATOR_PORT: u16 = 5000;

/// Default port for the activator's health endpoint
pub const DEFAULT_ACTIVATOR_HEALTHZ_PORT: u16 = 5001;

/// Default health endpoint port for the controller roles
pub const DEFAULT_CONTROLLER_HEALTHZ_PORT: u16 = 5000;

/// Default zeroscaler check interval, in seconds
pub const DEFAULT_METRICS_CHECK_INTERVAL: u64 = 150;

/// How long an activation may take before waiting connections are released
pub const ACTIVATION_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);

/// Grace period for in-flight work during shutdown
pub const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(5);
