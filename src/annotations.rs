//! The `hypnos.io/` annotation surface.
//!
//! Services and workloads opt into scale-to-zero with annotations. The
//! admission webhooks that install them are external; this module only reads
//! them back.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::{Error, Result};

/// Marks a service or workload as participating in scale-to-zero
pub const ENABLED: &str = "hypnos.io/enabled";

/// Names the Deployment backing an opted-in service
pub const DEPLOYMENT: &str = "hypnos.io/deployment";

/// Names the StatefulSet backing an opted-in service
pub const STATEFULSET: &str = "hypnos.io/statefulset";

/// Explicit ingress default port for a service
pub const INGRESS_DEFAULT_PORT: &str = "hypnos.io/ingressDefaultPort";

/// Explicit TLS default port for a service
pub const TLS_PORT: &str = "hypnos.io/tlsPort";

/// Replica count to restore on activation (default 1)
pub const MIN_REPLICAS: &str = "hypnos.io/minReplicas";

/// Per-workload zeroscaler check interval, in seconds
pub const METRICS_CHECK_INTERVAL: &str = "hypnos.io/metricsCheckInterval";

/// Per-workload scraper selection, JSON `{"type": ..., "implementation": ...}`
pub const METRICS_COLLECTOR: &str = "hypnos.io/metricsCollector";

/// The service's original pod selector, base64(JSON map), stashed by the
/// webhook that stripped the native selector
pub const SELECTOR: &str = "hypnos.io/selector";

/// URL paths the sidecar proxy excludes from its counters. Consumed by the
/// sidecar; carried here only so every annotation key lives in one place.
pub const IGNORED_PATHS: &str = "hypnos.io/ignoredPaths";

static LOAD_BALANCER_HOSTNAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^hypnos\.io/loadBalancerHostname(?:-\d+)?$").expect("static regex"));

static INGRESS_HOSTNAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^hypnos\.io/ingressHostname(?:-\d+)?$").expect("static regex"));

/// Whether the annotated resource participates in scale-to-zero.
pub fn is_enabled(annotations: &BTreeMap<String, String>) -> bool {
    let Some(value) = annotations.get(ENABLED) else {
        return false;
    };
    matches!(
        value.to_lowercase().as_str(),
        "y" | "yes" | "true" | "on" | "1"
    )
}

/// The replica count a workload should be restored to on activation. Falls
/// back to `default` when the annotation is absent or unparsable.
pub fn min_replicas(annotations: &BTreeMap<String, String>, default: i32) -> i32 {
    annotations
        .get(MIN_REPLICAS)
        .and_then(|v| v.parse::<i32>().ok())
        .filter(|n| *n >= 0)
        .unwrap_or(default)
}

/// The per-workload metrics check interval, in seconds.
///
/// Returns `Ok(None)` when the annotation is absent; an error when it is
/// present but not a positive integer, so the caller can log and fall back.
pub fn metrics_check_interval(annotations: &BTreeMap<String, String>) -> Result<Option<u64>> {
    let Some(value) = annotations.get(METRICS_CHECK_INTERVAL) else {
        return Ok(None);
    };
    let seconds: i64 = value.parse().map_err(|e| {
        Error::configuration(format!(
            "invalid value {value:?} for {METRICS_CHECK_INTERVAL}: {e}"
        ))
    })?;
    if seconds <= 0 {
        return Err(Error::configuration(format!(
            "{METRICS_CHECK_INTERVAL} must be positive, got {seconds}"
        )));
    }
    Ok(Some(seconds as u64))
}

/// Decode the stashed pod selector: base64 wrapping a JSON string map.
pub fn decode_selector(annotations: &BTreeMap<String, String>) -> Result<BTreeMap<String, String>> {
    let encoded = annotations
        .get(SELECTOR)
        .ok_or_else(|| Error::configuration(format!("{SELECTOR} annotation not found")))?;
    let json = STANDARD
        .decode(encoded)
        .map_err(|e| Error::configuration(format!("error decoding {SELECTOR}: {e}")))?;
    serde_json::from_slice(&json)
        .map_err(|e| Error::configuration(format!("error unmarshaling {SELECTOR}: {e}")))
}

/// Values of every `loadBalancerHostname` / `loadBalancerHostname-N` annotation.
pub fn load_balancer_hostnames(annotations: &BTreeMap<String, String>) -> Vec<&str> {
    annotations
        .iter()
        .filter(|(k, _)| LOAD_BALANCER_HOSTNAME.is_match(k))
        .map(|(_, v)| v.as_str())
        .collect()
}

/// Values of every `ingressHostname` / `ingressHostname-N` annotation.
pub fn ingress_hostnames(annotations: &BTreeMap<String, String>) -> Vec<&str> {
    annotations
        .iter()
        .filter(|(k, _)| INGRESS_HOSTNAME.is_match(k))
        .map(|(_, v)| v.as_str())
        .collect()
}
