//! Metrics scrapers: strategies for reading connection counters out of one
//! pod.
//!
//! The strategy is chosen per workload through the
//! `hypnos.io/metricsCollector` annotation; the sidecar's native JSON
//! endpoint is the default.

mod native;
mod prometheus;

pub use native::NativeScraper;
pub use prometheus::PrometheusScraper;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use serde::Deserialize;

use super::stats::ConnectionStats;
use crate::{Error, Result};

/// Scraper kind name for the sidecar's native JSON endpoint
pub const NATIVE_SCRAPER: &str = "native";

/// Scraper kind name for generic Prometheus text-format targets
pub const PROMETHEUS_SCRAPER: &str = "prometheus";

/// An aggressive per-request timeout: metrics for a whole window are
/// collected quickly so pods checked early cannot drift far from pods
/// checked late.
pub(crate) const SCRAPE_TIMEOUT: Duration = Duration::from_secs(2);

/// The `hypnos.io/metricsCollector` annotation payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScraperConfig {
    /// Scraper kind name
    #[serde(rename = "type")]
    pub kind: String,
    /// Kind-specific configuration
    #[serde(default)]
    pub implementation: serde_json::Value,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            kind: NATIVE_SCRAPER.to_owned(),
            implementation: serde_json::Value::Null,
        }
    }
}

/// A strategy for extracting connection counters from one pod.
///
/// Scrape failures are not errors to propagate: a `None` sample leaves the
/// pod's recent stats stale, which the window evaluation reads as assumed
/// activity.
#[async_trait]
pub trait MetricsScraper: Send + Sync {
    /// Fetch the pod's current counters, or `None` when they cannot be read.
    async fn scrape(&self, pod: &Pod) -> Option<ConnectionStats>;
}

/// Build the scraper named by the config. Unknown kinds and invalid
/// kind-specific configuration are configuration errors.
pub fn new_scraper(config: &ScraperConfig) -> Result<Arc<dyn MetricsScraper>> {
    match config.kind.as_str() {
        NATIVE_SCRAPER => Ok(Arc::new(NativeScraper::new()?)),
        PROMETHEUS_SCRAPER => Ok(Arc::new(PrometheusScraper::new(&config.implementation)?)),
        unknown => Err(Error::configuration(format!("unknown scraper {unknown}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annotation_payload_decodes_with_and_without_implementation() {
        let config: ScraperConfig = serde_json::from_str(r#"{"type":"native"}"#).unwrap();
        assert_eq!(config.kind, NATIVE_SCRAPER);
        assert!(config.implementation.is_null());

        let config: ScraperConfig = serde_json::from_str(
            r#"{"type":"prometheus","implementation":{"port":9102,"openedConnectionsMetricName":"a","closedConnectionsMetricName":"b"}}"#,
        )
        .unwrap();
        assert_eq!(config.kind, PROMETHEUS_SCRAPER);
        assert_eq!(config.implementation["port"], 9102);
    }

    #[test]
    fn unknown_scraper_kinds_are_rejected() {
        let config = ScraperConfig {
            kind: "statsd".to_owned(),
            implementation: serde_json::Value::Null,
        };
        assert!(matches!(
            new_scraper(&config),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn the_default_config_selects_the_native_scraper() {
        let config = ScraperConfig::default();
        assert!(new_scraper(&config).is_ok());
    }
}
