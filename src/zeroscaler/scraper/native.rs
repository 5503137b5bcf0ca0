//! The native scraper: reads the sidecar proxy's own JSON counter endpoint.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use tracing::error;

use super::{MetricsScraper, SCRAPE_TIMEOUT};
use crate::workloads::pod_ip;
use crate::zeroscaler::stats::ConnectionStats;
use crate::{Error, Result};

/// Name of the injected sidecar proxy container
pub const PROXY_CONTAINER_NAME: &str = "hypnos-proxy";

/// Name of the sidecar container port serving counters
pub const PROXY_METRICS_PORT_NAME: &str = "hypnos-metrics";

/// Scrapes `GET http://<podIP>:<metricsPort>/metrics`, expecting the
/// sidecar's JSON counter payload.
pub struct NativeScraper {
    http: reqwest::Client,
}

impl NativeScraper {
    /// Build the scraper and its HTTP client.
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(SCRAPE_TIMEOUT)
            .build()
            .map_err(|e| Error::configuration(format!("error building scrape client: {e}")))?;
        Ok(Self { http })
    }

    fn metrics_port(pod: &Pod) -> Option<i32> {
        let containers = &pod.spec.as_ref()?.containers;
        containers
            .iter()
            .find(|container| container.name == PROXY_CONTAINER_NAME)?
            .ports
            .iter()
            .flatten()
            .find(|port| port.name.as_deref() == Some(PROXY_METRICS_PORT_NAME))
            .map(|port| port.container_port)
    }
}

#[async_trait]
impl MetricsScraper for NativeScraper {
    async fn scrape(&self, pod: &Pod) -> Option<ConnectionStats> {
        let name = pod.metadata.name.as_deref().unwrap_or_default();
        let Some(port) = Self::metrics_port(pod) else {
            error!(pod = %name, "Pod has no proxy container");
            return None;
        };
        let ip = pod_ip(pod)?;
        let target = format!("http://{ip}:{port}/metrics");
        let response = match self.http.get(&target).send().await {
            Ok(response) => response,
            Err(e) => {
                error!(target = %target, error = %e, "Error requesting metrics");
                return None;
            }
        };
        if response.status() != reqwest::StatusCode::OK {
            error!(
                target = %target,
                status = %response.status(),
                "Unexpected response requesting metrics"
            );
            return None;
        }
        match response.json::<ConnectionStats>().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                error!(target = %target, error = %e, "Error decoding metrics response");
                None
            }
        }
    }
}
