//! The Prometheus scraper: reads connection counters from any target
//! exposing the text exposition format.
//!
//! The workload points the scraper at a port and path plus the names (and
//! optionally label matches) of its opened- and closed-connections metrics.
//! Because a generic exporter has no stable proxy identifier, the pod UID
//! stands in for it: it changes when the pod is replaced, which is the same
//! signal a sidecar restart would give.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use prometheus_parse::{Sample, Scrape, Value};
use tracing::error;

use super::{MetricsScraper, SCRAPE_TIMEOUT};
use crate::workloads::pod_ip;
use crate::zeroscaler::stats::ConnectionStats;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrometheusScraperConfig {
    port: u16,
    #[serde(default = "default_path")]
    path: String,
    opened_connections_metric_name: String,
    #[serde(default)]
    opened_connections_metric_labels: BTreeMap<String, String>,
    closed_connections_metric_name: String,
    #[serde(default)]
    closed_connections_metric_labels: BTreeMap<String, String>,
}

fn default_path() -> String {
    "/metrics".to_owned()
}

/// Scrapes a Prometheus text-format endpoint and extracts the two
/// configured connection counters.
pub struct PrometheusScraper {
    http: reqwest::Client,
    config: PrometheusScraperConfig,
}

impl PrometheusScraper {
    /// Parse the kind-specific configuration and build the scraper.
    pub fn new(implementation: &serde_json::Value) -> Result<Self> {
        let config: PrometheusScraperConfig = serde_json::from_value(implementation.clone())
            .map_err(|e| Error::configuration(format!("invalid prometheus configuration: {e}")))?;
        if config.opened_connections_metric_name.is_empty() {
            return Err(Error::configuration(
                "prometheus metrics can't be scraped: missing openedConnectionsMetricName",
            ));
        }
        if config.closed_connections_metric_name.is_empty() {
            return Err(Error::configuration(
                "prometheus metrics can't be scraped: missing closedConnectionsMetricName",
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(SCRAPE_TIMEOUT)
            .build()
            .map_err(|e| Error::configuration(format!("error building scrape client: {e}")))?;
        Ok(Self { http, config })
    }
}

#[async_trait]
impl MetricsScraper for PrometheusScraper {
    async fn scrape(&self, pod: &Pod) -> Option<ConnectionStats> {
        let ip = pod_ip(pod)?;
        let target = format!("http://{ip}:{}{}", self.config.port, self.config.path);
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
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                error!(target = %target, error = %e, "Error reading metrics response");
                return None;
            }
        };
        let scrape = match Scrape::parse(body.lines().map(|line| Ok(line.to_owned()))) {
            Ok(scrape) => scrape,
            Err(e) => {
                error!(target = %target, error = %e, "Error decoding prometheus metrics");
                return None;
            }
        };

        let opened = extract_metric_value(
            &scrape.samples,
            &self.config.opened_connections_metric_name,
            &self.config.opened_connections_metric_labels,
        );
        let closed = extract_metric_value(
            &scrape.samples,
            &self.config.closed_connections_metric_name,
            &self.config.closed_connections_metric_labels,
        );
        // Never return a half-valid sample.
        let (Some(connections_opened), Some(connections_closed)) = (opened, closed) else {
            error!(target = %target, "Prometheus-scraped metrics are incomplete");
            return None;
        };
        Some(ConnectionStats {
            proxy_id: pod.metadata.uid.clone()?,
            connections_opened,
            connections_closed,
        })
    }
}

/// The value of the first sample in the named family whose labels contain
/// every required pair. Counter, gauge, and untyped samples are readable;
/// other kinds are unsupported.
fn extract_metric_value(
    samples: &[Sample],
    name: &str,
    required_labels: &BTreeMap<String, String>,
) -> Option<u64> {
    let mut family_seen = false;
    for sample in samples.iter().filter(|sample| sample.metric == name) {
        family_seen = true;
        let labels_match = required_labels
            .iter()
            .all(|(key, value)| sample.labels.get(key) == Some(value.as_str()));
        if !labels_match {
            continue;
        }
        return match &sample.value {
            Value::Counter(value) | Value::Gauge(value) | Value::Untyped(value) => {
                Some(*value as u64)
            }
            other => {
                error!(metric = %name, kind = ?other, "Unsupported prometheus metric type");
                None
            }
        };
    }
    if family_seen {
        error!(
            metric = %name,
            "Metric family matched but no sample carried the required labels"
        );
    }
    None
}
