//! The zeroscaler: drives idle workloads down to zero replicas.
//!
//! Watches Deployments and StatefulSets everywhere. An opted-in workload
//! running at (or under) its minimum replica count gets a metrics
//! collector; the collector scrapes the workload's sidecar proxies for
//! connection counters and, once a full observation window passes with no
//! activity, patches the workload to zero replicas. The activator handles
//! the reverse transition.

mod collector;
pub mod scraper;
pub mod stats;

use std::collections::HashMap;
use std::pin::pin;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::workloads::{WorkloadId, WorkloadView};
use crate::{annotations, healthz, Result};
use collector::{CollectorConfig, MetricsCollector};
use scraper::ScraperConfig;

/// Zeroscaler runtime configuration
#[derive(Debug, Clone)]
pub struct ZeroscalerConfig {
    /// Default check interval in seconds, for workloads without a
    /// `metricsCheckInterval` annotation
    pub metrics_check_interval: u64,
    /// Port the health endpoint listens on
    pub healthz_port: u16,
}

/// The zeroscaler process.
pub struct Zeroscaler {
    client: Client,
    config: ZeroscalerConfig,
}

struct CollectorHandle {
    config: CollectorConfig,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Zeroscaler {
    /// Create a zeroscaler using the given cluster client.
    pub fn new(client: Client, config: ZeroscalerConfig) -> Self {
        Self { client, config }
    }

    /// Run the zeroscaler until the token is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!("Zeroscaler is started");
        tokio::try_join!(
            self.watch(shutdown.clone()),
            healthz::run_server(self.config.healthz_port, shutdown.clone()),
        )?;
        info!("Zeroscaler is shutting down");
        Ok(())
    }

    /// Watch both workload kinds, keeping collector lifecycles in sync with
    /// what each workload's state calls for.
    async fn watch(&self, shutdown: CancellationToken) -> Result<()> {
        let deployments_api: Api<Deployment> = Api::all(self.client.clone());
        let stateful_sets_api: Api<StatefulSet> = Api::all(self.client.clone());
        let mut deployments_watch = pin!(watcher::watcher(
            deployments_api,
            watcher::Config::default()
        ));
        let mut stateful_sets_watch = pin!(watcher::watcher(
            stateful_sets_api,
            watcher::Config::default()
        ));
        let mut collectors: HashMap<WorkloadId, CollectorHandle> = HashMap::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    for (_, handle) in collectors.drain() {
                        handle.cancel.cancel();
                    }
                    return Ok(());
                }
                Some(event) = deployments_watch.next() => {
                    match event {
                        Ok(Event::Apply(deployment)) | Ok(Event::InitApply(deployment)) => {
                            if let Some(view) = WorkloadView::from_deployment(&deployment) {
                                self.sync_workload(&mut collectors, view, &shutdown);
                            }
                        }
                        Ok(Event::Delete(deployment)) => {
                            if let Some(view) = WorkloadView::from_deployment(&deployment) {
                                stop_collector(&mut collectors, &view.id);
                            }
                        }
                        Ok(Event::Init) | Ok(Event::InitDone) => {}
                        Err(e) => {
                            warn!(error = %e, "Deployments watch error; stream will retry");
                        }
                    }
                }
                Some(event) = stateful_sets_watch.next() => {
                    match event {
                        Ok(Event::Apply(stateful_set)) | Ok(Event::InitApply(stateful_set)) => {
                            if let Some(view) = WorkloadView::from_stateful_set(&stateful_set) {
                                self.sync_workload(&mut collectors, view, &shutdown);
                            }
                        }
                        Ok(Event::Delete(stateful_set)) => {
                            if let Some(view) = WorkloadView::from_stateful_set(&stateful_set) {
                                stop_collector(&mut collectors, &view.id);
                            }
                        }
                        Ok(Event::Init) | Ok(Event::InitDone) => {}
                        Err(e) => {
                            warn!(error = %e, "StatefulSets watch error; stream will retry");
                        }
                    }
                }
            }
        }
    }

    fn sync_workload(
        &self,
        collectors: &mut HashMap<WorkloadId, CollectorHandle>,
        view: WorkloadView,
        shutdown: &CancellationToken,
    ) {
        // A collector that ran to completion scaled its workload to zero;
        // its handle is dead weight.
        if let Some(handle) = collectors.get(&view.id) {
            if handle.task.is_finished() {
                collectors.remove(&view.id);
            }
        }
        if !collection_needed(&view) {
            stop_collector(collectors, &view.id);
            return;
        }

        let check_interval = match annotations::metrics_check_interval(&view.annotations) {
            Ok(Some(seconds)) => seconds,
            Ok(None) => self.config.metrics_check_interval,
            Err(e) => {
                warn!(
                    workload = %view.id,
                    error = %e,
                    default = self.config.metrics_check_interval,
                    "Invalid metrics check interval; falling back to the default"
                );
                self.config.metrics_check_interval
            }
        };
        let config = CollectorConfig {
            workload: view.id.clone(),
            selector: view.selector.clone(),
            check_interval: Duration::from_secs(check_interval),
            scraper: scraper_config(&view),
        };

        if let Some(existing) = collectors.get(&view.id) {
            if existing.config == config {
                info!(workload = %view.id, "Using existing metrics collector");
                return;
            }
            stop_collector(collectors, &view.id);
        }
        match MetricsCollector::new(self.client.clone(), config.clone()) {
            Ok(collector) => {
                info!(
                    workload = %view.id,
                    scraper = %config.scraper.kind,
                    interval = ?config.check_interval,
                    "Using new metrics collector"
                );
                let cancel = shutdown.child_token();
                let task = tokio::spawn(collector.run(cancel.clone()));
                collectors.insert(
                    view.id,
                    CollectorHandle {
                        config,
                        cancel,
                        task,
                    },
                );
            }
            Err(e) => {
                error!(workload = %view.id, error = %e, "Metrics collector can't run");
            }
        }
    }
}

fn stop_collector(collectors: &mut HashMap<WorkloadId, CollectorHandle>, id: &WorkloadId) {
    if let Some(handle) = collectors.remove(id) {
        info!(workload = %id, "Ensuring no metrics collection");
        handle.cancel.cancel();
    }
}

/// A workload needs a collector while it is opted in, running, and at or
/// under its minimum replica count. More replicas than the minimum means
/// something else scaled it up and it is clearly not idle; zero replicas
/// means the work is already done.
fn collection_needed(view: &WorkloadView) -> bool {
    annotations::is_enabled(&view.annotations)
        && view.replicas.unwrap_or(0) > 0
        && view.available_replicas <= annotations::min_replicas(&view.annotations, 1)
}

/// The workload's scraper selection; falls back to the native scraper on a
/// missing or unparsable annotation.
fn scraper_config(view: &WorkloadView) -> ScraperConfig {
    let Some(raw) = view.annotations.get(annotations::METRICS_COLLECTOR) else {
        return ScraperConfig::default();
    };
    match serde_json::from_str(raw) {
        Ok(config) => config,
        Err(e) => {
            warn!(
                workload = %view.id,
                error = %e,
                "Error parsing metrics collector configuration; using the default"
            );
            ScraperConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workloads::WorkloadKind;
    use std::collections::BTreeMap;

    fn view(annotations: &[(&str, &str)], replicas: Option<i32>, available: i32) -> WorkloadView {
        WorkloadView {
            id: WorkloadId {
                kind: WorkloadKind::Deployment,
                namespace: "bar".into(),
                name: "foo".into(),
            },
            annotations: annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            replicas,
            available_replicas: available,
            selector: BTreeMap::new(),
        }
    }

    #[test]
    fn collection_runs_only_at_or_under_the_minimum() {
        let enabled = &[(annotations::ENABLED, "true")][..];
        assert!(collection_needed(&view(enabled, Some(1), 1)));
        assert!(collection_needed(&view(enabled, Some(1), 0)));

        // Already at zero, or scaled above the minimum by someone else.
        assert!(!collection_needed(&view(enabled, Some(0), 0)));
        assert!(!collection_needed(&view(enabled, None, 0)));
        assert!(!collection_needed(&view(enabled, Some(3), 3)));

        // Not opted in at all.
        assert!(!collection_needed(&view(&[], Some(1), 1)));
    }

    #[test]
    fn a_raised_minimum_keeps_collection_running() {
        let anns = &[
            (annotations::ENABLED, "yes"),
            (annotations::MIN_REPLICAS, "3"),
        ][..];
        assert!(collection_needed(&view(anns, Some(3), 3)));
        assert!(!collection_needed(&view(anns, Some(5), 5)));
    }

    #[test]
    fn scraper_selection_falls_back_to_native() {
        let configured = view(
            &[(
                annotations::METRICS_COLLECTOR,
                r#"{"type":"prometheus","implementation":{"port":9102}}"#,
            )],
            Some(1),
            1,
        );
        assert_eq!(scraper_config(&configured).kind, "prometheus");

        let unparsable = view(&[(annotations::METRICS_COLLECTOR, "{nope")], Some(1), 1);
        assert_eq!(scraper_config(&unparsable).kind, "native");

        let absent = view(&[], Some(1), 1);
        assert_eq!(scraper_config(&absent).kind, "native");
    }
}
