//! Per-workload metrics collector.
//!
//! One collector runs per workload that is a candidate for scale-to-zero.
//! It watches the workload's pods, scrapes every live pod's counters each
//! tick, and scales the workload to zero once a full window passes with no
//! observed (or assumable) activity. The collector ends itself after
//! scaling to zero; the zeroscaler discards it on the next workload event.

use std::collections::{BTreeMap, HashMap};
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::{future, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::scraper::{self, MetricsScraper, ScraperConfig};
use super::stats::{assess_idleness, PodStats};
use crate::workloads::{self, label_selector_string, WorkloadId};
use crate::Result;

/// Wall-clock cap for one tick's scrapes. The idleness decision is made
/// fast or not at all.
const SCRAPE_WINDOW: Duration = Duration::from_secs(3);

/// Everything that defines one collector. A workload event carrying a
/// config that differs in any field replaces the running collector.
#[derive(Debug, Clone, PartialEq)]
pub(super) struct CollectorConfig {
    pub(super) workload: WorkloadId,
    pub(super) selector: BTreeMap<String, String>,
    pub(super) check_interval: Duration,
    pub(super) scraper: ScraperConfig,
}

pub(super) struct MetricsCollector {
    client: Client,
    config: CollectorConfig,
    scraper: Arc<dyn MetricsScraper>,
}

impl MetricsCollector {
    pub(super) fn new(client: Client, config: CollectorConfig) -> Result<Self> {
        let scraper = scraper::new_scraper(&config.scraper)?;
        Ok(Self {
            client,
            config,
            scraper,
        })
    }

    /// Watch pods and evaluate idleness every check interval until cancelled
    /// or until the workload has been scaled to zero.
    pub(super) async fn run(self, cancel: CancellationToken) {
        let workload = self.config.workload.clone();
        info!(
            workload = %workload,
            interval = ?self.config.check_interval,
            scraper = %self.config.scraper.kind,
            "Starting metrics collection"
        );
        let pods_api: Api<Pod> = Api::namespaced(self.client.clone(), &workload.namespace);
        let mut pods_watch = pin!(watcher::watcher(
            pods_api,
            watcher::Config::default().labels(&label_selector_string(&self.config.selector)),
        ));
        let mut current_pods: BTreeMap<String, Pod> = BTreeMap::new();
        let mut all_stats: HashMap<String, PodStats> = HashMap::new();
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.check_interval,
            self.config.check_interval,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut period_end = Utc::now();
        let mut first_tick = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(workload = %workload, "Stopping metrics collection");
                    return;
                }
                Some(event) = pods_watch.next() => {
                    match event {
                        Ok(Event::Apply(pod)) | Ok(Event::InitApply(pod)) => {
                            if let Some(name) = pod.metadata.name.clone() {
                                current_pods.insert(name, pod);
                            }
                        }
                        Ok(Event::Delete(pod)) => {
                            if let Some(name) = pod.metadata.name.as_deref() {
                                current_pods.remove(name);
                                // Retained until the deletion predates the
                                // window, so a pod dying mid-window still
                                // contributes to that window's decision.
                                let deleted_at = pod
                                    .metadata
                                    .deletion_timestamp
                                    .as_ref()
                                    .map(|t| t.0)
                                    .unwrap_or_else(Utc::now);
                                all_stats.entry(name.to_owned()).or_default().deleted_at =
                                    Some(deleted_at);
                            }
                        }
                        Ok(Event::Init) | Ok(Event::InitDone) => {}
                        Err(e) => {
                            warn!(workload = %workload, error = %e, "Pod watch error; stream will retry");
                        }
                    }
                }
                _ = ticker.tick() => {
                    let period_start = period_end;
                    period_end = Utc::now();
                    let timed_out = self.scrape_all(&current_pods, &mut all_stats).await;
                    if first_tick {
                        // No comparison is possible until a second sample
                        // lands.
                        first_tick = false;
                        continue;
                    }
                    let verdict = assess_idleness(&mut all_stats, period_start, period_end);
                    if !timed_out && verdict.idle() && self.scale_to_zero().await {
                        return;
                    }
                }
            }
        }
    }

    /// Scrape every live pod in parallel, bounded by the scrape window.
    /// Returns true when the window elapsed before all pods answered.
    async fn scrape_all(
        &self,
        current_pods: &BTreeMap<String, Pod>,
        all_stats: &mut HashMap<String, PodStats>,
    ) -> bool {
        // Every live pod must carry a record: a pod that has never produced
        // a sample reads as assumed activity rather than being invisible.
        for name in current_pods.keys() {
            all_stats.entry(name.clone()).or_default();
        }
        let scrapes = current_pods.values().map(|pod| {
            let scraper = self.scraper.clone();
            let name = pod.metadata.name.clone().unwrap_or_default();
            let pod = pod.clone();
            async move { (name, scraper.scrape(&pod).await) }
        });
        match tokio::time::timeout(SCRAPE_WINDOW, future::join_all(scrapes)).await {
            Ok(results) => {
                for (name, sample) in results {
                    if let Some(stats) = sample {
                        all_stats.entry(name).or_default().push(Utc::now(), stats);
                    }
                }
                false
            }
            Err(_) => {
                warn!(
                    workload = %self.config.workload,
                    "Scrape window elapsed before all pods answered"
                );
                true
            }
        }
    }

    /// Patch the workload to zero replicas. Returns true on success; on
    /// failure the collector stays alive and retries on a later window.
    async fn scale_to_zero(&self) -> bool {
        let workload = &self.config.workload;
        info!(workload = %workload, "Scale to zero starting");
        match workloads::patch_replicas(&self.client, workload, 0).await {
            Ok(()) => {
                info!(workload = %workload, "Scaled workload to zero");
                true
            }
            Err(e) => {
                error!(workload = %workload, error = %e, "Error scaling workload to zero");
                false
            }
        }
    }
}
