//! Activation records: the in-flight state of waking one workload.
//!
//! Concurrent requests for the same workload coalesce onto a single record,
//! so one activation epoch issues at most one replica patch. The record's
//! driver task owns the scale-up call and the pod/endpoints watchers; every
//! waiting connection just holds the record's monotone success and timeout
//! signals.

use std::collections::{HashMap, HashSet};
use std::pin::pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Endpoints, Pod};
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client};
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use super::app::{AppDescriptor, SharedApp};
use crate::workloads::{self, WorkloadId, WorkloadKind};
use crate::{annotations, Result, ACTIVATION_TIMEOUT};

/// In-flight activations, keyed by workload identity. At most one record per
/// workload exists at any instant.
pub(super) type Activations = Arc<Mutex<HashMap<WorkloadId, Activation>>>;

/// A waiter's handle onto one in-flight activation.
///
/// Both signals are monotone: once fired they stay fired, so late joiners
/// observe the same outcome as the caller that started the activation.
#[derive(Clone)]
pub(super) struct Activation {
    success: watch::Receiver<bool>,
    timeout: watch::Receiver<bool>,
}

impl Activation {
    /// Block until the activation resolves. Returns `true` on success,
    /// `false` on timeout (or if the driver died without deciding).
    pub(super) async fn wait(&self) -> bool {
        let mut success = self.success.clone();
        let mut timeout = self.timeout.clone();
        tokio::select! {
            result = success.wait_for(|fired| *fired) => result.is_ok(),
            _ = timeout.wait_for(|fired| *fired) => false,
        }
    }
}

/// The sending halves of a record's signals, owned by its driver task.
pub(super) struct DriverSignals {
    success: watch::Sender<bool>,
    timeout: watch::Sender<bool>,
}

/// Get the existing record for the workload or insert a fresh one.
///
/// Returns the driver signals only to the caller that actually inserted,
/// which is therefore the only caller that spawns a driver.
pub(super) async fn register(
    activations: &Activations,
    id: &WorkloadId,
) -> (Activation, Option<DriverSignals>) {
    let mut registry = activations.lock().await;
    if let Some(existing) = registry.get(id) {
        info!(workload = %id, "Found activation in progress");
        return (existing.clone(), None);
    }
    info!(workload = %id, "Found no activation in progress");
    let (success_tx, success_rx) = watch::channel(false);
    let (timeout_tx, timeout_rx) = watch::channel(false);
    let activation = Activation {
        success: success_rx,
        timeout: timeout_rx,
    };
    registry.insert(id.clone(), activation.clone());
    (
        activation,
        Some(DriverSignals {
            success: success_tx,
            timeout: timeout_tx,
        }),
    )
}

/// Ensure an activation is in flight for the app's workload and return a
/// handle to wait on.
pub(super) async fn ensure_activation(
    client: &Client,
    app: &SharedApp,
    activations: &Activations,
) -> Activation {
    let id = app.workload_id();
    let (activation, signals) = register(activations, &id).await;
    if let Some(signals) = signals {
        tokio::spawn(drive_activation(
            client.clone(),
            app.clone(),
            id,
            signals,
            activations.clone(),
        ));
    }
    activation
}

/// Scale the workload up if needed, then watch for a ready replica to land
/// in the service's endpoints. Removes the record from the registry on exit,
/// whichever signal fired.
async fn drive_activation(
    client: Client,
    app: SharedApp,
    id: WorkloadId,
    signals: DriverSignals,
    activations: Activations,
) {
    match scale_up(&client, &app).await {
        Ok(selector) => {
            watch_for_completion(&client, &app, &selector, &signals).await;
        }
        Err(e) => {
            // Releasing waiters immediately beats letting them sit out the
            // full activation window against a workload we could not read.
            error!(workload = %id, error = %e, "Error activating workload");
            signals.timeout.send_replace(true);
        }
    }
    activations.lock().await.remove(&id);
}

/// Read the workload and, if it currently asks for zero replicas, patch it
/// up to its configured minimum. A workload with replicas unset or already
/// positive is being scaled by someone else; the patch is skipped.
///
/// Returns the workload's pod selector for the completion watch.
async fn scale_up(client: &Client, app: &AppDescriptor) -> Result<String> {
    let (replicas, workload_annotations, selector) = match app.kind {
        WorkloadKind::Deployment => {
            let api: Api<Deployment> = Api::namespaced(client.clone(), &app.namespace);
            let deployment = api.get(&app.workload_name).await?;
            (
                deployment.spec.as_ref().and_then(|s| s.replicas),
                deployment.metadata.annotations.unwrap_or_default(),
                workloads::selector_labels(deployment.spec.as_ref().map(|s| &s.selector)),
            )
        }
        WorkloadKind::StatefulSet => {
            let api: Api<StatefulSet> = Api::namespaced(client.clone(), &app.namespace);
            let stateful_set = api.get(&app.workload_name).await?;
            (
                stateful_set.spec.as_ref().and_then(|s| s.replicas),
                stateful_set.metadata.annotations.unwrap_or_default(),
                workloads::selector_labels(stateful_set.spec.as_ref().map(|s| &s.selector)),
            )
        }
    };
    if replicas == Some(0) {
        let min = annotations::min_replicas(&workload_annotations, 1);
        workloads::patch_replicas(client, &app.workload_id(), min).await?;
        info!(
            workload = %app.workload_id(),
            replicas = min,
            "Requested scale-up"
        );
    } else {
        // Scaling is already in progress, perhaps initiated by another
        // process, or may even be complete.
        info!(
            workload = %app.workload_id(),
            "Replica count is unset or positive; skipping the patch"
        );
    }
    Ok(workloads::label_selector_string(&selector))
}

/// Watch the workload's pods and the service's endpoints object until some
/// endpoints address belongs to a pod we have seen become ready, or the
/// activation window elapses.
///
/// Requiring the intersection closes the race where the endpoints object
/// updates before the pod's ready condition propagates, or vice versa.
async fn watch_for_completion(
    client: &Client,
    app: &AppDescriptor,
    selector: &str,
    signals: &DriverSignals,
) {
    let pods_api: Api<Pod> = Api::namespaced(client.clone(), &app.namespace);
    let mut pods = pin!(watcher::watcher(
        pods_api,
        watcher::Config::default().labels(selector),
    ));
    let endpoints_api: Api<Endpoints> = Api::namespaced(client.clone(), &app.namespace);
    let mut endpoints_watch = pin!(watcher::watcher(
        endpoints_api,
        watcher::Config::default().fields(&format!("metadata.name={}", app.service_name)),
    ));
    let deadline = tokio::time::sleep(ACTIVATION_TIMEOUT);
    tokio::pin!(deadline);

    let mut ready_ips: HashSet<String> = HashSet::new();
    let mut latest_endpoints: Option<Endpoints> = None;

    loop {
        tokio::select! {
            _ = &mut deadline => {
                error!(workload = %app.workload_id(), "Activation timed out");
                signals.timeout.send_replace(true);
                return;
            }
            Some(event) = pods.next() => {
                match event {
                    Ok(Event::Apply(pod)) | Ok(Event::InitApply(pod)) => {
                        if let Some(ip) = workloads::pod_ip(&pod) {
                            if workloads::is_pod_ready(&pod) {
                                ready_ips.insert(ip.to_owned());
                            } else {
                                ready_ips.remove(ip);
                            }
                        }
                    }
                    Ok(Event::Delete(pod)) => {
                        if let Some(ip) = workloads::pod_ip(&pod) {
                            ready_ips.remove(ip);
                        }
                    }
                    Ok(Event::Init) | Ok(Event::InitDone) => {}
                    Err(e) => {
                        warn!(workload = %app.workload_id(), error = %e, "Pod watch error");
                    }
                }
            }
            Some(event) = endpoints_watch.next() => {
                match event {
                    Ok(Event::Apply(endpoints)) | Ok(Event::InitApply(endpoints)) => {
                        latest_endpoints = Some(endpoints);
                    }
                    Ok(Event::Delete(_)) => {
                        latest_endpoints = None;
                    }
                    Ok(Event::Init) | Ok(Event::InitDone) => {}
                    Err(e) => {
                        warn!(workload = %app.workload_id(), error = %e, "Endpoints watch error");
                    }
                }
            }
        }
        if let Some(ip) = in_service_ip(&ready_ips, latest_endpoints.as_ref()) {
            info!(ip = %ip, workload = %app.workload_id(), "App pod is in service");
            signals.success.send_replace(true);
            return;
        }
    }
}

/// The first endpoints address that belongs to a pod observed ready, if any.
fn in_service_ip(ready_ips: &HashSet<String>, endpoints: Option<&Endpoints>) -> Option<String> {
    let endpoints = endpoints?;
    endpoints
        .subsets
        .iter()
        .flatten()
        .filter_map(|subset| subset.addresses.as_ref())
        .flatten()
        .find(|address| ready_ips.contains(&address.ip))
        .map(|address| address.ip.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{EndpointAddress, EndpointSubset};

    fn endpoints_with_ips(ips: &[&str]) -> Endpoints {
        Endpoints {
            subsets: Some(vec![EndpointSubset {
                addresses: Some(
                    ips.iter()
                        .map(|ip| EndpointAddress {
                            ip: ip.to_string(),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }

    fn test_id() -> WorkloadId {
        WorkloadId {
            kind: WorkloadKind::Deployment,
            namespace: "bar".into(),
            name: "foo".into(),
        }
    }

    #[test]
    fn completion_requires_a_ready_pod_behind_an_endpoint_address() {
        let ready: HashSet<String> = ["10.1.0.5".to_string()].into_iter().collect();

        // Endpoint address without a matching ready pod: not complete.
        let endpoints = endpoints_with_ips(&["10.1.0.9"]);
        assert_eq!(in_service_ip(&ready, Some(&endpoints)), None);

        // Ready pod with no endpoints object yet: not complete.
        assert_eq!(in_service_ip(&ready, None), None);

        // Intersection: complete.
        let endpoints = endpoints_with_ips(&["10.1.0.9", "10.1.0.5"]);
        assert_eq!(
            in_service_ip(&ready, Some(&endpoints)).as_deref(),
            Some("10.1.0.5")
        );
    }

    #[tokio::test]
    async fn concurrent_registrations_coalesce_onto_one_driver() {
        let activations: Activations = Arc::new(Mutex::new(HashMap::new()));
        let id = test_id();

        let mut drivers = 0;
        let mut handles = Vec::new();
        for _ in 0..10 {
            let activations = activations.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                let (_, signals) = register(&activations, &id).await;
                signals.is_some()
            }));
        }
        for handle in handles {
            if handle.await.unwrap() {
                drivers += 1;
            }
        }
        assert_eq!(drivers, 1, "exactly one caller should own the driver");
        assert_eq!(activations.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn success_releases_waiters_and_late_joiners() {
        let activations: Activations = Arc::new(Mutex::new(HashMap::new()));
        let id = test_id();
        let (activation, signals) = register(&activations, &id).await;
        let signals = signals.unwrap();

        let waiter = tokio::spawn({
            let activation = activation.clone();
            async move { activation.wait().await }
        });
        signals.success.send_replace(true);
        assert!(waiter.await.unwrap());

        // A caller arriving after the signal fired sees the same outcome.
        assert!(activation.wait().await);
    }

    #[tokio::test]
    async fn timeout_releases_waiters_without_success() {
        let activations: Activations = Arc::new(Mutex::new(HashMap::new()));
        let (activation, signals) = register(&activations, &test_id()).await;
        signals.unwrap().timeout.send_replace(true);
        assert!(!activation.wait().await);
    }

    #[tokio::test]
    async fn a_removed_record_allows_a_fresh_activation_attempt() {
        let activations: Activations = Arc::new(Mutex::new(HashMap::new()));
        let id = test_id();

        let (first, signals) = register(&activations, &id).await;
        signals.unwrap().timeout.send_replace(true);
        assert!(!first.wait().await);

        // The driver removes the record on timeout; the next request starts
        // over with a new driver.
        activations.lock().await.remove(&id);
        let (second, signals) = register(&activations, &id).await;
        assert!(signals.is_some(), "a fresh record should get a new driver");
        signals.unwrap().success.send_replace(true);
        assert!(second.wait().await);
    }

    #[tokio::test]
    async fn a_dead_driver_counts_as_timeout() {
        let activations: Activations = Arc::new(Mutex::new(HashMap::new()));
        let (activation, signals) = register(&activations, &test_id()).await;
        drop(signals);
        assert!(!activation.wait().await);
    }
}
