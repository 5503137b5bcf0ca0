//! Per-service endpoints manager.
//!
//! One manager runs for each opted-in service. It watches the pods the
//! service's stashed selector would have matched and rewrites the service's
//! endpoints object whenever either that set or the ready activator set
//! changes: ready app pods when any match a service port, activator pods as
//! the wake-up fallback otherwise.

use std::collections::{BTreeMap, BTreeSet};
use std::pin::pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{
    EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Pod, Service, ServicePort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, PostParams};
use kube::runtime::watcher::{self, Event};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::Shared;
use crate::workloads::{is_pod_ready, label_selector_string, pod_ip};
use crate::{annotations, Result};

/// Handle held by the controller for one running manager.
pub(super) struct ManagerHandle {
    /// The service object the manager was started with; compared against
    /// incoming updates to decide whether a restart is needed.
    pub(super) service: Service,
    cancel: CancellationToken,
    resync: Arc<Notify>,
}

impl ManagerHandle {
    pub(super) fn stop(&self) {
        self.cancel.cancel();
    }

    /// Ask the manager to recompute endpoints (used when the ready activator
    /// set changes).
    pub(super) fn resync(&self) {
        self.resync.notify_one();
    }
}

/// Decode the service's stashed selector and start its manager task.
///
/// A missing or malformed selector annotation is a configuration error: the
/// service cannot be managed, but the process carries on.
pub(super) fn spawn(
    shared: Arc<Shared>,
    service: Service,
    cancel: CancellationToken,
) -> Result<ManagerHandle> {
    let service_annotations = service.metadata.annotations.clone().unwrap_or_default();
    let selector = annotations::decode_selector(&service_annotations)?;
    let resync = Arc::new(Notify::new());
    tokio::spawn(run_manager(
        shared,
        service.clone(),
        selector,
        cancel.clone(),
        resync.clone(),
    ));
    Ok(ManagerHandle {
        service,
        cancel,
        resync,
    })
}

async fn run_manager(
    shared: Arc<Shared>,
    service: Service,
    selector: BTreeMap<String, String>,
    cancel: CancellationToken,
    resync: Arc<Notify>,
) {
    let namespace = service.metadata.namespace.clone().unwrap_or_default();
    let name = service.metadata.name.clone().unwrap_or_default();
    let pods_api: Api<Pod> = Api::namespaced(shared.client.clone(), &namespace);
    let mut pods_watch = pin!(watcher::watcher(
        pods_api,
        watcher::Config::default().labels(&label_selector_string(&selector)),
    ));
    let mut ready_app_pods: BTreeMap<String, Pod> = BTreeMap::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(
                    service = %name,
                    namespace = %namespace,
                    "Stopping endpoints management"
                );
                return;
            }
            _ = resync.notified() => {
                sync_endpoints(&shared, &service, &ready_app_pods).await;
            }
            Some(event) = pods_watch.next() => {
                match event {
                    Ok(Event::Apply(pod)) | Ok(Event::InitApply(pod)) => {
                        let Some(pod_name) = pod.metadata.name.clone() else {
                            continue;
                        };
                        if is_pod_ready(&pod) {
                            ready_app_pods.insert(pod_name, pod);
                        } else {
                            ready_app_pods.remove(&pod_name);
                        }
                        info!(
                            service = %name,
                            namespace = %namespace,
                            ready_pods = ready_app_pods.len(),
                            "Observed app pod"
                        );
                        sync_endpoints(&shared, &service, &ready_app_pods).await;
                    }
                    Ok(Event::Delete(pod)) => {
                        if let Some(pod_name) = pod.metadata.name.as_deref() {
                            ready_app_pods.remove(pod_name);
                        }
                        sync_endpoints(&shared, &service, &ready_app_pods).await;
                    }
                    Ok(Event::InitDone) => {
                        // Workloads already scaled to zero produce no pod
                        // events at all; write the fallback endpoints now.
                        sync_endpoints(&shared, &service, &ready_app_pods).await;
                    }
                    Ok(Event::Init) => {}
                    Err(e) => {
                        warn!(
                            service = %name,
                            namespace = %namespace,
                            error = %e,
                            "Pod watch error; stream will retry"
                        );
                    }
                }
            }
        }
    }
}

/// Recompute the service's endpoint subsets and write them back.
async fn sync_endpoints(
    shared: &Shared,
    service: &Service,
    ready_app_pods: &BTreeMap<String, Pod>,
) {
    let namespace = service.metadata.namespace.clone().unwrap_or_default();
    let name = service.metadata.name.clone().unwrap_or_default();
    let subsets = {
        let activator_pods = shared.ready_activator_pods.read().await;
        compute_subsets(
            service,
            ready_app_pods,
            &activator_pods,
            shared.config.activator_port,
        )
    };
    let subsets = repack_subsets(subsets);

    info!(
        service = %name,
        namespace = %namespace,
        subsets = subsets.len(),
        "Creating or updating endpoints object"
    );
    let api: Api<Endpoints> = Api::namespaced(shared.client.clone(), &namespace);
    let mut desired = Endpoints {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.clone()),
            ..Default::default()
        },
        subsets: Some(subsets),
    };
    let params = PostParams::default();
    let outcome = match api.get_opt(&name).await {
        Ok(Some(existing)) => {
            desired.metadata.resource_version = existing.metadata.resource_version;
            api.replace(&name, &params, &desired).await.map(|_| ())
        }
        Ok(None) => api.create(&params, &desired).await.map(|_| ()),
        Err(e) => Err(e),
    };
    if let Err(e) = outcome {
        error!(
            service = %name,
            namespace = %namespace,
            error = %e,
            "Error creating or updating endpoints object"
        );
    }
}

/// One subset per (pod, service port) match; activator fallback subsets for
/// every service port no ready app pod serves. Raw output, repacked before
/// writing.
fn compute_subsets(
    service: &Service,
    ready_app_pods: &BTreeMap<String, Pod>,
    ready_activator_pods: &BTreeMap<String, Pod>,
    activator_port: u16,
) -> Vec<EndpointSubset> {
    let service_ports = service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.clone())
        .unwrap_or_default();
    let mut subsets = Vec::new();
    for service_port in &service_ports {
        let mut found_suitable_app_pod = false;
        for pod in ready_app_pods.values() {
            let Some(ip) = pod_ip(pod) else {
                continue;
            };
            let Some(container_port) = find_pod_port(pod, service_port) else {
                continue;
            };
            found_suitable_app_pod = true;
            subsets.push(single_address_subset(ip, service_port, container_port));
        }
        if !found_suitable_app_pod {
            // No ready pod backs this port: route it to the activator so the
            // first request wakes the workload.
            for pod in ready_activator_pods.values() {
                if let Some(ip) = pod_ip(pod) {
                    subsets.push(single_address_subset(
                        ip,
                        service_port,
                        i32::from(activator_port),
                    ));
                }
            }
        }
    }
    subsets
}

fn single_address_subset(ip: &str, service_port: &ServicePort, port: i32) -> EndpointSubset {
    EndpointSubset {
        addresses: Some(vec![EndpointAddress {
            ip: ip.to_owned(),
            ..Default::default()
        }]),
        ports: Some(vec![EndpointPort {
            name: service_port.name.clone(),
            port,
            protocol: service_port.protocol.clone(),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

/// The container port on `pod` that serves `service_port`'s target port, by
/// number or by name. An unset target port falls back to the service port
/// number.
fn find_pod_port(pod: &Pod, service_port: &ServicePort) -> Option<i32> {
    let containers = &pod.spec.as_ref()?.containers;
    for container in containers {
        for port in container.ports.iter().flatten() {
            let matched = match service_port.target_port.as_ref() {
                Some(IntOrString::Int(number)) => port.container_port == *number,
                Some(IntOrString::String(name)) => port.name.as_deref() == Some(name.as_str()),
                None => port.container_port == service_port.port,
            };
            if matched {
                return Some(port.container_port);
            }
        }
    }
    None
}

type PortKey = (Option<String>, i32, Option<String>);

/// The standard endpoints repacking: each address ends up with the union of
/// ports it was emitted with, addresses sharing an identical port set merge
/// into one subset, and the output is deterministically ordered.
fn repack_subsets(subsets: Vec<EndpointSubset>) -> Vec<EndpointSubset> {
    let mut ports_by_ip: BTreeMap<String, BTreeSet<PortKey>> = BTreeMap::new();
    for subset in &subsets {
        for address in subset.addresses.iter().flatten() {
            let entry = ports_by_ip.entry(address.ip.clone()).or_default();
            for port in subset.ports.iter().flatten() {
                entry.insert((port.name.clone(), port.port, port.protocol.clone()));
            }
        }
    }
    let mut addresses_by_ports: BTreeMap<BTreeSet<PortKey>, Vec<String>> = BTreeMap::new();
    for (ip, ports) in ports_by_ip {
        addresses_by_ports.entry(ports).or_default().push(ip);
    }
    addresses_by_ports
        .into_iter()
        .map(|(ports, ips)| EndpointSubset {
            addresses: Some(
                ips.into_iter()
                    .map(|ip| EndpointAddress {
                        ip,
                        ..Default::default()
                    })
                    .collect(),
            ),
            ports: Some(
                ports
                    .into_iter()
                    .map(|(name, port, protocol)| EndpointPort {
                        name,
                        port,
                        protocol,
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec, PodStatus, ServiceSpec};

    fn pod(name: &str, ip: &str, ports: &[(Option<&str>, i32)]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "app".to_owned(),
                    ports: Some(
                        ports
                            .iter()
                            .map(|(port_name, number)| ContainerPort {
                                name: port_name.map(str::to_owned),
                                container_port: *number,
                                ..Default::default()
                            })
                            .collect(),
                    ),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                pod_ip: Some(ip.to_owned()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn service_with_ports(ports: Vec<ServicePort>) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("foo".to_owned()),
                namespace: Some("bar".to_owned()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                ports: Some(ports),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pods(list: Vec<Pod>) -> BTreeMap<String, Pod> {
        list.into_iter()
            .map(|p| (p.metadata.name.clone().unwrap(), p))
            .collect()
    }

    #[test]
    fn target_ports_match_by_number_name_or_default() {
        let pod = pod("web-1", "10.1.0.5", &[(Some("http"), 8080), (None, 9090)]);

        let by_number = ServicePort {
            port: 80,
            target_port: Some(IntOrString::Int(8080)),
            ..Default::default()
        };
        assert_eq!(find_pod_port(&pod, &by_number), Some(8080));

        let by_name = ServicePort {
            port: 80,
            target_port: Some(IntOrString::String("http".to_owned())),
            ..Default::default()
        };
        assert_eq!(find_pod_port(&pod, &by_name), Some(8080));

        let by_default = ServicePort {
            port: 9090,
            ..Default::default()
        };
        assert_eq!(find_pod_port(&pod, &by_default), Some(9090));

        let no_match = ServicePort {
            port: 80,
            target_port: Some(IntOrString::Int(7070)),
            ..Default::default()
        };
        assert_eq!(find_pod_port(&pod, &no_match), None);
    }

    #[test]
    fn ready_app_pods_back_their_service_ports() {
        let service = service_with_ports(vec![ServicePort {
            name: Some("http".to_owned()),
            port: 80,
            target_port: Some(IntOrString::Int(8080)),
            protocol: Some("TCP".to_owned()),
            ..Default::default()
        }]);
        let app_pods = pods(vec![
            pod("web-1", "10.1.0.5", &[(None, 8080)]),
            pod("web-2", "10.1.0.6", &[(None, 8080)]),
        ]);
        let activator_pods = pods(vec![pod("activator-1", "10.2.0.9", &[])]);

        let subsets = repack_subsets(compute_subsets(&service, &app_pods, &activator_pods, 5000));
        assert_eq!(subsets.len(), 1);
        let ips: Vec<&str> = subsets[0]
            .addresses
            .as_ref()
            .unwrap()
            .iter()
            .map(|a| a.ip.as_str())
            .collect();
        assert_eq!(ips, vec!["10.1.0.5", "10.1.0.6"]);
        let ports = subsets[0].ports.as_ref().unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].port, 8080);
        assert_eq!(ports[0].name.as_deref(), Some("http"));
    }

    #[test]
    fn ports_without_app_pods_fall_back_to_the_activator() {
        let service = service_with_ports(vec![
            ServicePort {
                name: Some("http".to_owned()),
                port: 80,
                target_port: Some(IntOrString::Int(8080)),
                ..Default::default()
            },
            ServicePort {
                name: Some("admin".to_owned()),
                port: 9000,
                target_port: Some(IntOrString::Int(9000)),
                ..Default::default()
            },
        ]);
        // The pod serves only the http port; admin has no backer.
        let app_pods = pods(vec![pod("web-1", "10.1.0.5", &[(None, 8080)])]);
        let activator_pods = pods(vec![
            pod("activator-1", "10.2.0.9", &[]),
            pod("activator-2", "10.2.0.10", &[]),
        ]);

        let subsets = repack_subsets(compute_subsets(&service, &app_pods, &activator_pods, 5000));
        assert_eq!(subsets.len(), 2);

        let activator_subset = subsets
            .iter()
            .find(|s| s.ports.as_ref().unwrap()[0].port == 5000)
            .expect("fallback subset");
        let ips: Vec<&str> = activator_subset
            .addresses
            .as_ref()
            .unwrap()
            .iter()
            .map(|a| a.ip.as_str())
            .collect();
        assert_eq!(ips, vec!["10.2.0.9", "10.2.0.10"]);
        assert_eq!(
            activator_subset.ports.as_ref().unwrap()[0].name.as_deref(),
            Some("admin")
        );
    }

    #[test]
    fn no_pods_at_all_yields_one_activator_address_per_port() {
        let service = service_with_ports(vec![ServicePort {
            port: 80,
            target_port: Some(IntOrString::Int(8080)),
            ..Default::default()
        }]);
        let activator_pods = pods(vec![pod("activator-1", "10.2.0.9", &[])]);

        let subsets = repack_subsets(compute_subsets(
            &service,
            &BTreeMap::new(),
            &activator_pods,
            5000,
        ));
        assert_eq!(subsets.len(), 1);
        assert_eq!(subsets[0].ports.as_ref().unwrap()[0].port, 5000);
    }

    #[test]
    fn repack_merges_identical_port_sets_and_unions_per_address() {
        let subset = |ip: &str, port: i32| single_address_subset(
            ip,
            &ServicePort {
                port,
                protocol: Some("TCP".to_owned()),
                ..Default::default()
            },
            port,
        );

        // a and b share port 80; a additionally serves 443, so it must be
        // split out with its full port union.
        let repacked = repack_subsets(vec![
            subset("10.0.0.1", 80),
            subset("10.0.0.2", 80),
            subset("10.0.0.1", 443),
        ]);
        assert_eq!(repacked.len(), 2);

        let single = repacked
            .iter()
            .find(|s| s.addresses.as_ref().unwrap()[0].ip == "10.0.0.1")
            .unwrap();
        assert_eq!(single.addresses.as_ref().unwrap().len(), 1);
        let mut ports: Vec<i32> = single
            .ports
            .as_ref()
            .unwrap()
            .iter()
            .map(|p| p.port)
            .collect();
        ports.sort_unstable();
        assert_eq!(ports, vec![80, 443]);

        let merged = repacked
            .iter()
            .find(|s| s.addresses.as_ref().unwrap()[0].ip == "10.0.0.2")
            .unwrap();
        assert_eq!(merged.ports.as_ref().unwrap().len(), 1);
        assert_eq!(merged.ports.as_ref().unwrap()[0].port, 80);
    }

    #[test]
    fn repack_is_deterministic() {
        let subset = |ip: &str, port: i32| single_address_subset(
            ip,
            &ServicePort {
                port,
                ..Default::default()
            },
            port,
        );
        let forward = repack_subsets(vec![subset("10.0.0.2", 80), subset("10.0.0.1", 80)]);
        let reverse = repack_subsets(vec![subset("10.0.0.1", 80), subset("10.0.0.2", 80)]);
        assert_eq!(forward, reverse);
    }
}
