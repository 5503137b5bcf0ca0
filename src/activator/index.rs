//! The host → app index.
//!
//! Maps every form by which an opted-in service can be addressed - DNS
//! names, cluster IP, external IPs, annotated hostnames, `host:port`,
//! `host:tls`, node addresses with node ports - to the descriptor of the
//! application behind it. The index is rebuilt from scratch on every
//! service or node change and published as a whole, so readers always see a
//! complete snapshot.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Service, ServicePort};
use tracing::{debug, warn};

use super::app::{AppDescriptor, SharedApp};
use crate::annotations;
use crate::workloads::workload_reference;

/// One complete index snapshot
pub type HostIndex = HashMap<String, SharedApp>;

/// Suffix marking host keys that route TLS connections
pub const TLS_KEY_SUFFIX: &str = "tls";

/// Build a fresh index from the current set of opted-in services and node
/// addresses.
///
/// Later services overwrite earlier ones on identical keys; that is a
/// configuration mistake, not a fatal condition.
pub fn build_index(
    services: &BTreeMap<String, Service>,
    node_addresses: &BTreeSet<String>,
) -> HostIndex {
    let mut index = HostIndex::new();
    for service in services.values() {
        index_service(&mut index, service, node_addresses);
    }
    index
}

fn index_service(index: &mut HostIndex, service: &Service, node_addresses: &BTreeSet<String>) {
    let (Some(name), Some(namespace)) = (
        service.metadata.name.as_deref(),
        service.metadata.namespace.as_deref(),
    ) else {
        return;
    };
    let service_annotations = service.metadata.annotations.clone().unwrap_or_default();
    let Some((kind, workload_name)) = workload_reference(&service_annotations) else {
        debug!(
            service = %name,
            namespace = %namespace,
            "Service names no backing workload; not indexing"
        );
        return;
    };
    let Some(cluster_ip) = service
        .spec
        .as_ref()
        .and_then(|spec| spec.cluster_ip.as_deref())
        .filter(|ip| !ip.is_empty() && *ip != "None")
    else {
        warn!(
            service = %name,
            namespace = %namespace,
            "Service has no cluster IP; not indexing"
        );
        return;
    };
    let ports = service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.clone())
        .unwrap_or_default();
    if ports.is_empty() {
        return;
    }

    let ingress_default = ingress_default_port(&service_annotations, &ports);
    let tls_default = tls_default_port(&service_annotations, &ports);

    let qualified = format!("{name}.{namespace}");
    let fqdn = format!("{name}.{namespace}.svc.cluster.local");
    let external_ips: Vec<String> = service
        .status
        .iter()
        .filter_map(|status| status.load_balancer.as_ref())
        .filter_map(|lb| lb.ingress.as_ref())
        .flatten()
        .filter_map(|ingress| ingress.ip.clone())
        .collect();
    let lb_hostnames = annotations::load_balancer_hostnames(&service_annotations);
    let ingress_hostnames = annotations::ingress_hostnames(&service_annotations);

    // Every host form addressable without an annotation-specific rule.
    let mut general_hosts: Vec<String> = vec![
        name.to_owned(),
        qualified.clone(),
        fqdn.clone(),
        cluster_ip.to_owned(),
    ];
    general_hosts.extend(external_ips);
    general_hosts.extend(lb_hostnames.iter().map(|h| h.to_string()));

    for port in &ports {
        let Ok(target_port) = u16::try_from(port.port) else {
            continue;
        };
        let app: SharedApp = Arc::new(AppDescriptor {
            namespace: namespace.to_owned(),
            service_name: name.to_owned(),
            workload_name: workload_name.clone(),
            kind,
            target_host: cluster_ip.to_owned(),
            target_port,
        });

        // Hostnames and IPs without a port suffix resolve only for port 80;
        // ingress-routed hostnames also resolve bare on the ingress default
        // port, since a request relayed by an ingress controller carries no
        // port in its host header.
        if port.port == 80 {
            for host in &general_hosts {
                index.insert(host.clone(), app.clone());
            }
        }
        if ingress_default == Some(port.port) {
            for host in &ingress_hostnames {
                index.insert((*host).to_owned(), app.clone());
            }
        }

        for host in general_hosts.iter().map(String::as_str).chain(
            ingress_hostnames.iter().copied(),
        ) {
            index.insert(format!("{host}:{}", port.port), app.clone());
        }

        if tls_default == Some(port.port) {
            index.insert(format!("{qualified}:{TLS_KEY_SUFFIX}"), app.clone());
            index.insert(format!("{fqdn}:{TLS_KEY_SUFFIX}"), app.clone());
            for host in lb_hostnames.iter().chain(ingress_hostnames.iter()) {
                index.insert(format!("{host}:{TLS_KEY_SUFFIX}"), app.clone());
            }
        }

        if let Some(node_port) = port.node_port {
            for address in node_addresses {
                index.insert(format!("{address}:{node_port}"), app.clone());
            }
        }
    }
}

/// The service port a request arriving without a port (typically relayed by
/// an ingress controller) should be forwarded to.
fn ingress_default_port(
    service_annotations: &BTreeMap<String, String>,
    ports: &[ServicePort],
) -> Option<i32> {
    default_port(
        service_annotations,
        ports,
        annotations::INGRESS_DEFAULT_PORT,
        "http",
        80,
    )
}

/// The service port TLS connections (matched by SNI) are relayed to.
fn tls_default_port(
    service_annotations: &BTreeMap<String, String>,
    ports: &[ServicePort],
) -> Option<i32> {
    default_port(service_annotations, ports, annotations::TLS_PORT, "https", 443)
}

fn default_port(
    service_annotations: &BTreeMap<String, String>,
    ports: &[ServicePort],
    annotation: &str,
    port_name: &str,
    well_known: i32,
) -> Option<i32> {
    if let Some(value) = service_annotations.get(annotation) {
        match value.parse::<i32>() {
            Ok(port) => return Some(port),
            Err(_) => {
                warn!(annotation, value = %value, "Ignoring unparsable port annotation");
            }
        }
    }
    if ports.len() == 1 {
        return Some(ports[0].port);
    }
    if let Some(named) = ports.iter().find(|p| p.name.as_deref() == Some(port_name)) {
        return Some(named.port);
    }
    ports
        .iter()
        .any(|p| p.port == well_known)
        .then_some(well_known)
}
