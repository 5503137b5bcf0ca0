//! The activator: a dynamic proxy that wakes idle workloads.
//!
//! While a workload is scaled to zero, the endpoints controller points its
//! service at the activator pods. The activator maintains an index of every
//! host by which an opted-in service can be addressed; when a connection
//! arrives, it coalesces concurrent activations of the backing workload,
//! patches the replica count, waits for a ready replica to appear in the
//! service's endpoints, and only then relays the held connection.

mod activation;
mod app;
mod index;

pub use app::AppDescriptor;
pub use index::{build_index, HostIndex};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, Service};
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::net::{DynamicProxy, ProxyRouter};
use crate::{annotations, healthz, Error, Result};
use activation::Activations;
use app::SharedApp;
use index::TLS_KEY_SUFFIX;

/// Activator runtime configuration
#[derive(Debug, Clone)]
pub struct ActivatorConfig {
    /// Port the dynamic proxy listens on
    pub proxy_port: u16,
    /// Port the health endpoint listens on
    pub healthz_port: u16,
}

/// The activator process: cluster watchers, the host index, the activation
/// registry, and the dynamic proxy in front of them.
pub struct Activator {
    state: Arc<State>,
}

struct State {
    client: Client,
    index: RwLock<Arc<HostIndex>>,
    activations: Activations,
}

impl Activator {
    /// Create an activator using the given cluster client.
    pub fn new(client: Client) -> Self {
        Self {
            state: Arc::new(State {
                client,
                index: RwLock::new(Arc::new(HostIndex::new())),
                activations: Arc::new(Mutex::new(HashMap::new())),
            }),
        }
    }

    /// Run the activator until the token is cancelled.
    pub async fn run(&self, config: ActivatorConfig, shutdown: CancellationToken) -> Result<()> {
        info!("Activator is started");
        tokio::spawn(watch_cluster(
            self.state.client.clone(),
            self.state.clone(),
            shutdown.clone(),
        ));
        let router = Arc::new(ActivatorRouter {
            state: self.state.clone(),
        });
        let addr = SocketAddr::from(([0, 0, 0, 0], config.proxy_port));
        let proxy = DynamicProxy::bind(addr, router).await?;
        tokio::try_join!(
            proxy.serve(shutdown.clone()),
            healthz::run_server(config.healthz_port, shutdown.clone()),
        )?;
        info!("Activator is shutting down");
        Ok(())
    }
}

/// Routes classified connections through activation. HTTP connections look
/// up the request host verbatim; TLS connections look up the SNI name under
/// its `:tls` key.
struct ActivatorRouter {
    state: Arc<State>,
}

#[async_trait]
impl ProxyRouter for ActivatorRouter {
    async fn route_http(&self, host: &str) -> Result<(String, u16)> {
        info!(host = %host, "Request received for host");
        self.state.activate_and_wait(host).await
    }

    async fn route_tls(&self, server_name: &str) -> Result<(String, u16)> {
        info!(server_name = %server_name, "TLS connection received");
        self.state
            .activate_and_wait(&format!("{server_name}:{TLS_KEY_SUFFIX}"))
            .await
    }
}

impl State {
    /// Look up the host, make sure its workload is being activated, and wait
    /// for the outcome.
    async fn activate_and_wait(&self, host_key: &str) -> Result<(String, u16)> {
        let app: Option<SharedApp> = self.index.read().await.get(host_key).cloned();
        let Some(app) = app else {
            return Err(Error::UnknownHost(host_key.to_owned()));
        };
        info!(
            host = %host_key,
            workload = %app.workload_id(),
            "Workload may require activation"
        );
        let activation =
            activation::ensure_activation(&self.client, &app, &self.activations).await;
        if activation.wait().await {
            Ok((app.target_host.clone(), app.target_port))
        } else {
            Err(Error::ActivationTimeout {
                kind: app.kind.as_str(),
                namespace: app.namespace.clone(),
                name: app.workload_name.clone(),
            })
        }
    }
}

/// Watch services and nodes, rebuilding and republishing the host index on
/// every change. This task is the only writer of the service and node maps;
/// readers only ever see the swapped-in snapshot.
async fn watch_cluster(client: Client, state: Arc<State>, shutdown: CancellationToken) {
    let services_api: Api<Service> = Api::all(client.clone());
    let nodes_api: Api<Node> = Api::all(client);
    let mut services_watch = pin!(watcher::watcher(
        services_api,
        watcher::Config::default()
    ));
    let mut nodes_watch = pin!(watcher::watcher(nodes_api, watcher::Config::default()));

    let mut services: BTreeMap<String, Service> = BTreeMap::new();
    let mut node_addresses: BTreeMap<String, Vec<String>> = BTreeMap::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Cluster watch is shutting down");
                return;
            }
            Some(event) = services_watch.next() => {
                match event {
                    Ok(Event::Apply(service)) | Ok(Event::InitApply(service)) => {
                        apply_service(&mut services, service);
                    }
                    Ok(Event::Delete(service)) => {
                        services.remove(&object_key(service.metadata.namespace.as_deref(), service.metadata.name.as_deref()));
                    }
                    Ok(Event::Init) | Ok(Event::InitDone) => {}
                    Err(e) => {
                        warn!(error = %e, "Services watch error; stream will retry");
                        continue;
                    }
                }
                publish_index(&state, &services, &node_addresses).await;
            }
            Some(event) = nodes_watch.next() => {
                match event {
                    Ok(Event::Apply(node)) | Ok(Event::InitApply(node)) => {
                        apply_node(&mut node_addresses, node);
                    }
                    Ok(Event::Delete(node)) => {
                        if let Some(name) = node.metadata.name.as_deref() {
                            node_addresses.remove(name);
                        }
                    }
                    Ok(Event::Init) | Ok(Event::InitDone) => {}
                    Err(e) => {
                        warn!(error = %e, "Nodes watch error; stream will retry");
                        continue;
                    }
                }
                publish_index(&state, &services, &node_addresses).await;
            }
        }
    }
}

fn object_key(namespace: Option<&str>, name: Option<&str>) -> String {
    format!(
        "{}/{}",
        namespace.unwrap_or_default(),
        name.unwrap_or_default()
    )
}

fn apply_service(services: &mut BTreeMap<String, Service>, service: Service) {
    let key = object_key(
        service.metadata.namespace.as_deref(),
        service.metadata.name.as_deref(),
    );
    let service_annotations = service.metadata.annotations.clone().unwrap_or_default();
    if annotations::is_enabled(&service_annotations) {
        services.insert(key, service);
    } else {
        services.remove(&key);
    }
}

fn apply_node(node_addresses: &mut BTreeMap<String, Vec<String>>, node: Node) {
    let Some(name) = node.metadata.name.clone() else {
        return;
    };
    let addresses = node
        .status
        .as_ref()
        .and_then(|status| status.addresses.as_ref())
        .map(|addresses| {
            addresses
                .iter()
                .map(|address| address.address.clone())
                .collect()
        })
        .unwrap_or_default();
    node_addresses.insert(name, addresses);
}

async fn publish_index(
    state: &State,
    services: &BTreeMap<String, Service>,
    node_addresses: &BTreeMap<String, Vec<String>>,
) {
    let flattened: BTreeSet<String> = node_addresses.values().flatten().cloned().collect();
    let index = build_index(services, &flattened);
    *state.index.write().await = Arc::new(index);
}
