//! The endpoints controller.
//!
//! Opted-in services have had their native selector stripped, so the
//! platform's built-in endpoint populator ignores them. This controller
//! takes over: while a service's workload has ready pods, its endpoints
//! point at those pods; when it has none, they point at the activator pods
//! instead, which is what routes the wake-up request to the activator in
//! the first place.

mod manager;

use std::collections::{BTreeMap, HashMap};
use std::pin::pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::workloads::is_pod_ready;
use crate::{annotations, healthz, Result};
use manager::ManagerHandle;

/// Endpoints controller runtime configuration
#[derive(Debug, Clone)]
pub struct EndpointsControllerConfig {
    /// Namespace the activator pods run in
    pub namespace: String,
    /// Label key identifying activator pods
    pub activator_pod_label_key: String,
    /// Label value identifying activator pods
    pub activator_pod_label_value: String,
    /// Port the activator's proxy listens on; fallback endpoint addresses
    /// target this port
    pub activator_port: u16,
    /// Port the health endpoint listens on
    pub healthz_port: u16,
}

/// State shared between the controller loop and its per-service managers.
pub(crate) struct Shared {
    pub(crate) client: Client,
    pub(crate) config: EndpointsControllerConfig,
    pub(crate) ready_activator_pods: RwLock<BTreeMap<String, Pod>>,
}

/// Takes over endpoints management for every opted-in service.
pub struct EndpointsController {
    shared: Arc<Shared>,
}

impl EndpointsController {
    /// Create a controller using the given cluster client.
    pub fn new(client: Client, config: EndpointsControllerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                client,
                config,
                ready_activator_pods: RwLock::new(BTreeMap::new()),
            }),
        }
    }

    /// Run the controller until the token is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!("Endpoints controller is started");
        tokio::try_join!(
            self.watch(shutdown.clone()),
            healthz::run_server(self.shared.config.healthz_port, shutdown.clone()),
        )?;
        info!("Endpoints controller is shutting down");
        Ok(())
    }

    /// Watch activator pods and services, running one endpoints manager per
    /// opted-in service.
    async fn watch(&self, shutdown: CancellationToken) -> Result<()> {
        let shared = &self.shared;
        let activator_selector = format!(
            "{}={}",
            shared.config.activator_pod_label_key, shared.config.activator_pod_label_value
        );
        let activator_pods_api: Api<Pod> =
            Api::namespaced(shared.client.clone(), &shared.config.namespace);
        let mut activator_watch = pin!(watcher::watcher(
            activator_pods_api,
            watcher::Config::default().labels(&activator_selector),
        ));
        let services_api: Api<Service> = Api::all(shared.client.clone());
        let mut services_watch = pin!(watcher::watcher(
            services_api,
            watcher::Config::default()
        ));

        let mut managers: HashMap<String, ManagerHandle> = HashMap::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    for (_, handle) in managers.drain() {
                        handle.stop();
                    }
                    return Ok(());
                }
                Some(event) = activator_watch.next() => {
                    match event {
                        Ok(Event::Apply(pod)) | Ok(Event::InitApply(pod)) => {
                            self.sync_activator_pod(pod, false).await;
                        }
                        Ok(Event::Delete(pod)) => {
                            self.sync_activator_pod(pod, true).await;
                        }
                        Ok(Event::Init) | Ok(Event::InitDone) => {}
                        Err(e) => {
                            warn!(error = %e, "Activator pod watch error; stream will retry");
                            continue;
                        }
                    }
                    // Every manager's fallback endpoints depend on the ready
                    // activator set.
                    for handle in managers.values() {
                        handle.resync();
                    }
                }
                Some(event) = services_watch.next() => {
                    match event {
                        Ok(Event::Apply(service)) | Ok(Event::InitApply(service)) => {
                            self.sync_service(&mut managers, service, &shutdown);
                        }
                        Ok(Event::Delete(service)) => {
                            let key = service_key(&service);
                            if let Some(handle) = managers.remove(&key) {
                                handle.stop();
                            }
                        }
                        Ok(Event::Init) | Ok(Event::InitDone) => {}
                        Err(e) => {
                            warn!(error = %e, "Services watch error; stream will retry");
                        }
                    }
                }
            }
        }
    }

    async fn sync_activator_pod(&self, pod: Pod, deleted: bool) {
        let Some(name) = pod.metadata.name.clone() else {
            return;
        };
        let ready = !deleted && is_pod_ready(&pod);
        let mut pods = self.shared.ready_activator_pods.write().await;
        if ready {
            pods.insert(name.clone(), pod);
        } else {
            pods.remove(&name);
        }
        info!(
            pod = %name,
            ready,
            total_ready = pods.len(),
            "Observed activator pod"
        );
    }

    fn sync_service(
        &self,
        managers: &mut HashMap<String, ManagerHandle>,
        service: Service,
        shutdown: &CancellationToken,
    ) {
        let key = service_key(&service);
        let service_annotations = service.metadata.annotations.clone().unwrap_or_default();
        if !annotations::is_enabled(&service_annotations) {
            if let Some(handle) = managers.remove(&key) {
                info!(service = %key, "Service opted out; stopping endpoints management");
                handle.stop();
            }
            return;
        }
        if let Some(existing) = managers.get(&key) {
            if existing.service == service {
                return;
            }
            // Annotations (and so possibly the decoded selector) changed;
            // replace the manager.
            info!(service = %key, "Service changed; restarting endpoints management");
            if let Some(handle) = managers.remove(&key) {
                handle.stop();
            }
        } else {
            info!(service = %key, "Taking over endpoints management");
        }
        match manager::spawn(self.shared.clone(), service, shutdown.child_token()) {
            Ok(handle) => {
                managers.insert(key, handle);
            }
            Err(e) => {
                error!(service = %key, error = %e, "Error creating endpoints manager");
            }
        }
    }
}

fn service_key(service: &Service) -> String {
    format!(
        "{}/{}",
        service.metadata.namespace.as_deref().unwrap_or_default(),
        service.metadata.name.as_deref().unwrap_or_default()
    )
}
