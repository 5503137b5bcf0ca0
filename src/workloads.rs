//! Shared helpers for the two scalable workload kinds.
//!
//! Deployments and StatefulSets are handled uniformly everywhere except at
//! the Kubernetes API boundary, where [`WorkloadId`] picks the typed client.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};

use crate::{annotations, Error, Result};

/// The workload kinds that can be scaled to and from zero
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkloadKind {
    /// apps/v1 Deployment
    Deployment,
    /// apps/v1 StatefulSet
    StatefulSet,
}

impl WorkloadKind {
    /// Lowercase kind name, as used in annotations and log output.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "deployment",
            WorkloadKind::StatefulSet => "statefulset",
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a scalable workload
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkloadId {
    /// Kind of the workload
    pub kind: WorkloadKind,
    /// Namespace the workload lives in
    pub namespace: String,
    /// Workload name
    pub name: String,
}

impl fmt::Display for WorkloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Read the backing workload reference from a service's annotations.
pub fn workload_reference(
    service_annotations: &BTreeMap<String, String>,
) -> Option<(WorkloadKind, String)> {
    if let Some(name) = service_annotations.get(annotations::DEPLOYMENT) {
        return Some((WorkloadKind::Deployment, name.clone()));
    }
    service_annotations
        .get(annotations::STATEFULSET)
        .map(|name| (WorkloadKind::StatefulSet, name.clone()))
}

/// A kind-agnostic view of one workload, extracted from a watch event.
#[derive(Debug, Clone)]
pub struct WorkloadView {
    /// Workload identity
    pub id: WorkloadId,
    /// Workload annotations
    pub annotations: BTreeMap<String, String>,
    /// Desired replica count (`None` when unset)
    pub replicas: Option<i32>,
    /// Currently available replicas
    pub available_replicas: i32,
    /// Pod selector labels
    pub selector: BTreeMap<String, String>,
}

impl WorkloadView {
    /// Extract the view from a Deployment. `None` when metadata is missing
    /// name or namespace (never the case for objects from a watch).
    pub fn from_deployment(deployment: &Deployment) -> Option<Self> {
        Some(Self {
            id: WorkloadId {
                kind: WorkloadKind::Deployment,
                namespace: deployment.metadata.namespace.clone()?,
                name: deployment.metadata.name.clone()?,
            },
            annotations: deployment.metadata.annotations.clone().unwrap_or_default(),
            replicas: deployment.spec.as_ref().and_then(|s| s.replicas),
            available_replicas: deployment
                .status
                .as_ref()
                .and_then(|s| s.available_replicas)
                .unwrap_or_default(),
            selector: selector_labels(deployment.spec.as_ref().map(|s| &s.selector)),
        })
    }

    /// Extract the view from a StatefulSet.
    pub fn from_stateful_set(stateful_set: &StatefulSet) -> Option<Self> {
        Some(Self {
            id: WorkloadId {
                kind: WorkloadKind::StatefulSet,
                namespace: stateful_set.metadata.namespace.clone()?,
                name: stateful_set.metadata.name.clone()?,
            },
            annotations: stateful_set
                .metadata
                .annotations
                .clone()
                .unwrap_or_default(),
            replicas: stateful_set.spec.as_ref().and_then(|s| s.replicas),
            available_replicas: stateful_set
                .status
                .as_ref()
                .and_then(|s| s.available_replicas)
                .unwrap_or_default(),
            selector: selector_labels(stateful_set.spec.as_ref().map(|s| &s.selector)),
        })
    }
}

/// The match labels of a label selector (match expressions are not used by
/// the workloads this system manages).
pub fn selector_labels(selector: Option<&LabelSelector>) -> BTreeMap<String, String> {
    selector
        .and_then(|s| s.match_labels.clone())
        .unwrap_or_default()
}

/// Render labels as the `k=v,k=v` string the watch API expects.
pub fn label_selector_string(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Whether the pod's `Ready` condition is true.
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// The pod's IP, when one has been assigned.
pub fn pod_ip(pod: &Pod) -> Option<&str> {
    pod.status
        .as_ref()
        .and_then(|status| status.pod_ip.as_deref())
}

/// JSON-patch (RFC 6902) the workload's `/spec/replicas`.
pub async fn patch_replicas(client: &Client, id: &WorkloadId, replicas: i32) -> Result<()> {
    let patch: json_patch::Patch = serde_json::from_value(serde_json::json!([
        {"op": "replace", "path": "/spec/replicas", "value": replicas}
    ]))
    .map_err(|e| Error::configuration(format!("error building replicas patch: {e}")))?;
    let params = PatchParams::default();
    match id.kind {
        WorkloadKind::Deployment => {
            let api: Api<Deployment> = Api::namespaced(client.clone(), &id.namespace);
            api.patch(&id.name, &params, &Patch::Json::<()>(patch))
                .await?;
        }
        WorkloadKind::StatefulSet => {
            let api: Api<StatefulSet> = Api::namespaced(client.clone(), &id.namespace);
            api.patch(&id.name, &params, &Patch::Json::<()>(patch))
                .await?;
        }
    }
    Ok(())
}
