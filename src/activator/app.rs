//! The unit of activation: one (service, port) pair and the workload that
//! backs it.

use std::sync::Arc;

use crate::workloads::{WorkloadId, WorkloadKind};

/// Everything needed to wake a workload and relay a connection to it once
/// awake. Descriptors are immutable values rebuilt wholesale on every index
/// refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDescriptor {
    /// Namespace of the service and its workload
    pub namespace: String,
    /// Name of the opted-in service
    pub service_name: String,
    /// Name of the backing workload
    pub workload_name: String,
    /// Kind of the backing workload
    pub kind: WorkloadKind,
    /// Backend host connections are relayed to (the service's cluster IP)
    pub target_host: String,
    /// Backend port connections are relayed to
    pub target_port: u16,
}

impl AppDescriptor {
    /// The workload identity used to coalesce concurrent activations.
    pub fn workload_id(&self) -> WorkloadId {
        WorkloadId {
            kind: self.kind,
            namespace: self.namespace.clone(),
            name: self.workload_name.clone(),
        }
    }
}

/// Shared handle to a descriptor, as stored in the host index.
pub type SharedApp = Arc<AppDescriptor>;
