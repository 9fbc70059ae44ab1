//! Kubernetes integration module.
//!
//! Everything that talks to the API server goes through [`ClusterStore`]:
//! pod listing and annotation patches for the allocation queue, node
//! annotations for the node lock and device advertisement, and the device
//! configuration ConfigMap. [`KubeStore`] is the real implementation.

mod kube_client;
pub mod node_lock;
mod store;

#[cfg(test)]
pub mod mock;

pub use kube_client::init_kube_client;
pub use node_lock::NodeLock;
pub use node_lock::NodeLockError;
pub use store::AnnotationPatch;
pub use store::ClusterStore;
pub use store::KubeStore;

#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum KubernetesError {
    #[display("failed to connect to the Kubernetes API server: {message}")]
    ConnectionFailed { message: String },
    #[display("Kubernetes request failed: {message}")]
    RequestFailed { message: String },
    #[display("{resource} not found")]
    NotFound { resource: String },
    #[display("{resource} was modified concurrently")]
    Conflict { resource: String },
}

impl core::error::Error for KubernetesError {}

impl KubernetesError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}
