use crate::core::ErrorKind;

#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum AllocationError {
    #[display("{count} container requests in one call, only one is supported")]
    MultipleContainers { count: usize },
    #[display("no pending pod on node {node}")]
    NoPendingPod { node: String },
    #[display("pod {pod} has no pending {device_type} request")]
    NoPendingRequest { pod: String, device_type: String },
    #[display("pod {pod} expects {expected} devices but the call carries {requested}")]
    CountMismatch {
        pod: String,
        expected: usize,
        requested: usize,
    },
    #[display("device {id} is not served by {resource}")]
    UnknownDevice { id: String, resource: String },
    #[display("failed to resolve device {uuid}")]
    Resolution { uuid: String, kind: ErrorKind },
    #[display("node lock is unavailable")]
    LockUnavailable,
    #[display("pod {pod} kept changing while it was being claimed")]
    ClaimConflict { pod: String },
    #[display("failed to query the API server")]
    ClusterAccess,
    #[display("failed to update annotations of pod {pod}")]
    AnnotationUpdate { pod: String },
    #[display("pod {pod} carries an invalid allocation annotation")]
    InvalidAnnotation { pod: String },
    #[display("failed to prepare host directory {path}")]
    HostDirectory { path: String },
    #[display("failed to list devices")]
    Catalog,
}

impl core::error::Error for AllocationError {}

impl AllocationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MultipleContainers { .. }
            | Self::CountMismatch { .. }
            | Self::UnknownDevice { .. }
            | Self::InvalidAnnotation { .. } => ErrorKind::Mismatch,
            Self::NoPendingPod { .. } | Self::NoPendingRequest { .. } => ErrorKind::NotFound,
            Self::Resolution { kind, .. } => *kind,
            Self::LockUnavailable
            | Self::ClaimConflict { .. }
            | Self::ClusterAccess
            | Self::AnnotationUpdate { .. }
            | Self::HostDirectory { .. } => ErrorKind::Transient,
            Self::Catalog => ErrorKind::Fatal,
        }
    }
}
