//! Shared annotation type definitions
//!
//! This crate contains the pod and node annotation contract shared between the
//! upstream scheduler, the device plugin and the monitor. The string encodings
//! are consumed by components written in other languages, so the formats in
//! [`codec`] are a wire contract and must stay bit-exact.

use serde::Deserialize;
use serde::Serialize;

pub mod codec;

pub use codec::{
    decode_container_devices, decode_node_devices, decode_pod_devices, encode_container_devices,
    encode_node_devices, encode_pod_devices, DecodeError,
};

/// Node the scheduler assigned the pod to.
pub const ASSIGNED_NODE_ANNOTATION: &str = "volcano.sh/vgpu-node";
/// Decimal timestamp written by the scheduler when the pod was assigned.
pub const ASSIGNED_TIME_ANNOTATION: &str = "volcano.sh/vgpu-time";
/// Devices that still have to be handed out by the device plugin.
pub const ASSIGNED_IDS_TO_ALLOCATE_ANNOTATION: &str = "volcano.sh/devices-to-allocate";
/// Outcome of the device bind step.
pub const DEVICE_BIND_PHASE_ANNOTATION: &str = "volcano.sh/bind-phase";
/// Encoded list of devices advertised by a node.
pub const NODE_DEVICE_REGISTERED_ANNOTATION: &str = "volcano.sh/node-vgpu-register";
/// Liveness marker refreshed together with the device list.
pub const NODE_HANDSHAKE_ANNOTATION: &str = "volcano.sh/node-vgpu-handshake";

/// Longest assigned-time value that is still considered a valid timestamp.
pub const POD_ANNOTATION_MAX_LENGTH: usize = 24;

/// Device type string used by whole-GPU sharing requests.
pub const NVIDIA_GPU_DEVICE: &str = "NVIDIA";

/// Value of the bind-phase annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "lowercase")]
pub enum DeviceBindPhase {
    #[display("allocating")]
    Allocating,
    #[display("success")]
    Success,
    #[display("failed")]
    Failed,
}

impl DeviceBindPhase {
    /// Parses the annotation value, returning `None` for unknown phases.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "allocating" => Some(Self::Allocating),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether the bind step already reached a final outcome.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

/// One device grant for a container, as recorded by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContainerDevice {
    /// Device UUID, optionally carrying a MIG geometry reference (`GPU-..[group-pos]`)
    pub uuid: String,
    /// Device type, e.g. `NVIDIA`
    pub device_type: String,
    /// Memory quota in units of the node's memory factor
    pub used_mem: i32,
    /// Core quota in percent
    pub used_cores: i32,
}

/// All device grants of one container.
pub type ContainerDevices = Vec<ContainerDevice>;

/// Device grants of every container of a pod, in container declaration order.
pub type PodDevices = Vec<ContainerDevices>;

/// A device as advertised on the node annotation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeDeviceInfo {
    pub id: String,
    /// Number of tenants the device may be split into
    pub count: i32,
    /// Registered memory in units of the memory factor
    pub devmem: i32,
    pub device_type: String,
    pub health: bool,
    /// Operating mode, e.g. `hami-core` or `mig`
    pub mode: String,
}
