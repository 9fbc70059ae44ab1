//! Allocation call payloads, shaped like the device plugin API messages.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

pub const VISIBLE_DEVICES_ENV: &str = "NVIDIA_VISIBLE_DEVICES";
pub const MEMORY_LIMIT_ENV_PREFIX: &str = "CUDA_DEVICE_MEMORY_LIMIT_";
pub const SM_LIMIT_ENV: &str = "CUDA_DEVICE_SM_LIMIT";
pub const SHARED_CACHE_ENV: &str = "CUDA_DEVICE_MEMORY_SHARED_CACHE";
pub const TASK_PRIORITY_ENV: &str = "CUDA_TASK_PRIORITY";
/// Set on a container to opt out of the preload hook.
pub const DISABLE_CONTROL_ENV: &str = "CUDA_DISABLE_CONTROL";

pub const CONTAINER_LIBRARY_PATH: &str = "/usr/local/vgpu/libvgpu.so";
pub const CONTAINER_STATE_DIR: &str = "/tmp/vgpu";
pub const CONTAINER_LOCK_DIR: &str = "/tmp/vgpulock";
pub const CONTAINER_PRELOAD_PATH: &str = "/etc/ld.so.preload";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerAllocateRequest {
    pub device_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocateRequest {
    pub container_requests: Vec<ContainerAllocateRequest>,
}

impl AllocateRequest {
    pub fn single(device_ids: Vec<String>) -> Self {
        Self {
            container_requests: vec![ContainerAllocateRequest { device_ids }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    pub container_path: String,
    pub host_path: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerAllocateResponse {
    pub envs: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
}

impl ContainerAllocateResponse {
    /// Response that only exposes `ids`.
    pub fn visible_devices(ids: &[String]) -> Self {
        Self {
            envs: BTreeMap::from([(VISIBLE_DEVICES_ENV.to_string(), ids.join(","))]),
            mounts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocateResponse {
    pub container_responses: Vec<ContainerAllocateResponse>,
}
