//! Device registration
//!
//! Publishes the node's shareable devices on the node object so the
//! scheduler can place pods, together with a handshake timestamp that marks
//! the agent as alive.

use std::sync::Arc;
use std::time::Duration;

use api_types::encode_node_devices;
use api_types::NodeDeviceInfo;
use api_types::NODE_DEVICE_REGISTERED_ANNOTATION;
use api_types::NODE_HANDSHAKE_ANNOTATION;
use chrono::Utc;
use error_stack::Report;
use error_stack::ResultExt;
use tokio_util::sync::CancellationToken;

use crate::config::MigStrategy;
use crate::config::PluginConfig;
use crate::platform::k8s::AnnotationPatch;
use crate::platform::k8s::ClusterStore;
use crate::platform::nvml::GpuInfo;
use crate::platform::nvml::GpuInventory;

pub const REGISTER_INTERVAL: Duration = Duration::from_secs(30);
pub const RETRY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum RegisterError {
    #[display("failed to enumerate devices")]
    Inventory,
    #[display("failed to update node {node}")]
    NodeUpdate { node: String },
}

impl core::error::Error for RegisterError {}

/// Devices as advertised on the node, filtered and scaled.
pub fn node_devices(config: &PluginConfig, gpus: &[GpuInfo]) -> Vec<NodeDeviceInfo> {
    gpus.iter()
        .filter(|gpu| {
            let excluded = config.filter.excludes(&gpu.uuid, gpu.index);
            if excluded {
                tracing::debug!(device = %gpu.uuid, index = gpu.index, "Device filtered out");
            }
            !excluded
        })
        .map(|gpu| {
            let mut memory = gpu.memory_mib;
            if config.mig_strategy == MigStrategy::None {
                memory = (memory as f64 * config.device_memory_scaling) as u64;
            }
            let devmem = memory / u64::from(config.gpu_memory_factor.max(1));
            NodeDeviceInfo {
                id: gpu.uuid.clone(),
                count: i32::try_from(config.device_split_count).unwrap_or(i32::MAX),
                devmem: i32::try_from(devmem).unwrap_or(i32::MAX),
                device_type: format!("NVIDIA-{}", gpu.model),
                health: gpu.healthy,
                mode: config.operating_mode.to_string(),
            }
        })
        .collect()
}

pub struct DeviceRegistrar {
    config: Arc<PluginConfig>,
    store: Arc<dyn ClusterStore>,
    inventory: Arc<dyn GpuInventory>,
}

impl DeviceRegistrar {
    pub fn new(
        config: Arc<PluginConfig>,
        store: Arc<dyn ClusterStore>,
        inventory: Arc<dyn GpuInventory>,
    ) -> Self {
        Self {
            config,
            store,
            inventory,
        }
    }

    /// Writes the device list and the handshake once.
    pub async fn register(&self) -> Result<Vec<NodeDeviceInfo>, Report<RegisterError>> {
        let gpus = self
            .inventory
            .devices()
            .await
            .change_context(RegisterError::Inventory)?;
        let devices = node_devices(&self.config, &gpus);
        let encoded = encode_node_devices(&devices);

        let patch = AnnotationPatch::from([
            (
                NODE_HANDSHAKE_ANNOTATION.to_string(),
                Some(format!("Reported {}", Utc::now())),
            ),
            (
                NODE_DEVICE_REGISTERED_ANNOTATION.to_string(),
                Some(encoded.clone()),
            ),
        ]);
        self.store
            .patch_node_annotations(&self.config.node_name, &patch, None)
            .await
            .change_context_lazy(|| RegisterError::NodeUpdate {
                node: self.config.node_name.clone(),
            })?;

        tracing::info!(devices = %encoded, "Reported devices");
        Ok(devices)
    }

    /// Registers every 30 seconds, or 5 seconds after a failure.
    #[tracing::instrument(skip_all, fields(node = %self.config.node_name))]
    pub async fn run(&self, token: CancellationToken) {
        loop {
            let delay = match self.register().await {
                Ok(_) => REGISTER_INTERVAL,
                Err(err) => {
                    tracing::error!("Device registration failed: {err:?}");
                    RETRY_INTERVAL
                }
            };
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    tracing::info!("Device registration cancelled");
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
