//! GPU inventory
//!
//! Base devices come from NVML. MIG instances, and which instance sits at
//! which position of its parent, come from `nvidia-smi -L`, whose listing
//! reflects a freshly applied partition.

use std::sync::Arc;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use nvml_wrapper::Nvml;
use tokio::process::Command;

pub mod smi;

const SMI_PROGRAM: &str = "nvidia-smi";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuInfo {
    pub index: u32,
    pub uuid: String,
    pub model: String,
    pub memory_mib: u64,
    pub mig_enabled: bool,
    pub healthy: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigInstanceInfo {
    pub parent_index: u32,
    pub parent_uuid: String,
    pub position: u32,
    pub uuid: String,
    /// Profile such as `1g.10gb`
    pub profile: String,
}

#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum InventoryError {
    #[display("NVML is not available")]
    Unavailable,
    #[display("failed to query {what}")]
    Query { what: String },
    #[display("device {uuid} not found")]
    DeviceNotFound { uuid: String },
    #[display("failed to run {command}")]
    Command { command: String },
}

impl core::error::Error for InventoryError {}

/// Source of device facts.
#[async_trait]
pub trait GpuInventory: Send + Sync {
    async fn devices(&self) -> Result<Vec<GpuInfo>, Report<InventoryError>>;

    async fn mig_instances(&self) -> Result<Vec<MigInstanceInfo>, Report<InventoryError>>;

    async fn device_by_uuid(&self, uuid: &str) -> Result<GpuInfo, Report<InventoryError>> {
        self.devices()
            .await?
            .into_iter()
            .find(|gpu| gpu.uuid == uuid)
            .ok_or_else(|| {
                Report::new(InventoryError::DeviceNotFound {
                    uuid: uuid.to_string(),
                })
            })
    }

    /// UUID of the MIG instance at `position` on device `parent_index`.
    async fn mig_uuid_at(
        &self,
        parent_index: u32,
        position: u32,
    ) -> Result<Option<String>, Report<InventoryError>> {
        Ok(self
            .mig_instances()
            .await?
            .into_iter()
            .find(|mig| mig.parent_index == parent_index && mig.position == position)
            .map(|mig| mig.uuid))
    }
}

pub fn init_nvml() -> Result<Nvml, Report<InventoryError>> {
    match Nvml::init() {
        Ok(nvml) => {
            tracing::info!("NVML initialized successfully");
            Ok(nvml)
        }
        Err(_) => {
            tracing::warn!("Standard NVML init failed, trying with explicit library path");
            let nvml = Nvml::builder()
                .lib_path(std::ffi::OsStr::new("libnvidia-ml.so.1"))
                .init()
                .change_context(InventoryError::Unavailable)?;
            tracing::info!("NVML initialized with explicit library path");
            Ok(nvml)
        }
    }
}

/// Runs a listing command without holding a runtime worker and parses it.
async fn smi_listing(
    program: &str,
    args: &[&str],
) -> Result<Vec<smi::SmiGpu>, Report<InventoryError>> {
    let command = format!("{program} {}", args.join(" "));
    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .change_context_lazy(|| InventoryError::Command {
            command: command.clone(),
        })?;
    if !output.status.success() {
        return Err(Report::new(InventoryError::Command { command })
            .attach_printable(String::from_utf8_lossy(&output.stderr).into_owned()));
    }
    Ok(smi::parse_listing(&String::from_utf8_lossy(&output.stdout)))
}

/// Base device facts as NVML reports them.
struct NvmlDevice {
    uuid: String,
    model: String,
    memory_total: u64,
}

fn query_nvml(nvml: &Nvml) -> Result<Vec<NvmlDevice>, Report<InventoryError>> {
    let query = |what: String| InventoryError::Query { what };
    let count = nvml
        .device_count()
        .change_context_lazy(|| query("device count".into()))?;

    (0..count)
        .map(|index| -> Result<NvmlDevice, Report<InventoryError>> {
            let device = nvml
                .device_by_index(index)
                .change_context_lazy(|| query(format!("device {index}")))?;
            Ok(NvmlDevice {
                uuid: device
                    .uuid()
                    .change_context_lazy(|| query(format!("uuid of device {index}")))?,
                model: device
                    .name()
                    .change_context_lazy(|| query(format!("name of device {index}")))?,
                memory_total: device
                    .memory_info()
                    .change_context_lazy(|| query(format!("memory of device {index}")))?
                    .total,
            })
        })
        .collect()
}

pub struct NvmlInventory {
    nvml: Arc<Nvml>,
}

impl NvmlInventory {
    pub fn new(nvml: Arc<Nvml>) -> Self {
        Self { nvml }
    }
}

#[async_trait]
impl GpuInventory for NvmlInventory {
    async fn devices(&self) -> Result<Vec<GpuInfo>, Report<InventoryError>> {
        let nvml = self.nvml.clone();
        let devices = tokio::task::spawn_blocking(move || query_nvml(&nvml))
            .await
            .change_context(InventoryError::Query {
                what: "devices".to_string(),
            })??;

        // Devices with at least one instance are treated as MIG enabled.
        let listing = smi_listing(SMI_PROGRAM, &["-L"]).await.unwrap_or_else(|err| {
            tracing::warn!("Failed to list MIG instances: {err:?}");
            Vec::new()
        });

        Ok(devices
            .into_iter()
            .zip(0..)
            .map(|(device, index)| GpuInfo {
                index,
                mig_enabled: listing
                    .iter()
                    .any(|gpu| gpu.uuid == device.uuid && !gpu.instances.is_empty()),
                uuid: device.uuid,
                model: device.model,
                memory_mib: device.memory_total / (1024 * 1024),
                healthy: true,
            })
            .collect())
    }

    async fn mig_instances(&self) -> Result<Vec<MigInstanceInfo>, Report<InventoryError>> {
        Ok(smi_listing(SMI_PROGRAM, &["-L"])
            .await?
            .into_iter()
            .flat_map(|gpu| {
                let (index, uuid) = (gpu.index, gpu.uuid);
                gpu.instances.into_iter().map(move |mig| MigInstanceInfo {
                    parent_index: index,
                    parent_uuid: uuid.clone(),
                    position: mig.position,
                    uuid: mig.uuid,
                    profile: mig.profile,
                })
            })
            .collect())
    }
}
