//! Device & MIG catalog
//!
//! Decides which resources this node serves and which device IDs each
//! resource advertises, depending on the MIG strategy.

use std::collections::BTreeSet;

use error_stack::Report;

use crate::config::MigStrategy;
use crate::config::PluginConfig;
use crate::platform::nvml::GpuInventory;

pub mod mig;

pub use mig::GeometryRef;
pub use mig::MigError;
pub use mig::MigResolver;

/// Memory slots advertised per device by the memory manager.
pub const MEMORY_SLOTS_PER_DEVICE: u32 = 32767;
/// Core slots advertised per device by the cores manager.
pub const CORE_SLOTS_PER_DEVICE: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum CatalogError {
    #[display("MIG strategy `{strategy}` is not supported")]
    Unsupported { strategy: MigStrategy },
    #[display("failed to enumerate devices")]
    Inventory,
}

impl core::error::Error for CatalogError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceKind {
    /// Whole-device shares, carries the allocation protocol
    Count,
    Memory,
    Cores,
    /// MIG instances of one profile, e.g. `1g.10gb`
    MigProfile(String),
}

/// One advertised device ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceId {
    pub id: String,
    pub healthy: bool,
}

/// One resource served by this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceManager {
    pub resource_name: String,
    pub kind: ResourceKind,
    pub strategy: MigStrategy,
}

pub fn mig_resource_name(profile: &str) -> String {
    format!("nvidia.com/mig-{profile}")
}

/// Resource managers for the configured MIG strategy.
pub async fn resource_managers(
    config: &PluginConfig,
    inventory: &dyn GpuInventory,
) -> Result<Vec<ResourceManager>, Report<CatalogError>> {
    let manager = |resource_name: &str, kind| ResourceManager {
        resource_name: resource_name.to_string(),
        kind,
        strategy: config.mig_strategy,
    };

    match config.mig_strategy {
        MigStrategy::None => Ok(vec![
            manager(&config.resource_count_name, ResourceKind::Count),
            manager(&config.resource_memory_name, ResourceKind::Memory),
            manager(&config.resource_core_name, ResourceKind::Cores),
        ]),
        MigStrategy::Single => Err(Report::new(CatalogError::Unsupported {
            strategy: MigStrategy::Single,
        })),
        MigStrategy::Mixed => {
            let profiles: BTreeSet<String> = inventory
                .mig_instances()
                .await
                .map_err(|err| err.change_context(CatalogError::Inventory))?
                .into_iter()
                .map(|mig| mig.profile)
                .collect();
            let mut managers = vec![manager(&config.resource_count_name, ResourceKind::Count)];
            managers.extend(profiles.into_iter().map(|profile| {
                manager(&mig_resource_name(&profile), ResourceKind::MigProfile(profile))
            }));
            Ok(managers)
        }
    }
}

impl ResourceManager {
    /// Device IDs this manager advertises.
    pub async fn device_ids(
        &self,
        config: &PluginConfig,
        inventory: &dyn GpuInventory,
    ) -> Result<Vec<DeviceId>, Report<CatalogError>> {
        let gpus = inventory
            .devices()
            .await
            .map_err(|err| err.change_context(CatalogError::Inventory))?;

        let expand = |suffix: &str, slots: u32| -> Vec<DeviceId> {
            gpus.iter()
                .flat_map(|gpu| {
                    (0..slots).map(move |i| DeviceId {
                        id: format!("{}{suffix}{i}", gpu.uuid),
                        healthy: gpu.healthy,
                    })
                })
                .collect()
        };

        let ids = match (&self.kind, self.strategy) {
            (ResourceKind::Count, MigStrategy::Mixed) => gpus
                .iter()
                .filter(|gpu| !gpu.mig_enabled)
                .map(|gpu| DeviceId {
                    id: gpu.uuid.clone(),
                    healthy: gpu.healthy,
                })
                .collect(),
            (ResourceKind::Count, _) => expand("-", config.device_split_count),
            (ResourceKind::Memory, _) => expand("-memory-", MEMORY_SLOTS_PER_DEVICE),
            (ResourceKind::Cores, _) => expand("-core-", CORE_SLOTS_PER_DEVICE),
            (ResourceKind::MigProfile(profile), _) => inventory
                .mig_instances()
                .await
                .map_err(|err| err.change_context(CatalogError::Inventory))?
                .into_iter()
                .filter(|mig| &mig.profile == profile)
                .map(|mig| DeviceId {
                    id: mig.uuid,
                    healthy: true,
                })
                .collect(),
        };
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::platform::nvml::fake::FakeInventory;

    fn inventory() -> FakeInventory {
        FakeInventory::default()
            .gpu(0, "GPU-0", "NVIDIA A100-SXM4-40GB", 40960)
            .gpu(1, "GPU-1", "NVIDIA A100-SXM4-40GB", 40960)
            .mig(1, 0, "MIG-a", "3g.20gb")
            .mig(1, 1, "MIG-b", "1g.5gb")
            .mig(1, 2, "MIG-c", "1g.5gb")
    }

    fn config(strategy: MigStrategy) -> PluginConfig {
        let mut config = PluginConfig::for_tests(std::path::Path::new("/tmp"));
        config.mig_strategy = strategy;
        config.device_split_count = 2;
        config
    }

    async fn ids(manager: &ResourceManager, config: &PluginConfig) -> Vec<String> {
        manager
            .device_ids(config, &inventory())
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect()
    }

    #[tokio::test]
    async fn none_strategy_serves_count_memory_and_cores() {
        let config = config(MigStrategy::None);
        let managers = resource_managers(&config, &inventory()).await.unwrap();

        let names: Vec<_> = managers.iter().map(|m| m.resource_name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "volcano.sh/vgpu-number",
                "volcano.sh/vgpu-memory",
                "volcano.sh/vgpu-cores"
            ]
        );

        assert_eq!(
            ids(&managers[0], &config).await,
            vec!["GPU-0-0", "GPU-0-1", "GPU-1-0", "GPU-1-1"]
        );

        let memory = ids(&managers[1], &config).await;
        assert_eq!(memory.len(), 2 * MEMORY_SLOTS_PER_DEVICE as usize);
        assert_eq!(memory[0], "GPU-0-memory-0");
        assert_eq!(memory.last().unwrap(), "GPU-1-memory-32766");

        let cores = ids(&managers[2], &config).await;
        assert_eq!(cores.len(), 200);
        assert_eq!(cores[99], "GPU-0-core-99");
    }

    #[tokio::test]
    async fn mixed_strategy_adds_one_manager_per_profile() {
        let config = config(MigStrategy::Mixed);
        let managers = resource_managers(&config, &inventory()).await.unwrap();

        let names: Vec<_> = managers.iter().map(|m| m.resource_name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "volcano.sh/vgpu-number",
                "nvidia.com/mig-1g.5gb",
                "nvidia.com/mig-3g.20gb"
            ]
        );
        assert_eq!(ids(&managers[0], &config).await, vec!["GPU-0"]);
        assert_eq!(ids(&managers[1], &config).await, vec!["MIG-b", "MIG-c"]);
    }

    #[tokio::test]
    async fn single_strategy_is_unsupported() {
        let config = config(MigStrategy::Single);
        let err = resource_managers(&config, &inventory()).await.unwrap_err();
        assert_eq!(
            err.current_context(),
            &CatalogError::Unsupported {
                strategy: MigStrategy::Single
            }
        );
    }
}
