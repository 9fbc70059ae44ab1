use std::sync::Arc;

use anyhow::Result;

use crate::config::ClusterArgs;
use crate::config::DeviceConfigArgs;
use crate::config::HostPaths;
use crate::config::PluginConfig;
use crate::core::allocation::AllocationCoordinator;
use crate::core::catalog::MigResolver;
use crate::core::register::DeviceRegistrar;
use crate::platform::k8s::init_kube_client;
use crate::platform::k8s::ClusterStore;
use crate::platform::k8s::KubeStore;
use crate::platform::mig_parted::MigPartedCommand;
use crate::platform::nvml::init_nvml;
use crate::platform::nvml::GpuInventory;
use crate::platform::nvml::NvmlInventory;

/// Connects to the API server.
pub async fn connect_cluster(cluster: &ClusterArgs) -> Result<Arc<dyn ClusterStore>> {
    let client = init_kube_client(cluster.kubeconfig.as_deref())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {e:?}"))?;
    Ok(Arc::new(KubeStore::new(client)))
}

/// Everything a node agent command works with.
pub struct NodeServices {
    pub config: Arc<PluginConfig>,
    pub store: Arc<dyn ClusterStore>,
    pub inventory: Arc<dyn GpuInventory>,
}

impl NodeServices {
    pub async fn build(
        cluster: &ClusterArgs,
        device_config: &DeviceConfigArgs,
        paths: HostPaths,
    ) -> Result<Self> {
        tracing::info!("Building node services...");
        let store = connect_cluster(cluster).await?;

        let config = PluginConfig::load(&cluster.node_name, device_config, paths, store.as_ref())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to load device configuration: {e:?}"))?;

        let nvml = init_nvml().map_err(|e| anyhow::anyhow!("Failed to initialize NVML: {e:?}"))?;
        let inventory: Arc<dyn GpuInventory> = Arc::new(NvmlInventory::new(Arc::new(nvml)));

        Ok(Self {
            config,
            store,
            inventory,
        })
    }

    pub fn coordinator(&self) -> AllocationCoordinator {
        let partitioner = Arc::new(MigPartedCommand::new(
            self.config.paths.mig_config_path.clone(),
        ));
        let resolver = Arc::new(MigResolver::new(
            self.config.mig_geometries.clone(),
            self.inventory.clone(),
            partitioner,
        ));
        AllocationCoordinator::new(
            self.config.clone(),
            self.store.clone(),
            self.inventory.clone(),
            resolver,
        )
    }

    pub fn registrar(&self) -> DeviceRegistrar {
        DeviceRegistrar::new(
            self.config.clone(),
            self.store.clone(),
            self.inventory.clone(),
        )
    }
}
