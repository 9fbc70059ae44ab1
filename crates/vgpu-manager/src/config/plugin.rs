use std::path::PathBuf;
use std::sync::Arc;

use error_stack::Report;

use super::daemon::DeviceConfigArgs;
use super::daemon::HostPathArgs;
use super::device::AllowedMigGeometries;
use super::device::ConfigError;
use super::device::DeviceFilter;
use super::device::NodeConfig;
use super::device::NvidiaConfig;
use crate::platform::k8s::ClusterStore;

pub const DEFAULT_RESOURCE_COUNT_NAME: &str = "volcano.sh/vgpu-number";
pub const DEFAULT_RESOURCE_MEMORY_NAME: &str = "volcano.sh/vgpu-memory";
pub const DEFAULT_RESOURCE_CORE_NAME: &str = "volcano.sh/vgpu-cores";
pub const DEFAULT_RESOURCE_PRIORITY_NAME: &str = "volcano.sh/vgpu-priority";
pub const DEFAULT_DEVICE_SPLIT_COUNT: u32 = 10;

/// How containers on this node use their devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum OperatingMode {
    /// Shared devices limited by the interception library
    #[display("hami-core")]
    HamiCore,
    /// Whole MIG instances
    #[display("mig")]
    Mig,
}

impl OperatingMode {
    pub fn parse(value: &str) -> Result<Self, Report<ConfigError>> {
        match value {
            "hami-core" => Ok(Self::HamiCore),
            "mig" => Ok(Self::Mig),
            other => Err(Report::new(ConfigError::InvalidValue {
                field: "operating mode",
                value: other.to_string(),
            })),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum MigStrategy {
    #[display("none")]
    None,
    #[display("single")]
    Single,
    #[display("mixed")]
    Mixed,
}

impl MigStrategy {
    pub fn parse(value: &str) -> Result<Self, Report<ConfigError>> {
        match value {
            "none" => Ok(Self::None),
            "single" => Ok(Self::Single),
            "mixed" => Ok(Self::Mixed),
            other => Err(Report::new(ConfigError::InvalidValue {
                field: "MIG strategy",
                value: other.to_string(),
            })),
        }
    }
}

/// Host locations used when building container responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPaths {
    pub hook_path: PathBuf,
    pub containers_dir: PathBuf,
    pub lock_dir: PathBuf,
    pub mig_config_path: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self {
            hook_path: PathBuf::from("/usr/local/vgpu"),
            containers_dir: PathBuf::from("/tmp/vgpu/containers"),
            lock_dir: PathBuf::from("/tmp/vgpulock"),
            mig_config_path: PathBuf::from("/tmp/migconfig.yaml"),
        }
    }
}

impl From<&HostPathArgs> for HostPaths {
    fn from(args: &HostPathArgs) -> Self {
        Self {
            hook_path: args.hook_path.clone(),
            containers_dir: args.containers_dir.clone(),
            lock_dir: args.lock_dir.clone(),
            mig_config_path: args.mig_config_path.clone(),
        }
    }
}

/// Resolved, immutable configuration of one node agent.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginConfig {
    pub node_name: String,
    pub resource_count_name: String,
    pub resource_memory_name: String,
    pub resource_core_name: String,
    pub resource_priority_name: String,
    pub device_split_count: u32,
    pub device_memory_scaling: f64,
    pub gpu_memory_factor: u32,
    pub operating_mode: OperatingMode,
    pub mig_strategy: MigStrategy,
    pub mig_geometries: Vec<AllowedMigGeometries>,
    pub filter: DeviceFilter,
    pub paths: HostPaths,
}

fn or_default(value: String, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value
    }
}

fn positive_f64(value: f64, default: f64) -> f64 {
    if value > 0.0 {
        value
    } else {
        default
    }
}

impl PluginConfig {
    /// Folds the device configuration and the node's overrides into one
    /// value. Node values win when they are set.
    pub fn resolve(
        node_name: impl Into<String>,
        nvidia: NvidiaConfig,
        node: Option<NodeConfig>,
        paths: HostPaths,
    ) -> Result<Self, Report<ConfigError>> {
        let node = node.unwrap_or_default();

        let mut split_count = nvidia.device_split_count;
        if node.device_split_count > 0 {
            split_count = node.device_split_count;
        }
        let mut memory_scaling = positive_f64(nvidia.device_memory_scaling, 1.0);
        if node.device_memory_scaling > 0.0 {
            memory_scaling = node.device_memory_scaling;
        }

        let operating_mode = if node.operating_mode.is_empty() {
            OperatingMode::HamiCore
        } else {
            OperatingMode::parse(&node.operating_mode)?
        };

        let strategy = if node.mig_strategy.is_empty() {
            nvidia.mig_strategy.as_str()
        } else {
            node.mig_strategy.as_str()
        };
        let mig_strategy = if strategy.is_empty() {
            MigStrategy::None
        } else {
            MigStrategy::parse(strategy)?
        };

        Ok(Self {
            node_name: node_name.into(),
            resource_count_name: or_default(
                nvidia.resource_count_name,
                DEFAULT_RESOURCE_COUNT_NAME,
            ),
            resource_memory_name: or_default(
                nvidia.resource_memory_name,
                DEFAULT_RESOURCE_MEMORY_NAME,
            ),
            resource_core_name: or_default(nvidia.resource_core_name, DEFAULT_RESOURCE_CORE_NAME),
            resource_priority_name: or_default(
                nvidia.resource_priority_name,
                DEFAULT_RESOURCE_PRIORITY_NAME,
            ),
            device_split_count: if split_count == 0 {
                DEFAULT_DEVICE_SPLIT_COUNT
            } else {
                split_count
            },
            device_memory_scaling: memory_scaling,
            gpu_memory_factor: nvidia.gpu_memory_factor.max(1),
            operating_mode,
            mig_strategy,
            mig_geometries: nvidia.mig_geometries,
            filter: node.filter_devices.unwrap_or_default(),
            paths,
        })
    }

    /// Loads both configuration sources and resolves them.
    ///
    /// The device configuration comes from `--config-file` when given,
    /// otherwise from the cluster ConfigMap.
    pub async fn load(
        node_name: &str,
        args: &DeviceConfigArgs,
        paths: HostPaths,
        store: &dyn ClusterStore,
    ) -> Result<Arc<Self>, Report<ConfigError>> {
        let nvidia = match &args.config_file {
            Some(path) => NvidiaConfig::from_file(path).await?,
            None => NvidiaConfig::from_cluster(store).await?,
        };
        let node = NodeConfig::load(&args.node_config_file, node_name).await?;
        let config = Self::resolve(node_name, nvidia, node, paths)?;
        tracing::info!(
            node = %config.node_name,
            split_count = config.device_split_count,
            memory_scaling = config.device_memory_scaling,
            mode = %config.operating_mode,
            mig_strategy = %config.mig_strategy,
            "Resolved device configuration"
        );
        Ok(Arc::new(config))
    }
}

#[cfg(test)]
impl PluginConfig {
    /// Defaults for `node-a` with host paths under `root`.
    pub fn for_tests(root: &std::path::Path) -> Self {
        Self::resolve(
            "node-a",
            NvidiaConfig::default(),
            None,
            HostPaths {
                hook_path: root.join("hook"),
                containers_dir: root.join("containers"),
                lock_dir: root.join("vgpulock"),
                mig_config_path: root.join("migconfig.yaml"),
            },
        )
        .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn defaults_apply_to_empty_config() {
        let config =
            PluginConfig::resolve("node-a", NvidiaConfig::default(), None, HostPaths::default())
                .unwrap();

        assert_eq!(config.resource_count_name, DEFAULT_RESOURCE_COUNT_NAME);
        assert_eq!(config.resource_memory_name, DEFAULT_RESOURCE_MEMORY_NAME);
        assert_eq!(config.resource_core_name, DEFAULT_RESOURCE_CORE_NAME);
        assert_eq!(config.device_split_count, 10);
        assert_eq!(config.device_memory_scaling, 1.0);
        assert_eq!(config.gpu_memory_factor, 1);
        assert_eq!(config.operating_mode, OperatingMode::HamiCore);
        assert_eq!(config.mig_strategy, MigStrategy::None);
        assert_eq!(config.filter, DeviceFilter::default());
    }

    #[test]
    fn node_overrides_win_when_set() {
        let nvidia = NvidiaConfig {
            device_split_count: 5,
            device_memory_scaling: 1.5,
            mig_strategy: "none".to_string(),
            ..Default::default()
        };
        let node = NodeConfig {
            name: "node-a".to_string(),
            operating_mode: "mig".to_string(),
            device_split_count: 3,
            device_memory_scaling: 0.0,
            mig_strategy: "mixed".to_string(),
            ..Default::default()
        };

        let config =
            PluginConfig::resolve("node-a", nvidia, Some(node), HostPaths::default()).unwrap();

        assert_eq!(config.device_split_count, 3);
        assert_eq!(config.device_memory_scaling, 1.5);
        assert_eq!(config.operating_mode, OperatingMode::Mig);
        assert_eq!(config.mig_strategy, MigStrategy::Mixed);
    }

    #[test]
    fn unknown_strategy_is_rejected() {
        let nvidia = NvidiaConfig {
            mig_strategy: "sometimes".to_string(),
            ..Default::default()
        };
        let err = PluginConfig::resolve("node-a", nvidia, None, HostPaths::default()).unwrap_err();
        assert!(matches!(
            err.current_context(),
            ConfigError::InvalidValue { field: "MIG strategy", value } if value == "sometimes"
        ));
    }

    #[test]
    fn unknown_operating_mode_is_rejected() {
        let node = NodeConfig {
            operating_mode: "mps".to_string(),
            ..Default::default()
        };
        assert!(PluginConfig::resolve(
            "node-a",
            NvidiaConfig::default(),
            Some(node),
            HostPaths::default()
        )
        .is_err());
    }
}
