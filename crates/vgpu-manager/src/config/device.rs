use std::path::Path;

use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use serde::Serialize;

use crate::platform::k8s::ClusterStore;

/// ConfigMap holding the device configuration when no file is given.
pub const DEVICE_CONFIG_MAP: &str = "volcano-vgpu-device-config";
/// Key of the YAML document inside [`DEVICE_CONFIG_MAP`].
pub const DEVICE_CONFIG_KEY: &str = "device-config.yaml";
/// Namespaces searched for [`DEVICE_CONFIG_MAP`], in order.
pub const DEVICE_CONFIG_NAMESPACES: [&str; 2] = ["kube-system", "volcano-system"];

#[derive(Debug, derive_more::Display)]
pub enum ConfigError {
    #[display("failed to read configuration from {source_name}")]
    Read { source_name: String },
    #[display("failed to parse configuration from {source_name}")]
    Parse { source_name: String },
    #[display("invalid value `{value}` for {field}")]
    InvalidValue { field: &'static str, value: String },
}

impl core::error::Error for ConfigError {}

/// One MIG instance kind inside a geometry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigTemplate {
    /// Profile name, e.g. `1g.10gb`
    pub name: String,
    /// Instance memory in MiB
    pub memory: i32,
    pub count: i32,
}

/// A named way of slicing a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub group: String,
    #[serde(rename = "geometries")]
    pub instances: Vec<MigTemplate>,
}

/// Geometries allowed for a set of device models.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedMigGeometries {
    /// Model name fragments, matched as substrings of the device name
    pub models: Vec<String>,
    #[serde(rename = "allowedGeometries")]
    pub geometries: Vec<Geometry>,
}

/// The `nvidia:` section of the device configuration.
///
/// Zero or empty values mean "use the built-in default"; see
/// [`super::PluginConfig`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NvidiaConfig {
    pub resource_count_name: String,
    pub resource_memory_name: String,
    pub resource_core_name: String,
    pub resource_priority_name: String,
    pub device_split_count: u32,
    pub device_memory_scaling: f64,
    pub gpu_memory_factor: u32,
    pub mig_strategy: String,
    #[serde(rename = "knownMigGeometries")]
    pub mig_geometries: Vec<AllowedMigGeometries>,
}

#[derive(Debug, Deserialize)]
struct DeviceConfigDocument {
    #[serde(default)]
    nvidia: NvidiaConfig,
}

impl NvidiaConfig {
    pub fn from_yaml(source_name: &str, text: &str) -> Result<Self, Report<ConfigError>> {
        let doc: DeviceConfigDocument =
            serde_yaml::from_str(text).change_context(ConfigError::Parse {
                source_name: source_name.to_string(),
            })?;
        Ok(doc.nvidia)
    }

    pub async fn from_file(path: &Path) -> Result<Self, Report<ConfigError>> {
        let source_name = path.display().to_string();
        tracing::info!("Loading device configuration from {source_name}");
        let text = tokio::fs::read_to_string(path)
            .await
            .change_context(ConfigError::Read {
                source_name: source_name.clone(),
            })?;
        Self::from_yaml(&source_name, &text)
    }

    /// Reads the device configuration ConfigMap, trying each namespace in
    /// [`DEVICE_CONFIG_NAMESPACES`].
    pub async fn from_cluster(store: &dyn ClusterStore) -> Result<Self, Report<ConfigError>> {
        for namespace in DEVICE_CONFIG_NAMESPACES {
            let source_name = format!("configmap {namespace}/{DEVICE_CONFIG_MAP}");
            let data = match store.get_config_map(namespace, DEVICE_CONFIG_MAP).await {
                Ok(Some(data)) => data,
                Ok(None) => continue,
                Err(err) => {
                    return Err(err.change_context(ConfigError::Read { source_name }));
                }
            };
            let Some(text) = data.get(DEVICE_CONFIG_KEY) else {
                return Err(Report::new(ConfigError::Read { source_name })
                    .attach_printable(format!("missing key {DEVICE_CONFIG_KEY}")));
            };
            tracing::info!("Loaded device configuration from {source_name}");
            return Self::from_yaml(&source_name, text);
        }
        Err(Report::new(ConfigError::Read {
            source_name: format!("configmap {DEVICE_CONFIG_MAP}"),
        })
        .attach_printable(format!(
            "not found in any of {}",
            DEVICE_CONFIG_NAMESPACES.join(", ")
        )))
    }
}

/// Devices excluded from registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceFilter {
    pub uuid: Vec<String>,
    pub index: Vec<u32>,
}

impl DeviceFilter {
    pub fn excludes(&self, uuid: &str, index: u32) -> bool {
        self.uuid.iter().any(|u| u == uuid) || self.index.contains(&index)
    }
}

/// Overrides for one node, matched by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub name: String,
    #[serde(rename = "operatingmode")]
    pub operating_mode: String,
    #[serde(rename = "devicememoryscaling")]
    pub device_memory_scaling: f64,
    #[serde(rename = "devicesplitcount")]
    pub device_split_count: u32,
    #[serde(rename = "migstrategy")]
    pub mig_strategy: String,
    #[serde(rename = "filterdevices")]
    pub filter_devices: Option<DeviceFilter>,
}

#[derive(Debug, Default, Deserialize)]
struct NodeConfigDocument {
    #[serde(default, rename = "nodeconfig")]
    nodes: Vec<NodeConfig>,
}

impl NodeConfig {
    /// Picks the entry for `node_name` out of a node configuration document.
    pub fn from_json(
        source_name: &str,
        text: &str,
        node_name: &str,
    ) -> Result<Option<Self>, Report<ConfigError>> {
        let doc: NodeConfigDocument =
            serde_json::from_str(text).change_context(ConfigError::Parse {
                source_name: source_name.to_string(),
            })?;
        Ok(doc.nodes.into_iter().find(|node| node.name == node_name))
    }

    /// Loads the overrides for `node_name`; a missing file means no overrides.
    pub async fn load(path: &Path, node_name: &str) -> Result<Option<Self>, Report<ConfigError>> {
        let source_name = path.display().to_string();
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No node configuration at {source_name}, using defaults");
                return Ok(None);
            }
            Err(err) => {
                return Err(Report::new(err).change_context(ConfigError::Read { source_name }));
            }
        };
        Self::from_json(&source_name, &text, node_name)
    }
}
