use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;

/// Name of the configuration produced by `nvidia-mig-parted export`.
pub const CURRENT_CONFIG: &str = "current";

/// Devices a partition entry applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelector {
    All,
    Indices(Vec<u32>),
}

impl DeviceSelector {
    pub fn contains(&self, index: u32) -> bool {
        match self {
            Self::All => true,
            Self::Indices(indices) => indices.contains(&index),
        }
    }
}

impl Serialize for DeviceSelector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::All => serializer.serialize_str("all"),
            Self::Indices(indices) => indices.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for DeviceSelector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum StringOrList {
            String(String),
            List(Vec<u32>),
        }

        match StringOrList::deserialize(deserializer)? {
            StringOrList::String(s) if s == "all" => Ok(Self::All),
            StringOrList::String(s) => Err(serde::de::Error::custom(format!(
                "invalid device selector '{s}', expected \"all\" or a list of indices"
            ))),
            StringOrList::List(indices) => Ok(Self::Indices(indices)),
        }
    }
}

/// One partition entry: which devices, and the instances to create on each.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigConfigEntry {
    pub devices: DeviceSelector,
    #[serde(rename = "mig-enabled")]
    pub mig_enabled: bool,
    #[serde(rename = "mig-devices", default)]
    pub mig_devices: BTreeMap<String, i32>,
}

/// Document understood by `nvidia-mig-parted`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigPartedSpec {
    pub version: String,
    #[serde(rename = "mig-configs")]
    pub mig_configs: BTreeMap<String, Vec<MigConfigEntry>>,
}

impl MigPartedSpec {
    /// Replaces `all` and empty device lists with the explicit indices
    /// `0..device_count`, so entries can later be split per device.
    pub fn expand_all(&mut self, device_count: u32) {
        for entries in self.mig_configs.values_mut() {
            for entry in entries {
                let expand = match &entry.devices {
                    DeviceSelector::All => true,
                    DeviceSelector::Indices(indices) => indices.is_empty(),
                };
                if expand {
                    entry.devices = DeviceSelector::Indices((0..device_count).collect());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    const EXPORTED: &str = r#"
version: v1
mig-configs:
  current:
    - devices: all
      mig-enabled: true
      mig-devices:
        1g.10gb: 7
    - devices: [2, 3]
      mig-enabled: false
"#;

    #[test]
    fn parses_all_and_index_selectors() {
        let spec: MigPartedSpec = serde_yaml::from_str(EXPORTED).unwrap();
        let current = &spec.mig_configs[CURRENT_CONFIG];

        assert_eq!(current[0].devices, DeviceSelector::All);
        assert_eq!(current[0].mig_devices["1g.10gb"], 7);
        assert_eq!(current[1].devices, DeviceSelector::Indices(vec![2, 3]));
        assert!(current[1].mig_devices.is_empty());
    }

    #[test]
    fn rejects_unknown_selector_string() {
        let text =
            "version: v1\nmig-configs:\n  current:\n    - devices: some\n      mig-enabled: true\n";
        assert!(serde_yaml::from_str::<MigPartedSpec>(text).is_err());
    }

    #[test]
    fn expand_all_lists_every_index() {
        let mut spec: MigPartedSpec = serde_yaml::from_str(EXPORTED).unwrap();
        spec.expand_all(2);

        let current = &spec.mig_configs[CURRENT_CONFIG];
        assert_eq!(current[0].devices, DeviceSelector::Indices(vec![0, 1]));
        assert_eq!(current[1].devices, DeviceSelector::Indices(vec![2, 3]));
    }

    #[test]
    fn serializes_back_to_tool_format() {
        let mut spec: MigPartedSpec = serde_yaml::from_str(EXPORTED).unwrap();
        spec.expand_all(1);
        let text = serde_yaml::to_string(&spec).unwrap();
        let reparsed: MigPartedSpec = serde_yaml::from_str(&text).unwrap();

        assert!(text.contains("mig-enabled"));
        assert_eq!(reparsed, spec);
    }
}
