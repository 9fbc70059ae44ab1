//! String codecs for the device annotations.
//!
//! Pod grants: records `uuid,type,usedmem,usedcores` each terminated by `:`,
//! containers joined by `;`.
//! Node devices: records `id,count,devmem,type,health,mode` each terminated by `:`.

use core::error::Error;
use core::fmt::Write;

use crate::ContainerDevice;
use crate::ContainerDevices;
use crate::NodeDeviceInfo;
use crate::PodDevices;

const RECORD_TERMINATOR: char = ':';
const FIELD_SEPARATOR: char = ',';
const CONTAINER_SEPARATOR: char = ';';

/// Errors raised while decoding an annotation value.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum DecodeError {
    #[display("record `{record}` has {found} fields, expected {expected}")]
    FieldCount {
        record: String,
        expected: usize,
        found: usize,
    },
    #[display("invalid {field} `{value}` in record `{record}`")]
    InvalidField {
        record: String,
        field: &'static str,
        value: String,
    },
}

impl Error for DecodeError {}

pub fn encode_container_devices(devices: &[ContainerDevice]) -> String {
    let mut out = String::new();
    for dev in devices {
        // writing into a String cannot fail
        let _ = write!(
            out,
            "{},{},{},{}{RECORD_TERMINATOR}",
            dev.uuid, dev.device_type, dev.used_mem, dev.used_cores
        );
    }
    out
}

/// Encodes the pending-allocation annotation, one `;`-separated slot per
/// container.
///
/// A pod with a single empty container encodes to `""`, which decodes back
/// to an empty list. Both forms mean nothing is pending.
pub fn encode_pod_devices(devices: &[ContainerDevices]) -> String {
    devices
        .iter()
        .map(|c| encode_container_devices(c))
        .collect::<Vec<_>>()
        .join(&CONTAINER_SEPARATOR.to_string())
}

pub fn decode_container_devices(value: &str) -> Result<ContainerDevices, DecodeError> {
    let mut devices = ContainerDevices::new();
    for record in value.split(RECORD_TERMINATOR) {
        if !record.contains(FIELD_SEPARATOR) {
            continue;
        }
        let fields: Vec<&str> = record.split(FIELD_SEPARATOR).collect();
        if fields.len() != 4 {
            return Err(DecodeError::FieldCount {
                record: record.to_string(),
                expected: 4,
                found: fields.len(),
            });
        }
        devices.push(ContainerDevice {
            uuid: fields[0].to_string(),
            device_type: fields[1].to_string(),
            used_mem: parse_field(record, "usedmem", fields[2])?,
            used_cores: parse_field(record, "usedcores", fields[3])?,
        });
    }
    Ok(devices)
}

/// Decodes the pending-allocation annotation.
///
/// An empty value means nothing is pending and decodes to an empty list.
pub fn decode_pod_devices(value: &str) -> Result<PodDevices, DecodeError> {
    if value.is_empty() {
        return Ok(PodDevices::new());
    }
    value
        .split(CONTAINER_SEPARATOR)
        .map(decode_container_devices)
        .collect()
}

pub fn encode_node_devices(devices: &[NodeDeviceInfo]) -> String {
    let mut out = String::new();
    for dev in devices {
        let _ = write!(
            out,
            "{},{},{},{},{},{}{RECORD_TERMINATOR}",
            dev.id, dev.count, dev.devmem, dev.device_type, dev.health, dev.mode
        );
    }
    out
}

pub fn decode_node_devices(value: &str) -> Result<Vec<NodeDeviceInfo>, DecodeError> {
    let mut devices = Vec::new();
    for record in value.split(RECORD_TERMINATOR) {
        if !record.contains(FIELD_SEPARATOR) {
            continue;
        }
        let fields: Vec<&str> = record.split(FIELD_SEPARATOR).collect();
        // older publishers omit the mode field
        if fields.len() != 5 && fields.len() != 6 {
            return Err(DecodeError::FieldCount {
                record: record.to_string(),
                expected: 6,
                found: fields.len(),
            });
        }
        devices.push(NodeDeviceInfo {
            id: fields[0].to_string(),
            count: parse_field(record, "count", fields[1])?,
            devmem: parse_field(record, "devmem", fields[2])?,
            device_type: fields[3].to_string(),
            health: parse_field(record, "health", fields[4])?,
            mode: fields.get(5).map(|m| m.to_string()).unwrap_or_default(),
        });
    }
    Ok(devices)
}

fn parse_field<T: core::str::FromStr>(
    record: &str,
    field: &'static str,
    value: &str,
) -> Result<T, DecodeError> {
    value.parse().map_err(|_| DecodeError::InvalidField {
        record: record.to_string(),
        field,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn dev(uuid: &str, mem: i32, cores: i32) -> ContainerDevice {
        ContainerDevice {
            uuid: uuid.to_string(),
            device_type: "NVIDIA".to_string(),
            used_mem: mem,
            used_cores: cores,
        }
    }

    #[test]
    fn encodes_pod_devices_in_wire_format() {
        let pod = vec![
            vec![dev("GPU-a", 1024, 30), dev("GPU-b", 2048, 50)],
            vec![dev("GPU-c", 512, 0)],
        ];
        assert_eq!(
            encode_pod_devices(&pod),
            "GPU-a,NVIDIA,1024,30:GPU-b,NVIDIA,2048,50:;GPU-c,NVIDIA,512,0:"
        );
    }

    #[test]
    fn pod_devices_survive_a_round_trip() {
        let pod = vec![
            vec![dev("GPU-a[group-1]", 1024, 30)],
            vec![],
            vec![dev("GPU-c", 512, 0), dev("GPU-d", 1, 100)],
        ];
        assert_eq!(decode_pod_devices(&encode_pod_devices(&pod)).unwrap(), pod);
    }

    #[test]
    fn empty_values_decode_to_empty_lists() {
        assert_eq!(decode_pod_devices("").unwrap(), PodDevices::new());
        assert_eq!(decode_container_devices("").unwrap(), ContainerDevices::new());
        assert_eq!(decode_node_devices("").unwrap(), Vec::new());
        assert_eq!(encode_pod_devices(&[]), "");
        assert_eq!(encode_node_devices(&[]), "");
    }

    #[test]
    fn empty_containers_keep_their_slot() {
        let pod = vec![vec![], vec![dev("GPU-a", 1, 1)]];
        let encoded = encode_pod_devices(&pod);
        assert_eq!(encoded, ";GPU-a,NVIDIA,1,1:");
        assert_eq!(decode_pod_devices(&encoded).unwrap(), pod);
    }

    #[test]
    fn lone_empty_container_collapses_to_nothing_pending() {
        assert_eq!(encode_pod_devices(&[vec![]]), "");
        assert_eq!(decode_pod_devices("").unwrap(), PodDevices::new());

        let two_empty = vec![vec![], vec![]];
        assert_eq!(encode_pod_devices(&two_empty), ";");
        assert_eq!(decode_pod_devices(";").unwrap(), two_empty);
    }

    #[test]
    fn rejects_non_numeric_quota() {
        let err = decode_container_devices("GPU-a,NVIDIA,lots,30:").unwrap_err();
        assert!(matches!(
            err,
            DecodeError::InvalidField {
                field: "usedmem",
                ..
            }
        ));
    }

    #[test]
    fn rejects_truncated_record() {
        let err = decode_container_devices("GPU-a,NVIDIA,30:").unwrap_err();
        assert_eq!(
            err,
            DecodeError::FieldCount {
                record: "GPU-a,NVIDIA,30".to_string(),
                expected: 4,
                found: 3,
            }
        );
    }

    #[test]
    fn node_devices_survive_a_round_trip() {
        let devices = vec![
            NodeDeviceInfo {
                id: "GPU-0".to_string(),
                count: 10,
                devmem: 40536,
                device_type: "NVIDIA-Tesla V100".to_string(),
                health: true,
                mode: "hami-core".to_string(),
            },
            NodeDeviceInfo {
                id: "GPU-1".to_string(),
                count: 1,
                devmem: 81920,
                device_type: "NVIDIA-A100".to_string(),
                health: false,
                mode: "mig".to_string(),
            },
        ];
        let encoded = encode_node_devices(&devices);
        assert_eq!(
            encoded,
            "GPU-0,10,40536,NVIDIA-Tesla V100,true,hami-core:GPU-1,1,81920,NVIDIA-A100,false,mig:"
        );
        assert_eq!(decode_node_devices(&encoded).unwrap(), devices);
    }

    #[test]
    fn accepts_legacy_node_records_without_mode() {
        let devices = decode_node_devices("GPU-0,10,1024,NVIDIA-T4,true:").unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].mode, "");
        assert!(devices[0].health);
    }
}
