//! The pending-allocation queue as recorded on pods.

use api_types::decode_pod_devices;
use api_types::ContainerDevices;
use api_types::DeviceBindPhase;
use api_types::PodDevices;
use api_types::ASSIGNED_IDS_TO_ALLOCATE_ANNOTATION;
use api_types::ASSIGNED_NODE_ANNOTATION;
use api_types::ASSIGNED_TIME_ANNOTATION;
use api_types::DEVICE_BIND_PHASE_ANNOTATION;
use api_types::POD_ANNOTATION_MAX_LENGTH;
use k8s_openapi::api::core::v1::Pod;

/// Assigned-time value marking a pod as claimed by a running allocation.
pub const CLAIMED_TIME: u64 = u64::MAX;

pub fn annotation<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

/// Ordering key of a pod. Missing or malformed values sort last.
pub fn assigned_time(pod: &Pod) -> u64 {
    match annotation(pod, ASSIGNED_TIME_ANNOTATION) {
        Some(value) if value.len() <= POD_ANNOTATION_MAX_LENGTH => {
            value.parse().unwrap_or(CLAIMED_TIME)
        }
        _ => CLAIMED_TIME,
    }
}

fn is_claimed(pod: &Pod) -> bool {
    annotation(pod, ASSIGNED_TIME_ANNOTATION) == Some(CLAIMED_TIME.to_string().as_str())
}

fn has_pending_entries(pod: &Pod) -> bool {
    match annotation(pod, ASSIGNED_IDS_TO_ALLOCATE_ANNOTATION) {
        None => false,
        Some(value) => match decode_pod_devices(value) {
            Ok(devices) => devices.iter().any(|ctr| !ctr.is_empty()),
            // Surfaced as a failure once the pod is claimed.
            Err(_) => !value.trim().is_empty(),
        },
    }
}

fn is_candidate(pod: &Pod, node: &str) -> bool {
    if annotation(pod, ASSIGNED_NODE_ANNOTATION) != Some(node) {
        return false;
    }
    let terminal = annotation(pod, DEVICE_BIND_PHASE_ANNOTATION)
        .and_then(DeviceBindPhase::parse)
        .is_some_and(DeviceBindPhase::is_terminal);
    !terminal && !is_claimed(pod) && has_pending_entries(pod)
}

/// The oldest unclaimed pod on `node` with pending entries. Ties go to the
/// pod listed first.
pub fn select_pending_pod<'a>(pods: &'a [Pod], node: &str) -> Option<&'a Pod> {
    let mut oldest: Option<(&Pod, u64)> = None;
    for pod in pods.iter().filter(|pod| is_candidate(pod, node)) {
        let time = assigned_time(pod);
        if oldest.map_or(true, |(_, best)| time < best) {
            oldest = Some((pod, time));
        }
    }
    oldest.map(|(pod, _)| pod)
}

/// First container with entries of `device_type`, and those entries.
pub fn next_request(devices: &PodDevices, device_type: &str) -> Option<(usize, ContainerDevices)> {
    devices.iter().enumerate().find_map(|(index, container)| {
        let entries: ContainerDevices = container
            .iter()
            .filter(|dev| dev.device_type == device_type)
            .cloned()
            .collect();
        (!entries.is_empty()).then_some((index, entries))
    })
}

/// Removes the `device_type` entries of container `index`, keeping every
/// other entry and the container positions.
pub fn erase_request(devices: &PodDevices, index: usize, device_type: &str) -> PodDevices {
    devices
        .iter()
        .enumerate()
        .map(|(i, container)| {
            if i == index {
                container
                    .iter()
                    .filter(|dev| dev.device_type != device_type)
                    .cloned()
                    .collect()
            } else {
                container.clone()
            }
        })
        .collect()
}

/// Whether any entry of the handled types is still waiting.
pub fn has_pending(devices: &PodDevices, device_types: &[&str]) -> bool {
    devices
        .iter()
        .flatten()
        .any(|dev| device_types.contains(&dev.device_type.as_str()))
}

#[cfg(test)]
mod tests {
    use api_types::encode_pod_devices;
    use api_types::ContainerDevice;
    use api_types::NVIDIA_GPU_DEVICE;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::platform::k8s::mock;

    fn dev(uuid: &str, device_type: &str) -> ContainerDevice {
        ContainerDevice {
            uuid: uuid.to_string(),
            device_type: device_type.to_string(),
            used_mem: 1024,
            used_cores: 30,
        }
    }

    fn pending_pod(name: &str, node: &str, time: Option<&str>) -> Pod {
        let devices = encode_pod_devices(&[vec![dev("GPU-0", NVIDIA_GPU_DEVICE)]]);
        let mut annotations = vec![
            (ASSIGNED_NODE_ANNOTATION, node),
            (ASSIGNED_IDS_TO_ALLOCATE_ANNOTATION, devices.as_str()),
        ];
        if let Some(time) = time {
            annotations.push((ASSIGNED_TIME_ANNOTATION, time));
        }
        mock::pod("default", name, &format!("uid-{name}"), &annotations)
    }

    fn name(pod: Option<&Pod>) -> Option<&str> {
        pod.and_then(|p| p.metadata.name.as_deref())
    }

    #[test]
    fn assigned_time_rejects_long_and_malformed_values() {
        assert_eq!(assigned_time(&pending_pod("a", "n", Some("1700000000"))), 1_700_000_000);
        assert_eq!(assigned_time(&pending_pod("a", "n", None)), CLAIMED_TIME);
        assert_eq!(assigned_time(&pending_pod("a", "n", Some("soon"))), CLAIMED_TIME);
        assert_eq!(
            assigned_time(&pending_pod("a", "n", Some("1234567890123456789012345"))),
            CLAIMED_TIME
        );
    }

    #[test]
    fn selects_oldest_on_node_with_list_order_tie_break() {
        let pods = vec![
            pending_pod("other-node", "node-b", Some("1")),
            pending_pod("late", "node-a", Some("300")),
            pending_pod("first", "node-a", Some("100")),
            pending_pod("second", "node-a", Some("100")),
        ];
        assert_eq!(name(select_pending_pod(&pods, "node-a")), Some("first"));
    }

    #[test]
    fn skips_claimed_terminal_and_drained_pods() {
        let claimed = pending_pod("claimed", "node-a", Some(&CLAIMED_TIME.to_string()));

        let mut bound = pending_pod("bound", "node-a", Some("1"));
        bound
            .metadata
            .annotations
            .as_mut()
            .unwrap()
            .insert(DEVICE_BIND_PHASE_ANNOTATION.to_string(), "success".to_string());

        let drained = mock::pod(
            "default",
            "drained",
            "uid-drained",
            &[
                (ASSIGNED_NODE_ANNOTATION, "node-a"),
                (ASSIGNED_TIME_ANNOTATION, "1"),
                (ASSIGNED_IDS_TO_ALLOCATE_ANNOTATION, ";"),
            ],
        );

        let untimed = pending_pod("untimed", "node-a", None);

        let pods = vec![claimed, bound, drained, untimed];
        assert_eq!(name(select_pending_pod(&pods, "node-a")), Some("untimed"));
        assert_eq!(name(select_pending_pod(&pods[..3], "node-a")), None);
    }

    #[test]
    fn next_request_picks_first_container_with_type() {
        let devices = vec![
            vec![dev("ASCEND-0", "Ascend")],
            vec![
                dev("GPU-0", NVIDIA_GPU_DEVICE),
                dev("ASCEND-1", "Ascend"),
                dev("GPU-1", NVIDIA_GPU_DEVICE),
            ],
            vec![dev("GPU-2", NVIDIA_GPU_DEVICE)],
        ];

        let (index, entries) = next_request(&devices, NVIDIA_GPU_DEVICE).unwrap();
        assert_eq!(index, 1);
        assert_eq!(
            entries,
            vec![dev("GPU-0", NVIDIA_GPU_DEVICE), dev("GPU-1", NVIDIA_GPU_DEVICE)]
        );
        assert_eq!(next_request(&devices, "Hygon"), None);
    }

    #[test]
    fn erase_is_repeatable_and_keeps_other_entries() {
        let devices = vec![
            vec![dev("GPU-0", NVIDIA_GPU_DEVICE), dev("ASCEND-0", "Ascend")],
            vec![dev("GPU-1", NVIDIA_GPU_DEVICE)],
        ];

        let once = erase_request(&devices, 0, NVIDIA_GPU_DEVICE);
        let retried = erase_request(&devices, 0, NVIDIA_GPU_DEVICE);

        assert_eq!(once, retried);
        assert_eq!(
            once,
            vec![vec![dev("ASCEND-0", "Ascend")], vec![dev("GPU-1", NVIDIA_GPU_DEVICE)]]
        );
        assert!(has_pending(&once, &[NVIDIA_GPU_DEVICE]));

        let drained = erase_request(&once, 1, NVIDIA_GPU_DEVICE);
        assert_eq!(drained.len(), 2);
        assert!(!has_pending(&drained, &[NVIDIA_GPU_DEVICE]));
        assert!(has_pending(&drained, &["Ascend"]));
    }
}
