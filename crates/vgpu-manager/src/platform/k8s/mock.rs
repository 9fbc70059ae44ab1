//! In-memory [`ClusterStore`] for tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use error_stack::Report;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::PodSpec;
use kube::api::ObjectMeta;

use super::AnnotationPatch;
use super::ClusterStore;
use super::KubernetesError;

#[derive(Default)]
struct State {
    pods: Vec<Pod>,
    nodes: BTreeMap<String, Node>,
    config_maps: BTreeMap<(String, String), BTreeMap<String, String>>,
    version: u64,
    pod_conflicts: u32,
    pod_conflict_after: Option<u32>,
    node_conflicts: u32,
    pod_patches: usize,
}

impl State {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

/// Keeps pods in insertion order and bumps `resourceVersion` on every write.
#[derive(Default)]
pub struct MockCluster {
    state: Mutex<State>,
}

fn apply(meta: &mut ObjectMeta, patch: &AnnotationPatch, version: String) {
    let annotations = meta.annotations.get_or_insert_with(BTreeMap::new);
    for (key, value) in patch {
        match value {
            Some(value) => {
                annotations.insert(key.clone(), value.clone());
            }
            None => {
                annotations.remove(key);
            }
        }
    }
    meta.resource_version = Some(version);
}

fn check_version(
    meta: &ObjectMeta,
    expected: Option<&str>,
    resource: String,
) -> Result<(), Report<KubernetesError>> {
    match expected {
        Some(expected) if meta.resource_version.as_deref() != Some(expected) => {
            Err(Report::new(KubernetesError::Conflict { resource }))
        }
        _ => Ok(()),
    }
}

/// A pod scheduled on `node-a` with a single container named `main`.
pub fn pod(namespace: &str, name: &str, uid: &str, annotations: &[(&str, &str)]) -> Pod {
    Pod {
        metadata: ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(name.to_string()),
            uid: Some(uid.to_string()),
            annotations: Some(
                annotations
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some("node-a".to_string()),
            containers: vec![Container {
                name: "main".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pod(&self, mut pod: Pod) {
        let mut state = self.state.lock().unwrap();
        pod.metadata.resource_version = Some(state.next_version());
        state.pods.push(pod);
    }

    pub fn add_node(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        let node = Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                resource_version: Some(state.next_version()),
                ..Default::default()
            },
            ..Default::default()
        };
        state.nodes.insert(name.to_string(), node);
    }

    pub fn add_config_map(&self, namespace: &str, name: &str, data: BTreeMap<String, String>) {
        self.state
            .lock()
            .unwrap()
            .config_maps
            .insert((namespace.to_string(), name.to_string()), data);
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Pod {
        let state = self.state.lock().unwrap();
        state
            .pods
            .iter()
            .find(|p| {
                p.metadata.namespace.as_deref() == Some(namespace)
                    && p.metadata.name.as_deref() == Some(name)
            })
            .cloned()
            .unwrap()
    }

    pub fn pod_annotation(&self, namespace: &str, name: &str, key: &str) -> Option<String> {
        self.pod(namespace, name)
            .metadata
            .annotations
            .and_then(|a| a.get(key).cloned())
    }

    pub fn node_annotation(&self, name: &str, key: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .nodes
            .get(name)
            .and_then(|n| n.metadata.annotations.as_ref())
            .and_then(|a| a.get(key).cloned())
    }

    /// Writes node annotations directly, bypassing conflict injection.
    pub fn set_node_annotation(&self, name: &str, key: &str, value: &str) {
        let mut state = self.state.lock().unwrap();
        let version = state.next_version();
        let node = state.nodes.get_mut(name).unwrap();
        let patch = AnnotationPatch::from([(key.to_string(), Some(value.to_string()))]);
        apply(&mut node.metadata, &patch, version);
    }

    /// The next `count` guarded pod patches fail with a conflict.
    pub fn inject_pod_conflicts(&self, count: u32) {
        self.state.lock().unwrap().pod_conflicts = count;
    }

    /// The guarded pod patch following the next `passing` ones fails with a
    /// conflict.
    pub fn inject_pod_conflict_after(&self, passing: u32) {
        self.state.lock().unwrap().pod_conflict_after = Some(passing);
    }

    /// The next `count` guarded node patches fail with a conflict.
    pub fn inject_node_conflicts(&self, count: u32) {
        self.state.lock().unwrap().node_conflicts = count;
    }

    pub fn pod_patch_count(&self) -> usize {
        self.state.lock().unwrap().pod_patches
    }
}

#[async_trait]
impl ClusterStore for MockCluster {
    async fn list_pods(&self) -> Result<Vec<Pod>, Report<KubernetesError>> {
        Ok(self.state.lock().unwrap().pods.clone())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, Report<KubernetesError>> {
        let state = self.state.lock().unwrap();
        state
            .pods
            .iter()
            .find(|p| {
                p.metadata.namespace.as_deref() == Some(namespace)
                    && p.metadata.name.as_deref() == Some(name)
            })
            .cloned()
            .ok_or_else(|| {
                Report::new(KubernetesError::NotFound {
                    resource: format!("pod {namespace}/{name}"),
                })
            })
    }

    async fn patch_pod_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: &AnnotationPatch,
        resource_version: Option<&str>,
    ) -> Result<Pod, Report<KubernetesError>> {
        let mut state = self.state.lock().unwrap();
        let resource = format!("pod {namespace}/{name}");
        if resource_version.is_some() {
            if state.pod_conflicts > 0 {
                state.pod_conflicts -= 1;
                return Err(Report::new(KubernetesError::Conflict { resource }));
            }
            match state.pod_conflict_after {
                Some(0) => {
                    state.pod_conflict_after = None;
                    return Err(Report::new(KubernetesError::Conflict { resource }));
                }
                Some(passing) => state.pod_conflict_after = Some(passing - 1),
                None => {}
            }
        }
        let version = state.next_version();
        state.pod_patches += 1;
        let pod = state
            .pods
            .iter_mut()
            .find(|p| {
                p.metadata.namespace.as_deref() == Some(namespace)
                    && p.metadata.name.as_deref() == Some(name)
            })
            .ok_or_else(|| {
                Report::new(KubernetesError::NotFound {
                    resource: resource.clone(),
                })
            })?;
        check_version(&pod.metadata, resource_version, resource)?;
        apply(&mut pod.metadata, annotations, version);
        Ok(pod.clone())
    }

    async fn get_node(&self, name: &str) -> Result<Node, Report<KubernetesError>> {
        let state = self.state.lock().unwrap();
        state.nodes.get(name).cloned().ok_or_else(|| {
            Report::new(KubernetesError::NotFound {
                resource: format!("node {name}"),
            })
        })
    }

    async fn patch_node_annotations(
        &self,
        name: &str,
        annotations: &AnnotationPatch,
        resource_version: Option<&str>,
    ) -> Result<Node, Report<KubernetesError>> {
        let mut state = self.state.lock().unwrap();
        let resource = format!("node {name}");
        if resource_version.is_some() && state.node_conflicts > 0 {
            state.node_conflicts -= 1;
            return Err(Report::new(KubernetesError::Conflict { resource }));
        }
        let version = state.next_version();
        let node = state.nodes.get_mut(name).ok_or_else(|| {
            Report::new(KubernetesError::NotFound {
                resource: resource.clone(),
            })
        })?;
        check_version(&node.metadata, resource_version, resource)?;
        apply(&mut node.metadata, annotations, version);
        Ok(node.clone())
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, Report<KubernetesError>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }
}
