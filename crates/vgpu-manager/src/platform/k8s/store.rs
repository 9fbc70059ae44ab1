use std::collections::BTreeMap;

use async_trait::async_trait;
use error_stack::Report;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::api::Patch;
use kube::api::PatchParams;
use kube::Api;
use kube::Client;

use super::KubernetesError;

/// Annotation changes for a merge patch; `None` removes the key.
pub type AnnotationPatch = BTreeMap<String, Option<String>>;

/// The slice of the API server the node agent needs.
///
/// Patches may carry the `resourceVersion` the caller read; a store must
/// then reject the write with [`KubernetesError::Conflict`] if the object
/// changed in between.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn list_pods(&self) -> Result<Vec<Pod>, Report<KubernetesError>>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, Report<KubernetesError>>;

    async fn patch_pod_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: &AnnotationPatch,
        resource_version: Option<&str>,
    ) -> Result<Pod, Report<KubernetesError>>;

    async fn get_node(&self, name: &str) -> Result<Node, Report<KubernetesError>>;

    async fn patch_node_annotations(
        &self,
        name: &str,
        annotations: &AnnotationPatch,
        resource_version: Option<&str>,
    ) -> Result<Node, Report<KubernetesError>>;

    /// Data of a ConfigMap, `None` if it does not exist.
    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, Report<KubernetesError>>;
}

/// [`ClusterStore`] backed by the API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn classify(err: kube::Error, resource: String) -> Report<KubernetesError> {
    let context = match &err {
        kube::Error::Api(response) if response.code == 404 => {
            KubernetesError::NotFound { resource }
        }
        kube::Error::Api(response) if response.code == 409 => {
            KubernetesError::Conflict { resource }
        }
        _ => KubernetesError::RequestFailed {
            message: format!("request on {resource} failed"),
        },
    };
    Report::new(err).change_context(context)
}

fn annotation_patch(
    annotations: &AnnotationPatch,
    resource_version: Option<&str>,
) -> serde_json::Value {
    let mut metadata = serde_json::json!({ "annotations": annotations });
    if let Some(version) = resource_version {
        metadata["resourceVersion"] = serde_json::Value::from(version);
    }
    serde_json::json!({ "metadata": metadata })
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn list_pods(&self) -> Result<Vec<Pod>, Report<KubernetesError>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let pods = api
            .list(&ListParams::default())
            .await
            .map_err(|err| classify(err, "pods".to_string()))?;
        Ok(pods.items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, Report<KubernetesError>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|err| classify(err, format!("pod {namespace}/{name}")))
    }

    async fn patch_pod_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: &AnnotationPatch,
        resource_version: Option<&str>,
    ) -> Result<Pod, Report<KubernetesError>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let patch = annotation_patch(annotations, resource_version);
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|err| classify(err, format!("pod {namespace}/{name}")))
    }

    async fn get_node(&self, name: &str) -> Result<Node, Report<KubernetesError>> {
        let api: Api<Node> = Api::all(self.client.clone());
        api.get(name)
            .await
            .map_err(|err| classify(err, format!("node {name}")))
    }

    async fn patch_node_annotations(
        &self,
        name: &str,
        annotations: &AnnotationPatch,
        resource_version: Option<&str>,
    ) -> Result<Node, Report<KubernetesError>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = annotation_patch(annotations, resource_version);
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|err| classify(err, format!("node {name}")))
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, Report<KubernetesError>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let config_map = api
            .get_opt(name)
            .await
            .map_err(|err| classify(err, format!("configmap {namespace}/{name}")))?;
        Ok(config_map.map(|cm| cm.data.unwrap_or_default()))
    }
}
