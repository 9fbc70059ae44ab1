//! Allocation coordinator
//!
//! Turns a device plugin allocation call into concrete device grants. The
//! count manager drains the node's pending-pod queue under the node lock:
//! claim the oldest pending pod, consume its next `NVIDIA` entry, resolve
//! the device IDs, persist the shortened queue, and finally mark the pod
//! bound once nothing is left for this node agent to hand out. Every step
//! re-reads the pod, so a failed call can be retried from scratch.

use std::collections::HashSet;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use api_types::decode_pod_devices;
use api_types::encode_pod_devices;
use api_types::ContainerDevice;
use api_types::DeviceBindPhase;
use api_types::ASSIGNED_IDS_TO_ALLOCATE_ANNOTATION;
use api_types::ASSIGNED_TIME_ANNOTATION;
use api_types::DEVICE_BIND_PHASE_ANNOTATION;
use api_types::NVIDIA_GPU_DEVICE;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::Pod;

use crate::config::MigStrategy;
use crate::config::OperatingMode;
use crate::config::PluginConfig;
use crate::core::catalog::MigResolver;
use crate::core::catalog::ResourceKind;
use crate::core::catalog::ResourceManager;
use crate::platform::k8s::node_lock::DEVICE_LOCK_DOMAIN;
use crate::platform::k8s::AnnotationPatch;
use crate::platform::k8s::ClusterStore;
use crate::platform::k8s::NodeLock;
use crate::platform::nvml::GpuInventory;

mod error;
pub mod pending;
pub mod response;

pub use error::AllocationError;
pub use response::*;

use pending::annotation;
use pending::erase_request;
use pending::has_pending;
use pending::next_request;
use pending::select_pending_pod;
use pending::CLAIMED_TIME;

/// Entry types this agent hands out.
const HANDLED_DEVICE_TYPES: [&str; 1] = [NVIDIA_GPU_DEVICE];
const CLAIM_ATTEMPTS: u32 = 3;

type Result<T> = core::result::Result<T, Report<AllocationError>>;

/// A pod this call has claimed, with what is needed to undo the claim.
struct Claim {
    pod: Pod,
    namespace: String,
    name: String,
    original_time: Option<String>,
}

impl Claim {
    fn display_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

fn pod_key(pod: &Pod) -> (String, String) {
    (
        pod.metadata.namespace.clone().unwrap_or_default(),
        pod.metadata.name.clone().unwrap_or_default(),
    )
}

async fn prepare_host_dir(path: &Path) -> Result<()> {
    let context = || AllocationError::HostDirectory {
        path: path.display().to_string(),
    };
    tokio::fs::create_dir_all(path)
        .await
        .change_context_lazy(context)?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777))
        .await
        .change_context_lazy(context)?;
    Ok(())
}

pub struct AllocationCoordinator {
    config: Arc<PluginConfig>,
    store: Arc<dyn ClusterStore>,
    inventory: Arc<dyn GpuInventory>,
    resolver: Arc<MigResolver>,
    lock: NodeLock,
}

impl AllocationCoordinator {
    pub fn new(
        config: Arc<PluginConfig>,
        store: Arc<dyn ClusterStore>,
        inventory: Arc<dyn GpuInventory>,
        resolver: Arc<MigResolver>,
    ) -> Self {
        let lock = NodeLock::new(store.clone(), config.node_name.clone(), DEVICE_LOCK_DOMAIN);
        Self {
            config,
            store,
            inventory,
            resolver,
            lock,
        }
    }

    /// Answers one allocation call made for `manager`'s resource.
    #[tracing::instrument(skip_all, fields(resource = %manager.resource_name))]
    pub async fn allocate(
        &self,
        manager: &ResourceManager,
        request: &AllocateRequest,
    ) -> Result<AllocateResponse> {
        let count = request.container_requests.len();
        if count > 1 {
            return Err(Report::new(AllocationError::MultipleContainers { count }));
        }
        if manager.strategy == MigStrategy::Mixed {
            return self.passthrough(manager, request).await;
        }

        match &manager.kind {
            ResourceKind::Memory | ResourceKind::Cores => Ok(AllocateResponse {
                container_responses: vec![ContainerAllocateResponse::default(); count],
            }),
            ResourceKind::MigProfile(_) => self.passthrough(manager, request).await,
            ResourceKind::Count => {
                let Some(container_request) = request.container_requests.first() else {
                    return Ok(AllocateResponse::default());
                };
                let response = self.allocate_locked(container_request).await?;
                Ok(AllocateResponse {
                    container_responses: vec![response],
                })
            }
        }
    }

    /// Checks every requested ID against the manager's devices and exposes
    /// them unchanged.
    async fn passthrough(
        &self,
        manager: &ResourceManager,
        request: &AllocateRequest,
    ) -> Result<AllocateResponse> {
        let served: HashSet<String> = manager
            .device_ids(&self.config, self.inventory.as_ref())
            .await
            .change_context(AllocationError::Catalog)?
            .into_iter()
            .map(|device| device.id)
            .collect();

        let mut response = AllocateResponse::default();
        for container_request in &request.container_requests {
            if let Some(id) = container_request
                .device_ids
                .iter()
                .find(|id| !served.contains(*id))
            {
                return Err(Report::new(AllocationError::UnknownDevice {
                    id: id.clone(),
                    resource: manager.resource_name.clone(),
                }));
            }
            response
                .container_responses
                .push(ContainerAllocateResponse::visible_devices(
                    &container_request.device_ids,
                ));
        }
        Ok(response)
    }

    /// Runs the queue protocol; the node lock is released on every path.
    async fn allocate_locked(
        &self,
        request: &ContainerAllocateRequest,
    ) -> Result<ContainerAllocateResponse> {
        let stamp = self
            .lock
            .acquire()
            .await
            .change_context(AllocationError::LockUnavailable)?;

        let result = self.allocate_from_queue(request).await;

        if let Err(err) = self.lock.release(&stamp).await {
            tracing::error!("Failed to release node lock: {err:?}");
        }
        result
    }

    async fn allocate_from_queue(
        &self,
        request: &ContainerAllocateRequest,
    ) -> Result<ContainerAllocateResponse> {
        let claim = self.claim_oldest_pod().await?;
        match self.consume(&claim, request).await {
            Ok(response) => Ok(response),
            Err(err) => {
                tracing::error!(pod = %claim.display_name(), "Allocation failed: {err:?}");
                self.mark_failed(&claim).await;
                Err(err)
            }
        }
    }

    /// Picks the oldest pending pod and stamps it as claimed. The write is
    /// guarded by the pod's resource version; on conflict the queue is read
    /// again.
    async fn claim_oldest_pod(&self) -> Result<Claim> {
        let node = &self.config.node_name;
        let mut contended = String::new();

        for attempt in 1..=CLAIM_ATTEMPTS {
            let pods = self
                .store
                .list_pods()
                .await
                .change_context(AllocationError::ClusterAccess)?;
            let Some(pod) = select_pending_pod(&pods, node) else {
                return Err(Report::new(AllocationError::NoPendingPod { node: node.clone() }));
            };

            let (namespace, name) = pod_key(pod);
            let original_time = annotation(pod, ASSIGNED_TIME_ANNOTATION).map(str::to_string);
            let patch = AnnotationPatch::from([(
                ASSIGNED_TIME_ANNOTATION.to_string(),
                Some(CLAIMED_TIME.to_string()),
            )]);

            match self
                .store
                .patch_pod_annotations(
                    &namespace,
                    &name,
                    &patch,
                    pod.metadata.resource_version.as_deref(),
                )
                .await
            {
                Ok(claimed) => {
                    tracing::info!(pod = %format!("{namespace}/{name}"), "Claimed pending pod");
                    return Ok(Claim {
                        pod: claimed,
                        namespace,
                        name,
                        original_time,
                    });
                }
                Err(err) if err.current_context().is_conflict() => {
                    tracing::debug!(attempt, pod = %name, "Pod changed before it could be claimed");
                    contended = format!("{namespace}/{name}");
                }
                Err(err) => {
                    return Err(err.change_context(AllocationError::AnnotationUpdate {
                        pod: format!("{namespace}/{name}"),
                    }));
                }
            }
        }
        Err(Report::new(AllocationError::ClaimConflict { pod: contended }))
    }

    async fn consume(
        &self,
        claim: &Claim,
        request: &ContainerAllocateRequest,
    ) -> Result<ContainerAllocateResponse> {
        let pod_name = claim.display_name();
        let invalid = || AllocationError::InvalidAnnotation {
            pod: pod_name.clone(),
        };

        let devices = decode_pod_devices(
            annotation(&claim.pod, ASSIGNED_IDS_TO_ALLOCATE_ANNOTATION).unwrap_or_default(),
        )
        .map_err(|err| Report::new(err).change_context(invalid()))?;

        let (index, entries) = next_request(&devices, NVIDIA_GPU_DEVICE).ok_or_else(|| {
            Report::new(AllocationError::NoPendingRequest {
                pod: pod_name.clone(),
                device_type: NVIDIA_GPU_DEVICE.to_string(),
            })
        })?;
        if entries.len() != request.device_ids.len() {
            return Err(Report::new(AllocationError::CountMismatch {
                pod: pod_name.clone(),
                expected: entries.len(),
                requested: request.device_ids.len(),
            })
            .attach_printable(format!("requested ids: {:?}", request.device_ids)));
        }
        let container = claim
            .pod
            .spec
            .as_ref()
            .and_then(|spec| spec.containers.get(index))
            .ok_or_else(|| {
                Report::new(invalid())
                    .attach_printable(format!("no container at position {index}"))
            })?;

        let mut resolved = Vec::with_capacity(entries.len());
        for entry in &entries {
            let id = self.resolver.resolve(&entry.uuid).await.map_err(|err| {
                let kind = err.current_context().kind();
                err.change_context(AllocationError::Resolution {
                    uuid: entry.uuid.clone(),
                    kind,
                })
            })?;
            resolved.push(id);
        }

        let remaining = erase_request(&devices, index, NVIDIA_GPU_DEVICE);
        let patch = AnnotationPatch::from([(
            ASSIGNED_IDS_TO_ALLOCATE_ANNOTATION.to_string(),
            Some(encode_pod_devices(&remaining)),
        )]);
        self.store
            .patch_pod_annotations(
                &claim.namespace,
                &claim.name,
                &patch,
                claim.pod.metadata.resource_version.as_deref(),
            )
            .await
            .change_context_lazy(|| AllocationError::AnnotationUpdate {
                pod: pod_name.clone(),
            })?;
        tracing::info!(
            pod = %pod_name,
            container = %container.name,
            devices = %resolved.join(","),
            "Consumed pending device request"
        );

        let response = self
            .container_response(&claim.pod, container, &entries, &resolved)
            .await?;
        self.finish(claim).await?;
        Ok(response)
    }

    async fn container_response(
        &self,
        pod: &Pod,
        container: &Container,
        entries: &[ContainerDevice],
        resolved: &[String],
    ) -> Result<ContainerAllocateResponse> {
        let mut response = ContainerAllocateResponse::visible_devices(resolved);
        if self.config.operating_mode == OperatingMode::Mig {
            return Ok(response);
        }

        let factor = i64::from(self.config.gpu_memory_factor);
        for (i, entry) in entries.iter().enumerate() {
            response.envs.insert(
                format!("{MEMORY_LIMIT_ENV_PREFIX}{i}"),
                format!("{}m", i64::from(entry.used_mem) * factor),
            );
        }
        if let Some(first) = entries.first() {
            response
                .envs
                .insert(SM_LIMIT_ENV.to_string(), first.used_cores.to_string());
        }
        response.envs.insert(
            SHARED_CACHE_ENV.to_string(),
            format!("{CONTAINER_STATE_DIR}/{}.cache", uuid::Uuid::new_v4()),
        );
        let priority = container
            .resources
            .as_ref()
            .and_then(|r| r.limits.as_ref())
            .and_then(|limits| limits.get(&self.config.resource_priority_name));
        if let Some(priority) = priority {
            response
                .envs
                .insert(TASK_PRIORITY_ENV.to_string(), priority.0.clone());
        }

        let paths = &self.config.paths;
        let pod_uid = pod.metadata.uid.as_deref().unwrap_or_default();
        let state_dir = paths
            .containers_dir
            .join(format!("{pod_uid}_{}", container.name));
        prepare_host_dir(&state_dir).await?;
        prepare_host_dir(&paths.lock_dir).await?;

        let mount = |host: &Path, container_path: &str, read_only| Mount {
            container_path: container_path.to_string(),
            host_path: host.display().to_string(),
            read_only,
        };
        response.mounts = vec![
            mount(
                &paths.hook_path.join("libvgpu.so"),
                CONTAINER_LIBRARY_PATH,
                true,
            ),
            mount(&state_dir, CONTAINER_STATE_DIR, false),
            mount(&paths.lock_dir, CONTAINER_LOCK_DIR, false),
        ];
        let control_disabled = container
            .env
            .iter()
            .flatten()
            .any(|var| var.name == DISABLE_CONTROL_ENV);
        if !control_disabled {
            response.mounts.push(mount(
                &paths.hook_path.join("ld.so.preload"),
                CONTAINER_PRELOAD_PATH,
                true,
            ));
        }
        Ok(response)
    }

    /// Marks the pod bound when nothing handled here is pending any more,
    /// otherwise gives the claim back so the next call selects it again.
    async fn finish(&self, claim: &Claim) -> Result<()> {
        let pod_name = claim.display_name();
        let update_error = || AllocationError::AnnotationUpdate {
            pod: pod_name.clone(),
        };
        let fresh = self
            .store
            .get_pod(&claim.namespace, &claim.name)
            .await
            .change_context_lazy(update_error)?;
        let devices = decode_pod_devices(
            annotation(&fresh, ASSIGNED_IDS_TO_ALLOCATE_ANNOTATION).unwrap_or_default(),
        )
        .map_err(|err| {
            Report::new(err).change_context(AllocationError::InvalidAnnotation {
                pod: pod_name.clone(),
            })
        })?;

        let patch = if has_pending(&devices, &HANDLED_DEVICE_TYPES) {
            tracing::info!(pod = %pod_name, "Entries still pending, releasing claim");
            AnnotationPatch::from([(
                ASSIGNED_TIME_ANNOTATION.to_string(),
                claim.original_time.clone(),
            )])
        } else {
            tracing::info!(pod = %pod_name, "All device requests allocated");
            AnnotationPatch::from([(
                DEVICE_BIND_PHASE_ANNOTATION.to_string(),
                Some(DeviceBindPhase::Success.to_string()),
            )])
        };
        self.store
            .patch_pod_annotations(&claim.namespace, &claim.name, &patch, None)
            .await
            .change_context_lazy(update_error)?;
        Ok(())
    }

    /// Marks the pod failed and gives the claim back.
    async fn mark_failed(&self, claim: &Claim) {
        let patch = AnnotationPatch::from([
            (
                DEVICE_BIND_PHASE_ANNOTATION.to_string(),
                Some(DeviceBindPhase::Failed.to_string()),
            ),
            (
                ASSIGNED_TIME_ANNOTATION.to_string(),
                claim.original_time.clone(),
            ),
        ]);
        if let Err(err) = self
            .store
            .patch_pod_annotations(&claim.namespace, &claim.name, &patch, None)
            .await
        {
            tracing::error!(pod = %claim.display_name(), "Failed to mark pod failed: {err:?}");
        }
    }
}
