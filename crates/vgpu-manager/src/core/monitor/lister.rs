//! Container lister
//!
//! Every GPU container gets a host directory `<containers_dir>/<podUID>_<ctr>`
//! where the interception library keeps its `*.cache` shared region. The
//! lister maps those files once and keeps the mappings until the file goes
//! away.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use error_stack::Report;
use error_stack::ResultExt;
use utils::shared_region::RegionError;
use utils::shared_region::SharedRegion;

use crate::platform::k8s::ClusterStore;

const REGION_EXTENSION: &str = "cache";

#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum ListerError {
    #[display("failed to read directory {path}")]
    ReadDir { path: String },
    #[display("shared region {path} violates the layout")]
    Layout { path: String },
}

impl core::error::Error for ListerError {}

/// Splits a container directory name into pod UID and container name.
fn parse_dir_name(name: &str) -> Option<(&str, &str)> {
    name.split_once('_')
        .filter(|(uid, ctr)| !uid.is_empty() && !ctr.is_empty())
}

pub struct ContainerLister {
    containers_dir: PathBuf,
    node_name: String,
    store: Option<Arc<dyn ClusterStore>>,
    regions: BTreeMap<PathBuf, SharedRegion>,
}

impl ContainerLister {
    /// With a `store`, directories of pods no longer on this node are removed.
    pub fn new(
        containers_dir: PathBuf,
        node_name: impl Into<String>,
        store: Option<Arc<dyn ClusterStore>>,
    ) -> Self {
        Self {
            containers_dir,
            node_name: node_name.into(),
            store,
            regions: BTreeMap::new(),
        }
    }

    pub fn count(&self) -> usize {
        self.regions.len()
    }

    pub fn regions(&self) -> impl Iterator<Item = (&Path, &SharedRegion)> {
        self.regions.iter().map(|(path, region)| (path.as_path(), region))
    }

    pub fn regions_mut(&mut self) -> Vec<&mut SharedRegion> {
        self.regions.values_mut().collect()
    }

    /// UIDs of pods scheduled on this node, `None` when unknown.
    async fn live_pod_uids(&self) -> Option<HashSet<String>> {
        let store = self.store.as_ref()?;
        match store.list_pods().await {
            Ok(pods) => Some(
                pods.into_iter()
                    .filter(|pod| {
                        pod.spec
                            .as_ref()
                            .and_then(|spec| spec.node_name.as_deref())
                            == Some(self.node_name.as_str())
                    })
                    .filter_map(|pod| pod.metadata.uid)
                    .collect(),
            ),
            Err(err) => {
                tracing::warn!("Skipping container directory cleanup: {err:?}");
                None
            }
        }
    }

    /// Rescans the containers directory.
    pub async fn update(&mut self) -> Result<(), Report<ListerError>> {
        if !tokio::fs::try_exists(&self.containers_dir)
            .await
            .unwrap_or(false)
        {
            self.regions.clear();
            return Ok(());
        }

        let live = self.live_pod_uids().await;
        let mut found = BTreeSet::new();
        let read_error = |path: &Path| ListerError::ReadDir {
            path: path.display().to_string(),
        };

        let mut entries = tokio::fs::read_dir(&self.containers_dir)
            .await
            .change_context_lazy(|| read_error(&self.containers_dir))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .change_context_lazy(|| read_error(&self.containers_dir))?
        {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some((uid, _)) = name.to_str().and_then(parse_dir_name) else {
                continue;
            };
            if live.as_ref().is_some_and(|live| !live.contains(uid)) {
                match tokio::fs::remove_dir_all(&dir).await {
                    Ok(()) => {
                        tracing::info!(dir = %dir.display(), "Removed directory of departed pod")
                    }
                    Err(err) => {
                        tracing::warn!(dir = %dir.display(), "Failed to remove directory: {err}")
                    }
                }
                continue;
            }

            let mut files = match tokio::fs::read_dir(&dir).await {
                Ok(files) => files,
                Err(err) => {
                    tracing::debug!(dir = %dir.display(), "Container directory vanished: {err}");
                    continue;
                }
            };
            while let Ok(Some(file)) = files.next_entry().await {
                let path = file.path();
                if path.extension().and_then(|ext| ext.to_str()) == Some(REGION_EXTENSION) {
                    found.insert(path);
                }
            }
        }

        self.regions.retain(|path, _| {
            let keep = found.contains(path);
            if !keep {
                tracing::info!(region = %path.display(), "Shared region removed");
            }
            keep
        });
        for path in found {
            if self.regions.contains_key(&path) {
                continue;
            }
            match SharedRegion::open(&path) {
                Ok(region) => {
                    tracing::info!(region = %path.display(), "Monitoring shared region");
                    self.regions.insert(path, region);
                }
                Err(RegionError::LayoutViolation(reason)) => {
                    return Err(Report::new(ListerError::Layout {
                        path: path.display().to_string(),
                    })
                    .attach_printable(reason));
                }
                // the library has not finished sizing the file yet
                Err(err) => tracing::debug!(region = %path.display(), "Not mapped yet: {err}"),
            }
        }
        Ok(())
    }
}
