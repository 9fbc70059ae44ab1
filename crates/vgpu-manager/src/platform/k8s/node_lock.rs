//! Node-scoped mutual exclusion through a node annotation.
//!
//! The lock value is the RFC3339 time it was taken. A lock older than
//! five minutes is considered abandoned and may be taken over.
//! Writes are guarded by the node's `resourceVersion`, so two managers
//! racing for a free lock cannot both win. A holder only removes the
//! lock while it still carries the timestamp that holder wrote.

use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use error_stack::Report;

use super::AnnotationPatch;
use super::ClusterStore;

/// Lock domain used by the device allocation path.
pub const DEVICE_LOCK_DOMAIN: &str = "vgpu";

const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(5 * 60);
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const RETRY_DELAY: Duration = Duration::from_millis(100);

pub fn lock_annotation(domain: &str) -> String {
    format!("volcano.sh/{domain}-mutex.lock")
}

#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum NodeLockError {
    #[display("node {node} is locked since {since}")]
    Held { node: String, since: String },
    #[display("lock on node {node} still contended after {attempts} attempts")]
    Contended { node: String, attempts: u32 },
    #[display("failed to update lock on node {node}")]
    Update { node: String },
}

impl core::error::Error for NodeLockError {}

pub struct NodeLock {
    store: Arc<dyn ClusterStore>,
    node_name: String,
    annotation: String,
    stale_after: Duration,
    max_attempts: u32,
}

impl NodeLock {
    pub fn new(store: Arc<dyn ClusterStore>, node_name: impl Into<String>, domain: &str) -> Self {
        Self {
            store,
            node_name: node_name.into(),
            annotation: lock_annotation(domain),
            stale_after: DEFAULT_STALE_AFTER,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    fn update_error(&self) -> NodeLockError {
        NodeLockError::Update {
            node: self.node_name.clone(),
        }
    }

    /// Takes the lock, retrying on write conflicts. Returns the timestamp
    /// written, which [`NodeLock::release`] needs back.
    pub async fn acquire(&self) -> Result<String, Report<NodeLockError>> {
        for attempt in 1..=self.max_attempts {
            let node = self
                .store
                .get_node(&self.node_name)
                .await
                .map_err(|err| err.change_context(self.update_error()))?;

            let current = node
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(&self.annotation));
            if let Some(since) = current {
                match DateTime::parse_from_rfc3339(since) {
                    Ok(taken) => {
                        let age = Utc::now().signed_duration_since(taken);
                        if age.to_std().map_or(true, |age| age < self.stale_after) {
                            return Err(Report::new(NodeLockError::Held {
                                node: self.node_name.clone(),
                                since: since.clone(),
                            }));
                        }
                        tracing::warn!(
                            node = %self.node_name,
                            since = %since,
                            "Reclaiming stale node lock"
                        );
                    }
                    Err(_) => {
                        tracing::warn!(
                            node = %self.node_name,
                            value = %since,
                            "Reclaiming node lock with unreadable timestamp"
                        );
                    }
                }
            }

            let stamp = Utc::now().to_rfc3339();
            let patch = AnnotationPatch::from([(self.annotation.clone(), Some(stamp.clone()))]);
            match self
                .store
                .patch_node_annotations(
                    &self.node_name,
                    &patch,
                    node.metadata.resource_version.as_deref(),
                )
                .await
            {
                Ok(_) => {
                    tracing::debug!(node = %self.node_name, "Node lock acquired");
                    return Ok(stamp);
                }
                Err(err) if err.current_context().is_conflict() => {
                    tracing::debug!(node = %self.node_name, attempt, "Node lock write conflict");
                    tokio::time::sleep(RETRY_DELAY * attempt).await;
                }
                Err(err) => return Err(err.change_context(self.update_error())),
            }
        }
        Err(Report::new(NodeLockError::Contended {
            node: self.node_name.clone(),
            attempts: self.max_attempts,
        }))
    }

    /// Drops the lock taken with `stamp`. A node that is unlocked, or
    /// locked by another holder since, is left as it is.
    pub async fn release(&self, stamp: &str) -> Result<(), Report<NodeLockError>> {
        for attempt in 1..=self.max_attempts {
            let node = self
                .store
                .get_node(&self.node_name)
                .await
                .map_err(|err| err.change_context(self.update_error()))?;
            let current = node
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(&self.annotation));
            match current {
                None => return Ok(()),
                Some(value) if value != stamp => {
                    tracing::warn!(
                        node = %self.node_name,
                        ours = %stamp,
                        current = %value,
                        "Node lock was taken over, leaving it in place"
                    );
                    return Ok(());
                }
                Some(_) => {}
            }

            let patch = AnnotationPatch::from([(self.annotation.clone(), None)]);
            match self
                .store
                .patch_node_annotations(
                    &self.node_name,
                    &patch,
                    node.metadata.resource_version.as_deref(),
                )
                .await
            {
                Ok(_) => {
                    tracing::debug!(node = %self.node_name, "Node lock released");
                    return Ok(());
                }
                Err(err) if err.current_context().is_conflict() => {
                    tracing::debug!(node = %self.node_name, attempt, "Node unlock write conflict");
                    tokio::time::sleep(RETRY_DELAY * attempt).await;
                }
                Err(err) => return Err(err.change_context(self.update_error())),
            }
        }
        Err(Report::new(NodeLockError::Contended {
            node: self.node_name.clone(),
            attempts: self.max_attempts,
        }))
    }
}
