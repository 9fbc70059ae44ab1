use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::monitor::Monitor;
use crate::core::register::DeviceRegistrar;

/// Task manager, responsible for starting and stopping background tasks
pub struct Tasks {
    pub tasks: Vec<JoinHandle<Result<()>>>,
    cancellation_token: CancellationToken,
}

impl Default for Tasks {
    fn default() -> Self {
        Self::new()
    }
}

impl Tasks {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn spawn_monitor(&mut self, monitor: Monitor) {
        let token = self.cancellation_token.clone();
        self.tasks.push(tokio::spawn(async move {
            tracing::info!("Starting feedback monitor task");
            monitor
                .run(token)
                .await
                .map_err(|e| anyhow::anyhow!("Feedback monitor stopped: {e:?}"))?;
            tracing::info!("Feedback monitor task completed");
            Ok(())
        }));
    }

    pub fn spawn_registrar(&mut self, registrar: Arc<DeviceRegistrar>) {
        let token = self.cancellation_token.clone();
        self.tasks.push(tokio::spawn(async move {
            tracing::info!("Starting device registration task");
            registrar.run(token).await;
            tracing::info!("Device registration task completed");
            Ok(())
        }));
    }

    /// wait for tasks to complete or receive shutdown signal
    pub async fn wait_for_completion(&mut self) -> Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let signal_handler = tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT, initiating graceful shutdown");
                }
            }
        });

        tokio::select! {
            _ = signal_handler => {
                tracing::info!("Shutdown signal received, cancelling all tasks");
                self.cancellation_token.cancel();
                self.wait_for_tasks_with_timeout(Duration::from_secs(30)).await;
            }
            // a task ending on its own is either a fatal error or a bug
            result = futures::future::select_all(&mut self.tasks) => {
                let (result, _index, _remaining) = result;
                self.cancellation_token.cancel();
                match result {
                    Ok(Ok(())) => tracing::warn!("Task completed unexpectedly"),
                    Ok(Err(e)) => {
                        tracing::error!("Task failed: {e}");
                        return Err(e);
                    }
                    Err(e) => {
                        tracing::error!("Task panicked or was aborted: {e}");
                        return Err(e.into());
                    }
                }
            }
        }

        Ok(())
    }

    async fn wait_for_tasks_with_timeout(&mut self, timeout: Duration) {
        tokio::time::timeout(timeout, async {
            for task in &mut self.tasks {
                match task.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::error!("Task failed during shutdown: {e}"),
                    Err(e) => tracing::error!("Task failed during shutdown: {e}"),
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("Task shutdown timed out after {:?}", timeout);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::monitor::ContainerLister;

    #[tokio::test]
    async fn failing_task_ends_the_wait() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("uid-1_main")).unwrap();
        utils::shared_region::RegionImage::new()
            .raw_process_count(-4)
            .write_to(root.path().join("uid-1_main/a.cache"))
            .unwrap();

        let mut tasks = Tasks::new();
        let lister = ContainerLister::new(root.path().to_path_buf(), "node-a", None);
        tasks.spawn_monitor(Monitor::new(lister, Duration::from_millis(10)));

        let result = tokio::time::timeout(Duration::from_secs(5), tasks.wait_for_completion())
            .await
            .unwrap();
        assert!(result.is_err());
    }
}
