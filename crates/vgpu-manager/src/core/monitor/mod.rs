//! Node monitor
//!
//! Runs the priority feedback controller over every shared region found by
//! the [`ContainerLister`], once per interval, until cancelled.

use std::time::Duration;

use error_stack::Report;
use feedback::FeedbackController;
use feedback::TickReport;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use utils::shared_region::RegionError;

use crate::core::ErrorKind;

pub mod lister;

pub use lister::ContainerLister;
pub use lister::ListerError;

/// Default feedback period.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum MonitorError {
    #[display("failed to list containers")]
    Listing,
    #[display("shared region {path} violates the layout")]
    Layout { path: String },
}

impl core::error::Error for MonitorError {}

impl MonitorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Listing => ErrorKind::Transient,
            Self::Layout { .. } => ErrorKind::Fatal,
        }
    }
}

pub struct Monitor {
    lister: ContainerLister,
    controller: FeedbackController,
    interval: Duration,
}

impl Monitor {
    pub fn new(lister: ContainerLister, interval: Duration) -> Self {
        Self {
            lister,
            controller: FeedbackController::new(),
            interval,
        }
    }

    /// One feedback pass over the regions currently mapped.
    ///
    /// A region whose header no longer fits the layout stops the monitor;
    /// other access failures only skip that container.
    pub fn tick(&mut self) -> Result<TickReport, Report<MonitorError>> {
        for (path, region) in self.lister.regions() {
            if let Err(RegionError::LayoutViolation(reason)) = region.validate() {
                return Err(Report::new(MonitorError::Layout {
                    path: path.display().to_string(),
                })
                .attach_printable(reason));
            }
        }

        let mut regions = self.lister.regions_mut();
        Ok(self.controller.tick(&mut regions))
    }

    async fn refresh(&mut self) -> Result<(), Report<MonitorError>> {
        if let Err(err) = self.lister.update().await {
            let context = match err.current_context() {
                ListerError::Layout { path } => MonitorError::Layout { path: path.clone() },
                ListerError::ReadDir { .. } => MonitorError::Listing,
            };
            return Err(err.change_context(context));
        }
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(interval = ?self.interval))]
    pub async fn run(mut self, token: CancellationToken) -> Result<(), Report<MonitorError>> {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    tracing::info!("Monitor cancelled");
                    return Ok(());
                }
                _ = interval.tick() => {}
            }

            if let Err(err) = self.refresh().await {
                if err.current_context().kind() == ErrorKind::Fatal {
                    return Err(err);
                }
                tracing::warn!("Failed to update container list: {err:?}");
                continue;
            }

            let report = self.tick()?;
            for (index, change) in &report.changes {
                tracing::info!(container = index, %change, "Feedback signal changed");
            }
            tracing::debug!(
                tick = self.controller.ticks(),
                containers = self.lister.count(),
                observed = report.observed,
                skipped = report.skipped,
                "Feedback tick done"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::path::PathBuf;

    use feedback::BLOCKED_SENTINEL;
    use similar_asserts::assert_eq;
    use utils::shared_region::RegionImage;
    use utils::shared_region::SharedRegion;

    use super::*;

    fn write_region(root: &Path, dir: &str, image: RegionImage) -> PathBuf {
        let dir = root.join(dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("region.cache");
        image.write_to(&path).unwrap();
        path
    }

    fn container(priority: i32, uuid: &str, recent_kernel: i32) -> RegionImage {
        RegionImage::new()
            .device(0, uuid, 1 << 30, 50)
            .priority(priority)
            .recent_kernel(recent_kernel)
    }

    fn read(path: &Path) -> SharedRegion {
        SharedRegion::open(path).unwrap()
    }

    async fn monitor(root: &Path) -> Monitor {
        let mut lister = ContainerLister::new(root.to_path_buf(), "node-a", None);
        lister.update().await.unwrap();
        Monitor::new(lister, DEFAULT_INTERVAL)
    }

    #[test_log::test(tokio::test)]
    async fn higher_tier_activity_blocks_lower_tier() {
        let root = tempfile::tempdir().unwrap();
        let high = write_region(root.path(), "uid-a_main", container(0, "GPU-D", 3));
        let low = write_region(root.path(), "uid-b_main", container(1, "GPU-D", 3));

        let report = monitor(root.path()).await.tick().unwrap();

        assert_eq!(report.observed, 2);
        assert_eq!(read(&high).recent_kernel(), 2);
        assert_eq!(read(&low).recent_kernel(), BLOCKED_SENTINEL);
        assert_eq!(read(&low).utilization_switch(), 1);
    }

    #[tokio::test]
    async fn same_tier_tenants_share_contention() {
        let root = tempfile::tempdir().unwrap();
        let first = write_region(root.path(), "uid-a_main", container(1, "GPU-D", 3));
        let second = write_region(root.path(), "uid-b_main", container(1, "GPU-D", 3));

        monitor(root.path()).await.tick().unwrap();

        for path in [first, second] {
            let region = read(&path);
            assert_eq!(region.recent_kernel(), 2);
            assert_eq!(region.utilization_switch(), 1);
        }
    }

    #[tokio::test]
    async fn header_rewritten_out_of_layout_stops_the_monitor() {
        let root = tempfile::tempdir().unwrap();
        let path = write_region(root.path(), "uid-a_main", container(0, "GPU-D", 3));
        let mut monitor = monitor(root.path()).await;

        container(0, "GPU-D", 3)
            .raw_device_count(99)
            .write_to(&path)
            .unwrap();

        let err = monitor.tick().unwrap_err();
        assert!(matches!(err.current_context(), MonitorError::Layout { .. }));
        assert_eq!(err.current_context().kind(), ErrorKind::Fatal);
    }

    #[tokio::test]
    async fn run_returns_once_cancelled() {
        let root = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let monitor = monitor(root.path()).await;
        tokio::time::timeout(Duration::from_secs(5), monitor.run(token))
            .await
            .unwrap()
            .unwrap();
    }
}
