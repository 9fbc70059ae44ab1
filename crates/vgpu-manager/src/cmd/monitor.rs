use std::time::Duration;

use anyhow::Result;
use utils::version;

use crate::app::connect_cluster;
use crate::app::Tasks;
use crate::config::MonitorArgs;
use crate::core::monitor::ContainerLister;
use crate::core::monitor::Monitor;
use crate::core::monitor::DEFAULT_INTERVAL;

pub async fn run_monitor(args: MonitorArgs) -> Result<()> {
    let _guard = utils::logging::init();

    tracing::info!("Starting vgpu monitor {}", &**version::VERSION);

    let store = if args.enable_k8s {
        Some(connect_cluster(&args.cluster).await?)
    } else {
        None
    };
    let lister = ContainerLister::new(args.containers_dir, args.cluster.node_name, store);
    let interval = match args.interval_secs {
        0 => DEFAULT_INTERVAL,
        secs => Duration::from_secs(secs),
    };
    let monitor = Monitor::new(lister, interval);

    let mut tasks = Tasks::new();
    tasks.spawn_monitor(monitor);
    tasks.wait_for_completion().await?;

    tracing::info!("Monitor stopped");
    Ok(())
}
