use anyhow::Context;
use anyhow::Result;
use utils::shared_region::SharedRegion;

use crate::config::ShowShmArgs;

pub async fn run_show_shm(args: ShowShmArgs) -> Result<()> {
    let _guard = utils::logging::init();

    tracing::info!("Opening shared region at {}", args.path.display());

    let region = SharedRegion::open(&args.path)
        .with_context(|| format!("failed to open {}", args.path.display()))?;
    region.validate().context("shared region is inconsistent")?;

    tracing::info!(
        "Region {}: initialized={}, sm_initialized={}, owner_pid={}",
        region.name(),
        region.is_initialized(),
        region.sm_initialized(),
        region.owner_pid()
    );

    let device_count = region.device_count()?;
    tracing::info!("Shared region contains {} devices", device_count);
    for i in 0..device_count {
        let uuid = region.device_uuid(i)?.unwrap_or_default();
        tracing::info!(
            "Device {}: UUID={}, MemLimit={}, SmLimit={}%",
            i,
            uuid,
            region.memory_limit(i)?,
            region.core_limit(i)?
        );
    }

    tracing::info!(
        "Priority={}, RecentKernel={}, UtilizationSwitch={}",
        region.priority(),
        region.recent_kernel(),
        region.utilization_switch()
    );

    let processes = region.processes()?;
    tracing::info!("Process slots in use: {}", processes.len());
    if args.processes {
        for slot in &processes {
            let used: Vec<u64> = slot.memory[..device_count]
                .iter()
                .map(|memory| memory.total)
                .collect();
            tracing::info!(
                "PID {} (host {}): status={}, used={:?}, monitor_used={:?}",
                slot.pid,
                slot.host_pid,
                slot.status,
                used,
                &slot.monitor_used[..device_count]
            );
        }
    }

    Ok(())
}
