use std::sync::Arc;

use anyhow::Result;
use utils::version;

use crate::app::NodeServices;
use crate::app::Tasks;
use crate::config::HostPaths;
use crate::config::RegisterArgs;

pub async fn run_register(args: RegisterArgs) -> Result<()> {
    let _guard = utils::logging::init();

    tracing::info!("Starting device registration {}", &**version::VERSION);

    let services =
        NodeServices::build(&args.cluster, &args.device_config, HostPaths::default()).await?;

    let mut tasks = Tasks::new();
    tasks.spawn_registrar(Arc::new(services.registrar()));
    tasks.wait_for_completion().await?;

    Ok(())
}
