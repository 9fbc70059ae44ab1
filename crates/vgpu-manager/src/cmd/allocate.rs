use anyhow::Result;
use utils::version;

use crate::app::NodeServices;
use crate::config::AllocateArgs;
use crate::config::HostPaths;
use crate::core::allocation::AllocateRequest;
use crate::core::catalog::resource_managers;

/// Serves one allocation call and prints the response as JSON on stdout.
pub async fn run_allocate(args: AllocateArgs) -> Result<()> {
    let _guard = utils::logging::init();

    tracing::info!("Starting allocation {}", &**version::VERSION);

    let services = NodeServices::build(
        &args.cluster,
        &args.device_config,
        HostPaths::from(&args.host),
    )
    .await?;

    let managers = resource_managers(&services.config, services.inventory.as_ref())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to build resource managers: {e:?}"))?;
    let manager = managers
        .into_iter()
        .find(|manager| manager.resource_name == args.resource)
        .ok_or_else(|| anyhow::anyhow!("Resource {} is not served on this node", args.resource))?;

    let request = AllocateRequest::single(args.device_ids);
    let response = services
        .coordinator()
        .allocate(&manager, &request)
        .await
        .map_err(|e| {
            anyhow::anyhow!(
                "Allocation failed ({}): {e:?}",
                e.current_context().kind()
            )
        })?;

    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
