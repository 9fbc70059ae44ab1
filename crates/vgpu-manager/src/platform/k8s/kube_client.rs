use std::path::Path;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::Client;
use kube::Config;

use super::KubernetesError;

/// Upper bound for one API round trip.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

fn connection_failed(message: String) -> KubernetesError {
    KubernetesError::ConnectionFailed { message }
}

async fn load_config(kubeconfig: Option<&Path>) -> Result<Config, Report<KubernetesError>> {
    let Some(path) = kubeconfig else {
        // in-cluster service account first, then ~/.kube/config
        return Config::infer()
            .await
            .change_context_lazy(|| connection_failed("no usable cluster configuration".into()));
    };

    let kubeconfig = Kubeconfig::read_from(path).change_context_lazy(|| {
        connection_failed(format!("failed to read kubeconfig {}", path.display()))
    })?;
    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .change_context_lazy(|| {
            connection_failed(format!("invalid kubeconfig {}", path.display()))
        })
}

/// Builds a client from `kubeconfig`, or from the in-cluster / default
/// configuration when no path is given.
pub async fn init_kube_client(
    kubeconfig: Option<&Path>,
) -> Result<Client, Report<KubernetesError>> {
    let mut config = load_config(kubeconfig).await?;
    config.connect_timeout = Some(REQUEST_TIMEOUT);
    config.read_timeout = Some(REQUEST_TIMEOUT);
    config.write_timeout = Some(REQUEST_TIMEOUT);

    tracing::info!(
        cluster = %config.cluster_url,
        namespace = %config.default_namespace,
        "Connecting to Kubernetes API server"
    );
    Client::try_from(config)
        .change_context_lazy(|| connection_failed("failed to build HTTP client".into()))
}
