use clap::Parser;
use std::path::PathBuf;

/// Node identity and API server access.
#[derive(Parser, Clone, Debug)]
pub struct ClusterArgs {
    #[arg(
        long,
        env = "NODE_NAME",
        help = "Name of the node this agent runs on"
    )]
    pub node_name: String,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,
}

/// Sources of the device configuration.
#[derive(Parser, Clone, Debug)]
pub struct DeviceConfigArgs {
    #[arg(
        long,
        env = "VGPU_CONFIG_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "Device configuration YAML (default: the volcano-vgpu-device-config ConfigMap)"
    )]
    pub config_file: Option<PathBuf>,

    #[arg(
        long,
        env = "VGPU_NODE_CONFIG_FILE",
        value_hint = clap::ValueHint::FilePath,
        default_value = "/config/config.json",
        help = "Per-node overrides (JSON with a nodeconfig list)"
    )]
    pub node_config_file: PathBuf,
}

/// Host locations handed to containers.
#[derive(Parser, Clone, Debug)]
pub struct HostPathArgs {
    #[arg(
        long,
        env = "HOOK_PATH",
        value_hint = clap::ValueHint::DirPath,
        default_value = "/usr/local/vgpu",
        help = "Host directory holding libvgpu.so and ld.so.preload"
    )]
    pub hook_path: PathBuf,

    #[arg(
        long,
        env = "VGPU_CONTAINERS_DIR",
        value_hint = clap::ValueHint::DirPath,
        default_value = "/tmp/vgpu/containers",
        help = "Host directory with one shared-region directory per container"
    )]
    pub containers_dir: PathBuf,

    #[arg(
        long,
        value_hint = clap::ValueHint::DirPath,
        default_value = "/tmp/vgpulock",
        help = "Host directory shared by all containers for inter-container locking"
    )]
    pub lock_dir: PathBuf,

    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        default_value = "/tmp/migconfig.yaml",
        help = "Where a rewritten MIG partition spec is written before it is applied"
    )]
    pub mig_config_path: PathBuf,
}

#[derive(Parser, Clone, Debug)]
pub struct MonitorArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,

    #[arg(
        long,
        env = "VGPU_CONTAINERS_DIR",
        value_hint = clap::ValueHint::DirPath,
        default_value = "/tmp/vgpu/containers",
        help = "Host directory with one shared-region directory per container"
    )]
    pub containers_dir: PathBuf,

    #[arg(
        long,
        default_value = "5",
        help = "Seconds between two feedback ticks"
    )]
    pub interval_secs: u64,

    #[arg(
        long,
        help = "Remove directories of pods that no longer run on this node",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub enable_k8s: bool,
}

#[derive(Parser, Clone, Debug)]
pub struct RegisterArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,

    #[command(flatten)]
    pub device_config: DeviceConfigArgs,
}

#[derive(Parser, Clone, Debug)]
pub struct AllocateArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,

    #[command(flatten)]
    pub device_config: DeviceConfigArgs,

    #[command(flatten)]
    pub host: HostPathArgs,

    #[arg(long, help = "Resource name the call is made for, e.g. volcano.sh/vgpu-number")]
    pub resource: String,

    #[arg(
        long,
        value_delimiter = ',',
        help = "Device IDs handed out by the kubelet, comma separated"
    )]
    pub device_ids: Vec<String>,
}
