use clap::{Parser, Subcommand};
use utils::version;

use crate::config::daemon::{AllocateArgs, MonitorArgs, RegisterArgs};
use crate::config::shm::ShowShmArgs;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the priority feedback loop over local containers
    Monitor(MonitorArgs),
    /// Periodically advertise this node's devices
    Register(RegisterArgs),
    /// Run one allocation call and print the container response
    Allocate(Box<AllocateArgs>),
    /// Show a container's shared region
    #[command(name = "show-shm")]
    ShowShm(ShowShmArgs),
}
