pub mod cli;
pub mod daemon;
pub mod device;
pub mod plugin;
pub mod shm;

pub use cli::*;
pub use daemon::*;
pub use device::*;
pub use plugin::*;
pub use shm::*;
