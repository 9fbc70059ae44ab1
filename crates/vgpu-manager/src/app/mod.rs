//! Application wiring: building the node services and running background
//! tasks until shutdown.

pub mod services;
pub mod tasks;

pub use services::connect_cluster;
pub use services::NodeServices;
pub use tasks::Tasks;
