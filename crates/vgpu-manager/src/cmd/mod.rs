//! Command layer - Entry points for the node agent operations

pub mod allocate;
pub mod monitor;
pub mod register;
pub mod show_shm;

pub use allocate::run_allocate;
pub use monitor::run_monitor;
pub use register::run_register;
pub use show_shm::run_show_shm;
