//! Priority feedback controller for co-resident GPU workloads.
//!
//! Each container attached to a shared GPU exposes a small set of control
//! fields through its shared region (see [`ContainerSignals`]). Once per tick
//! the [`FeedbackController`] ages every container's recent-kernel counter,
//! builds a per-device, per-priority-tier activity aggregate, and then writes
//! two signals back:
//!
//! - a hard-block sentinel in the recent-kernel counter when a strictly
//!   higher-priority tier was active on one of the container's devices
//! - the utilization switch when the container is blocked or shares its tier
//!   with another active tenant on the same device
//!
//! The crate performs no I/O of its own; the node agent supplies backends.

use error_stack::Report;

mod backend;
mod controller;
mod error;

/// Result type using error-stack for context-rich error reporting
pub type Result<T, C> = core::result::Result<T, Report<C>>;

pub use backend::ContainerSignals;
pub use controller::{
    ActivityAggregate, FeedbackController, SignalChange, TickReport, BLOCKED_SENTINEL,
};
pub use error::FeedbackError;
