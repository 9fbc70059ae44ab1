pub mod allocation;
pub mod catalog;
pub mod monitor;
pub mod register;

/// How a failure should be treated by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum ErrorKind {
    /// Something expected is absent: no pending pod, missing region file
    #[display("not found")]
    NotFound,
    /// The scheduler's record and the request disagree
    #[display("mismatch")]
    Mismatch,
    /// Worth retrying: lock contention, write conflicts
    #[display("transient")]
    Transient,
    /// The process cannot safely continue
    #[display("fatal")]
    Fatal,
}
