use derive_more::Display;

/// Error type raised by signal backends.
#[derive(Debug, Display)]
pub enum FeedbackError {
    /// The backing region could not be read or written.
    #[display("signal storage access failed: {reason}")]
    StorageFailure { reason: String },
}

impl core::error::Error for FeedbackError {}

impl FeedbackError {
    pub fn storage(reason: impl Into<String>) -> Self {
        Self::StorageFailure {
            reason: reason.into(),
        }
    }
}
