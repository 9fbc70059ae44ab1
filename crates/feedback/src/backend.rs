use crate::FeedbackError;
use crate::Result;

/// Control fields of one monitored container.
///
/// Everything except the recent-kernel counter and the utilization switch is
/// owned by the interception library and only read here.
pub trait ContainerSignals {
    /// Short label used in log output.
    fn label(&self) -> String;

    /// Static priority tier, 0 being the highest.
    fn priority(&self) -> Result<i32, FeedbackError>;

    /// UUIDs of the occupied device slots.
    fn device_uuids(&self) -> Result<Vec<String>, FeedbackError>;

    fn recent_kernel(&self) -> Result<i32, FeedbackError>;
    fn set_recent_kernel(&mut self, value: i32) -> Result<(), FeedbackError>;

    fn utilization_switch(&self) -> Result<i32, FeedbackError>;
    fn set_utilization_switch(&mut self, value: i32) -> Result<(), FeedbackError>;
}

impl<T: ContainerSignals + ?Sized> ContainerSignals for &mut T {
    fn label(&self) -> String {
        (**self).label()
    }

    fn priority(&self) -> Result<i32, FeedbackError> {
        (**self).priority()
    }

    fn device_uuids(&self) -> Result<Vec<String>, FeedbackError> {
        (**self).device_uuids()
    }

    fn recent_kernel(&self) -> Result<i32, FeedbackError> {
        (**self).recent_kernel()
    }

    fn set_recent_kernel(&mut self, value: i32) -> Result<(), FeedbackError> {
        (**self).set_recent_kernel(value)
    }

    fn utilization_switch(&self) -> Result<i32, FeedbackError> {
        (**self).utilization_switch()
    }

    fn set_utilization_switch(&mut self, value: i32) -> Result<(), FeedbackError> {
        (**self).set_utilization_switch(value)
    }
}
