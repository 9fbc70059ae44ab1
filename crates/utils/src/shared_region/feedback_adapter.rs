//! Feedback adapter
//!
//! Implement the feedback controller's ContainerSignals trait for SharedRegion

use error_stack::Report;
use feedback::ContainerSignals;
use feedback::FeedbackError;

use super::SharedRegion;

type Result<T> = core::result::Result<T, Report<FeedbackError>>;

impl<B> ContainerSignals for SharedRegion<B>
where
    B: AsRef<[u8]> + AsMut<[u8]>,
{
    fn label(&self) -> String {
        self.name().to_string()
    }

    fn priority(&self) -> Result<i32> {
        Ok(SharedRegion::priority(self))
    }

    /// Re-validates the header, since the library may rewrite it at any time
    fn device_uuids(&self) -> Result<Vec<String>> {
        self.validate()
            .map_err(|err| Report::new(FeedbackError::storage(err.to_string())))?;
        Ok(SharedRegion::device_uuids(self))
    }

    fn recent_kernel(&self) -> Result<i32> {
        Ok(SharedRegion::recent_kernel(self))
    }

    fn set_recent_kernel(&mut self, value: i32) -> Result<()> {
        SharedRegion::set_recent_kernel(self, value);
        Ok(())
    }

    fn utilization_switch(&self) -> Result<i32> {
        Ok(SharedRegion::utilization_switch(self))
    }

    fn set_utilization_switch(&mut self, value: i32) -> Result<()> {
        SharedRegion::set_utilization_switch(self, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use feedback::FeedbackController;
    use feedback::BLOCKED_SENTINEL;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::shared_region::RegionImage;

    fn region(priority: i32, uuid: &str, recent_kernel: i32) -> SharedRegion<Vec<u8>> {
        let bytes = RegionImage::new()
            .device(0, uuid, 1 << 30, 50)
            .priority(priority)
            .recent_kernel(recent_kernel)
            .into_bytes();
        SharedRegion::from_buffer(bytes).unwrap()
    }

    #[test]
    fn controller_drives_region_control_fields() {
        let mut regions = vec![region(0, "GPU-D", 3), region(1, "GPU-D", 3)];

        FeedbackController::new().tick(&mut regions);

        assert_eq!(regions[0].recent_kernel(), 2);
        assert_eq!(regions[1].recent_kernel(), BLOCKED_SENTINEL);
        assert_eq!(regions[1].utilization_switch(), 1);
    }

    #[test]
    fn corrupted_header_skips_the_container() {
        let bytes = RegionImage::new()
            .device(0, "GPU-D", 1, 1)
            .recent_kernel(3)
            .into_bytes();
        let mut corrupted = SharedRegion::from_buffer(bytes).unwrap();
        // the library rewrites the header after the region was mapped
        corrupted.buf[crate::shared_region::layout::DEVICE_NUM_OFFSET] = 99;

        let mut regions = vec![corrupted, region(1, "GPU-D", 3)];
        let report = FeedbackController::new().tick(&mut regions);

        assert_eq!(report.skipped, 1);
        assert_eq!(regions[0].recent_kernel(), 3);
        assert_eq!(regions[1].recent_kernel(), 2);
    }
}
