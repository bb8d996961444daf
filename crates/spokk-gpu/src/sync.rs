//! Synchronization primitives.

use crate::device::GpuDevice;
use crate::error::{GpuError, Result};
use ash::vk;

/// Create a semaphore.
pub fn create_semaphore(device: &dyn GpuDevice) -> Result<vk::Semaphore> {
    Ok(device.create_semaphore()?)
}

/// Create a fence.
pub fn create_fence(device: &dyn GpuDevice, signaled: bool) -> Result<vk::Fence> {
    Ok(device.create_fence(signaled)?)
}

/// Wait for a fence to be signaled.
///
/// A wait that outlasts `timeout_ns` is reported as [`GpuError::DeviceLost`]:
/// nothing the frame loop submits should take that long on a healthy device.
#[cfg_attr(
    feature = "profiling-tracy",
    tracing::instrument(level = "trace", skip_all)
)]
pub fn wait_for_fence(device: &dyn GpuDevice, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
    match device.wait_for_fence(fence, timeout_ns) {
        Ok(()) => Ok(()),
        Err(vk::Result::TIMEOUT) => {
            tracing::error!(?fence, timeout_ns, "Fence wait timed out");
            Err(GpuError::DeviceLost)
        }
        Err(e) => Err(e.into()),
    }
}

/// Reset a fence to unsignaled state.
#[cfg_attr(
    feature = "profiling-tracy",
    tracing::instrument(level = "trace", skip_all)
)]
pub fn reset_fence(device: &dyn GpuDevice, fence: vk::Fence) -> Result<()> {
    device.reset_fence(fence)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SubmitBatch;
    use crate::testing::FakeDevice;

    #[test]
    fn timed_out_wait_is_device_lost() {
        let fake = FakeDevice::new();
        fake.set_auto_complete(false);
        let fence = create_fence(&fake, false).unwrap();
        fake.queue_submit(vk::Queue::null(), &SubmitBatch::default(), fence)
            .unwrap();

        assert!(matches!(
            wait_for_fence(&fake, fence, 1_000),
            Err(GpuError::DeviceLost)
        ));

        assert!(fake.complete_next_submission());
        wait_for_fence(&fake, fence, 1_000).unwrap();
        fake.destroy_fence(fence);
    }

    #[test]
    fn signaled_fences_return_immediately() {
        let fake = FakeDevice::new();
        let fence = create_fence(&fake, true).unwrap();
        wait_for_fence(&fake, fence, 0).unwrap();
        reset_fence(&fake, fence).unwrap();
        assert!(!fake.fence_is_signaled(fence));
        fake.destroy_fence(fence);
        assert!(fake.violations().is_empty());
    }
}
