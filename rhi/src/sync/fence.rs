use std::sync::Mutex;

use ash::vk;
#[cfg(feature = "log-lifetimes")]
use tracing::trace;

use crate::backend::Backend;
use crate::device::LogicalDevice;
use crate::RhiError;

/// Free list of unsignaled-on-acquire fences shared by every queue of a device
#[derive(Debug, Default)]
pub struct FenceCache {
    free: Mutex<Vec<vk::Fence>>,
}

impl FenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a cached fence, resetting it, or create a new one
    pub fn acquire<B: Backend>(&self, backend: &B) -> Result<vk::Fence, RhiError> {
        let cached = self.free.lock()?.pop();
        match cached {
            Some(fence) => {
                backend.reset_fence(fence)?;
                Ok(fence)
            }
            None => {
                let fence = backend.create_fence(false)?;

                #[cfg(feature = "log-lifetimes")]
                trace!("Created pooled VkFence {:?}", fence);

                Ok(fence)
            }
        }
    }

    pub fn release(&self, fence: vk::Fence) {
        match self.free.lock() {
            Ok(mut free) => free.push(fence),
            Err(_) => tracing::error!(?fence, "Fence cache poisoned, leaking fence"),
        }
    }

    /// Number of fences waiting to be reused
    pub fn len(&self) -> usize {
        self.free.lock().map(|free| free.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn destroy_all<B: Backend>(&self, backend: &B) {
        let fences = match self.free.lock() {
            Ok(mut free) => std::mem::take(&mut *free),
            Err(_) => return,
        };
        for fence in fences {
            backend.destroy_fence(fence);
        }
    }
}

/// A fence borrowed from the device's [`FenceCache`].
///
/// Shared through an `Arc` by every command buffer of one submission. The fence goes back to the
/// cache once the last of them lets go of it.
pub struct PooledFence<B: Backend> {
    device: LogicalDevice<B>,
    raw: vk::Fence,
}

impl<B: Backend> std::fmt::Debug for PooledFence<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledFence").field("raw", &self.raw).finish()
    }
}

impl<B: Backend> PooledFence<B> {
    pub(crate) fn new(device: LogicalDevice<B>) -> Result<Self, RhiError> {
        let raw = device.fence_cache().acquire(device.backend())?;
        Ok(Self { device, raw })
    }

    pub fn raw(&self) -> vk::Fence {
        self.raw
    }

    pub fn is_signaled(&self) -> Result<bool, RhiError> {
        Ok(self.device.backend().fence_status(self.raw)?)
    }

    /// Returns `false` if `timeout` (in nanoseconds) elapsed first
    pub fn wait(&self, timeout: u64) -> Result<bool, RhiError> {
        Ok(self.device.backend().wait_for_fence(self.raw, timeout)?)
    }
}

impl<B: Backend> Drop for PooledFence<B> {
    fn drop(&mut self) {
        self.device.fence_cache().release(self.raw);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::{HeadlessBackend, SubmitDesc};
    use crate::settings::RhiSettings;

    #[test]
    fn fence_returns_when_last_owner_drops() {
        let device = LogicalDevice::new(HeadlessBackend::new("test"), RhiSettings::default());
        let fence = Arc::new(PooledFence::new(device.clone()).unwrap());
        let shared = fence.clone();
        assert!(device.fence_cache().is_empty());

        drop(fence);
        assert!(device.fence_cache().is_empty());
        drop(shared);
        assert_eq!(device.fence_cache().len(), 1);
    }

    #[test]
    fn reused_fence_is_reset() {
        let device = LogicalDevice::new(HeadlessBackend::new("test"), RhiSettings::default());
        let backend = device.backend();
        let first = PooledFence::new(device.clone()).unwrap();
        let raw = first.raw();
        backend
            .queue_submit(
                backend.get_queue(0),
                &SubmitDesc {
                    command_buffers: &[],
                    wait_semaphores: &[],
                    signal_semaphores: &[],
                    fence: raw,
                },
            )
            .unwrap();
        assert!(first.wait(u64::MAX).unwrap());
        drop(first);

        let second = PooledFence::new(device.clone()).unwrap();
        assert_eq!(second.raw(), raw);
        assert!(!second.is_signaled().unwrap());
        assert_eq!(backend.live_fences(), 1);
    }
}
