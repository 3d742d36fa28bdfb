use ash::vk;
#[cfg(feature = "log-lifetimes")]
use tracing::trace;

use crate::backend::{Backend, SemaphoreKind, SemaphoreSignal, SemaphoreWait};
use crate::device::LogicalDevice;
use crate::traits::Destructible;
use crate::RhiError;

/// GPU to GPU ordering primitive, either binary or timeline
pub struct Semaphore<B: Backend> {
    device: LogicalDevice<B>,
    raw: vk::Semaphore,
    kind: SemaphoreKind,
}

impl<B: Backend> std::fmt::Debug for Semaphore<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("raw", &self.raw)
            .field("kind", &self.kind)
            .finish()
    }
}

impl<B: Backend> Semaphore<B> {
    pub fn new(device: LogicalDevice<B>, kind: SemaphoreKind) -> Result<Self, RhiError> {
        let raw = device.backend().create_semaphore(kind)?;

        #[cfg(feature = "log-lifetimes")]
        trace!("Creating VkSemaphore {:?}", raw);

        Ok(Self { device, raw, kind })
    }

    pub fn raw(&self) -> vk::Semaphore {
        self.raw
    }

    pub fn kind(&self) -> SemaphoreKind {
        self.kind
    }

    pub fn is_timeline(&self) -> bool {
        matches!(self.kind, SemaphoreKind::Timeline { .. })
    }

    fn ensure_timeline(&self) -> Result<(), RhiError> {
        if self.is_timeline() {
            Ok(())
        } else {
            Err(RhiError::NotTimeline)
        }
    }

    /// Current counter value
    pub fn value(&self) -> Result<u64, RhiError> {
        self.ensure_timeline()?;
        Ok(self.device.backend().semaphore_value(self.raw)?)
    }

    /// Signal `value` from the host
    pub fn signal(&self, value: u64) -> Result<(), RhiError> {
        self.ensure_timeline()?;
        Ok(self.device.backend().signal_semaphore(self.raw, value)?)
    }

    /// Block until the counter reaches `value`. Returns `false` on timeout.
    pub fn wait(&self, value: u64, timeout: u64) -> Result<bool, RhiError> {
        self.ensure_timeline()?;
        Ok(self
            .device
            .backend()
            .wait_semaphore(self.raw, value, timeout)?)
    }

    /// Wait entry for a submission. `value` is ignored by binary semaphores.
    pub fn wait_info(&self, value: u64, stage: vk::PipelineStageFlags) -> SemaphoreWait {
        SemaphoreWait {
            semaphore: self.raw,
            value,
            stage,
        }
    }

    /// Signal entry for a submission. `value` is ignored by binary semaphores.
    pub fn signal_info(&self, value: u64) -> SemaphoreSignal {
        SemaphoreSignal {
            semaphore: self.raw,
            value,
        }
    }
}

impl<B: Backend> Destructible for Semaphore<B> {
    fn destroy(&mut self) {
        #[cfg(feature = "log-lifetimes")]
        trace!("Destroying VkSemaphore {:?}", self.raw);

        self.device.backend().destroy_semaphore(self.raw);
    }
}

#[cfg(feature = "raii")]
impl<B: Backend> Drop for Semaphore<B> {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HeadlessBackend, SubmitDesc};
    use crate::settings::RhiSettings;

    fn device() -> LogicalDevice<HeadlessBackend> {
        LogicalDevice::new(HeadlessBackend::new("test"), RhiSettings::default())
    }

    #[test]
    fn binary_has_no_counter() {
        let semaphore = Semaphore::new(device(), SemaphoreKind::Binary).unwrap();
        assert!(!semaphore.is_timeline());
        assert_eq!(semaphore.value(), Err(RhiError::NotTimeline));
        assert_eq!(semaphore.signal(1), Err(RhiError::NotTimeline));
    }

    #[test]
    fn timeline_host_signal_and_gpu_signal() {
        let device = device();
        let semaphore =
            Semaphore::new(device.clone(), SemaphoreKind::Timeline { initial_value: 2 }).unwrap();
        assert_eq!(semaphore.value().unwrap(), 2);
        semaphore.signal(5).unwrap();
        assert_eq!(semaphore.value().unwrap(), 5);

        let backend = device.backend();
        backend
            .queue_submit(
                backend.get_queue(0),
                &SubmitDesc {
                    command_buffers: &[],
                    wait_semaphores: &[],
                    signal_semaphores: &[semaphore.signal_info(9)],
                    fence: vk::Fence::null(),
                },
            )
            .unwrap();
        assert!(!semaphore.wait(9, 0).unwrap());
        assert!(semaphore.wait(9, u64::MAX).unwrap());
        assert_eq!(semaphore.value().unwrap(), 9);
    }
}
