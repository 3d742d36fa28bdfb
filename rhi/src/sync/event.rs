use ash::vk;
#[cfg(feature = "log-lifetimes")]
use tracing::trace;

use crate::backend::Backend;
use crate::device::LogicalDevice;
use crate::traits::Destructible;
use crate::RhiError;

/// Fine grained signal settable from both the host and a command buffer
pub struct Event<B: Backend> {
    device: LogicalDevice<B>,
    raw: vk::Event,
}

impl<B: Backend> std::fmt::Debug for Event<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event").field("raw", &self.raw).finish()
    }
}

impl<B: Backend> Event<B> {
    pub fn new(device: LogicalDevice<B>) -> Result<Self, RhiError> {
        let raw = device.backend().create_event()?;

        #[cfg(feature = "log-lifetimes")]
        trace!("Creating VkEvent {:?}", raw);

        Ok(Self { device, raw })
    }

    pub fn raw(&self) -> vk::Event {
        self.raw
    }

    pub fn is_signaled(&self) -> Result<bool, RhiError> {
        Ok(self.device.backend().event_status(self.raw)?)
    }

    pub fn set(&self) -> Result<(), RhiError> {
        Ok(self.device.backend().set_event(self.raw, true)?)
    }

    pub fn reset(&self) -> Result<(), RhiError> {
        Ok(self.device.backend().set_event(self.raw, false)?)
    }
}

impl<B: Backend> Destructible for Event<B> {
    fn destroy(&mut self) {
        #[cfg(feature = "log-lifetimes")]
        trace!("Destroying VkEvent {:?}", self.raw);

        self.device.backend().destroy_event(self.raw);
    }
}

#[cfg(feature = "raii")]
impl<B: Backend> Drop for Event<B> {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use crate::settings::RhiSettings;

    #[test]
    fn host_set_and_reset() {
        let device = LogicalDevice::new(HeadlessBackend::new("test"), RhiSettings::default());
        let event = Event::new(device).unwrap();
        assert!(!event.is_signaled().unwrap());
        event.set().unwrap();
        assert!(event.is_signaled().unwrap());
        event.reset().unwrap();
        assert!(!event.is_signaled().unwrap());
    }
}
