use ash::vk;
use derivative::Derivative;
#[cfg(feature = "log-lifetimes")]
use tracing::trace;

use crate::backend::Backend;
use crate::device::LogicalDevice;
use crate::settings::DescriptorLimits;
use crate::traits::Destructible;
use crate::RhiError;

/// Fixed capacity descriptor pool sized from a [`DescriptorLimits`] table
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct DescriptorPool<B: Backend> {
    device: LogicalDevice<B>,
    handle: vk::DescriptorPool,
    capacity: u32,
    allocated: u32,
    /// The driver ran out of pool memory before `capacity` was reached
    exhausted: bool,
}

impl<B: Backend> DescriptorPool<B> {
    pub fn new(device: LogicalDevice<B>, limits: &DescriptorLimits) -> Result<Self, RhiError> {
        let handle = device
            .backend()
            .create_descriptor_pool(limits.max_sets, &limits.pool_sizes())?;

        #[cfg(feature = "log-lifetimes")]
        trace!("Creating VkDescriptorPool {:?}", handle);

        Ok(Self {
            device,
            handle,
            capacity: limits.max_sets,
            allocated: 0,
            exhausted: false,
        })
    }

    pub fn handle(&self) -> vk::DescriptorPool {
        self.handle
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn allocated(&self) -> u32 {
        self.allocated
    }

    pub fn is_full(&self) -> bool {
        self.exhausted || self.allocated >= self.capacity
    }

    /// Allocate one descriptor set.
    ///
    /// Fails with [`RhiError::DescriptorPoolFull`] once the pool is full.
    pub fn allocate(
        &mut self,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet, RhiError> {
        if self.is_full() {
            return Err(RhiError::DescriptorPoolFull);
        }
        match self
            .device
            .backend()
            .allocate_descriptor_set(self.handle, layout)
        {
            Ok(set) => {
                self.allocated += 1;
                Ok(set)
            }
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL) => {
                self.exhausted = true;
                Err(RhiError::DescriptorPoolFull)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Free every set allocated from the pool at once.
    ///
    /// Sets still bound in a recorded command buffer dangle afterwards.
    pub fn reset(&mut self) -> Result<(), RhiError> {
        self.device.backend().reset_descriptor_pool(self.handle)?;
        self.allocated = 0;
        self.exhausted = false;
        Ok(())
    }
}

impl<B: Backend> Destructible for DescriptorPool<B> {
    fn destroy(&mut self) {
        #[cfg(feature = "log-lifetimes")]
        trace!("Destroyed VkDescriptorPool {:?}", self.handle);

        self.device.backend().destroy_descriptor_pool(self.handle);
    }
}

#[cfg(feature = "raii")]
impl<B: Backend> Drop for DescriptorPool<B> {
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
    fn full_pool_rejects_until_reset() {
        let device = LogicalDevice::new(HeadlessBackend::new("test"), RhiSettings::default());
        let limits = DescriptorLimits {
            max_sets: 2,
            ..Default::default()
        };
        let mut pool = DescriptorPool::new(device, &limits).unwrap();
        let layout = vk::DescriptorSetLayout::null();
        let first = pool.allocate(layout).unwrap();
        let second = pool.allocate(layout).unwrap();
        assert_ne!(first, second);
        assert!(pool.is_full());
        assert_eq!(pool.allocate(layout), Err(RhiError::DescriptorPoolFull));
        assert_eq!(pool.allocated(), 2);

        pool.reset().unwrap();
        assert_eq!(pool.allocated(), 0);
        assert!(!pool.is_full());
        pool.allocate(layout).unwrap();
        assert_eq!(pool.capacity(), 2);
    }
}
