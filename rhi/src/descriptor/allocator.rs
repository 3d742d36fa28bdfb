//! Growable descriptor set allocation over a chain of fixed size pools.

use std::sync::Mutex;

use ash::vk;
use derivative::Derivative;

use super::DescriptorPool;
use crate::backend::Backend;
use crate::device::LogicalDevice;
use crate::resource::ResourceKey;
use crate::settings::DescriptorLimits;
use crate::RhiError;

#[derive(Derivative)]
#[derivative(Debug(bound = ""), Default(bound = ""))]
struct PoolChain<B: Backend> {
    active: Option<DescriptorPool<B>>,
    /// Full pools and the serial current when they filled up
    retired: Vec<(u64, DescriptorPool<B>)>,
    /// Reset pools ready to become active again
    free: Vec<DescriptorPool<B>>,
}

/// Hands out descriptor sets from an active pool, opening another one when it fills up.
///
/// Sets are transient: allocate, bind, submit. Command buffers binding a set keep its pool
/// alive, a retired pool is reset once no recording buffer binds its sets and the completed
/// watermark has passed both its retirement and the last submission that bound them. Resetting
/// invalidates every set the pool handed out, so a set must be bound before the next
/// collection.
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct DescriptorAllocator<B: Backend> {
    device: LogicalDevice<B>,
    limits: DescriptorLimits,
    chain: Mutex<PoolChain<B>>,
}

impl<B: Backend> DescriptorAllocator<B> {
    pub fn new(device: LogicalDevice<B>, limits: DescriptorLimits) -> Self {
        Self {
            device,
            limits,
            chain: Mutex::new(PoolChain::default()),
        }
    }

    pub fn limits(&self) -> &DescriptorLimits {
        &self.limits
    }

    fn open_pool(&self, chain: &mut PoolChain<B>) -> Result<DescriptorPool<B>, RhiError> {
        match chain.free.pop() {
            Some(pool) => Ok(pool),
            None => {
                tracing::debug!(
                    max_sets = self.limits.max_sets,
                    retired = chain.retired.len(),
                    "Opening descriptor pool"
                );
                DescriptorPool::new(self.device.clone(), &self.limits)
            }
        }
    }

    pub fn allocate(
        &self,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet, RhiError> {
        let mut chain = self.chain.lock()?;
        let (set, pool) = self.allocate_from_chain(&mut chain, layout)?;
        self.device.resources()?.register_descriptor_set(set, pool);
        Ok(set)
    }

    fn allocate_from_chain(
        &self,
        chain: &mut PoolChain<B>,
        layout: vk::DescriptorSetLayout,
    ) -> Result<(vk::DescriptorSet, vk::DescriptorPool), RhiError> {
        if let Some(active) = chain.active.as_mut() {
            match active.allocate(layout) {
                Err(RhiError::DescriptorPoolFull) => {
                    if let Some(full) = chain.active.take() {
                        chain.retired.push((self.device.current_serial(), full));
                    }
                }
                result => return result.map(|set| (set, active.handle())),
            }
        }
        let mut pool = self.open_pool(chain)?;
        // a fresh pool that cannot hold one set never will
        let set = pool.allocate(layout).map(|set| (set, pool.handle()));
        chain.active = Some(pool);
        set
    }

    /// Reset and recycle every retired pool the GPU and every recording command buffer are done
    /// with, as of `watermark`
    pub fn recycle(&self, watermark: u64) -> Result<usize, RhiError> {
        let mut chain = self.chain.lock()?;
        let mut resources = self.device.resources()?;
        let mut recycled = 0;
        let mut index = 0;
        while index < chain.retired.len() {
            let (retired_at, pool) = &chain.retired[index];
            let key = ResourceKey::DescriptorPool(pool.handle());
            if *retired_at > watermark || !resources.is_idle(key, watermark) {
                index += 1;
                continue;
            }
            let (retired_at, mut pool) = chain.retired.swap_remove(index);
            if let Err(err) = pool.reset() {
                chain.retired.push((retired_at, pool));
                return Err(err);
            }
            resources.forget_descriptor_pool(pool.handle());
            chain.free.push(pool);
            recycled += 1;
        }
        if recycled > 0 {
            tracing::trace!(recycled, watermark, "Recycled descriptor pools");
        }
        Ok(recycled)
    }

    /// Pools owned by the allocator, active, retired and free
    pub fn pool_count(&self) -> usize {
        self.chain
            .lock()
            .map(|chain| {
                usize::from(chain.active.is_some()) + chain.retired.len() + chain.free.len()
            })
            .unwrap_or(0)
    }

    pub fn retired_count(&self) -> usize {
        self.chain
            .lock()
            .map(|chain| chain.retired.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use crate::command::CommandBuffer;
    use crate::queue::QueueType;
    use crate::settings::RhiSettings;

    fn allocator(max_sets: u32) -> DescriptorAllocator<HeadlessBackend> {
        let device = LogicalDevice::new(HeadlessBackend::new("test"), RhiSettings::default());
        DescriptorAllocator::new(
            device,
            DescriptorLimits {
                max_sets,
                ..Default::default()
            },
        )
    }

    #[test]
    fn full_pool_is_retired_and_replaced() {
        let allocator = allocator(2);
        let layout = vk::DescriptorSetLayout::null();
        for _ in 0..5 {
            allocator.allocate(layout).unwrap();
        }
        assert_eq!(allocator.pool_count(), 3);
        assert_eq!(allocator.retired_count(), 2);
    }

    #[test]
    fn bound_sets_keep_their_pool_until_submission_completes() {
        let allocator = allocator(1);
        let layout = vk::DescriptorSetLayout::null();
        let set = allocator.allocate(layout).unwrap();
        allocator.allocate(layout).unwrap();
        assert_eq!(allocator.retired_count(), 1);

        let pool = allocator.device.backend().create_command_pool(0).unwrap();
        let raw = allocator
            .device
            .backend()
            .allocate_command_buffer(pool, vk::CommandBufferLevel::PRIMARY)
            .unwrap();
        let mut cb = CommandBuffer::new(
            allocator.device.clone(),
            raw,
            pool,
            std::thread::current().id(),
            vk::CommandBufferLevel::PRIMARY,
            QueueType::Compute,
            0,
        );
        cb.begin().unwrap();
        cb.bind_descriptor_sets(
            vk::PipelineBindPoint::COMPUTE,
            vk::PipelineLayout::null(),
            0,
            &[set],
            &[],
        )
        .unwrap();
        cb.dispatch(1, 1, 1).unwrap();
        // still recording
        assert_eq!(allocator.recycle(u64::MAX).unwrap(), 0);

        let serial = allocator.device.next_serial();
        cb.release_resources(Some(serial)).unwrap();
        assert_eq!(allocator.recycle(serial - 1).unwrap(), 0);
        assert_eq!(allocator.retired_count(), 1);
        assert_eq!(allocator.recycle(serial).unwrap(), 1);
        assert_eq!(allocator.retired_count(), 0);
    }

    #[test]
    fn retired_pools_come_back_after_watermark() {
        let allocator = allocator(1);
        let layout = vk::DescriptorSetLayout::null();
        allocator.allocate(layout).unwrap();
        allocator.device.next_serial();
        allocator.allocate(layout).unwrap();
        assert_eq!(allocator.retired_count(), 1);

        // retired at serial 1
        assert_eq!(allocator.recycle(0).unwrap(), 0);
        assert_eq!(allocator.recycle(1).unwrap(), 1);
        assert_eq!(allocator.retired_count(), 0);

        // the recycled pool is reused instead of creating a third one
        allocator.allocate(layout).unwrap();
        assert_eq!(allocator.pool_count(), 2);
    }
}
