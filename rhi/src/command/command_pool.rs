use std::thread::ThreadId;

use ash::vk;
use derivative::Derivative;
#[cfg(feature = "log-lifetimes")]
use tracing::trace;

use crate::backend::Backend;
use crate::command::{CommandBuffer, CommandBufferState};
use crate::device::LogicalDevice;
use crate::queue::QueueType;
use crate::traits::Destructible;
use crate::RhiError;

/// Command buffers of one queue family, recorded by one thread.
///
/// Finished buffers are kept on a free list per level instead of being freed. Recycling may
/// happen on any thread, so the native reset is deferred to the owning thread's next
/// [`CommandPool::get_or_allocate`].
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct CommandPool<B: Backend> {
    device: LogicalDevice<B>,
    raw: vk::CommandPool,
    queue_type: QueueType,
    family_index: u32,
    thread: ThreadId,
    /// Recycled buffers whose native reset is still due
    to_reset: Vec<(vk::CommandBuffer, vk::CommandBufferLevel)>,
    free_primary: Vec<vk::CommandBuffer>,
    free_secondary: Vec<vk::CommandBuffer>,
    allocated: usize,
}

impl<B: Backend> CommandPool<B> {
    pub fn new(
        device: LogicalDevice<B>,
        family_index: u32,
        queue_type: QueueType,
        thread: ThreadId,
    ) -> Result<Self, RhiError> {
        let raw = device.backend().create_command_pool(family_index)?;

        #[cfg(feature = "log-lifetimes")]
        trace!("Created VkCommandPool {:?}", raw);

        Ok(Self {
            device,
            raw,
            queue_type,
            family_index,
            thread,
            to_reset: Vec::new(),
            free_primary: Vec::new(),
            free_secondary: Vec::new(),
            allocated: 0,
        })
    }

    pub fn raw(&self) -> vk::CommandPool {
        self.raw
    }

    /// Native buffers allocated from this pool, in use or free
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Buffers of `level` ready for reuse, reset or waiting to be
    pub fn free_count(&self, level: vk::CommandBufferLevel) -> usize {
        let waiting = self
            .to_reset
            .iter()
            .filter(|(_, waiting_level)| *waiting_level == level)
            .count();
        waiting
            + match level {
                vk::CommandBufferLevel::SECONDARY => self.free_secondary.len(),
                _ => self.free_primary.len(),
            }
    }

    pub fn reset_pending_count(&self) -> usize {
        self.to_reset.len()
    }

    fn free_list(&mut self, level: vk::CommandBufferLevel) -> &mut Vec<vk::CommandBuffer> {
        match level {
            vk::CommandBufferLevel::SECONDARY => &mut self.free_secondary,
            _ => &mut self.free_primary,
        }
    }

    /// Reset every recycled buffer. Must run on the thread owning the pool.
    fn reset_recycled(&mut self) -> Result<(), RhiError> {
        while let Some((raw, level)) = self.to_reset.pop() {
            if let Err(err) = self.device.backend().reset_command_buffer(raw) {
                self.to_reset.push((raw, level));
                return Err(err.into());
            }
            self.free_list(level).push(raw);
        }
        Ok(())
    }

    /// Reuse a recycled buffer of `level` or allocate a new one
    pub fn get_or_allocate(
        &mut self,
        level: vk::CommandBufferLevel,
        auto_begin: bool,
        use_for_transfer: bool,
    ) -> Result<CommandBuffer<B>, RhiError> {
        self.reset_recycled()?;
        let raw = match self.free_list(level).pop() {
            Some(raw) => raw,
            None => {
                let raw = self
                    .device
                    .backend()
                    .allocate_command_buffer(self.raw, level)?;
                self.allocated += 1;
                tracing::trace!(pool = ?self.raw, ?level, allocated = self.allocated, "Allocated command buffer");
                raw
            }
        };
        let mut command_buffer = CommandBuffer::new(
            self.device.clone(),
            raw,
            self.raw,
            self.thread,
            level,
            self.queue_type,
            self.family_index,
        );
        command_buffer.set_use_for_transfer(use_for_transfer);
        if auto_begin {
            command_buffer.begin()?;
        }
        Ok(command_buffer)
    }

    fn check_owned(&self, command_buffer: &CommandBuffer<B>) -> Result<(), RhiError> {
        if command_buffer.pool() != self.raw {
            return Err(RhiError::InvalidHandle);
        }
        if command_buffer.state() == CommandBufferState::Pending {
            return Err(RhiError::CommandBufferPending);
        }
        Ok(())
    }

    /// Keep `command_buffer` for reuse. Safe to call from any thread holding the pool, the
    /// native buffer is reset by the owning thread before it is handed out again.
    ///
    /// A pending buffer is refused. Its native buffer stays allocated until the pool is destroyed.
    pub fn recycle(&mut self, mut command_buffer: CommandBuffer<B>) -> Result<(), RhiError> {
        self.check_owned(&command_buffer)?;
        command_buffer.retire()?;
        self.to_reset
            .push((command_buffer.raw(), command_buffer.level()));
        Ok(())
    }

    /// Give the native buffer back to the pool
    pub fn free(&mut self, command_buffer: CommandBuffer<B>) -> Result<(), RhiError> {
        self.check_owned(&command_buffer)?;
        self.device
            .backend()
            .free_command_buffer(self.raw, command_buffer.raw());
        self.allocated -= 1;
        Ok(())
    }
}

impl<B: Backend> Destructible for CommandPool<B> {
    fn destroy(&mut self) {
        #[cfg(feature = "log-lifetimes")]
        trace!("Destroying VkCommandPool {:?}", self.raw);

        // frees every buffer allocated from the pool
        self.device.backend().destroy_command_pool(self.raw);
        self.to_reset.clear();
        self.free_primary.clear();
        self.free_secondary.clear();
    }
}

#[cfg(feature = "raii")]
impl<B: Backend> Drop for CommandPool<B> {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use crate::settings::RhiSettings;

    fn pool() -> CommandPool<HeadlessBackend> {
        let device = LogicalDevice::new(HeadlessBackend::new("test"), RhiSettings::default());
        CommandPool::new(device, 0, QueueType::Graphics, std::thread::current().id()).unwrap()
    }

    #[test]
    fn recycled_buffers_are_reused_per_level() {
        let mut pool = pool();
        let primary = pool
            .get_or_allocate(vk::CommandBufferLevel::PRIMARY, true, false)
            .unwrap();
        assert_eq!(primary.state(), CommandBufferState::Recording);
        let raw = primary.raw();
        pool.recycle(primary).unwrap();
        assert_eq!(pool.free_count(vk::CommandBufferLevel::PRIMARY), 1);
        assert_eq!(pool.reset_pending_count(), 1);

        let secondary = pool
            .get_or_allocate(vk::CommandBufferLevel::SECONDARY, false, false)
            .unwrap();
        assert_ne!(secondary.raw(), raw);
        assert_eq!(secondary.state(), CommandBufferState::Initial);

        let again = pool
            .get_or_allocate(vk::CommandBufferLevel::PRIMARY, false, true)
            .unwrap();
        assert_eq!(again.raw(), raw);
        assert!(again.use_for_transfer());
        assert_eq!(again.state(), CommandBufferState::Initial);
        assert_eq!(pool.allocated(), 2);
        assert_eq!(pool.reset_pending_count(), 0);
    }

    #[test]
    fn native_reset_waits_for_next_allocation() {
        let mut pool = pool();
        let mut command_buffer = pool
            .get_or_allocate(vk::CommandBufferLevel::PRIMARY, true, false)
            .unwrap();
        command_buffer.dispatch(1, 1, 1).unwrap();
        command_buffer.end().unwrap();
        let raw = command_buffer.raw();
        pool.recycle(command_buffer).unwrap();
        assert_eq!(pool.device.backend().recorded_commands(raw).len(), 1);

        let reused = pool
            .get_or_allocate(vk::CommandBufferLevel::PRIMARY, false, false)
            .unwrap();
        assert_eq!(reused.raw(), raw);
        assert!(pool.device.backend().recorded_commands(raw).is_empty());
    }

    #[test]
    fn foreign_buffer_is_rejected() {
        let mut first = pool();
        let mut second = pool();
        let command_buffer = first
            .get_or_allocate(vk::CommandBufferLevel::PRIMARY, false, false)
            .unwrap();
        assert_eq!(second.free(command_buffer), Err(RhiError::InvalidHandle));
    }

    #[test]
    fn free_releases_native_buffer() {
        let mut pool = pool();
        let command_buffer = pool
            .get_or_allocate(vk::CommandBufferLevel::PRIMARY, true, false)
            .unwrap();
        pool.free(command_buffer).unwrap();
        assert_eq!(pool.allocated(), 0);
        assert_eq!(pool.free_count(vk::CommandBufferLevel::PRIMARY), 0);
    }
}
