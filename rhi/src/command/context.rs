use std::sync::Arc;

use ash::vk;
use derivative::Derivative;

use crate::backend::Backend;
use crate::command::CommandBuffer;
use crate::queue::{Queue, QueueType};
use crate::RhiError;

/// Records into at most one open command buffer for a queue.
///
/// The device keeps one immediate context per queue type and a pool of deferred contexts for
/// worker threads.
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct CommandContext<B: Backend> {
    queue: Arc<Queue<B>>,
    current: Option<CommandBuffer<B>>,
}

impl<B: Backend> CommandContext<B> {
    pub fn new(queue: Arc<Queue<B>>) -> Self {
        Self {
            queue,
            current: None,
        }
    }

    pub fn queue(&self) -> &Arc<Queue<B>> {
        &self.queue
    }

    pub fn queue_type(&self) -> QueueType {
        self.queue.queue_type()
    }

    pub fn is_recording(&self) -> bool {
        self.current.is_some()
    }

    /// The open command buffer, allocated and begun on first use
    pub fn command_buffer(&mut self) -> Result<&mut CommandBuffer<B>, RhiError> {
        let command_buffer = match self.current.take() {
            Some(command_buffer) => command_buffer,
            None => self
                .queue
                .command_buffer(vk::CommandBufferLevel::PRIMARY, true, false)?,
        };
        Ok(self.current.insert(command_buffer))
    }

    /// Hand the open command buffer to the caller, leaving the context empty
    pub fn take(&mut self) -> Option<CommandBuffer<B>> {
        self.current.take()
    }

    /// Submit the open command buffer. Returns its serial, `None` if nothing was recorded.
    pub fn flush(&mut self) -> Result<Option<u64>, RhiError> {
        match self.current.take() {
            Some(command_buffer) => self.queue.submit(vec![command_buffer]).map(Some),
            None => Ok(None),
        }
    }

    /// Submit the open command buffer and block until the GPU has executed it
    pub fn flush_and_wait(&mut self) -> Result<Option<u64>, RhiError> {
        let Some(mut command_buffer) = self.current.take() else {
            return Ok(None);
        };
        command_buffer.set_use_for_transfer(true);
        let serial = self.queue.submit(vec![command_buffer])?;
        self.queue.sync()?;
        Ok(Some(serial))
    }
}
