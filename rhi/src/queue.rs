//! Queue wrapper and submission manager.

use std::collections::HashMap;
use std::sync::Mutex;
use std::thread::ThreadId;

use ash::vk;
use derivative::Derivative;

use crate::backend::{Backend, SemaphoreKind, SemaphoreSignal, SemaphoreWait, SubmitDesc};
use crate::command::command_buffer::Completion;
use crate::command::{CommandBuffer, CommandBufferState, CommandPool};
use crate::device::LogicalDevice;
use crate::settings::SyncType;
use crate::RhiError;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum QueueType {
    Graphics,
    Compute,
    Transfer,
}

impl QueueType {
    pub const ALL: [QueueType; 3] = [QueueType::Graphics, QueueType::Compute, QueueType::Transfer];
}

#[derive(Debug)]
struct SubmissionState {
    raw: vk::Queue,
    /// Per queue timeline semaphore and the last value signaled on it, in semaphore sync mode
    timeline: Option<(vk::Semaphore, u64)>,
}

#[derive(Debug, Default)]
struct PendingSemaphores {
    waits: Vec<SemaphoreWait>,
    signals: Vec<SemaphoreSignal>,
}

/// One hardware submission channel.
///
/// Owns a command pool per recording thread and the list of in-flight command buffers, which
/// [`Queue::sync`] hands back to their pools once the GPU is done with them.
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct Queue<B: Backend> {
    device: LogicalDevice<B>,
    queue_type: QueueType,
    family_index: u32,
    submission: Mutex<SubmissionState>,
    pools: Mutex<HashMap<ThreadId, CommandPool<B>>>,
    semaphores: Mutex<PendingSemaphores>,
    queued: Mutex<Vec<CommandBuffer<B>>>,
    in_flight: Mutex<Vec<CommandBuffer<B>>>,
}

impl<B: Backend> Queue<B> {
    pub fn new(
        device: LogicalDevice<B>,
        queue_type: QueueType,
        family_index: u32,
    ) -> Result<Self, RhiError> {
        let raw = device.backend().get_queue(family_index);
        let timeline = match device.settings().sync_type {
            SyncType::Semaphore => {
                let semaphore = device
                    .backend()
                    .create_semaphore(SemaphoreKind::Timeline { initial_value: 0 })?;
                Some((semaphore, 0))
            }
            SyncType::Fence | SyncType::ForceWaitQueueIdle => None,
        };
        tracing::debug!(?queue_type, family_index, ?raw, "Created queue");
        Ok(Self {
            device,
            queue_type,
            family_index,
            submission: Mutex::new(SubmissionState { raw, timeline }),
            pools: Mutex::new(HashMap::new()),
            semaphores: Mutex::new(PendingSemaphores::default()),
            queued: Mutex::new(Vec::new()),
            in_flight: Mutex::new(Vec::new()),
        })
    }

    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    pub fn family_index(&self) -> u32 {
        self.family_index
    }

    pub fn raw(&self) -> Result<vk::Queue, RhiError> {
        Ok(self.submission.lock()?.raw)
    }

    /// Get a command buffer from the calling thread's pool, creating the pool on first use
    pub fn command_buffer(
        &self,
        level: vk::CommandBufferLevel,
        auto_begin: bool,
        use_for_transfer: bool,
    ) -> Result<CommandBuffer<B>, RhiError> {
        let thread = std::thread::current().id();
        let mut pools = self.pools.lock()?;
        let pool = match pools.entry(thread) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                tracing::debug!(queue_type = ?self.queue_type, ?thread, "Creating command pool");
                entry.insert(CommandPool::new(
                    self.device.clone(),
                    self.family_index,
                    self.queue_type,
                    thread,
                )?)
            }
        };
        pool.get_or_allocate(level, auto_begin, use_for_transfer)
    }

    /// Make the next submission wait on `wait`
    pub fn add_wait_semaphore(&self, wait: SemaphoreWait) -> Result<(), RhiError> {
        self.semaphores.lock()?.waits.push(wait);
        Ok(())
    }

    /// Make the next submission signal `signal`
    pub fn add_signal_semaphore(&self, signal: SemaphoreSignal) -> Result<(), RhiError> {
        self.semaphores.lock()?.signals.push(signal);
        Ok(())
    }

    /// Submit `command_buffers` as one batch and return the serial of the submission.
    ///
    /// Buffers still recording are ended first. Every buffer must otherwise be `Executable`.
    /// If the batch is rejected the buffers go back to their pools and the queue keeps its
    /// pending semaphores for the next submission.
    pub fn submit(&self, mut command_buffers: Vec<CommandBuffer<B>>) -> Result<u64, RhiError> {
        if let Err(err) = Self::prepare(&mut command_buffers) {
            self.reclaim(command_buffers);
            return Err(err);
        }
        let pending = match self.semaphores.lock() {
            Ok(mut semaphores) => std::mem::take(&mut *semaphores),
            Err(err) => {
                self.reclaim(command_buffers);
                return Err(err.into());
            }
        };

        match self.submit_batch(&mut command_buffers, &pending) {
            Ok(serial) => {
                if self.device.settings().sync_type == SyncType::ForceWaitQueueIdle {
                    self.device.backend().queue_wait_idle(self.raw()?)?;
                    self.sync()?;
                }
                Ok(serial)
            }
            Err(err) => {
                tracing::warn!(?err, queue_type = ?self.queue_type, "Submission rejected");
                self.restore_semaphores(pending);
                self.reclaim(command_buffers);
                Err(err)
            }
        }
    }

    fn prepare(command_buffers: &mut [CommandBuffer<B>]) -> Result<(), RhiError> {
        if let Some(invalid) = command_buffers.iter().find(|cb| {
            !matches!(
                cb.state(),
                CommandBufferState::Recording | CommandBufferState::Executable
            )
        }) {
            return Err(RhiError::InvalidCommandBufferState {
                expected: CommandBufferState::Executable,
                found: invalid.state(),
            });
        }
        for command_buffer in command_buffers.iter_mut() {
            if command_buffer.state() == CommandBufferState::Recording {
                command_buffer.end()?;
            }
        }
        Ok(())
    }

    /// Hand the batch to the GPU. On success every buffer has moved into the in-flight list,
    /// on failure they are all left in `command_buffers`.
    fn submit_batch(
        &self,
        command_buffers: &mut Vec<CommandBuffer<B>>,
        pending: &PendingSemaphores,
    ) -> Result<u64, RhiError> {
        let raw_buffers: Vec<vk::CommandBuffer> =
            command_buffers.iter().map(CommandBuffer::raw).collect();
        let mut waits = pending.waits.clone();
        let mut signals = pending.signals.clone();
        for command_buffer in command_buffers.iter() {
            waits.extend_from_slice(command_buffer.wait_semaphores());
        }

        let backend = self.device.backend();
        let sync_type = self.device.settings().sync_type;
        let mut submission = self.submission.lock()?;
        // the serial becomes visible in the in-flight list atomically with its reservation
        let mut in_flight = self.in_flight.lock()?;
        let serial = self.device.next_serial();
        let (fence, completion) = match sync_type {
            SyncType::Fence => {
                let fence = self.device.acquire_fence()?;
                (fence.raw(), Completion::Fence(fence))
            }
            SyncType::Semaphore => {
                let (semaphore, value) = submission.timeline.as_mut().ok_or(RhiError::NotTimeline)?;
                *value += 1;
                signals.push(SemaphoreSignal {
                    semaphore: *semaphore,
                    value: *value,
                });
                (
                    vk::Fence::null(),
                    Completion::Timeline {
                        semaphore: *semaphore,
                        value: *value,
                    },
                )
            }
            SyncType::ForceWaitQueueIdle => (vk::Fence::null(), Completion::Complete),
        };

        let submitted = backend.queue_submit(
            submission.raw,
            &SubmitDesc {
                command_buffers: &raw_buffers,
                wait_semaphores: &waits,
                signal_semaphores: &signals,
                fence,
            },
        );
        if let Err(err) = submitted {
            // nothing will ever signal the reserved timeline value
            if let Some((_, value)) = submission.timeline.as_mut() {
                if sync_type == SyncType::Semaphore {
                    *value -= 1;
                }
            }
            return Err(err.into());
        }
        tracing::trace!(
            queue_type = ?self.queue_type,
            serial,
            command_buffers = raw_buffers.len(),
            waits = waits.len(),
            signals = signals.len(),
            "Submitted"
        );

        for mut command_buffer in command_buffers.drain(..) {
            if let Err(err) = command_buffer.release_resources(Some(serial)) {
                tracing::error!(?err, serial, "Failed to release tracked resources");
            }
            command_buffer.mark_pending(completion.clone(), serial);
            in_flight.push(command_buffer);
        }
        Ok(serial)
    }

    /// Put back the semaphores taken for a submission that never happened, ahead of any added
    /// since
    fn restore_semaphores(&self, pending: PendingSemaphores) {
        match self.semaphores.lock() {
            Ok(mut semaphores) => {
                semaphores.waits.splice(0..0, pending.waits);
                semaphores.signals.splice(0..0, pending.signals);
            }
            Err(_) => tracing::error!("Pending semaphores poisoned, dropping restored semaphores"),
        }
    }

    /// Give back buffers a failed submission did not consume
    fn reclaim(&self, command_buffers: Vec<CommandBuffer<B>>) {
        for command_buffer in command_buffers {
            let result = if command_buffer.state() == CommandBufferState::Pending {
                // submitted earlier, still owned by the GPU
                self.in_flight
                    .lock()
                    .map(|mut in_flight| in_flight.push(command_buffer))
                    .map_err(RhiError::from)
            } else {
                self.discard(command_buffer)
            };
            if let Err(err) = result {
                tracing::error!(?err, queue_type = ?self.queue_type, "Failed to reclaim command buffer");
            }
        }
    }

    /// Hold `command_buffer` back for the next [`Queue::submit_queued_command_buffers`]
    pub fn queue_submit(&self, command_buffer: CommandBuffer<B>) -> Result<(), RhiError> {
        self.queued.lock()?.push(command_buffer);
        Ok(())
    }

    /// Submit everything queued so far as a single batch
    pub fn submit_queued_command_buffers(&self) -> Result<Option<u64>, RhiError> {
        let queued = std::mem::take(&mut *self.queued.lock()?);
        if queued.is_empty() {
            return Ok(None);
        }
        self.submit(queued).map(Some)
    }

    /// Recycle every in-flight buffer the GPU is done with.
    ///
    /// Buffers marked `use_for_transfer` are waited on, the rest are only polled. Returns how
    /// many buffers went back to their pools.
    pub fn sync(&self) -> Result<usize, RhiError> {
        let mut finished = Vec::new();
        let mut result = Ok(());
        {
            let mut in_flight = self.in_flight.lock()?;
            let mut remaining = Vec::with_capacity(in_flight.len());
            for mut command_buffer in in_flight.drain(..) {
                if result.is_err() {
                    remaining.push(command_buffer);
                    continue;
                }
                let state = if command_buffer.use_for_transfer() {
                    command_buffer.wait()
                } else {
                    command_buffer.refresh_status()
                };
                match state {
                    Ok(CommandBufferState::Pending) => remaining.push(command_buffer),
                    Ok(_) => finished.push(command_buffer),
                    Err(err) => {
                        result = Err(err);
                        remaining.push(command_buffer);
                    }
                }
            }
            *in_flight = remaining;
        }
        result?;

        let recycled = finished.len();
        if recycled > 0 {
            let mut pools = self.pools.lock()?;
            for command_buffer in finished {
                Self::recycle_into(&mut pools, command_buffer)?;
            }
        }
        Ok(recycled)
    }

    /// Hand `command_buffer` and the secondaries it executed back to their pools
    fn recycle_into(
        pools: &mut HashMap<ThreadId, CommandPool<B>>,
        mut command_buffer: CommandBuffer<B>,
    ) -> Result<(), RhiError> {
        for secondary in command_buffer.take_secondaries() {
            Self::recycle_into(pools, secondary)?;
        }
        pools
            .get_mut(&command_buffer.owner_thread())
            .ok_or(RhiError::InvalidHandle)?
            .recycle(command_buffer)
    }

    /// Return a command buffer that will not be submitted to its pool
    pub fn discard(&self, command_buffer: CommandBuffer<B>) -> Result<(), RhiError> {
        let mut pools = self.pools.lock()?;
        Self::recycle_into(&mut pools, command_buffer)
    }

    /// Block until the queue has no outstanding work, then recycle everything
    pub fn wait_idle(&self) -> Result<(), RhiError> {
        {
            let submission = self.submission.lock()?;
            self.device.backend().queue_wait_idle(submission.raw)?;
        }
        self.sync()?;
        Ok(())
    }

    /// Highest serial known to be complete on this queue, `None` if nothing is in flight
    pub fn completed_watermark(&self) -> Result<Option<u64>, RhiError> {
        Ok(self
            .in_flight
            .lock()?
            .iter()
            .map(CommandBuffer::serial)
            .min()
            .map(|oldest| oldest - 1))
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().map(|in_flight| in_flight.len()).unwrap_or(0)
    }

    pub fn queued_count(&self) -> usize {
        self.queued.lock().map(|queued| queued.len()).unwrap_or(0)
    }
}

impl<B: Backend> Drop for Queue<B> {
    fn drop(&mut self) {
        if let Err(err) = self.wait_idle() {
            tracing::error!(?err, queue_type = ?self.queue_type, "Failed to drain queue");
        }
        // dropping the buffers returns their fences to the cache
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.clear();
        }
        if let Ok(mut queued) = self.queued.lock() {
            queued.clear();
        }
        if let Ok(submission) = self.submission.lock() {
            if let Some((semaphore, _)) = submission.timeline {
                self.device.backend().destroy_semaphore(semaphore);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use crate::resource::{ImageDesc, ImageRecord, Ownership};
    use crate::resource_state::ResourceState;
    use crate::settings::RhiSettings;
    use crate::sync::Semaphore;
    use ash::vk::Handle;

    fn queue(sync_type: SyncType) -> Queue<HeadlessBackend> {
        let device = LogicalDevice::new(
            HeadlessBackend::new("test"),
            RhiSettings {
                sync_type,
                ..Default::default()
            },
        );
        Queue::new(device, QueueType::Graphics, 0).unwrap()
    }

    fn primary(queue: &Queue<HeadlessBackend>) -> CommandBuffer<HeadlessBackend> {
        queue
            .command_buffer(vk::CommandBufferLevel::PRIMARY, true, false)
            .unwrap()
    }

    #[test]
    fn empty_buffer_is_submittable() {
        let queue = queue(SyncType::Fence);
        let mut cb = primary(&queue);
        cb.end().unwrap();
        assert_eq!(cb.state(), CommandBufferState::Executable);
        let serial = queue.submit(vec![cb]).unwrap();
        assert_eq!(serial, 1);
        assert_eq!(queue.in_flight_count(), 1);
        assert_eq!(queue.completed_watermark().unwrap(), Some(0));
    }

    #[test]
    fn submit_ends_recording_buffers() {
        let queue = queue(SyncType::Fence);
        let cb = primary(&queue);
        let raw = cb.raw();
        queue.submit(vec![cb]).unwrap();
        let submissions = queue.device.backend().submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].command_buffers, vec![raw]);
        assert_ne!(submissions[0].fence, vk::Fence::null());
    }

    #[test]
    fn initial_buffer_is_not_submittable() {
        let queue = queue(SyncType::Fence);
        let cb = queue
            .command_buffer(vk::CommandBufferLevel::PRIMARY, false, false)
            .unwrap();
        assert_eq!(
            queue.submit(vec![cb]),
            Err(RhiError::InvalidCommandBufferState {
                expected: CommandBufferState::Executable,
                found: CommandBufferState::Initial,
            })
        );
        assert!(queue.device.backend().submissions().is_empty());
    }

    #[test]
    fn sync_polls_until_gpu_completes() {
        let queue = queue(SyncType::Fence);
        queue.submit(vec![primary(&queue)]).unwrap();
        assert_eq!(queue.sync().unwrap(), 0);
        assert_eq!(queue.in_flight_count(), 1);

        queue.device.backend().complete_pending();
        assert_eq!(queue.sync().unwrap(), 1);
        assert_eq!(queue.in_flight_count(), 0);
        assert_eq!(queue.completed_watermark().unwrap(), None);
        // the fence went back to the cache and the buffer to its pool
        assert_eq!(queue.device.fence_cache().len(), 1);
        let reused = primary(&queue);
        assert_eq!(reused.state(), CommandBufferState::Recording);
        assert_eq!(queue.device.backend().live_fences(), 1);
    }

    #[test]
    fn transfer_buffers_are_waited_on() {
        let queue = queue(SyncType::Fence);
        let cb = queue
            .command_buffer(vk::CommandBufferLevel::PRIMARY, true, true)
            .unwrap();
        queue.submit(vec![cb]).unwrap();
        assert_eq!(queue.sync().unwrap(), 1);
        assert_eq!(queue.device.backend().pending_submissions(), 0);
    }

    #[test]
    fn wait_idle_leaves_final_states() {
        for sync_type in [
            SyncType::Fence,
            SyncType::Semaphore,
            SyncType::ForceWaitQueueIdle,
        ] {
            let queue = queue(sync_type);
            let image = queue
                .device
                .resources()
                .unwrap()
                .insert_image(ImageRecord::new(
                    vk::Image::from_raw(0x77),
                    None,
                    ImageDesc::default(),
                    Ownership::External,
                ));
            let targets = [
                ResourceState::RENDER_TARGET,
                ResourceState::SHADER_RESOURCE,
                ResourceState::PRESENT,
            ];
            let mut command_buffers = Vec::new();
            for target in targets {
                let mut cb = primary(&queue);
                cb.transition_image(image, target).unwrap();
                command_buffers.push(cb);
            }
            for cb in command_buffers {
                queue.submit(vec![cb]).unwrap();
            }
            queue.wait_idle().unwrap();

            assert_eq!(queue.in_flight_count(), 0, "{sync_type:?}");
            let backend = queue.device.backend();
            assert_eq!(backend.pending_submissions(), 0);
            for submission in backend.submissions() {
                if submission.fence != vk::Fence::null() {
                    assert!(backend.fence_status(submission.fence).unwrap());
                }
            }
            let resources = queue.device.resources().unwrap();
            let record = resources.image(image).unwrap();
            assert_eq!(record.current_state(), ResourceState::PRESENT);
            assert_eq!(record.layout(), vk::ImageLayout::PRESENT_SRC_KHR);
        }
    }

    #[test]
    fn semaphore_mode_signals_timeline() {
        let queue = queue(SyncType::Semaphore);
        queue.submit(vec![primary(&queue)]).unwrap();
        queue.submit(vec![primary(&queue)]).unwrap();
        let submissions = queue.device.backend().submissions();
        assert_eq!(submissions[0].fence, vk::Fence::null());
        assert_eq!(submissions[0].signal_semaphores.len(), 1);
        let timeline = submissions[0].signal_semaphores[0];
        assert_eq!(queue.device.backend().semaphore_value(timeline).unwrap(), 0);

        queue.device.backend().complete_next();
        assert_eq!(queue.sync().unwrap(), 1);
        assert_eq!(queue.device.backend().semaphore_value(timeline).unwrap(), 1);
        assert_eq!(queue.completed_watermark().unwrap(), Some(1));
    }

    #[test]
    fn force_wait_recycles_immediately() {
        let queue = queue(SyncType::ForceWaitQueueIdle);
        queue.submit(vec![primary(&queue)]).unwrap();
        assert_eq!(queue.in_flight_count(), 0);
        assert_eq!(queue.device.backend().pending_submissions(), 0);
    }

    #[test]
    fn pending_semaphores_feed_next_submission_only() {
        let queue = queue(SyncType::Fence);
        let acquire = Semaphore::new(queue.device.clone(), SemaphoreKind::Binary).unwrap();
        let render_done = Semaphore::new(queue.device.clone(), SemaphoreKind::Binary).unwrap();
        let uploaded = Semaphore::new(queue.device.clone(), SemaphoreKind::Binary).unwrap();
        queue
            .add_wait_semaphore(acquire.wait_info(0, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT))
            .unwrap();
        queue
            .add_signal_semaphore(render_done.signal_info(0))
            .unwrap();
        let mut cb = primary(&queue);
        cb.add_wait_semaphore(uploaded.wait_info(0, vk::PipelineStageFlags::TRANSFER));
        queue.submit(vec![cb]).unwrap();
        queue.submit(vec![primary(&queue)]).unwrap();

        let submissions = queue.device.backend().submissions();
        assert_eq!(
            submissions[0].wait_semaphores,
            vec![acquire.raw(), uploaded.raw()]
        );
        assert_eq!(submissions[0].signal_semaphores, vec![render_done.raw()]);
        // without an explicit wait the second submission is not ordered after the first
        assert!(submissions[1].wait_semaphores.is_empty());
        assert!(submissions[1].signal_semaphores.is_empty());
    }

    #[test]
    fn queued_buffers_submit_as_one_batch() {
        let queue = queue(SyncType::Fence);
        assert_eq!(queue.submit_queued_command_buffers().unwrap(), None);
        queue.queue_submit(primary(&queue)).unwrap();
        queue.queue_submit(primary(&queue)).unwrap();
        assert_eq!(queue.queued_count(), 2);
        assert_eq!(queue.submit_queued_command_buffers().unwrap(), Some(1));
        assert_eq!(queue.queued_count(), 0);
        let submissions = queue.device.backend().submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].command_buffers.len(), 2);
    }

    #[test]
    fn pending_buffer_cannot_be_recycled() {
        let queue = queue(SyncType::Fence);
        let mut cb = primary(&queue);
        cb.end().unwrap();
        cb.mark_pending(Completion::Complete, 1);
        let mut pools = queue.pools.lock().unwrap();
        let pool = pools.get_mut(&std::thread::current().id()).unwrap();
        assert_eq!(pool.recycle(cb), Err(RhiError::CommandBufferPending));
    }

    #[test]
    fn rejected_batch_returns_buffers_to_pool() {
        let queue = queue(SyncType::Fence);
        let recording = primary(&queue);
        let initial = queue
            .command_buffer(vk::CommandBufferLevel::PRIMARY, false, false)
            .unwrap();
        assert!(queue.submit(vec![recording, initial]).is_err());
        assert_eq!(queue.in_flight_count(), 0);

        let pools = queue.pools.lock().unwrap();
        let pool = pools.get(&std::thread::current().id()).unwrap();
        assert_eq!(pool.allocated(), 2);
        assert_eq!(pool.free_count(vk::CommandBufferLevel::PRIMARY), 2);
    }

    #[test]
    fn failed_submit_keeps_pending_semaphores() {
        let queue = queue(SyncType::Semaphore);
        let acquire = Semaphore::new(queue.device.clone(), SemaphoreKind::Binary).unwrap();
        queue
            .add_wait_semaphore(acquire.wait_info(0, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT))
            .unwrap();
        let image = queue
            .device
            .resources()
            .unwrap()
            .insert_image(ImageRecord::new(
                vk::Image::from_raw(0x78),
                None,
                ImageDesc::default(),
                Ownership::External,
            ));
        let mut cb = primary(&queue);
        cb.transition_image(image, ResourceState::SHADER_RESOURCE)
            .unwrap();

        queue.device.backend().fail_next_submit();
        assert_eq!(
            queue.submit(vec![cb]),
            Err(RhiError::VkError(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY))
        );
        assert_eq!(queue.in_flight_count(), 0);
        assert!(queue.device.backend().submissions().is_empty());
        // the rejected buffer no longer holds the image
        let key = crate::resource::ResourceKey::Image(image);
        assert!(queue.device.resources().unwrap().is_idle(key, 0));

        queue.submit(vec![primary(&queue)]).unwrap();
        let submissions = queue.device.backend().submissions();
        assert_eq!(submissions[0].wait_semaphores, vec![acquire.raw()]);
        // the timeline value reserved by the failed attempt is reused
        let timeline = submissions[0].signal_semaphores[0];
        queue.device.backend().complete_pending();
        assert_eq!(queue.sync().unwrap(), 1);
        assert_eq!(queue.device.backend().semaphore_value(timeline).unwrap(), 1);
    }

    #[test]
    fn sync_from_another_thread_leaves_reset_to_owner() {
        let queue = std::sync::Arc::new(queue(SyncType::Fence));
        let mut cb = primary(&queue);
        cb.dispatch(1, 1, 1).unwrap();
        let raw = cb.raw();
        queue.submit(vec![cb]).unwrap();
        queue.device.backend().complete_pending();

        let worker = queue.clone();
        let recycled = std::thread::spawn(move || worker.sync().unwrap())
            .join()
            .unwrap();
        assert_eq!(recycled, 1);
        // still holds what was recorded, the owning thread resets it
        assert_eq!(queue.device.backend().recorded_commands(raw).len(), 1);

        let reused = queue
            .command_buffer(vk::CommandBufferLevel::PRIMARY, false, false)
            .unwrap();
        assert_eq!(reused.raw(), raw);
        assert!(queue.device.backend().recorded_commands(raw).is_empty());
    }

    #[test]
    fn finished_buffers_are_invalid_until_recycled() {
        let queue = queue(SyncType::Fence);
        let cb = primary(&queue);
        queue.submit(vec![cb]).unwrap();
        queue.device.backend().complete_pending();
        let mut in_flight = queue.in_flight.lock().unwrap();
        assert_eq!(
            in_flight[0].refresh_status().unwrap(),
            CommandBufferState::Invalid
        );
    }

    #[test]
    fn executed_secondaries_are_recycled_with_primary() {
        let queue = queue(SyncType::Fence);
        let mut secondary = queue
            .command_buffer(vk::CommandBufferLevel::SECONDARY, true, false)
            .unwrap();
        secondary.dispatch(1, 1, 1).unwrap();
        let secondary_raw = secondary.raw();
        let mut cb = primary(&queue);
        cb.execute_commands(vec![secondary]).unwrap();
        queue.submit(vec![cb]).unwrap();
        queue.device.backend().complete_pending();
        assert_eq!(queue.sync().unwrap(), 1);

        let reused = queue
            .command_buffer(vk::CommandBufferLevel::SECONDARY, false, false)
            .unwrap();
        assert_eq!(reused.raw(), secondary_raw);
        assert_eq!(reused.state(), CommandBufferState::Initial);
    }
}
