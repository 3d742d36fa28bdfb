//! Command buffer recording with an explicit lifecycle.
//!
//! ```text
//! Initial -> Recording -> Executable -> Pending -> Invalid
//!    ^___________________ reset() __________________|
//! ```
//!
//! Buffers are recorded for one submission, a buffer the GPU finished with is `Invalid` until
//! it is reset. Every recording call checks the lifecycle state and render pass scope and
//! returns an [`RhiError`] instead of recording an invalid command. Resource transitions go
//! through the buffer's [`BarrierBatch`] and are committed either right away or at the next
//! render pass or dispatch boundary, depending on [`RhiSettings::submit_barriers_immediately`].
//!
//! Every image, buffer and descriptor pool a buffer references is tracked from the moment it is
//! recorded until the buffer is submitted or reset, so destroying it in between is deferred.
//! Resources are exclusive to one queue family at a time: using one on another family than its
//! home queue's releases it back to the home family when recording ends, and the next use on
//! the home family records the matching acquire. The two submissions must still be ordered
//! with a semaphore or a CPU wait.
//!
//! [`RhiSettings::submit_barriers_immediately`]: crate::settings::RhiSettings

use std::sync::Arc;
use std::thread::ThreadId;

use ash::vk;
use derivative::Derivative;

use crate::backend::{Backend, Command, RenderPassInheritance, SemaphoreWait};
use crate::barrier::BarrierBatch;
use crate::device::LogicalDevice;
use crate::queue::QueueType;
use crate::resource::{
    BufferHandle, BufferRecord, FamilyOwnership, ImageHandle, ImageRecord, ResourceKey,
    ResourceRegistry, TrackedResources,
};
use crate::resource_state::ResourceState;
use crate::sync::{Event, PooledFence};
use crate::RhiError;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum CommandBufferState {
    #[default]
    Initial,
    Recording,
    Executable,
    /// Submitted and not yet known to be complete
    Pending,
    /// Executed once, must be reset before it is recorded again
    Invalid,
}

/// How a submitted command buffer learns that the GPU is done with it
pub(crate) enum Completion<B: Backend> {
    Fence(Arc<PooledFence<B>>),
    Timeline { semaphore: vk::Semaphore, value: u64 },
    /// The queue was drained right after submission
    Complete,
}

impl<B: Backend> Clone for Completion<B> {
    fn clone(&self) -> Self {
        match self {
            Completion::Fence(fence) => Completion::Fence(fence.clone()),
            Completion::Timeline { semaphore, value } => Completion::Timeline {
                semaphore: *semaphore,
                value: *value,
            },
            Completion::Complete => Completion::Complete,
        }
    }
}

impl<B: Backend> std::fmt::Debug for Completion<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Completion::Fence(fence) => f.debug_tuple("Fence").field(&fence.raw()).finish(),
            Completion::Timeline { semaphore, value } => f
                .debug_struct("Timeline")
                .field("semaphore", semaphore)
                .field("value", value)
                .finish(),
            Completion::Complete => f.write_str("Complete"),
        }
    }
}

impl<B: Backend> Completion<B> {
    fn poll(&self, backend: &B, timeout: u64) -> Result<bool, RhiError> {
        match self {
            Completion::Fence(fence) => fence.wait(timeout),
            Completion::Timeline { semaphore, value } => {
                Ok(backend.wait_semaphore(*semaphore, *value, timeout)?)
            }
            Completion::Complete => Ok(true),
        }
    }
}

/// An image or buffer together with the state a command needs it in
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResourceUse {
    Image(ImageHandle, ResourceState),
    Buffer(BufferHandle, ResourceState),
}

#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct CommandBuffer<B: Backend> {
    device: LogicalDevice<B>,
    raw: vk::CommandBuffer,
    pool: vk::CommandPool,
    owner_thread: ThreadId,
    level: vk::CommandBufferLevel,
    queue_type: QueueType,
    family_index: u32,
    state: CommandBufferState,
    in_render_pass: bool,
    /// Secondary buffer begun inside a render pass of the primary executing it
    inherits_render_pass: bool,
    render_pass_contents: vk::SubpassContents,
    barriers: BarrierBatch,
    tracked: TrackedResources,
    /// Executed by this primary buffer, recycled along with it
    secondaries: Vec<CommandBuffer<B>>,
    /// Images returned to a fixed state at the end of every recording, e.g. swapchain images
    permanent_images: Vec<(ImageHandle, ResourceState)>,
    wait_semaphores: Vec<SemaphoreWait>,
    use_for_transfer: bool,
    completion: Option<Completion<B>>,
    serial: u64,
}

impl<B: Backend> CommandBuffer<B> {
    pub(crate) fn new(
        device: LogicalDevice<B>,
        raw: vk::CommandBuffer,
        pool: vk::CommandPool,
        owner_thread: ThreadId,
        level: vk::CommandBufferLevel,
        queue_type: QueueType,
        family_index: u32,
    ) -> Self {
        Self {
            device,
            raw,
            pool,
            owner_thread,
            level,
            queue_type,
            family_index,
            state: CommandBufferState::Initial,
            in_render_pass: false,
            inherits_render_pass: false,
            render_pass_contents: vk::SubpassContents::INLINE,
            barriers: BarrierBatch::new(),
            tracked: TrackedResources::default(),
            secondaries: Vec::new(),
            permanent_images: Vec::new(),
            wait_semaphores: Vec::new(),
            use_for_transfer: false,
            completion: None,
            serial: 0,
        }
    }

    pub fn raw(&self) -> vk::CommandBuffer {
        self.raw
    }

    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    pub fn level(&self) -> vk::CommandBufferLevel {
        self.level
    }

    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    pub fn family_index(&self) -> u32 {
        self.family_index
    }

    /// Resources referenced since recording began, empty once submitted
    pub fn tracked_resources(&self) -> &TrackedResources {
        &self.tracked
    }

    pub fn secondary_count(&self) -> usize {
        self.secondaries.len()
    }

    pub fn in_render_pass(&self) -> bool {
        self.in_render_pass
    }

    /// Serial of the last submission, 0 if never submitted
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn use_for_transfer(&self) -> bool {
        self.use_for_transfer
    }

    /// Make [`Queue::sync`](crate::queue::Queue::sync) block on this buffer instead of polling
    pub fn set_use_for_transfer(&mut self, use_for_transfer: bool) {
        self.use_for_transfer = use_for_transfer;
    }

    /// Barriers queued but not committed yet
    pub fn has_pending_barriers(&self) -> bool {
        !self.barriers.is_empty()
    }

    pub(crate) fn pool(&self) -> vk::CommandPool {
        self.pool
    }

    pub(crate) fn owner_thread(&self) -> ThreadId {
        self.owner_thread
    }

    pub(crate) fn wait_semaphores(&self) -> &[SemaphoreWait] {
        &self.wait_semaphores
    }

    fn expect_state(&self, expected: CommandBufferState) -> Result<(), RhiError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(RhiError::InvalidCommandBufferState {
                expected,
                found: self.state,
            })
        }
    }

    fn expect_level(&self, expected: vk::CommandBufferLevel) -> Result<(), RhiError> {
        if self.level == expected {
            Ok(())
        } else {
            Err(RhiError::InvalidCommandBufferLevel {
                expected,
                found: self.level,
            })
        }
    }

    fn expect_outside_render_pass(&self) -> Result<(), RhiError> {
        self.expect_state(CommandBufferState::Recording)?;
        if self.in_render_pass {
            return Err(RhiError::InsideRenderPass);
        }
        Ok(())
    }

    fn expect_inside_render_pass(&self) -> Result<(), RhiError> {
        self.expect_state(CommandBufferState::Recording)?;
        if !self.in_render_pass {
            return Err(RhiError::OutsideRenderPass);
        }
        Ok(())
    }

    fn expect_inline_render_pass(&self) -> Result<(), RhiError> {
        self.expect_inside_render_pass()?;
        if self.render_pass_contents != vk::SubpassContents::INLINE {
            return Err(RhiError::SubpassContents(self.render_pass_contents));
        }
        Ok(())
    }

    /// Family to acquire a resource from before this buffer may use it, `None` if it can be
    /// used as is
    fn acquire_from(&self, ownership: FamilyOwnership) -> Result<Option<u32>, RhiError> {
        let family = self.family_index;
        match ownership {
            FamilyOwnership { owner: None, .. } => Ok(None),
            FamilyOwnership {
                owner: Some(owner),
                released_to: None,
            } if owner == family => Ok(None),
            FamilyOwnership {
                owner: Some(owner),
                released_to: Some(released_to),
            } if released_to == family && owner != family => {
                if self.in_render_pass {
                    return Err(RhiError::InsideRenderPass);
                }
                Ok(Some(owner))
            }
            FamilyOwnership { owner: Some(owner), released_to } => {
                Err(RhiError::QueueFamilyOwnership {
                    owner: released_to.unwrap_or(owner),
                    requested: family,
                })
            }
        }
    }

    /// Track `image` and take ownership of it for this buffer's queue family
    fn use_image<'r>(
        &mut self,
        resources: &'r mut ResourceRegistry,
        image: ImageHandle,
    ) -> Result<&'r mut ImageRecord, RhiError> {
        resources.track_image(image, &mut self.tracked)?;
        let record = resources.image_mut(image)?;
        match self.acquire_from(record.family)? {
            Some(owner) => self.barriers.acquire_image(record, owner, self.family_index),
            None => record.family.owner = Some(self.family_index),
        }
        Ok(record)
    }

    fn use_buffer<'r>(
        &mut self,
        resources: &'r mut ResourceRegistry,
        buffer: BufferHandle,
    ) -> Result<&'r mut BufferRecord, RhiError> {
        resources.track_buffer(buffer, &mut self.tracked)?;
        let record = resources.buffer_mut(buffer)?;
        match self.acquire_from(record.family)? {
            Some(owner) => self.barriers.acquire_buffer(record, owner, self.family_index),
            None => record.family.owner = Some(self.family_index),
        }
        Ok(record)
    }

    /// Hand every resource this buffer holds back to its home queue family
    fn release_to_home_families(&mut self, resources: &mut ResourceRegistry) {
        let family = self.family_index;
        let held = FamilyOwnership {
            owner: Some(family),
            released_to: None,
        };
        let keys: Vec<ResourceKey> = self.tracked.iter().collect();
        for key in keys {
            match key {
                ResourceKey::Image(image) => {
                    // destroyed while recording
                    let Ok(record) = resources.image_mut(image) else {
                        continue;
                    };
                    let home = self.device.queue_family(record.desc.owner_queue);
                    if record.family == held && home != family {
                        self.barriers.release_image(record, family, home);
                    }
                }
                ResourceKey::Buffer(buffer) => {
                    let Ok(record) = resources.buffer_mut(buffer) else {
                        continue;
                    };
                    let home = self.device.queue_family(record.desc.owner_queue);
                    if record.family == held && home != family {
                        self.barriers.release_buffer(record, family, home);
                    }
                }
                ResourceKey::DescriptorPool(_) => {}
            }
        }
    }

    /// Stop tracking everything this buffer and its secondaries reference, stamping it with
    /// the serial it was submitted at
    pub(crate) fn release_resources(&mut self, submitted: Option<u64>) -> Result<(), RhiError> {
        for secondary in self.secondaries.iter_mut() {
            secondary.release_resources(submitted)?;
        }
        if self.tracked.is_empty() {
            return Ok(());
        }
        let mut resources = self.device.resources()?;
        let idle = resources.release(&mut self.tracked, submitted);
        let serial = submitted.unwrap_or_else(|| self.device.current_serial());
        for key in idle {
            let serial = resources
                .usage(key)
                .map_or(serial, |usage| usage.last_submission.max(serial));
            if self.device.graveyard().release(key, serial)? {
                resources.forget(key);
            }
        }
        Ok(())
    }

    fn record(&self, command: Command<'_>) {
        self.device.backend().record(self.raw, command);
    }

    /// Start recording. Buffers are recorded once and submitted once.
    pub fn begin(&mut self) -> Result<(), RhiError> {
        self.expect_state(CommandBufferState::Initial)?;
        self.device.backend().begin_command_buffer(
            self.raw,
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            None,
        )?;
        self.state = CommandBufferState::Recording;
        Ok(())
    }

    /// Start recording a secondary buffer that continues `inheritance`'s subpass.
    ///
    /// Only draws may be recorded; the primary executing it owns the render pass.
    pub fn begin_in_render_pass(
        &mut self,
        inheritance: RenderPassInheritance,
    ) -> Result<(), RhiError> {
        self.expect_level(vk::CommandBufferLevel::SECONDARY)?;
        self.expect_state(CommandBufferState::Initial)?;
        self.device.backend().begin_command_buffer(
            self.raw,
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            Some(&inheritance),
        )?;
        self.state = CommandBufferState::Recording;
        self.in_render_pass = true;
        self.inherits_render_pass = true;
        self.render_pass_contents = vk::SubpassContents::INLINE;
        Ok(())
    }

    /// Finish recording.
    ///
    /// Closes an open render pass, returns permanent images to their fixed state, releases
    /// resources borrowed from another queue family and commits every queued barrier.
    pub fn end(&mut self) -> Result<(), RhiError> {
        self.expect_state(CommandBufferState::Recording)?;
        if self.in_render_pass && !self.inherits_render_pass {
            self.end_render_pass()?;
        }
        {
            let device = self.device.clone();
            let mut resources = device.resources()?;
            for (image, state) in self.permanent_images.clone() {
                let record = self.use_image(&mut resources, image)?;
                let range = record.full_range();
                self.barriers.transition_image(record, state, range)?;
            }
            // secondaries are covered by the primary executing them
            if self.level == vk::CommandBufferLevel::PRIMARY {
                self.release_to_home_families(&mut resources);
            }
        }
        self.commit()?;
        self.device.backend().end_command_buffer(self.raw)?;
        self.state = CommandBufferState::Executable;
        Ok(())
    }

    /// Discard everything recorded and return to `Initial`. Refused while the GPU may still be
    /// executing the buffer.
    pub fn reset(&mut self) -> Result<(), RhiError> {
        if self.state == CommandBufferState::Pending {
            return Err(RhiError::CommandBufferPending);
        }
        self.device.backend().reset_command_buffer(self.raw)?;
        if !self.secondaries.is_empty() {
            tracing::debug!(
                command_buffer = ?self.raw,
                secondaries = self.secondaries.len(),
                "Dropping executed secondaries on reset"
            );
        }
        self.retire()?;
        self.secondaries.clear();
        Ok(())
    }

    /// Forget everything recorded without touching the native buffer, which the owning pool
    /// resets before handing it out again.
    pub(crate) fn retire(&mut self) -> Result<(), RhiError> {
        if self.state == CommandBufferState::Pending {
            return Err(RhiError::CommandBufferPending);
        }
        self.state = CommandBufferState::Initial;
        self.in_render_pass = false;
        self.inherits_render_pass = false;
        self.render_pass_contents = vk::SubpassContents::INLINE;
        self.barriers.clear();
        self.permanent_images.clear();
        self.wait_semaphores.clear();
        self.completion = None;
        self.release_resources(None)
    }

    pub(crate) fn take_secondaries(&mut self) -> Vec<CommandBuffer<B>> {
        std::mem::take(&mut self.secondaries)
    }

    pub(crate) fn mark_pending(&mut self, completion: Completion<B>, serial: u64) {
        for secondary in self.secondaries.iter_mut() {
            secondary.mark_pending(completion.clone(), serial);
        }
        self.state = CommandBufferState::Pending;
        self.completion = Some(completion);
        self.serial = serial;
        self.wait_semaphores.clear();
    }

    fn finish_if_complete(&mut self, timeout: u64) -> Result<CommandBufferState, RhiError> {
        if self.state != CommandBufferState::Pending {
            return Ok(self.state);
        }
        let complete = match &self.completion {
            Some(completion) => completion.poll(self.device.backend(), timeout)?,
            None => true,
        };
        if complete {
            // the fence goes back to the cache once every buffer of the submission dropped it
            self.completion = None;
            self.state = CommandBufferState::Invalid;
            for secondary in self.secondaries.iter_mut() {
                secondary.completion = None;
                secondary.state = CommandBufferState::Invalid;
            }
        }
        Ok(self.state)
    }

    /// Poll the GPU without blocking. A finished buffer becomes `Invalid`.
    pub fn refresh_status(&mut self) -> Result<CommandBufferState, RhiError> {
        self.finish_if_complete(0)
    }

    /// Block until the GPU is done with this buffer
    pub fn wait(&mut self) -> Result<CommandBufferState, RhiError> {
        self.finish_if_complete(u64::MAX)
    }

    /// Commit every queued barrier as a single pipeline barrier, with queue family ownership
    /// transfers recorded around it
    pub fn commit(&mut self) -> Result<(), RhiError> {
        self.expect_state(CommandBufferState::Recording)?;
        if self.barriers.is_empty() {
            return Ok(());
        }
        if self.in_render_pass {
            return Err(RhiError::InsideRenderPass);
        }
        for barrier in self.barriers.take_all() {
            tracing::trace!(
                command_buffer = ?self.raw,
                images = barrier.images.len(),
                buffers = barrier.buffers.len(),
                "Committing barriers"
            );
            self.record(Command::PipelineBarrier(&barrier));
        }
        Ok(())
    }

    fn commit_if_immediate(&mut self) -> Result<(), RhiError> {
        if self.device.settings().submit_barriers_immediately {
            self.commit()
        } else {
            Ok(())
        }
    }

    fn expect_transition_allowed(&self) -> Result<(), RhiError> {
        self.expect_state(CommandBufferState::Recording)?;
        // an immediate commit would land inside the render pass
        if self.in_render_pass && self.device.settings().submit_barriers_immediately {
            return Err(RhiError::InsideRenderPass);
        }
        Ok(())
    }

    /// Transition the whole image to `state`
    pub fn transition_image(
        &mut self,
        image: ImageHandle,
        state: ResourceState,
    ) -> Result<(), RhiError> {
        self.transition_image_range(image, state, None)
    }

    /// Transition `range` of the image to `state`, the whole image when `None`
    pub fn transition_image_range(
        &mut self,
        image: ImageHandle,
        state: ResourceState,
        range: Option<vk::ImageSubresourceRange>,
    ) -> Result<(), RhiError> {
        self.expect_transition_allowed()?;
        {
            let device = self.device.clone();
            let mut resources = device.resources()?;
            let record = self.use_image(&mut resources, image)?;
            let range = range.unwrap_or_else(|| record.full_range());
            self.barriers.transition_image(record, state, range)?;
        }
        self.commit_if_immediate()
    }

    pub fn transition_buffer(
        &mut self,
        buffer: BufferHandle,
        state: ResourceState,
    ) -> Result<(), RhiError> {
        self.expect_transition_allowed()?;
        {
            let device = self.device.clone();
            let mut resources = device.resources()?;
            let record = self.use_buffer(&mut resources, buffer)?;
            self.barriers.transition_buffer(record, state)?;
        }
        self.commit_if_immediate()
    }

    /// Release `image` to the queue family of `to`. The next use on that queue records the
    /// matching acquire.
    pub fn release_image(&mut self, image: ImageHandle, to: QueueType) -> Result<(), RhiError> {
        self.expect_outside_render_pass()?;
        let device = self.device.clone();
        let dst_family = device.queue_family(to);
        {
            let mut resources = device.resources()?;
            let record = self.use_image(&mut resources, image)?;
            if dst_family != self.family_index {
                self.barriers
                    .release_image(record, self.family_index, dst_family);
            }
        }
        self.commit_if_immediate()
    }

    pub fn release_buffer(&mut self, buffer: BufferHandle, to: QueueType) -> Result<(), RhiError> {
        self.expect_outside_render_pass()?;
        let device = self.device.clone();
        let dst_family = device.queue_family(to);
        {
            let mut resources = device.resources()?;
            let record = self.use_buffer(&mut resources, buffer)?;
            if dst_family != self.family_index {
                self.barriers
                    .release_buffer(record, self.family_index, dst_family);
            }
        }
        self.commit_if_immediate()
    }

    /// Order two usages of memory without any layout change, e.g. back to back unordered
    /// access dispatches on the same resource
    pub fn memory_barrier(
        &mut self,
        src: ResourceState,
        dst: ResourceState,
    ) -> Result<(), RhiError> {
        self.expect_transition_allowed()?;
        self.barriers.memory_barrier(src, dst);
        self.commit_if_immediate()
    }

    /// Transition every resource a draw or dispatch is about to touch, then commit once
    pub fn ensure_resource_states(&mut self, uses: &[ResourceUse]) -> Result<(), RhiError> {
        self.expect_outside_render_pass()?;
        {
            let device = self.device.clone();
            let mut resources = device.resources()?;
            for resource_use in uses {
                match *resource_use {
                    ResourceUse::Image(image, state) => {
                        let record = self.use_image(&mut resources, image)?;
                        let range = record.full_range();
                        self.barriers.transition_image(record, state, range)?;
                    }
                    ResourceUse::Buffer(buffer, state) => {
                        let record = self.use_buffer(&mut resources, buffer)?;
                        self.barriers.transition_buffer(record, state)?;
                    }
                }
            }
        }
        self.commit()
    }

    /// Return `image` to `state` every time recording ends
    pub fn add_permanent_image(
        &mut self,
        image: ImageHandle,
        state: ResourceState,
    ) -> Result<(), RhiError> {
        // reject stale handles up front rather than at end()
        self.device
            .resources()?
            .track_image(image, &mut self.tracked)?;
        match self
            .permanent_images
            .iter_mut()
            .find(|(existing, _)| *existing == image)
        {
            Some((_, existing_state)) => *existing_state = state,
            None => self.permanent_images.push((image, state)),
        }
        Ok(())
    }

    /// Make the submission of this buffer wait on `wait`
    pub fn add_wait_semaphore(&mut self, wait: SemaphoreWait) {
        self.wait_semaphores.push(wait);
    }

    pub fn begin_render_pass(
        &mut self,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        render_area: vk::Rect2D,
        clear_values: &[vk::ClearValue],
    ) -> Result<(), RhiError> {
        self.begin_render_pass_with_contents(
            render_pass,
            framebuffer,
            render_area,
            clear_values,
            vk::SubpassContents::INLINE,
        )
    }

    /// Begin a render pass whose subpass is recorded in secondary buffers, see
    /// [`Self::execute_commands`]
    pub fn begin_render_pass_with_secondaries(
        &mut self,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        render_area: vk::Rect2D,
        clear_values: &[vk::ClearValue],
    ) -> Result<(), RhiError> {
        self.begin_render_pass_with_contents(
            render_pass,
            framebuffer,
            render_area,
            clear_values,
            vk::SubpassContents::SECONDARY_COMMAND_BUFFERS,
        )
    }

    fn begin_render_pass_with_contents(
        &mut self,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        render_area: vk::Rect2D,
        clear_values: &[vk::ClearValue],
        contents: vk::SubpassContents,
    ) -> Result<(), RhiError> {
        self.expect_outside_render_pass()?;
        self.commit()?;
        self.record(Command::BeginRenderPass {
            render_pass,
            framebuffer,
            render_area,
            clear_values,
            contents,
        });
        self.in_render_pass = true;
        self.render_pass_contents = contents;
        Ok(())
    }

    pub fn end_render_pass(&mut self) -> Result<(), RhiError> {
        self.expect_inside_render_pass()?;
        if self.inherits_render_pass {
            return Err(RhiError::InheritedRenderPass);
        }
        self.record(Command::EndRenderPass);
        self.in_render_pass = false;
        self.render_pass_contents = vk::SubpassContents::INLINE;
        Ok(())
    }

    /// Execute secondary buffers of the same queue, ending any still recording.
    ///
    /// Inside a render pass begun with [`Self::begin_render_pass_with_secondaries`] the
    /// secondaries must have been begun with [`Self::begin_in_render_pass`], outside of one with
    /// [`Self::begin`]. The primary takes them over: they are submitted and recycled with it.
    pub fn execute_commands(
        &mut self,
        mut secondaries: Vec<CommandBuffer<B>>,
    ) -> Result<(), RhiError> {
        self.expect_level(vk::CommandBufferLevel::PRIMARY)?;
        self.expect_state(CommandBufferState::Recording)?;
        if self.in_render_pass {
            if self.render_pass_contents != vk::SubpassContents::SECONDARY_COMMAND_BUFFERS {
                return Err(RhiError::SubpassContents(self.render_pass_contents));
            }
        } else {
            self.commit()?;
        }
        for secondary in secondaries.iter_mut() {
            secondary.expect_level(vk::CommandBufferLevel::SECONDARY)?;
            if secondary.queue_type != self.queue_type {
                return Err(RhiError::InvalidHandle);
            }
            if secondary.inherits_render_pass != self.in_render_pass {
                return Err(if secondary.inherits_render_pass {
                    RhiError::OutsideRenderPass
                } else {
                    RhiError::InsideRenderPass
                });
            }
            if secondary.state == CommandBufferState::Recording {
                secondary.end()?;
            }
            secondary.expect_state(CommandBufferState::Executable)?;
        }

        let raw_buffers: Vec<vk::CommandBuffer> =
            secondaries.iter().map(CommandBuffer::raw).collect();
        {
            let mut resources = self.device.resources()?;
            for secondary in secondaries.iter() {
                for key in secondary.tracked.iter() {
                    resources.track(key, &mut self.tracked);
                }
            }
        }
        self.record(Command::ExecuteCommands(&raw_buffers));
        self.secondaries.extend(secondaries);
        Ok(())
    }

    pub fn set_graphics_pipeline(&mut self, pipeline: vk::Pipeline) -> Result<(), RhiError> {
        self.expect_state(CommandBufferState::Recording)?;
        self.record(Command::BindPipeline {
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            pipeline,
        });
        Ok(())
    }

    pub fn set_compute_pipeline(&mut self, pipeline: vk::Pipeline) -> Result<(), RhiError> {
        self.expect_state(CommandBufferState::Recording)?;
        self.record(Command::BindPipeline {
            bind_point: vk::PipelineBindPoint::COMPUTE,
            pipeline,
        });
        Ok(())
    }

    pub fn bind_descriptor_sets(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    ) -> Result<(), RhiError> {
        self.expect_state(CommandBufferState::Recording)?;
        // pools are only reset once every buffer binding their sets is done
        self.device
            .resources()?
            .track_descriptor_sets(sets, &mut self.tracked);
        self.record(Command::BindDescriptorSets {
            bind_point,
            layout,
            first_set,
            sets,
            dynamic_offsets,
        });
        Ok(())
    }

    /// Bind `(buffer, offset)` pairs starting at `first_binding`
    pub fn set_vertex_buffers(
        &mut self,
        first_binding: u32,
        buffers: &[(BufferHandle, vk::DeviceSize)],
    ) -> Result<(), RhiError> {
        self.expect_state(CommandBufferState::Recording)?;
        let (raw_buffers, offsets): (Vec<vk::Buffer>, Vec<vk::DeviceSize>) = {
            let device = self.device.clone();
            let mut resources = device.resources()?;
            buffers
                .iter()
                .map(|(buffer, offset)| {
                    Ok((self.use_buffer(&mut resources, *buffer)?.raw(), *offset))
                })
                .collect::<Result<Vec<_>, RhiError>>()?
                .into_iter()
                .unzip()
        };
        self.record(Command::BindVertexBuffers {
            first_binding,
            buffers: &raw_buffers,
            offsets: &offsets,
        });
        Ok(())
    }

    pub fn set_index_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) -> Result<(), RhiError> {
        self.expect_state(CommandBufferState::Recording)?;
        let buffer = self.buffer_raw(buffer)?;
        self.record(Command::BindIndexBuffer {
            buffer,
            offset,
            index_type,
        });
        Ok(())
    }

    pub fn set_viewports(&mut self, first: u32, viewports: &[vk::Viewport]) -> Result<(), RhiError> {
        self.expect_state(CommandBufferState::Recording)?;
        self.record(Command::SetViewports { first, viewports });
        Ok(())
    }

    pub fn set_scissors(&mut self, first: u32, scissors: &[vk::Rect2D]) -> Result<(), RhiError> {
        self.expect_state(CommandBufferState::Recording)?;
        self.record(Command::SetScissors { first, scissors });
        Ok(())
    }

    pub fn push_constants(
        &mut self,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) -> Result<(), RhiError> {
        self.expect_state(CommandBufferState::Recording)?;
        self.record(Command::PushConstants {
            layout,
            stages,
            offset,
            data,
        });
        Ok(())
    }

    /// [`Self::push_constants`] for a plain old data value
    pub fn push_constants_typed<T: bytemuck::Pod>(
        &mut self,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        value: &T,
    ) -> Result<(), RhiError> {
        self.push_constants(layout, stages, offset, bytemuck::bytes_of(value))
    }

    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> Result<(), RhiError> {
        self.expect_inline_render_pass()?;
        self.record(Command::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        });
        Ok(())
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> Result<(), RhiError> {
        self.expect_inline_render_pass()?;
        self.record(Command::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        });
        Ok(())
    }

    pub fn draw_indirect(
        &mut self,
        buffer: BufferHandle,
        offset: vk::DeviceSize,
        draw_count: u32,
        stride: u32,
    ) -> Result<(), RhiError> {
        self.expect_inline_render_pass()?;
        let buffer = self.buffer_raw(buffer)?;
        self.record(Command::DrawIndirect {
            buffer,
            offset,
            draw_count,
            stride,
        });
        Ok(())
    }

    pub fn draw_indexed_indirect(
        &mut self,
        buffer: BufferHandle,
        offset: vk::DeviceSize,
        draw_count: u32,
        stride: u32,
    ) -> Result<(), RhiError> {
        self.expect_inline_render_pass()?;
        let buffer = self.buffer_raw(buffer)?;
        self.record(Command::DrawIndexedIndirect {
            buffer,
            offset,
            draw_count,
            stride,
        });
        Ok(())
    }

    /// Commits queued barriers, then dispatches
    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<(), RhiError> {
        self.expect_outside_render_pass()?;
        self.commit()?;
        self.record(Command::Dispatch { x, y, z });
        Ok(())
    }

    pub fn dispatch_indirect(
        &mut self,
        buffer: BufferHandle,
        offset: vk::DeviceSize,
    ) -> Result<(), RhiError> {
        self.expect_outside_render_pass()?;
        let buffer = self.buffer_raw(buffer)?;
        self.commit()?;
        self.record(Command::DispatchIndirect { buffer, offset });
        Ok(())
    }

    /// Native handle of a buffer a command reads from, tracked and owned by this queue family
    fn buffer_raw(&mut self, buffer: BufferHandle) -> Result<vk::Buffer, RhiError> {
        let device = self.device.clone();
        let mut resources = device.resources()?;
        Ok(self.use_buffer(&mut resources, buffer)?.raw())
    }

    /// Move the resources to their required state, if they declare one
    fn restore_required_states(
        &mut self,
        images: &[ImageHandle],
        buffers: &[BufferHandle],
    ) -> Result<(), RhiError> {
        {
            let device = self.device.clone();
            let mut resources = device.resources()?;
            for image in images {
                let record = self.use_image(&mut resources, *image)?;
                if let Some(required) = record.required_state() {
                    let range = record.full_range();
                    self.barriers.transition_image(record, required, range)?;
                }
            }
            for buffer in buffers {
                let record = self.use_buffer(&mut resources, *buffer)?;
                if let Some(required) = record.required_state() {
                    self.barriers.transition_buffer(record, required)?;
                }
            }
        }
        self.commit_if_immediate()
    }

    pub fn copy_buffer(
        &mut self,
        src: BufferHandle,
        dst: BufferHandle,
        regions: &[vk::BufferCopy],
    ) -> Result<(), RhiError> {
        self.expect_outside_render_pass()?;
        let (src_raw, dst_raw) = {
            let device = self.device.clone();
            let mut resources = device.resources()?;
            let src_record = self.use_buffer(&mut resources, src)?;
            self.barriers
                .transition_buffer(src_record, ResourceState::TRANSFER_SRC)?;
            let src_raw = src_record.raw();
            let dst_record = self.use_buffer(&mut resources, dst)?;
            self.barriers
                .transition_buffer(dst_record, ResourceState::TRANSFER_DST)?;
            (src_raw, dst_record.raw())
        };
        self.commit()?;
        self.record(Command::CopyBuffer {
            src: src_raw,
            dst: dst_raw,
            regions,
        });
        self.restore_required_states(&[], &[src, dst])
    }

    pub fn copy_image(
        &mut self,
        src: ImageHandle,
        dst: ImageHandle,
        regions: &[vk::ImageCopy],
    ) -> Result<(), RhiError> {
        self.expect_outside_render_pass()?;
        let (src_raw, src_layout, dst_raw, dst_layout) = {
            let device = self.device.clone();
            let mut resources = device.resources()?;
            let src_record = self.use_image(&mut resources, src)?;
            let range = src_record.full_range();
            self.barriers
                .transition_image(src_record, ResourceState::TRANSFER_SRC, range)?;
            let (src_raw, src_layout) = (src_record.raw(), src_record.layout());
            let dst_record = self.use_image(&mut resources, dst)?;
            let range = dst_record.full_range();
            self.barriers
                .transition_image(dst_record, ResourceState::TRANSFER_DST, range)?;
            (src_raw, src_layout, dst_record.raw(), dst_record.layout())
        };
        self.commit()?;
        self.record(Command::CopyImage {
            src: src_raw,
            src_layout,
            dst: dst_raw,
            dst_layout,
            regions,
        });
        self.restore_required_states(&[src, dst], &[])
    }

    pub fn copy_buffer_to_image(
        &mut self,
        src: BufferHandle,
        dst: ImageHandle,
        regions: &[vk::BufferImageCopy],
    ) -> Result<(), RhiError> {
        self.expect_outside_render_pass()?;
        let (src_raw, dst_raw, dst_layout) = {
            let device = self.device.clone();
            let mut resources = device.resources()?;
            let src_record = self.use_buffer(&mut resources, src)?;
            self.barriers
                .transition_buffer(src_record, ResourceState::TRANSFER_SRC)?;
            let src_raw = src_record.raw();
            let dst_record = self.use_image(&mut resources, dst)?;
            let range = dst_record.full_range();
            self.barriers
                .transition_image(dst_record, ResourceState::TRANSFER_DST, range)?;
            (src_raw, dst_record.raw(), dst_record.layout())
        };
        self.commit()?;
        self.record(Command::CopyBufferToImage {
            src: src_raw,
            dst: dst_raw,
            dst_layout,
            regions,
        });
        self.restore_required_states(&[dst], &[src])
    }

    pub fn copy_image_to_buffer(
        &mut self,
        src: ImageHandle,
        dst: BufferHandle,
        regions: &[vk::BufferImageCopy],
    ) -> Result<(), RhiError> {
        self.expect_outside_render_pass()?;
        let (src_raw, src_layout, dst_raw) = {
            let device = self.device.clone();
            let mut resources = device.resources()?;
            let src_record = self.use_image(&mut resources, src)?;
            let range = src_record.full_range();
            self.barriers
                .transition_image(src_record, ResourceState::TRANSFER_SRC, range)?;
            let (src_raw, src_layout) = (src_record.raw(), src_record.layout());
            let dst_record = self.use_buffer(&mut resources, dst)?;
            self.barriers
                .transition_buffer(dst_record, ResourceState::TRANSFER_DST)?;
            (src_raw, src_layout, dst_record.raw())
        };
        self.commit()?;
        self.record(Command::CopyImageToBuffer {
            src: src_raw,
            src_layout,
            dst: dst_raw,
            regions,
        });
        self.restore_required_states(&[src], &[dst])
    }

    fn prepare_clear(
        &mut self,
        image: ImageHandle,
    ) -> Result<(vk::Image, vk::ImageLayout, vk::ImageSubresourceRange), RhiError> {
        self.expect_outside_render_pass()?;
        let cleared = {
            let device = self.device.clone();
            let mut resources = device.resources()?;
            let record = self.use_image(&mut resources, image)?;
            let range = record.full_range();
            self.barriers
                .transition_image(record, ResourceState::TRANSFER_DST, range)?;
            (record.raw(), record.layout(), range)
        };
        self.commit()?;
        Ok(cleared)
    }

    pub fn clear_color_image(
        &mut self,
        image: ImageHandle,
        color: vk::ClearColorValue,
    ) -> Result<(), RhiError> {
        let (raw, layout, range) = self.prepare_clear(image)?;
        self.record(Command::ClearColorImage {
            image: raw,
            layout,
            color,
            ranges: &[range],
        });
        self.restore_required_states(&[image], &[])
    }

    pub fn clear_depth_stencil_image(
        &mut self,
        image: ImageHandle,
        value: vk::ClearDepthStencilValue,
    ) -> Result<(), RhiError> {
        let (raw, layout, range) = self.prepare_clear(image)?;
        self.record(Command::ClearDepthStencilImage {
            image: raw,
            layout,
            value,
            ranges: &[range],
        });
        self.restore_required_states(&[image], &[])
    }

    pub fn set_event(
        &mut self,
        event: &Event<B>,
        stage: vk::PipelineStageFlags,
    ) -> Result<(), RhiError> {
        self.expect_outside_render_pass()?;
        self.record(Command::SetEvent {
            event: event.raw(),
            stage,
        });
        Ok(())
    }

    pub fn reset_event(
        &mut self,
        event: &Event<B>,
        stage: vk::PipelineStageFlags,
    ) -> Result<(), RhiError> {
        self.expect_outside_render_pass()?;
        self.record(Command::ResetEvent {
            event: event.raw(),
            stage,
        });
        Ok(())
    }

    pub fn wait_event(
        &mut self,
        event: &Event<B>,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    ) -> Result<(), RhiError> {
        self.expect_state(CommandBufferState::Recording)?;
        self.record(Command::WaitEvent {
            event: event.raw(),
            src_stage,
            dst_stage,
        });
        Ok(())
    }

    /// Open a labelled region. Does nothing if no marker extension is enabled.
    pub fn begin_debug_marker(&mut self, name: &str, color: [f32; 4]) -> Result<(), RhiError> {
        self.expect_state(CommandBufferState::Recording)?;
        if let Some(kind) = self.device.backend().debug_marker_kind() {
            self.record(Command::BeginDebugMarker { kind, name, color });
        }
        Ok(())
    }

    pub fn end_debug_marker(&mut self) -> Result<(), RhiError> {
        self.expect_state(CommandBufferState::Recording)?;
        if let Some(kind) = self.device.backend().debug_marker_kind() {
            self.record(Command::EndDebugMarker { kind });
        }
        Ok(())
    }
}

impl<B: Backend> Drop for CommandBuffer<B> {
    fn drop(&mut self) {
        // dropped without being submitted or recycled
        if let Err(err) = self.release_resources(None) {
            tracing::error!(?err, command_buffer = ?self.raw, "Failed to release tracked resources");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HeadlessBackend, RecordedCommand};
    use crate::resource::{BufferDesc, BufferRecord, ImageDesc, ImageRecord, Ownership};
    use crate::settings::RhiSettings;
    use ash::vk::Handle;

    struct Fixture {
        device: LogicalDevice<HeadlessBackend>,
        pool: vk::CommandPool,
    }

    impl Fixture {
        fn new(settings: RhiSettings) -> Self {
            let device = LogicalDevice::new(HeadlessBackend::new("test"), settings);
            let pool = device.backend().create_command_pool(0).unwrap();
            Self { device, pool }
        }

        fn command_buffer(&self) -> CommandBuffer<HeadlessBackend> {
            self.command_buffer_of_level(vk::CommandBufferLevel::PRIMARY)
        }

        fn command_buffer_of_level(
            &self,
            level: vk::CommandBufferLevel,
        ) -> CommandBuffer<HeadlessBackend> {
            let raw = self
                .device
                .backend()
                .allocate_command_buffer(self.pool, level)
                .unwrap();
            CommandBuffer::new(
                self.device.clone(),
                raw,
                self.pool,
                std::thread::current().id(),
                level,
                QueueType::Graphics,
                0,
            )
        }

        fn image(&self, desc: ImageDesc) -> ImageHandle {
            self.device
                .resources()
                .unwrap()
                .insert_image(ImageRecord::new(
                    vk::Image::from_raw(0xa0),
                    None,
                    desc,
                    Ownership::External,
                ))
        }

        fn buffer(&self, desc: BufferDesc) -> BufferHandle {
            self.device
                .resources()
                .unwrap()
                .insert_buffer(BufferRecord::new(
                    vk::Buffer::from_raw(0xb0),
                    None,
                    desc,
                    Ownership::External,
                ))
        }

        fn commands(&self, command_buffer: &CommandBuffer<HeadlessBackend>) -> Vec<RecordedCommand> {
            self.device.backend().recorded_commands(command_buffer.raw())
        }
    }

    fn batched() -> RhiSettings {
        RhiSettings {
            submit_barriers_immediately: false,
            ..Default::default()
        }
    }

    #[test]
    fn lifecycle_order_is_enforced() {
        let fixture = Fixture::new(RhiSettings::default());
        let mut cb = fixture.command_buffer();
        assert_eq!(
            cb.end(),
            Err(RhiError::InvalidCommandBufferState {
                expected: CommandBufferState::Recording,
                found: CommandBufferState::Initial,
            })
        );
        cb.begin().unwrap();
        assert!(cb.begin().is_err());
        cb.end().unwrap();
        assert_eq!(cb.state(), CommandBufferState::Executable);
        assert!(fixture.commands(&cb).is_empty());
        assert!(cb.dispatch(1, 1, 1).is_err());
        cb.reset().unwrap();
        assert_eq!(cb.state(), CommandBufferState::Initial);
    }

    #[test]
    fn reset_refused_while_pending() {
        let fixture = Fixture::new(RhiSettings::default());
        let mut cb = fixture.command_buffer();
        cb.begin().unwrap();
        cb.end().unwrap();
        let fence = fixture.device.acquire_fence().unwrap();
        cb.mark_pending(Completion::Fence(fence), 1);

        assert_eq!(cb.reset(), Err(RhiError::CommandBufferPending));
        // never submitted, so the fence stays unsignaled
        assert_eq!(cb.refresh_status().unwrap(), CommandBufferState::Pending);
        assert!(fixture.device.fence_cache().is_empty());
    }

    #[test]
    fn completed_buffer_can_be_reset() {
        let fixture = Fixture::new(RhiSettings::default());
        let mut cb = fixture.command_buffer();
        cb.begin().unwrap();
        cb.end().unwrap();
        cb.mark_pending(Completion::Complete, 1);
        assert_eq!(cb.refresh_status().unwrap(), CommandBufferState::Invalid);
        // recorded for one submission only
        assert!(cb.begin().is_err());
        cb.reset().unwrap();
        cb.begin().unwrap();
        assert_eq!(cb.state(), CommandBufferState::Recording);
    }

    #[test]
    fn immediate_mode_commits_every_transition() {
        let fixture = Fixture::new(RhiSettings::default());
        let image = fixture.image(ImageDesc::default());
        let mut cb = fixture.command_buffer();
        cb.begin().unwrap();
        cb.transition_image(image, ResourceState::RENDER_TARGET).unwrap();
        cb.transition_image(image, ResourceState::SHADER_RESOURCE)
            .unwrap();
        // already there
        cb.transition_image(image, ResourceState::SHADER_RESOURCE)
            .unwrap();
        let commands = fixture.commands(&cb);
        assert_eq!(commands.len(), 2);
        let second = commands[1].as_barrier().unwrap();
        assert_eq!(
            second.images[0].old_layout,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
        assert_eq!(
            second.images[0].new_layout,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
    }

    #[test]
    fn batched_mode_commits_at_dispatch() {
        let fixture = Fixture::new(batched());
        let image = fixture.image(ImageDesc::default());
        let buffer = fixture.buffer(BufferDesc::default());
        let mut cb = fixture.command_buffer();
        cb.begin().unwrap();
        cb.transition_image(image, ResourceState::UNORDERED_ACCESS)
            .unwrap();
        cb.transition_buffer(buffer, ResourceState::UNORDERED_ACCESS)
            .unwrap();
        assert!(cb.has_pending_barriers());
        assert!(fixture.commands(&cb).is_empty());
        // the record already reflects the new state
        assert_eq!(
            fixture.device.resources().unwrap().image(image).unwrap().layout(),
            vk::ImageLayout::GENERAL
        );

        cb.dispatch(8, 8, 1).unwrap();
        let names: Vec<_> = fixture.commands(&cb).iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["PipelineBarrier", "Dispatch"]);
        let barrier = fixture.commands(&cb)[0].as_barrier().cloned().unwrap();
        assert_eq!(barrier.images.len(), 1);
        assert_eq!(barrier.buffers.len(), 1);
    }

    #[test]
    fn barriers_and_render_passes_are_exclusive() {
        let fixture = Fixture::new(batched());
        let image = fixture.image(ImageDesc::default());
        let mut cb = fixture.command_buffer();
        cb.begin().unwrap();
        cb.transition_image(image, ResourceState::RENDER_TARGET).unwrap();
        cb.begin_render_pass(
            vk::RenderPass::from_raw(1),
            vk::Framebuffer::from_raw(2),
            vk::Rect2D::default(),
            &[],
        )
        .unwrap();
        assert!(!cb.has_pending_barriers());
        assert_eq!(
            cb.begin_render_pass(
                vk::RenderPass::from_raw(1),
                vk::Framebuffer::from_raw(2),
                vk::Rect2D::default(),
                &[],
            ),
            Err(RhiError::InsideRenderPass)
        );

        // batched transitions may be queued mid pass, committing them may not
        cb.transition_image(image, ResourceState::SHADER_RESOURCE)
            .unwrap();
        assert_eq!(cb.commit(), Err(RhiError::InsideRenderPass));
        assert_eq!(cb.dispatch(1, 1, 1), Err(RhiError::InsideRenderPass));
        cb.draw(3, 1, 0, 0).unwrap();
        cb.end_render_pass().unwrap();
        assert_eq!(cb.draw(3, 1, 0, 0), Err(RhiError::OutsideRenderPass));
        cb.commit().unwrap();

        let names: Vec<_> = fixture.commands(&cb).iter().map(|c| c.name()).collect();
        assert_eq!(
            names,
            vec![
                "PipelineBarrier",
                "BeginRenderPass",
                "Draw",
                "EndRenderPass",
                "PipelineBarrier"
            ]
        );
    }

    #[test]
    fn immediate_transition_inside_render_pass_is_rejected() {
        let fixture = Fixture::new(RhiSettings::default());
        let image = fixture.image(ImageDesc::default());
        let mut cb = fixture.command_buffer();
        cb.begin().unwrap();
        cb.begin_render_pass(
            vk::RenderPass::from_raw(1),
            vk::Framebuffer::from_raw(2),
            vk::Rect2D::default(),
            &[],
        )
        .unwrap();
        assert_eq!(
            cb.transition_image(image, ResourceState::RENDER_TARGET),
            Err(RhiError::InsideRenderPass)
        );
        // untouched
        assert_eq!(
            fixture.device.resources().unwrap().image(image).unwrap().current_state(),
            ResourceState::COMMON
        );
        // end() closes the pass
        cb.end().unwrap();
        assert!(!cb.in_render_pass());
        assert_eq!(fixture.commands(&cb).last().unwrap().name(), "EndRenderPass");
    }

    #[test]
    fn permanent_images_restored_at_end() {
        let fixture = Fixture::new(batched());
        let backbuffer = fixture.image(ImageDesc {
            initial_state: ResourceState::PRESENT,
            ..Default::default()
        });
        let mut cb = fixture.command_buffer();
        cb.begin().unwrap();
        cb.add_permanent_image(backbuffer, ResourceState::PRESENT)
            .unwrap();
        cb.transition_image(backbuffer, ResourceState::RENDER_TARGET)
            .unwrap();
        cb.end().unwrap();

        let resources = fixture.device.resources().unwrap();
        let record = resources.image(backbuffer).unwrap();
        assert_eq!(record.current_state(), ResourceState::PRESENT);
        assert_eq!(record.layout(), vk::ImageLayout::PRESENT_SRC_KHR);
        // both transitions land in the single barrier committed by end()
        let commands = fixture.commands(&cb);
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].as_barrier().unwrap().images.len(), 2);
    }

    #[test]
    fn upload_restores_required_state() {
        let fixture = Fixture::new(RhiSettings::default());
        let staging = fixture.buffer(BufferDesc {
            name: String::from("staging"),
            size: 64,
            host_visible: true,
            ..Default::default()
        });
        let texture = fixture.image(ImageDesc {
            name: String::from("texture"),
            required_state: Some(ResourceState::SHADER_RESOURCE),
            ..Default::default()
        });
        let mut cb = fixture.command_buffer();
        cb.begin().unwrap();
        cb.copy_buffer_to_image(staging, texture, &[vk::BufferImageCopy::default()])
            .unwrap();

        let resources = fixture.device.resources().unwrap();
        assert_eq!(
            resources.image(texture).unwrap().current_state(),
            ResourceState::SHADER_RESOURCE
        );
        // the staging buffer declares no required state and stays a transfer source
        assert_eq!(
            resources.buffer(staging).unwrap().current_state(),
            ResourceState::TRANSFER_SRC
        );
        drop(resources);
        let names: Vec<_> = fixture.commands(&cb).iter().map(|c| c.name()).collect();
        assert_eq!(
            names,
            vec!["PipelineBarrier", "CopyBufferToImage", "PipelineBarrier"]
        );
    }

    #[test]
    fn clear_records_transfer_layout() {
        let fixture = Fixture::new(RhiSettings::default());
        let image = fixture.image(ImageDesc::default());
        let mut cb = fixture.command_buffer();
        cb.begin().unwrap();
        cb.clear_color_image(image, vk::ClearColorValue::default())
            .unwrap();
        assert_eq!(
            fixture.device.resources().unwrap().image(image).unwrap().layout(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL
        );
        let names: Vec<_> = fixture.commands(&cb).iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["PipelineBarrier", "ClearColorImage"]);
    }

    #[test]
    fn ensure_resource_states_commits_once() {
        let fixture = Fixture::new(RhiSettings::default());
        let image = fixture.image(ImageDesc::default());
        let buffer = fixture.buffer(BufferDesc::default());
        let mut cb = fixture.command_buffer();
        cb.begin().unwrap();
        cb.ensure_resource_states(&[
            ResourceUse::Image(image, ResourceState::SHADER_RESOURCE),
            ResourceUse::Buffer(buffer, ResourceState::INDIRECT_ARGUMENT),
        ])
        .unwrap();
        let commands = fixture.commands(&cb);
        assert_eq!(commands.len(), 1);
        let barrier = commands[0].as_barrier().unwrap();
        assert_eq!(barrier.images.len(), 1);
        assert_eq!(barrier.buffers.len(), 1);
    }

    #[test]
    fn stale_handle_is_rejected() {
        let fixture = Fixture::new(RhiSettings::default());
        let image = fixture.image(ImageDesc::default());
        fixture.device.resources().unwrap().remove_image(image).unwrap();
        let mut cb = fixture.command_buffer();
        cb.begin().unwrap();
        assert_eq!(
            cb.transition_image(image, ResourceState::RENDER_TARGET),
            Err(RhiError::InvalidHandle)
        );
        assert_eq!(
            cb.add_permanent_image(image, ResourceState::PRESENT),
            Err(RhiError::InvalidHandle)
        );
    }

    #[test]
    fn debug_markers_follow_backend_extension() {
        let fixture = Fixture::new(RhiSettings::default());
        let mut cb = fixture.command_buffer();
        cb.begin().unwrap();
        cb.begin_debug_marker("Shadow pass", [1.0, 0.0, 0.0, 1.0])
            .unwrap();
        cb.end_debug_marker().unwrap();
        let names: Vec<_> = fixture.commands(&cb).iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["BeginDebugMarker", "EndDebugMarker"]);
    }

    #[test]
    fn referenced_resources_are_tracked_until_reset() {
        let fixture = Fixture::new(RhiSettings::default());
        let image = fixture.image(ImageDesc::default());
        let buffer = fixture.buffer(BufferDesc::default());
        let mut cb = fixture.command_buffer();
        cb.begin().unwrap();
        cb.transition_image(image, ResourceState::SHADER_RESOURCE)
            .unwrap();
        cb.dispatch_indirect(buffer, 0).unwrap();
        assert_eq!(cb.tracked_resources().len(), 2);
        let key = ResourceKey::Image(image);
        assert!(cb.tracked_resources().contains(key));
        assert_eq!(
            fixture.device.resources().unwrap().usage(key).unwrap().recording,
            1
        );

        cb.reset().unwrap();
        assert!(cb.tracked_resources().is_empty());
        let resources = fixture.device.resources().unwrap();
        assert!(resources.is_idle(key, 0));
    }

    #[test]
    fn secondaries_continue_an_inherited_render_pass() {
        let fixture = Fixture::new(RhiSettings::default());
        let image = fixture.image(ImageDesc::default());
        let inheritance = RenderPassInheritance {
            render_pass: vk::RenderPass::from_raw(1),
            subpass: 0,
            framebuffer: vk::Framebuffer::from_raw(2),
        };
        let mut primary = fixture.command_buffer();
        assert_eq!(
            primary.begin_in_render_pass(inheritance),
            Err(RhiError::InvalidCommandBufferLevel {
                expected: vk::CommandBufferLevel::SECONDARY,
                found: vk::CommandBufferLevel::PRIMARY,
            })
        );

        let mut secondary = fixture.command_buffer_of_level(vk::CommandBufferLevel::SECONDARY);
        secondary.begin_in_render_pass(inheritance).unwrap();
        assert_eq!(
            fixture.device.backend().inheritance(secondary.raw()),
            Some(inheritance)
        );
        assert!(secondary.in_render_pass());
        secondary.draw(3, 1, 0, 0).unwrap();
        assert_eq!(secondary.end_render_pass(), Err(RhiError::InheritedRenderPass));
        // the primary owns the pass, ending only closes the recording
        secondary.end().unwrap();
        let names: Vec<_> = fixture.commands(&secondary).iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["Draw"]);

        primary.begin().unwrap();
        primary.transition_image(image, ResourceState::RENDER_TARGET).unwrap();
        primary
            .begin_render_pass_with_secondaries(
                vk::RenderPass::from_raw(1),
                vk::Framebuffer::from_raw(2),
                vk::Rect2D::default(),
                &[],
            )
            .unwrap();
        assert_eq!(
            primary.draw(3, 1, 0, 0),
            Err(RhiError::SubpassContents(
                vk::SubpassContents::SECONDARY_COMMAND_BUFFERS
            ))
        );
        primary.execute_commands(vec![secondary]).unwrap();
        assert_eq!(primary.secondary_count(), 1);
        primary.end().unwrap();
        let names: Vec<_> = fixture.commands(&primary).iter().map(|c| c.name()).collect();
        assert_eq!(
            names,
            vec![
                "PipelineBarrier",
                "BeginRenderPass",
                "ExecuteCommands",
                "EndRenderPass"
            ]
        );

        // completion carries over to the executed secondaries
        primary.mark_pending(Completion::Complete, 1);
        assert_eq!(primary.refresh_status().unwrap(), CommandBufferState::Invalid);
        let secondaries = primary.take_secondaries();
        assert_eq!(secondaries[0].state(), CommandBufferState::Invalid);
    }

    #[test]
    fn secondaries_must_match_render_pass_scope() {
        let fixture = Fixture::new(RhiSettings::default());
        let mut secondary = fixture.command_buffer_of_level(vk::CommandBufferLevel::SECONDARY);
        secondary.begin().unwrap();
        secondary.dispatch(1, 1, 1).unwrap();

        let mut primary = fixture.command_buffer();
        primary.begin().unwrap();
        primary
            .begin_render_pass(
                vk::RenderPass::from_raw(1),
                vk::Framebuffer::from_raw(2),
                vk::Rect2D::default(),
                &[],
            )
            .unwrap();
        assert_eq!(
            primary.execute_commands(Vec::new()),
            Err(RhiError::SubpassContents(vk::SubpassContents::INLINE))
        );
        primary.end_render_pass().unwrap();
        // secondaries outside a render pass are ended on execution
        primary.execute_commands(vec![secondary]).unwrap();
        let names: Vec<_> = fixture.commands(&primary).iter().map(|c| c.name()).collect();
        assert_eq!(
            names,
            vec!["BeginRenderPass", "EndRenderPass", "ExecuteCommands"]
        );
    }
}
