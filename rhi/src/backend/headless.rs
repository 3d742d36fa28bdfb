//! Software backend.
//!
//! Native handles are fabricated from a counter. Commands are logged per command buffer and
//! submissions only "execute" when the GPU is told to make progress, either explicitly through
//! [`HeadlessBackend::complete_pending`] or implicitly by a blocking wait.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use ash::vk;
use ash::vk::Handle;

use super::{
    Allocation, Backend, Command, DebugMarkerKind, Platform, RenderPassInheritance,
    SemaphoreKind, SubmitDesc, VkResult,
};
use crate::barrier::PipelineBarrier;
use crate::bootstrap::AdapterInfo;
use crate::resource::{BufferDesc, ImageDesc};

/// A command as the headless backend logged it
#[derive(Debug, Clone)]
pub enum RecordedCommand {
    Barrier(PipelineBarrier),
    Other(&'static str),
}

impl RecordedCommand {
    pub fn name(&self) -> &'static str {
        match self {
            RecordedCommand::Barrier(_) => "PipelineBarrier",
            RecordedCommand::Other(name) => name,
        }
    }

    pub fn as_barrier(&self) -> Option<&PipelineBarrier> {
        match self {
            RecordedCommand::Barrier(barrier) => Some(barrier),
            RecordedCommand::Other(_) => None,
        }
    }
}

/// A submission as the headless queue received it
#[derive(Debug, Clone)]
pub struct SubmissionRecord {
    pub queue: vk::Queue,
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub commands: Vec<RecordedCommand>,
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub signal_semaphores: Vec<vk::Semaphore>,
    pub fence: vk::Fence,
}

#[derive(Debug)]
struct PendingSubmission {
    queue: vk::Queue,
    fence: vk::Fence,
    signals: Vec<(vk::Semaphore, u64)>,
}

#[derive(Debug, Default)]
struct CommandLog {
    recording: bool,
    inheritance: Option<RenderPassInheritance>,
    commands: Vec<RecordedCommand>,
}

#[derive(Debug, Default)]
struct HeadlessState {
    fences: HashMap<vk::Fence, bool>,
    events: HashMap<vk::Event, bool>,
    /// Timeline value, binary semaphores use 0 and 1
    semaphores: HashMap<vk::Semaphore, u64>,
    command_buffers: HashMap<vk::CommandBuffer, CommandLog>,
    command_pools: HashSet<vk::CommandPool>,
    /// (max sets, allocated sets)
    descriptor_pools: HashMap<vk::DescriptorPool, (u32, u32)>,
    images: HashSet<vk::Image>,
    buffers: HashSet<vk::Buffer>,
    pending: VecDeque<PendingSubmission>,
    submissions: Vec<SubmissionRecord>,
}

impl HeadlessState {
    fn retire_front(&mut self) -> bool {
        let Some(submission) = self.pending.pop_front() else {
            return false;
        };
        if submission.fence != vk::Fence::null() {
            self.fences.insert(submission.fence, true);
        }
        for (semaphore, value) in submission.signals {
            let current = self.semaphores.entry(semaphore).or_default();
            *current = (*current).max(value);
        }
        true
    }
}

#[derive(Debug)]
pub struct HeadlessBackend {
    adapter_name: String,
    next_handle: AtomicU64,
    auto_complete: AtomicBool,
    fail_next_submit: AtomicBool,
    debug_markers: Option<DebugMarkerKind>,
    state: Mutex<HeadlessState>,
}

impl HeadlessBackend {
    pub fn new(adapter_name: impl Into<String>) -> Self {
        Self {
            adapter_name: adapter_name.into(),
            next_handle: AtomicU64::new(1),
            auto_complete: AtomicBool::new(false),
            fail_next_submit: AtomicBool::new(false),
            debug_markers: Some(DebugMarkerKind::DebugUtils),
            state: Mutex::new(HeadlessState::default()),
        }
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    /// When set, submissions finish as soon as they are made
    pub fn set_auto_complete(&self, auto_complete: bool) {
        self.auto_complete.store(auto_complete, Ordering::Release);
    }

    /// Make the next queue submission fail with `ERROR_OUT_OF_DEVICE_MEMORY`
    pub fn fail_next_submit(&self) {
        self.fail_next_submit.store(true, Ordering::Release);
    }

    fn next<H: Handle>(&self) -> H {
        H::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn lock(&self) -> VkResult<MutexGuard<'_, HeadlessState>> {
        self.state.lock().map_err(|_| vk::Result::ERROR_UNKNOWN)
    }

    /// Finish every outstanding submission. Returns how many finished.
    pub fn complete_pending(&self) -> usize {
        let Ok(mut state) = self.lock() else {
            return 0;
        };
        let mut completed = 0;
        while state.retire_front() {
            completed += 1;
        }
        completed
    }

    /// Finish the oldest outstanding submission
    pub fn complete_next(&self) -> bool {
        self.lock().map(|mut state| state.retire_front()).unwrap_or(false)
    }

    pub fn pending_submissions(&self) -> usize {
        self.lock().map(|state| state.pending.len()).unwrap_or(0)
    }

    /// Every submission made so far, in order
    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.lock()
            .map(|state| state.submissions.clone())
            .unwrap_or_default()
    }

    /// Commands currently recorded into `command_buffer`
    pub fn recorded_commands(&self, command_buffer: vk::CommandBuffer) -> Vec<RecordedCommand> {
        self.lock()
            .ok()
            .and_then(|state| {
                state
                    .command_buffers
                    .get(&command_buffer)
                    .map(|log| log.commands.clone())
            })
            .unwrap_or_default()
    }

    /// Render pass `command_buffer` was begun to continue, if any
    pub fn inheritance(&self, command_buffer: vk::CommandBuffer) -> Option<RenderPassInheritance> {
        self.lock()
            .ok()
            .and_then(|state| {
                state
                    .command_buffers
                    .get(&command_buffer)
                    .and_then(|log| log.inheritance)
            })
    }

    pub fn live_images(&self) -> usize {
        self.lock().map(|state| state.images.len()).unwrap_or(0)
    }

    pub fn live_buffers(&self) -> usize {
        self.lock().map(|state| state.buffers.len()).unwrap_or(0)
    }

    pub fn live_fences(&self) -> usize {
        self.lock().map(|state| state.fences.len()).unwrap_or(0)
    }

    pub fn live_command_pools(&self) -> usize {
        self.lock().map(|state| state.command_pools.len()).unwrap_or(0)
    }
}

impl Backend for HeadlessBackend {
    fn debug_marker_kind(&self) -> Option<DebugMarkerKind> {
        self.debug_markers
    }

    fn get_queue(&self, family_index: u32) -> vk::Queue {
        vk::Queue::from_raw(0x1000 + family_index as u64)
    }

    fn create_command_pool(&self, _family_index: u32) -> VkResult<vk::CommandPool> {
        let pool = self.next();
        self.lock()?.command_pools.insert(pool);
        Ok(pool)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        if let Ok(mut state) = self.lock() {
            state.command_pools.remove(&pool);
        }
    }

    fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
        _level: vk::CommandBufferLevel,
    ) -> VkResult<vk::CommandBuffer> {
        let mut state = self.lock()?;
        if !state.command_pools.contains(&pool) {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let command_buffer = self.next();
        state
            .command_buffers
            .insert(command_buffer, CommandLog::default());
        Ok(command_buffer)
    }

    fn free_command_buffer(&self, _pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        if let Ok(mut state) = self.lock() {
            state.command_buffers.remove(&command_buffer);
        }
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        _flags: vk::CommandBufferUsageFlags,
        inheritance: Option<&RenderPassInheritance>,
    ) -> VkResult<()> {
        let mut state = self.lock()?;
        let log = state
            .command_buffers
            .get_mut(&command_buffer)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        log.recording = true;
        log.inheritance = inheritance.copied();
        log.commands.clear();
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.lock()?;
        let log = state
            .command_buffers
            .get_mut(&command_buffer)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        log.recording = false;
        Ok(())
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.lock()?;
        let log = state
            .command_buffers
            .get_mut(&command_buffer)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        *log = CommandLog::default();
        Ok(())
    }

    fn record(&self, command_buffer: vk::CommandBuffer, command: Command<'_>) {
        tracing::trace!(?command_buffer, command = command.name(), "Recording");
        let Ok(mut state) = self.lock() else {
            return;
        };
        let Some(log) = state.command_buffers.get_mut(&command_buffer) else {
            return;
        };
        if !log.recording {
            tracing::error!(?command_buffer, "Recorded into a command buffer that is not recording");
            return;
        }
        let recorded = match command {
            Command::PipelineBarrier(barrier) => RecordedCommand::Barrier(barrier.clone()),
            other => RecordedCommand::Other(other.name()),
        };
        log.commands.push(recorded);
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let fence = self.next();
        self.lock()?.fences.insert(fence, signaled);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        if let Ok(mut state) = self.lock() {
            state.fences.remove(&fence);
        }
    }

    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        self.lock()?
            .fences
            .get(&fence)
            .copied()
            .ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout: u64) -> VkResult<bool> {
        let mut state = self.lock()?;
        let signaled = *state.fences.get(&fence).ok_or(vk::Result::ERROR_UNKNOWN)?;
        if signaled || timeout == 0 {
            return Ok(signaled);
        }
        // let the "GPU" run up to the submission carrying this fence
        if state.pending.iter().any(|pending| pending.fence == fence) {
            while state.retire_front() {
                if state.fences.get(&fence).copied().unwrap_or(false) {
                    break;
                }
            }
        }
        Ok(state.fences.get(&fence).copied().unwrap_or(false))
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.lock()?;
        let signaled = state
            .fences
            .get_mut(&fence)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        *signaled = false;
        Ok(())
    }

    fn create_semaphore(&self, kind: SemaphoreKind) -> VkResult<vk::Semaphore> {
        let semaphore = self.next();
        let value = match kind {
            SemaphoreKind::Binary => 0,
            SemaphoreKind::Timeline { initial_value } => initial_value,
        };
        self.lock()?.semaphores.insert(semaphore, value);
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        if let Ok(mut state) = self.lock() {
            state.semaphores.remove(&semaphore);
        }
    }

    fn semaphore_value(&self, semaphore: vk::Semaphore) -> VkResult<u64> {
        self.lock()?
            .semaphores
            .get(&semaphore)
            .copied()
            .ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn signal_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> VkResult<()> {
        let mut state = self.lock()?;
        let current = state
            .semaphores
            .get_mut(&semaphore)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        *current = (*current).max(value);
        Ok(())
    }

    fn wait_semaphore(&self, semaphore: vk::Semaphore, value: u64, timeout: u64) -> VkResult<bool> {
        let mut state = self.lock()?;
        let reached = |state: &HeadlessState| {
            state
                .semaphores
                .get(&semaphore)
                .is_some_and(|current| *current >= value)
        };
        if reached(&state) || timeout == 0 {
            return Ok(reached(&state));
        }
        while !reached(&state) && state.retire_front() {}
        Ok(reached(&state))
    }

    fn create_event(&self) -> VkResult<vk::Event> {
        let event = self.next();
        self.lock()?.events.insert(event, false);
        Ok(event)
    }

    fn destroy_event(&self, event: vk::Event) {
        if let Ok(mut state) = self.lock() {
            state.events.remove(&event);
        }
    }

    fn event_status(&self, event: vk::Event) -> VkResult<bool> {
        self.lock()?
            .events
            .get(&event)
            .copied()
            .ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn set_event(&self, event: vk::Event, signaled: bool) -> VkResult<()> {
        let mut state = self.lock()?;
        let status = state
            .events
            .get_mut(&event)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        *status = signaled;
        Ok(())
    }

    fn queue_submit(&self, queue: vk::Queue, submit: &SubmitDesc<'_>) -> VkResult<()> {
        if self.fail_next_submit.swap(false, Ordering::AcqRel) {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        let mut state = self.lock()?;
        let mut commands = Vec::new();
        for command_buffer in submit.command_buffers {
            let log = state
                .command_buffers
                .get(command_buffer)
                .ok_or(vk::Result::ERROR_UNKNOWN)?;
            if log.recording {
                return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
            }
            commands.extend(log.commands.iter().cloned());
        }
        state.submissions.push(SubmissionRecord {
            queue,
            command_buffers: submit.command_buffers.to_vec(),
            commands,
            wait_semaphores: submit
                .wait_semaphores
                .iter()
                .map(|wait| wait.semaphore)
                .collect(),
            signal_semaphores: submit
                .signal_semaphores
                .iter()
                .map(|signal| signal.semaphore)
                .collect(),
            fence: submit.fence,
        });
        state.pending.push_back(PendingSubmission {
            queue,
            fence: submit.fence,
            signals: submit
                .signal_semaphores
                .iter()
                .map(|signal| (signal.semaphore, signal.value.max(1)))
                .collect(),
        });
        if self.auto_complete.load(Ordering::Acquire) {
            while state.retire_front() {}
        }
        Ok(())
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()> {
        let mut state = self.lock()?;
        // submissions retire in order, so retire up to the last one on this queue
        while state.pending.iter().any(|pending| pending.queue == queue) {
            state.retire_front();
        }
        Ok(())
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        let mut state = self.lock()?;
        while state.retire_front() {}
        Ok(())
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        _sizes: &[vk::DescriptorPoolSize],
    ) -> VkResult<vk::DescriptorPool> {
        let pool = self.next();
        self.lock()?.descriptor_pools.insert(pool, (max_sets, 0));
        Ok(pool)
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        if let Ok(mut state) = self.lock() {
            state.descriptor_pools.remove(&pool);
        }
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        _layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet> {
        let mut state = self.lock()?;
        let (max_sets, allocated) = state
            .descriptor_pools
            .get_mut(&pool)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        if *allocated >= *max_sets {
            return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        }
        *allocated += 1;
        Ok(self.next())
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> VkResult<()> {
        let mut state = self.lock()?;
        let (_, allocated) = state
            .descriptor_pools
            .get_mut(&pool)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        *allocated = 0;
        Ok(())
    }

    fn create_image(&self, _desc: &ImageDesc) -> VkResult<(vk::Image, Option<Allocation>)> {
        let image = self.next();
        self.lock()?.images.insert(image);
        Ok((image, None))
    }

    fn destroy_image(&self, image: vk::Image, _allocation: Option<Allocation>) {
        if let Ok(mut state) = self.lock() {
            state.images.remove(&image);
        }
    }

    fn create_buffer(&self, _desc: &BufferDesc) -> VkResult<(vk::Buffer, Option<Allocation>)> {
        let buffer = self.next();
        self.lock()?.buffers.insert(buffer);
        Ok((buffer, None))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer, _allocation: Option<Allocation>) {
        if let Ok(mut state) = self.lock() {
            state.buffers.remove(&buffer);
        }
    }
}

/// Fake adapters to bootstrap a [`HeadlessBackend`] from
#[derive(Debug, Clone)]
pub struct HeadlessPlatform {
    adapters: Vec<AdapterInfo>,
}

impl Default for HeadlessPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessPlatform {
    /// A single discrete adapter with a universal family, a compute family and a transfer family
    pub fn new() -> Self {
        let family = |queue_flags: vk::QueueFlags| vk::QueueFamilyProperties {
            queue_flags,
            queue_count: 1,
            timestamp_valid_bits: 64,
            min_image_transfer_granularity: vk::Extent3D {
                width: 1,
                height: 1,
                depth: 1,
            },
        };
        Self::with_adapters(vec![AdapterInfo {
            raw: vk::PhysicalDevice::from_raw(1),
            name: String::from("Headless Discrete"),
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            api_version: vk::make_api_version(0, 1, 3, 0),
            limits: vk::PhysicalDeviceLimits {
                max_descriptor_set_samplers: 4096,
                max_descriptor_set_sampled_images: 4096,
                max_descriptor_set_storage_images: 4096,
                max_descriptor_set_uniform_buffers: 4096,
                max_descriptor_set_storage_buffers: 4096,
                max_descriptor_set_uniform_buffers_dynamic: 64,
                max_descriptor_set_storage_buffers_dynamic: 64,
                max_descriptor_set_input_attachments: 64,
                ..Default::default()
            },
            queue_families: vec![
                family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
                family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
                family(vk::QueueFlags::TRANSFER),
            ],
            present_support: vec![true, false, false],
        }])
    }

    pub fn with_adapters(adapters: Vec<AdapterInfo>) -> Self {
        Self { adapters }
    }
}

impl Platform for HeadlessPlatform {
    type Backend = HeadlessBackend;

    fn adapters(&self) -> anyhow::Result<Vec<AdapterInfo>> {
        Ok(self.adapters.clone())
    }

    fn open(&self, adapter: &AdapterInfo, queue_families: &[u32]) -> anyhow::Result<HeadlessBackend> {
        tracing::debug!(adapter = %adapter.name, ?queue_families, "Opening headless device");
        Ok(HeadlessBackend::new(adapter.name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SemaphoreSignal;

    #[test]
    fn fence_signals_on_completion() {
        let backend = HeadlessBackend::new("test");
        let fence = backend.create_fence(false).unwrap();
        let queue = backend.get_queue(0);
        backend
            .queue_submit(
                queue,
                &SubmitDesc {
                    command_buffers: &[],
                    wait_semaphores: &[],
                    signal_semaphores: &[],
                    fence,
                },
            )
            .unwrap();
        assert!(!backend.fence_status(fence).unwrap());
        assert!(!backend.wait_for_fence(fence, 0).unwrap());
        assert_eq!(backend.complete_pending(), 1);
        assert!(backend.fence_status(fence).unwrap());
    }

    #[test]
    fn blocking_wait_runs_until_fence() {
        let backend = HeadlessBackend::new("test");
        let queue = backend.get_queue(0);
        let first = backend.create_fence(false).unwrap();
        let second = backend.create_fence(false).unwrap();
        for fence in [first, second] {
            backend
                .queue_submit(
                    queue,
                    &SubmitDesc {
                        command_buffers: &[],
                        wait_semaphores: &[],
                        signal_semaphores: &[],
                        fence,
                    },
                )
                .unwrap();
        }
        assert!(backend.wait_for_fence(first, u64::MAX).unwrap());
        assert!(!backend.fence_status(second).unwrap());
        assert_eq!(backend.pending_submissions(), 1);
    }

    #[test]
    fn timeline_values_advance() {
        let backend = HeadlessBackend::new("test");
        let semaphore = backend
            .create_semaphore(SemaphoreKind::Timeline { initial_value: 0 })
            .unwrap();
        backend
            .queue_submit(
                backend.get_queue(0),
                &SubmitDesc {
                    command_buffers: &[],
                    wait_semaphores: &[],
                    signal_semaphores: &[SemaphoreSignal {
                        semaphore,
                        value: 3,
                    }],
                    fence: vk::Fence::null(),
                },
            )
            .unwrap();
        assert_eq!(backend.semaphore_value(semaphore).unwrap(), 0);
        assert!(backend.wait_semaphore(semaphore, 3, u64::MAX).unwrap());
        assert_eq!(backend.semaphore_value(semaphore).unwrap(), 3);
    }

    #[test]
    fn rejects_submission_of_recording_buffer() {
        let backend = HeadlessBackend::new("test");
        let pool = backend.create_command_pool(0).unwrap();
        let command_buffer = backend
            .allocate_command_buffer(pool, vk::CommandBufferLevel::PRIMARY)
            .unwrap();
        backend
            .begin_command_buffer(
                command_buffer,
                vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                None,
            )
            .unwrap();
        backend.record(command_buffer, Command::Dispatch { x: 1, y: 1, z: 1 });
        assert_eq!(backend.recorded_commands(command_buffer).len(), 1);
        let result = backend.queue_submit(
            backend.get_queue(0),
            &SubmitDesc {
                command_buffers: &[command_buffer],
                wait_semaphores: &[],
                signal_semaphores: &[],
                fence: vk::Fence::null(),
            },
        );
        assert_eq!(result, Err(vk::Result::ERROR_VALIDATION_FAILED_EXT));
    }
}
