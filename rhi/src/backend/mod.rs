//! Native backends the device can run on.
//!
//! Every backend speaks in `ash` handle and flag types. The device is generic over [`Backend`]
//! so recording calls dispatch statically.

use ash::vk;

use crate::barrier::PipelineBarrier;
use crate::bootstrap::AdapterInfo;

pub mod headless;
#[cfg(feature = "vulkan")]
pub mod vulkan;

pub use headless::{HeadlessBackend, HeadlessPlatform, RecordedCommand};
#[cfg(feature = "vulkan")]
pub use vulkan::{VulkanBackend, VulkanPlatform};

pub type VkResult<T> = Result<T, vk::Result>;

/// Device memory backing an owned image or buffer. Backends without real memory hand out `None`.
pub type Allocation = gpu_allocator::vulkan::Allocation;

/// Render pass state a secondary command buffer continues
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RenderPassInheritance {
    pub render_pass: vk::RenderPass,
    pub subpass: u32,
    /// May be null if unknown while recording
    pub framebuffer: vk::Framebuffer,
}

/// Debug marker extension in use, if any
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DebugMarkerKind {
    /// `VK_EXT_debug_utils`
    DebugUtils,
    /// `VK_EXT_debug_marker`
    DebugMarker,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SemaphoreKind {
    Binary,
    Timeline { initial_value: u64 },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SemaphoreWait {
    pub semaphore: vk::Semaphore,
    /// Ignored for binary semaphores
    pub value: u64,
    pub stage: vk::PipelineStageFlags,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SemaphoreSignal {
    pub semaphore: vk::Semaphore,
    /// Ignored for binary semaphores
    pub value: u64,
}

impl SemaphoreWait {
    /// Wait on a binary semaphore before any work starts
    pub fn new(semaphore: vk::Semaphore) -> Self {
        Self {
            semaphore,
            value: 0,
            stage: vk::PipelineStageFlags::TOP_OF_PIPE,
        }
    }

    pub fn at_stage(mut self, stage: vk::PipelineStageFlags) -> Self {
        self.stage = stage;
        self
    }

    pub fn with_value(mut self, value: u64) -> Self {
        self.value = value;
        self
    }
}

impl SemaphoreSignal {
    pub fn new(semaphore: vk::Semaphore) -> Self {
        Self {
            semaphore,
            value: 0,
        }
    }
}

/// One batch handed to the native queue
#[derive(Debug, Clone, Copy)]
pub struct SubmitDesc<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],
    pub wait_semaphores: &'a [SemaphoreWait],
    pub signal_semaphores: &'a [SemaphoreSignal],
    /// May be null
    pub fence: vk::Fence,
}

/// A single recorded command
#[derive(derivative::Derivative, Clone, Copy)]
#[derivative(Debug)]
pub enum Command<'a> {
    PipelineBarrier(&'a PipelineBarrier),
    BeginRenderPass {
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        render_area: vk::Rect2D,
        #[derivative(Debug = "ignore")]
        clear_values: &'a [vk::ClearValue],
        contents: vk::SubpassContents,
    },
    EndRenderPass,
    ExecuteCommands(&'a [vk::CommandBuffer]),
    BindPipeline {
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    },
    BindDescriptorSets {
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &'a [vk::DescriptorSet],
        dynamic_offsets: &'a [u32],
    },
    BindVertexBuffers {
        first_binding: u32,
        buffers: &'a [vk::Buffer],
        offsets: &'a [vk::DeviceSize],
    },
    BindIndexBuffer {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    },
    SetViewports {
        first: u32,
        viewports: &'a [vk::Viewport],
    },
    SetScissors {
        first: u32,
        scissors: &'a [vk::Rect2D],
    },
    PushConstants {
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &'a [u8],
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    DrawIndirect {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        draw_count: u32,
        stride: u32,
    },
    DrawIndexedIndirect {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        draw_count: u32,
        stride: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    DispatchIndirect {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
    },
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &'a [vk::BufferCopy],
    },
    CopyImage {
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &'a [vk::ImageCopy],
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &'a [vk::BufferImageCopy],
    },
    CopyImageToBuffer {
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: &'a [vk::BufferImageCopy],
    },
    ClearColorImage {
        image: vk::Image,
        layout: vk::ImageLayout,
        #[derivative(Debug = "ignore")]
        color: vk::ClearColorValue,
        ranges: &'a [vk::ImageSubresourceRange],
    },
    ClearDepthStencilImage {
        image: vk::Image,
        layout: vk::ImageLayout,
        value: vk::ClearDepthStencilValue,
        ranges: &'a [vk::ImageSubresourceRange],
    },
    SetEvent {
        event: vk::Event,
        stage: vk::PipelineStageFlags,
    },
    ResetEvent {
        event: vk::Event,
        stage: vk::PipelineStageFlags,
    },
    WaitEvent {
        event: vk::Event,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    },
    BeginDebugMarker {
        kind: DebugMarkerKind,
        name: &'a str,
        color: [f32; 4],
    },
    EndDebugMarker {
        kind: DebugMarkerKind,
    },
}

impl Command<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Command::PipelineBarrier(_) => "PipelineBarrier",
            Command::BeginRenderPass { .. } => "BeginRenderPass",
            Command::EndRenderPass => "EndRenderPass",
            Command::ExecuteCommands(_) => "ExecuteCommands",
            Command::BindPipeline { .. } => "BindPipeline",
            Command::BindDescriptorSets { .. } => "BindDescriptorSets",
            Command::BindVertexBuffers { .. } => "BindVertexBuffers",
            Command::BindIndexBuffer { .. } => "BindIndexBuffer",
            Command::SetViewports { .. } => "SetViewports",
            Command::SetScissors { .. } => "SetScissors",
            Command::PushConstants { .. } => "PushConstants",
            Command::Draw { .. } => "Draw",
            Command::DrawIndexed { .. } => "DrawIndexed",
            Command::DrawIndirect { .. } => "DrawIndirect",
            Command::DrawIndexedIndirect { .. } => "DrawIndexedIndirect",
            Command::Dispatch { .. } => "Dispatch",
            Command::DispatchIndirect { .. } => "DispatchIndirect",
            Command::CopyBuffer { .. } => "CopyBuffer",
            Command::CopyImage { .. } => "CopyImage",
            Command::CopyBufferToImage { .. } => "CopyBufferToImage",
            Command::CopyImageToBuffer { .. } => "CopyImageToBuffer",
            Command::ClearColorImage { .. } => "ClearColorImage",
            Command::ClearDepthStencilImage { .. } => "ClearDepthStencilImage",
            Command::SetEvent { .. } => "SetEvent",
            Command::ResetEvent { .. } => "ResetEvent",
            Command::WaitEvent { .. } => "WaitEvent",
            Command::BeginDebugMarker { .. } => "BeginDebugMarker",
            Command::EndDebugMarker { .. } => "EndDebugMarker",
        }
    }
}

/// Enumerates adapters and opens a backend on one of them
pub trait Platform {
    type Backend: Backend;

    fn adapters(&self) -> anyhow::Result<Vec<AdapterInfo>>;

    /// Create the logical device with one queue for each of `queue_families`
    fn open(&self, adapter: &AdapterInfo, queue_families: &[u32]) -> anyhow::Result<Self::Backend>;
}

/// Native operations of an opened logical device
pub trait Backend: Send + Sync + 'static {
    fn debug_marker_kind(&self) -> Option<DebugMarkerKind>;

    fn get_queue(&self, family_index: u32) -> vk::Queue;

    fn create_command_pool(&self, family_index: u32) -> VkResult<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
    ) -> VkResult<vk::CommandBuffer>;
    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer);
    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
        inheritance: Option<&RenderPassInheritance>,
    ) -> VkResult<()>;
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;
    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;
    fn record(&self, command_buffer: vk::CommandBuffer, command: Command<'_>);

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool>;
    /// Returns `false` if the timeout elapsed first
    fn wait_for_fence(&self, fence: vk::Fence, timeout: u64) -> VkResult<bool>;
    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;

    fn create_semaphore(&self, kind: SemaphoreKind) -> VkResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    fn semaphore_value(&self, semaphore: vk::Semaphore) -> VkResult<u64>;
    fn signal_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> VkResult<()>;
    /// Returns `false` if the timeout elapsed first
    fn wait_semaphore(&self, semaphore: vk::Semaphore, value: u64, timeout: u64) -> VkResult<bool>;

    fn create_event(&self) -> VkResult<vk::Event>;
    fn destroy_event(&self, event: vk::Event);
    fn event_status(&self, event: vk::Event) -> VkResult<bool>;
    fn set_event(&self, event: vk::Event, signaled: bool) -> VkResult<()>;

    fn queue_submit(&self, queue: vk::Queue, submit: &SubmitDesc<'_>) -> VkResult<()>;
    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()>;
    fn device_wait_idle(&self) -> VkResult<()>;

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> VkResult<vk::DescriptorPool>;
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet>;
    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> VkResult<()>;

    fn create_image(
        &self,
        desc: &crate::resource::ImageDesc,
    ) -> VkResult<(vk::Image, Option<Allocation>)>;
    fn destroy_image(&self, image: vk::Image, allocation: Option<Allocation>);
    fn create_buffer(
        &self,
        desc: &crate::resource::BufferDesc,
    ) -> VkResult<(vk::Buffer, Option<Allocation>)>;
    fn destroy_buffer(&self, buffer: vk::Buffer, allocation: Option<Allocation>);
}
