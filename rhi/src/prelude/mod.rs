//! Types most users of the crate need

pub use crate::backend::{
    Backend, HeadlessBackend, HeadlessPlatform, Platform, SemaphoreKind, SemaphoreSignal,
    SemaphoreWait,
};
#[cfg(feature = "vulkan")]
pub use crate::backend::{VulkanBackend, VulkanPlatform};
pub use crate::command::{CommandBuffer, CommandBufferState, CommandContext, ResourceUse};
pub use crate::device::{Device, LogicalDevice};
pub use crate::queue::{Queue, QueueType};
pub use crate::resource::{BufferDesc, BufferHandle, ImageDesc, ImageHandle};
pub use crate::resource_state::ResourceState;
pub use crate::settings::{DescriptorLimits, RhiSettings, SyncType};
pub use crate::sync::{Event, Semaphore};
pub use crate::traits::Destructible;
pub use crate::RhiError;
