use std::sync::PoisonError;

use ash::vk;
/// Possible errors
use thiserror::Error;

use crate::command::CommandBufferState;
use crate::resource_state::ResourceState;

#[derive(Debug, Error, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RhiError {
    #[error("Expected command buffer state to be in {expected:?}, got {found:?}")]
    InvalidCommandBufferState {
        expected: CommandBufferState,
        found: CommandBufferState,
    },

    #[error("Command buffer is pending execution on the GPU")]
    CommandBufferPending,

    #[error("Operation is not allowed inside a render pass")]
    InsideRenderPass,

    #[error("Operation requires an active render pass")]
    OutsideRenderPass,

    #[error("Expected a {expected:?} command buffer, got {found:?}")]
    InvalidCommandBufferLevel {
        expected: vk::CommandBufferLevel,
        found: vk::CommandBufferLevel,
    },

    #[error("Render pass is inherited and cannot be ended by this command buffer")]
    InheritedRenderPass,

    #[error("Command is not allowed in a subpass with {0:?} contents")]
    SubpassContents(vk::SubpassContents),

    #[error("Resource belongs to queue family {owner} and was not released to family {requested}")]
    QueueFamilyOwnership { owner: u32, requested: u32 },

    #[error("Resource state {0:?} cannot be expressed by a single barrier")]
    InvalidResourceState(ResourceState),

    #[error("Descriptor pool is full")]
    DescriptorPoolFull,

    #[error("Operation requires a timeline semaphore")]
    NotTimeline,

    #[error("Handle is stale or does not belong to this registry")]
    InvalidHandle,

    #[error("No suitable physical device has been found")]
    NoPhysicalDevice,

    #[error("It is impossible to create requested queue")]
    ImpossibleQueue,

    #[error("Device was lost")]
    DeviceLost,

    #[error("Poisoned mutex")]
    PoisonError,

    #[error(transparent)]
    VkError(vk::Result),
}

impl From<vk::Result> for RhiError {
    fn from(value: vk::Result) -> Self {
        match value {
            vk::Result::ERROR_DEVICE_LOST => RhiError::DeviceLost,
            other => RhiError::VkError(other),
        }
    }
}

impl<T> From<PoisonError<T>> for RhiError {
    fn from(_: PoisonError<T>) -> Self {
        RhiError::PoisonError
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_lost_is_promoted() {
        assert_eq!(
            RhiError::from(vk::Result::ERROR_DEVICE_LOST),
            RhiError::DeviceLost
        );
        assert_eq!(
            RhiError::from(vk::Result::ERROR_OUT_OF_HOST_MEMORY),
            RhiError::VkError(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
        );
    }
}
