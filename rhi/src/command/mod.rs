pub mod command_buffer;
pub mod command_pool;
pub mod context;

pub use command_buffer::{CommandBuffer, CommandBufferState, ResourceUse};
pub use command_pool::CommandPool;
pub use context::CommandContext;
