//! Command buffer lifecycle and resource state tracking on top of Vulkan.
//!
//! A [`device::Device`] is opened through a [`backend::Platform`] and hands out queues, command
//! buffers and resources. Command buffers translate symbolic [`resource_state::ResourceState`]
//! transitions into batched pipeline barriers.

pub mod backend;
pub mod barrier;
pub mod bootstrap;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod graveyard;
pub mod prelude;
pub mod queue;
pub mod resource;
pub mod resource_state;
pub mod settings;
pub mod sync;
pub mod traits;
pub mod util;

pub use error::RhiError;

// Re-exports
pub use ash;
