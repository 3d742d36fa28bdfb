//! Adapter scoring and queue family selection.
//!
//! Everything here works on plain adapter descriptions so it can be exercised without a GPU.

pub mod physical_device;
pub mod queue;

pub use physical_device::{get_version, select_adapter, AdapterInfo};
pub use queue::{select_queue_families, QueueFamilySelection};
