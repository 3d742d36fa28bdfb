#[allow(clippy::module_inception)]
pub mod device;
pub mod logical_device;

pub use device::Device;
pub use logical_device::LogicalDevice;
