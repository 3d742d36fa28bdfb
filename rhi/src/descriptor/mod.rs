pub mod allocator;
pub mod descriptor_pool;

pub use allocator::DescriptorAllocator;
pub use descriptor_pool::DescriptorPool;
