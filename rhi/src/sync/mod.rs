pub mod event;
pub mod fence;
pub mod semaphore;

pub use event::Event;
pub use fence::{FenceCache, PooledFence};
pub use semaphore::Semaphore;
