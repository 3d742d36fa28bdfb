use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use derivative::Derivative;
#[cfg(feature = "log-lifetimes")]
use tracing::trace;

use crate::backend::Backend;
use crate::bootstrap::QueueFamilySelection;
use crate::graveyard::Graveyard;
use crate::queue::QueueType;
use crate::resource::{Ownership, ResourceRegistry};
use crate::settings::RhiSettings;
use crate::sync::{FenceCache, PooledFence};
use crate::RhiError;

#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
struct LogicalDeviceInner<B: Backend> {
    #[derivative(Debug = "ignore")]
    backend: B,
    settings: RhiSettings,
    families: QueueFamilySelection,
    resources: Mutex<ResourceRegistry>,
    fence_cache: FenceCache,
    graveyard: Graveyard<B>,
    /// Serial of the most recent submission on any queue
    serial: AtomicU64,
}

impl<B: Backend> Drop for LogicalDeviceInner<B> {
    fn drop(&mut self) {
        #[cfg(feature = "log-lifetimes")]
        trace!("Destroying logical device core");

        self.graveyard.flush(&self.backend);
        if let Ok(mut resources) = self.resources.lock() {
            let (images, buffers) = resources.drain();
            for image in images {
                if image.ownership == Ownership::Owned {
                    self.backend.destroy_image(image.raw, image.allocation);
                }
            }
            for buffer in buffers {
                if buffer.ownership == Ownership::Owned {
                    self.backend.destroy_buffer(buffer.raw, buffer.allocation);
                }
            }
        }
        self.fence_cache.destroy_all(&self.backend);
    }
}

/// Cheaply clonable core shared by every object created from a device.
///
/// Holds the backend and the state every queue and command buffer needs, but none of the
/// queues themselves, so objects may keep a clone without forming a cycle.
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct LogicalDevice<B: Backend> {
    inner: Arc<LogicalDeviceInner<B>>,
}

impl<B: Backend> Clone for LogicalDevice<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B: Backend> PartialEq for LogicalDevice<B> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<B: Backend> Eq for LogicalDevice<B> {}

impl<B: Backend> LogicalDevice<B> {
    /// Core with every queue type on family 0
    pub fn new(backend: B, settings: RhiSettings) -> Self {
        Self::with_queue_families(backend, settings, QueueFamilySelection::shared(0))
    }

    pub fn with_queue_families(
        backend: B,
        settings: RhiSettings,
        families: QueueFamilySelection,
    ) -> Self {
        Self {
            inner: Arc::new(LogicalDeviceInner {
                backend,
                settings,
                families,
                resources: Mutex::new(ResourceRegistry::new()),
                fence_cache: FenceCache::new(),
                graveyard: Graveyard::new(),
                serial: AtomicU64::new(0),
            }),
        }
    }

    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    pub fn settings(&self) -> &RhiSettings {
        &self.inner.settings
    }

    pub fn queue_families(&self) -> &QueueFamilySelection {
        &self.inner.families
    }

    pub fn queue_family(&self, queue_type: QueueType) -> u32 {
        self.inner.families.family(queue_type)
    }

    /// Lock the resource registry.
    ///
    /// Hold the guard only for the duration of a transition, never across a blocking wait.
    pub fn resources(&self) -> Result<MutexGuard<'_, ResourceRegistry>, RhiError> {
        Ok(self.inner.resources.lock()?)
    }

    pub fn fence_cache(&self) -> &FenceCache {
        &self.inner.fence_cache
    }

    pub fn acquire_fence(&self) -> Result<Arc<PooledFence<B>>, RhiError> {
        Ok(Arc::new(PooledFence::new(self.clone())?))
    }

    pub fn graveyard(&self) -> &Graveyard<B> {
        &self.inner.graveyard
    }

    /// Reserve the serial of a new submission
    pub(crate) fn next_serial(&self) -> u64 {
        self.inner.serial.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Serial of the most recently reserved submission, 0 if none
    pub fn current_serial(&self) -> u64 {
        self.inner.serial.load(Ordering::Acquire)
    }
}
