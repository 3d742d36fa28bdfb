//! Deferred destruction of native objects still referenced by in-flight submissions.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::backend::Backend;
use crate::resource::ResourceKey;
use crate::RhiError;

type Burial<B> = Box<dyn FnOnce(&B) + Send>;

struct Plots<B: Backend> {
    buried: VecDeque<(u64, Burial<B>)>,
    /// Destroyed while a recording command buffer still references them, no serial yet
    held: HashMap<ResourceKey, Burial<B>>,
}

/// Destructors waiting for the GPU to finish with the object they destroy.
///
/// Each entry is stamped with the submission serial current at the time it was buried. Serials
/// are handed out in increasing order, so entries are stored and collected in order. Objects
/// still referenced by a command buffer that has not been submitted are held back until that
/// buffer is submitted or reset.
pub struct Graveyard<B: Backend> {
    plots: Mutex<Plots<B>>,
}

impl<B: Backend> Default for Graveyard<B> {
    fn default() -> Self {
        Self {
            plots: Mutex::new(Plots {
                buried: VecDeque::new(),
                held: HashMap::new(),
            }),
        }
    }
}

impl<B: Backend> std::fmt::Debug for Graveyard<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graveyard")
            .field("len", &self.len())
            .finish()
    }
}

impl<B: Backend> Graveyard<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `destroy` to run once every submission up to `serial` has completed
    pub fn bury<F>(&self, serial: u64, destroy: F) -> Result<(), RhiError>
    where
        F: FnOnce(&B) + Send + 'static,
    {
        let mut plots = self.plots.lock()?;
        Self::insert(&mut plots.buried, serial, Box::new(destroy));
        Ok(())
    }

    fn insert(buried: &mut VecDeque<(u64, Burial<B>)>, serial: u64, destroy: Burial<B>) {
        // serials are taken before the lock, keep the queue sorted if two threads raced
        let position = buried.partition_point(|(stamp, _)| *stamp <= serial);
        buried.insert(position, (serial, destroy));
    }

    /// Keep `destroy` until [`Graveyard::release`] gives it the serial of the last submission
    /// referencing `key`
    pub fn hold<F>(&self, key: ResourceKey, destroy: F) -> Result<(), RhiError>
    where
        F: FnOnce(&B) + Send + 'static,
    {
        self.plots.lock()?.held.insert(key, Box::new(destroy));
        Ok(())
    }

    /// Bury the destructor held for `key` at `serial`. Returns `false` if nothing was held.
    pub fn release(&self, key: ResourceKey, serial: u64) -> Result<bool, RhiError> {
        let mut plots = self.plots.lock()?;
        match plots.held.remove(&key) {
            Some(destroy) => {
                tracing::trace!(?key, serial, "Released held resource");
                Self::insert(&mut plots.buried, serial, destroy);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn held_count(&self) -> usize {
        self.plots.lock().map(|plots| plots.held.len()).unwrap_or(0)
    }

    /// Run every destructor whose serial is at or below `watermark`
    pub fn collect(&self, watermark: u64, backend: &B) -> Result<usize, RhiError> {
        let ready: Vec<Burial<B>> = {
            let mut plots = self.plots.lock()?;
            let count = plots.buried.partition_point(|(stamp, _)| *stamp <= watermark);
            plots.buried.drain(..count).map(|(_, destroy)| destroy).collect()
        };
        let count = ready.len();
        for destroy in ready {
            destroy(backend);
        }
        if count > 0 {
            tracing::trace!(count, watermark, "Collected graveyard");
        }
        Ok(count)
    }

    /// Run every destructor regardless of serial. Only valid once the device is idle.
    pub fn flush(&self, backend: &B) -> usize {
        let (buried, held) = match self.plots.lock() {
            Ok(mut plots) => (
                std::mem::take(&mut plots.buried),
                std::mem::take(&mut plots.held),
            ),
            Err(_) => {
                tracing::error!("Graveyard poisoned, leaking buried objects");
                return 0;
            }
        };
        let count = buried.len() + held.len();
        for destroy in buried.into_iter().map(|(_, destroy)| destroy).chain(held.into_values()) {
            destroy(backend);
        }
        count
    }

    /// Buried and held destructors
    pub fn len(&self) -> usize {
        self.plots
            .lock()
            .map(|plots| plots.buried.len() + plots.held.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
