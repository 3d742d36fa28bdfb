use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Context;
use ash::vk;
use derivative::Derivative;
#[cfg(feature = "log-lifetimes")]
use tracing::trace;

use super::LogicalDevice;
use crate::backend::{Backend, Platform, SemaphoreKind};
use crate::bootstrap::{select_adapter, select_queue_families, AdapterInfo, QueueFamilySelection};
use crate::command::{CommandBuffer, CommandContext};
use crate::descriptor::DescriptorAllocator;
use crate::queue::{Queue, QueueType};
use crate::resource::{
    BufferDesc, BufferHandle, BufferRecord, ImageDesc, ImageHandle, ImageRecord, Ownership,
    ResourceKey, ResourceRegistry,
};
use crate::settings::RhiSettings;
use crate::sync::{Event, Semaphore};
use crate::RhiError;

/// Top level GPU context.
///
/// Constructed once at startup and passed to whatever records or submits work. Owns one queue
/// wrapper per logical queue type (shared when the types fall back onto the same family), one
/// immediate context per type and a pool of deferred contexts for worker threads.
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct Device<B: Backend> {
    adapter: AdapterInfo,
    families: QueueFamilySelection,
    graphics_queue: Arc<Queue<B>>,
    compute_queue: Arc<Queue<B>>,
    transfer_queue: Arc<Queue<B>>,
    graphics_context: Mutex<CommandContext<B>>,
    compute_context: Mutex<CommandContext<B>>,
    transfer_context: Mutex<CommandContext<B>>,
    deferred_contexts: Mutex<Vec<CommandContext<B>>>,
    descriptors: DescriptorAllocator<B>,
    logical: LogicalDevice<B>,
}

impl<B: Backend> Device<B> {
    pub fn new<P: Platform<Backend = B>>(platform: &P, settings: RhiSettings) -> anyhow::Result<Self> {
        let mut adapters = platform
            .adapters()
            .context("Failed to enumerate adapters")?;
        let index = select_adapter(&adapters)?;
        let adapter = adapters.swap_remove(index);
        let families = select_queue_families(&adapter, &settings)?;

        let mut settings = settings;
        settings.descriptor_limits = settings.descriptor_limits.clamp_to(&adapter.limits);

        let backend = platform
            .open(&adapter, &families.unique_families())
            .with_context(|| format!("Failed to open device on {}", adapter.name))?;
        let (major, minor, patch) = adapter.version();
        tracing::info!(
            adapter = %adapter.name,
            device_type = ?adapter.device_type,
            api = %format!("{major}.{minor}.{patch}"),
            ?families,
            sync_type = ?settings.sync_type,
            "Opened device"
        );

        let deferred_count = settings.deferred_context_count;
        let descriptor_limits = settings.descriptor_limits;
        let logical = LogicalDevice::with_queue_families(backend, settings, families);

        // one wrapper per native queue, types falling back onto a family share it
        let mut queues: HashMap<u32, Arc<Queue<B>>> = HashMap::new();
        for queue_type in QueueType::ALL {
            let family = families.family(queue_type);
            if let Entry::Vacant(entry) = queues.entry(family) {
                entry.insert(Arc::new(Queue::new(logical.clone(), queue_type, family)?));
            }
        }
        let queue = |queue_type: QueueType| -> anyhow::Result<Arc<Queue<B>>> {
            queues
                .get(&families.family(queue_type))
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("No queue created for {queue_type:?}"))
        };
        let graphics_queue = queue(QueueType::Graphics)?;
        let compute_queue = queue(QueueType::Compute)?;
        let transfer_queue = queue(QueueType::Transfer)?;

        let deferred_contexts = (0..deferred_count)
            .map(|_| CommandContext::new(graphics_queue.clone()))
            .collect();

        Ok(Self {
            graphics_context: Mutex::new(CommandContext::new(graphics_queue.clone())),
            compute_context: Mutex::new(CommandContext::new(compute_queue.clone())),
            transfer_context: Mutex::new(CommandContext::new(transfer_queue.clone())),
            deferred_contexts: Mutex::new(deferred_contexts),
            descriptors: DescriptorAllocator::new(logical.clone(), descriptor_limits),
            adapter,
            families,
            graphics_queue,
            compute_queue,
            transfer_queue,
            logical,
        })
    }

    pub fn logical(&self) -> &LogicalDevice<B> {
        &self.logical
    }

    pub fn backend(&self) -> &B {
        self.logical.backend()
    }

    pub fn settings(&self) -> &RhiSettings {
        self.logical.settings()
    }

    pub fn adapter(&self) -> &AdapterInfo {
        &self.adapter
    }

    pub fn queue_families(&self) -> &QueueFamilySelection {
        &self.families
    }

    pub fn queue(&self, queue_type: QueueType) -> &Arc<Queue<B>> {
        match queue_type {
            QueueType::Graphics => &self.graphics_queue,
            QueueType::Compute => &self.compute_queue,
            QueueType::Transfer => &self.transfer_queue,
        }
    }

    /// Every distinct queue wrapper
    fn unique_queues(&self) -> Vec<&Arc<Queue<B>>> {
        let mut queues: Vec<&Arc<Queue<B>>> = Vec::with_capacity(3);
        for queue_type in QueueType::ALL {
            let queue = self.queue(queue_type);
            if !queues.iter().any(|known| Arc::ptr_eq(known, queue)) {
                queues.push(queue);
            }
        }
        queues
    }

    pub fn resources(&self) -> Result<MutexGuard<'_, ResourceRegistry>, RhiError> {
        self.logical.resources()
    }

    pub fn create_image(&self, desc: ImageDesc) -> Result<ImageHandle, RhiError> {
        let (raw, allocation) = self.backend().create_image(&desc)?;

        #[cfg(feature = "log-lifetimes")]
        trace!("Creating VkImage {:?} ({})", raw, desc.name);

        Ok(self
            .resources()?
            .insert_image(ImageRecord::new(raw, allocation, desc, Ownership::Owned)))
    }

    pub fn create_buffer(&self, desc: BufferDesc) -> Result<BufferHandle, RhiError> {
        let (raw, allocation) = self.backend().create_buffer(&desc)?;

        #[cfg(feature = "log-lifetimes")]
        trace!("Creating VkBuffer {:?} ({})", raw, desc.name);

        Ok(self
            .resources()?
            .insert_buffer(BufferRecord::new(raw, allocation, desc, Ownership::Owned)))
    }

    /// Track an image whose lifetime is managed elsewhere, e.g. a swapchain image
    pub fn import_image(&self, raw: vk::Image, desc: ImageDesc) -> Result<ImageHandle, RhiError> {
        Ok(self.resources()?.insert_image(ImageRecord::new(
            raw,
            None,
            desc,
            Ownership::External,
        )))
    }

    pub fn import_buffer(
        &self,
        raw: vk::Buffer,
        desc: BufferDesc,
    ) -> Result<BufferHandle, RhiError> {
        Ok(self.resources()?.insert_buffer(BufferRecord::new(
            raw,
            None,
            desc,
            Ownership::External,
        )))
    }

    /// Stop tracking `image`. An owned image is destroyed once every submission made so far
    /// has completed. If a command buffer that has not been submitted yet references it,
    /// destruction waits for that buffer to be submitted or reset.
    pub fn destroy_image(&self, image: ImageHandle) -> Result<(), RhiError> {
        let mut resources = self.resources()?;
        let record = resources.remove_image(image)?;
        let key = ResourceKey::Image(image);
        if record.ownership == Ownership::External {
            resources.forget(key);
            return Ok(());
        }
        let (raw, allocation) = (record.raw, record.allocation);
        self.entomb(&mut resources, key, move |backend: &B| {
            #[cfg(feature = "log-lifetimes")]
            trace!("Destroying VkImage {:?}", raw);

            backend.destroy_image(raw, allocation);
        })
    }

    pub fn destroy_buffer(&self, buffer: BufferHandle) -> Result<(), RhiError> {
        let mut resources = self.resources()?;
        let record = resources.remove_buffer(buffer)?;
        let key = ResourceKey::Buffer(buffer);
        if record.ownership == Ownership::External {
            resources.forget(key);
            return Ok(());
        }
        let (raw, allocation) = (record.raw, record.allocation);
        self.entomb(&mut resources, key, move |backend: &B| {
            #[cfg(feature = "log-lifetimes")]
            trace!("Destroying VkBuffer {:?}", raw);

            backend.destroy_buffer(raw, allocation);
        })
    }

    /// Hand `destroy` to the graveyard, held back while a recording command buffer references
    /// `key`
    fn entomb<F>(
        &self,
        resources: &mut ResourceRegistry,
        key: ResourceKey,
        destroy: F,
    ) -> Result<(), RhiError>
    where
        F: FnOnce(&B) + Send + 'static,
    {
        let graveyard = self.logical.graveyard();
        match resources.usage(key) {
            Some(usage) if usage.recording > 0 => {
                tracing::debug!(?key, recording = usage.recording, "Holding resource until submission");
                graveyard.hold(key, destroy)
            }
            usage => {
                resources.forget(key);
                let serial = usage.map_or(0, |usage| usage.last_submission);
                graveyard.bury(serial.max(self.logical.current_serial()), destroy)
            }
        }
    }

    pub fn create_event(&self) -> Result<Event<B>, RhiError> {
        Event::new(self.logical.clone())
    }

    pub fn create_semaphore(&self, kind: SemaphoreKind) -> Result<Semaphore<B>, RhiError> {
        Semaphore::new(self.logical.clone(), kind)
    }

    pub fn allocate_descriptor_set(
        &self,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet, RhiError> {
        self.descriptors.allocate(layout)
    }

    pub fn descriptor_allocator(&self) -> &DescriptorAllocator<B> {
        &self.descriptors
    }

    /// Submit each command buffer on the queue of its type.
    ///
    /// Buffers of one type go out as a single batch, batches are made in the order their type
    /// first appears. Returns the serial of every batch.
    pub fn submit_command_buffers(
        &self,
        command_buffers: Vec<CommandBuffer<B>>,
    ) -> Result<Vec<u64>, RhiError> {
        let mut batches: Vec<(QueueType, Vec<CommandBuffer<B>>)> = Vec::new();
        for command_buffer in command_buffers {
            let queue_type = command_buffer.queue_type();
            match batches.iter_mut().find(|(batch_type, _)| *batch_type == queue_type) {
                Some((_, batch)) => batch.push(command_buffer),
                None => batches.push((queue_type, vec![command_buffer])),
            }
        }
        batches
            .into_iter()
            .map(|(queue_type, batch)| self.queue(queue_type).submit(batch))
            .collect()
    }

    /// Recycle finished command buffers on every queue
    pub fn sync_all(&self) -> Result<usize, RhiError> {
        self.unique_queues()
            .into_iter()
            .try_fold(0, |recycled, queue| Ok(recycled + queue.sync()?))
    }

    /// Highest serial known to be complete on every queue
    pub fn completed_watermark(&self) -> Result<u64, RhiError> {
        // read first, anything submitted later has a higher serial
        let current = self.logical.current_serial();
        let mut watermark = current;
        for queue in self.unique_queues() {
            if let Some(completed) = queue.completed_watermark()? {
                watermark = watermark.min(completed);
            }
        }
        Ok(watermark)
    }

    /// Recycle finished work, then run every deferred destruction the GPU no longer blocks.
    ///
    /// Call between frames: anything destroyed while still bound in an unsubmitted command
    /// buffer is not protected.
    pub fn collect_garbage(&self) -> Result<usize, RhiError> {
        self.sync_all()?;
        let watermark = self.completed_watermark()?;
        let destroyed = self.logical.graveyard().collect(watermark, self.backend())?;
        let recycled = self.descriptors.recycle(watermark)?;
        Ok(destroyed + recycled)
    }

    /// Block until the GPU is idle, then recycle and collect everything
    pub fn wait_idle(&self) -> Result<(), RhiError> {
        self.backend().device_wait_idle()?;
        self.collect_garbage()?;
        Ok(())
    }

    pub fn immediate_context(
        &self,
        queue_type: QueueType,
    ) -> Result<MutexGuard<'_, CommandContext<B>>, RhiError> {
        let context = match queue_type {
            QueueType::Graphics => &self.graphics_context,
            QueueType::Compute => &self.compute_context,
            QueueType::Transfer => &self.transfer_context,
        };
        Ok(context.lock()?)
    }

    /// Take a deferred context for a worker thread, creating one if the pool ran dry
    pub fn acquire_deferred_context(&self) -> Result<CommandContext<B>, RhiError> {
        let mut contexts = self.deferred_contexts.lock()?;
        Ok(match contexts.pop() {
            Some(context) => context,
            None => {
                tracing::debug!("Deferred context pool exhausted, creating another");
                CommandContext::new(self.graphics_queue.clone())
            }
        })
    }

    /// Give a deferred context back. Anything still recorded in it is submitted.
    pub fn release_deferred_context(&self, mut context: CommandContext<B>) -> Result<(), RhiError> {
        context.flush()?;
        self.deferred_contexts.lock()?.push(context);
        Ok(())
    }

    pub fn deferred_context_count(&self) -> usize {
        self.deferred_contexts
            .lock()
            .map(|contexts| contexts.len())
            .unwrap_or(0)
    }

    /// Record with `record` on the immediate context of `queue_type`, submit and wait for the
    /// GPU to finish. A failed recording is discarded without being submitted.
    pub fn immediate_submit<F>(&self, queue_type: QueueType, record: F) -> Result<Option<u64>, RhiError>
    where
        F: FnOnce(&mut CommandBuffer<B>) -> Result<(), RhiError>,
    {
        let mut context = self.immediate_context(queue_type)?;
        if let Err(err) = record(context.command_buffer()?) {
            if let Some(command_buffer) = context.take() {
                context.queue().discard(command_buffer)?;
            }
            return Err(err);
        }
        context.flush_and_wait()
    }
}

impl<B: Backend> Drop for Device<B> {
    fn drop(&mut self) {
        for context in [
            &self.graphics_context,
            &self.compute_context,
            &self.transfer_context,
        ] {
            if let Ok(mut context) = context.lock() {
                if let Err(err) = context.flush() {
                    tracing::error!(?err, "Failed to flush immediate context");
                }
            }
        }
        if let Err(err) = self.wait_idle() {
            tracing::error!(?err, "Failed to wait for device idle");
        }
        let remaining = self.logical.graveyard().flush(self.backend());
        if remaining > 0 {
            tracing::debug!(remaining, "Flushed graveyard");
        }
    }
}
