use ash::vk;
use derivative::Derivative;

/// How the queue learns that submitted work has finished
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum SyncType {
    /// One pooled fence per submission
    #[default]
    Fence,
    /// Each submission signals an incrementing value on a per-queue timeline semaphore
    Semaphore,
    /// Every submission is followed by a blocking queue wait idle
    ForceWaitQueueIdle,
}

/// Per-kind descriptor quotas used to size every descriptor pool
#[derive(Derivative, Clone, Copy, PartialEq, Eq)]
#[derivative(Debug, Default)]
pub struct DescriptorLimits {
    #[derivative(Default(value = "2048"))]
    pub max_sets: u32,
    #[derivative(Default(value = "256"))]
    pub samplers: u32,
    #[derivative(Default(value = "2048"))]
    pub combined_image_samplers: u32,
    #[derivative(Default(value = "2048"))]
    pub sampled_images: u32,
    #[derivative(Default(value = "256"))]
    pub storage_images: u32,
    #[derivative(Default(value = "256"))]
    pub uniform_texel_buffers: u32,
    #[derivative(Default(value = "256"))]
    pub storage_texel_buffers: u32,
    #[derivative(Default(value = "1024"))]
    pub uniform_buffers: u32,
    #[derivative(Default(value = "1024"))]
    pub storage_buffers: u32,
    #[derivative(Default(value = "8"))]
    pub uniform_buffers_dynamic: u32,
    #[derivative(Default(value = "8"))]
    pub storage_buffers_dynamic: u32,
    #[derivative(Default(value = "64"))]
    pub input_attachments: u32,
}

impl DescriptorLimits {
    /// Pool sizes for every non-zero quota
    pub fn pool_sizes(&self) -> Vec<vk::DescriptorPoolSize> {
        [
            (vk::DescriptorType::SAMPLER, self.samplers),
            (
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                self.combined_image_samplers,
            ),
            (vk::DescriptorType::SAMPLED_IMAGE, self.sampled_images),
            (vk::DescriptorType::STORAGE_IMAGE, self.storage_images),
            (
                vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
                self.uniform_texel_buffers,
            ),
            (
                vk::DescriptorType::STORAGE_TEXEL_BUFFER,
                self.storage_texel_buffers,
            ),
            (vk::DescriptorType::UNIFORM_BUFFER, self.uniform_buffers),
            (vk::DescriptorType::STORAGE_BUFFER, self.storage_buffers),
            (
                vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                self.uniform_buffers_dynamic,
            ),
            (
                vk::DescriptorType::STORAGE_BUFFER_DYNAMIC,
                self.storage_buffers_dynamic,
            ),
            (vk::DescriptorType::INPUT_ATTACHMENT, self.input_attachments),
        ]
        .into_iter()
        .filter(|(_, count)| *count > 0)
        .map(|(ty, descriptor_count)| vk::DescriptorPoolSize {
            ty,
            descriptor_count,
        })
        .collect()
    }

    /// Clamp every quota to what the hardware reports for a single descriptor set.
    ///
    /// Only enforced in debug builds; release builds trust the configuration.
    pub fn clamp_to(self, limits: &vk::PhysicalDeviceLimits) -> Self {
        if !cfg!(debug_assertions) {
            return self;
        }
        let clamp = |name: &str, value: u32, max: u32| {
            if value > max {
                tracing::warn!(name, value, max, "Descriptor limit exceeds device maximum, clamping");
                max
            } else {
                value
            }
        };
        Self {
            max_sets: self.max_sets,
            samplers: clamp("samplers", self.samplers, limits.max_descriptor_set_samplers),
            combined_image_samplers: clamp(
                "combined_image_samplers",
                self.combined_image_samplers,
                limits
                    .max_descriptor_set_samplers
                    .min(limits.max_descriptor_set_sampled_images),
            ),
            sampled_images: clamp(
                "sampled_images",
                self.sampled_images,
                limits.max_descriptor_set_sampled_images,
            ),
            storage_images: clamp(
                "storage_images",
                self.storage_images,
                limits.max_descriptor_set_storage_images,
            ),
            uniform_texel_buffers: clamp(
                "uniform_texel_buffers",
                self.uniform_texel_buffers,
                limits.max_descriptor_set_sampled_images,
            ),
            storage_texel_buffers: clamp(
                "storage_texel_buffers",
                self.storage_texel_buffers,
                limits.max_descriptor_set_storage_images,
            ),
            uniform_buffers: clamp(
                "uniform_buffers",
                self.uniform_buffers,
                limits.max_descriptor_set_uniform_buffers,
            ),
            storage_buffers: clamp(
                "storage_buffers",
                self.storage_buffers,
                limits.max_descriptor_set_storage_buffers,
            ),
            uniform_buffers_dynamic: clamp(
                "uniform_buffers_dynamic",
                self.uniform_buffers_dynamic,
                limits.max_descriptor_set_uniform_buffers_dynamic,
            ),
            storage_buffers_dynamic: clamp(
                "storage_buffers_dynamic",
                self.storage_buffers_dynamic,
                limits.max_descriptor_set_storage_buffers_dynamic,
            ),
            input_attachments: clamp(
                "input_attachments",
                self.input_attachments,
                limits.max_descriptor_set_input_attachments,
            ),
        }
    }
}

fn default_thread_count() -> usize {
    std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1)
}

/// Device wide options
#[derive(Derivative, Clone)]
#[derivative(Debug, Default)]
pub struct RhiSettings {
    #[derivative(Default(value = "String::from(\"rhi\")"))]
    pub application_name: String,
    /// Enable the Khronos validation layer and debug utils
    pub validation: bool,
    pub sync_type: SyncType,
    /// Commit barriers after every transition instead of batching them until the next
    /// render pass or dispatch
    #[derivative(Default(value = "true"))]
    pub submit_barriers_immediately: bool,
    /// Request a compute family distinct from graphics
    #[derivative(Default(value = "true"))]
    pub enable_async_compute: bool,
    /// Request a transfer family distinct from graphics and compute
    #[derivative(Default(value = "true"))]
    pub enable_async_transfer: bool,
    /// Number of deferred recording contexts, one per render worker thread
    #[derivative(Default(value = "default_thread_count()"))]
    pub deferred_context_count: usize,
    pub descriptor_limits: DescriptorLimits,
}
