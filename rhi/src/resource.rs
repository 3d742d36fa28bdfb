//! Image and buffer records tracked by the device, addressed through generation checked handles.

use std::collections::{HashMap, HashSet};

use ash::vk;
use derivative::Derivative;

use crate::backend::Allocation;
use crate::queue::QueueType;
use crate::resource_state::{translate_state, ResourceState};
use crate::util::slot_map::{Slot, SlotMap};
use crate::RhiError;

pub type ImageHandle = Slot<ImageRecord>;
pub type BufferHandle = Slot<BufferRecord>;

#[derive(Derivative, Clone)]
#[derivative(Debug, Default)]
pub struct ImageDesc {
    #[derivative(Default(value = "String::from(\"NamelessImage\")"))]
    pub name: String,
    #[derivative(Default(value = "vk::ImageType::TYPE_2D"))]
    pub image_type: vk::ImageType,
    #[derivative(Default(value = "vk::Format::R8G8B8A8_UNORM"))]
    pub format: vk::Format,
    #[derivative(Default(value = "vk::Extent3D { width: 1, height: 1, depth: 1 }"))]
    pub extent: vk::Extent3D,
    #[derivative(Default(value = "1"))]
    pub mip_levels: u32,
    #[derivative(Default(value = "1"))]
    pub array_layers: u32,
    #[derivative(Default(value = "vk::SampleCountFlags::TYPE_1"))]
    pub samples: vk::SampleCountFlags,
    pub usage: vk::ImageUsageFlags,
    #[derivative(Default(value = "vk::ImageAspectFlags::COLOR"))]
    pub aspect: vk::ImageAspectFlags,
    /// State the image is created in
    pub initial_state: ResourceState,
    /// State transfer helpers return the image to once they are done with it
    pub required_state: Option<ResourceState>,
    /// Queue the image is released back to after being used on another queue family
    #[derivative(Default(value = "QueueType::Graphics"))]
    pub owner_queue: QueueType,
}

impl ImageDesc {
    pub fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect,
            base_mip_level: 0,
            level_count: self.mip_levels,
            base_array_layer: 0,
            layer_count: self.array_layers,
        }
    }
}

#[derive(Derivative, Clone)]
#[derivative(Debug, Default)]
pub struct BufferDesc {
    #[derivative(Default(value = "String::from(\"NamelessBuffer\")"))]
    pub name: String,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    /// Whether the memory backing the buffer must be host visible
    pub host_visible: bool,
    pub initial_state: ResourceState,
    pub required_state: Option<ResourceState>,
    #[derivative(Default(value = "QueueType::Graphics"))]
    pub owner_queue: QueueType,
}

/// Who destroys the native object once the record is removed
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Ownership {
    /// Created and freed by the device
    Owned,
    /// Lifetime managed elsewhere, e.g. swapchain images
    External,
}

/// Queue family ownership of an exclusive resource
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct FamilyOwnership {
    /// Family that last used the resource, `None` until first use
    pub owner: Option<u32>,
    /// Family a recorded release barrier hands the resource to
    pub released_to: Option<u32>,
}

#[derive(Debug)]
pub struct ImageRecord {
    pub(crate) raw: vk::Image,
    pub(crate) allocation: Option<Allocation>,
    pub(crate) desc: ImageDesc,
    pub(crate) ownership: Ownership,
    pub(crate) current_state: ResourceState,
    pub(crate) layout: vk::ImageLayout,
    pub(crate) family: FamilyOwnership,
}

impl ImageRecord {
    pub fn new(
        raw: vk::Image,
        allocation: Option<Allocation>,
        desc: ImageDesc,
        ownership: Ownership,
    ) -> Self {
        let current_state = desc.initial_state;
        Self {
            raw,
            allocation,
            layout: translate_state(current_state).layout,
            desc,
            ownership,
            current_state,
            family: FamilyOwnership::default(),
        }
    }

    pub fn raw(&self) -> vk::Image {
        self.raw
    }

    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    pub fn name(&self) -> &str {
        &self.desc.name
    }

    pub fn current_state(&self) -> ResourceState {
        self.current_state
    }

    pub fn required_state(&self) -> Option<ResourceState> {
        self.desc.required_state
    }

    /// Layout the image will be in once every recorded barrier has executed
    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    pub fn set_image_layout(&mut self, layout: vk::ImageLayout) {
        self.layout = layout;
    }

    pub fn full_range(&self) -> vk::ImageSubresourceRange {
        self.desc.full_range()
    }

    pub fn family_ownership(&self) -> FamilyOwnership {
        self.family
    }
}

#[derive(Debug)]
pub struct BufferRecord {
    pub(crate) raw: vk::Buffer,
    pub(crate) allocation: Option<Allocation>,
    pub(crate) desc: BufferDesc,
    pub(crate) ownership: Ownership,
    pub(crate) current_state: ResourceState,
    pub(crate) family: FamilyOwnership,
}

impl BufferRecord {
    pub fn new(
        raw: vk::Buffer,
        allocation: Option<Allocation>,
        desc: BufferDesc,
        ownership: Ownership,
    ) -> Self {
        Self {
            raw,
            allocation,
            current_state: desc.initial_state,
            desc,
            ownership,
            family: FamilyOwnership::default(),
        }
    }

    pub fn raw(&self) -> vk::Buffer {
        self.raw
    }

    pub fn desc(&self) -> &BufferDesc {
        &self.desc
    }

    pub fn name(&self) -> &str {
        &self.desc.name
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.desc.size
    }

    pub fn current_state(&self) -> ResourceState {
        self.current_state
    }

    pub fn required_state(&self) -> Option<ResourceState> {
        self.desc.required_state
    }

    pub fn family_ownership(&self) -> FamilyOwnership {
        self.family
    }

    /// Mapped pointer of host visible memory
    pub fn mapped_ptr(&self) -> Option<std::ptr::NonNull<std::ffi::c_void>> {
        self.allocation.as_ref().and_then(|allocation| allocation.mapped_ptr())
    }
}

/// Anything a recorded command buffer may reference after its owner lets go of it
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ResourceKey {
    Image(ImageHandle),
    Buffer(BufferHandle),
    DescriptorPool(vk::DescriptorPool),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct ResourceUsage {
    /// Command buffers recording a reference that have not been submitted or reset yet
    pub recording: u32,
    /// Highest serial of a submission referencing the resource
    pub last_submission: u64,
}

/// Resources referenced by one command buffer since it began recording
#[derive(Debug, Default)]
pub struct TrackedResources {
    keys: HashSet<ResourceKey>,
}

impl TrackedResources {
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn contains(&self, key: ResourceKey) -> bool {
        self.keys.contains(&key)
    }

    pub fn iter(&self) -> impl Iterator<Item = ResourceKey> + '_ {
        self.keys.iter().copied()
    }
}

/// All images and buffers known to a device.
///
/// Not synchronized on its own; the device keeps it behind a mutex. Transitions of a resource
/// shared between threads must still be ordered by the caller.
#[derive(Debug, Default)]
pub struct ResourceRegistry {
    images: SlotMap<ImageRecord>,
    buffers: SlotMap<BufferRecord>,
    usage: HashMap<ResourceKey, ResourceUsage>,
    /// Sets handed out by the descriptor allocator and the pool they came from
    descriptor_sets: HashMap<vk::DescriptorSet, vk::DescriptorPool>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_image(&mut self, record: ImageRecord) -> ImageHandle {
        self.images.insert(record)
    }

    pub fn insert_buffer(&mut self, record: BufferRecord) -> BufferHandle {
        self.buffers.insert(record)
    }

    pub fn image(&self, handle: ImageHandle) -> Result<&ImageRecord, RhiError> {
        self.images.get(&handle)
    }

    pub fn image_mut(&mut self, handle: ImageHandle) -> Result<&mut ImageRecord, RhiError> {
        self.images.get_mut(&handle)
    }

    pub fn buffer(&self, handle: BufferHandle) -> Result<&BufferRecord, RhiError> {
        self.buffers.get(&handle)
    }

    pub fn buffer_mut(&mut self, handle: BufferHandle) -> Result<&mut BufferRecord, RhiError> {
        self.buffers.get_mut(&handle)
    }

    pub fn remove_image(&mut self, handle: ImageHandle) -> Result<ImageRecord, RhiError> {
        self.images.erase(handle)
    }

    pub fn remove_buffer(&mut self, handle: BufferHandle) -> Result<BufferRecord, RhiError> {
        self.buffers.erase(handle)
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Removes every record, for device teardown
    pub(crate) fn drain(&mut self) -> (Vec<ImageRecord>, Vec<BufferRecord>) {
        let images = std::mem::take(&mut self.images);
        let buffers = std::mem::take(&mut self.buffers);
        self.usage.clear();
        self.descriptor_sets.clear();
        (images.into_data(), buffers.into_data())
    }

    /// Count `key` as referenced by the command buffer owning `tracked`, once per buffer
    pub(crate) fn track(&mut self, key: ResourceKey, tracked: &mut TrackedResources) {
        if tracked.keys.insert(key) {
            self.usage.entry(key).or_default().recording += 1;
        }
    }

    pub(crate) fn track_image(
        &mut self,
        image: ImageHandle,
        tracked: &mut TrackedResources,
    ) -> Result<(), RhiError> {
        self.images.get(&image)?;
        self.track(ResourceKey::Image(image), tracked);
        Ok(())
    }

    pub(crate) fn track_buffer(
        &mut self,
        buffer: BufferHandle,
        tracked: &mut TrackedResources,
    ) -> Result<(), RhiError> {
        self.buffers.get(&buffer)?;
        self.track(ResourceKey::Buffer(buffer), tracked);
        Ok(())
    }

    /// Track the pools `sets` were allocated from. Sets not handed out by the descriptor
    /// allocator are ignored.
    pub(crate) fn track_descriptor_sets(
        &mut self,
        sets: &[vk::DescriptorSet],
        tracked: &mut TrackedResources,
    ) {
        for set in sets {
            if let Some(pool) = self.descriptor_sets.get(set).copied() {
                self.track(ResourceKey::DescriptorPool(pool), tracked);
            }
        }
    }

    pub(crate) fn register_descriptor_set(
        &mut self,
        set: vk::DescriptorSet,
        pool: vk::DescriptorPool,
    ) {
        self.descriptor_sets.insert(set, pool);
    }

    /// Drop every set of a pool that was just reset
    pub(crate) fn forget_descriptor_pool(&mut self, pool: vk::DescriptorPool) {
        self.descriptor_sets.retain(|_, owner| *owner != pool);
        self.usage.remove(&ResourceKey::DescriptorPool(pool));
    }

    /// Stop counting the references in `tracked`, stamping them with `submitted` when the
    /// command buffer went to the GPU. Returns the keys no recording buffer references anymore.
    pub(crate) fn release(
        &mut self,
        tracked: &mut TrackedResources,
        submitted: Option<u64>,
    ) -> Vec<ResourceKey> {
        let mut idle = Vec::new();
        for key in tracked.keys.drain() {
            let Some(usage) = self.usage.get_mut(&key) else {
                continue;
            };
            usage.recording = usage.recording.saturating_sub(1);
            if let Some(serial) = submitted {
                usage.last_submission = usage.last_submission.max(serial);
            }
            if usage.recording == 0 {
                idle.push(key);
            }
        }
        idle
    }

    pub fn usage(&self, key: ResourceKey) -> Option<ResourceUsage> {
        self.usage.get(&key).copied()
    }

    /// No recording buffer references `key` and its last submission is at or below `watermark`
    pub fn is_idle(&self, key: ResourceKey, watermark: u64) -> bool {
        self.usage(key)
            .map_or(true, |usage| usage.recording == 0 && usage.last_submission <= watermark)
    }

    pub(crate) fn forget(&mut self, key: ResourceKey) -> Option<ResourceUsage> {
        self.usage.remove(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn initial_state_sets_layout() {
        let desc = ImageDesc {
            initial_state: ResourceState::SHADER_RESOURCE,
            ..Default::default()
        };
        let record = ImageRecord::new(
            vk::Image::from_raw(7),
            None,
            desc,
            Ownership::Owned,
        );
        assert_eq!(record.layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(record.current_state(), ResourceState::SHADER_RESOURCE);
        assert_eq!(record.full_range().level_count, 1);
    }

    #[test]
    fn removed_image_handle_is_stale() {
        let mut registry = ResourceRegistry::new();
        let handle = registry.insert_image(ImageRecord::new(
            vk::Image::from_raw(1),
            None,
            ImageDesc::default(),
            Ownership::External,
        ));
        assert_eq!(registry.image(handle).unwrap().raw(), vk::Image::from_raw(1));
        let removed = registry.remove_image(handle).unwrap();
        assert_eq!(removed.ownership, Ownership::External);
        assert_eq!(registry.image(handle).err(), Some(RhiError::InvalidHandle));
        assert_eq!(registry.image_count(), 0);
    }

    #[test]
    fn tracking_counts_each_buffer_once() {
        let mut registry = ResourceRegistry::new();
        let handle = registry.insert_image(ImageRecord::new(
            vk::Image::from_raw(1),
            None,
            ImageDesc::default(),
            Ownership::Owned,
        ));
        let key = ResourceKey::Image(handle);
        let mut first = TrackedResources::default();
        let mut second = TrackedResources::default();
        registry.track_image(handle, &mut first).unwrap();
        registry.track_image(handle, &mut first).unwrap();
        registry.track_image(handle, &mut second).unwrap();
        assert_eq!(registry.usage(key).unwrap().recording, 2);
        assert!(!registry.is_idle(key, u64::MAX));

        assert!(registry.release(&mut first, Some(4)).is_empty());
        assert!(first.is_empty());
        assert_eq!(registry.release(&mut second, None), vec![key]);
        let usage = registry.usage(key).unwrap();
        assert_eq!(usage, ResourceUsage { recording: 0, last_submission: 4 });
        assert!(!registry.is_idle(key, 3));
        assert!(registry.is_idle(key, 4));
    }

    #[test]
    fn descriptor_sets_track_their_pool() {
        let mut registry = ResourceRegistry::new();
        let pool = vk::DescriptorPool::from_raw(9);
        registry.register_descriptor_set(vk::DescriptorSet::from_raw(10), pool);
        let mut tracked = TrackedResources::default();
        registry.track_descriptor_sets(
            &[vk::DescriptorSet::from_raw(10), vk::DescriptorSet::from_raw(11)],
            &mut tracked,
        );
        assert_eq!(tracked.len(), 1);
        assert!(tracked.contains(ResourceKey::DescriptorPool(pool)));

        registry.release(&mut tracked, Some(2));
        registry.forget_descriptor_pool(pool);
        assert_eq!(registry.usage(ResourceKey::DescriptorPool(pool)), None);
        registry.track_descriptor_sets(&[vk::DescriptorSet::from_raw(10)], &mut tracked);
        assert!(tracked.is_empty());
    }
}
