//! Batched pipeline barriers built from resource state transitions.

use ash::vk;

use crate::resource::{BufferRecord, ImageRecord};
use crate::resource_state::{
    translate_state, validate_buffer_state, validate_image_state, ResourceState,
};
use crate::RhiError;

#[derive(Debug, Clone, Copy)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub range: vk::ImageSubresourceRange,
    /// `vk::QUEUE_FAMILY_IGNORED` unless the barrier transfers queue family ownership
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct BufferBarrier {
    pub buffer: vk::Buffer,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlobalBarrier {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
}

/// Everything a single native barrier command carries
#[derive(Debug, Clone, Default)]
pub struct PipelineBarrier {
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub memory: Option<GlobalBarrier>,
    pub buffers: Vec<BufferBarrier>,
    pub images: Vec<ImageBarrier>,
}

/// One half of queue family ownership transfers, keyed by the stage on this queue's side
#[derive(Debug, Default)]
struct OwnershipTransfers {
    stage: vk::PipelineStageFlags,
    buffers: Vec<BufferBarrier>,
    images: Vec<ImageBarrier>,
}

impl OwnershipTransfers {
    fn is_empty(&self) -> bool {
        self.buffers.is_empty() && self.images.is_empty()
    }

    fn take(
        &mut self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    ) -> Option<PipelineBarrier> {
        if self.is_empty() {
            return None;
        }
        self.stage = vk::PipelineStageFlags::empty();
        Some(PipelineBarrier {
            src_stage,
            dst_stage,
            memory: None,
            buffers: std::mem::take(&mut self.buffers),
            images: std::mem::take(&mut self.images),
        })
    }
}

fn or_default_stage(
    stage: vk::PipelineStageFlags,
    default: vk::PipelineStageFlags,
) -> vk::PipelineStageFlags {
    if stage.is_empty() {
        default
    } else {
        stage
    }
}

/// Accumulates transitions until they are taken out as one [`PipelineBarrier`].
///
/// Transitions update the resource record immediately, so the record always reflects the state
/// the resource will be in once the batch executes. Queue family ownership transfers are kept
/// apart, acquires execute before the transitions and releases after them.
#[derive(Debug, Default)]
pub struct BarrierBatch {
    src_stage: vk::PipelineStageFlags,
    dst_stage: vk::PipelineStageFlags,
    memory: Option<GlobalBarrier>,
    buffers: Vec<BufferBarrier>,
    images: Vec<ImageBarrier>,
    acquire: OwnershipTransfers,
    release: OwnershipTransfers,
}

impl BarrierBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_none()
            && self.buffers.is_empty()
            && self.images.is_empty()
            && self.acquire.is_empty()
            && self.release.is_empty()
    }

    /// Queue a transition of `range` of the image to `dst`.
    ///
    /// Returns `false` without touching anything if the image is already in `dst`.
    pub fn transition_image(
        &mut self,
        image: &mut ImageRecord,
        dst: ResourceState,
        range: vk::ImageSubresourceRange,
    ) -> Result<bool, RhiError> {
        let src = image.current_state;
        if src == dst {
            return Ok(false);
        }
        validate_image_state(src)?;
        validate_image_state(dst)?;
        let src_translation = translate_state(src);
        let dst_translation = translate_state(dst);
        // images cannot be transitioned into UNDEFINED
        let new_layout = match dst_translation.layout {
            vk::ImageLayout::UNDEFINED => vk::ImageLayout::GENERAL,
            layout => layout,
        };

        self.src_stage |= src_translation.stage;
        self.dst_stage |= dst_translation.stage;
        self.images.push(ImageBarrier {
            image: image.raw,
            src_access: src_translation.access,
            dst_access: dst_translation.access,
            old_layout: image.layout,
            new_layout,
            range,
            src_queue_family: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family: vk::QUEUE_FAMILY_IGNORED,
        });

        tracing::trace!(
            image = image.name(),
            ?src,
            ?dst,
            ?new_layout,
            "Queued image transition"
        );
        image.current_state = dst;
        image.set_image_layout(new_layout);
        Ok(true)
    }

    /// Queue a whole-buffer transition to `dst`. No-op if already in `dst`.
    pub fn transition_buffer(
        &mut self,
        buffer: &mut BufferRecord,
        dst: ResourceState,
    ) -> Result<bool, RhiError> {
        let src = buffer.current_state;
        if src == dst {
            return Ok(false);
        }
        validate_buffer_state(src)?;
        validate_buffer_state(dst)?;
        let src_translation = translate_state(src);
        let dst_translation = translate_state(dst);

        self.src_stage |= src_translation.stage;
        self.dst_stage |= dst_translation.stage;
        self.buffers.push(BufferBarrier {
            buffer: buffer.raw,
            src_access: src_translation.access,
            dst_access: dst_translation.access,
            offset: 0,
            size: vk::WHOLE_SIZE,
            src_queue_family: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family: vk::QUEUE_FAMILY_IGNORED,
        });

        tracing::trace!(buffer = buffer.name(), ?src, ?dst, "Queued buffer transition");
        buffer.current_state = dst;
        Ok(true)
    }

    /// Queue an execution and memory dependency between two usages without any layout change,
    /// e.g. ordering two unordered access dispatches.
    pub fn memory_barrier(&mut self, src: ResourceState, dst: ResourceState) {
        let src_translation = translate_state(src);
        let dst_translation = translate_state(dst);
        self.src_stage |= src_translation.stage;
        self.dst_stage |= dst_translation.stage;
        let global = self.memory.get_or_insert_with(GlobalBarrier::default);
        global.src_access |= src_translation.access;
        global.dst_access |= dst_translation.access;
    }

    /// Queue the acquire half of handing the image from `src_family` to `dst_family`.
    ///
    /// The layout is kept as is, the matching release recorded on `src_family` must use the
    /// same layouts.
    pub fn acquire_image(&mut self, image: &mut ImageRecord, src_family: u32, dst_family: u32) {
        let translation = translate_state(image.current_state);
        self.acquire.stage |= translation.stage;
        self.acquire.images.push(ImageBarrier {
            image: image.raw,
            src_access: vk::AccessFlags::empty(),
            dst_access: translation.access,
            old_layout: image.layout,
            new_layout: image.layout,
            range: image.full_range(),
            src_queue_family: src_family,
            dst_queue_family: dst_family,
        });
        tracing::trace!(image = image.name(), src_family, dst_family, "Queued image acquire");
        image.family.owner = Some(dst_family);
        image.family.released_to = None;
    }

    /// Queue the release half of handing the image from `src_family` to `dst_family`
    pub fn release_image(&mut self, image: &mut ImageRecord, src_family: u32, dst_family: u32) {
        let translation = translate_state(image.current_state);
        self.release.stage |= translation.stage;
        self.release.images.push(ImageBarrier {
            image: image.raw,
            src_access: translation.access,
            dst_access: vk::AccessFlags::empty(),
            old_layout: image.layout,
            new_layout: image.layout,
            range: image.full_range(),
            src_queue_family: src_family,
            dst_queue_family: dst_family,
        });
        tracing::trace!(image = image.name(), src_family, dst_family, "Queued image release");
        image.family.released_to = Some(dst_family);
    }

    pub fn acquire_buffer(&mut self, buffer: &mut BufferRecord, src_family: u32, dst_family: u32) {
        let translation = translate_state(buffer.current_state);
        self.acquire.stage |= translation.stage;
        self.acquire.buffers.push(BufferBarrier {
            buffer: buffer.raw,
            src_access: vk::AccessFlags::empty(),
            dst_access: translation.access,
            offset: 0,
            size: vk::WHOLE_SIZE,
            src_queue_family: src_family,
            dst_queue_family: dst_family,
        });
        tracing::trace!(buffer = buffer.name(), src_family, dst_family, "Queued buffer acquire");
        buffer.family.owner = Some(dst_family);
        buffer.family.released_to = None;
    }

    pub fn release_buffer(&mut self, buffer: &mut BufferRecord, src_family: u32, dst_family: u32) {
        let translation = translate_state(buffer.current_state);
        self.release.stage |= translation.stage;
        self.release.buffers.push(BufferBarrier {
            buffer: buffer.raw,
            src_access: translation.access,
            dst_access: vk::AccessFlags::empty(),
            offset: 0,
            size: vk::WHOLE_SIZE,
            src_queue_family: src_family,
            dst_queue_family: dst_family,
        });
        tracing::trace!(buffer = buffer.name(), src_family, dst_family, "Queued buffer release");
        buffer.family.released_to = Some(dst_family);
    }

    /// Take everything queued, in recording order: acquires, transitions, releases
    pub fn take_all(&mut self) -> Vec<PipelineBarrier> {
        let acquire_stage =
            or_default_stage(self.acquire.stage, vk::PipelineStageFlags::ALL_COMMANDS);
        let release_stage =
            or_default_stage(self.release.stage, vk::PipelineStageFlags::ALL_COMMANDS);
        let acquire = self
            .acquire
            .take(vk::PipelineStageFlags::TOP_OF_PIPE, acquire_stage);
        let transitions = self.take();
        let release = self
            .release
            .take(release_stage, vk::PipelineStageFlags::BOTTOM_OF_PIPE);
        acquire.into_iter().chain(transitions).chain(release).collect()
    }

    /// Take every queued transition out of the batch, leaving ownership transfers queued.
    pub fn take(&mut self) -> Option<PipelineBarrier> {
        if self.memory.is_none() && self.buffers.is_empty() && self.images.is_empty() {
            return None;
        }
        let mut src_stage = std::mem::take(&mut self.src_stage);
        let mut dst_stage = std::mem::take(&mut self.dst_stage);
        if src_stage.is_empty() {
            src_stage = vk::PipelineStageFlags::TOP_OF_PIPE;
        }
        if dst_stage.is_empty() {
            dst_stage = vk::PipelineStageFlags::BOTTOM_OF_PIPE;
        }
        Some(PipelineBarrier {
            src_stage,
            dst_stage,
            memory: self.memory.take(),
            buffers: std::mem::take(&mut self.buffers),
            images: std::mem::take(&mut self.images),
        })
    }

    /// Drop every queued barrier. Resource records keep their already updated states.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{BufferDesc, ImageDesc, Ownership};
    use ash::vk::Handle;

    fn image(raw: u64, state: ResourceState) -> ImageRecord {
        ImageRecord::new(
            vk::Image::from_raw(raw),
            None,
            ImageDesc {
                initial_state: state,
                ..Default::default()
            },
            Ownership::Owned,
        )
    }

    #[test]
    fn same_state_is_noop() {
        let mut batch = BarrierBatch::new();
        let mut record = image(1, ResourceState::SHADER_RESOURCE);
        let range = record.full_range();
        assert!(!batch
            .transition_image(&mut record, ResourceState::SHADER_RESOURCE, range)
            .unwrap());
        assert!(batch.is_empty());
        assert!(batch.take().is_none());
        assert_eq!(record.current_state(), ResourceState::SHADER_RESOURCE);
    }

    #[test]
    fn transitions_update_state_before_commit() {
        let mut batch = BarrierBatch::new();
        let mut record = image(1, ResourceState::COMMON);
        let range = record.full_range();
        batch
            .transition_image(&mut record, ResourceState::RENDER_TARGET, range)
            .unwrap();
        assert_eq!(record.current_state(), ResourceState::RENDER_TARGET);
        assert_eq!(record.layout(), vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);

        let barrier = batch.take().unwrap();
        assert_eq!(barrier.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(
            barrier.dst_stage,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        );
        assert_eq!(barrier.images.len(), 1);
        assert_eq!(barrier.images[0].old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(
            barrier.images[0].new_layout,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
        assert!(batch.is_empty());
    }

    #[test]
    fn batch_accumulates_stage_masks() {
        let mut batch = BarrierBatch::new();
        let mut color = image(1, ResourceState::RENDER_TARGET);
        let mut depth = image(2, ResourceState::DEPTH_WRITE);
        let mut vertices = BufferRecord::new(
            vk::Buffer::from_raw(3),
            None,
            BufferDesc {
                initial_state: ResourceState::TRANSFER_DST,
                ..Default::default()
            },
            Ownership::Owned,
        );
        let color_range = color.full_range();
        let depth_range = depth.full_range();
        batch
            .transition_image(&mut color, ResourceState::SHADER_RESOURCE, color_range)
            .unwrap();
        batch
            .transition_image(&mut depth, ResourceState::DEPTH_READ, depth_range)
            .unwrap();
        batch
            .transition_buffer(&mut vertices, ResourceState::VERTEX_BUFFER)
            .unwrap();

        let barrier = batch.take().unwrap();
        assert_eq!(barrier.images.len(), 2);
        assert_eq!(barrier.buffers.len(), 1);
        assert_eq!(
            barrier.src_stage,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS
                | vk::PipelineStageFlags::TRANSFER
        );
        assert_eq!(
            barrier.dst_stage,
            vk::PipelineStageFlags::ALL_COMMANDS
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS
                | vk::PipelineStageFlags::VERTEX_INPUT
        );
        assert_eq!(barrier.buffers[0].size, vk::WHOLE_SIZE);
        assert_eq!(vertices.current_state(), ResourceState::VERTEX_BUFFER);
    }

    #[test]
    fn invalid_destination_leaves_record_untouched() {
        let mut batch = BarrierBatch::new();
        let mut record = image(1, ResourceState::COMMON);
        let range = record.full_range();
        let invalid = ResourceState::RENDER_TARGET | ResourceState::SHADER_RESOURCE;
        assert_eq!(
            batch.transition_image(&mut record, invalid, range),
            Err(RhiError::InvalidResourceState(invalid))
        );
        assert_eq!(record.current_state(), ResourceState::COMMON);
        assert!(batch.is_empty());
    }

    #[test]
    fn common_destination_uses_general_layout() {
        let mut batch = BarrierBatch::new();
        let mut record = image(1, ResourceState::TRANSFER_DST);
        let range = record.full_range();
        batch
            .transition_image(&mut record, ResourceState::COMMON, range)
            .unwrap();
        assert_eq!(record.layout(), vk::ImageLayout::GENERAL);
        let barrier = batch.take().unwrap();
        assert_eq!(barrier.dst_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
    }

    #[test]
    fn global_barrier_between_unordered_accesses() {
        let mut batch = BarrierBatch::new();
        batch.memory_barrier(
            ResourceState::UNORDERED_ACCESS,
            ResourceState::UNORDERED_ACCESS,
        );
        let barrier = batch.take().unwrap();
        let global = barrier.memory.unwrap();
        assert_eq!(
            global.src_access,
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE
        );
        assert!(barrier.images.is_empty());
    }

    #[test]
    fn ownership_transfers_wrap_transitions() {
        let mut batch = BarrierBatch::new();
        let mut texture = image(1, ResourceState::TRANSFER_DST);
        texture.family.owner = Some(2);
        texture.family.released_to = Some(0);
        batch.acquire_image(&mut texture, 2, 0);
        assert_eq!(texture.family_ownership().owner, Some(0));
        assert_eq!(texture.family_ownership().released_to, None);
        let range = texture.full_range();
        batch
            .transition_image(&mut texture, ResourceState::SHADER_RESOURCE, range)
            .unwrap();
        let mut staging = BufferRecord::new(
            vk::Buffer::from_raw(3),
            None,
            BufferDesc {
                initial_state: ResourceState::TRANSFER_SRC,
                ..Default::default()
            },
            Ownership::Owned,
        );
        batch.release_buffer(&mut staging, 0, 2);
        assert_eq!(staging.family_ownership().released_to, Some(2));
        assert!(batch.take().is_some());
        assert!(!batch.is_empty());

        let mut batch = BarrierBatch::new();
        batch.acquire_image(&mut texture, 2, 0);
        batch.memory_barrier(ResourceState::UNORDERED_ACCESS, ResourceState::UNORDERED_ACCESS);
        batch.release_buffer(&mut staging, 0, 2);
        let barriers = batch.take_all();
        assert_eq!(barriers.len(), 3);
        assert!(batch.is_empty());

        let acquire = &barriers[0];
        assert_eq!(acquire.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(
            (acquire.images[0].src_queue_family, acquire.images[0].dst_queue_family),
            (2, 0)
        );
        assert_eq!(acquire.images[0].old_layout, acquire.images[0].new_layout);
        assert!(barriers[1].memory.is_some());
        let release = &barriers[2];
        assert_eq!(release.src_stage, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(release.dst_stage, vk::PipelineStageFlags::BOTTOM_OF_PIPE);
        assert_eq!(
            (release.buffers[0].src_queue_family, release.buffers[0].dst_queue_family),
            (0, 2)
        );
        assert_eq!(release.buffers[0].dst_access, vk::AccessFlags::empty());
    }
}
