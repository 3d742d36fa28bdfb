//! Logical resource usages and their mapping onto native barrier parameters.

use ash::vk;

use crate::RhiError;

bitflags::bitflags! {
    /// Symbolic usage of a resource at a point in the command stream.
    ///
    /// Read usages may be combined. Write usages must appear alone.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ResourceState: u32 {
        const COMMON = 0;
        const VERTEX_BUFFER = 0x1;
        const UNIFORM_BUFFER = 0x2;
        const INDEX_BUFFER = 0x4;
        const RENDER_TARGET = 0x8;
        const UNORDERED_ACCESS = 0x10;
        const DEPTH_WRITE = 0x20;
        const DEPTH_READ = 0x40;
        const STREAM_OUT = 0x80;
        const INDIRECT_ARGUMENT = 0x100;
        const TRANSFER_DST = 0x200;
        const TRANSFER_SRC = 0x400;
        const RESOLVE_DST = 0x800;
        const RESOLVE_SRC = 0x1000;
        const ACCELERATION_STRUCTURE = 0x2000;
        const SHADING_RATE = 0x4000;
        const SHADER_RESOURCE = 0x8000;
        const PRESENT = 0x10000;
        const INPUT_ATTACHMENT = 0x20000;
    }
}

impl ResourceState {
    /// Usages that write to the resource
    pub const WRITES: Self = Self::RENDER_TARGET
        .union(Self::UNORDERED_ACCESS)
        .union(Self::DEPTH_WRITE)
        .union(Self::STREAM_OUT)
        .union(Self::TRANSFER_DST)
        .union(Self::RESOLVE_DST);

    pub fn is_common(&self) -> bool {
        self.is_empty()
    }

    pub fn has_write(&self) -> bool {
        self.intersects(Self::WRITES)
    }
}

/// Native parameters a [`ResourceState`] translates into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTranslation {
    pub stage: vk::PipelineStageFlags,
    pub access: vk::AccessFlags,
    pub layout: vk::ImageLayout,
}

/// Per-usage table, in resolution order. When several usages of one state carry a layout, the
/// entry checked last decides the layout.
const TRANSLATION_TABLE: &[(ResourceState, vk::PipelineStageFlags, vk::AccessFlags, vk::ImageLayout)] = &[
    (
        ResourceState::VERTEX_BUFFER,
        vk::PipelineStageFlags::VERTEX_INPUT,
        vk::AccessFlags::VERTEX_ATTRIBUTE_READ,
        vk::ImageLayout::UNDEFINED,
    ),
    (
        ResourceState::UNIFORM_BUFFER,
        vk::PipelineStageFlags::ALL_COMMANDS,
        vk::AccessFlags::UNIFORM_READ,
        vk::ImageLayout::UNDEFINED,
    ),
    (
        ResourceState::INDEX_BUFFER,
        vk::PipelineStageFlags::VERTEX_INPUT,
        vk::AccessFlags::INDEX_READ,
        vk::ImageLayout::UNDEFINED,
    ),
    (
        ResourceState::RENDER_TARGET,
        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        vk::AccessFlags::from_raw(
            vk::AccessFlags::COLOR_ATTACHMENT_READ.as_raw()
                | vk::AccessFlags::COLOR_ATTACHMENT_WRITE.as_raw(),
        ),
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    ),
    (
        ResourceState::UNORDERED_ACCESS,
        vk::PipelineStageFlags::ALL_COMMANDS,
        vk::AccessFlags::from_raw(
            vk::AccessFlags::SHADER_READ.as_raw() | vk::AccessFlags::SHADER_WRITE.as_raw(),
        ),
        vk::ImageLayout::GENERAL,
    ),
    (
        ResourceState::DEPTH_WRITE,
        vk::PipelineStageFlags::from_raw(
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS.as_raw()
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS.as_raw(),
        ),
        vk::AccessFlags::from_raw(
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ.as_raw()
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw(),
        ),
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    ),
    (
        ResourceState::DEPTH_READ,
        vk::PipelineStageFlags::from_raw(
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS.as_raw()
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS.as_raw(),
        ),
        vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ,
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    ),
    (
        ResourceState::STREAM_OUT,
        vk::PipelineStageFlags::TRANSFORM_FEEDBACK_EXT,
        vk::AccessFlags::TRANSFORM_FEEDBACK_WRITE_EXT,
        vk::ImageLayout::UNDEFINED,
    ),
    (
        ResourceState::INDIRECT_ARGUMENT,
        vk::PipelineStageFlags::DRAW_INDIRECT,
        vk::AccessFlags::INDIRECT_COMMAND_READ,
        vk::ImageLayout::UNDEFINED,
    ),
    (
        ResourceState::TRANSFER_DST.union(ResourceState::RESOLVE_DST),
        vk::PipelineStageFlags::TRANSFER,
        vk::AccessFlags::TRANSFER_WRITE,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
    ),
    (
        ResourceState::TRANSFER_SRC.union(ResourceState::RESOLVE_SRC),
        vk::PipelineStageFlags::TRANSFER,
        vk::AccessFlags::TRANSFER_READ,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
    ),
    (
        ResourceState::SHADING_RATE,
        vk::PipelineStageFlags::FRAGMENT_SHADING_RATE_ATTACHMENT_KHR,
        vk::AccessFlags::FRAGMENT_SHADING_RATE_ATTACHMENT_READ_KHR,
        vk::ImageLayout::FRAGMENT_SHADING_RATE_ATTACHMENT_OPTIMAL_KHR,
    ),
    (
        ResourceState::SHADER_RESOURCE,
        vk::PipelineStageFlags::ALL_COMMANDS,
        vk::AccessFlags::SHADER_READ,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    ),
    (
        ResourceState::PRESENT,
        vk::PipelineStageFlags::ALL_COMMANDS,
        vk::AccessFlags::MEMORY_READ,
        vk::ImageLayout::PRESENT_SRC_KHR,
    ),
    (
        ResourceState::INPUT_ATTACHMENT,
        vk::PipelineStageFlags::FRAGMENT_SHADER,
        vk::AccessFlags::INPUT_ATTACHMENT_READ,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    ),
];

/// Translates a state into the stage mask, access mask and image layout it implies.
///
/// Every usage bit contributes its stage and access flags. If more than one usage carries an
/// image layout, the usage listed last in the resolution order wins. Use
/// [`validate_image_state`] to reject such combinations before they reach a barrier.
pub fn translate_state(state: ResourceState) -> StateTranslation {
    let mut translation = StateTranslation {
        stage: vk::PipelineStageFlags::empty(),
        access: vk::AccessFlags::empty(),
        layout: vk::ImageLayout::UNDEFINED,
    };
    if state.is_common() {
        translation.stage |= vk::PipelineStageFlags::TOP_OF_PIPE;
        return translation;
    }
    for (usage, stage, access, layout) in TRANSLATION_TABLE {
        if state.intersects(*usage) {
            translation.stage |= *stage;
            translation.access |= *access;
            if *layout != vk::ImageLayout::UNDEFINED {
                translation.layout = *layout;
            }
        }
    }
    translation
}

/// Checks a state is usable on a buffer: no acceleration structure usage, and write usages
/// are not mixed with anything else.
pub fn validate_buffer_state(state: ResourceState) -> Result<(), RhiError> {
    if state.contains(ResourceState::ACCELERATION_STRUCTURE)
        || (state.has_write() && state.bits().count_ones() > 1)
    {
        return Err(RhiError::InvalidResourceState(state));
    }
    Ok(())
}

/// Buffer rules plus: all usages in the state must agree on a single image layout.
pub fn validate_image_state(state: ResourceState) -> Result<(), RhiError> {
    validate_buffer_state(state)?;
    let mut layout = None;
    for (usage, _, _, usage_layout) in TRANSLATION_TABLE {
        if !state.intersects(*usage) || *usage_layout == vk::ImageLayout::UNDEFINED {
            continue;
        }
        match layout {
            None => layout = Some(*usage_layout),
            Some(existing) if existing != *usage_layout => {
                return Err(RhiError::InvalidResourceState(state));
            }
            Some(_) => {}
        }
    }
    Ok(())
}
