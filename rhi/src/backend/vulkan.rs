//! Native Vulkan backend.

use std::ffi::{c_char, CStr, CString};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use ash::vk;
use derivative::Derivative;
use gpu_allocator::vulkan::{
    AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::{AllocationError, MemoryLocation};

use super::{
    Allocation, Backend, Command, DebugMarkerKind, Platform, RenderPassInheritance,
    SemaphoreKind, SubmitDesc, VkResult,
};
use crate::bootstrap::AdapterInfo;
use crate::resource::{BufferDesc, ImageDesc};
use crate::settings::RhiSettings;

#[derive(Derivative)]
#[derivative(Debug)]
struct InstanceShared {
    #[derivative(Debug = "ignore")]
    entry: ash::Entry,
    #[derivative(Debug = "ignore")]
    instance: ash::Instance,
    #[derivative(Debug = "ignore")]
    messenger: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

impl Drop for InstanceShared {
    fn drop(&mut self) {
        #[cfg(feature = "log-lifetimes")]
        tracing::trace!("Destroying VkInstance {:?}", self.instance.handle());

        unsafe {
            if let Some((ext, messenger)) = self.messenger.take() {
                ext.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Vulkan instance used to enumerate and open adapters.
///
/// The optional surface stays owned by the caller and is only used to query present support.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct VulkanPlatform {
    shared: Arc<InstanceShared>,
    #[derivative(Debug = "ignore")]
    surface_loader: ash::khr::surface::Instance,
    surface: Option<vk::SurfaceKHR>,
}

impl VulkanPlatform {
    /// Load Vulkan and create an instance.
    ///
    /// `extensions` are the instance extensions required by the window system, if any.
    pub fn new(settings: &RhiSettings, extensions: &[&CStr]) -> Result<Self> {
        let entry = unsafe { ash::Entry::load()? };
        let application_name = CString::new(settings.application_name.as_str())?;
        let application_info = vk::ApplicationInfo::default()
            .application_name(&application_name)
            .engine_name(c"rhi")
            .api_version(vk::API_VERSION_1_2);

        let mut extension_ptrs: Vec<*const c_char> =
            extensions.iter().map(|name| name.as_ptr()).collect();
        let mut layer_ptrs: Vec<*const c_char> = Vec::new();
        if settings.validation {
            extension_ptrs.push(ash::ext::debug_utils::NAME.as_ptr());
            layer_ptrs.push(c"VK_LAYER_KHRONOS_validation".as_ptr());
        }
        let instance_ci = vk::InstanceCreateInfo::default()
            .application_info(&application_info)
            .enabled_extension_names(&extension_ptrs)
            .enabled_layer_names(&layer_ptrs);
        let instance = unsafe { entry.create_instance(&instance_ci, None) }
            .context("Failed to create VkInstance")?;

        #[cfg(feature = "log-lifetimes")]
        tracing::trace!("Creating VkInstance {:?}", instance.handle());

        let messenger = if settings.validation {
            let ext = ash::ext::debug_utils::Instance::new(&entry, &instance);
            let messenger_ci = vk::DebugUtilsMessengerCreateInfoEXT::default()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION,
                )
                .pfn_user_callback(Some(vk_debug_callback));
            let messenger = unsafe { ext.create_debug_utils_messenger(&messenger_ci, None)? };
            Some((ext, messenger))
        } else {
            None
        };

        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);
        Ok(Self {
            shared: Arc::new(InstanceShared {
                entry,
                instance,
                messenger,
            }),
            surface_loader,
            surface: None,
        })
    }

    pub fn entry(&self) -> &ash::Entry {
        &self.shared.entry
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.shared.instance
    }

    /// Use `surface` to decide which queue families can present
    pub fn with_surface(mut self, surface: vk::SurfaceKHR) -> Self {
        self.surface = Some(surface);
        self
    }

    fn present_support(&self, physical_device: vk::PhysicalDevice, family_index: u32) -> bool {
        match self.surface {
            Some(surface) => unsafe {
                self.surface_loader
                    .get_physical_device_surface_support(physical_device, family_index, surface)
                    .unwrap_or(false)
            },
            // no surface, every graphics family is assumed able to present offscreen
            None => true,
        }
    }
}

impl Platform for VulkanPlatform {
    type Backend = VulkanBackend;

    fn adapters(&self) -> Result<Vec<AdapterInfo>> {
        let instance = &self.shared.instance;
        let physical_devices = unsafe { instance.enumerate_physical_devices()? };
        Ok(physical_devices
            .into_iter()
            .map(|raw| {
                let properties = unsafe { instance.get_physical_device_properties(raw) };
                let queue_families =
                    unsafe { instance.get_physical_device_queue_family_properties(raw) };
                let present_support = (0..queue_families.len() as u32)
                    .map(|family_index| self.present_support(raw, family_index))
                    .collect();
                AdapterInfo {
                    raw,
                    name: properties
                        .device_name_as_c_str()
                        .map(|name| name.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    device_type: properties.device_type,
                    api_version: properties.api_version,
                    limits: properties.limits,
                    queue_families,
                    present_support,
                }
            })
            .collect())
    }

    fn open(&self, adapter: &AdapterInfo, queue_families: &[u32]) -> Result<VulkanBackend> {
        let instance = &self.shared.instance;
        let available: Vec<CString> =
            unsafe { instance.enumerate_device_extension_properties(adapter.raw)? }
                .iter()
                .filter_map(|extension| extension.extension_name_as_c_str().ok())
                .map(CString::from)
                .collect();
        let supports = |name: &CStr| available.iter().any(|available| available.as_c_str() == name);

        let mut extension_ptrs: Vec<*const c_char> = Vec::new();
        if self.surface.is_some() {
            extension_ptrs.push(ash::khr::swapchain::NAME.as_ptr());
        }
        let debug_marker_kind = if self.shared.messenger.is_some() {
            Some(DebugMarkerKind::DebugUtils)
        } else if supports(ash::ext::debug_marker::NAME) {
            extension_ptrs.push(ash::ext::debug_marker::NAME.as_ptr());
            Some(DebugMarkerKind::DebugMarker)
        } else {
            None
        };

        let priorities = [1.0f32];
        let queue_cis: Vec<vk::DeviceQueueCreateInfo> = queue_families
            .iter()
            .map(|family_index| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(*family_index)
                    .queue_priorities(&priorities)
            })
            .collect();
        let mut vulkan12_features =
            vk::PhysicalDeviceVulkan12Features::default().timeline_semaphore(true);
        let device_ci = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_cis)
            .enabled_extension_names(&extension_ptrs)
            .push_next(&mut vulkan12_features);
        let device = unsafe { instance.create_device(adapter.raw, &device_ci, None) }
            .with_context(|| format!("Failed to create VkDevice on {}", adapter.name))?;

        #[cfg(feature = "log-lifetimes")]
        tracing::trace!("Creating VkDevice {:?}", device.handle());

        let debug_markers = match debug_marker_kind {
            Some(DebugMarkerKind::DebugUtils) => Some(DebugMarkers::DebugUtils(
                ash::ext::debug_utils::Device::new(instance, &device),
            )),
            Some(DebugMarkerKind::DebugMarker) => Some(DebugMarkers::DebugMarker(
                ash::ext::debug_marker::Device::new(instance, &device),
            )),
            None => None,
        };
        let allocator = match Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device: adapter.raw,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        }) {
            Ok(allocator) => allocator,
            Err(err) => {
                unsafe { device.destroy_device(None) };
                return Err(err).context("Failed to create memory allocator");
            }
        };
        Ok(VulkanBackend {
            _instance: self.shared.clone(),
            device,
            allocator: Mutex::new(Some(allocator)),
            debug_markers,
        })
    }
}

enum DebugMarkers {
    DebugUtils(ash::ext::debug_utils::Device),
    DebugMarker(ash::ext::debug_marker::Device),
}

impl DebugMarkers {
    fn kind(&self) -> DebugMarkerKind {
        match self {
            DebugMarkers::DebugUtils(_) => DebugMarkerKind::DebugUtils,
            DebugMarkers::DebugMarker(_) => DebugMarkerKind::DebugMarker,
        }
    }
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct VulkanBackend {
    #[derivative(Debug = "ignore")]
    _instance: Arc<InstanceShared>,
    #[derivative(Debug = "ignore")]
    device: ash::Device,
    /// Taken out and dropped before the device is destroyed
    #[derivative(Debug = "ignore")]
    allocator: Mutex<Option<Allocator>>,
    #[derivative(Debug = "ignore")]
    debug_markers: Option<DebugMarkers>,
}

impl VulkanBackend {
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> VkResult<Allocation> {
        let mut allocator = self
            .allocator
            .lock()
            .map_err(|_| vk::Result::ERROR_UNKNOWN)?;
        let allocator = allocator.as_mut().ok_or(vk::Result::ERROR_DEVICE_LOST)?;
        allocator
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|err| {
                tracing::error!(%err, name, ?location, "Failed to allocate memory");
                match err {
                    AllocationError::OutOfMemory => vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
                    _ => vk::Result::ERROR_UNKNOWN,
                }
            })
    }

    fn free(&self, allocation: Option<Allocation>) {
        let Some(allocation) = allocation else {
            return;
        };
        match self.allocator.lock() {
            Ok(mut allocator) => {
                if let Some(allocator) = allocator.as_mut() {
                    if let Err(err) = allocator.free(allocation) {
                        tracing::error!(%err, "Failed to free memory");
                    }
                }
            }
            Err(_) => tracing::error!("Allocator poisoned, leaking allocation"),
        }
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        #[cfg(feature = "log-lifetimes")]
        tracing::trace!("Destroying VkDevice {:?}", self.device.handle());

        // reports leaks, must go before the device
        if let Ok(mut allocator) = self.allocator.lock() {
            allocator.take();
        }
        unsafe {
            self.device.destroy_device(None);
        }
    }
}

/// Maps a wait result onto "finished before the timeout"
fn timeout_to_bool(result: VkResult<()>) -> VkResult<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(vk::Result::TIMEOUT) => Ok(false),
        Err(err) => Err(err),
    }
}

impl Backend for VulkanBackend {
    fn debug_marker_kind(&self) -> Option<DebugMarkerKind> {
        self.debug_markers.as_ref().map(DebugMarkers::kind)
    }

    fn get_queue(&self, family_index: u32) -> vk::Queue {
        unsafe { self.device.get_device_queue(family_index, 0) }
    }

    fn create_command_pool(&self, family_index: u32) -> VkResult<vk::CommandPool> {
        let pool_ci = vk::CommandPoolCreateInfo::default()
            .queue_family_index(family_index)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        unsafe { self.device.create_command_pool(&pool_ci, None) }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) }
    }

    fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
    ) -> VkResult<vk::CommandBuffer> {
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(level)
            .command_buffer_count(1);
        unsafe { self.device.allocate_command_buffers(&allocate_info) }?
            .pop()
            .ok_or(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
    }

    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        unsafe { self.device.free_command_buffers(pool, &[command_buffer]) }
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
        inheritance: Option<&RenderPassInheritance>,
    ) -> VkResult<()> {
        // ignored for primary buffers, required to be valid for secondary ones
        let (inheritance_info, flags) = match inheritance {
            Some(inheritance) => (
                vk::CommandBufferInheritanceInfo::default()
                    .render_pass(inheritance.render_pass)
                    .subpass(inheritance.subpass)
                    .framebuffer(inheritance.framebuffer),
                flags | vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE,
            ),
            None => (vk::CommandBufferInheritanceInfo::default(), flags),
        };
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(flags)
            .inheritance_info(&inheritance_info);
        unsafe { self.device.begin_command_buffer(command_buffer, &begin_info) }
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        unsafe { self.device.end_command_buffer(command_buffer) }
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        unsafe {
            self.device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
        }
    }

    fn record(&self, cb: vk::CommandBuffer, command: Command<'_>) {
        let device = &self.device;
        unsafe {
            match command {
                Command::PipelineBarrier(barrier) => {
                    let memory_barriers: Vec<vk::MemoryBarrier> = barrier
                        .memory
                        .iter()
                        .map(|global| {
                            vk::MemoryBarrier::default()
                                .src_access_mask(global.src_access)
                                .dst_access_mask(global.dst_access)
                        })
                        .collect();
                    let buffer_barriers: Vec<vk::BufferMemoryBarrier> = barrier
                        .buffers
                        .iter()
                        .map(|buffer| {
                            vk::BufferMemoryBarrier::default()
                                .src_access_mask(buffer.src_access)
                                .dst_access_mask(buffer.dst_access)
                                .src_queue_family_index(buffer.src_queue_family)
                                .dst_queue_family_index(buffer.dst_queue_family)
                                .buffer(buffer.buffer)
                                .offset(buffer.offset)
                                .size(buffer.size)
                        })
                        .collect();
                    let image_barriers: Vec<vk::ImageMemoryBarrier> = barrier
                        .images
                        .iter()
                        .map(|image| {
                            vk::ImageMemoryBarrier::default()
                                .src_access_mask(image.src_access)
                                .dst_access_mask(image.dst_access)
                                .old_layout(image.old_layout)
                                .new_layout(image.new_layout)
                                .src_queue_family_index(image.src_queue_family)
                                .dst_queue_family_index(image.dst_queue_family)
                                .image(image.image)
                                .subresource_range(image.range)
                        })
                        .collect();
                    device.cmd_pipeline_barrier(
                        cb,
                        barrier.src_stage,
                        barrier.dst_stage,
                        vk::DependencyFlags::empty(),
                        &memory_barriers,
                        &buffer_barriers,
                        &image_barriers,
                    );
                }
                Command::BeginRenderPass {
                    render_pass,
                    framebuffer,
                    render_area,
                    clear_values,
                    contents,
                } => {
                    let begin_info = vk::RenderPassBeginInfo::default()
                        .render_pass(render_pass)
                        .framebuffer(framebuffer)
                        .render_area(render_area)
                        .clear_values(clear_values);
                    device.cmd_begin_render_pass(cb, &begin_info, contents);
                }
                Command::EndRenderPass => device.cmd_end_render_pass(cb),
                Command::ExecuteCommands(secondaries) => {
                    device.cmd_execute_commands(cb, secondaries)
                }
                Command::BindPipeline {
                    bind_point,
                    pipeline,
                } => device.cmd_bind_pipeline(cb, bind_point, pipeline),
                Command::BindDescriptorSets {
                    bind_point,
                    layout,
                    first_set,
                    sets,
                    dynamic_offsets,
                } => device.cmd_bind_descriptor_sets(
                    cb,
                    bind_point,
                    layout,
                    first_set,
                    sets,
                    dynamic_offsets,
                ),
                Command::BindVertexBuffers {
                    first_binding,
                    buffers,
                    offsets,
                } => device.cmd_bind_vertex_buffers(cb, first_binding, buffers, offsets),
                Command::BindIndexBuffer {
                    buffer,
                    offset,
                    index_type,
                } => device.cmd_bind_index_buffer(cb, buffer, offset, index_type),
                Command::SetViewports { first, viewports } => {
                    device.cmd_set_viewport(cb, first, viewports)
                }
                Command::SetScissors { first, scissors } => {
                    device.cmd_set_scissor(cb, first, scissors)
                }
                Command::PushConstants {
                    layout,
                    stages,
                    offset,
                    data,
                } => device.cmd_push_constants(cb, layout, stages, offset, data),
                Command::Draw {
                    vertex_count,
                    instance_count,
                    first_vertex,
                    first_instance,
                } => device.cmd_draw(
                    cb,
                    vertex_count,
                    instance_count,
                    first_vertex,
                    first_instance,
                ),
                Command::DrawIndexed {
                    index_count,
                    instance_count,
                    first_index,
                    vertex_offset,
                    first_instance,
                } => device.cmd_draw_indexed(
                    cb,
                    index_count,
                    instance_count,
                    first_index,
                    vertex_offset,
                    first_instance,
                ),
                Command::DrawIndirect {
                    buffer,
                    offset,
                    draw_count,
                    stride,
                } => device.cmd_draw_indirect(cb, buffer, offset, draw_count, stride),
                Command::DrawIndexedIndirect {
                    buffer,
                    offset,
                    draw_count,
                    stride,
                } => device.cmd_draw_indexed_indirect(cb, buffer, offset, draw_count, stride),
                Command::Dispatch { x, y, z } => device.cmd_dispatch(cb, x, y, z),
                Command::DispatchIndirect { buffer, offset } => {
                    device.cmd_dispatch_indirect(cb, buffer, offset)
                }
                Command::CopyBuffer { src, dst, regions } => {
                    device.cmd_copy_buffer(cb, src, dst, regions)
                }
                Command::CopyImage {
                    src,
                    src_layout,
                    dst,
                    dst_layout,
                    regions,
                } => device.cmd_copy_image(cb, src, src_layout, dst, dst_layout, regions),
                Command::CopyBufferToImage {
                    src,
                    dst,
                    dst_layout,
                    regions,
                } => device.cmd_copy_buffer_to_image(cb, src, dst, dst_layout, regions),
                Command::CopyImageToBuffer {
                    src,
                    src_layout,
                    dst,
                    regions,
                } => device.cmd_copy_image_to_buffer(cb, src, src_layout, dst, regions),
                Command::ClearColorImage {
                    image,
                    layout,
                    color,
                    ranges,
                } => device.cmd_clear_color_image(cb, image, layout, &color, ranges),
                Command::ClearDepthStencilImage {
                    image,
                    layout,
                    value,
                    ranges,
                } => device.cmd_clear_depth_stencil_image(cb, image, layout, &value, ranges),
                Command::SetEvent { event, stage } => device.cmd_set_event(cb, event, stage),
                Command::ResetEvent { event, stage } => device.cmd_reset_event(cb, event, stage),
                Command::WaitEvent {
                    event,
                    src_stage,
                    dst_stage,
                } => device.cmd_wait_events(cb, &[event], src_stage, dst_stage, &[], &[], &[]),
                Command::BeginDebugMarker { name, color, .. } => {
                    let name = CString::new(name).unwrap_or_default();
                    match &self.debug_markers {
                        Some(DebugMarkers::DebugUtils(ext)) => {
                            let label = vk::DebugUtilsLabelEXT::default()
                                .label_name(&name)
                                .color(color);
                            ext.cmd_begin_debug_utils_label(cb, &label);
                        }
                        Some(DebugMarkers::DebugMarker(ext)) => {
                            let marker = vk::DebugMarkerMarkerInfoEXT::default()
                                .marker_name(&name)
                                .color(color);
                            ext.cmd_debug_marker_begin(cb, &marker);
                        }
                        None => {}
                    }
                }
                Command::EndDebugMarker { .. } => match &self.debug_markers {
                    Some(DebugMarkers::DebugUtils(ext)) => ext.cmd_end_debug_utils_label(cb),
                    Some(DebugMarkers::DebugMarker(ext)) => ext.cmd_debug_marker_end(cb),
                    None => {}
                },
            }
        }
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence = unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::default().flags(flags), None)?
        };

        #[cfg(feature = "log-lifetimes")]
        tracing::trace!("Creating VkFence {:?}", fence);

        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        #[cfg(feature = "log-lifetimes")]
        tracing::trace!("Destroying VkFence {:?}", fence);

        unsafe { self.device.destroy_fence(fence, None) }
    }

    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        unsafe { self.device.get_fence_status(fence) }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout: u64) -> VkResult<bool> {
        timeout_to_bool(unsafe { self.device.wait_for_fences(&[fence], true, timeout) })
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.device.reset_fences(&[fence]) }
    }

    fn create_semaphore(&self, kind: SemaphoreKind) -> VkResult<vk::Semaphore> {
        let semaphore = match kind {
            SemaphoreKind::Binary => unsafe {
                self.device
                    .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)?
            },
            SemaphoreKind::Timeline { initial_value } => {
                let mut type_ci = vk::SemaphoreTypeCreateInfo::default()
                    .semaphore_type(vk::SemaphoreType::TIMELINE)
                    .initial_value(initial_value);
                let semaphore_ci = vk::SemaphoreCreateInfo::default().push_next(&mut type_ci);
                unsafe { self.device.create_semaphore(&semaphore_ci, None)? }
            }
        };

        #[cfg(feature = "log-lifetimes")]
        tracing::trace!("Creating VkSemaphore {:?}", semaphore);

        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        #[cfg(feature = "log-lifetimes")]
        tracing::trace!("Destroying VkSemaphore {:?}", semaphore);

        unsafe { self.device.destroy_semaphore(semaphore, None) }
    }

    fn semaphore_value(&self, semaphore: vk::Semaphore) -> VkResult<u64> {
        unsafe { self.device.get_semaphore_counter_value(semaphore) }
    }

    fn signal_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> VkResult<()> {
        let signal_info = vk::SemaphoreSignalInfo::default()
            .semaphore(semaphore)
            .value(value);
        unsafe { self.device.signal_semaphore(&signal_info) }
    }

    fn wait_semaphore(&self, semaphore: vk::Semaphore, value: u64, timeout: u64) -> VkResult<bool> {
        let semaphores = [semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        timeout_to_bool(unsafe { self.device.wait_semaphores(&wait_info, timeout) })
    }

    fn create_event(&self) -> VkResult<vk::Event> {
        unsafe {
            self.device
                .create_event(&vk::EventCreateInfo::default(), None)
        }
    }

    fn destroy_event(&self, event: vk::Event) {
        unsafe { self.device.destroy_event(event, None) }
    }

    fn event_status(&self, event: vk::Event) -> VkResult<bool> {
        unsafe { self.device.get_event_status(event) }
    }

    fn set_event(&self, event: vk::Event, signaled: bool) -> VkResult<()> {
        unsafe {
            if signaled {
                self.device.set_event(event)
            } else {
                self.device.reset_event(event)
            }
        }
    }

    fn queue_submit(&self, queue: vk::Queue, submit: &SubmitDesc<'_>) -> VkResult<()> {
        let wait_semaphores: Vec<vk::Semaphore> =
            submit.wait_semaphores.iter().map(|wait| wait.semaphore).collect();
        let wait_values: Vec<u64> = submit.wait_semaphores.iter().map(|wait| wait.value).collect();
        let wait_stages: Vec<vk::PipelineStageFlags> =
            submit.wait_semaphores.iter().map(|wait| wait.stage).collect();
        let signal_semaphores: Vec<vk::Semaphore> = submit
            .signal_semaphores
            .iter()
            .map(|signal| signal.semaphore)
            .collect();
        let signal_values: Vec<u64> = submit
            .signal_semaphores
            .iter()
            .map(|signal| signal.value)
            .collect();

        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::default()
            .wait_semaphore_values(&wait_values)
            .signal_semaphore_values(&signal_values);
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(submit.command_buffers)
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info);
        unsafe {
            self.device
                .queue_submit(queue, &[submit_info], submit.fence)
        }
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()> {
        unsafe { self.device.queue_wait_idle(queue) }
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        unsafe { self.device.device_wait_idle() }
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> VkResult<vk::DescriptorPool> {
        let pool_ci = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(sizes);
        unsafe { self.device.create_descriptor_pool(&pool_ci, None) }
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) }
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet> {
        let layouts = [layout];
        let allocate_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        unsafe { self.device.allocate_descriptor_sets(&allocate_info) }?
            .pop()
            .ok_or(vk::Result::ERROR_OUT_OF_POOL_MEMORY)
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> VkResult<()> {
        unsafe {
            self.device
                .reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())
        }
    }

    fn create_image(&self, desc: &ImageDesc) -> VkResult<(vk::Image, Option<Allocation>)> {
        let image_ci = vk::ImageCreateInfo::default()
            .image_type(desc.image_type)
            .format(desc.format)
            .extent(desc.extent)
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(desc.samples)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device.create_image(&image_ci, None)? };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let allocation = self
            .allocate(&desc.name, requirements, MemoryLocation::GpuOnly, false)
            .and_then(|allocation| {
                match unsafe {
                    self.device
                        .bind_image_memory(image, allocation.memory(), allocation.offset())
                } {
                    Ok(()) => Ok(allocation),
                    Err(err) => {
                        self.free(Some(allocation));
                        Err(err)
                    }
                }
            });
        match allocation {
            Ok(allocation) => {
                #[cfg(feature = "log-lifetimes")]
                tracing::trace!("Creating VkImage {:?} ({})", image, desc.name);

                Ok((image, Some(allocation)))
            }
            Err(err) => {
                unsafe { self.device.destroy_image(image, None) };
                Err(err)
            }
        }
    }

    fn destroy_image(&self, image: vk::Image, allocation: Option<Allocation>) {
        #[cfg(feature = "log-lifetimes")]
        tracing::trace!("Destroying VkImage {:?}", image);

        unsafe { self.device.destroy_image(image, None) };
        self.free(allocation);
    }

    fn create_buffer(&self, desc: &BufferDesc) -> VkResult<(vk::Buffer, Option<Allocation>)> {
        let buffer_ci = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&buffer_ci, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let location = if desc.host_visible {
            MemoryLocation::CpuToGpu
        } else {
            MemoryLocation::GpuOnly
        };
        let allocation = self
            .allocate(&desc.name, requirements, location, true)
            .and_then(|allocation| {
                match unsafe {
                    self.device
                        .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
                } {
                    Ok(()) => Ok(allocation),
                    Err(err) => {
                        self.free(Some(allocation));
                        Err(err)
                    }
                }
            });
        match allocation {
            Ok(allocation) => {
                #[cfg(feature = "log-lifetimes")]
                tracing::trace!("Creating VkBuffer {:?} ({})", buffer, desc.name);

                Ok((buffer, Some(allocation)))
            }
            Err(err) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                Err(err)
            }
        }
    }

    fn destroy_buffer(&self, buffer: vk::Buffer, allocation: Option<Allocation>) {
        #[cfg(feature = "log-lifetimes")]
        tracing::trace!("Destroying VkBuffer {:?}", buffer);

        unsafe { self.device.destroy_buffer(buffer, None) };
        self.free(allocation);
    }
}

/// Routes validation messages into `tracing`
unsafe extern "system" fn vk_debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    msg_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut std::os::raw::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() {
        return vk::FALSE;
    }
    let callback_data = unsafe { *p_callback_data };
    let message = unsafe { callback_data.message_as_c_str() }
        .map(|message| message.to_string_lossy().into_owned())
        .unwrap_or_default();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        tracing::error!(?msg_type, "{message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        tracing::warn!(?msg_type, "{message}");
    } else {
        tracing::debug!(?msg_type, "{message}");
    }
    vk::FALSE
}
