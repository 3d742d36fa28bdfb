use ash::vk;
use derivative::Derivative;

use crate::RhiError;

/// What the device needs to know about a physical device before opening it
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct AdapterInfo {
    pub raw: vk::PhysicalDevice,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,
    #[derivative(Debug = "ignore")]
    pub limits: vk::PhysicalDeviceLimits,
    pub queue_families: Vec<vk::QueueFamilyProperties>,
    /// Whether each queue family can present, indexed like `queue_families`
    pub present_support: Vec<bool>,
}

impl AdapterInfo {
    pub fn is_discrete(&self) -> bool {
        self.device_type == vk::PhysicalDeviceType::DISCRETE_GPU
    }

    pub fn can_present(&self, family_index: usize) -> bool {
        self.present_support
            .get(family_index)
            .copied()
            .unwrap_or(false)
    }

    /// First family that supports graphics work and presentation
    pub fn graphics_present_family(&self) -> Option<u32> {
        self.queue_families
            .iter()
            .enumerate()
            .find(|(index, family)| {
                family.queue_count > 0
                    && family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
                    && self.can_present(*index)
            })
            .map(|(index, _)| index as u32)
    }

    /// In the form of (major, minor, patch)
    pub fn version(&self) -> (u16, u16, u16) {
        get_version(self.api_version)
    }
}

/// Picks the adapter to open.
///
/// Adapters without a graphics and present capable family are never chosen. Discrete GPUs are
/// preferred over everything else, ties keep enumeration order.
pub fn select_adapter(adapters: &[AdapterInfo]) -> Result<usize, RhiError> {
    let (discrete, others): (Vec<usize>, Vec<usize>) = adapters
        .iter()
        .enumerate()
        .filter(|(_, adapter)| adapter.graphics_present_family().is_some())
        .map(|(index, _)| index)
        .partition(|index| adapters[*index].is_discrete());

    if let Some(&index) = discrete.first() {
        tracing::info!(adapter = %adapters[index].name, "Selected discrete GPU");
        return Ok(index);
    }
    match others.first() {
        Some(&index) => {
            tracing::warn!(
                adapter = %adapters[index].name,
                device_type = ?adapters[index].device_type,
                "No discrete GPU found, falling back"
            );
            Ok(index)
        }
        None => Err(RhiError::NoPhysicalDevice),
    }
}

/// Convert a Vulkan packed version into (major, minor, patch)
pub fn get_version(version: u32) -> (u16, u16, u16) {
    (
        vk::api_version_major(version) as u16,
        vk::api_version_minor(version) as u16,
        vk::api_version_patch(version) as u16,
    )
}
