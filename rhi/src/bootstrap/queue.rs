use ash::vk;

use super::AdapterInfo;
use crate::queue::QueueType;
use crate::settings::RhiSettings;
use crate::RhiError;

/// Queue families the logical device is created with
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct QueueFamilySelection {
    pub graphics: u32,
    pub compute: u32,
    pub transfer: u32,
    /// Compute runs on a family distinct from graphics
    pub async_compute: bool,
    /// Transfer runs on a family distinct from graphics and compute
    pub async_transfer: bool,
}

impl QueueFamilySelection {
    /// Every queue type on `family`
    pub fn shared(family: u32) -> Self {
        Self {
            graphics: family,
            compute: family,
            transfer: family,
            async_compute: false,
            async_transfer: false,
        }
    }

    pub fn family(&self, queue_type: QueueType) -> u32 {
        match queue_type {
            QueueType::Graphics => self.graphics,
            QueueType::Compute => self.compute,
            QueueType::Transfer => self.transfer,
        }
    }

    /// Distinct families in ascending order, one queue is created for each
    pub fn unique_families(&self) -> Vec<u32> {
        let mut families = vec![self.graphics, self.compute, self.transfer];
        families.sort_unstable();
        families.dedup();
        families
    }
}

fn find_family(
    families: &[vk::QueueFamilyProperties],
    required: vk::QueueFlags,
    excluded: vk::QueueFlags,
) -> Option<u32> {
    families
        .iter()
        .position(|family| {
            family.queue_count > 0
                && family.queue_flags.contains(required)
                && !family.queue_flags.intersects(excluded)
        })
        .map(|index| index as u32)
}

/// Choose the graphics, compute and transfer families.
///
/// Graphics must also be able to present. Compute prefers a family without graphics, transfer
/// one with neither graphics nor compute. Either falls back to the graphics family when disabled
/// in `settings` or unavailable, clearing its async flag.
pub fn select_queue_families(
    adapter: &AdapterInfo,
    settings: &RhiSettings,
) -> Result<QueueFamilySelection, RhiError> {
    let graphics = adapter
        .graphics_present_family()
        .ok_or(RhiError::ImpossibleQueue)?;
    let families = &adapter.queue_families;

    let dedicated_compute = settings
        .enable_async_compute
        .then(|| find_family(families, vk::QueueFlags::COMPUTE, vk::QueueFlags::GRAPHICS))
        .flatten();
    let compute = match dedicated_compute {
        Some(family) => family,
        None => {
            if settings.enable_async_compute {
                tracing::warn!(
                    adapter = %adapter.name,
                    graphics,
                    "No dedicated compute family, falling back to graphics family"
                );
            }
            graphics
        }
    };

    let dedicated_transfer = settings
        .enable_async_transfer
        .then(|| {
            find_family(
                families,
                vk::QueueFlags::TRANSFER,
                vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
            )
        })
        .flatten();
    let transfer = match dedicated_transfer {
        Some(family) => family,
        None => {
            if settings.enable_async_transfer {
                tracing::warn!(
                    adapter = %adapter.name,
                    graphics,
                    "No dedicated transfer family, falling back to graphics family"
                );
            }
            graphics
        }
    };

    let selection = QueueFamilySelection {
        graphics,
        compute,
        transfer,
        async_compute: dedicated_compute.is_some(),
        async_transfer: dedicated_transfer.is_some(),
    };
    tracing::debug!(?selection, "Selected queue families");
    Ok(selection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::physical_device::tests::{adapter, family};

    fn full_adapter() -> AdapterInfo {
        adapter(
            1,
            vk::PhysicalDeviceType::DISCRETE_GPU,
            vec![
                family(vk::QueueFlags::TRANSFER, 2),
                family(
                    vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                    16,
                ),
                family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, 8),
            ],
        )
    }

    #[test]
    fn dedicated_families() {
        let selection = select_queue_families(&full_adapter(), &RhiSettings::default()).unwrap();
        assert_eq!(
            selection,
            QueueFamilySelection {
                graphics: 1,
                compute: 2,
                transfer: 0,
                async_compute: true,
                async_transfer: true,
            }
        );
        assert_eq!(selection.unique_families(), vec![0, 1, 2]);
    }

    #[test]
    fn disabled_async_uses_graphics() {
        let settings = RhiSettings {
            enable_async_compute: false,
            enable_async_transfer: false,
            ..Default::default()
        };
        let selection = select_queue_families(&full_adapter(), &settings).unwrap();
        assert_eq!(selection.compute, 1);
        assert_eq!(selection.transfer, 1);
        assert!(!selection.async_compute);
        assert!(!selection.async_transfer);
        assert_eq!(selection.unique_families(), vec![1]);
    }

    #[test]
    fn missing_dedicated_falls_back() {
        let single = adapter(
            1,
            vk::PhysicalDeviceType::INTEGRATED_GPU,
            vec![
                family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, 1),
                // empty families are never selected
                family(vk::QueueFlags::COMPUTE, 0),
            ],
        );
        let selection = select_queue_families(&single, &RhiSettings::default()).unwrap();
        assert_eq!(selection.family(QueueType::Compute), 0);
        assert_eq!(selection.family(QueueType::Transfer), 0);
        assert!(!selection.async_compute);
        assert!(!selection.async_transfer);
    }

    #[test]
    fn compute_only_adapter_is_impossible() {
        let compute_only = adapter(
            1,
            vk::PhysicalDeviceType::DISCRETE_GPU,
            vec![family(vk::QueueFlags::COMPUTE, 4)],
        );
        assert_eq!(
            select_queue_families(&compute_only, &RhiSettings::default()),
            Err(RhiError::ImpossibleQueue)
        );
    }
}
