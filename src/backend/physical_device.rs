// Physical device selection
//
// Adapter facts are gathered once into plain `PhysicalDeviceInfo` values so the
// selection rules (queue family discovery, requirement checks, scoring) are
// pure functions over data and can be exercised without a GPU.

use anyhow::{Context, Result};
use ash::vk;
use std::ffi::CStr;
use thiserror::Error;

use super::error::DeviceSelectionError;
use super::{Instance, Surface};

/// What the renderer needs from an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRequirements {
    pub graphics_queue: bool,
    pub present_queue: bool,
    pub transfer_queue: bool,
    pub compute_queue: bool,
    pub sampler_anisotropy: bool,
    pub discrete_gpu: bool,
    pub required_extensions: Vec<String>,
}

impl Default for DeviceRequirements {
    fn default() -> Self {
        Self {
            graphics_queue: true,
            present_queue: true,
            transfer_queue: true,
            compute_queue: true,
            sampler_anisotropy: true,
            discrete_gpu: true,
            required_extensions: vec!["VK_KHR_swapchain".to_string()],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
    pub transfer: Option<u32>,
    pub compute: Option<u32>,
}

impl QueueFamilyIndices {
    /// Distinct family indices, one queue gets created per entry.
    pub fn unique(&self) -> Vec<u32> {
        let mut families: Vec<u32> = [self.graphics, self.present, self.transfer, self.compute]
            .into_iter()
            .flatten()
            .collect();
        families.sort_unstable();
        families.dedup();
        families
    }
}

#[derive(Debug, Clone, Default)]
pub struct SwapchainSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// Snapshot of one adapter as reported by the driver.
#[derive(Debug, Clone)]
pub struct PhysicalDeviceInfo {
    pub handle: vk::PhysicalDevice,
    pub name: String,
    pub properties: vk::PhysicalDeviceProperties,
    pub features: vk::PhysicalDeviceFeatures,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub queue_families: Vec<vk::QueueFamilyProperties>,
    /// Indexed like `queue_families`.
    pub present_support: Vec<bool>,
    pub extensions: Vec<String>,
    pub swapchain_support: SwapchainSupport,
}

/// Why an adapter was turned down.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("not a discrete GPU")]
    NotDiscrete,
    #[error("no {0} queue family")]
    MissingQueue(&'static str),
    #[error("missing extension {0}")]
    MissingExtension(String),
    #[error("surface reports no formats")]
    NoSurfaceFormats,
    #[error("surface reports no present modes")]
    NoPresentModes,
    #[error("samplerAnisotropy not supported")]
    NoSamplerAnisotropy,
}

/// The adapter chosen by `select_physical_device`, with everything the
/// logical device needs committed alongside it.
#[derive(Debug, Clone)]
pub struct SelectedDevice {
    pub index: usize,
    pub score: i64,
    pub info: PhysicalDeviceInfo,
    pub queue_families: QueueFamilyIndices,
}

/// Assign queue families.
///
/// Graphics and compute take the last family that advertises them. The
/// transfer family is the one with the fewest other capabilities, so a
/// dedicated transfer queue wins when the hardware has one.
pub fn find_queue_families(
    families: &[vk::QueueFamilyProperties],
    present_support: &[bool],
) -> QueueFamilyIndices {
    let mut indices = QueueFamilyIndices::default();
    let mut best_transfer_score = u32::MAX;

    for (i, family) in families.iter().enumerate() {
        if family.queue_count == 0 {
            continue;
        }

        let index = i as u32;
        let presents = present_support.get(i).copied().unwrap_or(false);
        let flags = family.queue_flags;
        let mut transfer_score = 0;

        if flags.contains(vk::QueueFlags::GRAPHICS) {
            indices.graphics = Some(index);
            transfer_score += 1;

            if presents {
                indices.present = Some(index);
                transfer_score += 1;
            }
        }

        if flags.contains(vk::QueueFlags::COMPUTE) {
            indices.compute = Some(index);
            transfer_score += 1;
        }

        if flags.contains(vk::QueueFlags::TRANSFER) && transfer_score <= best_transfer_score {
            best_transfer_score = transfer_score;
            indices.transfer = Some(index);
        }
    }

    if indices.present.is_none() {
        let first_presenting = families
            .iter()
            .zip(present_support)
            .position(|(family, &presents)| family.queue_count > 0 && presents);

        if let Some(i) = first_presenting {
            let index = i as u32;
            if indices.graphics != Some(index) {
                log::warn!(
                    "Present queue family {} differs from graphics family {:?}",
                    index,
                    indices.graphics
                );
            }
            indices.present = Some(index);
        }
    }

    indices
}

pub fn check_requirements(
    info: &PhysicalDeviceInfo,
    requirements: &DeviceRequirements,
) -> Result<QueueFamilyIndices, Rejection> {
    if requirements.discrete_gpu
        && info.properties.device_type != vk::PhysicalDeviceType::DISCRETE_GPU
    {
        return Err(Rejection::NotDiscrete);
    }

    let families = find_queue_families(&info.queue_families, &info.present_support);

    let queues = [
        (requirements.graphics_queue, families.graphics, "graphics"),
        (requirements.present_queue, families.present, "present"),
        (requirements.transfer_queue, families.transfer, "transfer"),
        (requirements.compute_queue, families.compute, "compute"),
    ];
    for (required, family, name) in queues {
        if required && family.is_none() {
            return Err(Rejection::MissingQueue(name));
        }
    }

    for extension in &requirements.required_extensions {
        if !info.extensions.iter().any(|available| available == extension) {
            return Err(Rejection::MissingExtension(extension.clone()));
        }
    }

    if info.swapchain_support.formats.is_empty() {
        return Err(Rejection::NoSurfaceFormats);
    }
    if info.swapchain_support.present_modes.is_empty() {
        return Err(Rejection::NoPresentModes);
    }

    if requirements.sampler_anisotropy && info.features.sampler_anisotropy != vk::TRUE {
        return Err(Rejection::NoSamplerAnisotropy);
    }

    Ok(families)
}

/// Ranking among adapters that already meet the requirements.
pub fn score(info: &PhysicalDeviceInfo) -> i64 {
    let mut score = i64::from(info.properties.limits.max_image_dimension2_d);
    if info.features.geometry_shader != vk::TRUE {
        score -= 10;
    }
    score
}

/// Pick the highest scoring adapter among those meeting `requirements`.
/// Adapters that fail a requirement are never selected, whatever their score.
pub fn select_physical_device(
    candidates: &[PhysicalDeviceInfo],
    requirements: &DeviceRequirements,
) -> Result<SelectedDevice, DeviceSelectionError> {
    if candidates.is_empty() {
        return Err(DeviceSelectionError::NoPhysicalDevice);
    }

    let mut best: Option<(usize, i64, QueueFamilyIndices)> = None;

    for (index, info) in candidates.iter().enumerate() {
        let families = match check_requirements(info, requirements) {
            Ok(families) => families,
            Err(rejection) => {
                log::info!("Skipping {}: {}", info.name, rejection);
                continue;
            }
        };

        let device_score = score(info);
        log::debug!("{} scored {}", info.name, device_score);

        if best.map_or(true, |(_, best_score, _)| device_score > best_score) {
            best = Some((index, device_score, families));
        }
    }

    let (index, score, queue_families) = best.ok_or(DeviceSelectionError::NoSuitableDevice)?;

    Ok(SelectedDevice {
        index,
        score,
        info: candidates[index].clone(),
        queue_families,
    })
}

/// Enumerate the adapters visible to `instance` and snapshot their facts.
pub fn query_physical_devices(
    instance: &Instance,
    surface: &Surface,
) -> Result<Vec<PhysicalDeviceInfo>> {
    let handles = unsafe { instance.instance.enumerate_physical_devices() }
        .context("Failed to enumerate physical devices")?;

    handles
        .into_iter()
        .map(|handle| query_physical_device(instance, surface, handle))
        .collect()
}

fn query_physical_device(
    instance: &Instance,
    surface: &Surface,
    handle: vk::PhysicalDevice,
) -> Result<PhysicalDeviceInfo> {
    let vk_instance = &instance.instance;

    let (properties, features, memory_properties, queue_families) = unsafe {
        (
            vk_instance.get_physical_device_properties(handle),
            vk_instance.get_physical_device_features(handle),
            vk_instance.get_physical_device_memory_properties(handle),
            vk_instance.get_physical_device_queue_family_properties(handle),
        )
    };

    let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
        .to_string_lossy()
        .into_owned();

    let present_support = (0..queue_families.len() as u32)
        .map(|family| surface.supports_present(handle, family))
        .collect::<Result<Vec<_>>>()?;

    let extensions = unsafe { vk_instance.enumerate_device_extension_properties(handle) }
        .with_context(|| format!("Failed to enumerate extensions of {}", name))?
        .iter()
        .map(|ext| {
            unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }
                .to_string_lossy()
                .into_owned()
        })
        .collect();

    let swapchain_support = surface.query_support(handle)?;

    Ok(PhysicalDeviceInfo {
        handle,
        name,
        properties,
        features,
        memory_properties,
        queue_families,
        present_support,
        extensions,
        swapchain_support,
    })
}

/// Log what was picked: versions and how much memory lives where.
pub fn log_device_info(info: &PhysicalDeviceInfo) {
    const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
    let properties = &info.properties;

    log::info!("Selected GPU: {} ({:?})", info.name, properties.device_type);
    log::info!(
        "Driver version: {}.{}.{}",
        vk::api_version_major(properties.driver_version),
        vk::api_version_minor(properties.driver_version),
        vk::api_version_patch(properties.driver_version)
    );
    log::info!(
        "API version: {}.{}.{}",
        vk::api_version_major(properties.api_version),
        vk::api_version_minor(properties.api_version),
        vk::api_version_patch(properties.api_version)
    );

    let memory = &info.memory_properties;
    for heap in &memory.memory_heaps[..memory.memory_heap_count as usize] {
        let size = heap.size as f64 / GIB;
        if heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL) {
            log::info!("Local GPU memory: {:.2} GiB", size);
        } else {
            log::info!("Shared system memory: {:.2} GiB", size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    fn device(
        name: &str,
        device_type: vk::PhysicalDeviceType,
        max_dimension: u32,
    ) -> PhysicalDeviceInfo {
        let mut properties = vk::PhysicalDeviceProperties::default();
        properties.device_type = device_type;
        properties.limits.max_image_dimension2_d = max_dimension;

        let features = vk::PhysicalDeviceFeatures {
            sampler_anisotropy: vk::TRUE,
            geometry_shader: vk::TRUE,
            ..Default::default()
        };

        PhysicalDeviceInfo {
            handle: vk::PhysicalDevice::null(),
            name: name.to_string(),
            properties,
            features,
            memory_properties: vk::PhysicalDeviceMemoryProperties::default(),
            queue_families: vec![family(
                vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            )],
            present_support: vec![true],
            extensions: vec!["VK_KHR_swapchain".to_string()],
            swapchain_support: SwapchainSupport {
                capabilities: vk::SurfaceCapabilitiesKHR::default(),
                formats: vec![vk::SurfaceFormatKHR::default()],
                present_modes: vec![vk::PresentModeKHR::FIFO],
            },
        }
    }

    #[test]
    fn test_default_requirements() {
        let requirements = DeviceRequirements::default();
        assert!(requirements.graphics_queue && requirements.present_queue);
        assert!(requirements.transfer_queue && requirements.compute_queue);
        assert!(requirements.discrete_gpu && requirements.sampler_anisotropy);
        assert_eq!(requirements.required_extensions, vec!["VK_KHR_swapchain"]);
    }

    #[test]
    fn test_combined_family_serves_graphics_and_present() {
        let requirements = DeviceRequirements {
            compute_queue: false,
            transfer_queue: false,
            discrete_gpu: false,
            ..Default::default()
        };
        let mut info = device("combined", vk::PhysicalDeviceType::INTEGRATED_GPU, 8192);
        info.queue_families = vec![family(vk::QueueFlags::GRAPHICS)];

        let selected = select_physical_device(&[info], &requirements).unwrap();

        assert_eq!(selected.index, 0);
        assert_eq!(selected.queue_families.graphics, Some(0));
        assert_eq!(selected.queue_families.graphics, selected.queue_families.present);
    }

    #[test]
    fn test_discrete_beats_integrated_that_fails_requirements() {
        let integrated = device("integrated", vk::PhysicalDeviceType::INTEGRATED_GPU, 32768);
        let discrete = device("discrete", vk::PhysicalDeviceType::DISCRETE_GPU, 16384);

        let selected =
            select_physical_device(&[integrated, discrete], &DeviceRequirements::default())
                .unwrap();

        assert_eq!(selected.index, 1);
        assert_eq!(selected.info.name, "discrete");
        assert_eq!(selected.score, 16384);
    }

    #[test]
    fn test_failing_device_never_selected_despite_score() {
        let mut big = device("big", vk::PhysicalDeviceType::DISCRETE_GPU, 65536);
        big.extensions.clear();
        let small = device("small", vk::PhysicalDeviceType::DISCRETE_GPU, 4096);

        let selected =
            select_physical_device(&[big, small], &DeviceRequirements::default()).unwrap();

        assert_eq!(selected.info.name, "small");
    }

    #[test]
    fn test_no_adapters() {
        let result = select_physical_device(&[], &DeviceRequirements::default());
        assert_eq!(result.unwrap_err(), DeviceSelectionError::NoPhysicalDevice);
    }

    #[test]
    fn test_single_adapter_failing_requirements() {
        let info = device("igpu", vk::PhysicalDeviceType::INTEGRATED_GPU, 16384);
        let result = select_physical_device(&[info], &DeviceRequirements::default());
        assert_eq!(result.unwrap_err(), DeviceSelectionError::NoSuitableDevice);
    }

    #[test]
    fn test_rejections() {
        let requirements = DeviceRequirements::default();

        let mut info = device("gpu", vk::PhysicalDeviceType::DISCRETE_GPU, 16384);
        info.swapchain_support.formats.clear();
        assert_eq!(check_requirements(&info, &requirements), Err(Rejection::NoSurfaceFormats));

        let mut info = device("gpu", vk::PhysicalDeviceType::DISCRETE_GPU, 16384);
        info.swapchain_support.present_modes.clear();
        assert_eq!(check_requirements(&info, &requirements), Err(Rejection::NoPresentModes));

        let mut info = device("gpu", vk::PhysicalDeviceType::DISCRETE_GPU, 16384);
        info.features.sampler_anisotropy = vk::FALSE;
        assert_eq!(
            check_requirements(&info, &requirements),
            Err(Rejection::NoSamplerAnisotropy)
        );

        let mut info = device("gpu", vk::PhysicalDeviceType::DISCRETE_GPU, 16384);
        info.queue_families = vec![family(vk::QueueFlags::GRAPHICS)];
        assert_eq!(
            check_requirements(&info, &requirements),
            Err(Rejection::MissingQueue("transfer"))
        );

        let mut info = device("gpu", vk::PhysicalDeviceType::DISCRETE_GPU, 16384);
        info.extensions = vec!["VK_KHR_maintenance1".to_string()];
        assert_eq!(
            check_requirements(&info, &requirements),
            Err(Rejection::MissingExtension("VK_KHR_swapchain".to_string()))
        );
    }

    #[test]
    fn test_missing_geometry_shader_costs_ten() {
        let mut info = device("gpu", vk::PhysicalDeviceType::DISCRETE_GPU, 16384);
        info.features.geometry_shader = vk::FALSE;
        assert_eq!(score(&info), 16374);
    }

    #[test]
    fn test_dedicated_transfer_family_preferred() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
        ];

        let indices = find_queue_families(&families, &[true, false, false]);

        assert_eq!(indices.graphics, Some(0));
        assert_eq!(indices.present, Some(0));
        assert_eq!(indices.transfer, Some(1));
        assert_eq!(indices.compute, Some(2));
        assert_eq!(indices.unique(), vec![0, 1, 2]);
    }

    #[test]
    fn test_present_falls_back_to_first_presenting_family() {
        let families = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::COMPUTE),
        ];

        let indices = find_queue_families(&families, &[false, true, true]);

        assert_eq!(indices.graphics, Some(0));
        assert_eq!(indices.present, Some(1));
        assert_eq!(indices.transfer, None);
    }

    #[test]
    fn test_empty_families_are_ignored() {
        let mut empty = family(vk::QueueFlags::GRAPHICS);
        empty.queue_count = 0;

        let indices = find_queue_families(&[empty], &[true]);

        assert_eq!(indices, QueueFamilyIndices::default());
    }
}
