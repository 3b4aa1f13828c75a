// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Physical device selection (see physical_device.rs for the rules)
// - Logical device + one queue per unique family
// - Shared command pool on the graphics family
// - Blocking single-use command submission for uploads

use anyhow::{Context, Result};
use ash::vk;
use ash::vk::Handle;
use std::ffi::CString;
use std::sync::Arc;

use super::buffer::find_memory_type;
use super::physical_device::{
    log_device_info, query_physical_devices, select_physical_device, DeviceRequirements,
    SwapchainSupport,
};
use super::tracker::{ObjectId, ObjectKind};
use super::{Instance, Surface};

/// Logical device wrapper with automatic cleanup.
///
/// Every GPU resource holds an `Arc<Device>`, so the device is destroyed only
/// after the last of them.
pub struct Device {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Features actually enabled on the logical device.
    pub enabled_features: vk::PhysicalDeviceFeatures,

    pub graphics_family: u32,
    pub present_family: u32,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,

    pub command_pool: vk::CommandPool,

    id: ObjectId,
    command_pool_id: ObjectId,
    pub instance: Arc<Instance>,
}

impl Device {
    pub fn new(
        instance: Arc<Instance>,
        surface: &Surface,
        requirements: &DeviceRequirements,
    ) -> Result<Arc<Self>> {
        let candidates = query_physical_devices(&instance, surface)?;
        log::info!("Found {} physical device(s)", candidates.len());

        let selected = select_physical_device(&candidates, requirements)?;
        log::info!(
            "Selected physical device #{} (score {})",
            selected.index,
            selected.score
        );
        let info = selected.info;
        log_device_info(&info);

        let families = selected.queue_families;
        let graphics_family = families.graphics.context("Selected device has no graphics queue")?;
        let present_family = families.present.context("Selected device has no present queue")?;

        let queue_priorities = [1.0];
        let queue_create_infos: Vec<_> = families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let enabled_features = vk::PhysicalDeviceFeatures {
            sampler_anisotropy: info.features.sampler_anisotropy,
            fill_mode_non_solid: info.features.fill_mode_non_solid,
            ..Default::default()
        };

        let extension_names = requirements
            .required_extensions
            .iter()
            .map(|name| CString::new(name.as_str()))
            .collect::<Result<Vec<_>, _>>()?;
        let extension_ptrs: Vec<_> = extension_names.iter().map(|name| name.as_ptr()).collect();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_ptrs)
            .enabled_features(&enabled_features);

        let device = unsafe { instance.instance.create_device(info.handle, &create_info, None) }
            .context("Failed to create logical device")?;

        let queue = |family: Option<u32>| match family {
            Some(family) => unsafe { device.get_device_queue(family, 0) },
            None => vk::Queue::null(),
        };
        let graphics_queue = queue(families.graphics);
        let present_queue = queue(families.present);

        log::info!(
            "Queue families: graphics {:?}, present {:?}, transfer {:?}, compute {:?}",
            families.graphics,
            families.present,
            families.transfer,
            families.compute
        );

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(graphics_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let command_pool = match unsafe { device.create_command_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e).context("Failed to create command pool");
            }
        };

        let id = instance.track(ObjectKind::Device, device.handle().as_raw(), &[instance.id()]);
        let command_pool_id = instance.track(ObjectKind::CommandPool, command_pool.as_raw(), &[id]);

        Ok(Arc::new(Self {
            device,
            physical_device: info.handle,
            properties: info.properties,
            memory_properties: info.memory_properties,
            enabled_features,
            graphics_family,
            present_family,
            graphics_queue,
            present_queue,
            command_pool,
            id,
            command_pool_id,
            instance,
        }))
    }

    /// Register a handle created from this device. The device itself is
    /// always recorded as a parent.
    pub fn track(&self, kind: ObjectKind, raw: u64, parents: &[ObjectId]) -> ObjectId {
        let mut all = Vec::with_capacity(parents.len() + 1);
        all.push(self.id);
        all.extend_from_slice(parents);
        self.instance.track(kind, raw, &all)
    }

    pub fn untrack(&self, id: ObjectId) {
        self.instance.untrack(id);
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("Failed to wait for device idle")
    }

    /// Surface capabilities change with the window, so query them fresh.
    pub fn surface_support(&self, surface: &Surface) -> Result<SwapchainSupport> {
        surface.query_support(self.physical_device)
    }

    pub fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        unsafe {
            self.instance
                .instance
                .get_physical_device_format_properties(self.physical_device, format)
        }
    }

    /// Memory type index for an allocation. A miss is logged and falls back
    /// to type 0.
    pub fn memory_type_index(
        &self,
        type_filter: u32,
        properties: vk::MemoryPropertyFlags,
    ) -> u32 {
        find_memory_type(&self.memory_properties, type_filter, properties).unwrap_or_else(|| {
            log::warn!(
                "No memory type matches filter {:#b} with {:?}, falling back to type 0",
                type_filter,
                properties
            );
            0
        })
    }

    /// Anisotropy level to sample with, or `None` when the feature is off.
    pub fn max_anisotropy(&self) -> Option<f32> {
        (self.enabled_features.sampler_anisotropy == vk::TRUE)
            .then_some(self.properties.limits.max_sampler_anisotropy)
    }

    /// Allocate and begin a one-time command buffer on the graphics pool.
    pub fn begin_single_use_commands(&self) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let cmd = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate single-use command buffer")?[0];

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        if let Err(e) = unsafe { self.device.begin_command_buffer(cmd, &begin_info) } {
            unsafe { self.device.free_command_buffers(self.command_pool, &[cmd]) };
            return Err(e).context("Failed to begin single-use command buffer");
        }

        Ok(cmd)
    }

    /// End `cmd`, submit it to the graphics queue and block until it is done.
    /// The buffer is freed whether or not submission succeeds.
    pub fn end_single_use_commands(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let result = unsafe {
            self.device.end_command_buffer(cmd).and_then(|_| {
                let command_buffers = [cmd];
                let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
                self.device.queue_submit(
                    self.graphics_queue,
                    &[submit_info.build()],
                    vk::Fence::null(),
                )?;
                self.device.queue_wait_idle(self.graphics_queue)
            })
        };

        unsafe { self.device.free_command_buffers(self.command_pool, &[cmd]) };

        result.context("Failed to submit single-use commands")
    }

    /// Record with `record` and run the commands to completion.
    pub fn run_single_use<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let cmd = self.begin_single_use_commands()?;
        record(&self.device, cmd);
        self.end_single_use_commands(cmd)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        if let Err(e) = self.wait_idle() {
            log::error!("{:?}", e);
        }

        unsafe {
            self.device.destroy_command_pool(self.command_pool, None);
            self.instance.untrack(self.command_pool_id);

            self.device.destroy_device(None);
            self.instance.untrack(self.id);
        }
    }
}
