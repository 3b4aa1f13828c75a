// Presentation surface
//
// Connects the Vulkan instance to a native window. Also the place where
// per-device presentation capabilities are queried, since every one of those
// calls needs the surface handle.

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::vk;
use ash::vk::Handle;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::sync::Arc;

use super::physical_device::SwapchainSupport;
use super::tracker::{ObjectId, ObjectKind};
use super::Instance;

pub struct Surface {
    pub loader: khr::Surface,
    pub surface: vk::SurfaceKHR,
    id: ObjectId,
    instance: Arc<Instance>,
}

impl Surface {
    pub fn new<W>(instance: Arc<Instance>, window: &W) -> Result<Self>
    where
        W: HasRawWindowHandle + HasRawDisplayHandle,
    {
        let surface = unsafe {
            ash_window::create_surface(
                &instance.entry,
                &instance.instance,
                window.raw_display_handle(),
                window.raw_window_handle(),
                None,
            )
        }
        .context("Failed to create window surface")?;

        let loader = khr::Surface::new(&instance.entry, &instance.instance);
        let id = instance.track(ObjectKind::Surface, surface.as_raw(), &[instance.id()]);

        log::debug!("Window surface created");

        Ok(Self {
            loader,
            surface,
            id,
            instance,
        })
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Whether `queue_family` of `physical_device` can present to this surface.
    pub fn supports_present(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
    ) -> Result<bool> {
        unsafe {
            self.loader.get_physical_device_surface_support(
                physical_device,
                queue_family,
                self.surface,
            )
        }
        .context("Failed to query surface presentation support")
    }

    /// Capabilities, formats and present modes. Capabilities change with the
    /// window size, so this is re-queried before every swapchain build.
    pub fn query_support(&self, physical_device: vk::PhysicalDevice) -> Result<SwapchainSupport> {
        unsafe {
            let capabilities = self
                .loader
                .get_physical_device_surface_capabilities(physical_device, self.surface)
                .context("Failed to query surface capabilities")?;
            let formats = self
                .loader
                .get_physical_device_surface_formats(physical_device, self.surface)
                .context("Failed to query surface formats")?;
            let present_modes = self
                .loader
                .get_physical_device_surface_present_modes(physical_device, self.surface)
                .context("Failed to query surface present modes")?;

            Ok(SwapchainSupport {
                capabilities,
                formats,
                present_modes,
            })
        }
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        log::debug!("Destroying window surface");
        unsafe {
            self.loader.destroy_surface(self.surface, None);
        }
        self.instance.untrack(self.id);
    }
}
