// Synchronization primitives
//
// Fences, semaphores for GPU-CPU and GPU-GPU sync. One set per frame in
// flight: the fence bounds how far the CPU can run ahead of the GPU.

use anyhow::{Context, Result};
use ash::vk;
use ash::vk::Handle;
use std::sync::Arc;

use super::tracker::{ObjectId, ObjectKind};
use super::Device;

/// Frame synchronization - one per frame in flight
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
    ids: [ObjectId; 3],
    device: Arc<Device>,
}

impl FrameSync {
    pub fn new(device: Arc<Device>) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        // Signaled so the first wait on every slot returns immediately
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        let vk_device = &device.device;
        let image_available = unsafe { vk_device.create_semaphore(&semaphore_info, None) }
            .context("Failed to create image-available semaphore")?;
        let render_finished = match unsafe { vk_device.create_semaphore(&semaphore_info, None) } {
            Ok(semaphore) => semaphore,
            Err(e) => {
                unsafe { vk_device.destroy_semaphore(image_available, None) };
                return Err(e).context("Failed to create render-finished semaphore");
            }
        };
        let in_flight_fence = match unsafe { vk_device.create_fence(&fence_info, None) } {
            Ok(fence) => fence,
            Err(e) => {
                unsafe {
                    vk_device.destroy_semaphore(image_available, None);
                    vk_device.destroy_semaphore(render_finished, None);
                }
                return Err(e).context("Failed to create in-flight fence");
            }
        };

        let ids = [
            device.track(ObjectKind::Semaphore, image_available.as_raw(), &[]),
            device.track(ObjectKind::Semaphore, render_finished.as_raw(), &[]),
            device.track(ObjectKind::Fence, in_flight_fence.as_raw(), &[]),
        ];

        Ok(Self {
            image_available,
            render_finished,
            in_flight_fence,
            ids,
            device,
        })
    }

    /// Create `count` independent slots.
    pub fn create_frames(device: &Arc<Device>, count: usize) -> Result<Vec<Self>> {
        (0..count).map(|_| Self::new(device.clone())).collect()
    }

    /// Block until the GPU has finished the last submission using this slot.
    pub fn wait(&self) -> Result<()> {
        unsafe {
            self.device
                .device
                .wait_for_fences(&[self.in_flight_fence], true, u64::MAX)
        }
        .context("Failed to wait for in-flight fence")
    }

    pub fn reset(&self) -> Result<()> {
        unsafe { self.device.device.reset_fences(&[self.in_flight_fence]) }
            .context("Failed to reset in-flight fence")
    }
}

impl Drop for FrameSync {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_semaphore(self.image_available, None);
            self.device.device.destroy_semaphore(self.render_finished, None);
            self.device.device.destroy_fence(self.in_flight_fence, None);
        }
        for id in self.ids {
            self.device.untrack(id);
        }
    }
}
