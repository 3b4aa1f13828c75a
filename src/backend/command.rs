// Per-frame command buffers, allocated from the device's shared pool

use anyhow::{Context, Result};
use ash::vk;
use ash::vk::Handle;
use std::sync::Arc;

use super::tracker::{ObjectId, ObjectKind};
use super::Device;

pub struct CommandBuffers {
    pub buffers: Vec<vk::CommandBuffer>,
    ids: Vec<ObjectId>,
    device: Arc<Device>,
}

impl CommandBuffers {
    pub fn allocate(device: Arc<Device>, count: usize) -> Result<Self> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(device.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count as u32);

        let buffers = unsafe { device.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffers")?;

        let pool_id = ObjectId::new(ObjectKind::CommandPool, device.command_pool.as_raw());
        let ids = buffers
            .iter()
            .map(|cmd| device.track(ObjectKind::CommandBuffer, cmd.as_raw(), &[pool_id]))
            .collect();

        log::debug!("Allocated {} command buffers", buffers.len());
        Ok(Self {
            buffers,
            ids,
            device,
        })
    }

    pub fn get(&self, slot: usize) -> Result<vk::CommandBuffer> {
        self.buffers
            .get(slot)
            .copied()
            .with_context(|| format!("No command buffer for slot {}", slot))
    }

    /// Reset the slot's buffer and start recording into it.
    pub fn begin(&self, slot: usize) -> Result<vk::CommandBuffer> {
        let cmd = self.get(slot)?;
        let begin_info = vk::CommandBufferBeginInfo::builder();

        unsafe {
            self.device
                .device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .context("Failed to reset command buffer")?;
            self.device
                .device
                .begin_command_buffer(cmd, &begin_info)
                .context("Failed to begin command buffer")?;
        }
        Ok(cmd)
    }

    pub fn end(&self, slot: usize) -> Result<()> {
        let cmd = self.get(slot)?;
        unsafe { self.device.device.end_command_buffer(cmd) }
            .context("Failed to end command buffer")
    }
}

impl Drop for CommandBuffers {
    fn drop(&mut self) {
        unsafe {
            self.device
                .device
                .free_command_buffers(self.device.command_pool, &self.buffers)
        };
        for id in self.ids.drain(..) {
            self.device.untrack(id);
        }
    }
}
