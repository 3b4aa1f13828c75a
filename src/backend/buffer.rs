// Buffer utilities for vertex, index, and uniform buffers
//
// `GpuBuffer` owns one VkBuffer and its dedicated allocation. The vertex,
// index and uniform wrappers are thin specializations on top of it; uploads
// to device-local memory all go through the same staging path.

use anyhow::{Context, Result};
use ash::vk;
use ash::vk::Handle;
use bytemuck::Pod;
use std::ptr::NonNull;
use std::sync::Arc;

use super::tracker::{ObjectId, ObjectKind};
use super::Device;

/// First memory type allowed by `type_filter` whose flags contain `properties`.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..memory_properties.memory_type_count).find(|&i| {
        let allowed = type_filter & (1 << i) != 0;
        allowed
            && memory_properties.memory_types[i as usize]
                .property_flags
                .contains(properties)
    })
}

/// Byte size of `count` elements of `T`, or `None` for an empty slice.
pub fn slice_size<T>(data: &[T]) -> Option<vk::DeviceSize> {
    if data.is_empty() {
        None
    } else {
        Some(std::mem::size_of_val(data) as vk::DeviceSize)
    }
}

pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    mapped: Option<NonNull<u8>>,
    id: ObjectId,
    device: Arc<Device>,
}

impl GpuBuffer {
    pub fn new(
        device: Arc<Device>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_properties: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let vk_device = &device.device;
        let buffer = unsafe { vk_device.create_buffer(&buffer_info, None) }
            .context("Failed to create buffer")?;

        let requirements = unsafe { vk_device.get_buffer_memory_requirements(buffer) };
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(
                device.memory_type_index(requirements.memory_type_bits, memory_properties),
            );

        let memory = match unsafe { vk_device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { vk_device.destroy_buffer(buffer, None) };
                return Err(e).context("Failed to allocate buffer memory");
            }
        };

        if let Err(e) = unsafe { vk_device.bind_buffer_memory(buffer, memory, 0) } {
            unsafe {
                vk_device.destroy_buffer(buffer, None);
                vk_device.free_memory(memory, None);
            }
            return Err(e).context("Failed to bind buffer memory");
        }

        let id = device.track(ObjectKind::Buffer, buffer.as_raw(), &[]);
        log::trace!("Created buffer of {} bytes ({:?})", size, usage);

        Ok(Self {
            buffer,
            memory,
            size,
            mapped: None,
            id,
            device,
        })
    }

    /// Host-visible, coherent buffer filled with `bytes`.
    pub fn host_visible_with_data(
        device: Arc<Device>,
        usage: vk::BufferUsageFlags,
        bytes: &[u8],
    ) -> Result<Self> {
        let mut buffer = Self::new(
            device,
            bytes.len() as vk::DeviceSize,
            usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        buffer.write(0, bytes)?;
        Ok(buffer)
    }

    /// Device-local buffer filled through a temporary staging buffer. Blocks
    /// until the copy has finished on the GPU.
    pub fn device_local_with_data(
        device: Arc<Device>,
        usage: vk::BufferUsageFlags,
        bytes: &[u8],
    ) -> Result<Self> {
        let staging = Self::host_visible_with_data(
            device.clone(),
            vk::BufferUsageFlags::TRANSFER_SRC,
            bytes,
        )?;

        let buffer = Self::new(
            device,
            staging.size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        buffer.copy_from(&staging)?;

        Ok(buffer)
    }

    /// Copy the whole of `src` into this buffer and wait for it.
    pub fn copy_from(&self, src: &GpuBuffer) -> Result<()> {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: src.size.min(self.size),
        };
        self.device.run_single_use(|device, cmd| unsafe {
            device.cmd_copy_buffer(cmd, src.buffer, self.buffer, &[region]);
        })
    }

    /// Map the whole allocation and keep it mapped until `unmap` or drop.
    pub fn map(&mut self) -> Result<NonNull<u8>> {
        if let Some(ptr) = self.mapped {
            return Ok(ptr);
        }

        let raw = unsafe {
            self.device.device.map_memory(
                self.memory,
                0,
                vk::WHOLE_SIZE,
                vk::MemoryMapFlags::empty(),
            )
        }
        .context("Failed to map buffer memory")?;

        let ptr = NonNull::new(raw.cast::<u8>()).context("Driver returned a null mapping")?;
        self.mapped = Some(ptr);
        Ok(ptr)
    }

    pub fn unmap(&mut self) {
        if self.mapped.take().is_some() {
            unsafe { self.device.device.unmap_memory(self.memory) };
        }
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    /// Copy `bytes` in at `offset`. Buffers that were not mapped before the
    /// call are unmapped again afterwards.
    pub fn write(&mut self, offset: vk::DeviceSize, bytes: &[u8]) -> Result<()> {
        let end = offset + bytes.len() as vk::DeviceSize;
        if end > self.size {
            anyhow::bail!("Write of {} bytes at {} overflows buffer of {}", bytes.len(), offset, self.size);
        }

        let was_mapped = self.is_mapped();
        let ptr = self.map()?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                ptr.as_ptr().add(offset as usize),
                bytes.len(),
            );
        }
        if !was_mapped {
            self.unmap();
        }
        Ok(())
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        self.unmap();
        unsafe {
            self.device.device.destroy_buffer(self.buffer, None);
            self.device.device.free_memory(self.memory, None);
        }
        self.device.untrack(self.id);
    }
}

/// Device-local vertex data.
pub struct VertexBuffer {
    pub buffer: GpuBuffer,
}

impl VertexBuffer {
    /// Upload `vertices`. An empty slice creates nothing and yields `None`.
    pub fn new<V: Pod>(device: Arc<Device>, vertices: &[V]) -> Result<Option<Self>> {
        if slice_size(vertices).is_none() {
            log::warn!("Vertex buffer requested for zero vertices, skipping");
            return Ok(None);
        }

        let buffer = GpuBuffer::device_local_with_data(
            device,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            bytemuck::cast_slice(vertices),
        )
        .context("Failed to create vertex buffer")?;

        log::debug!("Vertex buffer: {} vertices", vertices.len());
        Ok(Some(Self { buffer }))
    }

    pub fn bind(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        unsafe { device.cmd_bind_vertex_buffers(cmd, 0, &[self.buffer.buffer], &[0]) };
    }
}

/// Device-local 32-bit index data.
pub struct IndexBuffer {
    pub buffer: GpuBuffer,
    pub count: u32,
}

impl IndexBuffer {
    /// Upload `indices`. An empty slice creates nothing and yields `None`.
    pub fn new(device: Arc<Device>, indices: &[u32]) -> Result<Option<Self>> {
        if slice_size(indices).is_none() {
            log::warn!("Index buffer requested for zero indices, skipping");
            return Ok(None);
        }

        let buffer = GpuBuffer::device_local_with_data(
            device,
            vk::BufferUsageFlags::INDEX_BUFFER,
            bytemuck::cast_slice(indices),
        )
        .context("Failed to create index buffer")?;

        log::debug!("Index buffer: {} indices", indices.len());
        Ok(Some(Self {
            buffer,
            count: indices.len() as u32,
        }))
    }

    pub fn bind(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        unsafe { device.cmd_bind_index_buffer(cmd, self.buffer.buffer, 0, vk::IndexType::UINT32) };
    }
}

/// One persistently mapped uniform buffer per frame in flight.
pub struct UniformBuffers {
    buffers: Vec<GpuBuffer>,
}

impl UniformBuffers {
    pub fn new<T: Pod>(device: Arc<Device>, frames_in_flight: usize) -> Result<Self> {
        let size = std::mem::size_of::<T>() as vk::DeviceSize;

        let buffers = (0..frames_in_flight)
            .map(|_| {
                let mut buffer = GpuBuffer::new(
                    device.clone(),
                    size,
                    vk::BufferUsageFlags::UNIFORM_BUFFER,
                    vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                )?;
                buffer.map()?;
                Ok(buffer)
            })
            .collect::<Result<Vec<_>>>()
            .context("Failed to create uniform buffers")?;

        Ok(Self { buffers })
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn buffer(&self, frame: usize) -> Option<&GpuBuffer> {
        self.buffers.get(frame)
    }

    pub fn update<T: Pod>(&mut self, frame: usize, value: &T) -> Result<()> {
        let count = self.buffers.len();
        let buffer = self
            .buffers
            .get_mut(frame)
            .with_context(|| format!("No uniform buffer for frame {} of {}", frame, count))?;
        buffer.write(0, bytemuck::bytes_of(value))
    }
}
