// Images: sampled textures and the depth attachment
//
// Layout transitions are recorded as single-use commands. Only the three
// transitions the renderer performs are supported; anything else is an error
// rather than a guessed barrier.

use anyhow::{Context, Result};
use ash::vk;
use ash::vk::Handle;
use std::sync::Arc;

use super::buffer::GpuBuffer;
use super::error::BackendError;
use super::tracker::{ObjectId, ObjectKind};
use super::Device;

/// Depth formats in order of preference.
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

/// First candidate whose optimal tiling supports depth/stencil attachments.
pub fn choose_depth_format<F>(
    candidates: &[vk::Format],
    format_properties: F,
) -> Result<vk::Format, BackendError>
where
    F: Fn(vk::Format) -> vk::FormatProperties,
{
    candidates
        .iter()
        .copied()
        .find(|&format| {
            format_properties(format)
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        })
        .ok_or(BackendError::NoSupportedDepthFormat)
}

pub fn has_stencil_component(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D32_SFLOAT_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D16_UNORM_S8_UINT
    )
}

/// Aspect a barrier must cover when moving to `new_layout`.
pub fn barrier_aspect(new_layout: vk::ImageLayout, format: vk::Format) -> vk::ImageAspectFlags {
    if new_layout == vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL {
        if has_stencil_component(format) {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        } else {
            vk::ImageAspectFlags::DEPTH
        }
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionMasks {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

pub fn transition_masks(
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Result<TransitionMasks, BackendError> {
    use vk::ImageLayout as L;

    match (old, new) {
        (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => Ok(TransitionMasks {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::TRANSFER_WRITE,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
        }),
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => Ok(TransitionMasks {
            src_access: vk::AccessFlags::TRANSFER_WRITE,
            dst_access: vk::AccessFlags::SHADER_READ,
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
        }),
        (L::UNDEFINED, L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL) => Ok(TransitionMasks {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        }),
        _ => Err(BackendError::UnsupportedLayoutTransition { old, new }),
    }
}

/// A 2D image with its own memory and a single view.
pub struct Image2D {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    image_id: ObjectId,
    view_id: ObjectId,
    device: Arc<Device>,
}

impl Image2D {
    pub fn new(
        device: Arc<Device>,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
    ) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let vk_device = &device.device;
        let image = unsafe { vk_device.create_image(&image_info, None) }
            .context("Failed to create image")?;

        let requirements = unsafe { vk_device.get_image_memory_requirements(image) };
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(device.memory_type_index(
                requirements.memory_type_bits,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            ));

        let memory = match unsafe { vk_device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { vk_device.destroy_image(image, None) };
                return Err(e).context("Failed to allocate image memory");
            }
        };

        let view = unsafe {
            vk_device
                .bind_image_memory(image, memory, 0)
                .and_then(|_| {
                    let view_info = vk::ImageViewCreateInfo::builder()
                        .image(image)
                        .view_type(vk::ImageViewType::TYPE_2D)
                        .format(format)
                        .subresource_range(vk::ImageSubresourceRange {
                            aspect_mask: aspect,
                            base_mip_level: 0,
                            level_count: 1,
                            base_array_layer: 0,
                            layer_count: 1,
                        });
                    vk_device.create_image_view(&view_info, None)
                })
        };

        let view = match view {
            Ok(view) => view,
            Err(e) => {
                unsafe {
                    vk_device.destroy_image(image, None);
                    vk_device.free_memory(memory, None);
                }
                return Err(e).context("Failed to bind image memory or create its view");
            }
        };

        let image_id = device.track(ObjectKind::Image, image.as_raw(), &[]);
        let view_id = device.track(ObjectKind::ImageView, view.as_raw(), &[image_id]);

        Ok(Self {
            image,
            memory,
            view,
            format,
            extent,
            image_id,
            view_id,
            device,
        })
    }

    pub fn view_id(&self) -> ObjectId {
        self.view_id
    }

    /// Record and run a layout transition barrier for the whole image.
    pub fn transition_layout(&self, old: vk::ImageLayout, new: vk::ImageLayout) -> Result<()> {
        let masks = transition_masks(old, new)?;

        let barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(old)
            .new_layout(new)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: barrier_aspect(new, self.format),
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            })
            .src_access_mask(masks.src_access)
            .dst_access_mask(masks.dst_access)
            .build();

        self.device.run_single_use(|device, cmd| unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                masks.src_stage,
                masks.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        })
    }

    /// Copy tightly packed pixel data from `buffer` into the image, which
    /// must be in TRANSFER_DST_OPTIMAL.
    pub fn copy_from_buffer(&self, buffer: &GpuBuffer) -> Result<()> {
        let region = vk::BufferImageCopy::builder()
            .buffer_offset(0)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
            .image_extent(vk::Extent3D {
                width: self.extent.width,
                height: self.extent.height,
                depth: 1,
            })
            .build();

        self.device.run_single_use(|device, cmd| unsafe {
            device.cmd_copy_buffer_to_image(
                cmd,
                buffer.buffer,
                self.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        })
    }
}

impl Drop for Image2D {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_image_view(self.view, None);
            self.device.untrack(self.view_id);
            self.device.device.destroy_image(self.image, None);
            self.device.device.free_memory(self.memory, None);
            self.device.untrack(self.image_id);
        }
    }
}

/// Sampled RGBA8 texture with its sampler.
pub struct Texture {
    pub sampler: vk::Sampler,
    sampler_id: ObjectId,
    pub image: Image2D,
}

impl Texture {
    /// Upload `rgba` (4 bytes per pixel, rows tightly packed).
    pub fn from_pixels(device: Arc<Device>, width: u32, height: u32, rgba: &[u8]) -> Result<Self> {
        let expected = width as usize * height as usize * 4;
        if rgba.len() != expected {
            anyhow::bail!(
                "Texture data is {} bytes, expected {} for {}x{} RGBA",
                rgba.len(),
                expected,
                width,
                height
            );
        }

        let staging = GpuBuffer::host_visible_with_data(
            device.clone(),
            vk::BufferUsageFlags::TRANSFER_SRC,
            rgba,
        )?;

        let image = Image2D::new(
            device.clone(),
            vk::Extent2D { width, height },
            TEXTURE_FORMAT,
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            vk::ImageAspectFlags::COLOR,
        )
        .context("Failed to create texture image")?;

        image.transition_layout(vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL)?;
        image.copy_from_buffer(&staging)?;
        image.transition_layout(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )?;
        drop(staging);

        let max_anisotropy = device.max_anisotropy();
        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(max_anisotropy.is_some())
            .max_anisotropy(max_anisotropy.unwrap_or(1.0))
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .mip_lod_bias(0.0)
            .min_lod(0.0)
            .max_lod(0.0);

        let sampler = unsafe { device.device.create_sampler(&sampler_info, None) }
            .context("Failed to create texture sampler")?;
        let sampler_id = device.track(ObjectKind::Sampler, sampler.as_raw(), &[]);

        log::info!("Texture uploaded: {}x{}", width, height);

        Ok(Self {
            sampler,
            sampler_id,
            image,
        })
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        unsafe { self.image.device.device.destroy_sampler(self.sampler, None) };
        self.image.device.untrack(self.sampler_id);
    }
}

/// Depth attachment sized to the swapchain.
pub struct DepthImage {
    pub image: Image2D,
}

impl DepthImage {
    pub fn new(device: Arc<Device>, format: vk::Format, extent: vk::Extent2D) -> Result<Self> {
        let image = Image2D::new(
            device,
            extent,
            format,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            vk::ImageAspectFlags::DEPTH,
        )
        .context("Failed to create depth image")?;

        image.transition_layout(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        )?;

        log::debug!("Depth image {:?} {}x{}", format, extent.width, extent.height);
        Ok(Self { image })
    }

    pub fn view(&self) -> vk::ImageView {
        self.image.view
    }
}

/// Probe the device for a usable depth format.
pub fn find_depth_format(device: &Device) -> Result<vk::Format> {
    let format = choose_depth_format(&DEPTH_FORMAT_CANDIDATES, |format| {
        device.format_properties(format)
    })?;
    log::info!("Depth format: {:?}", format);
    Ok(format)
}
