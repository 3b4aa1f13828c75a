// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen, plus
// everything sized to them: image views, the depth attachment and one
// framebuffer per image. All of it is rebuilt together on recreation.

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::vk;
use ash::vk::Handle;
use std::sync::Arc;

use super::error::BackendError;
use super::image::DepthImage;
use super::physical_device::SwapchainSupport;
use super::tracker::{ObjectId, ObjectKind};
use super::{Device, RenderPass, Surface};

/// Everything decided before a swapchain is created. Derived purely from the
/// surface support and the requested size, so equal inputs give equal configs.
#[derive(Debug, Clone)]
pub struct SwapchainConfig {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub sharing_mode: vk::SharingMode,
    /// Families sharing the images, only filled for CONCURRENT sharing.
    pub queue_family_indices: Vec<u32>,
}

impl PartialEq for SwapchainConfig {
    fn eq(&self, other: &Self) -> bool {
        self.surface_format.format == other.surface_format.format
            && self.surface_format.color_space == other.surface_format.color_space
            && self.present_mode == other.present_mode
            && self.extent.width == other.extent.width
            && self.extent.height == other.extent.height
            && self.image_count == other.image_count
            && self.pre_transform == other.pre_transform
            && self.sharing_mode == other.sharing_mode
            && self.queue_family_indices == other.queue_family_indices
    }
}

impl SwapchainConfig {
    pub fn choose(
        support: &SwapchainSupport,
        graphics_family: u32,
        present_family: u32,
        width: u32,
        height: u32,
        preferred_present_mode: Option<vk::PresentModeKHR>,
    ) -> Result<Self, BackendError> {
        let surface_format = choose_surface_format(&support.formats)
            .ok_or(BackendError::EmptySurfaceSupport("surface formats"))?;
        let present_mode = choose_present_mode(&support.present_modes, preferred_present_mode);
        let capabilities = &support.capabilities;

        let (sharing_mode, queue_family_indices) = if graphics_family != present_family {
            (vk::SharingMode::CONCURRENT, vec![graphics_family, present_family])
        } else {
            (vk::SharingMode::EXCLUSIVE, Vec::new())
        };

        Ok(Self {
            surface_format,
            present_mode,
            extent: choose_extent(capabilities, width, height),
            image_count: choose_image_count(capabilities),
            pre_transform: capabilities.current_transform,
            sharing_mode,
            queue_family_indices,
        })
    }

    /// A zero-sized extent (minimized on some platforms) can not back a
    /// swapchain.
    pub fn has_area(&self) -> bool {
        self.extent.width > 0 && self.extent.height > 0
    }
}

/// BGRA8 sRGB with the sRGB colour space, else whatever comes first.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    let preferred = formats.iter().copied().find(|f| {
        f.format == vk::Format::B8G8R8A8_SRGB && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
    });

    preferred.or_else(|| {
        let fallback = formats.first().copied()?;
        log::warn!(
            "Preferred surface format unavailable, using {:?} / {:?}",
            fallback.format,
            fallback.color_space
        );
        Some(fallback)
    })
}

/// The configured mode when supported, otherwise MAILBOX, otherwise FIFO
/// which every implementation must offer.
pub fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    preferred: Option<vk::PresentModeKHR>,
) -> vk::PresentModeKHR {
    if let Some(mode) = preferred {
        if modes.contains(&mode) {
            return mode;
        }
        log::warn!("Present mode {:?} not supported by the surface", mode);
    }

    if modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

pub fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    vk::Extent2D {
        width: width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// What a swapchain rebuild needs from the rest of the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rebuild {
    /// The surface has no area right now; the old swapchain is kept.
    Deferred,
    /// New images in the format the render pass was built for.
    SameFormat,
    /// The colour format moved; the render pass and everything built against
    /// it must be rebuilt before framebuffers are created.
    FormatChanged { old: vk::Format, new: vk::Format },
}

impl Rebuild {
    pub fn plan(pass_format: vk::Format, config: &SwapchainConfig) -> Self {
        if !config.has_area() {
            Rebuild::Deferred
        } else if config.surface_format.format != pass_format {
            Rebuild::FormatChanged {
                old: pass_format,
                new: config.surface_format.format,
            }
        } else {
            Rebuild::SameFormat
        }
    }
}

/// One more than the minimum, capped by the maximum (0 means no maximum).
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { index: u32, suboptimal: bool },
    /// The surface changed; recreate and skip this frame.
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    /// Out of date or suboptimal; recreate before the next frame.
    OutOfDate,
}

pub struct Swapchain {
    pub loader: khr::Swapchain,
    pub swapchain: vk::SwapchainKHR,
    pub config: SwapchainConfig,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub framebuffers: Vec<vk::Framebuffer>,
    pub depth_format: vk::Format,
    depth: Option<DepthImage>,
    preferred_present_mode: Option<vk::PresentModeKHR>,
    id: ObjectId,
    view_ids: Vec<ObjectId>,
    framebuffer_ids: Vec<ObjectId>,
    surface: Arc<Surface>,
    device: Arc<Device>,
}

impl Swapchain {
    pub fn new(
        device: Arc<Device>,
        surface: Arc<Surface>,
        width: u32,
        height: u32,
        depth_format: vk::Format,
        preferred_present_mode: Option<vk::PresentModeKHR>,
    ) -> Result<Self> {
        let loader = khr::Swapchain::new(&device.instance.instance, &device.device);

        let mut swapchain = Self {
            loader,
            swapchain: vk::SwapchainKHR::null(),
            config: SwapchainConfig {
                surface_format: vk::SurfaceFormatKHR::default(),
                present_mode: vk::PresentModeKHR::FIFO,
                extent: vk::Extent2D::default(),
                image_count: 0,
                pre_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
                sharing_mode: vk::SharingMode::EXCLUSIVE,
                queue_family_indices: Vec::new(),
            },
            images: Vec::new(),
            image_views: Vec::new(),
            framebuffers: Vec::new(),
            depth_format,
            depth: None,
            preferred_present_mode,
            id: ObjectId::new(ObjectKind::Swapchain, 0),
            view_ids: Vec::new(),
            framebuffer_ids: Vec::new(),
            surface,
            device,
        };
        let config = swapchain.choose_config(width, height)?;
        swapchain.build(config)?;

        Ok(swapchain)
    }

    pub fn format(&self) -> vk::Format {
        self.config.surface_format.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.config.extent
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    fn choose_config(&self, width: u32, height: u32) -> Result<SwapchainConfig> {
        let support = self.device.surface_support(&self.surface)?;
        Ok(SwapchainConfig::choose(
            &support,
            self.device.graphics_family,
            self.device.present_family,
            width,
            height,
            self.preferred_present_mode,
        )?)
    }

    /// Create the handle, its image views and the depth image.
    fn build(&mut self, config: SwapchainConfig) -> Result<()> {
        if !config.has_area() {
            return Err(BackendError::ZeroExtent.into());
        }

        log::info!(
            "Creating swapchain: {}x{}, {} images, {:?}",
            config.extent.width,
            config.extent.height,
            config.image_count,
            config.present_mode
        );

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface.surface)
            .min_image_count(config.image_count)
            .image_format(config.surface_format.format)
            .image_color_space(config.surface_format.color_space)
            .image_extent(config.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(config.sharing_mode)
            .queue_family_indices(&config.queue_family_indices)
            .pre_transform(config.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(config.present_mode)
            .clipped(true);

        self.swapchain = unsafe { self.loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;
        self.id = self.device.track(
            ObjectKind::Swapchain,
            self.swapchain.as_raw(),
            &[self.surface.id()],
        );

        self.images = unsafe { self.loader.get_swapchain_images(self.swapchain) }
            .context("Failed to get swapchain images")?;

        for &image in &self.images {
            let create_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(config.surface_format.format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::IDENTITY,
                    g: vk::ComponentSwizzle::IDENTITY,
                    b: vk::ComponentSwizzle::IDENTITY,
                    a: vk::ComponentSwizzle::IDENTITY,
                })
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });

            let view = unsafe { self.device.device.create_image_view(&create_info, None) }
                .context("Failed to create swapchain image view")?;
            self.view_ids
                .push(self.device.track(ObjectKind::ImageView, view.as_raw(), &[self.id]));
            self.image_views.push(view);
        }

        self.depth = Some(DepthImage::new(
            self.device.clone(),
            self.depth_format,
            config.extent,
        )?);

        log::info!("Created swapchain with {} images", self.images.len());
        self.config = config;
        Ok(())
    }

    /// One framebuffer per swapchain image, each binding the image's view and
    /// the shared depth view.
    pub fn create_framebuffers(&mut self, render_pass: &RenderPass) -> Result<()> {
        let depth = self.depth.as_ref().context("Swapchain has no depth image")?;
        let extent = self.config.extent;

        for &view in &self.image_views {
            let attachments = [view, depth.view()];
            let framebuffer_info = vk::FramebufferCreateInfo::builder()
                .render_pass(render_pass.render_pass)
                .attachments(&attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);

            let framebuffer =
                unsafe { self.device.device.create_framebuffer(&framebuffer_info, None) }
                    .context("Failed to create framebuffer")?;

            let view_id = ObjectId::new(ObjectKind::ImageView, view.as_raw());
            self.framebuffer_ids.push(self.device.track(
                ObjectKind::Framebuffer,
                framebuffer.as_raw(),
                &[view_id, depth.image.view_id()],
            ));
            self.framebuffers.push(framebuffer);
        }

        log::debug!("Created {} framebuffers", self.framebuffers.len());
        Ok(())
    }

    pub fn framebuffer(&self, image_index: u32) -> Result<vk::Framebuffer, BackendError> {
        self.framebuffers
            .get(image_index as usize)
            .copied()
            .ok_or(BackendError::InvalidImageIndex {
                index: image_index,
                count: self.framebuffers.len(),
            })
    }

    /// Tear everything down and build it again for the new size.
    ///
    /// Framebuffers are not created here: when the plan says the format
    /// changed, the caller rebuilds its render pass first and then calls
    /// `create_framebuffers`. `pass_format` is the colour format of the
    /// render pass currently in use.
    pub fn recreate(&mut self, width: u32, height: u32, pass_format: vk::Format) -> Result<Rebuild> {
        let config = self.choose_config(width, height)?;
        let plan = Rebuild::plan(pass_format, &config);
        if plan == Rebuild::Deferred {
            log::debug!("Surface extent is zero, keeping the current swapchain");
            return Ok(plan);
        }

        self.device.wait_idle()?;
        self.destroy();
        self.build(config)?;
        Ok(plan)
    }

    fn ensure_live(&self) -> Result<(), BackendError> {
        if self.swapchain == vk::SwapchainKHR::null() {
            return Err(BackendError::SwapchainDestroyed);
        }
        Ok(())
    }

    /// Acquire next image for rendering, signalling `semaphore` when ready.
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> Result<AcquireOutcome> {
        self.ensure_live()?;
        let result = unsafe {
            self.loader
                .acquire_next_image(self.swapchain, u64::MAX, semaphore, vk::Fence::null())
        };

        match result {
            Ok((index, suboptimal)) => Ok(AcquireOutcome::Acquired { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(e).context("Failed to acquire swapchain image"),
        }
    }

    /// Present `image_index` once `wait` is signalled.
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> Result<PresentOutcome> {
        self.ensure_live()?;
        let wait_semaphores = [wait];
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.loader.queue_present(queue, &present_info) } {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(e).context("Failed to present swapchain image"),
        }
    }

    /// Framebuffers, then the depth image, then views, then the handle.
    fn destroy(&mut self) {
        let device = &self.device.device;
        unsafe {
            for (framebuffer, id) in self.framebuffers.drain(..).zip(self.framebuffer_ids.drain(..)) {
                device.destroy_framebuffer(framebuffer, None);
                self.device.untrack(id);
            }

            self.depth = None;

            for (view, id) in self.image_views.drain(..).zip(self.view_ids.drain(..)) {
                device.destroy_image_view(view, None);
                self.device.untrack(id);
            }
            self.images.clear();

            if self.swapchain != vk::SwapchainKHR::null() {
                self.loader.destroy_swapchain(self.swapchain, None);
                self.device.untrack(self.id);
                self.swapchain = vk::SwapchainKHR::null();
            }
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        log::debug!("Destroying swapchain");
        self.destroy();
    }
}
