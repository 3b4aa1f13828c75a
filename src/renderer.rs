// Renderer - owns the whole GPU object graph
//
// Built once in dependency order:
//   Instance -> Surface -> Device -> Swapchain -> RenderPass -> Framebuffers
//   -> Pipeline -> CommandBuffers -> Texture/Buffers -> Descriptors -> FrameSync
//
// IMPORTANT: Field order is drop order. Everything that records into or
// references the swapchain goes first; the device, surface and instance last.

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::HasRawDisplayHandle;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use winit::window::Window;

use crate::backend::image::find_depth_format;
use crate::backend::{
    AcquireOutcome, CommandBuffers, Descriptors, Device, DeviceRequirements, FrameSync,
    IndexBuffer, Instance, Pipeline, PresentOutcome, Rebuild, RenderPass, Surface, Swapchain,
    Texture, UniformBuffers, VertexBuffer,
};
use crate::config::Config;
use crate::frame::{FrameBackend, SubmitOutcome};
use crate::geometry::{UniformBufferObject, QUAD_INDICES, QUAD_VERTICES};
use crate::resource::load_texture_pixels;

pub struct Renderer {
    // Buffers and images
    uniforms: UniformBuffers,
    index_buffer: IndexBuffer,
    vertex_buffer: VertexBuffer,
    texture: Texture,

    // Per-frame objects
    frames: Vec<FrameSync>,
    commands: CommandBuffers,

    // Pipeline state
    descriptors: Descriptors,
    pipeline: Pipeline,
    render_pass: RenderPass,
    swapchain: Swapchain,

    // Core
    device: Arc<Device>,
    _surface: Arc<Surface>,
    _instance: Arc<Instance>,

    vertex_shader: PathBuf,
    fragment_shader: PathBuf,
    depth_format: vk::Format,
    clear_color: [f32; 4],
    wait_stages: [vk::PipelineStageFlags; 1],
    start: Instant,
}

impl Renderer {
    pub fn new(window: &Window, config: &Config) -> Result<Self> {
        log::info!("Initializing Vulkan...");

        let enable_validation = cfg!(debug_assertions) && config.debug.validation_layers;
        let instance = Instance::new(
            &config.window.title,
            window.raw_display_handle(),
            enable_validation,
        )?;

        let surface = Arc::new(Surface::new(instance.clone(), window)?);

        let requirements = DeviceRequirements {
            discrete_gpu: config.graphics.require_discrete_gpu,
            ..Default::default()
        };
        let device = Device::new(instance.clone(), &surface, &requirements)?;

        let depth_format = find_depth_format(&device)?;
        let size = window.inner_size();
        let mut swapchain = Swapchain::new(
            device.clone(),
            surface.clone(),
            size.width,
            size.height,
            depth_format,
            config.present_mode(),
        )?;

        let render_pass = RenderPass::new(device.clone(), swapchain.format(), depth_format)?;
        swapchain.create_framebuffers(&render_pass)?;

        let vertex_shader = PathBuf::from(&config.assets.vertex_shader);
        let fragment_shader = PathBuf::from(&config.assets.fragment_shader);
        let pipeline = Pipeline::new(device.clone(), &render_pass, &vertex_shader, &fragment_shader)?;

        let frames_in_flight = config.frames_in_flight();
        let commands = CommandBuffers::allocate(device.clone(), frames_in_flight)?;

        let pixels = load_texture_pixels(&config.assets.texture)?;
        let texture = Texture::from_pixels(device.clone(), pixels.width, pixels.height, &pixels.rgba)?;

        let vertex_buffer = VertexBuffer::new(device.clone(), &QUAD_VERTICES)?
            .context("Quad has no vertices")?;
        let index_buffer =
            IndexBuffer::new(device.clone(), &QUAD_INDICES)?.context("Quad has no indices")?;

        let uniforms = UniformBuffers::new::<UniformBufferObject>(device.clone(), frames_in_flight)?;
        let descriptors = Descriptors::new(
            device.clone(),
            pipeline.descriptor_set_layout,
            &uniforms,
            &texture,
        )?;

        let frames = FrameSync::create_frames(&device, frames_in_flight)?;

        log::info!(
            "Vulkan initialized: {} frames in flight, {} swapchain images",
            frames_in_flight,
            swapchain.image_count()
        );

        Ok(Self {
            uniforms,
            index_buffer,
            vertex_buffer,
            texture,
            frames,
            commands,
            descriptors,
            pipeline,
            render_pass,
            swapchain,
            device,
            _surface: surface,
            _instance: instance,
            vertex_shader,
            fragment_shader,
            depth_format,
            clear_color: config.graphics.clear_color,
            wait_stages: [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
            start: Instant::now(),
        })
    }

    pub fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()
    }

    fn frame(&self, slot: usize) -> Result<&FrameSync> {
        self.frames
            .get(slot)
            .with_context(|| format!("No sync objects for frame {}", slot))
    }

    /// Rebuild the render pass for a new colour format, and with it the
    /// pipeline and the descriptor sets allocated from its layout.
    fn rebuild_render_pass(&mut self, color_format: vk::Format) -> Result<()> {
        let render_pass = RenderPass::new(self.device.clone(), color_format, self.depth_format)?;
        let pipeline = Pipeline::new(
            self.device.clone(),
            &render_pass,
            &self.vertex_shader,
            &self.fragment_shader,
        )?;
        let descriptors = Descriptors::new(
            self.device.clone(),
            pipeline.descriptor_set_layout,
            &self.uniforms,
            &self.texture,
        )?;

        // Old sets, then the old pipeline, then the pass it was built against
        self.descriptors = descriptors;
        self.pipeline = pipeline;
        self.render_pass = render_pass;
        Ok(())
    }

    fn aspect_ratio(&self) -> f32 {
        let extent = self.swapchain.extent();
        extent.width as f32 / extent.height.max(1) as f32
    }
}

impl FrameBackend for Renderer {
    fn frames_in_flight(&self) -> usize {
        self.frames.len()
    }

    fn wait_for_frame(&mut self, slot: usize) -> Result<()> {
        self.frame(slot)?.wait()
    }

    fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome> {
        let semaphore = self.frame(slot)?.image_available;
        self.swapchain.acquire_next_image(semaphore)
    }

    fn reset_frame(&mut self, slot: usize) -> Result<()> {
        self.frame(slot)?.reset()
    }

    fn begin_commands(&mut self, slot: usize) -> Result<()> {
        let cmd = self.commands.begin(slot)?;
        self.pipeline.bind(cmd);
        Ok(())
    }

    fn record_draw(&mut self, slot: usize, image_index: u32) -> Result<()> {
        let cmd = self.commands.get(slot)?;
        let framebuffer = self.swapchain.framebuffer(image_index)?;
        let extent = self.swapchain.extent();

        self.pipeline.set_viewport_and_scissor(cmd, extent);

        let ubo = UniformBufferObject::spinning(self.start.elapsed().as_secs_f32(), self.aspect_ratio());
        self.uniforms.update(slot, &ubo)?;

        self.render_pass.begin(cmd, framebuffer, extent, self.clear_color);

        let device = &self.device.device;
        self.vertex_buffer.bind(device, cmd);
        self.index_buffer.bind(device, cmd);
        self.pipeline.bind_descriptor_set(cmd, self.descriptors.set(slot)?);
        unsafe { device.cmd_draw_indexed(cmd, self.index_buffer.count, 1, 0, 0, 0) };

        self.render_pass.end(cmd);
        self.commands.end(slot)
    }

    fn submit(&mut self, slot: usize) -> Result<SubmitOutcome> {
        let frame = self.frame(slot)?;
        let wait_semaphores = [frame.image_available];
        let signal_semaphores = [frame.render_finished];
        let command_buffers = [self.commands.get(slot)?];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&self.wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        let result = unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue,
                &[submit_info.build()],
                frame.in_flight_fence,
            )
        };

        match result {
            Ok(()) => Ok(SubmitOutcome::Submitted),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(SubmitOutcome::OutOfDate),
            Err(e) => Err(e).context("Failed to submit draw command buffer"),
        }
    }

    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome> {
        let wait = self.frame(slot)?.render_finished;
        self.swapchain
            .present(self.device.present_queue, image_index, wait)
    }

    /// Submit an empty batch that consumes the image-available semaphore and
    /// signals the slot's fence.
    fn abandon_frame(&mut self, slot: usize) -> Result<()> {
        let frame = self.frame(slot)?;
        let wait_semaphores = [frame.image_available];
        let wait_stages = [vk::PipelineStageFlags::ALL_COMMANDS];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages);

        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue,
                &[submit_info.build()],
                frame.in_flight_fence,
            )
        }
        .context("Failed to submit empty batch for abandoned frame")
    }

    fn recreate_swapchain(&mut self, width: u32, height: u32) -> Result<bool> {
        match self
            .swapchain
            .recreate(width, height, self.render_pass.color_format)?
        {
            Rebuild::Deferred => return Ok(false),
            Rebuild::SameFormat => {}
            Rebuild::FormatChanged { old, new } => {
                log::warn!("Surface format changed from {:?} to {:?}, rebuilding render pass", old, new);
                self.rebuild_render_pass(new)?;
            }
        }

        self.swapchain.create_framebuffers(&self.render_pass)?;
        Ok(true)
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");
        // Wait for GPU to finish before destroying anything
        if let Err(e) = self.device.wait_idle() {
            log::error!("Failed to wait for device idle: {:?}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::backend::tracker::{LifetimeTracker, ObjectId, ObjectKind};

    /// `Renderer` field names in declaration order, which is their drop order.
    fn renderer_fields() -> Vec<&'static str> {
        let source = include_str!("renderer.rs");
        let start = source.find("pub struct Renderer {").expect("Renderer struct");
        let body = &source[start..];
        let end = body.find("\n}").expect("end of Renderer struct");

        body[..end]
            .lines()
            .skip(1)
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with("//"))
            .filter_map(|line| line.split(':').next())
            .collect()
    }

    struct Graph {
        tracker: LifetimeTracker,
        next_raw: u64,
    }

    impl Graph {
        fn new() -> Self {
            Self {
                tracker: LifetimeTracker::new(),
                next_raw: 0,
            }
        }

        fn create(&mut self, kind: ObjectKind, parents: &[ObjectId]) -> ObjectId {
            self.next_raw += 1;
            let id = ObjectId::new(kind, self.next_raw);
            self.tracker.created(id, parents);
            id
        }
    }

    /// Creates objects in the order `Renderer::new` does and returns, per
    /// field, the objects that field releases in the order its Drop does.
    fn build_renderer_graph(
        graph: &mut Graph,
        frames: usize,
        images: usize,
    ) -> HashMap<&'static str, Vec<ObjectId>> {
        use ObjectKind::*;
        let mut owned = HashMap::new();

        let instance = graph.create(Instance, &[]);
        let messenger = graph.create(DebugMessenger, &[instance]);
        owned.insert("_instance", vec![messenger, instance]);

        let surface = graph.create(Surface, &[instance]);
        owned.insert("_surface", vec![surface]);

        let device = graph.create(Device, &[instance]);
        let pool = graph.create(CommandPool, &[device]);
        owned.insert("device", vec![pool, device]);

        let swapchain = graph.create(Swapchain, &[device, surface]);
        let views: Vec<_> = (0..images)
            .map(|_| graph.create(ImageView, &[device, swapchain]))
            .collect();
        let depth_image = graph.create(Image, &[device]);
        let depth_view = graph.create(ImageView, &[device, depth_image]);

        owned.insert("render_pass", vec![graph.create(RenderPass, &[device])]);

        let mut swapchain_objects: Vec<_> = views
            .iter()
            .map(|&view| graph.create(Framebuffer, &[device, view, depth_view]))
            .collect();
        swapchain_objects.extend([depth_view, depth_image]);
        swapchain_objects.extend(views);
        swapchain_objects.push(swapchain);
        owned.insert("swapchain", swapchain_objects);

        let pipeline = vec![
            graph.create(DescriptorSetLayout, &[device]),
            graph.create(PipelineLayout, &[device]),
            graph.create(Pipeline, &[device]),
        ];
        owned.insert("pipeline", pipeline);

        let commands = (0..frames)
            .map(|_| graph.create(CommandBuffer, &[device, pool]))
            .collect();
        owned.insert("commands", commands);

        let texture_image = graph.create(Image, &[device]);
        let texture_view = graph.create(ImageView, &[device, texture_image]);
        let sampler = graph.create(Sampler, &[device]);
        owned.insert("texture", vec![sampler, texture_view, texture_image]);

        owned.insert("vertex_buffer", vec![graph.create(Buffer, &[device])]);
        owned.insert("index_buffer", vec![graph.create(Buffer, &[device])]);

        let uniforms = (0..frames).map(|_| graph.create(Buffer, &[device])).collect();
        owned.insert("uniforms", uniforms);

        owned.insert("descriptors", vec![graph.create(DescriptorPool, &[device])]);

        let sync = (0..frames)
            .flat_map(|_| [Semaphore, Semaphore, Fence])
            .map(|kind| graph.create(kind, &[device]))
            .collect();
        owned.insert("frames", sync);

        owned
    }

    #[test]
    fn test_field_order_releases_children_before_parents() {
        let mut graph = Graph::new();
        let mut owned = build_renderer_graph(&mut graph, 2, 3);

        for field in renderer_fields() {
            for object in owned.remove(field).unwrap_or_default() {
                graph.tracker.released(object);
            }
        }

        assert!(owned.is_empty(), "not Renderer fields: {:?}", owned.keys());
        assert!(graph.tracker.violations().is_empty(), "{:?}", graph.tracker.violations());
        assert_eq!(graph.tracker.live_count(), 0);
    }

    #[test]
    fn test_device_dropped_before_swapchain_is_flagged() {
        let mut graph = Graph::new();
        let mut owned = build_renderer_graph(&mut graph, 1, 2);

        let mut fields = renderer_fields();
        let device = fields.iter().position(|f| *f == "device").expect("device field");
        let moved = fields.remove(device);
        fields.insert(0, moved);

        for field in fields {
            for object in owned.remove(field).unwrap_or_default() {
                graph.tracker.released(object);
            }
        }

        assert!(!graph.tracker.violations().is_empty());
    }

    #[test]
    fn test_fields_are_read_in_declaration_order() {
        let fields = renderer_fields();
        assert_eq!(fields.first(), Some(&"uniforms"));
        assert_eq!(fields.last(), Some(&"start"));
        assert!(fields.contains(&"clear_color"));
    }
}
