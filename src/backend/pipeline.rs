// Graphics pipeline creation and management
//
// The graphics pipeline defines how vertices are processed and rasterized.
// It includes: descriptor layout, shaders, vertex input, rasterization,
// depth testing and blending. Viewport and scissor are dynamic so the
// pipeline survives swapchain recreation.

use anyhow::{Context, Result};
use ash::vk;
use ash::vk::Handle;
use std::ffi::CStr;
use std::path::Path;
use std::sync::Arc;

use super::buffer::UniformBuffers;
use super::image::Texture;
use super::shader::ShaderModule;
use super::tracker::{ObjectId, ObjectKind};
use super::{Device, RenderPass};
use crate::geometry::Vertex;

const SHADER_ENTRY: &CStr = c"main";

pub struct Pipeline {
    pub descriptor_set_layout: vk::DescriptorSetLayout,
    pub layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
    ids: Vec<ObjectId>,
    device: Arc<Device>,
}

impl Pipeline {
    pub fn new(
        device: Arc<Device>,
        render_pass: &RenderPass,
        vertex_shader: &Path,
        fragment_shader: &Path,
    ) -> Result<Self> {
        let mut pipeline = Self {
            descriptor_set_layout: vk::DescriptorSetLayout::null(),
            layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
            ids: Vec::new(),
            device,
        };
        pipeline.build(render_pass, vertex_shader, fragment_shader)?;

        log::info!("Graphics pipeline created");
        Ok(pipeline)
    }

    fn build(
        &mut self,
        render_pass: &RenderPass,
        vertex_shader: &Path,
        fragment_shader: &Path,
    ) -> Result<()> {
        let device = self.device.clone();

        // Binding 0: per-frame UBO, binding 1: the texture
        let bindings = [
            vk::DescriptorSetLayoutBinding::builder()
                .binding(0)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::VERTEX)
                .build(),
            vk::DescriptorSetLayoutBinding::builder()
                .binding(1)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::FRAGMENT)
                .build(),
        ];
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);

        self.descriptor_set_layout =
            unsafe { device.device.create_descriptor_set_layout(&layout_info, None) }
                .context("Failed to create descriptor set layout")?;
        self.ids.push(device.track(
            ObjectKind::DescriptorSetLayout,
            self.descriptor_set_layout.as_raw(),
            &[],
        ));

        // Dropped at the end of this function, whether or not creation worked
        let vert = ShaderModule::load(&device, vertex_shader)?;
        let frag = ShaderModule::load(&device, fragment_shader)?;

        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vert.module)
                .name(SHADER_ENTRY)
                .build(),
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(frag.module)
                .name(SHADER_ENTRY)
                .build(),
        ];

        let vertex_bindings = [Vertex::binding_description()];
        let vertex_attributes = Vertex::attribute_descriptions();
        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&vertex_bindings)
            .vertex_attribute_descriptions(&vertex_attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        // Counts only; the rectangles are set per frame
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::BACK)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(true)
            .depth_write_enable(true)
            .depth_compare_op(vk::CompareOp::LESS)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        // Alpha blend factors are set up but blending stays off
        let color_blend_attachment = vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
            .alpha_blend_op(vk::BlendOp::ADD)
            .build();

        let color_blend_attachments = [color_blend_attachment];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let set_layouts = [self.descriptor_set_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);

        self.layout = unsafe { device.device.create_pipeline_layout(&layout_info, None) }
            .context("Failed to create pipeline layout")?;
        self.ids
            .push(device.track(ObjectKind::PipelineLayout, self.layout.as_raw(), &[]));

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(self.layout)
            .render_pass(render_pass.render_pass)
            .subpass(0)
            .build();

        let pipelines = unsafe {
            device
                .device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        }
        .map_err(|(_, e)| e)
        .context("Failed to create graphics pipeline")?;

        self.pipeline = pipelines
            .into_iter()
            .next()
            .context("Driver returned no pipeline")?;
        self.ids
            .push(device.track(ObjectKind::Pipeline, self.pipeline.as_raw(), &[]));

        Ok(())
    }

    pub fn bind(&self, cmd: vk::CommandBuffer) {
        unsafe {
            self.device
                .device
                .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline)
        };
    }

    pub fn bind_descriptor_set(&self, cmd: vk::CommandBuffer, set: vk::DescriptorSet) {
        unsafe {
            self.device.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.layout,
                0,
                &[set],
                &[],
            )
        };
    }

    /// Viewport and scissor covering the whole of `extent`.
    pub fn set_viewport_and_scissor(&self, cmd: vk::CommandBuffer, extent: vk::Extent2D) {
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };

        unsafe {
            self.device.device.cmd_set_viewport(cmd, 0, &[viewport]);
            self.device.device.cmd_set_scissor(cmd, 0, &[scissor]);
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        let device = &self.device.device;
        unsafe {
            if self.descriptor_set_layout != vk::DescriptorSetLayout::null() {
                device.destroy_descriptor_set_layout(self.descriptor_set_layout, None);
            }
            if self.pipeline != vk::Pipeline::null() {
                device.destroy_pipeline(self.pipeline, None);
            }
            if self.layout != vk::PipelineLayout::null() {
                device.destroy_pipeline_layout(self.layout, None);
            }
        }
        for id in self.ids.drain(..) {
            self.device.untrack(id);
        }
    }
}

/// Descriptor pool with one set per frame in flight. Each set points at its
/// frame's uniform buffer and the shared texture.
pub struct Descriptors {
    pub pool: vk::DescriptorPool,
    pub sets: Vec<vk::DescriptorSet>,
    id: ObjectId,
    device: Arc<Device>,
}

impl Descriptors {
    pub fn new(
        device: Arc<Device>,
        layout: vk::DescriptorSetLayout,
        uniforms: &UniformBuffers,
        texture: &Texture,
    ) -> Result<Self> {
        let frames = uniforms.len() as u32;

        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: frames,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: frames,
            },
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&pool_sizes)
            .max_sets(frames);

        let pool = unsafe { device.device.create_descriptor_pool(&pool_info, None) }
            .context("Failed to create descriptor pool")?;
        let id = device.track(ObjectKind::DescriptorPool, pool.as_raw(), &[]);

        // From here on Drop releases the pool
        let mut descriptors = Self {
            pool,
            sets: Vec::new(),
            id,
            device,
        };

        let layouts = vec![layout; frames as usize];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);

        descriptors.sets = unsafe { descriptors.device.device.allocate_descriptor_sets(&alloc_info) }
            .context("Failed to allocate descriptor sets")?;

        let image_info = [vk::DescriptorImageInfo {
            sampler: texture.sampler,
            image_view: texture.image.view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }];

        for (frame, &set) in descriptors.sets.iter().enumerate() {
            let buffer = uniforms
                .buffer(frame)
                .with_context(|| format!("No uniform buffer for frame {}", frame))?;
            let buffer_info = [vk::DescriptorBufferInfo {
                buffer: buffer.buffer,
                offset: 0,
                range: buffer.size,
            }];

            let writes = [
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(0)
                    .dst_array_element(0)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .buffer_info(&buffer_info)
                    .build(),
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(1)
                    .dst_array_element(0)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(&image_info)
                    .build(),
            ];

            unsafe { descriptors.device.device.update_descriptor_sets(&writes, &[]) };
        }

        log::debug!("Allocated {} descriptor sets", descriptors.sets.len());
        Ok(descriptors)
    }

    pub fn set(&self, frame: usize) -> Result<vk::DescriptorSet> {
        self.sets
            .get(frame)
            .copied()
            .with_context(|| format!("No descriptor set for frame {}", frame))
    }
}

impl Drop for Descriptors {
    fn drop(&mut self) {
        // Sets are freed with the pool
        unsafe { self.device.device.destroy_descriptor_pool(self.pool, None) };
        self.device.untrack(self.id);
    }
}
