// Backend module - Vulkan abstraction layer
//
// Design: Thin RAII wrappers around ash. Each wrapper holds an `Arc` of what
// it was created from, so the ownership graph alone fixes the destruction
// order, and every create/destroy is reported to the instance's lifetime
// tracker.

pub mod buffer;
pub mod command;
pub mod device;
pub mod error;
pub mod image;
pub mod instance;
pub mod physical_device;
pub mod pipeline;
pub mod renderpass;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod tracker;

pub use buffer::{IndexBuffer, UniformBuffers, VertexBuffer};
pub use command::CommandBuffers;
pub use device::Device;
pub use image::Texture;
pub use instance::Instance;
pub use physical_device::DeviceRequirements;
pub use pipeline::{Descriptors, Pipeline};
pub use renderpass::RenderPass;
pub use surface::Surface;
pub use swapchain::{AcquireOutcome, PresentOutcome, Rebuild, Swapchain};
pub use sync::FrameSync;
