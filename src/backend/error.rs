// Backend error types
//
// Conditions callers need to tell apart. Everything else travels as
// anyhow::Error with context attached.

use ash::vk;
use thiserror::Error;

/// Why no physical device could be selected. Both are fatal at startup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelectionError {
    #[error("Vulkan can not find a physical device")]
    NoPhysicalDevice,

    #[error("no physical device meets the requirements")]
    NoSuitableDevice,
}

/// Classified backend failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("unsupported image layout transition {old:?} -> {new:?}")]
    UnsupportedLayoutTransition {
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },

    #[error("no candidate depth format supports optimal-tiling depth attachments")]
    NoSupportedDepthFormat,

    #[error("image index {index} out of range for {count} framebuffers")]
    InvalidImageIndex { index: u32, count: usize },

    #[error("surface reports no {0}")]
    EmptySurfaceSupport(&'static str),

    #[error("swapchain extent is zero")]
    ZeroExtent,

    #[error("swapchain was torn down and not rebuilt")]
    SwapchainDestroyed,

    #[error("shader binary {path} is not valid SPIR-V")]
    InvalidSpirv { path: String },
}
