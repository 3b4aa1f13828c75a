// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every section is optional; missing keys take the defaults below and a
// missing file means all defaults.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::Path;

/// Frames the CPU may record ahead of the GPU.
pub const FRAMES_IN_FLIGHT_RANGE: std::ops::RangeInclusive<usize> = 1..=4;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
    pub assets: AssetsConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Quad Renderer".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    /// "immediate", "mailbox", "fifo" or "fifo_relaxed". Falls back to
    /// MAILBOX then FIFO when the surface does not offer it.
    pub present_mode: String,
    pub clear_color: [f32; 4],
    pub max_frames_in_flight: usize,
    pub require_discrete_gpu: bool,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "mailbox".to_string(),
            clear_color: [0.0, 0.0, 0.0, 1.0],
            max_frames_in_flight: 2,
            require_discrete_gpu: true,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "quad_renderer.log".to_string(),
            show_fps: true,
        }
    }
}

/// Compiled shaders and the quad's texture
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AssetsConfig {
    pub vertex_shader: String,
    pub fragment_shader: String,
    pub texture: String,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            vertex_shader: "shaders/quad.vert.spv".to_string(),
            fragment_shader: "shaders/quad.frag.spv".to_string(),
            texture: "textures/texture.png".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Configured frames in flight, clamped to what the renderer supports.
    pub fn frames_in_flight(&self) -> usize {
        let requested = self.graphics.max_frames_in_flight;
        let clamped = requested.clamp(*FRAMES_IN_FLIGHT_RANGE.start(), *FRAMES_IN_FLIGHT_RANGE.end());
        if clamped != requested {
            log::warn!(
                "max_frames_in_flight = {} is out of range, using {}",
                requested,
                clamped
            );
        }
        clamped
    }

    /// Preferred present mode, or `None` to let the swapchain pick.
    pub fn present_mode(&self) -> Option<vk::PresentModeKHR> {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => Some(vk::PresentModeKHR::IMMEDIATE),
            "mailbox" => Some(vk::PresentModeKHR::MAILBOX),
            "fifo" => Some(vk::PresentModeKHR::FIFO),
            "fifo_relaxed" => Some(vk::PresentModeKHR::FIFO_RELAXED),
            other => {
                log::warn!("Unknown present mode '{}', using the default", other);
                None
            }
        }
    }
}
