// =============================================================================
// QUAD RENDERER - textured, depth-tested quad over Vulkan
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  App (winit event loop, input, FPS title)                       │
// │    └── EventBus (resize, input and window events)               │
// │          └── FrameLoop (frames in flight, swapchain recreation) │
// │                └── Renderer (Vulkan object graph)               │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Wait for the frame slot's fence
// 2. Acquire swapchain image
// 3. Record the draw into the slot's command buffer
// 4. Submit, then present
// 5. Advance to the next slot
//
// =============================================================================

mod backend;
mod config;
mod events;
mod frame;
mod geometry;
mod renderer;
mod resource;

use anyhow::Result;
use config::Config;
use events::{EventBus, EventContext, EventType, ListenerId, SenderId};
use frame::{FrameLoop, FrameResult, FramebufferSize, SharedFramebufferSize};
use renderer::Renderer;
use resource::{FileMode, ResourceFile};
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::{ElementState, WindowEvent},
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Fullscreen, Window, WindowAttributes, WindowId},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting quad renderer");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("Present mode: {}", config.graphics.present_mode);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    match app.fatal.take() {
        Some(e) => {
            log::error!("Fatal: {:?}", e);
            Err(e)
        }
        None => Ok(()),
    }
}

/// Initialize logging with optional file output
fn init_logging(config: &Config) {
    use env_logger::{Builder, Env};

    Builder::from_env(Env::default().default_filter_or("info")).init();

    // Create/clear log file if enabled
    if config.debug.log_to_file {
        let header = format!(
            "=== Quad Renderer Log ===\nStarted: {:?}\n\n",
            std::time::SystemTime::now()
        );
        let written = ResourceFile::open(&config.debug.log_file, FileMode::Write, false)
            .and_then(|mut file| file.write_all_bytes(header.as_bytes()));
        if let Err(e) = written {
            log::warn!("Could not start log file: {:#}", e);
        }
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// IMPORTANT: Field order matters for Drop! The renderer owns the surface and
/// must go before the window it was created from.
struct App {
    renderer: Option<Renderer>,
    frame_loop: Option<FrameLoop>,
    window: Option<Arc<Window>>,

    config: Config,
    events: EventBus,
    resize_listener: ListenerId,
    /// Written by the resize listener, read by the frame loop
    framebuffer_size: SharedFramebufferSize,
    is_fullscreen: bool,
    /// Startup failure to report from `main`
    fatal: Option<anyhow::Error>,

    // FPS tracking
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let framebuffer_size = FramebufferSize::shared(config.window.width, config.window.height);
        let now = Instant::now();

        let mut events = EventBus::new();
        let size = framebuffer_size.clone();
        let resize_listener = events.register(EventType::WindowResize, move |_, context, _| {
            let [width, height, ..] = context.as_u32s();
            size.lock().on_resize(width, height);
            true
        });
        events.register(EventType::MouseClicked, |_, context, _| {
            log::debug!("Mouse button {} pressed", context.as_u16s()[0]);
            true
        });
        events.register(EventType::MouseScrolled, |_, context, _| {
            let [x, y, ..] = context.as_f32s();
            log::trace!("Scrolled ({}, {})", x, y);
            true
        });

        Self {
            renderer: None,
            frame_loop: None,
            window: None,
            config,
            events,
            resize_listener,
            framebuffer_size,
            is_fullscreen,
            fatal: None,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    /// Build the renderer for a freshly created window.
    fn init_vulkan(&mut self, window: &Window) -> Result<()> {
        let size = window.inner_size();
        *self.framebuffer_size.lock() = FramebufferSize::new(size.width, size.height);

        let renderer = Renderer::new(window, &self.config)?;
        self.frame_loop = Some(FrameLoop::new(self.framebuffer_size.clone()));
        self.renderer = Some(renderer);

        log::info!("Vulkan initialized successfully!");
        Ok(())
    }

    fn render_frame(&mut self) {
        let (Some(renderer), Some(frame_loop)) = (self.renderer.as_mut(), self.frame_loop.as_mut())
        else {
            return;
        };

        match frame_loop.draw_frame(renderer) {
            Ok(FrameResult::Presented) => self.update_fps(),
            Ok(FrameResult::SkippedMinimized) | Ok(FrameResult::SkippedOutOfDate) => {}
            // Skip this frame and try again on the next redraw
            Err(e) => log::error!("Render error: {:?}", e),
        }
    }

    fn fire(&mut self, window_id: WindowId, context: EventContext, event_type: EventType) {
        self.events
            .fire(Some(SenderId(u64::from(window_id))), &context, event_type);
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
            // The resulting Resized event schedules the swapchain rebuild
        }
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                let mode = if self.is_fullscreen { "fullscreen" } else { "windowed" };
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms) [{}]",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                    mode
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                self.fatal = Some(e.into());
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_vulkan(&window) {
            log::error!("Failed to initialize Vulkan: {:?}", e);
            self.fatal = Some(e);
            event_loop.exit();
            return;
        }

        self.window = Some(window);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, window_id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.fire(window_id, EventContext::default(), EventType::WindowClose);
                // Resizes during teardown must not schedule another rebuild
                self.events.unregister(self.resize_listener);
                if let Some(ref renderer) = self.renderer {
                    if let Err(e) = renderer.wait_idle() {
                        log::error!("Failed to wait for device idle: {:?}", e);
                    }
                }
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                self.fire(
                    window_id,
                    EventContext::window_size(size.width, size.height),
                    EventType::WindowResize,
                );
            }

            WindowEvent::Moved(position) => {
                let context = EventContext::from_u32s([position.x as u32, position.y as u32, 0, 0]);
                self.fire(window_id, context, EventType::WindowMoved);
            }

            WindowEvent::CursorMoved { position, .. } => {
                let context =
                    EventContext::from_f32s([position.x as f32, position.y as f32, 0.0, 0.0]);
                self.fire(window_id, context, EventType::MouseMoved);
            }

            WindowEvent::MouseInput { state, button, .. } => {
                let button = match button {
                    winit::event::MouseButton::Left => 0,
                    winit::event::MouseButton::Right => 1,
                    winit::event::MouseButton::Middle => 2,
                    winit::event::MouseButton::Back => 3,
                    winit::event::MouseButton::Forward => 4,
                    winit::event::MouseButton::Other(other) => other,
                };
                let event_type = match state {
                    ElementState::Pressed => EventType::MouseClicked,
                    ElementState::Released => EventType::MouseReleased,
                };
                self.fire(window_id, EventContext::from_u16s([button, 0, 0, 0, 0, 0, 0, 0]), event_type);
            }

            WindowEvent::MouseWheel { delta, .. } => {
                let (x, y) = match delta {
                    winit::event::MouseScrollDelta::LineDelta(x, y) => (x, y),
                    winit::event::MouseScrollDelta::PixelDelta(p) => (p.x as f32, p.y as f32),
                };
                self.fire(window_id, EventContext::from_f32s([x, y, 0.0, 0.0]), EventType::MouseScrolled);
            }

            WindowEvent::RedrawRequested => self.render_frame(),

            WindowEvent::KeyboardInput { event, .. } => {
                let PhysicalKey::Code(key) = event.physical_key else {
                    return;
                };
                // Lane 0 carries the typed character, 0 for non-text keys
                let character = event
                    .text
                    .as_ref()
                    .and_then(|text| text.chars().next())
                    .map_or(0, u32::from);
                let context = EventContext::from_u32s([character, 0, 0, 0]);

                match event.state {
                    ElementState::Pressed if event.repeat => {
                        self.fire(window_id, context, EventType::KeyPressed);
                    }
                    ElementState::Pressed => {
                        self.fire(window_id, context, EventType::KeyDown);
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                event_loop.exit();
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            _ => {}
                        }
                    }
                    ElementState::Released => {
                        self.fire(window_id, context, EventType::KeyReleased);
                    }
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}
