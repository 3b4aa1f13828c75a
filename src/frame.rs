// Frame loop
//
// Sequences one frame over N frames in flight:
//
//   Idle -> BeginFrame -> Recording -> Submitted -> Presented -> Idle
//
// The GPU side is behind `FrameBackend` so the ordering rules are testable
// without a device: fence before reuse, skip on an out-of-date or suboptimal
// acquire, lazy recreation on resize.

use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::backend::{AcquireOutcome, PresentOutcome};

/// Window framebuffer size as last reported by the platform. `generation`
/// bumps on every resize so the loop can tell a stale swapchain apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferSize {
    pub width: u32,
    pub height: u32,
    pub generation: u64,
}

impl FramebufferSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            generation: 0,
        }
    }

    pub fn shared(width: u32, height: u32) -> SharedFramebufferSize {
        Arc::new(Mutex::new(Self::new(width, height)))
    }

    /// Record a resize. Nothing is rebuilt here; the next frame does it.
    pub fn on_resize(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.generation += 1;
    }

    pub fn is_minimized(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

pub type SharedFramebufferSize = Arc<Mutex<FramebufferSize>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Submitted,
    /// The surface went out of date; the frame is dropped unpresented.
    OutOfDate,
}

/// GPU operations the frame loop sequences. `slot` is the frame-in-flight
/// index, always below `frames_in_flight()`.
pub trait FrameBackend {
    fn frames_in_flight(&self) -> usize;

    /// Block until the last submission from `slot` has completed.
    fn wait_for_frame(&mut self, slot: usize) -> Result<()>;

    fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome>;

    /// Unsignal the slot's fence. Always followed by a submit or an abandon
    /// that signals it again.
    fn reset_frame(&mut self, slot: usize) -> Result<()>;

    /// Reset and begin the slot's command buffer and bind the pipeline.
    fn begin_commands(&mut self, slot: usize) -> Result<()>;

    fn record_draw(&mut self, slot: usize, image_index: u32) -> Result<()>;

    fn submit(&mut self, slot: usize) -> Result<SubmitOutcome>;

    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome>;

    /// Give up on a frame after its fence was reset: consume the acquired
    /// image's semaphore and signal the fence so the slot is waitable again.
    fn abandon_frame(&mut self, slot: usize) -> Result<()>;

    /// Rebuild for the new size. `Ok(false)` means the surface has no area
    /// yet and the rebuild should be tried again later.
    fn recreate_swapchain(&mut self, width: u32, height: u32) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    BeginFrame,
    Recording,
    Submitted,
    Presented,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameResult {
    Presented,
    SkippedMinimized,
    SkippedOutOfDate,
}

pub struct FrameLoop {
    size: SharedFramebufferSize,
    current_frame: usize,
    built_generation: u64,
    recreate_pending: bool,
    state: FrameState,
}

impl FrameLoop {
    /// `size` must describe the size the swapchain was first built with.
    pub fn new(size: SharedFramebufferSize) -> Self {
        let built_generation = size.lock().generation;
        Self {
            size,
            current_frame: 0,
            built_generation,
            recreate_pending: false,
            state: FrameState::Idle,
        }
    }

    #[cfg(test)]
    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    #[cfg(test)]
    pub fn state(&self) -> FrameState {
        self.state
    }

    #[cfg(test)]
    pub fn recreate_pending(&self) -> bool {
        self.recreate_pending
    }

    pub fn draw_frame<B: FrameBackend>(&mut self, backend: &mut B) -> Result<FrameResult> {
        let size = *self.size.lock();
        if size.is_minimized() {
            return Ok(FrameResult::SkippedMinimized);
        }

        if size.generation != self.built_generation || self.recreate_pending {
            log::debug!("Rebuilding swapchain for {}x{}", size.width, size.height);
            if !self.recreate(backend)? {
                return Ok(FrameResult::SkippedMinimized);
            }
        }

        let result = self.run_frame(backend);
        if result.is_err() {
            log::debug!("Frame {} failed in state {:?}", self.current_frame, self.state);
        }
        self.state = FrameState::Idle;
        result
    }

    fn run_frame<B: FrameBackend>(&mut self, backend: &mut B) -> Result<FrameResult> {
        let slot = self.current_frame;
        self.state = FrameState::BeginFrame;

        backend.wait_for_frame(slot)?;

        let image_index = match backend.acquire_image(slot)? {
            AcquireOutcome::OutOfDate => {
                log::debug!("Swapchain out of date on acquire, skipping frame");
                // The fence stays signaled so the slot is immediately reusable
                self.recreate(backend)?;
                return Ok(FrameResult::SkippedOutOfDate);
            }
            AcquireOutcome::Acquired { suboptimal: true, .. } => {
                log::debug!("Swapchain suboptimal on acquire, skipping frame");
                // The image-available semaphore is signaled; an empty submit
                // consumes it and re-signals the fence
                backend.reset_frame(slot)?;
                self.abandon(backend, slot);
                self.recreate(backend)?;
                return Ok(FrameResult::SkippedOutOfDate);
            }
            AcquireOutcome::Acquired { index, .. } => index,
        };

        backend.reset_frame(slot)?;

        match self.record_and_submit(backend, slot, image_index) {
            Ok(SubmitOutcome::Submitted) => {}
            Ok(SubmitOutcome::OutOfDate) => {
                log::debug!("Swapchain out of date on submit, skipping present");
                self.abandon(backend, slot);
                self.recreate(backend)?;
                return Ok(FrameResult::SkippedOutOfDate);
            }
            Err(e) => {
                self.abandon(backend, slot);
                return Err(e);
            }
        }
        self.state = FrameState::Submitted;

        if backend.present(slot, image_index)? == PresentOutcome::OutOfDate {
            self.recreate_pending = true;
        }
        self.state = FrameState::Presented;

        if self.recreate_pending {
            self.recreate(backend)?;
        }

        self.current_frame = (slot + 1) % backend.frames_in_flight().max(1);
        Ok(FrameResult::Presented)
    }

    fn record_and_submit<B: FrameBackend>(
        &mut self,
        backend: &mut B,
        slot: usize,
        image_index: u32,
    ) -> Result<SubmitOutcome> {
        backend.begin_commands(slot)?;
        self.state = FrameState::Recording;
        backend.record_draw(slot, image_index)?;
        backend.submit(slot)
    }

    fn abandon<B: FrameBackend>(&mut self, backend: &mut B, slot: usize) {
        if let Err(e) = backend.abandon_frame(slot) {
            log::error!("Failed to abandon frame {}: {:?}", slot, e);
        }
        // The acquired image is never presented; a fresh swapchain reclaims it
        self.recreate_pending = true;
    }

    /// Rebuild the swapchain for the latest known size. Returns false when
    /// the rebuild was deferred because there is nothing to draw into.
    fn recreate<B: FrameBackend>(&mut self, backend: &mut B) -> Result<bool> {
        // Stays set unless the rebuild completes, so the next frame retries
        self.recreate_pending = true;

        let size = *self.size.lock();
        if size.is_minimized() {
            return Ok(false);
        }

        if !backend.recreate_swapchain(size.width, size.height)? {
            log::debug!("Surface has no area yet, deferring swapchain rebuild");
            return Ok(false);
        }
        self.built_generation = size.generation;
        self.recreate_pending = false;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        Wait(usize),
        Acquire(usize),
        ResetFence(usize),
        Begin(usize),
        Record(usize, u32),
        Submit(usize),
        Present(usize, u32),
        Abandon(usize),
        Recreate(u32, u32),
    }

    #[derive(Debug, thiserror::Error)]
    #[error("would block on fence {slot}")]
    struct WouldBlock {
        slot: usize,
    }

    /// Backend whose GPU only finishes work when `gpu_completes` is set.
    struct FakeBackend {
        frames: usize,
        fences: Vec<bool>,
        gpu_completes: bool,
        next_image: u32,
        acquire: Vec<AcquireOutcome>,
        present: Vec<PresentOutcome>,
        submit: Vec<SubmitOutcome>,
        fail_record: bool,
        fail_recreate: bool,
        surface_has_area: bool,
        calls: Vec<Call>,
    }

    impl FakeBackend {
        fn new(frames: usize) -> Self {
            Self {
                frames,
                fences: vec![true; frames],
                gpu_completes: true,
                next_image: 0,
                acquire: Vec::new(),
                present: Vec::new(),
                submit: Vec::new(),
                fail_record: false,
                fail_recreate: false,
                surface_has_area: true,
                calls: Vec::new(),
            }
        }

        fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
            self.calls.iter().filter(|call| matches(call)).count()
        }
    }

    impl FrameBackend for FakeBackend {
        fn frames_in_flight(&self) -> usize {
            self.frames
        }

        fn wait_for_frame(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::Wait(slot));
            if !self.fences[slot] {
                return Err(WouldBlock { slot }.into());
            }
            Ok(())
        }

        fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome> {
            self.calls.push(Call::Acquire(slot));
            if !self.acquire.is_empty() {
                return Ok(self.acquire.remove(0));
            }
            let index = self.next_image;
            self.next_image = (self.next_image + 1) % 3;
            Ok(AcquireOutcome::Acquired {
                index,
                suboptimal: false,
            })
        }

        fn reset_frame(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::ResetFence(slot));
            self.fences[slot] = false;
            Ok(())
        }

        fn begin_commands(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::Begin(slot));
            Ok(())
        }

        fn record_draw(&mut self, slot: usize, image_index: u32) -> Result<()> {
            if self.fail_record {
                anyhow::bail!("recording failed");
            }
            self.calls.push(Call::Record(slot, image_index));
            Ok(())
        }

        fn submit(&mut self, slot: usize) -> Result<SubmitOutcome> {
            self.calls.push(Call::Submit(slot));
            if !self.submit.is_empty() {
                return Ok(self.submit.remove(0));
            }
            if self.gpu_completes {
                self.fences[slot] = true;
            }
            Ok(SubmitOutcome::Submitted)
        }

        fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome> {
            self.calls.push(Call::Present(slot, image_index));
            if !self.present.is_empty() {
                return Ok(self.present.remove(0));
            }
            Ok(PresentOutcome::Presented)
        }

        fn abandon_frame(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::Abandon(slot));
            self.fences[slot] = true;
            Ok(())
        }

        fn recreate_swapchain(&mut self, width: u32, height: u32) -> Result<bool> {
            self.calls.push(Call::Recreate(width, height));
            if std::mem::take(&mut self.fail_recreate) {
                anyhow::bail!("swapchain rebuild failed");
            }
            Ok(self.surface_has_area)
        }
    }

    fn frame_loop(width: u32, height: u32) -> (FrameLoop, SharedFramebufferSize) {
        let size = FramebufferSize::shared(width, height);
        (FrameLoop::new(size.clone()), size)
    }

    #[test]
    fn test_frame_calls_in_order() {
        let (mut frames, _) = frame_loop(800, 600);
        let mut backend = FakeBackend::new(2);

        assert_eq!(frames.draw_frame(&mut backend).unwrap(), FrameResult::Presented);

        assert_eq!(
            backend.calls,
            vec![
                Call::Wait(0),
                Call::Acquire(0),
                Call::ResetFence(0),
                Call::Begin(0),
                Call::Record(0, 0),
                Call::Submit(0),
                Call::Present(0, 0),
            ]
        );
        assert_eq!(frames.current_frame(), 1);
        assert_eq!(frames.state(), FrameState::Idle);
    }

    #[test]
    fn test_slots_cycle_modulo_frames_in_flight() {
        let (mut frames, _) = frame_loop(800, 600);
        let mut backend = FakeBackend::new(2);

        for _ in 0..3 {
            frames.draw_frame(&mut backend).unwrap();
        }

        let submitted: Vec<usize> = backend
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::Submit(slot) => Some(*slot),
                _ => None,
            })
            .collect();
        assert_eq!(submitted, vec![0, 1, 0]);
        assert_eq!(frames.current_frame(), 1);
    }

    #[test]
    fn test_cpu_never_runs_more_than_n_frames_ahead() {
        for n in 1..=3 {
            let (mut frames, _) = frame_loop(800, 600);
            let mut backend = FakeBackend::new(n);
            backend.gpu_completes = false;

            for _ in 0..n {
                assert_eq!(frames.draw_frame(&mut backend).unwrap(), FrameResult::Presented);
            }

            let err = frames.draw_frame(&mut backend).unwrap_err();
            let blocked = err.downcast_ref::<WouldBlock>().expect("should block on a fence");
            assert_eq!(blocked.slot, 0);

            // The blocked frame never got as far as acquiring an image
            assert_eq!(backend.count(|c| matches!(c, Call::Acquire(_))), n);
            assert_eq!(backend.count(|c| matches!(c, Call::Submit(_))), n);
            assert_eq!(backend.calls.last(), Some(&Call::Wait(0)));
        }
    }

    #[test]
    fn test_out_of_date_acquire_recreates_once_and_skips_draw() {
        let (mut frames, _) = frame_loop(800, 600);
        let mut backend = FakeBackend::new(2);
        backend.acquire.push(AcquireOutcome::OutOfDate);

        assert_eq!(frames.draw_frame(&mut backend).unwrap(), FrameResult::SkippedOutOfDate);

        assert_eq!(backend.count(|c| matches!(c, Call::Recreate(..))), 1);
        assert_eq!(backend.count(|c| matches!(c, Call::Record(..))), 0);
        assert_eq!(backend.count(|c| matches!(c, Call::ResetFence(_))), 0);
        assert!(backend.fences[0]);
        assert_eq!(frames.current_frame(), 0);

        // The next frame reuses the same slot and draws normally
        assert_eq!(frames.draw_frame(&mut backend).unwrap(), FrameResult::Presented);
        assert_eq!(backend.count(|c| matches!(c, Call::Recreate(..))), 1);
    }

    #[test]
    fn test_minimized_window_skips_without_gpu_work() {
        let (mut frames, size) = frame_loop(800, 600);
        let mut backend = FakeBackend::new(2);
        size.lock().on_resize(0, 0);

        assert_eq!(frames.draw_frame(&mut backend).unwrap(), FrameResult::SkippedMinimized);
        assert!(backend.calls.is_empty());

        size.lock().on_resize(640, 480);
        assert_eq!(frames.draw_frame(&mut backend).unwrap(), FrameResult::Presented);
        assert_eq!(backend.calls[0], Call::Recreate(640, 480));
    }

    #[test]
    fn test_resize_recreates_lazily_once() {
        let (mut frames, size) = frame_loop(800, 600);
        let mut backend = FakeBackend::new(2);

        size.lock().on_resize(1024, 768);
        size.lock().on_resize(1280, 720);
        assert_eq!(size.lock().generation, 2);
        assert!(backend.calls.is_empty());

        frames.draw_frame(&mut backend).unwrap();
        frames.draw_frame(&mut backend).unwrap();

        assert_eq!(backend.calls[0], Call::Recreate(1280, 720));
        assert_eq!(backend.count(|c| matches!(c, Call::Recreate(..))), 1);
    }

    #[test]
    fn test_out_of_date_present_recreates_after_presenting() {
        let (mut frames, _) = frame_loop(800, 600);
        let mut backend = FakeBackend::new(2);
        backend.present.push(PresentOutcome::OutOfDate);

        assert_eq!(frames.draw_frame(&mut backend).unwrap(), FrameResult::Presented);

        let tail = &backend.calls[backend.calls.len() - 2..];
        assert_eq!(tail, &[Call::Present(0, 0), Call::Recreate(800, 600)]);
        assert_eq!(frames.current_frame(), 1);
        assert!(!frames.recreate_pending());
    }

    #[test]
    fn test_suboptimal_acquire_skips_frame_and_recreates() {
        let (mut frames, _) = frame_loop(800, 600);
        let mut backend = FakeBackend::new(2);
        backend.acquire.push(AcquireOutcome::Acquired {
            index: 2,
            suboptimal: true,
        });

        assert_eq!(frames.draw_frame(&mut backend).unwrap(), FrameResult::SkippedOutOfDate);

        assert_eq!(
            backend.calls,
            vec![
                Call::Wait(0),
                Call::Acquire(0),
                Call::ResetFence(0),
                Call::Abandon(0),
                Call::Recreate(800, 600),
            ]
        );
        assert!(backend.fences[0]);
        assert_eq!(frames.current_frame(), 0);
        assert!(!frames.recreate_pending());
    }

    #[test]
    fn test_out_of_date_submit_skips_present() {
        let (mut frames, _) = frame_loop(800, 600);
        let mut backend = FakeBackend::new(2);
        backend.submit.push(SubmitOutcome::OutOfDate);

        assert_eq!(frames.draw_frame(&mut backend).unwrap(), FrameResult::SkippedOutOfDate);

        assert_eq!(backend.count(|c| matches!(c, Call::Present(..))), 0);
        assert_eq!(
            &backend.calls[backend.calls.len() - 3..],
            &[Call::Submit(0), Call::Abandon(0), Call::Recreate(800, 600)]
        );
        assert!(backend.fences[0]);
        assert_eq!(frames.current_frame(), 0);
        assert!(!frames.recreate_pending());
    }

    #[test]
    fn test_failed_recording_leaves_slot_reusable() {
        let (mut frames, _) = frame_loop(800, 600);
        let mut backend = FakeBackend::new(1);
        backend.fail_record = true;

        assert!(frames.draw_frame(&mut backend).is_err());
        assert_eq!(frames.state(), FrameState::Idle);
        assert!(frames.recreate_pending());
        assert!(backend.calls.contains(&Call::Abandon(0)));

        // The slot is waitable again and the pending rebuild runs first
        backend.fail_record = false;
        let start = backend.calls.len();
        assert_eq!(frames.draw_frame(&mut backend).unwrap(), FrameResult::Presented);
        assert_eq!(backend.calls[start], Call::Recreate(800, 600));
        assert!(!frames.recreate_pending());
    }

    #[test]
    fn test_failed_rebuild_after_out_of_date_is_retried() {
        let (mut frames, _) = frame_loop(800, 600);
        let mut backend = FakeBackend::new(2);
        backend.acquire.push(AcquireOutcome::OutOfDate);
        backend.fail_recreate = true;

        assert!(frames.draw_frame(&mut backend).is_err());
        assert!(frames.recreate_pending());

        // No acquire against the torn-down swapchain before it is rebuilt
        let start = backend.calls.len();
        assert_eq!(frames.draw_frame(&mut backend).unwrap(), FrameResult::Presented);
        assert_eq!(
            &backend.calls[start..start + 3],
            &[Call::Recreate(800, 600), Call::Wait(0), Call::Acquire(0)]
        );
        assert_eq!(backend.count(|c| matches!(c, Call::Recreate(..))), 2);
        assert!(!frames.recreate_pending());
    }

    #[test]
    fn test_failed_resize_rebuild_is_retried() {
        let (mut frames, size) = frame_loop(800, 600);
        let mut backend = FakeBackend::new(2);
        size.lock().on_resize(1024, 768);
        backend.fail_recreate = true;

        assert!(frames.draw_frame(&mut backend).is_err());
        assert_eq!(backend.calls, vec![Call::Recreate(1024, 768)]);

        assert_eq!(frames.draw_frame(&mut backend).unwrap(), FrameResult::Presented);
        assert_eq!(backend.calls[1], Call::Recreate(1024, 768));
        assert_eq!(backend.count(|c| matches!(c, Call::Recreate(..))), 2);
    }

    #[test]
    fn test_zero_area_surface_defers_rebuild() {
        let (mut frames, size) = frame_loop(800, 600);
        let mut backend = FakeBackend::new(2);
        size.lock().on_resize(1024, 768);
        backend.surface_has_area = false;

        assert_eq!(frames.draw_frame(&mut backend).unwrap(), FrameResult::SkippedMinimized);
        assert_eq!(backend.calls, vec![Call::Recreate(1024, 768)]);
        assert!(frames.recreate_pending());

        backend.surface_has_area = true;
        assert_eq!(frames.draw_frame(&mut backend).unwrap(), FrameResult::Presented);
        assert_eq!(backend.calls[1], Call::Recreate(1024, 768));
        assert!(!frames.recreate_pending());
    }
}
