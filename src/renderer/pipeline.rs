//! The overlay state machine driven by the host's own calls.
//!
//! ```text
//!                 present, queue latched
//! Uninitialized ─────────────────────────▶ Initializing ──▶ Active
//!       ▲              (failure: retry next frame) │           │
//!       └──────────────────────────────────────────┴───────────┘
//!                               resize
//! ```
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::{debug, error, trace};

use crate::config::{LatchPolicy, OverlayConfig};
use crate::renderer::input::{InputClass, InputEvent};
use crate::renderer::latch::QueueLatch;
use crate::renderer::script::{Bindings, ScriptHost, TextureLoaderFn};
use crate::renderer::texture::{self, SharedTextureLoader, TextureLoader, FONT_SLOT};
use crate::renderer::{FrameContexts, Overlay, RenderBackend, ResourceState, WindowHandle};
use crate::{Error, Result};

/// The UI type handed to scripts by a backend's overlay.
pub type UiOf<B> = <<B as RenderBackend>::Overlay as Overlay>::Ui;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayState {
    Uninitialized,
    Initializing,
    Active,
}

/// What to do with a window message after the overlay has seen it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    Forward,
    Swallow,
}

struct Resources<B: RenderBackend> {
    #[allow(unused)]
    device: B::Device,
    frames: FrameContexts<B>,
    overlay: B::Overlay,
}

/// All hook and render state of one overlay.
///
/// Hook bodies call [`Pipeline::execute_command_lists`], [`Pipeline::present`]
/// and [`Pipeline::resize_buffers`] with a closure invoking the original
/// function; the closure runs exactly once whatever happens to the overlay.
pub struct Pipeline<B: RenderBackend + 'static, S: ScriptHost<UiOf<B>>> {
    backend: B,
    script: S,
    config: OverlayConfig,
    state: OverlayState,
    latch: QueueLatch<B::Queue>,
    resources: Option<Resources<B>>,
    window: Option<(WindowHandle, B::WindowProc)>,
    bindings: Bindings,
    loader: SharedTextureLoader<B>,
    loader_fn: TextureLoaderFn,
    next_slot: Rc<Cell<u32>>,
    init_passes: usize,
}

impl<B: RenderBackend + 'static, S: ScriptHost<UiOf<B>>> Pipeline<B, S> {
    pub fn new(backend: B, script: S, config: OverlayConfig) -> Self {
        let loader: SharedTextureLoader<B> = Rc::new(RefCell::new(None));
        let loader_fn = texture::loader_fn(&loader);

        Self {
            backend,
            script,
            latch: QueueLatch::new(config.latch_policy),
            config,
            state: OverlayState::Uninitialized,
            resources: None,
            window: None,
            bindings: Bindings::default(),
            loader,
            loader_fn,
            next_slot: Rc::new(Cell::new(FONT_SLOT + 1)),
            init_passes: 0,
        }
    }

    pub fn state(&self) -> OverlayState {
        self.state
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.config
    }

    pub fn script(&self) -> &S {
        &self.script
    }

    pub fn script_mut(&mut self) -> &mut S {
        &mut self.script
    }

    pub fn latched_queue(&self) -> Option<&B::Queue> {
        self.latch.get()
    }

    /// Number of frame contexts currently alive.
    pub fn frame_count(&self) -> usize {
        self.resources.as_ref().map_or(0, |r| r.frames.len())
    }

    pub fn frames(&self) -> Option<&FrameContexts<B>> {
        self.resources.as_ref().map(|r| &r.frames)
    }

    pub fn overlay(&self) -> Option<&B::Overlay> {
        self.resources.as_ref().map(|r| &r.overlay)
    }

    pub fn overlay_mut(&mut self) -> Option<&mut B::Overlay> {
        self.resources.as_mut().map(|r| &mut r.overlay)
    }

    /// How many times the overlay went through a complete initialization.
    pub fn init_passes(&self) -> usize {
        self.init_passes
    }

    pub fn window_hooked(&self) -> bool {
        self.window.is_some()
    }

    /// The callable registered into scripts for loading textures.
    pub fn texture_loader(&self) -> TextureLoaderFn {
        Rc::clone(&self.loader_fn)
    }

    /// Command submission hook body.
    pub fn execute_command_lists<R>(
        &mut self,
        queue: &B::Queue,
        original: impl FnOnce() -> R,
    ) -> R {
        let settled = self.latch.is_latched() && self.latch.policy() == LatchPolicy::First;
        if !settled {
            let is_direct = self.backend.queue_is_direct(queue);
            if self.latch.observe(queue, is_direct) {
                debug!("Presentation queue latched");
            }
        }

        original()
    }

    /// Present hook body.
    pub fn present<R>(&mut self, swap_chain: &B::SwapChain, original: impl FnOnce() -> R) -> R {
        let Some(queue) = self.latch.get().cloned() else {
            trace!("No queue latched yet, forwarding present");
            return original();
        };

        if self.resources.is_none() {
            self.state = OverlayState::Initializing;

            match self.initialize(swap_chain) {
                Ok(resources) => {
                    self.resources = Some(resources);
                    self.state = OverlayState::Active;
                    self.bindings.invalidate();
                    self.init_passes += 1;
                    debug!("Overlay initialized (pass {})", self.init_passes);
                },
                Err(e) => {
                    error!("Overlay initialization failed: {e}");
                    self.state = OverlayState::Uninitialized;
                    return original();
                },
            }
        }

        if let Err(e) = self.render_frame(swap_chain, &queue) {
            error!("Overlay frame failed: {e}");
        }

        original()
    }

    /// Buffer resize hook body.
    pub fn resize_buffers<R>(&mut self, original: impl FnOnce() -> R) -> R {
        self.reset();
        original()
    }

    /// Window procedure hook body. `None` stands for messages that carry no
    /// input.
    pub fn route_input(&mut self, event: Option<&InputEvent>) -> Routing {
        let (Some(resources), Some(event)) = (self.resources.as_mut(), event) else {
            return Routing::Forward;
        };

        let overlay = &mut resources.overlay;
        overlay.handle_input(event);

        let captured = match event.class() {
            InputClass::Mouse => overlay.want_capture_mouse(),
            InputClass::Keyboard => overlay.want_capture_keyboard(),
        };

        if captured {
            Routing::Swallow
        } else {
            Routing::Forward
        }
    }

    /// Release every per-swapchain object and go back to `Uninitialized`.
    /// The window procedure and the latched queue are kept.
    pub fn reset(&mut self) {
        self.loader.borrow_mut().take();
        if self.resources.take().is_some() {
            debug!("Overlay resources released");
        }
        self.state = OverlayState::Uninitialized;
    }

    /// Release everything and give the window its procedure back.
    pub fn teardown(&mut self) {
        self.reset();
        if let Some((window, original)) = self.window.take() {
            debug!("Restoring window procedure of {window:?}");
            self.backend.restore_window_proc(window, original);
        }
        self.latch.clear();
    }

    fn initialize(&mut self, swap_chain: &B::SwapChain) -> Result<Resources<B>> {
        let backend = &self.backend;

        let device = backend.swap_chain_device(swap_chain)?;
        let info = backend.swap_chain_info(swap_chain)?;

        if self.window.is_none() {
            let original = backend.install_window_proc(info.window)?;
            debug!("Window procedure of {:?} replaced", info.window);
            self.window = Some((info.window, original));
        }

        let frames = FrameContexts::create(
            backend,
            &device,
            swap_chain,
            info.buffer_count,
            self.next_slot.get(),
            self.config.texture_slots,
        )?;

        let overlay = backend.create_overlay(&device, &info, &frames.srv_heap, &self.config)?;

        *self.loader.borrow_mut() = Some(TextureLoader::new(
            backend.clone(),
            device.clone(),
            frames.srv_heap.clone(),
            frames.srv_capacity,
            Rc::clone(&self.next_slot),
        ));

        Ok(Resources { device, frames, overlay })
    }

    fn render_frame(&mut self, swap_chain: &B::SwapChain, queue: &B::Queue) -> Result<()> {
        let Some(resources) = self.resources.as_mut() else {
            return Ok(());
        };

        let script = &mut self.script;
        let bindings = &mut self.bindings;
        let loader_fn = &self.loader_fn;
        let config = &self.config;

        resources.overlay.new_frame(&mut |ui| {
            Bindings::refresh::<UiOf<B>, S>(bindings, script, &config.texture_binding, loader_fn);
            script.run(&config.frame_callback, ui);
        });

        let backend = &self.backend;
        let index = backend.current_back_buffer_index(swap_chain);
        let frame = resources.frames.get(index).ok_or_else(|| {
            Error::unknown(format!(
                "back buffer {index} has no frame context ({} alive)",
                resources.frames.len()
            ))
        })?;
        let list = &resources.frames.command_list;

        backend.reset_allocator(&frame.command_allocator)?;
        backend.reset_command_list(list, &frame.command_allocator)?;

        let back_buffer = &frame.back_buffer;
        backend.transition(list, back_buffer, ResourceState::Present, ResourceState::RenderTarget);
        backend.bind_render_target(list, frame.rtv, &resources.frames.srv_heap);

        // The back buffer goes back to the presentable state even if recording failed.
        let rendered = resources.overlay.render(list, index);

        backend.transition(list, back_buffer, ResourceState::RenderTarget, ResourceState::Present);
        backend.close_command_list(list)?;
        backend.execute(queue, list);

        rendered
    }
}

impl<B: RenderBackend + 'static, S: ScriptHost<UiOf<B>>> Drop for Pipeline<B, S> {
    fn drop(&mut self) {
        self.teardown();
    }
}
