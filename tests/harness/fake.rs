//! An in-memory graphics backend, overlay, script host and hook backend.
//!
//! Every object the backend creates is counted while alive, and every call is
//! appended to an operation log, so tests can check both what the pipeline
//! asked for and what it released.
use std::cell::{Cell, RefCell};
use std::ffi::c_void;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicPtr, Ordering};

use hudscript::config::OverlayConfig;
use hudscript::hooks::HookBackend;
use hudscript::renderer::input::InputEvent;
use hudscript::renderer::{
    HeapKind, InterpreterHandle, LoadedTexture, Overlay, RenderBackend, ResourceState,
    ScriptEntry, ScriptHost, SwapChainInfo, TextureLoaderFn, WindowHandle,
};
use hudscript::{Error, Result};
use imgui::TextureId;

pub const WINDOW: WindowHandle = WindowHandle(0x1234);
pub const ORIGINAL_WNDPROC: isize = 0xdead;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    SwapChainDevice,
    SwapChainInfo,
    BackBuffer(usize),
    CreateHeap(HeapKind, u32),
    CreateRtv(usize),
    CreateAllocator,
    CreateCommandList,
    ResetAllocator,
    ResetCommandList,
    Transition(ResourceState, ResourceState),
    BindRenderTarget(usize),
    Close,
    Execute { queue: u32 },
    Upload { width: u32, height: u32, pitch: u32, len: usize },
    TextureView(u32),
    InstallWindowProc(WindowHandle),
    RestoreWindowProc(WindowHandle, isize),
    CreateOverlay,
    NewFrame,
    Render(usize),
}

/// Backend operations that can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Device,
    Info,
    WindowProc,
    SrvHeap,
    RtvHeap,
    BackBuffer,
    Allocator,
    CommandList,
    Overlay,
    ResetAllocator,
    Upload,
}

#[derive(Default)]
pub struct FakeState {
    pub ops: Vec<Op>,
    pub live: Rc<Cell<usize>>,
    pub fail: Option<Step>,
    pub fail_render: bool,
    pub want_capture_mouse: bool,
    pub want_capture_keyboard: bool,
    pub inputs: Vec<InputEvent>,
}

impl FakeState {
    pub fn count(&self, op: &Op) -> usize {
        self.ops.iter().filter(|o| *o == op).count()
    }
}

struct Tracked {
    live: Rc<Cell<usize>>,
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.live.set(self.live.get() - 1);
    }
}

/// A reference-counted GPU object. Clones share one allocation, like COM
/// references do.
#[derive(Clone)]
pub struct Obj(#[allow(unused)] Rc<Tracked>);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FakeQueue {
    pub id: u32,
    pub direct: bool,
}

impl FakeQueue {
    pub fn direct(id: u32) -> Self {
        Self { id, direct: true }
    }

    pub fn compute(id: u32) -> Self {
        Self { id, direct: false }
    }
}

pub struct FakeSwapChain {
    pub buffer_count: Cell<u32>,
    pub current: Cell<usize>,
}

impl FakeSwapChain {
    pub fn new(buffer_count: u32) -> Self {
        Self { buffer_count: Cell::new(buffer_count), current: Cell::new(0) }
    }

    pub fn advance(&self) {
        let count = self.buffer_count.get().max(1) as usize;
        self.current.set((self.current.get() + 1) % count);
    }
}

#[derive(Clone, Default)]
pub struct FakeBackend {
    pub state: Rc<RefCell<FakeState>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> Vec<Op> {
        self.state.borrow().ops.clone()
    }

    pub fn count(&self, op: &Op) -> usize {
        self.state.borrow().count(op)
    }

    pub fn clear_ops(&self) {
        self.state.borrow_mut().ops.clear();
    }

    /// Objects created by this backend that are still referenced.
    pub fn live(&self) -> usize {
        self.state.borrow().live.get()
    }

    pub fn fail_at(&self, step: Option<Step>) {
        self.state.borrow_mut().fail = step;
    }

    pub fn fail_render(&self, fail: bool) {
        self.state.borrow_mut().fail_render = fail;
    }

    pub fn capture(&self, mouse: bool, keyboard: bool) {
        let mut state = self.state.borrow_mut();
        state.want_capture_mouse = mouse;
        state.want_capture_keyboard = keyboard;
    }

    fn log(&self, op: Op) {
        self.state.borrow_mut().ops.push(op);
    }

    fn check(&self, step: Step) -> Result<()> {
        if self.state.borrow().fail == Some(step) {
            Err(Error::Unknown(format!("injected failure at {step:?}")))
        } else {
            Ok(())
        }
    }

    fn obj(&self) -> Obj {
        let live = Rc::clone(&self.state.borrow().live);
        live.set(live.get() + 1);
        Obj(Rc::new(Tracked { live }))
    }
}

impl RenderBackend for FakeBackend {
    type SwapChain = FakeSwapChain;
    type Queue = FakeQueue;
    type Device = Obj;
    type Resource = Obj;
    type Allocator = Obj;
    type CommandList = Obj;
    type DescriptorHeap = Obj;
    type RtvHandle = usize;
    type WindowProc = isize;
    type Overlay = FakeOverlay;

    fn queue_is_direct(&self, queue: &FakeQueue) -> bool {
        queue.direct
    }

    fn swap_chain_device(&self, _: &FakeSwapChain) -> Result<Obj> {
        self.log(Op::SwapChainDevice);
        self.check(Step::Device)?;
        Ok(self.obj())
    }

    fn swap_chain_info(&self, swap_chain: &FakeSwapChain) -> Result<SwapChainInfo> {
        self.log(Op::SwapChainInfo);
        self.check(Step::Info)?;
        Ok(SwapChainInfo { buffer_count: swap_chain.buffer_count.get(), window: WINDOW, format: 28 })
    }

    fn current_back_buffer_index(&self, swap_chain: &FakeSwapChain) -> usize {
        swap_chain.current.get()
    }

    fn back_buffer(&self, _: &FakeSwapChain, index: usize) -> Result<Obj> {
        self.log(Op::BackBuffer(index));
        self.check(Step::BackBuffer)?;
        Ok(self.obj())
    }

    fn create_descriptor_heap(&self, _: &Obj, kind: HeapKind, count: u32) -> Result<Obj> {
        self.log(Op::CreateHeap(kind, count));
        match kind {
            HeapKind::ShaderResource => self.check(Step::SrvHeap)?,
            HeapKind::RenderTarget => self.check(Step::RtvHeap)?,
        }
        Ok(self.obj())
    }

    fn rtv_handle(&self, _: &Obj, _: &Obj, index: usize) -> usize {
        0x1000 + index
    }

    fn create_render_target_view(&self, _: &Obj, _: &Obj, handle: usize) {
        self.log(Op::CreateRtv(handle));
    }

    fn create_command_allocator(&self, _: &Obj) -> Result<Obj> {
        self.log(Op::CreateAllocator);
        self.check(Step::Allocator)?;
        Ok(self.obj())
    }

    fn create_command_list(&self, _: &Obj, _: &Obj) -> Result<Obj> {
        self.log(Op::CreateCommandList);
        self.check(Step::CommandList)?;
        Ok(self.obj())
    }

    fn reset_allocator(&self, _: &Obj) -> Result<()> {
        self.log(Op::ResetAllocator);
        self.check(Step::ResetAllocator)
    }

    fn reset_command_list(&self, _: &Obj, _: &Obj) -> Result<()> {
        self.log(Op::ResetCommandList);
        Ok(())
    }

    fn transition(&self, _: &Obj, _: &Obj, from: ResourceState, to: ResourceState) {
        self.log(Op::Transition(from, to));
    }

    fn bind_render_target(&self, _: &Obj, rtv: usize, _: &Obj) {
        self.log(Op::BindRenderTarget(rtv));
    }

    fn close_command_list(&self, _: &Obj) -> Result<()> {
        self.log(Op::Close);
        Ok(())
    }

    fn execute(&self, queue: &FakeQueue, _: &Obj) {
        self.log(Op::Execute { queue: queue.id });
    }

    fn upload_texture(
        &self,
        _: &Obj,
        padded: &[u8],
        width: u32,
        height: u32,
        pitch: u32,
    ) -> Result<Obj> {
        self.log(Op::Upload { width, height, pitch, len: padded.len() });
        self.check(Step::Upload)?;
        Ok(self.obj())
    }

    fn create_texture_view(&self, _: &Obj, _: &Obj, slot: u32, _: &Obj) -> TextureId {
        self.log(Op::TextureView(slot));
        TextureId::from(slot as usize)
    }

    fn install_window_proc(&self, window: WindowHandle) -> Result<isize> {
        self.log(Op::InstallWindowProc(window));
        self.check(Step::WindowProc)?;
        Ok(ORIGINAL_WNDPROC)
    }

    fn restore_window_proc(&self, window: WindowHandle, original: isize) {
        self.log(Op::RestoreWindowProc(window, original));
    }

    fn create_overlay(
        &self,
        _: &Obj,
        _: &SwapChainInfo,
        _: &Obj,
        _: &OverlayConfig,
    ) -> Result<FakeOverlay> {
        self.log(Op::CreateOverlay);
        self.check(Step::Overlay)?;
        Ok(FakeOverlay { backend: self.clone(), _font: self.obj(), frames: 0 })
    }
}

/// What scripts get to build with.
#[derive(Debug, Default)]
pub struct FakeUi {
    pub frame: u64,
}

pub struct FakeOverlay {
    backend: FakeBackend,
    _font: Obj,
    frames: u64,
}

impl Overlay for FakeOverlay {
    type Ui = FakeUi;
    type CommandList = Obj;

    fn new_frame(&mut self, build: &mut dyn FnMut(&mut FakeUi)) {
        self.backend.log(Op::NewFrame);
        self.frames += 1;
        build(&mut FakeUi { frame: self.frames });
    }

    fn render(&mut self, _: &Obj, frame_index: usize) -> Result<()> {
        self.backend.log(Op::Render(frame_index));
        if self.backend.state.borrow().fail_render {
            return Err(Error::Unknown("injected render failure".into()));
        }
        Ok(())
    }

    fn handle_input(&mut self, event: &InputEvent) {
        self.backend.state.borrow_mut().inputs.push(*event);
    }

    fn want_capture_mouse(&self) -> bool {
        self.backend.state.borrow().want_capture_mouse
    }

    fn want_capture_keyboard(&self) -> bool {
        self.backend.state.borrow().want_capture_keyboard
    }
}

/// A script host with a fixed set of scripts that records what it was asked
/// to do.
#[derive(Default)]
pub struct FakeScript {
    pub token: u64,
    pub scripts: Vec<(String, ScriptEntry)>,
    pub ui_registrations: usize,
    pub loaders: Vec<(InterpreterHandle, String, TextureLoaderFn)>,
    pub runs: Vec<(String, u64)>,
    /// Files loaded through the registered loader on every run.
    pub load_on_run: Vec<PathBuf>,
    pub loaded: Vec<Result<LoadedTexture>>,
}

impl FakeScript {
    pub fn new(token: u64) -> Self {
        Self { token, ..Default::default() }
    }

    pub fn with_script(mut self, name: &str, id: usize, started: bool) -> Self {
        let interpreter = InterpreterHandle(id as *mut c_void);
        self.scripts.push((name.to_string(), ScriptEntry { interpreter, started }));
        self
    }
}

impl ScriptHost<FakeUi> for FakeScript {
    fn reload_token(&self) -> u64 {
        self.token
    }

    fn script_names(&self) -> Vec<String> {
        self.scripts.iter().map(|(name, _)| name.clone()).collect()
    }

    fn script(&self, name: &str) -> Option<ScriptEntry> {
        self.scripts.iter().find(|(n, _)| n == name).map(|(_, entry)| *entry)
    }

    fn register_ui_bindings(&mut self) {
        self.ui_registrations += 1;
    }

    fn register_texture_loader(
        &mut self,
        interpreter: InterpreterHandle,
        name: &str,
        loader: TextureLoaderFn,
    ) {
        self.loaders.push((interpreter, name.to_string(), loader));
    }

    fn run(&mut self, callback: &str, ui: &mut FakeUi) {
        self.runs.push((callback.to_string(), ui.frame));

        if let Some((_, _, loader)) = self.loaders.last() {
            let loader = Rc::clone(loader);
            for path in &self.load_on_run {
                self.loaded.push(loader(path.as_path()));
            }
        }
    }
}

/// A hook backend that only pretends to patch code.
#[derive(Default)]
pub struct FakeHookBackend {
    pub installed: Vec<usize>,
    pub removed: Vec<usize>,
    pub fail_install: Option<usize>,
    pub fail_remove: Option<usize>,
}

impl HookBackend for FakeHookBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    unsafe fn install(
        &mut self,
        target: *mut c_void,
        _replacement: *mut c_void,
        original: &AtomicPtr<c_void>,
    ) -> Result<()> {
        let target = target as usize;
        if self.fail_install == Some(target) {
            return Err(Error::Hook(format!("refusing {target:#x}")));
        }
        original.store((target + 1) as *mut c_void, Ordering::SeqCst);
        self.installed.push(target);
        Ok(())
    }

    unsafe fn remove(&mut self, target: *mut c_void) -> Result<()> {
        let target = target as usize;
        if self.fail_remove == Some(target) {
            return Err(Error::Hook(format!("refusing to remove {target:#x}")));
        }
        self.removed.push(target);
        Ok(())
    }
}
