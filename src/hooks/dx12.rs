//! Hooks for DirectX 12 applications.
//!
//! [`Dx12Hooks::install`] captures the dispatch table, stores an overlay
//! [`Pipeline`] in a process-wide slot and redirects
//! `ID3D12CommandQueue::ExecuteCommandLists`, `IDXGISwapChain::Present` and
//! `IDXGISwapChain::ResizeBuffers` into it.
use std::ffi::c_void;
use std::mem;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::thread;
use std::time::Duration;

use imgui::Ui;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, error, info, trace};
use windows::core::{s, w, ComInterface, Interface, GUID, HRESULT, PCSTR, PCWSTR};
use windows::Win32::Foundation::{BOOL, HINSTANCE, HMODULE, HWND, LPARAM, LRESULT, WPARAM};
use windows::Win32::Graphics::Direct3D::D3D_FEATURE_LEVEL;
use windows::Win32::Graphics::Direct3D::D3D_FEATURE_LEVEL_11_0;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;
use windows::Win32::Graphics::Dxgi::*;
use windows::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};
use windows::Win32::UI::WindowsAndMessaging::*;

use crate::config::OverlayConfig;
use crate::dispatch::{DispatchTable, EXECUTE_COMMAND_LISTS, PRESENT, RESIZE_BUFFERS};
use crate::hooks::{self, HookBackend, HookManager};
use crate::renderer::backend::dx12::{Dx12Backend, WndProcType};
use crate::renderer::input;
use crate::renderer::{Pipeline, Routing, ScriptHost};
use crate::util::CallFence;
use crate::{Error, Result};

type DXGISwapChainPresentType =
    unsafe extern "system" fn(this: *mut c_void, sync_interval: u32, flags: u32) -> HRESULT;

type ExecuteCommandListsType = unsafe extern "system" fn(
    this: *mut c_void,
    num_command_lists: u32,
    command_lists: *const *mut c_void,
);

type ResizeBuffersType = unsafe extern "system" fn(
    this: *mut c_void,
    buffer_count: u32,
    width: u32,
    height: u32,
    new_format: DXGI_FORMAT,
    flags: u32,
) -> HRESULT;

type CreateDXGIFactoryType =
    unsafe extern "system" fn(riid: *const GUID, factory: *mut *mut c_void) -> HRESULT;

type D3D12CreateDeviceType = unsafe extern "system" fn(
    adapter: *mut c_void,
    minimum_feature_level: D3D_FEATURE_LEVEL,
    riid: *const GUID,
    device: *mut *mut c_void,
) -> HRESULT;

/// The overlay pipeline as driven by these hooks.
pub type Dx12Pipeline = Pipeline<Dx12Backend, Box<dyn ScriptHost<Ui> + Send>>;

struct PipelineSlot(Dx12Pipeline);

// The pipeline is only ever touched with `PIPELINE` locked, and the `Rc`s it
// holds never leave it.
unsafe impl Send for PipelineSlot {}

static PIPELINE: Lazy<Mutex<Option<PipelineSlot>>> = Lazy::new(|| Mutex::new(None));

static PRESENT_ORIGINAL: AtomicPtr<c_void> = AtomicPtr::new(null_mut());
static EXECUTE_COMMAND_LISTS_ORIGINAL: AtomicPtr<c_void> = AtomicPtr::new(null_mut());
static RESIZE_BUFFERS_ORIGINAL: AtomicPtr<c_void> = AtomicPtr::new(null_mut());
static WND_PROC_ORIGINAL: AtomicPtr<c_void> = AtomicPtr::new(null_mut());

static PRESENT_RUNNING: CallFence = CallFence::new();
static EXECUTE_COMMAND_LISTS_RUNNING: CallFence = CallFence::new();
static RESIZE_BUFFERS_RUNNING: CallFence = CallFence::new();
static WND_PROC_RUNNING: CallFence = CallFence::new();

////////////////////////////////////////////////////////////////////////////////////////////////////
// Hook entry points
////////////////////////////////////////////////////////////////////////////////////////////////////

unsafe extern "system" fn execute_command_lists_impl(
    this: *mut c_void,
    num_command_lists: u32,
    command_lists: *const *mut c_void,
) {
    let _fence = EXECUTE_COMMAND_LISTS_RUNNING.enter();

    let original = || {
        let trampoline: ExecuteCommandListsType =
            mem::transmute(EXECUTE_COMMAND_LISTS_ORIGINAL.load(Ordering::SeqCst));
        trampoline(this, num_command_lists, command_lists)
    };

    let Some(mut slot) = PIPELINE.try_lock() else {
        return original();
    };

    match (slot.as_mut(), ID3D12CommandQueue::from_raw_borrowed(&this)) {
        (Some(PipelineSlot(pipeline)), Some(queue)) => {
            pipeline.execute_command_lists(queue, original)
        },
        _ => original(),
    }
}

unsafe extern "system" fn present_impl(
    this: *mut c_void,
    sync_interval: u32,
    flags: u32,
) -> HRESULT {
    let _fence = PRESENT_RUNNING.enter();

    trace!("IDXGISwapChain3::Present({this:p}, {sync_interval}, {flags}) invoked");

    let original = || {
        let trampoline: DXGISwapChainPresentType =
            mem::transmute(PRESENT_ORIGINAL.load(Ordering::SeqCst));
        trampoline(this, sync_interval, flags)
    };

    let Some(mut slot) = PIPELINE.try_lock() else {
        trace!("Overlay busy, forwarding present");
        return original();
    };

    let swap_chain = IDXGISwapChain::from_raw_borrowed(&this)
        .and_then(|swap_chain| swap_chain.cast::<IDXGISwapChain3>().ok());

    match (slot.as_mut(), swap_chain) {
        (Some(PipelineSlot(pipeline)), Some(swap_chain)) => pipeline.present(&swap_chain, original),
        _ => original(),
    }
}

unsafe extern "system" fn resize_buffers_impl(
    this: *mut c_void,
    buffer_count: u32,
    width: u32,
    height: u32,
    new_format: DXGI_FORMAT,
    flags: u32,
) -> HRESULT {
    let _fence = RESIZE_BUFFERS_RUNNING.enter();

    trace!("IDXGISwapChain3::ResizeBuffers({buffer_count}, {width}, {height}) invoked");

    let original = || {
        let trampoline: ResizeBuffersType =
            mem::transmute(RESIZE_BUFFERS_ORIGINAL.load(Ordering::SeqCst));
        trampoline(this, buffer_count, width, height, new_format, flags)
    };

    // Blocking: the back buffer references must be gone before the resize.
    match PIPELINE.lock().as_mut() {
        Some(PipelineSlot(pipeline)) => pipeline.resize_buffers(original),
        None => original(),
    }
}

unsafe extern "system" fn wnd_proc_impl(
    hwnd: HWND,
    umsg: u32,
    wparam: WPARAM,
    lparam: LPARAM,
) -> LRESULT {
    let _fence = WND_PROC_RUNNING.enter();

    let event = input::decode_message(umsg, wparam, lparam);

    // The lock is released before the original procedure runs, which may well
    // resize the swapchain.
    let routing = match PIPELINE.try_lock() {
        Some(mut slot) => match slot.as_mut() {
            Some(PipelineSlot(pipeline)) => pipeline.route_input(event.as_ref()),
            None => Routing::Forward,
        },
        None => Routing::Forward,
    };

    if routing == Routing::Swallow {
        return LRESULT(0);
    }

    match WND_PROC_ORIGINAL.load(Ordering::SeqCst) {
        original if original.is_null() => DefWindowProcW(hwnd, umsg, wparam, lparam),
        original => {
            let original: WndProcType = mem::transmute(original);
            CallWindowProcW(Some(original), hwnd, umsg, wparam, lparam)
        },
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Dispatch table capture
////////////////////////////////////////////////////////////////////////////////////////////////////

const CAPTURE_CLASS: PCWSTR = w!("hudscript capture window");

unsafe extern "system" fn capture_wnd_proc(
    hwnd: HWND,
    umsg: u32,
    wparam: WPARAM,
    lparam: LPARAM,
) -> LRESULT {
    DefWindowProcW(hwnd, umsg, wparam, lparam)
}

/// Hidden zero-size window, destroyed together with its class on drop.
struct CaptureWindow {
    hwnd: HWND,
    instance: HINSTANCE,
}

impl CaptureWindow {
    unsafe fn new() -> Result<Self> {
        let instance = HINSTANCE(GetModuleHandleW(PCWSTR::null())?.0);

        let class = WNDCLASSEXW {
            cbSize: mem::size_of::<WNDCLASSEXW>() as u32,
            style: CS_HREDRAW | CS_VREDRAW,
            lpfnWndProc: Some(capture_wnd_proc),
            hInstance: instance,
            lpszClassName: CAPTURE_CLASS,
            ..Default::default()
        };

        if RegisterClassExW(&class) == 0 {
            return Err(Error::unknown(format!(
                "registering the capture window class: {}",
                windows::core::Error::from_win32()
            )));
        }

        let hwnd = CreateWindowExW(
            WINDOW_EX_STYLE(0),
            CAPTURE_CLASS,
            w!("hudscript"),
            WS_OVERLAPPEDWINDOW,
            0,
            0,
            0,
            0,
            HWND(0),
            HMENU(0),
            instance,
            None,
        );

        if hwnd.0 == 0 {
            let e = windows::core::Error::from_win32();
            let _ = UnregisterClassW(CAPTURE_CLASS, instance);
            return Err(Error::unknown(format!("creating the capture window: {e}")));
        }

        Ok(Self { hwnd, instance })
    }
}

impl Drop for CaptureWindow {
    fn drop(&mut self) {
        unsafe {
            let _ = DestroyWindow(self.hwnd);
            let _ = UnregisterClassW(CAPTURE_CLASS, self.instance);
        }
    }
}

unsafe fn loaded_module(name: PCWSTR, display: &'static str) -> Result<HMODULE> {
    GetModuleHandleW(name).map_err(|_| Error::ModuleNotFound(display))
}

unsafe fn proc_address(module: HMODULE, name: PCSTR, display: &str) -> Result<*const c_void> {
    GetProcAddress(module, name)
        .map(|f| f as *const c_void)
        .ok_or_else(|| Error::unknown(format!("{display} not exported")))
}

/// Take ownership of an interface returned through a raw out-pointer.
unsafe fn owned<T: Interface>(hr: HRESULT, raw: *mut c_void, what: &str) -> Result<T> {
    hr.ok().map_err(|e| Error::unknown(format!("{what}: {e}")))?;
    if raw.is_null() {
        return Err(Error::unknown(format!("{what} returned no interface")));
    }
    Ok(T::from_raw(raw))
}

/// Build throwaway instances of the device, command queue, command
/// allocator, command list and swapchain interfaces and read their dispatch
/// tables.
///
/// `dxgi.dll` and `d3d12.dll` must already be loaded in the process.
pub fn capture_dispatch_table() -> Result<DispatchTable> {
    unsafe {
        let dxgi = loaded_module(w!("dxgi.dll"), "dxgi.dll")?;
        let d3d12 = loaded_module(w!("d3d12.dll"), "d3d12.dll")?;

        let window = CaptureWindow::new()?;

        let create_dxgi_factory: CreateDXGIFactoryType =
            mem::transmute(proc_address(dxgi, s!("CreateDXGIFactory"), "CreateDXGIFactory")?);
        let d3d12_create_device: D3D12CreateDeviceType =
            mem::transmute(proc_address(d3d12, s!("D3D12CreateDevice"), "D3D12CreateDevice")?);

        let mut raw = null_mut();
        let hr = create_dxgi_factory(&IDXGIFactory::IID, &mut raw);
        let factory: IDXGIFactory = owned(hr, raw, "CreateDXGIFactory")?;

        let adapter = factory.EnumAdapters(0).map_err(Error::unknown)?;

        let mut raw = null_mut();
        let hr = d3d12_create_device(
            adapter.as_raw(),
            D3D_FEATURE_LEVEL_11_0,
            &ID3D12Device::IID,
            &mut raw,
        );
        let device: ID3D12Device = owned(hr, raw, "D3D12CreateDevice")?;

        let command_queue: ID3D12CommandQueue = device
            .CreateCommandQueue(&D3D12_COMMAND_QUEUE_DESC {
                Type: D3D12_COMMAND_LIST_TYPE_DIRECT,
                Priority: 0,
                Flags: D3D12_COMMAND_QUEUE_FLAG_NONE,
                NodeMask: 0,
            })
            .map_err(Error::unknown)?;

        let command_allocator: ID3D12CommandAllocator = device
            .CreateCommandAllocator(D3D12_COMMAND_LIST_TYPE_DIRECT)
            .map_err(Error::unknown)?;

        let command_list: ID3D12GraphicsCommandList = device
            .CreateCommandList(0, D3D12_COMMAND_LIST_TYPE_DIRECT, &command_allocator, None)
            .map_err(Error::unknown)?;

        let mut swap_chain: Option<IDXGISwapChain> = None;
        factory
            .CreateSwapChain(
                &command_queue,
                &DXGI_SWAP_CHAIN_DESC {
                    BufferDesc: DXGI_MODE_DESC {
                        Width: 100,
                        Height: 100,
                        RefreshRate: DXGI_RATIONAL { Numerator: 60, Denominator: 1 },
                        Format: DXGI_FORMAT_R8G8B8A8_UNORM,
                        ScanlineOrdering: DXGI_MODE_SCANLINE_ORDER_UNSPECIFIED,
                        Scaling: DXGI_MODE_SCALING_UNSPECIFIED,
                    },
                    SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
                    BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
                    BufferCount: 2,
                    OutputWindow: window.hwnd,
                    Windowed: BOOL(1),
                    SwapEffect: DXGI_SWAP_EFFECT_FLIP_DISCARD,
                    Flags: 0,
                },
                &mut swap_chain,
            )
            .ok()
            .map_err(Error::unknown)?;
        let swap_chain = swap_chain.ok_or_else(|| Error::unknown("CreateSwapChain returned null"))?;

        let table = DispatchTable::capture([
            device.as_raw(),
            command_queue.as_raw(),
            command_allocator.as_raw(),
            command_list.as_raw(),
            swap_chain.as_raw(),
        ])?;

        trace!("IDXGISwapChain::Present                 = {:p}", table.get(PRESENT)?);
        trace!("ID3D12CommandQueue::ExecuteCommandLists = {:p}", table.get(EXECUTE_COMMAND_LISTS)?);
        trace!("IDXGISwapChain::ResizeBuffers           = {:p}", table.get(RESIZE_BUFFERS)?);

        Ok(table)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Installation
////////////////////////////////////////////////////////////////////////////////////////////////////

struct HookSlot {
    manager: HookManager<Box<dyn HookBackend + Send>>,
    drain_delay: Duration,
}

// The hook records only carry code addresses.
unsafe impl Send for HookSlot {}

/// Hooks that went live, including those of an install that failed part way.
static HOOKS: Lazy<Mutex<Option<HookSlot>>> = Lazy::new(|| Mutex::new(None));

/// Installed Direct3D 12 hooks. Only one set can be live in a process.
pub struct Dx12Hooks(());

impl Dx12Hooks {
    /// Capture the dispatch table and hook the host's command submission,
    /// present and resize calls. The overlay draws whatever `script` builds
    /// in its frame callback.
    ///
    /// # Safety
    ///
    /// Rewrites code of the host process.
    pub unsafe fn install<S>(script: S, config: OverlayConfig) -> Result<Self>
    where
        S: ScriptHost<Ui> + Send + 'static,
    {
        let table = capture_dispatch_table()?;
        let backend = hooks::select_backend(config.hook_backend)?;
        Self::install_with(table, backend, script, config)
    }

    /// Hook the entries of an already captured `table` with `backend`.
    ///
    /// A failure part way through leaves the hooks installed so far in place,
    /// forwarding to the host's functions, and keeps the overlay around.
    /// [`uninstall`] removes both; until then further installs are refused.
    ///
    /// # Safety
    ///
    /// Rewrites code of the host process. The table entries must be the
    /// functions the hook entry points stand in for.
    pub unsafe fn install_with<S>(
        table: DispatchTable,
        backend: Box<dyn HookBackend + Send>,
        script: S,
        config: OverlayConfig,
    ) -> Result<Self>
    where
        S: ScriptHost<Ui> + Send + 'static,
    {
        let mut hooks_slot = HOOKS.lock();
        let drain_delay = config.drain_delay;

        {
            let mut slot = PIPELINE.lock();
            if slot.is_some() || hooks_slot.is_some() {
                return Err(Error::Hook("Direct3D 12 hooks are already installed".into()));
            }

            let render_backend = Dx12Backend::new(wnd_proc_impl, &WND_PROC_ORIGINAL);
            let script: Box<dyn ScriptHost<Ui> + Send> = Box::new(script);
            *slot = Some(PipelineSlot(Pipeline::new(render_backend, script, config)));
        }

        let HookSlot { manager, .. } = hooks_slot
            .insert(HookSlot { manager: HookManager::new(table, backend), drain_delay });

        let hooks: [(usize, *mut c_void, &AtomicPtr<c_void>); 3] = [
            (
                EXECUTE_COMMAND_LISTS,
                execute_command_lists_impl as *mut c_void,
                &EXECUTE_COMMAND_LISTS_ORIGINAL,
            ),
            (PRESENT, present_impl as *mut c_void, &PRESENT_ORIGINAL),
            (RESIZE_BUFFERS, resize_buffers_impl as *mut c_void, &RESIZE_BUFFERS_ORIGINAL),
        ];

        for (index, replacement, original) in hooks {
            if let Err(e) = manager.install(index, replacement, original) {
                error!("Direct3D 12 hooks only partially installed: {e}");
                return Err(e);
            }
        }

        info!("Direct3D 12 hooks installed with {}", manager.backend().name());

        Ok(Self(()))
    }

    /// Remove the hooks, wait for in-flight calls to leave them and release
    /// the overlay, restoring the host window's procedure.
    ///
    /// # Safety
    ///
    /// See [`uninstall`].
    pub unsafe fn unhook(self) -> Result<()> {
        uninstall()
    }
}

/// Remove every live Direct3D 12 hook and release the overlay. Does nothing
/// when nothing is installed.
///
/// Hooks that fail to come off stay recorded, so calling this again retries
/// them. The overlay is released either way.
///
/// # Safety
///
/// Rewrites code of the host process.
pub unsafe fn uninstall() -> Result<()> {
    trace!("Disabling hooks...");
    let mut hooks_slot = HOOKS.lock();
    let (removed, drain_delay) = match hooks_slot.as_mut() {
        Some(slot) => (slot.manager.remove_all(), slot.drain_delay),
        None => (Ok(()), Duration::ZERO),
    };
    if hooks_slot.as_ref().is_some_and(|slot| slot.manager.records().is_empty()) {
        hooks_slot.take();
    }
    drop(hooks_slot);

    if let Err(e) = &removed {
        error!("Could not remove every hook: {e}");
    }

    EXECUTE_COMMAND_LISTS_RUNNING.wait();
    PRESENT_RUNNING.wait();
    RESIZE_BUFFERS_RUNNING.wait();

    // The GPU may still be reading the overlay's last frame.
    thread::sleep(drain_delay);

    trace!("Cleaning up overlay...");
    if let Some(PipelineSlot(mut pipeline)) = PIPELINE.lock().take() {
        pipeline.teardown();
    }
    WND_PROC_RUNNING.wait();

    debug!("Direct3D 12 hooks removed");

    removed
}

/// Dispatch table indices currently hooked, in install order.
pub fn installed_hooks() -> Vec<usize> {
    HOOKS
        .lock()
        .as_ref()
        .map(|slot| slot.manager.records().iter().map(|r| r.index).collect())
        .unwrap_or_default()
}

/// Run `f` against the live pipeline, if the hooks are installed.
pub fn with_pipeline<R>(f: impl FnOnce(&mut Dx12Pipeline) -> R) -> Option<R> {
    PIPELINE.lock().as_mut().map(|PipelineSlot(pipeline)| f(pipeline))
}
