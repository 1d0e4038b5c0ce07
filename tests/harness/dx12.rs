use std::ffi::CString;
use std::mem::MaybeUninit;
use std::ptr::null;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use hudscript::util::{create_barrier, drop_barrier};
use tracing::trace;
use windows::core::{s, ComInterface, PCSTR};
use windows::Win32::Foundation::{CloseHandle, BOOL, HWND, LPARAM, LRESULT, RECT, WPARAM};
use windows::Win32::Graphics::Direct3D::D3D_FEATURE_LEVEL_11_0;
use windows::Win32::Graphics::Direct3D12::{
    D3D12CreateDevice, ID3D12CommandAllocator, ID3D12CommandList, ID3D12CommandQueue,
    ID3D12Device, ID3D12Fence, ID3D12GraphicsCommandList, ID3D12Resource,
    D3D12_COMMAND_LIST_TYPE_DIRECT, D3D12_COMMAND_QUEUE_DESC, D3D12_COMMAND_QUEUE_FLAG_NONE,
    D3D12_FENCE_FLAG_NONE, D3D12_RESOURCE_STATE_PRESENT, D3D12_RESOURCE_STATE_RENDER_TARGET,
};
use windows::Win32::Graphics::Dxgi::Common::{
    DXGI_FORMAT_R8G8B8A8_UNORM, DXGI_FORMAT_UNKNOWN, DXGI_MODE_DESC,
    DXGI_MODE_SCALING_UNSPECIFIED, DXGI_MODE_SCANLINE_ORDER_UNSPECIFIED, DXGI_RATIONAL,
    DXGI_SAMPLE_DESC,
};
use windows::Win32::Graphics::Dxgi::{
    CreateDXGIFactory, IDXGIFactory, IDXGISwapChain, IDXGISwapChain3, DXGI_SWAP_CHAIN_DESC,
    DXGI_SWAP_EFFECT_FLIP_DISCARD, DXGI_USAGE_RENDER_TARGET_OUTPUT,
};
use windows::Win32::Graphics::Gdi::HBRUSH;
use windows::Win32::System::LibraryLoader::GetModuleHandleA;
use windows::Win32::System::Threading::{
    CreateEventExW, WaitForSingleObject, CREATE_EVENT, INFINITE,
};
use windows::Win32::UI::WindowsAndMessaging::{
    AdjustWindowRect, CreateWindowExA, DefWindowProcA, DestroyWindow, DispatchMessageA,
    PeekMessageA, PostQuitMessage, RegisterClassA, TranslateMessage, CS_HREDRAW, CS_OWNDC,
    CS_VREDRAW, HCURSOR, HICON, HMENU, PM_REMOVE, WINDOW_EX_STYLE, WM_DESTROY, WM_QUIT,
    WNDCLASSA, WS_OVERLAPPEDWINDOW, WS_VISIBLE,
};

const BUFFER_COUNT: u32 = 2;

/// A window with a flip-model swapchain presenting in a loop on its own
/// thread. Every frame goes through a direct queue like a real game's would.
pub struct Dx12Harness {
    child: Option<JoinHandle<()>>,
    done: Arc<AtomicBool>,
    resize: Arc<AtomicU32>,
    presents: Arc<AtomicUsize>,
    _caption: Arc<CString>,
}

impl Dx12Harness {
    pub fn new(caption: &str) -> Self {
        let done = Arc::new(AtomicBool::new(false));
        let resize = Arc::new(AtomicU32::new(0));
        let presents = Arc::new(AtomicUsize::new(0));
        let caption = Arc::new(CString::new(caption).unwrap());

        let child = Some(thread::spawn({
            let done = Arc::clone(&done);
            let resize = Arc::clone(&resize);
            let presents = Arc::clone(&presents);
            let caption = Arc::clone(&caption);

            move || {
                let hwnd = create_window(&caption);
                let mut renderer = Renderer::new(hwnd);

                loop {
                    let size = resize.swap(0, Ordering::SeqCst);
                    if size != 0 {
                        renderer.resize(size >> 16, size & 0xffff);
                    }

                    trace!("Present");
                    renderer.frame();
                    presents.fetch_add(1, Ordering::SeqCst);

                    if !handle_messages() || done.load(Ordering::SeqCst) {
                        break;
                    }
                }

                drop(renderer);
                unsafe { DestroyWindow(hwnd) };
            }
        }));

        Self { child, done, resize, presents, _caption: caption }
    }

    /// Ask the render thread to resize its swapchain before the next frame.
    pub fn request_resize(&self, width: u32, height: u32) {
        self.resize.store((width << 16) | (height & 0xffff), Ordering::SeqCst);
    }

    pub fn presents(&self) -> usize {
        self.presents.load(Ordering::SeqCst)
    }
}

impl Drop for Dx12Harness {
    fn drop(&mut self) {
        self.done.store(true, Ordering::SeqCst);
        self.child.take().unwrap().join().unwrap();
    }
}

struct Renderer {
    _device: ID3D12Device,
    queue: ID3D12CommandQueue,
    allocator: ID3D12CommandAllocator,
    list: ID3D12GraphicsCommandList,
    swap_chain: IDXGISwapChain3,
    fence: ID3D12Fence,
    fence_value: u64,
}

impl Renderer {
    fn new(hwnd: HWND) -> Self {
        let factory: IDXGIFactory = unsafe { CreateDXGIFactory() }.unwrap();
        let adapter = unsafe { factory.EnumAdapters(0) }.unwrap();

        let mut device: Option<ID3D12Device> = None;
        unsafe { D3D12CreateDevice(&adapter, D3D_FEATURE_LEVEL_11_0, &mut device) }.unwrap();
        let device = device.unwrap();

        let queue: ID3D12CommandQueue = unsafe {
            device.CreateCommandQueue(&D3D12_COMMAND_QUEUE_DESC {
                Type: D3D12_COMMAND_LIST_TYPE_DIRECT,
                Priority: 0,
                Flags: D3D12_COMMAND_QUEUE_FLAG_NONE,
                NodeMask: 0,
            })
        }
        .unwrap();
        let allocator: ID3D12CommandAllocator =
            unsafe { device.CreateCommandAllocator(D3D12_COMMAND_LIST_TYPE_DIRECT) }.unwrap();
        let list: ID3D12GraphicsCommandList = unsafe {
            device.CreateCommandList(0, D3D12_COMMAND_LIST_TYPE_DIRECT, &allocator, None)
        }
        .unwrap();
        unsafe { list.Close() }.unwrap();

        let swap_chain_desc = DXGI_SWAP_CHAIN_DESC {
            BufferDesc: DXGI_MODE_DESC {
                Width: 800,
                Height: 600,
                RefreshRate: DXGI_RATIONAL { Numerator: 60, Denominator: 1 },
                Format: DXGI_FORMAT_R8G8B8A8_UNORM,
                ScanlineOrdering: DXGI_MODE_SCANLINE_ORDER_UNSPECIFIED,
                Scaling: DXGI_MODE_SCALING_UNSPECIFIED,
            },
            SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
            BufferCount: BUFFER_COUNT,
            OutputWindow: hwnd,
            Windowed: BOOL::from(true),
            SwapEffect: DXGI_SWAP_EFFECT_FLIP_DISCARD,
            Flags: 0,
        };

        let mut swap_chain: Option<IDXGISwapChain> = None;
        unsafe { factory.CreateSwapChain(&queue, &swap_chain_desc, &mut swap_chain) }.unwrap();
        let swap_chain: IDXGISwapChain3 = swap_chain.unwrap().cast().unwrap();

        let fence: ID3D12Fence = unsafe { device.CreateFence(0, D3D12_FENCE_FLAG_NONE) }.unwrap();

        Self { _device: device, queue, allocator, list, swap_chain, fence, fence_value: 0 }
    }

    fn frame(&mut self) {
        let index = unsafe { self.swap_chain.GetCurrentBackBufferIndex() };
        let back_buffer: ID3D12Resource = unsafe { self.swap_chain.GetBuffer(index) }.unwrap();

        unsafe {
            self.allocator.Reset().unwrap();
            self.list.Reset(&self.allocator, None).unwrap();

            let barriers = [create_barrier(
                &back_buffer,
                D3D12_RESOURCE_STATE_PRESENT,
                D3D12_RESOURCE_STATE_RENDER_TARGET,
            )];
            self.list.ResourceBarrier(&barriers);
            barriers.into_iter().for_each(drop_barrier);

            let barriers = [create_barrier(
                &back_buffer,
                D3D12_RESOURCE_STATE_RENDER_TARGET,
                D3D12_RESOURCE_STATE_PRESENT,
            )];
            self.list.ResourceBarrier(&barriers);
            barriers.into_iter().for_each(drop_barrier);

            self.list.Close().unwrap();
            self.queue.ExecuteCommandLists(&[Some(self.list.cast::<ID3D12CommandList>().unwrap())]);
            self.swap_chain.Present(1, 0).ok().unwrap();
        }

        drop(back_buffer);
        self.wait_idle();
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.wait_idle();
        unsafe {
            self.swap_chain.ResizeBuffers(BUFFER_COUNT, width, height, DXGI_FORMAT_UNKNOWN, 0)
        }
        .unwrap();
    }

    fn wait_idle(&mut self) {
        self.fence_value += 1;
        unsafe {
            self.queue.Signal(&self.fence, self.fence_value).unwrap();
            if self.fence.GetCompletedValue() < self.fence_value {
                let event = CreateEventExW(None, None, CREATE_EVENT(0), 0x1F0003).unwrap();
                self.fence.SetEventOnCompletion(self.fence_value, event).unwrap();
                WaitForSingleObject(event, INFINITE);
                let _ = CloseHandle(event);
            }
        }
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.wait_idle();
    }
}

fn create_window(caption: &CString) -> HWND {
    let hinstance = unsafe { GetModuleHandleA(PCSTR(null())).unwrap() };
    let wnd_class = WNDCLASSA {
        style: CS_OWNDC | CS_HREDRAW | CS_VREDRAW,
        lpfnWndProc: Some(window_proc),
        hInstance: hinstance.into(),
        lpszClassName: s!("HudscriptHarness"),
        cbClsExtra: 0,
        cbWndExtra: 0,
        hIcon: HICON::default(),
        hCursor: HCURSOR::default(),
        hbrBackground: HBRUSH::default(),
        lpszMenuName: PCSTR(null()),
    };
    unsafe { RegisterClassA(&wnd_class) };

    let mut rect = RECT { left: 0, top: 0, right: 800, bottom: 600 };
    unsafe { AdjustWindowRect(&mut rect, WS_OVERLAPPEDWINDOW | WS_VISIBLE, BOOL::from(false)) };

    unsafe {
        CreateWindowExA(
            WINDOW_EX_STYLE::default(),
            s!("HudscriptHarness"),
            PCSTR(caption.as_ptr().cast()),
            WS_OVERLAPPEDWINDOW | WS_VISIBLE,
            100,
            100,
            rect.right - rect.left,
            rect.bottom - rect.top,
            HWND::default(),
            HMENU::default(),
            hinstance,
            None,
        )
    }
}

fn handle_messages() -> bool {
    unsafe {
        let mut msg = MaybeUninit::uninit();
        while PeekMessageA(msg.as_mut_ptr(), HWND::default(), 0, 0, PM_REMOVE).as_bool() {
            let msg = msg.assume_init_ref();
            if msg.message == WM_QUIT {
                return false;
            }
            TranslateMessage(msg);
            DispatchMessageA(msg);
        }
    }
    true
}

unsafe extern "system" fn window_proc(
    hwnd: HWND,
    msg: u32,
    w_param: WPARAM,
    l_param: LPARAM,
) -> LRESULT {
    match msg {
        WM_DESTROY => {
            PostQuitMessage(0);
            LRESULT(0)
        },
        _ => DefWindowProcA(hwnd, msg, w_param, l_param),
    }
}
