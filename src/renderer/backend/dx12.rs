//! Direct3D 12 backend: command objects around the host's swapchain and a
//! dear imgui renderer recording into the overlay's command list.

// NOTE: see this for ManuallyDrop instances https://github.com/microsoft/windows-rs/issues/2386

use std::ffi::c_void;
use std::mem::{self, ManuallyDrop};
use std::sync::atomic::{AtomicPtr, Ordering};
use std::time::Instant;
use std::{fs, ptr, slice};

use imgui::internal::RawWrapper;
use imgui::{
    BackendFlags, Context, DrawCmd, DrawData, DrawIdx, DrawVert, FontConfig, FontGlyphRanges,
    FontSource, Key, TextureId, Ui,
};
use memoffset::offset_of;
use tracing::{debug, error, warn};
use windows::core::{s, w, ComInterface, PCSTR};
use windows::Win32::Foundation::{CloseHandle, HANDLE, HWND, LPARAM, LRESULT, RECT, WPARAM};
use windows::Win32::Graphics::Direct3D::Fxc::*;
use windows::Win32::Graphics::Direct3D::*;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;
use windows::Win32::Graphics::Dxgi::{IDXGISwapChain3, DXGI_SWAP_CHAIN_DESC};
use windows::Win32::System::Threading::{
    CreateEventExW, WaitForSingleObjectEx, CREATE_EVENT, INFINITE,
};
use windows::Win32::UI::Input::KeyboardAndMouse::*;
#[cfg(target_arch = "x86")]
use windows::Win32::UI::WindowsAndMessaging::SetWindowLongA;
#[cfg(any(target_arch = "aarch64", target_arch = "x86_64"))]
use windows::Win32::UI::WindowsAndMessaging::SetWindowLongPtrA;
use windows::Win32::UI::WindowsAndMessaging::GWLP_WNDPROC;

use crate::config::OverlayConfig;
use crate::renderer::input::{self, InputEvent};
use crate::renderer::texture::{self, FONT_SLOT};
use crate::renderer::{
    HeapKind, Overlay, RenderBackend, ResourceState, SwapChainInfo, WindowHandle,
};
use crate::util::{self, try_out_param, try_out_ptr};
use crate::{Error, Result};

pub type WndProcType =
    unsafe extern "system" fn(hwnd: HWND, umsg: u32, wparam: WPARAM, lparam: LPARAM) -> LRESULT;

/// [`RenderBackend`] for Direct3D 12 hosts.
///
/// `window_proc` is the procedure installed over the host window's own. The
/// procedure it replaces is also published into `original_window_proc`, so
/// that `window_proc` can forward messages without locking anything.
#[derive(Clone, Copy)]
pub struct Dx12Backend {
    window_proc: WndProcType,
    original_window_proc: &'static AtomicPtr<c_void>,
}

impl Dx12Backend {
    pub fn new(window_proc: WndProcType, original_window_proc: &'static AtomicPtr<c_void>) -> Self {
        Self { window_proc, original_window_proc }
    }
}

fn d3d12_state(state: ResourceState) -> D3D12_RESOURCE_STATES {
    match state {
        ResourceState::Present => D3D12_RESOURCE_STATE_PRESENT,
        ResourceState::RenderTarget => D3D12_RESOURCE_STATE_RENDER_TARGET,
    }
}

unsafe fn set_window_proc(hwnd: HWND, proc: isize) -> isize {
    #[cfg(any(target_arch = "aarch64", target_arch = "x86_64"))]
    let previous = SetWindowLongPtrA(hwnd, GWLP_WNDPROC, proc);

    #[cfg(target_arch = "x86")]
    let previous = SetWindowLongA(hwnd, GWLP_WNDPROC, proc as i32) as isize;

    previous
}

impl RenderBackend for Dx12Backend {
    type SwapChain = IDXGISwapChain3;
    type Queue = ID3D12CommandQueue;
    type Device = ID3D12Device;
    type Resource = ID3D12Resource;
    type Allocator = ID3D12CommandAllocator;
    type CommandList = ID3D12GraphicsCommandList;
    type DescriptorHeap = ID3D12DescriptorHeap;
    type RtvHandle = D3D12_CPU_DESCRIPTOR_HANDLE;
    type WindowProc = WndProcType;
    type Overlay = ImguiOverlay;

    fn queue_is_direct(&self, queue: &ID3D12CommandQueue) -> bool {
        unsafe { queue.GetDesc() }.Type == D3D12_COMMAND_LIST_TYPE_DIRECT
    }

    fn swap_chain_device(&self, swap_chain: &IDXGISwapChain3) -> Result<ID3D12Device> {
        Ok(unsafe { swap_chain.GetDevice::<ID3D12Device>() }?)
    }

    fn swap_chain_info(&self, swap_chain: &IDXGISwapChain3) -> Result<SwapChainInfo> {
        let desc: DXGI_SWAP_CHAIN_DESC = try_out_param(|v| unsafe { swap_chain.GetDesc(v) })?;

        Ok(SwapChainInfo {
            buffer_count: desc.BufferCount,
            window: WindowHandle(desc.OutputWindow.0),
            format: desc.BufferDesc.Format.0 as u32,
        })
    }

    fn current_back_buffer_index(&self, swap_chain: &IDXGISwapChain3) -> usize {
        unsafe { swap_chain.GetCurrentBackBufferIndex() as usize }
    }

    fn back_buffer(&self, swap_chain: &IDXGISwapChain3, index: usize) -> Result<ID3D12Resource> {
        Ok(unsafe { swap_chain.GetBuffer::<ID3D12Resource>(index as u32) }?)
    }

    fn create_descriptor_heap(
        &self,
        device: &ID3D12Device,
        kind: HeapKind,
        count: u32,
    ) -> Result<ID3D12DescriptorHeap> {
        let (heap_type, flags) = match kind {
            HeapKind::RenderTarget => {
                (D3D12_DESCRIPTOR_HEAP_TYPE_RTV, D3D12_DESCRIPTOR_HEAP_FLAG_NONE)
            },
            HeapKind::ShaderResource => {
                (D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV, D3D12_DESCRIPTOR_HEAP_FLAG_SHADER_VISIBLE)
            },
        };

        let heap: ID3D12DescriptorHeap = unsafe {
            device.CreateDescriptorHeap(&D3D12_DESCRIPTOR_HEAP_DESC {
                Type: heap_type,
                NumDescriptors: count,
                Flags: flags,
                NodeMask: 0,
            })
        }?;

        Ok(heap)
    }

    fn rtv_handle(
        &self,
        device: &ID3D12Device,
        heap: &ID3D12DescriptorHeap,
        index: usize,
    ) -> D3D12_CPU_DESCRIPTOR_HANDLE {
        unsafe {
            let increment = device.GetDescriptorHandleIncrementSize(D3D12_DESCRIPTOR_HEAP_TYPE_RTV);
            let start = heap.GetCPUDescriptorHandleForHeapStart();
            D3D12_CPU_DESCRIPTOR_HANDLE { ptr: start.ptr + index * increment as usize }
        }
    }

    fn create_render_target_view(
        &self,
        device: &ID3D12Device,
        resource: &ID3D12Resource,
        handle: D3D12_CPU_DESCRIPTOR_HANDLE,
    ) {
        unsafe { device.CreateRenderTargetView(resource, None, handle) };
    }

    fn create_command_allocator(&self, device: &ID3D12Device) -> Result<ID3D12CommandAllocator> {
        let allocator: ID3D12CommandAllocator =
            unsafe { device.CreateCommandAllocator(D3D12_COMMAND_LIST_TYPE_DIRECT) }?;
        unsafe { allocator.SetName(w!("hudscript Frame Command Allocator")) }?;
        Ok(allocator)
    }

    fn create_command_list(
        &self,
        device: &ID3D12Device,
        allocator: &ID3D12CommandAllocator,
    ) -> Result<ID3D12GraphicsCommandList> {
        let list: ID3D12GraphicsCommandList = unsafe {
            device.CreateCommandList(0, D3D12_COMMAND_LIST_TYPE_DIRECT, allocator, None)
        }?;

        unsafe {
            list.Close()?;
            list.SetName(w!("hudscript Overlay Command List"))?;
        }

        Ok(list)
    }

    fn reset_allocator(&self, allocator: &ID3D12CommandAllocator) -> Result<()> {
        Ok(unsafe { allocator.Reset() }?)
    }

    fn reset_command_list(
        &self,
        list: &ID3D12GraphicsCommandList,
        allocator: &ID3D12CommandAllocator,
    ) -> Result<()> {
        Ok(unsafe { list.Reset(allocator, None) }?)
    }

    fn transition(
        &self,
        list: &ID3D12GraphicsCommandList,
        resource: &ID3D12Resource,
        from: ResourceState,
        to: ResourceState,
    ) {
        let barriers = [util::create_barrier(resource, d3d12_state(from), d3d12_state(to))];
        unsafe { list.ResourceBarrier(&barriers) };
        barriers.into_iter().for_each(util::drop_barrier);
    }

    fn bind_render_target(
        &self,
        list: &ID3D12GraphicsCommandList,
        rtv: D3D12_CPU_DESCRIPTOR_HANDLE,
        srv_heap: &ID3D12DescriptorHeap,
    ) {
        unsafe {
            list.OMSetRenderTargets(1, Some(&rtv), false, None);
            list.SetDescriptorHeaps(&[Some(srv_heap.clone())]);
        }
    }

    fn close_command_list(&self, list: &ID3D12GraphicsCommandList) -> Result<()> {
        Ok(unsafe { list.Close() }?)
    }

    fn execute(&self, queue: &ID3D12CommandQueue, list: &ID3D12GraphicsCommandList) {
        match list.cast::<ID3D12CommandList>() {
            Ok(list) => unsafe { queue.ExecuteCommandLists(&[Some(list)]) },
            Err(e) => error!("Could not submit overlay command list: {e}"),
        }
    }

    fn upload_texture(
        &self,
        device: &ID3D12Device,
        padded: &[u8],
        width: u32,
        height: u32,
        pitch: u32,
    ) -> Result<ID3D12Resource> {
        unsafe { upload_texture(device, padded, width, height, pitch) }
    }

    fn create_texture_view(
        &self,
        device: &ID3D12Device,
        heap: &ID3D12DescriptorHeap,
        slot: u32,
        resource: &ID3D12Resource,
    ) -> TextureId {
        unsafe {
            let increment =
                device.GetDescriptorHandleIncrementSize(D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV);
            let offset = slot * increment;

            let cpu_desc = D3D12_CPU_DESCRIPTOR_HANDLE {
                ptr: heap.GetCPUDescriptorHandleForHeapStart().ptr + offset as usize,
            };
            let gpu_desc = D3D12_GPU_DESCRIPTOR_HANDLE {
                ptr: heap.GetGPUDescriptorHandleForHeapStart().ptr + offset as u64,
            };

            device.CreateShaderResourceView(
                resource,
                Some(&D3D12_SHADER_RESOURCE_VIEW_DESC {
                    Format: DXGI_FORMAT_R8G8B8A8_UNORM,
                    ViewDimension: D3D12_SRV_DIMENSION_TEXTURE2D,
                    Shader4ComponentMapping: D3D12_DEFAULT_SHADER_4_COMPONENT_MAPPING,
                    Anonymous: D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                        Texture2D: D3D12_TEX2D_SRV {
                            MostDetailedMip: 0,
                            MipLevels: 1,
                            PlaneSlice: Default::default(),
                            ResourceMinLODClamp: Default::default(),
                        },
                    },
                }),
                cpu_desc,
            );

            TextureId::from(gpu_desc.ptr as usize)
        }
    }

    fn install_window_proc(&self, window: WindowHandle) -> Result<WndProcType> {
        let previous = unsafe { set_window_proc(HWND(window.0), self.window_proc as usize as isize) };
        if previous == 0 {
            return Err(windows::core::Error::from_win32().into());
        }
        self.original_window_proc.store(previous as *mut c_void, Ordering::SeqCst);

        Ok(unsafe { mem::transmute::<isize, WndProcType>(previous) })
    }

    fn restore_window_proc(&self, window: WindowHandle, original: WndProcType) {
        unsafe { set_window_proc(HWND(window.0), original as usize as isize) };
    }

    fn create_overlay(
        &self,
        device: &ID3D12Device,
        info: &SwapChainInfo,
        srv_heap: &ID3D12DescriptorHeap,
        config: &OverlayConfig,
    ) -> Result<ImguiOverlay> {
        ImguiOverlay::new(self, device, info, srv_heap, config)
    }
}

/// Create a default-heap RGBA8 texture and fill it from `padded` through a
/// private queue, blocking until the GPU is done.
unsafe fn upload_texture(
    device: &ID3D12Device,
    padded: &[u8],
    width: u32,
    height: u32,
    pitch: u32,
) -> Result<ID3D12Resource> {
    let upload_size = pitch as usize * height as usize;
    if padded.len() < upload_size {
        return Err(Error::unknown(format!(
            "texture data is {} bytes, {width}x{height} at pitch {pitch} needs {upload_size}",
            padded.len()
        )));
    }

    let texture: ID3D12Resource = try_out_ptr(|v| {
        device.CreateCommittedResource(
            &D3D12_HEAP_PROPERTIES {
                Type: D3D12_HEAP_TYPE_DEFAULT,
                CPUPageProperty: D3D12_CPU_PAGE_PROPERTY_UNKNOWN,
                MemoryPoolPreference: D3D12_MEMORY_POOL_UNKNOWN,
                CreationNodeMask: Default::default(),
                VisibleNodeMask: Default::default(),
            },
            D3D12_HEAP_FLAG_NONE,
            &D3D12_RESOURCE_DESC {
                Dimension: D3D12_RESOURCE_DIMENSION_TEXTURE2D,
                Alignment: 0,
                Width: width as _,
                Height: height as _,
                DepthOrArraySize: 1,
                MipLevels: 1,
                Format: DXGI_FORMAT_R8G8B8A8_UNORM,
                SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
                Layout: D3D12_TEXTURE_LAYOUT_UNKNOWN,
                Flags: D3D12_RESOURCE_FLAG_NONE,
            },
            D3D12_RESOURCE_STATE_COPY_DEST,
            None,
            v,
        )
    })?;

    let upload_buffer: ID3D12Resource = try_out_ptr(|v| {
        device.CreateCommittedResource(
            &D3D12_HEAP_PROPERTIES {
                Type: D3D12_HEAP_TYPE_UPLOAD,
                CPUPageProperty: D3D12_CPU_PAGE_PROPERTY_UNKNOWN,
                MemoryPoolPreference: D3D12_MEMORY_POOL_UNKNOWN,
                CreationNodeMask: Default::default(),
                VisibleNodeMask: Default::default(),
            },
            D3D12_HEAP_FLAG_NONE,
            &D3D12_RESOURCE_DESC {
                Dimension: D3D12_RESOURCE_DIMENSION_BUFFER,
                Alignment: 0,
                Width: upload_size as _,
                Height: 1,
                DepthOrArraySize: 1,
                MipLevels: 1,
                Format: DXGI_FORMAT_UNKNOWN,
                SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
                Layout: D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
                Flags: D3D12_RESOURCE_FLAG_NONE,
            },
            D3D12_RESOURCE_STATE_GENERIC_READ,
            None,
            v,
        )
    })?;

    let mut upload_ptr = ptr::null_mut();
    upload_buffer.Map(0, None, Some(&mut upload_ptr))?;
    ptr::copy_nonoverlapping(padded.as_ptr(), upload_ptr as *mut u8, upload_size);
    upload_buffer.Unmap(0, None);

    let command_queue: ID3D12CommandQueue =
        device.CreateCommandQueue(&D3D12_COMMAND_QUEUE_DESC {
            Type: D3D12_COMMAND_LIST_TYPE_DIRECT,
            Priority: 0,
            Flags: D3D12_COMMAND_QUEUE_FLAG_NONE,
            NodeMask: 0,
        })?;
    let command_allocator: ID3D12CommandAllocator =
        device.CreateCommandAllocator(D3D12_COMMAND_LIST_TYPE_DIRECT)?;
    let command_list: ID3D12GraphicsCommandList =
        device.CreateCommandList(0, D3D12_COMMAND_LIST_TYPE_DIRECT, &command_allocator, None)?;
    command_list.SetName(w!("hudscript Texture Upload Command List"))?;

    let dst_location = D3D12_TEXTURE_COPY_LOCATION {
        pResource: ManuallyDrop::new(Some(texture.clone())),
        Type: D3D12_TEXTURE_COPY_TYPE_SUBRESOURCE_INDEX,
        Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 { SubresourceIndex: 0 },
    };

    let src_location = D3D12_TEXTURE_COPY_LOCATION {
        pResource: ManuallyDrop::new(Some(upload_buffer.clone())),
        Type: D3D12_TEXTURE_COPY_TYPE_PLACED_FOOTPRINT,
        Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
            PlacedFootprint: D3D12_PLACED_SUBRESOURCE_FOOTPRINT {
                Offset: 0,
                Footprint: D3D12_SUBRESOURCE_FOOTPRINT {
                    Format: DXGI_FORMAT_R8G8B8A8_UNORM,
                    Width: width,
                    Height: height,
                    Depth: 1,
                    RowPitch: pitch,
                },
            },
        },
    };

    command_list.CopyTextureRegion(&dst_location, 0, 0, 0, &src_location, None);
    let barriers = [util::create_barrier(
        &texture,
        D3D12_RESOURCE_STATE_COPY_DEST,
        D3D12_RESOURCE_STATE_PIXEL_SHADER_RESOURCE,
    )];
    command_list.ResourceBarrier(&barriers);
    barriers.into_iter().for_each(util::drop_barrier);
    let _ = ManuallyDrop::into_inner(dst_location.pResource);
    let _ = ManuallyDrop::into_inner(src_location.pResource);

    command_list.Close()?;
    command_queue.ExecuteCommandLists(&[Some(command_list.cast()?)]);

    let mut fence = Fence::new(device)?;
    fence.signal_and_wait(&command_queue)?;

    Ok(texture)
}

/// CPU-side wait on GPU progress.
struct Fence {
    fence: ID3D12Fence,
    value: u64,
    event: HANDLE,
}

impl Fence {
    fn new(device: &ID3D12Device) -> Result<Self> {
        let fence = unsafe { device.CreateFence(0, D3D12_FENCE_FLAG_NONE) }?;
        let event = unsafe { CreateEventExW(None, None, CREATE_EVENT(0), 0x1F0003) }?;
        Ok(Self { fence, value: 0, event })
    }

    fn signal_and_wait(&mut self, queue: &ID3D12CommandQueue) -> Result<()> {
        self.value += 1;
        unsafe {
            queue.Signal(&self.fence, self.value)?;
            if self.fence.GetCompletedValue() < self.value {
                self.fence.SetEventOnCompletion(self.value, self.event)?;
                WaitForSingleObjectEx(self.event, INFINITE, false);
            }
        }
        Ok(())
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        let _ = unsafe { CloseHandle(self.event) };
    }
}

/// The dear imgui context of one overlay incarnation plus the engine that
/// turns its draw data into D3D12 commands.
pub struct ImguiOverlay {
    ctx: Context,
    engine: RenderEngine,
    window: HWND,
    last_frame: Instant,
    frame_open: bool,
    #[allow(unused)]
    font_texture: ID3D12Resource,
}

impl ImguiOverlay {
    fn new(
        backend: &Dx12Backend,
        device: &ID3D12Device,
        info: &SwapChainInfo,
        srv_heap: &ID3D12DescriptorHeap,
        config: &OverlayConfig,
    ) -> Result<Self> {
        let mut ctx = Context::create();
        ctx.set_ini_filename(None);
        ctx.io_mut().backend_flags |= BackendFlags::RENDERER_HAS_VTX_OFFSET;
        ctx.set_renderer_name(String::from(concat!("hudscript-dx12@", env!("CARGO_PKG_VERSION"))));
        setup_io(ctx.io_mut());
        add_fonts(&mut ctx, config);

        let format = match DXGI_FORMAT(info.format as _) {
            DXGI_FORMAT_UNKNOWN => DXGI_FORMAT_R8G8B8A8_UNORM,
            format => format,
        };
        let engine = RenderEngine::new(device, format, info.buffer_count as usize)?;

        let fonts = ctx.fonts();
        let atlas = fonts.build_rgba32_texture();
        let (width, height) = (atlas.width, atlas.height);
        let pitch = texture::upload_pitch(width);
        let padded = texture::pack_rows(atlas.data, width, height, pitch);
        let font_texture = backend.upload_texture(device, &padded, width, height, pitch)?;
        fonts.tex_id = backend.create_texture_view(device, srv_heap, FONT_SLOT, &font_texture);
        debug!("Font atlas {width}x{height} uploaded");

        Ok(Self {
            ctx,
            engine,
            window: HWND(info.window.0),
            last_frame: Instant::now(),
            frame_open: false,
            font_texture,
        })
    }
}

fn setup_io(io: &mut imgui::Io) {
    io.nav_active = true;
    io.nav_visible = true;

    io[Key::Tab] = VK_TAB.0 as _;
    io[Key::LeftArrow] = VK_LEFT.0 as _;
    io[Key::RightArrow] = VK_RIGHT.0 as _;
    io[Key::UpArrow] = VK_UP.0 as _;
    io[Key::DownArrow] = VK_DOWN.0 as _;
    io[Key::PageUp] = VK_PRIOR.0 as _;
    io[Key::PageDown] = VK_NEXT.0 as _;
    io[Key::Home] = VK_HOME.0 as _;
    io[Key::End] = VK_END.0 as _;
    io[Key::Insert] = VK_INSERT.0 as _;
    io[Key::Delete] = VK_DELETE.0 as _;
    io[Key::Backspace] = VK_BACK.0 as _;
    io[Key::Space] = VK_SPACE.0 as _;
    io[Key::Enter] = VK_RETURN.0 as _;
    io[Key::Escape] = VK_ESCAPE.0 as _;
    io[Key::A] = VK_A.0 as _;
    io[Key::C] = VK_C.0 as _;
    io[Key::V] = VK_V.0 as _;
    io[Key::X] = VK_X.0 as _;
    io[Key::Y] = VK_Y.0 as _;
    io[Key::Z] = VK_Z.0 as _;
}

/// Add the configured font with the full CJK glyph range, or dear imgui's
/// default font if the file can't be read.
fn add_fonts(ctx: &mut Context, config: &OverlayConfig) {
    let fonts = ctx.fonts();

    match fs::read(&config.font_path) {
        Ok(data) => {
            fonts.add_font(&[FontSource::TtfData {
                data: &data,
                size_pixels: config.font_size,
                config: Some(FontConfig {
                    glyph_ranges: FontGlyphRanges::chinese_full(),
                    ..FontConfig::default()
                }),
            }]);
            debug!("Loaded font {:?}", config.font_path);
        },
        Err(e) => {
            warn!("Could not read font {:?} ({e}), using the default font", config.font_path);
            fonts.add_font(&[FontSource::DefaultFontData {
                config: Some(FontConfig { size_pixels: config.font_size, ..FontConfig::default() }),
            }]);
        },
    }
}

impl Overlay for ImguiOverlay {
    type Ui = Ui;
    type CommandList = ID3D12GraphicsCommandList;

    fn new_frame(&mut self, build: &mut dyn FnMut(&mut Ui)) {
        if self.frame_open {
            // A frame that was built but never rendered.
            self.ctx.render();
        }

        let now = Instant::now();
        let io = self.ctx.io_mut();
        io.update_delta_time(now - self.last_frame);
        self.last_frame = now;

        let (width, height) = util::win_size(self.window);
        io.display_size = [width as f32, height as f32];

        let ui = self.ctx.new_frame();
        build(ui);
        self.frame_open = true;
    }

    fn render(&mut self, list: &ID3D12GraphicsCommandList, frame_index: usize) -> Result<()> {
        if !mem::take(&mut self.frame_open) {
            return Ok(());
        }

        let draw_data = self.ctx.render();
        if draw_data.display_size[0] <= 0. || draw_data.display_size[1] <= 0. {
            return Ok(());
        }

        unsafe { self.engine.render_draw_data(draw_data, list, frame_index) }
    }

    fn handle_input(&mut self, event: &InputEvent) {
        input::apply_to_io(self.ctx.io_mut(), event);
    }

    fn want_capture_mouse(&self) -> bool {
        self.ctx.io().want_capture_mouse
    }

    fn want_capture_keyboard(&self) -> bool {
        self.ctx.io().want_capture_keyboard
    }
}

struct FrameBuffers {
    vertices: Buffer<DrawVert>,
    indices: Buffer<DrawIdx>,
}

struct RenderEngine {
    device: ID3D12Device,
    root_signature: ID3D12RootSignature,
    pipeline_state: ID3D12PipelineState,
    // One pair per back buffer, the GPU may still be reading the others.
    buffers: Vec<FrameBuffers>,
    projection_buffer: [[f32; 4]; 4],
}

impl RenderEngine {
    fn new(device: &ID3D12Device, format: DXGI_FORMAT, buffer_count: usize) -> Result<Self> {
        let (root_signature, pipeline_state) = unsafe { create_shader_program(device, format) }?;

        let buffers = (0..buffer_count.max(1))
            .map(|_| {
                Ok(FrameBuffers {
                    vertices: Buffer::new(device, 5000)?,
                    indices: Buffer::new(device, 10000)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            device: device.clone(),
            root_signature,
            pipeline_state,
            buffers,
            projection_buffer: Default::default(),
        })
    }

    unsafe fn render_draw_data(
        &mut self,
        draw_data: &DrawData,
        list: &ID3D12GraphicsCommandList,
        frame_index: usize,
    ) -> Result<()> {
        if draw_data.total_vtx_count == 0 {
            return Ok(());
        }

        let slot = frame_index % self.buffers.len();
        {
            let FrameBuffers { vertices, indices } = &mut self.buffers[slot];
            vertices.clear();
            indices.clear();

            for draw_list in draw_data.draw_lists() {
                vertices.extend(draw_list.vtx_buffer().iter().copied());
                indices.extend(draw_list.idx_buffer().iter().copied());
            }

            vertices.upload(&self.device)?;
            indices.upload(&self.device)?;
        }

        self.projection_buffer = {
            let [l, t, r, b] = [
                draw_data.display_pos[0],
                draw_data.display_pos[1],
                draw_data.display_pos[0] + draw_data.display_size[0],
                draw_data.display_pos[1] + draw_data.display_size[1],
            ];

            [[2. / (r - l), 0., 0., 0.], [0., 2. / (t - b), 0., 0.], [0., 0., 0.5, 0.], [
                (r + l) / (l - r),
                (t + b) / (b - t),
                0.5,
                1.0,
            ]]
        };

        self.setup_render_state(draw_data, list, slot);

        let mut vtx_offset = 0usize;
        let mut idx_offset = 0usize;

        for cl in draw_data.draw_lists() {
            for cmd in cl.commands() {
                match cmd {
                    DrawCmd::Elements { count, cmd_params } => {
                        let [cx, cy, cw, ch] = cmd_params.clip_rect;
                        let [x, y] = draw_data.display_pos;
                        let r = RECT {
                            left: (cx - x) as i32,
                            top: (cy - y) as i32,
                            right: (cw - x) as i32,
                            bottom: (ch - y) as i32,
                        };

                        if r.right > r.left && r.bottom > r.top {
                            // Texture ids are GPU descriptor handles.
                            let tex_handle = D3D12_GPU_DESCRIPTOR_HANDLE {
                                ptr: cmd_params.texture_id.id() as u64,
                            };
                            list.SetGraphicsRootDescriptorTable(1, tex_handle);
                            list.RSSetScissorRects(&[r]);
                            list.DrawIndexedInstanced(
                                count as _,
                                1,
                                (cmd_params.idx_offset + idx_offset) as _,
                                (cmd_params.vtx_offset + vtx_offset) as _,
                                0,
                            );
                        }
                    },
                    DrawCmd::ResetRenderState => self.setup_render_state(draw_data, list, slot),
                    DrawCmd::RawCallback { callback, raw_cmd } => callback(cl.raw(), raw_cmd),
                }
            }
            idx_offset += cl.idx_buffer().len();
            vtx_offset += cl.vtx_buffer().len();
        }

        Ok(())
    }

    unsafe fn setup_render_state(
        &self,
        draw_data: &DrawData,
        list: &ID3D12GraphicsCommandList,
        slot: usize,
    ) {
        let FrameBuffers { vertices, indices } = &self.buffers[slot];

        list.RSSetViewports(&[D3D12_VIEWPORT {
            TopLeftX: 0f32,
            TopLeftY: 0f32,
            Width: draw_data.display_size[0],
            Height: draw_data.display_size[1],
            MinDepth: 0f32,
            MaxDepth: 1f32,
        }]);

        list.IASetVertexBuffers(
            0,
            Some(&[D3D12_VERTEX_BUFFER_VIEW {
                BufferLocation: vertices.resource.GetGPUVirtualAddress(),
                SizeInBytes: (vertices.data.len() * mem::size_of::<DrawVert>()) as _,
                StrideInBytes: mem::size_of::<DrawVert>() as _,
            }]),
        );

        list.IASetIndexBuffer(Some(&D3D12_INDEX_BUFFER_VIEW {
            BufferLocation: indices.resource.GetGPUVirtualAddress(),
            SizeInBytes: (indices.data.len() * mem::size_of::<DrawIdx>()) as _,
            Format: if mem::size_of::<DrawIdx>() == 2 {
                DXGI_FORMAT_R16_UINT
            } else {
                DXGI_FORMAT_R32_UINT
            },
        }));
        list.IASetPrimitiveTopology(D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST);
        list.SetPipelineState(&self.pipeline_state);
        list.SetGraphicsRootSignature(&self.root_signature);
        list.SetGraphicsRoot32BitConstants(
            0,
            16,
            self.projection_buffer.as_ptr() as *const c_void,
            0,
        );
        list.OMSetBlendFactor(Some(&[0f32; 4]));
    }
}

fn blob_bytes(blob: &ID3DBlob) -> &[u8] {
    unsafe { slice::from_raw_parts(blob.GetBufferPointer() as *const u8, blob.GetBufferSize()) }
}

fn log_error_blob(what: &str, e: &windows::core::Error, err_blob: Option<&ID3DBlob>) {
    let message = err_blob.map(|b| String::from_utf8_lossy(blob_bytes(b)).into_owned());
    error!("{what}: {e}: {}", message.unwrap_or_default());
}

unsafe fn compile_shader(source: &str, target: PCSTR, what: &str) -> Result<ID3DBlob> {
    let mut blob: Option<ID3DBlob> = None;
    let mut err_blob: Option<ID3DBlob> = None;

    if let Err(e) = D3DCompile(
        source.as_ptr() as _,
        source.len(),
        None,
        None,
        None::<&ID3DInclude>,
        s!("main"),
        target,
        0,
        0,
        &mut blob,
        Some(&mut err_blob),
    ) {
        log_error_blob(what, &e, err_blob.as_ref());
        return Err(e.into());
    }

    blob.ok_or_else(|| Error::unknown(format!("{what}: compiler returned no bytecode")))
}

unsafe fn create_shader_program(
    device: &ID3D12Device,
    format: DXGI_FORMAT,
) -> Result<(ID3D12RootSignature, ID3D12PipelineState)> {
    let parameters = [
        D3D12_ROOT_PARAMETER {
            ParameterType: D3D12_ROOT_PARAMETER_TYPE_32BIT_CONSTANTS,
            Anonymous: D3D12_ROOT_PARAMETER_0 {
                Constants: D3D12_ROOT_CONSTANTS {
                    ShaderRegister: 0,
                    RegisterSpace: 0,
                    Num32BitValues: 16,
                },
            },
            ShaderVisibility: D3D12_SHADER_VISIBILITY_VERTEX,
        },
        D3D12_ROOT_PARAMETER {
            ParameterType: D3D12_ROOT_PARAMETER_TYPE_DESCRIPTOR_TABLE,
            Anonymous: D3D12_ROOT_PARAMETER_0 {
                DescriptorTable: D3D12_ROOT_DESCRIPTOR_TABLE {
                    NumDescriptorRanges: 1,
                    pDescriptorRanges: &D3D12_DESCRIPTOR_RANGE {
                        RangeType: D3D12_DESCRIPTOR_RANGE_TYPE_SRV,
                        NumDescriptors: 1,
                        BaseShaderRegister: 0,
                        RegisterSpace: 0,
                        OffsetInDescriptorsFromTableStart: 0,
                    },
                },
            },
            ShaderVisibility: D3D12_SHADER_VISIBILITY_PIXEL,
        },
    ];

    let root_signature_desc = D3D12_ROOT_SIGNATURE_DESC {
        NumParameters: 2,
        pParameters: parameters.as_ptr(),
        NumStaticSamplers: 1,
        pStaticSamplers: &D3D12_STATIC_SAMPLER_DESC {
            Filter: D3D12_FILTER_MIN_MAG_MIP_LINEAR,
            AddressU: D3D12_TEXTURE_ADDRESS_MODE_WRAP,
            AddressV: D3D12_TEXTURE_ADDRESS_MODE_WRAP,
            AddressW: D3D12_TEXTURE_ADDRESS_MODE_WRAP,
            MipLODBias: 0f32,
            MaxAnisotropy: 0,
            ComparisonFunc: D3D12_COMPARISON_FUNC_ALWAYS,
            BorderColor: D3D12_STATIC_BORDER_COLOR_TRANSPARENT_BLACK,
            MinLOD: 0f32,
            MaxLOD: 0f32,
            ShaderRegister: 0,
            RegisterSpace: 0,
            ShaderVisibility: D3D12_SHADER_VISIBILITY_PIXEL,
        },
        Flags: D3D12_ROOT_SIGNATURE_FLAG_ALLOW_INPUT_ASSEMBLER_INPUT_LAYOUT
            | D3D12_ROOT_SIGNATURE_FLAG_DENY_HULL_SHADER_ROOT_ACCESS
            | D3D12_ROOT_SIGNATURE_FLAG_DENY_DOMAIN_SHADER_ROOT_ACCESS
            | D3D12_ROOT_SIGNATURE_FLAG_DENY_GEOMETRY_SHADER_ROOT_ACCESS,
    };

    let mut blob: Option<ID3DBlob> = None;
    let mut err_blob: Option<ID3DBlob> = None;
    if let Err(e) = D3D12SerializeRootSignature(
        &root_signature_desc,
        D3D_ROOT_SIGNATURE_VERSION_1_0,
        &mut blob,
        Some(&mut err_blob),
    ) {
        log_error_blob("Serializing root signature", &e, err_blob.as_ref());
        return Err(e.into());
    }
    let blob = blob.ok_or_else(|| Error::unknown("root signature serialized to nothing"))?;

    let root_signature: ID3D12RootSignature = device.CreateRootSignature(0, blob_bytes(&blob))?;

    const VS: &str = r#"
    cbuffer vertexBuffer : register(b0) {
      float4x4 ProjectionMatrix;
    };

    struct VS_INPUT {
      float2 pos: POSITION;
      float4 col: COLOR0;
      float2 uv: TEXCOORD0;
    };

    struct PS_INPUT {
      float4 pos: SV_POSITION;
      float4 col: COLOR0;
      float2 uv: TEXCOORD0;
    };

    PS_INPUT main(VS_INPUT input) {
      PS_INPUT output;
      output.pos = mul( ProjectionMatrix, float4(input.pos.xy, 0.f, 1.f));
      output.col = input.col;
      output.uv = input.uv;
      return output;
    }"#;

    const PS: &str = r#"
    struct PS_INPUT {
      float4 pos: SV_POSITION;
      float4 col: COLOR0;
      float2 uv: TEXCOORD0;
    };

    SamplerState sampler0: register(s0);
    Texture2D texture0: register(t0);

    float4 main(PS_INPUT input): SV_Target {
      float4 out_col = input.col * texture0.Sample(sampler0, input.uv);
      return out_col;
    }"#;

    let vtx_shader = compile_shader(VS, s!("vs_5_0"), "Compiling vertex shader")?;
    let pix_shader = compile_shader(PS, s!("ps_5_0"), "Compiling pixel shader")?;

    let input_elements = [
        D3D12_INPUT_ELEMENT_DESC {
            SemanticName: s!("POSITION"),
            SemanticIndex: 0,
            Format: DXGI_FORMAT_R32G32_FLOAT,
            InputSlot: 0,
            AlignedByteOffset: offset_of!(DrawVert, pos) as u32,
            InputSlotClass: D3D12_INPUT_CLASSIFICATION_PER_VERTEX_DATA,
            InstanceDataStepRate: 0,
        },
        D3D12_INPUT_ELEMENT_DESC {
            SemanticName: s!("TEXCOORD"),
            SemanticIndex: 0,
            Format: DXGI_FORMAT_R32G32_FLOAT,
            InputSlot: 0,
            AlignedByteOffset: offset_of!(DrawVert, uv) as u32,
            InputSlotClass: D3D12_INPUT_CLASSIFICATION_PER_VERTEX_DATA,
            InstanceDataStepRate: 0,
        },
        D3D12_INPUT_ELEMENT_DESC {
            SemanticName: s!("COLOR"),
            SemanticIndex: 0,
            Format: DXGI_FORMAT_R8G8B8A8_UNORM,
            InputSlot: 0,
            AlignedByteOffset: offset_of!(DrawVert, col) as u32,
            InputSlotClass: D3D12_INPUT_CLASSIFICATION_PER_VERTEX_DATA,
            InstanceDataStepRate: 0,
        },
    ];

    let mut rtv_formats = [DXGI_FORMAT_UNKNOWN; 8];
    rtv_formats[0] = format;

    let pso_desc = D3D12_GRAPHICS_PIPELINE_STATE_DESC {
        pRootSignature: ManuallyDrop::new(Some(root_signature.clone())),
        NodeMask: 0,
        PrimitiveTopologyType: D3D12_PRIMITIVE_TOPOLOGY_TYPE_TRIANGLE,
        SampleMask: u32::MAX,
        NumRenderTargets: 1,
        SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
        Flags: D3D12_PIPELINE_STATE_FLAG_NONE,
        RTVFormats: rtv_formats,
        DSVFormat: DXGI_FORMAT_UNKNOWN,
        VS: D3D12_SHADER_BYTECODE {
            pShaderBytecode: vtx_shader.GetBufferPointer(),
            BytecodeLength: vtx_shader.GetBufferSize(),
        },
        PS: D3D12_SHADER_BYTECODE {
            pShaderBytecode: pix_shader.GetBufferPointer(),
            BytecodeLength: pix_shader.GetBufferSize(),
        },
        InputLayout: D3D12_INPUT_LAYOUT_DESC {
            pInputElementDescs: input_elements.as_ptr(),
            NumElements: input_elements.len() as u32,
        },
        BlendState: D3D12_BLEND_DESC {
            AlphaToCoverageEnable: false.into(),
            IndependentBlendEnable: false.into(),
            RenderTarget: [
                D3D12_RENDER_TARGET_BLEND_DESC {
                    BlendEnable: true.into(),
                    LogicOpEnable: false.into(),
                    SrcBlend: D3D12_BLEND_SRC_ALPHA,
                    DestBlend: D3D12_BLEND_INV_SRC_ALPHA,
                    BlendOp: D3D12_BLEND_OP_ADD,
                    SrcBlendAlpha: D3D12_BLEND_ONE,
                    DestBlendAlpha: D3D12_BLEND_INV_SRC_ALPHA,
                    BlendOpAlpha: D3D12_BLEND_OP_ADD,
                    LogicOp: Default::default(),
                    RenderTargetWriteMask: D3D12_COLOR_WRITE_ENABLE_ALL.0 as _,
                },
                Default::default(),
                Default::default(),
                Default::default(),
                Default::default(),
                Default::default(),
                Default::default(),
                Default::default(),
            ],
        },
        RasterizerState: D3D12_RASTERIZER_DESC {
            FillMode: D3D12_FILL_MODE_SOLID,
            CullMode: D3D12_CULL_MODE_NONE,
            FrontCounterClockwise: false.into(),
            DepthBias: D3D12_DEFAULT_DEPTH_BIAS,
            DepthBiasClamp: D3D12_DEFAULT_DEPTH_BIAS_CLAMP,
            SlopeScaledDepthBias: D3D12_DEFAULT_SLOPE_SCALED_DEPTH_BIAS,
            DepthClipEnable: true.into(),
            MultisampleEnable: false.into(),
            AntialiasedLineEnable: false.into(),
            ForcedSampleCount: 0,
            ConservativeRaster: D3D12_CONSERVATIVE_RASTERIZATION_MODE_OFF,
        },
        ..Default::default()
    };

    let pipeline_state = device.CreateGraphicsPipelineState(&pso_desc);
    let _ = ManuallyDrop::into_inner(pso_desc.pRootSignature);

    Ok((root_signature, pipeline_state?))
}

struct Buffer<T: Sized> {
    resource: ID3D12Resource,
    resource_capacity: usize,
    data: Vec<T>,
}

impl<T: Copy> Buffer<T> {
    fn new(device: &ID3D12Device, resource_capacity: usize) -> Result<Self> {
        let resource = Self::create_resource(device, resource_capacity)?;
        let data = Vec::with_capacity(resource_capacity);

        Ok(Self { resource, resource_capacity, data })
    }

    fn create_resource(device: &ID3D12Device, resource_capacity: usize) -> Result<ID3D12Resource> {
        try_out_ptr(|v| unsafe {
            device.CreateCommittedResource(
                &D3D12_HEAP_PROPERTIES {
                    Type: D3D12_HEAP_TYPE_UPLOAD,
                    CPUPageProperty: D3D12_CPU_PAGE_PROPERTY_UNKNOWN,
                    MemoryPoolPreference: D3D12_MEMORY_POOL_UNKNOWN,
                    CreationNodeMask: 0,
                    VisibleNodeMask: 0,
                },
                D3D12_HEAP_FLAG_NONE,
                &D3D12_RESOURCE_DESC {
                    Dimension: D3D12_RESOURCE_DIMENSION_BUFFER,
                    Alignment: 0,
                    Width: (resource_capacity * mem::size_of::<T>()) as u64,
                    Height: 1,
                    DepthOrArraySize: 1,
                    MipLevels: 1,
                    Format: DXGI_FORMAT_UNKNOWN,
                    SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
                    Layout: D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
                    Flags: D3D12_RESOURCE_FLAG_NONE,
                },
                D3D12_RESOURCE_STATE_GENERIC_READ,
                None,
                v,
            )
        })
    }

    fn clear(&mut self) {
        self.data.clear();
    }

    fn extend<I: IntoIterator<Item = T>>(&mut self, it: I) {
        self.data.extend(it)
    }

    fn upload(&mut self, device: &ID3D12Device) -> Result<()> {
        let capacity = self.data.capacity();
        if capacity > self.resource_capacity {
            drop(mem::replace(&mut self.resource, Self::create_resource(device, capacity)?));
            self.resource_capacity = capacity;
        }

        unsafe {
            let mut resource_ptr = ptr::null_mut();
            self.resource.Map(0, None, Some(&mut resource_ptr))?;
            ptr::copy_nonoverlapping(self.data.as_ptr(), resource_ptr as *mut T, self.data.len());
            self.resource.Unmap(0, None);
        }

        Ok(())
    }
}
