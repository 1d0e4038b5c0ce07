//! The overlay rendering machinery.
//!
//! [`Pipeline`] drives a [`RenderBackend`] from inside the host's present,
//! command submission and resize calls. The backend abstracts the handful of
//! graphics API operations the pipeline needs, so the state machine can be
//! exercised without a GPU.
use std::fmt;

use imgui::TextureId;

use crate::config::OverlayConfig;
use crate::renderer::input::InputEvent;
use crate::Result;

#[cfg(windows)]
pub mod backend;
pub mod frame;
pub mod input;
pub mod latch;
pub mod pipeline;
pub mod script;
pub mod texture;

pub use frame::{FrameContext, FrameContexts};
pub use latch::QueueLatch;
pub use pipeline::{OverlayState, Pipeline, Routing};
pub use script::{Bindings, InterpreterHandle, ScriptEntry, ScriptHost, TextureLoaderFn};
pub use texture::{LoadedTexture, TextureLoader};

/// Opaque window handle as the host reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowHandle(pub isize);

/// What the pipeline needs to know about a swapchain to build frame contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapChainInfo {
    pub buffer_count: u32,
    pub window: WindowHandle,
    /// Back buffer pixel format in the graphics API's own numbering.
    pub format: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapKind {
    RenderTarget,
    /// Shader visible; holds the font atlas at slot 0 and script textures
    /// after it.
    ShaderResource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Present,
    RenderTarget,
}

/// Graphics API operations used by the [`Pipeline`].
///
/// Handles are cheap clones of reference-counted objects, matching how COM
/// interfaces behave.
pub trait RenderBackend: Clone {
    type SwapChain;
    type Queue: Clone;
    type Device: Clone;
    type Resource: Clone;
    type Allocator;
    type CommandList;
    type DescriptorHeap: Clone;
    type RtvHandle: Copy + fmt::Debug;
    type WindowProc: Copy;
    type Overlay: Overlay<CommandList = Self::CommandList>;

    /// Whether `queue` executes direct (graphics) command lists.
    fn queue_is_direct(&self, queue: &Self::Queue) -> bool;

    fn swap_chain_device(&self, swap_chain: &Self::SwapChain) -> Result<Self::Device>;
    fn swap_chain_info(&self, swap_chain: &Self::SwapChain) -> Result<SwapChainInfo>;
    fn current_back_buffer_index(&self, swap_chain: &Self::SwapChain) -> usize;
    fn back_buffer(&self, swap_chain: &Self::SwapChain, index: usize) -> Result<Self::Resource>;

    fn create_descriptor_heap(
        &self,
        device: &Self::Device,
        kind: HeapKind,
        count: u32,
    ) -> Result<Self::DescriptorHeap>;
    fn rtv_handle(
        &self,
        device: &Self::Device,
        heap: &Self::DescriptorHeap,
        index: usize,
    ) -> Self::RtvHandle;
    fn create_render_target_view(
        &self,
        device: &Self::Device,
        resource: &Self::Resource,
        handle: Self::RtvHandle,
    );
    fn create_command_allocator(&self, device: &Self::Device) -> Result<Self::Allocator>;
    /// Create a command list in the closed state.
    fn create_command_list(
        &self,
        device: &Self::Device,
        allocator: &Self::Allocator,
    ) -> Result<Self::CommandList>;

    fn reset_allocator(&self, allocator: &Self::Allocator) -> Result<()>;
    fn reset_command_list(&self, list: &Self::CommandList, allocator: &Self::Allocator)
        -> Result<()>;
    fn transition(
        &self,
        list: &Self::CommandList,
        resource: &Self::Resource,
        from: ResourceState,
        to: ResourceState,
    );
    fn bind_render_target(
        &self,
        list: &Self::CommandList,
        rtv: Self::RtvHandle,
        srv_heap: &Self::DescriptorHeap,
    );
    fn close_command_list(&self, list: &Self::CommandList) -> Result<()>;
    fn execute(&self, queue: &Self::Queue, list: &Self::CommandList);

    /// Create a shader-readable RGBA8 texture from rows already laid out at
    /// `pitch` bytes, waiting for the copy to complete.
    fn upload_texture(
        &self,
        device: &Self::Device,
        padded: &[u8],
        width: u32,
        height: u32,
        pitch: u32,
    ) -> Result<Self::Resource>;
    /// Create a view of `resource` at `slot` of the shader-resource heap.
    fn create_texture_view(
        &self,
        device: &Self::Device,
        heap: &Self::DescriptorHeap,
        slot: u32,
        resource: &Self::Resource,
    ) -> TextureId;

    fn install_window_proc(&self, window: WindowHandle) -> Result<Self::WindowProc>;
    fn restore_window_proc(&self, window: WindowHandle, original: Self::WindowProc);

    fn create_overlay(
        &self,
        device: &Self::Device,
        info: &SwapChainInfo,
        srv_heap: &Self::DescriptorHeap,
        config: &OverlayConfig,
    ) -> Result<Self::Overlay>;
}

/// The immediate-mode UI renderer living inside the host's frame.
pub trait Overlay {
    type Ui;
    type CommandList;

    /// Start a frame and hand the UI builder to `build`.
    fn new_frame(&mut self, build: &mut dyn FnMut(&mut Self::Ui));
    /// Record the frame's draw data into `list`.
    fn render(&mut self, list: &Self::CommandList, frame_index: usize) -> Result<()>;

    fn handle_input(&mut self, event: &InputEvent);
    fn want_capture_mouse(&self) -> bool;
    fn want_capture_keyboard(&self) -> bool;
}
