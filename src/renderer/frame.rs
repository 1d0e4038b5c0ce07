//! Per-back-buffer GPU objects.
use tracing::debug;

use crate::renderer::{HeapKind, RenderBackend};
use crate::{Error, Result};

/// Objects tied to one swapchain back buffer.
pub struct FrameContext<B: RenderBackend> {
    pub command_allocator: B::Allocator,
    pub back_buffer: B::Resource,
    pub rtv: B::RtvHandle,
}

/// Frame contexts plus the descriptor heaps and command list they share.
///
/// Dropping this releases every object it created; the back buffers
/// themselves belong to the swapchain.
pub struct FrameContexts<B: RenderBackend> {
    pub srv_heap: B::DescriptorHeap,
    pub rtv_heap: B::DescriptorHeap,
    pub command_list: B::CommandList,
    /// Shader-resource descriptors available, font atlas included.
    pub srv_capacity: u32,
    frames: Vec<FrameContext<B>>,
}

impl<B: RenderBackend> FrameContexts<B> {
    /// Build one context per back buffer of `swap_chain`.
    ///
    /// The shader-resource heap leaves `texture_slots` free descriptors past
    /// `next_slot`, the first slot a texture would take.
    ///
    /// On failure every object created so far is dropped before returning.
    pub fn create(
        backend: &B,
        device: &B::Device,
        swap_chain: &B::SwapChain,
        buffer_count: u32,
        next_slot: u32,
        texture_slots: u32,
    ) -> Result<Self> {
        if buffer_count == 0 {
            return Err(Error::unknown("swapchain reports zero buffers"));
        }

        let srv_capacity = buffer_count.max(next_slot) + texture_slots;
        let srv_heap =
            backend.create_descriptor_heap(device, HeapKind::ShaderResource, srv_capacity)?;
        let rtv_heap =
            backend.create_descriptor_heap(device, HeapKind::RenderTarget, buffer_count)?;

        let mut targets = Vec::with_capacity(buffer_count as usize);
        for index in 0..buffer_count as usize {
            let back_buffer = backend.back_buffer(swap_chain, index)?;
            let rtv = backend.rtv_handle(device, &rtv_heap, index);
            backend.create_render_target_view(device, &back_buffer, rtv);
            targets.push((back_buffer, rtv));
        }

        let mut frames = Vec::with_capacity(targets.len());
        for (back_buffer, rtv) in targets {
            let command_allocator = backend.create_command_allocator(device)?;
            frames.push(FrameContext { command_allocator, back_buffer, rtv });
        }

        let command_list = backend.create_command_list(device, &frames[0].command_allocator)?;

        debug!("Created {} frame contexts, {srv_capacity} shader-resource slots", frames.len());

        Ok(Self { srv_heap, rtv_heap, command_list, srv_capacity, frames })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&FrameContext<B>> {
        self.frames.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FrameContext<B>> {
        self.frames.iter()
    }
}
