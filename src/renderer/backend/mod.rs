//! Graphics API implementations of [`RenderBackend`](crate::renderer::RenderBackend).
pub mod dx12;
