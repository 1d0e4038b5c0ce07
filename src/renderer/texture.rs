//! On-demand image textures for scripts.
use std::cell::{Cell, RefCell};
use std::path::Path;
use std::rc::Rc;

use imgui::TextureId;
use tracing::{debug, error};

use crate::renderer::script::TextureLoaderFn;
use crate::renderer::RenderBackend;
use crate::{Error, Result};

/// Row pitch alignment required for texture uploads
/// (`D3D12_TEXTURE_DATA_PITCH_ALIGNMENT`).
pub const PITCH_ALIGNMENT: u32 = 256;

/// Descriptor slot of the font atlas. Script textures start after it.
pub const FONT_SLOT: u32 = 0;

/// A texture ready to be drawn by the UI.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadedTexture {
    pub texture_id: TextureId,
    pub width: u32,
    pub height: u32,
}

/// Row pitch of an RGBA8 upload of the given width.
pub fn upload_pitch(width: u32) -> u32 {
    let row = width * 4;
    (row + PITCH_ALIGNMENT - 1) / PITCH_ALIGNMENT * PITCH_ALIGNMENT
}

/// Copy tightly packed RGBA8 rows into a buffer with `pitch` bytes per row.
pub fn pack_rows(rgba: &[u8], width: u32, height: u32, pitch: u32) -> Vec<u8> {
    let row = (width * 4) as usize;
    let pitch = pitch as usize;

    if row == pitch {
        return rgba[..row * height as usize].to_vec();
    }

    let mut padded = vec![0u8; pitch * height as usize];
    for (src, dst) in rgba.chunks_exact(row).zip(padded.chunks_exact_mut(pitch)) {
        dst[..row].copy_from_slice(src);
    }
    padded
}

/// Decodes images and uploads them into the shader-resource heap of the
/// current overlay incarnation.
pub struct TextureLoader<B: RenderBackend> {
    backend: B,
    device: B::Device,
    srv_heap: B::DescriptorHeap,
    capacity: u32,
    next_slot: Rc<Cell<u32>>,
    textures: Vec<B::Resource>,
}

impl<B: RenderBackend> TextureLoader<B> {
    /// `next_slot` is shared across loaders so that slots keep increasing
    /// for the lifetime of the process.
    pub fn new(
        backend: B,
        device: B::Device,
        srv_heap: B::DescriptorHeap,
        capacity: u32,
        next_slot: Rc<Cell<u32>>,
    ) -> Self {
        Self { backend, device, srv_heap, capacity, next_slot, textures: Vec::new() }
    }

    /// Load an image file into a new texture.
    ///
    /// Decoding errors are returned and consume no descriptor slot.
    ///
    /// # Panics
    ///
    /// Panics if the GPU upload fails. That only happens on device-level
    /// failures the overlay cannot recover from.
    pub fn load(&mut self, path: &Path) -> Result<LoadedTexture> {
        let image = image::open(path)?.into_rgba8();
        let (width, height) = image.dimensions();

        let slot = self.next_slot.get();
        if slot >= self.capacity {
            error!("No descriptor slot left for {path:?}");
            return Err(Error::HeapExhausted { slot, capacity: self.capacity });
        }

        let pitch = upload_pitch(width);
        let padded = pack_rows(image.as_raw(), width, height, pitch);

        let uploaded = self.backend.upload_texture(&self.device, &padded, width, height, pitch);
        let resource = match uploaded {
            Ok(resource) => resource,
            Err(e) => panic!("uploading {path:?} ({width}x{height}) failed: {e}"),
        };

        self.next_slot.set(slot + 1);
        let texture_id =
            self.backend.create_texture_view(&self.device, &self.srv_heap, slot, &resource);
        self.textures.push(resource);

        debug!("Loaded {path:?} ({width}x{height}) into slot {slot}");

        Ok(LoadedTexture { texture_id, width, height })
    }

    pub fn len(&self) -> usize {
        self.textures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.textures.is_empty()
    }
}

/// The loader slot shared between the pipeline and the callable handed to
/// scripts. It is empty while the overlay is not initialized.
pub type SharedTextureLoader<B> = Rc<RefCell<Option<TextureLoader<B>>>>;

/// Wrap the shared loader slot into a callable for scripts.
pub fn loader_fn<B: RenderBackend + 'static>(slot: &SharedTextureLoader<B>) -> TextureLoaderFn {
    let slot = Rc::clone(slot);
    Rc::new(move |path: &Path| match slot.borrow_mut().as_mut() {
        Some(loader) => loader.load(path),
        None => Err(Error::NotInitialized),
    })
}
