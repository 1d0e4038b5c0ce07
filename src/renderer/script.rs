//! The scripting collaborator's touchpoints.
//!
//! The overlay never interprets scripts itself. It asks a [`ScriptHost`] to
//! build the UI once per frame and re-registers native bindings whenever the
//! host reports that its scripts were reloaded.
use std::ffi::c_void;
use std::path::Path;
use std::rc::Rc;

use tracing::debug;

use crate::renderer::texture::LoadedTexture;
use crate::Result;

/// Native callable handed to scripts: loads an image file into a texture the
/// UI can draw.
pub type TextureLoaderFn = Rc<dyn Fn(&Path) -> Result<LoadedTexture>>;

/// Opaque handle to one script interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterpreterHandle(pub *mut c_void);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptEntry {
    pub interpreter: InterpreterHandle,
    /// Whether the script has finished its startup and accepts bindings.
    pub started: bool,
}

/// Implemented by the embedding scripting engine.
pub trait ScriptHost<Ui> {
    /// Changes every time scripts are (re)loaded. Zero means nothing has been
    /// loaded yet.
    fn reload_token(&self) -> u64;

    fn script_names(&self) -> Vec<String>;
    fn script(&self, name: &str) -> Option<ScriptEntry>;

    /// Expose the UI bindings to every loaded script.
    fn register_ui_bindings(&mut self);

    /// Register `loader` under `name` in one interpreter.
    fn register_texture_loader(
        &mut self,
        interpreter: InterpreterHandle,
        name: &str,
        loader: TextureLoaderFn,
    );

    /// Invoke the function called `callback` in every script.
    fn run(&mut self, callback: &str, ui: &mut Ui);
}

impl<Ui, T: ScriptHost<Ui> + ?Sized> ScriptHost<Ui> for Box<T> {
    fn reload_token(&self) -> u64 {
        (**self).reload_token()
    }

    fn script_names(&self) -> Vec<String> {
        (**self).script_names()
    }

    fn script(&self, name: &str) -> Option<ScriptEntry> {
        (**self).script(name)
    }

    fn register_ui_bindings(&mut self) {
        (**self).register_ui_bindings()
    }

    fn register_texture_loader(
        &mut self,
        interpreter: InterpreterHandle,
        name: &str,
        loader: TextureLoaderFn,
    ) {
        (**self).register_texture_loader(interpreter, name, loader)
    }

    fn run(&mut self, callback: &str, ui: &mut Ui) {
        (**self).run(callback, ui)
    }
}

/// Tracks whether the script host's bindings are current.
#[derive(Debug)]
pub struct Bindings {
    seen_token: u64,
    stale: bool,
}

impl Default for Bindings {
    fn default() -> Self {
        Self { seen_token: 0, stale: true }
    }
}

impl Bindings {
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Force re-registration on the next frame.
    pub fn invalidate(&mut self) {
        self.stale = true;
    }

    /// Check the host's reload token and re-register bindings if they are
    /// stale. Returns whether a registration pass happened.
    pub fn refresh<Ui, S: ScriptHost<Ui> + ?Sized>(
        &mut self,
        host: &mut S,
        binding_name: &str,
        loader: &TextureLoaderFn,
    ) -> bool {
        let token = host.reload_token();
        if token != 0 && token != self.seen_token {
            debug!("Script reload detected ({} -> {token})", self.seen_token);
            self.seen_token = token;
            self.stale = true;
        }

        if !self.stale {
            return false;
        }

        host.register_ui_bindings();
        for name in host.script_names() {
            match host.script(&name) {
                Some(ScriptEntry { interpreter, started: true }) => {
                    host.register_texture_loader(interpreter, binding_name, Rc::clone(loader));
                },
                _ => debug!("Script {name} not started, skipping {binding_name}"),
            }
        }
        self.stale = false;

        true
    }
}
