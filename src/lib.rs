//! # hudscript
//!
//! Draws a script-driven [`dear imgui`](https://docs.rs/imgui/0.11.0/imgui/)
//! overlay inside the render loop of a Direct3D 12 application, without the
//! application's cooperation.
//!
//! The library finds the host's dispatch functions by building throwaway
//! graphics objects, hooks command submission, present and buffer resize,
//! and then lazily builds everything it needs to draw on the first present
//! that follows the discovery of the host's presentation queue. What to draw
//! is up to a [`ScriptHost`](renderer::ScriptHost): it gets called every
//! frame with the UI builder and is handed a texture loader callable.
//!
//! ## Example
//!
//! ```no_run
//! # #[cfg(windows)]
//! # fn main() -> hudscript::Result<()> {
//! use hudscript::config::OverlayConfig;
//! use hudscript::hooks::dx12::Dx12Hooks;
//! use hudscript::renderer::{InterpreterHandle, ScriptEntry, ScriptHost, TextureLoaderFn};
//!
//! struct Hello;
//!
//! impl ScriptHost<imgui::Ui> for Hello {
//!     fn reload_token(&self) -> u64 {
//!         1
//!     }
//!
//!     fn script_names(&self) -> Vec<String> {
//!         Vec::new()
//!     }
//!
//!     fn script(&self, _: &str) -> Option<ScriptEntry> {
//!         None
//!     }
//!
//!     fn register_ui_bindings(&mut self) {}
//!
//!     fn register_texture_loader(&mut self, _: InterpreterHandle, _: &str, _: TextureLoaderFn) {}
//!
//!     fn run(&mut self, _callback: &str, ui: &mut imgui::Ui) {
//!         ui.window("hudscript").build(|| ui.text("Hello, hello!"));
//!     }
//! }
//!
//! hudscript::util::setup_tracing(None);
//! let hooks = unsafe { Dx12Hooks::install(Hello, OverlayConfig::default()) }?;
//! // ...
//! unsafe { hooks.unhook() }?;
//! # Ok(())
//! # }
//! # #[cfg(not(windows))]
//! # fn main() {}
//! ```
//!
//! ## Fair warning
//!
//! This crate rewrites code of the process it runs in and contains a hefty
//! amount of FFI and `unsafe` code. It is meant for game mods and similar
//! tools, not for hosts that fight back.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod hooks;
pub mod renderer;
pub mod util;

pub use error::{Error, Result, Status};
pub use {imgui, tracing};

#[cfg(windows)]
pub use windows;
