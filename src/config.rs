//! Overlay configuration.
//!
//! Every knob has a default matching a stock deployment, so
//! `OverlayConfig::default()` is enough for most hosts. Use the `with_*`
//! methods to override individual values:
//!
//! ```
//! use std::time::Duration;
//! use hudscript::config::{LatchPolicy, OverlayConfig};
//!
//! let config = OverlayConfig::default()
//!     .with_font_size(16.0)
//!     .with_latch_policy(LatchPolicy::MostRecent)
//!     .with_drain_delay(Duration::from_millis(250));
//! assert_eq!(config.font_size, 16.0);
//! ```
use std::path::PathBuf;
use std::time::Duration;

/// Decides which direct command queue the overlay submits through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LatchPolicy {
    /// The first direct queue observed is kept forever.
    #[default]
    First,
    /// The most recently observed direct queue wins.
    MostRecent,
}

/// Which trampoline strategy installs the hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendPreference {
    /// Probe MinHook first and fall back to retour.
    #[default]
    Auto,
    MinHook,
    Retour,
}

#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// TrueType font loaded at initialization. A missing file falls back to
    /// the built-in font.
    pub font_path: PathBuf,
    pub font_size: f32,
    /// Name of the script callback invoked once per active frame.
    pub frame_callback: String,
    /// Name under which the texture loader is registered in each script.
    pub texture_binding: String,
    /// Shader-resource descriptors reserved for script textures, on top of
    /// one per back buffer.
    pub texture_slots: u32,
    pub latch_policy: LatchPolicy,
    pub hook_backend: BackendPreference,
    /// Grace period between hook removal and release of GPU objects.
    pub drain_delay: Duration,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            font_path: PathBuf::from(r"C:\Windows\Fonts\simhei.ttf"),
            font_size: 13.0,
            frame_callback: String::from("on_imgui"),
            texture_binding: String::from("LoadTexture"),
            texture_slots: 256,
            latch_policy: LatchPolicy::First,
            hook_backend: BackendPreference::Auto,
            drain_delay: Duration::from_secs(1),
        }
    }
}

impl OverlayConfig {
    pub fn with_font(mut self, path: impl Into<PathBuf>) -> Self {
        self.font_path = path.into();
        self
    }

    pub fn with_font_size(mut self, size: f32) -> Self {
        self.font_size = size;
        self
    }

    pub fn with_frame_callback(mut self, name: impl Into<String>) -> Self {
        self.frame_callback = name.into();
        self
    }

    pub fn with_texture_binding(mut self, name: impl Into<String>) -> Self {
        self.texture_binding = name.into();
        self
    }

    pub fn with_texture_slots(mut self, slots: u32) -> Self {
        self.texture_slots = slots;
        self
    }

    pub fn with_latch_policy(mut self, policy: LatchPolicy) -> Self {
        self.latch_policy = policy;
        self
    }

    pub fn with_hook_backend(mut self, backend: BackendPreference) -> Self {
        self.hook_backend = backend;
        self
    }

    pub fn with_drain_delay(mut self, delay: Duration) -> Self {
        self.drain_delay = delay;
        self
    }
}
