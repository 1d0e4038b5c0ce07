//! General-purpose utilities.
use std::fs::File;
use std::hint;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Helper for fallible APIs that have an out-param with a default value.
///
/// # Example
///
/// ```ignore
/// let desc = try_out_param(|sd| unsafe { swap_chain.GetDesc(sd) })?;
/// ```
pub fn try_out_param<T, F, E, O>(mut f: F) -> Result<T, E>
where
    T: Default,
    F: FnMut(&mut T) -> Result<O, E>,
{
    let mut t: T = Default::default();
    f(&mut t).map(|_| t)
}

/// Helper for fallible [`windows`] APIs that have an optional pointer
/// out-param. A call that succeeds without filling the pointer is reported
/// as an error.
///
/// # Example
///
/// ```ignore
/// let dev: ID3D12Device =
///     try_out_ptr(|v| unsafe { D3D12CreateDevice(&adapter, D3D_FEATURE_LEVEL_11_0, v) })?;
/// ```
#[cfg(windows)]
pub fn try_out_ptr<T, F, O>(mut f: F) -> crate::Result<T>
where
    F: FnMut(&mut Option<T>) -> windows::core::Result<O>,
{
    let mut t: Option<T> = None;
    f(&mut t)?;
    t.ok_or_else(|| crate::Error::unknown("call succeeded but returned a null interface"))
}

/// Counts threads currently executing a hook body.
///
/// Call [`CallFence::enter`] at the top of a hook and keep the guard alive
/// for the duration of the call; [`CallFence::wait`] spins until every guard
/// has been dropped.
pub struct CallFence(AtomicUsize);

impl CallFence {
    pub const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    pub fn enter(&self) -> CallFenceGuard<'_> {
        self.0.fetch_add(1, Ordering::SeqCst);
        CallFenceGuard(self)
    }

    pub fn in_flight(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    pub fn wait(&self) {
        while self.in_flight() > 0 {
            hint::spin_loop();
        }
    }
}

impl Default for CallFence {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard returned by [`CallFence::enter`].
pub struct CallFenceGuard<'a>(&'a CallFence);

impl Drop for CallFenceGuard<'_> {
    fn drop(&mut self) {
        self.0 .0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Install a `tracing` subscriber writing to stdout and, optionally, to a log
/// file without ANSI escapes. Filtering follows `RUST_LOG`.
///
/// Does nothing if a global subscriber is already installed.
pub fn setup_tracing(log_file: Option<&Path>) {
    let file_layer = log_file.and_then(|path| File::create(path).ok()).map(|file| {
        fmt::layer()
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_thread_names(true)
            .with_writer(Mutex::new(file))
            .with_ansi(false)
    });

    tracing_subscriber::registry()
        .with(
            fmt::layer().event_format(
                fmt::format()
                    .with_level(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_thread_names(true),
            ),
        )
        .with(file_layer)
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();
}

#[cfg(windows)]
pub use self::win32::*;

#[cfg(windows)]
mod win32 {
    use std::mem::ManuallyDrop;

    use windows::Win32::Foundation::{HWND, RECT};
    use windows::Win32::Graphics::Direct3D12::*;
    use windows::Win32::UI::WindowsAndMessaging::GetClientRect;

    /// Width and height of the client area of a window, or `(0, 0)` if it
    /// can't be queried.
    pub fn win_size(hwnd: HWND) -> (i32, i32) {
        let mut rect = RECT::default();
        let _ = unsafe { GetClientRect(hwnd, &mut rect) };
        (rect.right - rect.left, rect.bottom - rect.top)
    }

    /// Build a transition barrier for all subresources of `resource`. The
    /// barrier holds a reference to the resource; release it with
    /// [`drop_barrier`] once the barrier has been recorded.
    pub fn create_barrier(
        resource: &ID3D12Resource,
        before: D3D12_RESOURCE_STATES,
        after: D3D12_RESOURCE_STATES,
    ) -> D3D12_RESOURCE_BARRIER {
        D3D12_RESOURCE_BARRIER {
            Type: D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
            Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
            Anonymous: D3D12_RESOURCE_BARRIER_0 {
                Transition: ManuallyDrop::new(D3D12_RESOURCE_TRANSITION_BARRIER {
                    pResource: ManuallyDrop::new(Some(resource.clone())),
                    Subresource: D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
                    StateBefore: before,
                    StateAfter: after,
                }),
            },
        }
    }

    pub fn drop_barrier(barrier: D3D12_RESOURCE_BARRIER) {
        let transition = ManuallyDrop::into_inner(unsafe { barrier.Anonymous.Transition });
        let _ = ManuallyDrop::into_inner(transition.pResource);
    }
}
