//! Hook installation.
//!
//! A [`HookBackend`] knows how to redirect one function to another; the
//! [`HookManager`] resolves dispatch table indices to targets and keeps track
//! of what it installed so removal is always safe to request.
use std::ffi::c_void;
use std::sync::atomic::{AtomicPtr, Ordering};

use tracing::{debug, error};

use crate::dispatch::DispatchTable;
use crate::{Error, Result};

#[cfg(windows)]
pub mod detour;
#[cfg(windows)]
pub mod dx12;
#[cfg(windows)]
pub mod mh_backend;

/// A trampoline-hooking strategy.
pub trait HookBackend {
    fn name(&self) -> &'static str;

    /// Redirect `target` to `replacement`.
    ///
    /// The callable original is stored into `original` before the redirect
    /// goes live, so a replacement that fires immediately can forward.
    ///
    /// # Safety
    ///
    /// `target` and `replacement` must be functions with identical
    /// signatures and calling conventions.
    unsafe fn install(
        &mut self,
        target: *mut c_void,
        replacement: *mut c_void,
        original: &AtomicPtr<c_void>,
    ) -> Result<()>;

    /// Undo the redirect for `target`. Unknown targets are not an error.
    ///
    /// # Safety
    ///
    /// Threads may still be executing inside the replacement after this
    /// returns; callers must drain them before freeing anything they use.
    unsafe fn remove(&mut self, target: *mut c_void) -> Result<()>;
}

impl<T: HookBackend + ?Sized> HookBackend for Box<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    unsafe fn install(
        &mut self,
        target: *mut c_void,
        replacement: *mut c_void,
        original: &AtomicPtr<c_void>,
    ) -> Result<()> {
        (**self).install(target, replacement, original)
    }

    unsafe fn remove(&mut self, target: *mut c_void) -> Result<()> {
        (**self).remove(target)
    }
}

/// One installed redirect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookRecord {
    pub index: usize,
    pub target: *mut c_void,
    pub replacement: *mut c_void,
    pub original: *mut c_void,
}

/// Installs and removes hooks on dispatch table entries.
///
/// A failed install leaves earlier hooks of the same batch in place; callers
/// must cope with a partially hooked host.
pub struct HookManager<B: HookBackend> {
    table: DispatchTable,
    backend: B,
    records: Vec<HookRecord>,
}

impl<B: HookBackend> HookManager<B> {
    pub fn new(table: DispatchTable, backend: B) -> Self {
        Self { table, backend, records: Vec::new() }
    }

    pub fn table(&self) -> &DispatchTable {
        &self.table
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn records(&self) -> &[HookRecord] {
        &self.records
    }

    pub fn is_installed(&self, index: usize) -> bool {
        self.records.iter().any(|r| r.index == index)
    }

    /// Hook the function at `index`, publishing the original into
    /// `original`. Installing the same index twice is a no-op.
    ///
    /// # Safety
    ///
    /// `replacement` must match the signature of the function at `index`.
    pub unsafe fn install(
        &mut self,
        index: usize,
        replacement: *mut c_void,
        original: &AtomicPtr<c_void>,
    ) -> Result<()> {
        if self.is_installed(index) {
            return Ok(());
        }

        let target = self.table.get(index)?;
        self.backend.install(target, replacement, original).map_err(|e| {
            error!("{}: could not hook index {index} at {target:p}: {e}", self.backend.name());
            Error::unknown(format!("hooking dispatch index {index}: {e}"))
        })?;

        let original = original.load(Ordering::SeqCst);
        debug!("{}: hooked index {index} at {target:p}, original {original:p}", self.backend.name());
        self.records.push(HookRecord { index, target, replacement, original });

        Ok(())
    }

    /// Unhook the function at `index`. Succeeds if it was never hooked.
    ///
    /// # Safety
    ///
    /// See [`HookBackend::remove`].
    pub unsafe fn remove(&mut self, index: usize) -> Result<()> {
        let Some(pos) = self.records.iter().position(|r| r.index == index) else {
            return Ok(());
        };

        let record = self.records[pos];
        self.backend.remove(record.target).map_err(|e| {
            error!("{}: could not unhook index {index}: {e}", self.backend.name());
            Error::unknown(format!("unhooking dispatch index {index}: {e}"))
        })?;
        self.records.remove(pos);
        debug!("{}: unhooked index {index}", self.backend.name());

        Ok(())
    }

    /// Unhook everything in reverse install order. Keeps going past failures
    /// and reports the first one.
    ///
    /// # Safety
    ///
    /// See [`HookBackend::remove`].
    pub unsafe fn remove_all(&mut self) -> Result<()> {
        let indices: Vec<usize> = self.records.iter().rev().map(|r| r.index).collect();
        let mut first_error = None;

        for index in indices {
            if let Err(e) = self.remove(index) {
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}

/// Pick a trampoline strategy that actually works in this process.
///
/// Each candidate is probed by hooking and unhooking a private function.
#[cfg(windows)]
pub fn select_backend(
    preference: crate::config::BackendPreference,
) -> Result<Box<dyn HookBackend + Send>> {
    use crate::config::BackendPreference;

    let candidates: &[BackendPreference] = match preference {
        BackendPreference::Auto => &[BackendPreference::MinHook, BackendPreference::Retour],
        BackendPreference::MinHook => &[BackendPreference::MinHook],
        BackendPreference::Retour => &[BackendPreference::Retour],
    };

    for candidate in candidates {
        match candidate {
            BackendPreference::MinHook if mh_backend::MinHookBackend::probe() => {
                debug!("Selected minhook backend");
                return Ok(Box::new(mh_backend::MinHookBackend::new()));
            },
            BackendPreference::Retour if detour::RetourBackend::probe() => {
                debug!("Selected retour backend");
                return Ok(Box::new(detour::RetourBackend::new()));
            },
            other => debug!("{other:?} backend unavailable"),
        }
    }

    Err(Error::Hook(format!("no usable hook backend for {preference:?}")))
}

#[cfg(windows)]
#[inline(never)]
extern "system" fn probe_target(a: u32, b: u32) -> u32 {
    std::hint::black_box(a.wrapping_mul(31).rotate_left(b % 32) ^ 0x5bd1_e995)
}

#[cfg(windows)]
#[inline(never)]
extern "system" fn probe_detour(a: u32, b: u32) -> u32 {
    std::hint::black_box(a ^ b)
}

#[cfg(windows)]
fn probe_functions() -> (*mut c_void, *mut c_void) {
    (probe_target as *mut c_void, probe_detour as *mut c_void)
}
