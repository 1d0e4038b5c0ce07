//! [`HookBackend`] on top of [MinHook](https://github.com/TsudaKageyu/minhook).
//!
//! Hooks are created, queued for enabling and then applied in one
//! transaction, which suspends every other thread of the process while the
//! jumps are written.
use std::collections::HashSet;
use std::ffi::c_void;
use std::sync::atomic::{AtomicPtr, Ordering};

use ::minhook::{MinHook, MH_STATUS};
use tracing::{error, trace};

use crate::hooks::HookBackend;
use crate::{Error, Result};

fn check(status: std::result::Result<(), MH_STATUS>, context: &str) -> Result<()> {
    status.map_err(|e| {
        error!("{context}: {e:?}");
        Error::Hook(format!("{context}: {e:?}"))
    })
}

/// Transactional MinHook strategy.
#[derive(Default)]
pub struct MinHookBackend {
    targets: HashSet<usize>,
}

impl MinHookBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hook and unhook a private function to find out whether MinHook works
    /// in this process.
    pub fn probe() -> bool {
        let mut backend = Self::new();
        let original = AtomicPtr::new(std::ptr::null_mut());
        let (target, detour) = super::probe_functions();
        unsafe {
            let ok = backend
                .install(target, detour, &original)
                .and_then(|_| backend.remove(target))
                .is_ok();
            trace!("MinHook probe: {ok}");
            ok
        }
    }
}

impl HookBackend for MinHookBackend {
    fn name(&self) -> &'static str {
        "minhook"
    }

    unsafe fn install(
        &mut self,
        target: *mut c_void,
        replacement: *mut c_void,
        original: &AtomicPtr<c_void>,
    ) -> Result<()> {
        let trampoline = MinHook::create_hook(target, replacement).map_err(|e| {
            error!("MH_CreateHook: {e:?}");
            Error::Hook(format!("MH_CreateHook: {e:?}"))
        })?;
        original.store(trampoline, Ordering::SeqCst);

        let applied = check(MinHook::queue_enable_hook(target), "MH_QueueEnableHook")
            .and_then(|_| check(MinHook::apply_queued(), "MH_ApplyQueued"));

        if let Err(e) = applied {
            let _ = MinHook::remove_hook(target);
            original.store(std::ptr::null_mut(), Ordering::SeqCst);
            return Err(e);
        }

        self.targets.insert(target as usize);
        Ok(())
    }

    unsafe fn remove(&mut self, target: *mut c_void) -> Result<()> {
        if !self.targets.contains(&(target as usize)) {
            return Ok(());
        }

        check(MinHook::queue_disable_hook(target), "MH_QueueDisableHook")?;
        check(MinHook::apply_queued(), "MH_ApplyQueued")?;
        check(MinHook::remove_hook(target), "MH_RemoveHook")?;
        self.targets.remove(&(target as usize));

        Ok(())
    }
}
