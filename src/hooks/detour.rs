//! [`HookBackend`] on top of [`retour`]'s raw detours, one hook at a time.
use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::atomic::{AtomicPtr, Ordering};

use retour::RawDetour;
use tracing::{error, trace};

use crate::hooks::HookBackend;
use crate::{Error, Result};

/// Single-hook create/enable strategy.
#[derive(Default)]
pub struct RetourBackend {
    detours: HashMap<usize, RawDetour>,
}

// RawDetour holds code pointers only; the patched memory is process-global.
unsafe impl Send for RetourBackend {}

impl RetourBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn probe() -> bool {
        let mut backend = Self::new();
        let original = AtomicPtr::new(std::ptr::null_mut());
        let (target, detour) = super::probe_functions();
        unsafe {
            let ok = backend
                .install(target, detour, &original)
                .and_then(|_| backend.remove(target))
                .is_ok();
            trace!("retour probe: {ok}");
            ok
        }
    }
}

fn hook_error(context: &str, e: retour::Error) -> Error {
    error!("{context}: {e}");
    Error::Hook(format!("{context}: {e}"))
}

impl HookBackend for RetourBackend {
    fn name(&self) -> &'static str {
        "retour"
    }

    unsafe fn install(
        &mut self,
        target: *mut c_void,
        replacement: *mut c_void,
        original: &AtomicPtr<c_void>,
    ) -> Result<()> {
        let detour = RawDetour::new(target as *const (), replacement as *const ())
            .map_err(|e| hook_error("RawDetour::new", e))?;
        original.store(detour.trampoline() as *const () as *mut c_void, Ordering::SeqCst);

        if let Err(e) = detour.enable() {
            original.store(std::ptr::null_mut(), Ordering::SeqCst);
            return Err(hook_error("RawDetour::enable", e));
        }

        self.detours.insert(target as usize, detour);
        Ok(())
    }

    unsafe fn remove(&mut self, target: *mut c_void) -> Result<()> {
        let Some(detour) = self.detours.get(&(target as usize)) else {
            return Ok(());
        };

        detour.disable().map_err(|e| hook_error("RawDetour::disable", e))?;
        self.detours.remove(&(target as usize));

        Ok(())
    }
}
