//! Flat dispatch table captured from throwaway interface instances.
//!
//! Every COM object starts with a pointer to its type's vtable, and all
//! instances of a type loaded from the same binary share that vtable. Reading
//! the first few entries of a disposable instance therefore yields valid hook
//! targets for the host's own, already existing, instances.
//!
//! The table concatenates the vtables of five interfaces in a fixed order.
//! Indices are cumulative offsets of the per-interface slot counts:
//!
//! | interface          | slots | offset |
//! |--------------------|-------|--------|
//! | device             | 44    | 0      |
//! | command queue      | 19    | 44     |
//! | command allocator  | 9     | 63     |
//! | command list       | 60    | 72     |
//! | swapchain          | 18    | 132    |
use std::ffi::c_void;
use std::fmt;

use tracing::{error, trace};

use crate::{Error, Result};

/// Interfaces captured into the [`DispatchTable`], in table order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterfaceKind {
    Device,
    CommandQueue,
    CommandAllocator,
    CommandList,
    SwapChain,
}

impl InterfaceKind {
    pub const ALL: [InterfaceKind; 5] = [
        InterfaceKind::Device,
        InterfaceKind::CommandQueue,
        InterfaceKind::CommandAllocator,
        InterfaceKind::CommandList,
        InterfaceKind::SwapChain,
    ];

    /// Number of vtable entries copied for this interface.
    pub const fn slots(self) -> usize {
        match self {
            InterfaceKind::Device => 44,
            InterfaceKind::CommandQueue => 19,
            InterfaceKind::CommandAllocator => 9,
            InterfaceKind::CommandList => 60,
            InterfaceKind::SwapChain => 18,
        }
    }

    /// Index of this interface's first entry in the flat table.
    pub const fn offset(self) -> usize {
        match self {
            InterfaceKind::Device => 0,
            InterfaceKind::CommandQueue => InterfaceKind::Device.slots(),
            InterfaceKind::CommandAllocator => {
                InterfaceKind::CommandQueue.offset() + InterfaceKind::CommandQueue.slots()
            },
            InterfaceKind::CommandList => {
                InterfaceKind::CommandAllocator.offset() + InterfaceKind::CommandAllocator.slots()
            },
            InterfaceKind::SwapChain => {
                InterfaceKind::CommandList.offset() + InterfaceKind::CommandList.slots()
            },
        }
    }

    /// Flat table index of the `slot`-th method of this interface.
    pub const fn index(self, slot: usize) -> usize {
        self.offset() + slot
    }
}

/// Number of entries in a complete table.
pub const TABLE_LEN: usize = InterfaceKind::SwapChain.offset() + InterfaceKind::SwapChain.slots();

/// `ID3D12CommandQueue::ExecuteCommandLists`.
pub const EXECUTE_COMMAND_LISTS: usize = InterfaceKind::CommandQueue.index(10);
/// `IDXGISwapChain::Present`.
pub const PRESENT: usize = InterfaceKind::SwapChain.index(8);
/// `IDXGISwapChain::ResizeBuffers`.
pub const RESIZE_BUFFERS: usize = InterfaceKind::SwapChain.index(13);

/// Captured function addresses.
#[derive(Clone, PartialEq, Eq)]
pub struct DispatchTable(Vec<usize>);

impl DispatchTable {
    /// Build a table from an already flattened list of addresses, rejecting
    /// anything shorter than the layout the hooks index into.
    pub fn from_entries(entries: Vec<usize>) -> Result<Self> {
        if entries.len() < TABLE_LEN {
            return Err(Error::TableTooSmall { expected: TABLE_LEN, actual: entries.len() });
        }
        Ok(Self(entries))
    }

    /// Copy the leading vtable entries of one instance of each interface, in
    /// [`InterfaceKind::ALL`] order.
    ///
    /// Copying an interface stops at its first null entry, so a vtable shorter
    /// than the layout expects yields [`Error::TableTooSmall`] instead of
    /// shifting every later index onto an unrelated function.
    ///
    /// # Safety
    ///
    /// Every pointer must reference a live COM object whose vtable holds at
    /// least [`InterfaceKind::slots`] entries for its kind.
    pub unsafe fn capture(instances: [*mut c_void; 5]) -> Result<Self> {
        let mut entries = Vec::with_capacity(TABLE_LEN);

        for (kind, instance) in InterfaceKind::ALL.into_iter().zip(instances) {
            let vtable = read_vtable(instance).ok_or_else(|| {
                Error::unknown(format!("{kind:?} instance has no dispatch table"))
            })?;
            trace!("{kind:?} vtable at {vtable:p}, offset {}", kind.offset());

            let slots = std::slice::from_raw_parts(vtable, kind.slots());
            let live = slots.iter().take_while(|&&entry| entry != 0).count();
            if live < slots.len() {
                error!("{kind:?} vtable ends after {live} of {} entries", slots.len());
            }
            entries.extend_from_slice(&slots[..live]);
        }

        Self::from_entries(entries)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Result<*mut c_void> {
        self.0.get(index).map(|&addr| addr as *mut c_void).ok_or(Error::InvalidIndex(index))
    }

    pub fn entries(&self) -> &[usize] {
        &self.0
    }
}

impl fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchTable")
            .field("len", &self.0.len())
            .field("present", &format_args!("{:#x}", self.0[PRESENT]))
            .field("execute_command_lists", &format_args!("{:#x}", self.0[EXECUTE_COMMAND_LISTS]))
            .field("resize_buffers", &format_args!("{:#x}", self.0[RESIZE_BUFFERS]))
            .finish()
    }
}

/// Read the vtable pointer stored at the start of a COM object.
///
/// # Safety
///
/// `instance` must be null or point to a live COM object.
pub unsafe fn read_vtable(instance: *mut c_void) -> Option<*const usize> {
    if instance.is_null() {
        return None;
    }
    let vtable = *(instance as *const *const usize);
    (!vtable.is_null()).then_some(vtable)
}
