//! Error types.

use std::fmt;

/// Errors produced while capturing the dispatch table, installing hooks or
/// building the overlay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A system library required to build the throwaway interfaces is not
    /// loaded in the current process.
    #[error("module {0} is not loaded in this process")]
    ModuleNotFound(&'static str),

    /// Catch-all for setup steps that failed for reasons we do not classify.
    #[error("{0}")]
    Unknown(String),

    /// The captured dispatch table is shorter than the layout we hook into.
    #[error("dispatch table holds {actual} entries, expected at least {expected}")]
    TableTooSmall { expected: usize, actual: usize },

    /// A dispatch index points outside the captured table.
    #[error("dispatch index {0} is out of range")]
    InvalidIndex(usize),

    /// A hook backend refused to create, enable or disable a detour.
    #[error("hook backend: {0}")]
    Hook(String),

    /// An image asset could not be decoded.
    #[error("could not decode image: {0}")]
    Decode(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Every shader-resource descriptor of the current heap is taken.
    #[error("descriptor slot {slot} exceeds heap capacity {capacity}")]
    HeapExhausted { slot: u32, capacity: u32 },

    /// The overlay is not initialized, typically because a resize is in
    /// progress.
    #[error("overlay is not initialized")]
    NotInitialized,

    #[cfg(windows)]
    #[error(transparent)]
    Windows(#[from] windows::core::Error),
}

/// Shorthand result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse status reported by the one-shot setup phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    ModuleNotFoundError,
    UnknownError,
}

impl Status {
    /// Collapse any result into the setup status taxonomy.
    pub fn of<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Status::Success,
            Err(e) => e.status(),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Success => "Success",
            Status::ModuleNotFoundError => "ModuleNotFoundError",
            Status::UnknownError => "UnknownError",
        };
        f.write_str(s)
    }
}

impl Error {
    pub fn status(&self) -> Status {
        match self {
            Error::ModuleNotFound(_) => Status::ModuleNotFoundError,
            _ => Status::UnknownError,
        }
    }

    pub(crate) fn unknown(context: impl fmt::Display) -> Self {
        Error::Unknown(context.to_string())
    }
}
