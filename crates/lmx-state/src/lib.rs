//! # lmx-state
//!
//! Durable runtime state for lmx.
//!
//! The persisted [`RuntimeState`] record answers two questions at startup:
//! which models were loaded when the previous process exited, and whether that
//! exit was clean. The [`CrashLoopDetector`] uses the startup history stored in
//! the same record to decide whether the server must come up in safe mode.

pub mod crash_loop;
pub mod identity;
pub mod record;
pub mod store;

pub use crash_loop::{CrashLoopDetector, CrashLoopVerdict};
pub use record::RuntimeState;
pub use store::{RuntimeStateStore, StartupRecord};

/// Errors raised by state persistence
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("State file {path} is owned by live process {pid}")]
    InUse { path: String, pid: u32 },
}

impl StateError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

impl From<StateError> for lmx_core::Error {
    fn from(err: StateError) -> Self {
        lmx_core::Error::state(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StateError>;
