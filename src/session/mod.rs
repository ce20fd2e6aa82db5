//! Crash-safe record of the active rental.
//!
//! The record lives in `session.json` inside a state directory. Every public
//! operation takes an in-process mutex and an exclusive `flock` on the sibling
//! `session.lock`, performs its read-modify-write, and releases both before
//! returning. Writes go to a temporary file in the same directory that is
//! renamed over the target, so readers never observe a partial document.

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

mod lock;
mod model;
mod store;

pub use lock::LockRetry;
pub use model::{CURRENT_VERSION, Cost, Deadman, Instance, Model, SessionState, Tunnel};
pub use store::{LOCK_FILE_NAME, STATE_FILE_NAME, SessionStore};

/// Errors raised by [`SessionStore`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SessionError {
    /// Raised when another process holds the session lock.
    #[error("session state is locked by another process ({path}); retry once it finishes")]
    StateLocked {
        /// Lock file that could not be acquired.
        path: Utf8PathBuf,
    },
    /// Raised when the state file exists but cannot be parsed. The file is
    /// left untouched.
    #[error(
        "session state file {path} is corrupt and was left untouched: {message}; \
         inspect it, terminate any running instance, then remove the file"
    )]
    StateCorrupt {
        /// Corrupt state file.
        path: Utf8PathBuf,
        /// Parser error message.
        message: String,
    },
    /// Raised when a mutator runs without a session or required sub-record.
    #[error("no active instance: {0}")]
    NoActiveInstance(String),
    /// Raised when `save` is called without a state.
    #[error("refusing to save an absent session state")]
    MissingState,
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the state cannot be serialised.
    #[error("failed to serialise session state: {0}")]
    Serialize(String),
}

impl SessionError {
    pub(crate) fn io(path: &Utf8Path, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests;
