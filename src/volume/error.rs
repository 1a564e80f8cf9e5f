//! Volume provisioning error types.

use std::path::PathBuf;

use thiserror::Error;

use crate::runtime::RuntimeError;

/// Result type for volume operations.
pub type VolumeResult<T> = Result<T, VolumeError>;

#[derive(Debug, Error)]
pub enum VolumeError {
    /// The username cannot be used in a filesystem path or volume name.
    #[error("invalid username: {0:?}")]
    InvalidUser(String),

    /// A path exists where the subvolume should be, but is not one.
    #[error("{0} exists but is not a btrfs subvolume")]
    SubvolumeConflict(PathBuf),

    /// An external btrfs invocation failed.
    #[error("btrfs {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// The runtime refused a named-volume operation.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
