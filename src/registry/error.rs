//! Registry error types.

use thiserror::Error;

use crate::runtime::RuntimeError;
use crate::volume::VolumeError;

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Failures while acquiring a user container. Errors here never kill the
/// daemon; the affected session exits nonzero.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}
