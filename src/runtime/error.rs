//! Container runtime error types.

use thiserror::Error;

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors surfaced by the container runtime facade.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime API is unreachable.
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    /// The runtime rejected container creation.
    #[error("failed to create container: {0}")]
    CreateFailed(String),

    /// The runtime rejected starting the container.
    #[error("failed to start container {id}: {message}")]
    StartFailed { id: String, message: String },

    /// Opening or starting an exec instance failed.
    #[error("failed to exec in container {id}: {message}")]
    ExecFailed { id: String, message: String },

    /// Attaching an additional network failed; the container is removed.
    #[error("failed to connect container to network {network}: {message}")]
    NetworkAttachFailed { network: String, message: String },

    /// The referenced container, exec or volume does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Any other runtime API failure.
    #[error("runtime api error: {0}")]
    Api(String),
}
