//! Error types for the pod/container lifecycle layer.

use std::path::PathBuf;

use crate::state::StatePhase;

/// Result type alias for lifecycle operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the pod/container lifecycle layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid pod or container configuration.
    ///
    /// Raised before any I/O or side effect.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // =========================================================================
    // State Machine Errors
    // =========================================================================
    /// Requested phase transition is not in the transition table.
    #[error("container '{id}': invalid state transition from '{from}' to '{to}'")]
    InvalidTransition {
        id: String,
        from: StatePhase,
        to: StatePhase,
    },

    /// Pod or container is in the wrong phase for the operation.
    #[error("'{id}' is in state '{current}', expected {expected}")]
    InvalidState {
        id: String,
        current: StatePhase,
        expected: String,
    },

    /// Pod not found in storage.
    #[error("pod not found: {0}")]
    PodNotFound(String),

    /// Container not found (no in-memory member or no persisted state).
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    // =========================================================================
    // Session Errors
    // =========================================================================
    /// Proxy session URL does not match the pod's recorded URL.
    ///
    /// A mismatch means the session belongs to a stale or foreign proxy
    /// instance; spawning a shim against it would bridge the wrong VM.
    #[error("proxy session URL '{actual}' does not match pod URL '{expected}'")]
    UrlMismatch { expected: String, actual: String },

    // =========================================================================
    // Device Errors
    // =========================================================================
    /// No mount point backs the given path.
    ///
    /// The rootfs hotplug path treats this as a non-fatal skip.
    #[error("mount point not found for path: {}", path.display())]
    MountNotFound { path: PathBuf },

    /// Device is not in a state where the operation applies.
    #[error("device '{id}': {reason}")]
    DeviceOp { id: String, reason: String },

    // =========================================================================
    // Collaborator Errors
    // =========================================================================
    /// Hypervisor driver call failed.
    #[error("hypervisor: {0}")]
    Hypervisor(String),

    /// Agent command failed inside the guest.
    #[error("agent: {0}")]
    Agent(String),

    /// Proxy connect/disconnect failed.
    #[error("proxy: {0}")]
    Proxy(String),

    /// Shim process operation failed.
    #[error("shim: {0}")]
    Shim(String),

    /// Storage fetch/store/delete failed.
    #[error("storage: {0}")]
    Storage(String),

    // =========================================================================
    // Timeout Errors
    // =========================================================================
    /// Bounded wait expired.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Filesystem error while managing resource directories.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error on a persisted resource.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
