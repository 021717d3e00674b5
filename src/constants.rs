//! Limits, timeouts, and on-disk layout for the lifecycle layer.
//!
//! These constants are the single source of truth for bounds enforced
//! during configuration validation and for the resource directory
//! layout shared by every [`crate::storage::Storage`] implementation.

use std::path::{Path, PathBuf};
use std::time::Duration;

// =============================================================================
// Identifier Limits
// =============================================================================

/// Maximum pod/container ID length.
///
/// IDs become filesystem path components; 128 characters accommodates
/// UUIDs and descriptive names without risking path-length issues.
pub const MAX_ID_LEN: usize = 128;

/// Valid characters for pod/container IDs.
///
/// Excludes `/`, `.`, and anything else usable for path traversal when
/// IDs are joined into resource paths.
pub const ID_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_";

/// Maximum containers per pod.
pub const MAX_CONTAINERS_PER_POD: usize = 256;

/// Maximum annotations per pod or container config.
pub const MAX_ANNOTATIONS: usize = 1024;

// =============================================================================
// Timeouts
// =============================================================================
//
// Calls into a potentially-wedged guest must not hang the caller
// forever. Agent and proxy round-trips are bounded by their drivers;
// the shim-exit wait is bounded here because the lifecycle layer owns
// that wait.
// =============================================================================

/// Bound on waiting for a shim process to exit during container stop.
///
/// Past the deadline the shim is forcibly terminated instead.
pub const SHIM_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Resource Directory Layout
// =============================================================================
//
// Two trees per pod, keyed by (pod ID, container ID):
//
//   <base>/run/pods/<pod>/<container>     volatile runtime resources
//   <base>/state/pods/<pod>/<container>   persisted configuration/state
//
// The default base targets system mode; embedders and tests override it
// via `PodConfig::base_dir`.
// =============================================================================

/// Default base directory for pod resources.
pub const DEFAULT_BASE_DIR: &str = "/var/lib/vmpod";

/// Subdirectory for volatile runtime resources.
pub const RUN_SUBDIR: &str = "run/pods";

/// Subdirectory for persisted configuration and state.
pub const STATE_SUBDIR: &str = "state/pods";

/// Returns the runtime directory for a pod, or a container within it.
pub fn run_path(base: &Path, pod_id: &str, container_id: Option<&str>) -> PathBuf {
    let mut p = base.join(RUN_SUBDIR).join(pod_id);
    if let Some(c) = container_id {
        p = p.join(c);
    }
    p
}

/// Returns the persistent config directory for a pod, or a container
/// within it.
pub fn config_path(base: &Path, pod_id: &str, container_id: Option<&str>) -> PathBuf {
    let mut p = base.join(STATE_SUBDIR).join(pod_id);
    if let Some(c) = container_id {
        p = p.join(c);
    }
    p
}

// =============================================================================
// ID Validation Helper
// =============================================================================

/// Validates a pod/container ID.
///
/// IDs must be non-empty, within [`MAX_ID_LEN`], and restricted to
/// [`ID_VALID_CHARS`].
#[must_use = "validation result must be checked before the ID reaches a path"]
pub fn validate_id(id: &str) -> std::result::Result<(), &'static str> {
    if id.is_empty() {
        return Err("ID cannot be empty");
    }
    if id.len() > MAX_ID_LEN {
        return Err("ID exceeds maximum length");
    }
    if !id.chars().all(|c| ID_VALID_CHARS.contains(c)) {
        return Err("ID contains invalid characters");
    }
    Ok(())
}
