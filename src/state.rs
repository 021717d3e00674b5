//! Persisted runtime state for pods and containers.
//!
//! The phase tag follows a small re-enterable state machine:
//!
//! ```text
//!             start                stop
//!   ┌───────┐ ─────► ┌─────────┐ ─────► ┌─────────┐
//!   │ Ready │        │ Running │ ◄───── │ Stopped │
//!   └───┬───┘        └─────────┘  start └─────────┘
//!       │                 (restart)          ▲
//!       └────────────────────────────────────┘
//!              stop (never started, no-op path)
//! ```
//!
//! There is no `Deleted` phase: deletion removes the persisted resource
//! entirely, and absence is the terminal marker. The in-memory `State`
//! mirrors on-disk truth and is refreshed from storage before every
//! state-dependent operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Phase
// =============================================================================

/// Lifecycle phase of a pod or container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatePhase {
    /// Created but not started.
    Ready,
    /// Workload is running in the guest.
    Running,
    /// Stopped; may be started again.
    Stopped,
}

impl StatePhase {
    /// Validates a phase transition against the transition table.
    ///
    /// Pure function, no side effects: callers reject illegal requests
    /// before touching the agent, proxy, or hypervisor. `id` only
    /// labels the error.
    pub fn valid_transition(self, to: StatePhase, id: &str) -> Result<()> {
        let ok = matches!(
            (self, to),
            (StatePhase::Ready, StatePhase::Running)
                | (StatePhase::Stopped, StatePhase::Running)
                | (StatePhase::Running, StatePhase::Stopped)
                | (StatePhase::Ready, StatePhase::Stopped)
        );
        if ok {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                id: id.to_string(),
                from: self,
                to,
            })
        }
    }
}

impl std::fmt::Display for StatePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

// =============================================================================
// State
// =============================================================================

/// Persisted state of a pod or container.
///
/// Stored and reloaded atomically per (pod, container) key. Beyond the
/// phase tag it carries the proxy URL recorded at creation and the
/// rootfs hotplug bookkeeping that lets stop undo exactly what start
/// plugged in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    /// Current lifecycle phase.
    pub phase: StatePhase,
    /// Proxy URL for the owning VM's control connection.
    #[serde(default)]
    pub url: String,
    /// Guest block index assigned when the rootfs drive was hotplugged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_index: Option<u32>,
    /// Filesystem type of the hotplugged rootfs drive.
    #[serde(default)]
    pub fstype: String,
    /// Whether a rootfs drive was actually hotplugged.
    ///
    /// Gates the unplug call on stop so a skipped hotplug never turns
    /// into a spurious unplug.
    #[serde(default)]
    pub hotplugged_drive: bool,
}

impl State {
    /// Creates a state in the given phase with no hotplug bookkeeping.
    pub fn new(phase: StatePhase, url: impl Into<String>) -> Self {
        Self {
            phase,
            url: url.into(),
            block_index: None,
            fstype: String::new(),
            hotplugged_drive: false,
        }
    }

    /// Validates a transition of this state to `to`.
    pub fn valid_transition(&self, to: StatePhase, id: &str) -> Result<()> {
        self.phase.valid_transition(to, id)
    }
}

// =============================================================================
// Process
// =============================================================================

/// A shim-fronted guest process.
///
/// Created only when a shim is spawned. The token is the correlation
/// key tying Container ↔ Proxy session ↔ Shim instance; the PID is the
/// host-side shim process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
    /// Opaque proxy-issued session token.
    pub token: String,
    /// Host PID of the shim process.
    pub pid: i32,
    /// When the shim was spawned.
    pub start_time: DateTime<Utc>,
}

impl Process {
    /// Creates a process record for a freshly spawned shim.
    pub fn new(token: impl Into<String>, pid: i32) -> Self {
        Self {
            token: token.into(),
            pid,
            start_time: Utc::now(),
        }
    }
}
