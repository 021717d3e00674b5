//! Collaborator contracts: hypervisor, agent, proxy, and shim drivers.
//!
//! The lifecycle core is a library invoked by a higher-level runtime;
//! it drives these four services but implements none of them. Every
//! driver call is awaited on the caller's task, and the core guarantees
//! the ordering contract: proxy connect always precedes the agent call
//! it brackets, and disconnect always follows it, on every exit path.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{Cmd, ContainerConfig, DeviceInfo};
use crate::device::BlockDrive;
use crate::error::Result;
use crate::state::Process;

// =============================================================================
// Signals
// =============================================================================

/// Signal to forward to a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    /// SIGTERM (graceful shutdown).
    Term,
    /// SIGKILL (force kill).
    Kill,
    /// SIGHUP (hangup).
    Hup,
    /// SIGINT (interrupt).
    Int,
    /// SIGUSR1.
    Usr1,
    /// SIGUSR2.
    Usr2,
}

impl Signal {
    /// Returns the signal number.
    #[cfg(unix)]
    pub fn as_i32(&self) -> i32 {
        match self {
            Self::Term => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
            Self::Hup => libc::SIGHUP,
            Self::Int => libc::SIGINT,
            Self::Usr1 => libc::SIGUSR1,
            Self::Usr2 => libc::SIGUSR2,
        }
    }

    #[cfg(not(unix))]
    pub fn as_i32(&self) -> i32 {
        match self {
            Self::Term => 15,
            Self::Kill => 9,
            Self::Hup => 1,
            Self::Int => 2,
            Self::Usr1 => 10,
            Self::Usr2 => 12,
        }
    }

    /// Whether the signal terminates the process group.
    ///
    /// On a never-started container only these degenerate into a local
    /// stop; anything else is a no-op there.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Term | Self::Kill)
    }

    /// Parses from a signal name (e.g. "SIGTERM", "TERM", "15").
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.to_uppercase();
        let s = s.strip_prefix("SIG").unwrap_or(&s);
        match s {
            "TERM" | "15" => Some(Self::Term),
            "KILL" | "9" => Some(Self::Kill),
            "HUP" | "1" => Some(Self::Hup),
            "INT" | "2" => Some(Self::Int),
            "USR1" | "10" => Some(Self::Usr1),
            "USR2" | "12" => Some(Self::Usr2),
            _ => None,
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Term => write!(f, "SIGTERM"),
            Self::Kill => write!(f, "SIGKILL"),
            Self::Hup => write!(f, "SIGHUP"),
            Self::Int => write!(f, "SIGINT"),
            Self::Usr1 => write!(f, "SIGUSR1"),
            Self::Usr2 => write!(f, "SIGUSR2"),
        }
    }
}

// =============================================================================
// Hypervisor
// =============================================================================

/// Capability set reported by a hypervisor driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HypervisorCapabilities {
    /// Whether block devices can be hotplugged into a running VM.
    pub block_hotplug: bool,
}

/// Hypervisor driver: boots and stops the pod's VM and hotplugs devices
/// into it.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Returns the hypervisor's capability set.
    fn capabilities(&self) -> HypervisorCapabilities;

    /// Boots the pod's VM.
    async fn start_vm(&self, pod_id: &str) -> Result<()>;

    /// Shuts the pod's VM down.
    async fn stop_vm(&self, pod_id: &str) -> Result<()>;

    /// Hotplugs a block drive into the running VM.
    ///
    /// Returns the guest block index assigned to the drive; the caller
    /// persists it so the drive can be unplugged precisely later.
    async fn hotplug_add_drive(&self, pod_id: &str, drive: &BlockDrive) -> Result<u32>;

    /// Unplugs a previously hotplugged block drive.
    async fn hotplug_remove_drive(&self, pod_id: &str, drive: &BlockDrive) -> Result<()>;

    /// Hotplugs a non-drive device into the running VM.
    async fn hotplug_add_device(&self, pod_id: &str, device: &DeviceInfo) -> Result<()>;

    /// Unplugs a previously hotplugged device.
    async fn hotplug_remove_device(&self, pod_id: &str, device: &DeviceInfo) -> Result<()>;
}

// =============================================================================
// Agent
// =============================================================================

/// Capability set reported by an in-guest agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgentCapabilities {
    /// Whether the agent can mount hotplugged block devices as a
    /// container rootfs.
    pub block_device: bool,
}

/// Options for listing the processes of a running container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessListOptions {
    /// Output format understood by the agent (e.g. "json", "table").
    #[serde(default)]
    pub format: String,
    /// Extra `ps` arguments forwarded to the guest.
    #[serde(default)]
    pub args: Vec<String>,
}

/// In-guest control channel: issues pod and container commands inside
/// the VM. Every call must be bracketed by a proxy session.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Returns the agent's capability set.
    fn capabilities(&self) -> AgentCapabilities;

    /// Runs pod-level guest setup after the VM has booted.
    async fn start_pod(&self, pod_id: &str) -> Result<()>;

    /// Runs pod-level guest teardown.
    async fn stop_pod(&self, pod_id: &str) -> Result<()>;

    /// Starts a container's workload in the guest.
    async fn start_container(
        &self,
        pod_id: &str,
        container_id: &str,
        config: &ContainerConfig,
        process: &Process,
    ) -> Result<()>;

    /// Stops a container's workload.
    async fn stop_container(&self, pod_id: &str, container_id: &str) -> Result<()>;

    /// Sends a signal to a container's workload.
    async fn kill_container(
        &self,
        pod_id: &str,
        container_id: &str,
        signal: Signal,
        all: bool,
    ) -> Result<()>;

    /// Executes an additional command inside a running container.
    async fn exec(
        &self,
        pod_id: &str,
        container_id: &str,
        process: &Process,
        cmd: &Cmd,
    ) -> Result<()>;

    /// Lists the processes of a running container.
    ///
    /// Returns the agent's formatted output verbatim.
    async fn process_list(
        &self,
        pod_id: &str,
        container_id: &str,
        options: &ProcessListOptions,
    ) -> Result<Vec<u8>>;
}

// =============================================================================
// Proxy
// =============================================================================

/// A per-operation proxy session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySession {
    /// Opaque session token, carried by the [`Process`] it spawns.
    pub token: String,
    /// URL of the proxy's control connection to the VM.
    pub url: String,
}

/// Host-side multiplexer owning the single control connection to the
/// VM. Connect is paired with a guaranteed disconnect around every
/// agent interaction.
#[async_trait]
pub trait Proxy: Send + Sync {
    /// Opens a session on the pod's control connection.
    async fn connect(&self, pod_id: &str, interactive: bool) -> Result<ProxySession>;

    /// Closes the current session.
    async fn disconnect(&self) -> Result<()>;
}

// =============================================================================
// Shim
// =============================================================================

/// Parameters for spawning a shim process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShimParams {
    /// Container the shim fronts.
    pub container_id: String,
    /// Proxy session token the shim authenticates with.
    pub token: String,
    /// Proxy URL the shim connects to.
    pub url: String,
    /// Console path to bind, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console: Option<String>,
    /// Whether the shim detaches from the caller.
    #[serde(default)]
    pub detach: bool,
}

/// Per-process console/IO bridge, one per active container process.
#[async_trait]
pub trait Shim: Send + Sync {
    /// Spawns a shim and returns its host PID.
    async fn start(&self, pod_id: &str, params: &ShimParams) -> Result<i32>;

    /// Whether the shim process is still alive.
    async fn is_running(&self, pid: i32) -> Result<bool>;

    /// Forcibly terminates the shim process.
    async fn stop(&self, pid: i32) -> Result<()>;

    /// Waits for the shim process to exit.
    ///
    /// Unbounded; callers wrap it in `tokio::time::timeout`.
    async fn wait(&self, pid: i32) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_parsing() {
        assert_eq!(Signal::parse("SIGTERM"), Some(Signal::Term));
        assert_eq!(Signal::parse("TERM"), Some(Signal::Term));
        assert_eq!(Signal::parse("15"), Some(Signal::Term));
        assert_eq!(Signal::parse("sigkill"), Some(Signal::Kill));
        assert_eq!(Signal::parse("INVALID"), None);
    }

    #[test]
    fn test_fatal_signals() {
        assert!(Signal::Term.is_fatal());
        assert!(Signal::Kill.is_fatal());
        assert!(!Signal::Hup.is_fatal());
        assert!(!Signal::Usr1.is_fatal());
    }
}
