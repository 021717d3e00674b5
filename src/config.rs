//! Pod and container configuration types.
//!
//! Configs are caller-supplied, validated before any I/O, and immutable
//! after creation: a `ContainerConfig` is owned exclusively by its
//! `Container` once the container exists.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::constants::{MAX_ANNOTATIONS, MAX_CONTAINERS_PER_POD, validate_id};
use crate::error::{Error, Result};

// =============================================================================
// Command
// =============================================================================

/// Command to run in a container, plus its console/session flags.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cmd {
    /// Argument vector; `args[0]` is the executable.
    pub args: Vec<String>,
    /// Environment variables.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory inside the container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,
    /// User to run as (uid or name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Console path for the shim to bind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console: Option<String>,
    /// Whether the session is interactive.
    #[serde(default)]
    pub interactive: bool,
    /// Whether the shim detaches from the caller.
    #[serde(default)]
    pub detach: bool,
}

// =============================================================================
// Mounts and Devices
// =============================================================================

/// A filesystem mount to set up for a container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mount {
    /// Host-side source path or block device.
    pub source: PathBuf,
    /// Destination inside the container.
    pub destination: PathBuf,
    /// Filesystem type.
    #[serde(default)]
    pub fs_type: String,
    /// fstab-style mount options.
    #[serde(default)]
    pub options: Vec<String>,
}

/// Kind of device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// Block device.
    Block,
    /// Character device.
    Char,
}

/// Description of a host device requested for a container.
///
/// Live [`crate::device::Device`] handles are instantiated from these
/// on first creation; afterwards the persisted device set takes
/// precedence so resources already attached in the guest are not
/// re-instantiated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Path the device appears at inside the container.
    pub container_path: PathBuf,
    /// Host path of the device node.
    pub host_path: PathBuf,
    /// Block or character device.
    pub dev_type: DeviceType,
    /// Device major number.
    pub major: i64,
    /// Device minor number.
    pub minor: i64,
}

// =============================================================================
// Container Configuration
// =============================================================================

/// Caller-supplied configuration for one container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Unique container ID within the pod. Required.
    pub id: String,
    /// Root filesystem path on the host.
    pub rootfs: PathBuf,
    /// Whether the rootfs is mounted read-only.
    #[serde(default)]
    pub readonly: bool,
    /// Initial command.
    pub cmd: Cmd,
    /// Freeform annotations.
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    /// Mounts to set up, in order.
    #[serde(default)]
    pub mounts: Vec<Mount>,
    /// Devices to attach.
    #[serde(default)]
    pub devices: Vec<DeviceInfo>,
}

impl ContainerConfig {
    /// Validates the configuration.
    ///
    /// Construction of a container fails on the first violation, before
    /// any directory is created or resource persisted.
    pub fn validate(&self) -> Result<()> {
        validate_id(&self.id)
            .map_err(|reason| Error::InvalidConfig(format!("container ID: {reason}")))?;
        if self.annotations.len() > MAX_ANNOTATIONS {
            return Err(Error::InvalidConfig(format!(
                "container '{}' exceeds {MAX_ANNOTATIONS} annotations",
                self.id
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Pod Configuration
// =============================================================================

/// Caller-supplied configuration for a pod and its member containers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodConfig {
    /// Unique pod ID. Required.
    pub id: String,
    /// Member container configurations.
    #[serde(default)]
    pub containers: Vec<ContainerConfig>,
    /// Freeform annotations.
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    /// Base directory for resource directories.
    ///
    /// Defaults to [`crate::constants::DEFAULT_BASE_DIR`]; embedders and
    /// tests point this at a private root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_dir: Option<PathBuf>,
}

impl PodConfig {
    /// Validates the pod configuration and every member config.
    pub fn validate(&self) -> Result<()> {
        validate_id(&self.id)
            .map_err(|reason| Error::InvalidConfig(format!("pod ID: {reason}")))?;
        if self.containers.len() > MAX_CONTAINERS_PER_POD {
            return Err(Error::InvalidConfig(format!(
                "pod '{}' exceeds {MAX_CONTAINERS_PER_POD} containers",
                self.id
            )));
        }
        if self.annotations.len() > MAX_ANNOTATIONS {
            return Err(Error::InvalidConfig(format!(
                "pod '{}' exceeds {MAX_ANNOTATIONS} annotations",
                self.id
            )));
        }
        for c in &self.containers {
            c.validate()?;
        }
        Ok(())
    }
}
