//! Attachable devices and host block-device resolution.
//!
//! Devices are polymorphic over attach/detach, dispatched by kind, and
//! bound 1:1 with the container that requested them. The serde tag
//! keeps the persisted device set self-describing, so a reattached
//! container reconstructs exactly the variants it had before restart.
//! New kinds are added as new variants without touching container
//! logic.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{DeviceInfo, DeviceType};
use crate::drivers::Hypervisor;
use crate::error::Result;

// =============================================================================
// Block Drive
// =============================================================================

/// A block drive as presented to the hypervisor for hotplug.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockDrive {
    /// Host device path backing the drive.
    pub device_path: PathBuf,
    /// Guest block index; assigned by the hypervisor on hotplug.
    #[serde(default)]
    pub index: u32,
}

/// Host mount information resolved for a path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockMount {
    /// Device major number.
    pub major: i64,
    /// Device minor number.
    pub minor: i64,
    /// Mount point the path lives under.
    pub mount_point: PathBuf,
}

/// Resolves host paths to the block devices backing them.
///
/// `device_for_path` fails with [`crate::error::Error::MountNotFound`]
/// when no mount backs the path; the rootfs hotplug path treats that as
/// a non-fatal skip rather than an error.
#[async_trait]
pub trait DeviceResolver: Send + Sync {
    /// Resolves the mount backing `path`.
    async fn device_for_path(&self, path: &Path) -> Result<BlockMount>;

    /// Whether (major, minor) is a device-mapper volume.
    async fn is_device_mapper(&self, major: i64, minor: i64) -> Result<bool>;

    /// Returns the device path and filesystem type for a mount point.
    async fn device_path_and_fstype(&self, mount_point: &Path) -> Result<(PathBuf, String)>;
}

// =============================================================================
// Device Variants
// =============================================================================

/// A hotpluggable block device bound to a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDevice {
    /// The requesting config entry.
    pub info: DeviceInfo,
    /// Guest block index assigned on attach.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    /// Whether the device is currently attached in the guest.
    #[serde(default)]
    pub attached: bool,
}

/// A non-drive device, hotplugged into the VM as-is; the agent exposes
/// it to the container from the guest's device tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenericDevice {
    /// The requesting config entry.
    pub info: DeviceInfo,
    /// Whether the device is currently attached.
    #[serde(default)]
    pub attached: bool,
}

/// Polymorphic attachable/detachable device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Device {
    /// Block device, hotplugged through the hypervisor.
    Block(BlockDevice),
    /// Character or other device, no hypervisor hotplug.
    Generic(GenericDevice),
}

impl Device {
    /// Instantiates a live device handle from a config entry.
    ///
    /// First-creation path only: once a device set has been persisted,
    /// the persisted set takes precedence on reattachment.
    pub fn from_info(info: DeviceInfo) -> Self {
        match info.dev_type {
            DeviceType::Block => Self::Block(BlockDevice {
                info,
                index: None,
                attached: false,
            }),
            DeviceType::Char => Self::Generic(GenericDevice {
                info,
                attached: false,
            }),
        }
    }

    /// The config entry this device was built from.
    pub fn info(&self) -> &DeviceInfo {
        match self {
            Self::Block(d) => &d.info,
            Self::Generic(d) => &d.info,
        }
    }

    /// Whether the device is currently attached.
    pub fn is_attached(&self) -> bool {
        match self {
            Self::Block(d) => d.attached,
            Self::Generic(d) => d.attached,
        }
    }

    /// Attaches the device for `pod_id` through the hypervisor.
    ///
    /// Idempotent: attaching an already-attached device is a no-op, so
    /// a retried start never double-plugs a device that survived in the
    /// guest.
    pub async fn attach(&mut self, pod_id: &str, hypervisor: &dyn Hypervisor) -> Result<()> {
        match self {
            Self::Block(d) => {
                if d.attached {
                    return Ok(());
                }
                let drive = BlockDrive {
                    device_path: d.info.host_path.clone(),
                    index: 0,
                };
                let index = hypervisor.hotplug_add_drive(pod_id, &drive).await?;
                d.index = Some(index);
                d.attached = true;
                debug!(
                    pod = %pod_id,
                    device = %d.info.container_path.display(),
                    index,
                    "block device attached"
                );
                Ok(())
            }
            Self::Generic(d) => {
                if d.attached {
                    return Ok(());
                }
                hypervisor.hotplug_add_device(pod_id, &d.info).await?;
                d.attached = true;
                debug!(
                    pod = %pod_id,
                    device = %d.info.container_path.display(),
                    "device attached"
                );
                Ok(())
            }
        }
    }

    /// Detaches the device through the hypervisor.
    ///
    /// No-op when the device is not attached.
    pub async fn detach(&mut self, pod_id: &str, hypervisor: &dyn Hypervisor) -> Result<()> {
        match self {
            Self::Block(d) => {
                if !d.attached {
                    return Ok(());
                }
                let drive = BlockDrive {
                    device_path: d.info.host_path.clone(),
                    index: d.index.unwrap_or(0),
                };
                hypervisor.hotplug_remove_drive(pod_id, &drive).await?;
                d.index = None;
                d.attached = false;
                debug!(
                    pod = %pod_id,
                    device = %d.info.container_path.display(),
                    "block device detached"
                );
                Ok(())
            }
            Self::Generic(d) => {
                if !d.attached {
                    return Ok(());
                }
                hypervisor.hotplug_remove_device(pod_id, &d.info).await?;
                d.attached = false;
                Ok(())
            }
        }
    }
}
