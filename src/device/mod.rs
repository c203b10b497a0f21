//! Local block-device path resolution for attached volumes.
//!
//! `virtio_blk` guests ignore the device name requested by the compute plane,
//! so the only stable handle is the udev-managed link
//! `/dev/disk/by-id/virtio-<serial>`, where the serial is the volume id
//! truncated to the guest kernel's 20-character limit. Xen-style drivers
//! honour the requested name, so the provider-reported device is usable there
//! as long as it exists and is not driven by `virtio_blk`.

use std::collections::BTreeSet;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use tracing::debug;

use crate::error::BlockDeviceError;
use crate::provider::{BlockDeviceId, InstanceId, VolumeAttachment};

/// Default device-identity directory.
pub const DEFAULT_BY_ID_DIR: &str = "/dev/disk/by-id";

/// Default sysfs block class directory.
pub const DEFAULT_SYS_BLOCK_DIR: &str = "/sys/class/block";

/// Prefix udev gives virtio disk identity links.
pub const VIRTIO_LINK_PREFIX: &str = "virtio-";

/// Longest serial a virtio disk exposes to the guest.
pub const VIRTIO_SERIAL_LEN: usize = 20;

const VIRTIO_BLK_DRIVER: &str = "virtio_blk";

/// Returns the by-id link name for a volume on a `virtio_blk` guest.
#[must_use]
pub fn virtio_link_name(volume_id: &BlockDeviceId) -> String {
    let serial = volume_id
        .chars()
        .take(VIRTIO_SERIAL_LEN)
        .collect::<String>();
    format!("{VIRTIO_LINK_PREFIX}{serial}")
}

fn io_error(path: &Utf8Path, err: &io::Error) -> BlockDeviceError {
    BlockDeviceError::Device {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

/// Maps attached volumes to device nodes on this instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DevicePathResolver {
    by_id_dir: Utf8PathBuf,
    sys_block_dir: Utf8PathBuf,
}

impl Default for DevicePathResolver {
    fn default() -> Self {
        Self::new(DEFAULT_BY_ID_DIR, DEFAULT_SYS_BLOCK_DIR)
    }
}

impl DevicePathResolver {
    /// Creates a resolver rooted at the given directories.
    #[must_use]
    pub fn new(by_id_dir: impl Into<Utf8PathBuf>, sys_block_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            by_id_dir: by_id_dir.into(),
            sys_block_dir: sys_block_dir.into(),
        }
    }

    /// Resolves the local device for an attached volume.
    ///
    /// The by-id link wins when present. Otherwise `reported_device`, the
    /// name the provider recorded for the attachment, is used if it exists
    /// locally and is not a `virtio_blk` disk.
    ///
    /// # Errors
    ///
    /// Returns [`BlockDeviceError::UnattachedVolume`] when neither scheme
    /// yields a device, and [`BlockDeviceError::Device`] when the namespace
    /// cannot be read.
    pub fn resolve(
        &self,
        volume_id: &BlockDeviceId,
        reported_device: Option<&Utf8Path>,
    ) -> Result<Utf8PathBuf, BlockDeviceError> {
        let link = self.by_id_dir.join(virtio_link_name(volume_id));
        match link.canonicalize_utf8() {
            Ok(target) => {
                debug!(volume_id = %volume_id, link = %link, device = %target, "resolved by-id link");
                return Ok(target);
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(io_error(&link, &err)),
        }

        if let Some(device) = reported_device {
            if let Some(resolved) = self.usable_reported_device(device)? {
                debug!(volume_id = %volume_id, device = %resolved, "using provider-reported device");
                return Ok(resolved);
            }
        }

        Err(BlockDeviceError::UnattachedVolume {
            volume_id: volume_id.to_string(),
        })
    }

    /// Resolves the device of `attachment` when it belongs to `local`.
    ///
    /// An attachment held by another instance has no device here, even if a
    /// node of the same name happens to exist.
    ///
    /// # Errors
    ///
    /// Returns [`BlockDeviceError::UnattachedVolume`] for an attachment to
    /// another instance, and the errors of [`Self::resolve`] otherwise.
    pub fn resolve_attachment(
        &self,
        volume_id: &BlockDeviceId,
        attachment: &VolumeAttachment,
        local: &InstanceId,
    ) -> Result<Utf8PathBuf, BlockDeviceError> {
        if attachment.server_id != *local {
            debug!(
                volume_id = %volume_id,
                attached_to = %attachment.server_id,
                local = %local,
                "volume is attached to another instance"
            );
            return Err(BlockDeviceError::UnattachedVolume {
                volume_id: volume_id.to_string(),
            });
        }
        self.resolve(volume_id, attachment.device.as_deref().map(Utf8Path::new))
    }

    fn usable_reported_device(
        &self,
        device: &Utf8Path,
    ) -> Result<Option<Utf8PathBuf>, BlockDeviceError> {
        let resolved = match device.canonicalize_utf8() {
            Ok(resolved) => resolved,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error(device, &err)),
        };
        if self.is_virtio_blk(&resolved)? {
            return Ok(None);
        }
        Ok(Some(resolved))
    }

    /// Returns `true` when sysfs reports the device is driven by
    /// `virtio_blk`.
    ///
    /// # Errors
    ///
    /// Returns [`BlockDeviceError::Device`] when the driver link exists but
    /// cannot be read.
    pub fn is_virtio_blk(&self, device: &Utf8Path) -> Result<bool, BlockDeviceError> {
        let Some(name) = device.file_name() else {
            return Ok(false);
        };
        let driver_link = self.sys_block_dir.join(name).join("device").join("driver");
        match driver_link.read_link_utf8() {
            Ok(target) => Ok(target.file_name() == Some(VIRTIO_BLK_DRIVER)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(io_error(&driver_link, &err)),
        }
    }
}

/// Set of device nodes present in a directory at one point in time.
///
/// A caller that controls attachment timing can capture a snapshot before and
/// after attaching and diff them to find the new node.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DeviceSnapshot {
    nodes: BTreeSet<Utf8PathBuf>,
}

impl DeviceSnapshot {
    /// Lists the entries of `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`BlockDeviceError::Device`] when the directory cannot be read.
    pub fn capture(dir: &Utf8Path) -> Result<Self, BlockDeviceError> {
        let handle =
            Dir::open_ambient_dir(dir, ambient_authority()).map_err(|err| io_error(dir, &err))?;
        let mut nodes = BTreeSet::new();
        for entry in handle.entries().map_err(|err| io_error(dir, &err))? {
            let name = entry
                .and_then(|entry| entry.file_name())
                .map_err(|err| io_error(dir, &err))?;
            nodes.insert(dir.join(name));
        }
        Ok(Self { nodes })
    }

    /// Nodes in the snapshot.
    #[must_use]
    pub const fn nodes(&self) -> &BTreeSet<Utf8PathBuf> {
        &self.nodes
    }

    /// Nodes present now that were absent in `before`.
    #[must_use]
    pub fn new_since(&self, before: &Self) -> Vec<Utf8PathBuf> {
        self.nodes.difference(&before.nodes).cloned().collect()
    }
}

#[cfg(test)]
mod tests;
