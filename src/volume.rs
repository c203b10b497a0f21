//! Cluster-level volume model and the naming convention tying provider
//! volumes to datasets.

use uuid::Uuid;

use crate::provider::{BlockDeviceId, InstanceId, VolumeStatus};

/// Prefix of every volume name this crate creates.
pub const VOLUME_NAME_PREFIX: &str = "flocker-";

/// Metadata key carrying the owning cluster's identifier.
pub const CLUSTER_ID_LABEL: &str = "flocker-cluster-id";

/// Metadata key carrying the dataset identifier.
pub const DATASET_ID_LABEL: &str = "flocker-dataset-id";

/// Provider allocates volumes in whole GiB.
pub const BYTES_PER_GIB: u64 = 1024 * 1024 * 1024;

/// Status names used by the lifecycle state machine.
pub mod status {
    /// Volume is being provisioned.
    pub const CREATING: &str = "creating";
    /// Volume exists and is not attached.
    pub const AVAILABLE: &str = "available";
    /// Attachment is in progress.
    pub const ATTACHING: &str = "attaching";
    /// Volume is attached to an instance.
    pub const IN_USE: &str = "in-use";
    /// Detachment is in progress.
    pub const DETACHING: &str = "detaching";
    /// Deletion is in progress.
    pub const DELETING: &str = "deleting";
    /// Provider failed to delete the volume.
    pub const ERROR_DELETING: &str = "error_deleting";
}

/// A volume owned by this cluster.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Volume {
    /// Provider identifier.
    pub blockdevice_id: BlockDeviceId,
    /// Dataset the volume backs.
    pub dataset_id: Uuid,
    /// Size in bytes.
    pub size: u64,
    /// Provider status at the time of the last fetch.
    pub status: VolumeStatus,
    /// Instance the volume is attached to, if any.
    pub attached_to: Option<InstanceId>,
}

/// Returns the provider-visible name for a dataset's volume.
#[must_use]
pub fn volume_name(dataset_id: Uuid) -> String {
    format!("{VOLUME_NAME_PREFIX}{dataset_id}")
}

/// Extracts the dataset identifier from a volume name, if it follows the
/// naming convention exactly. Only the lowercase hyphenated form that
/// [`volume_name`] produces is accepted.
#[must_use]
pub fn dataset_id_from_name(name: &str) -> Option<Uuid> {
    name.strip_prefix(VOLUME_NAME_PREFIX)
        .and_then(|suffix| Uuid::parse_str(suffix).ok())
        .filter(|dataset_id| volume_name(*dataset_id) == name)
}

/// Rounds a byte size up to whole GiB. Returns `None` for zero.
#[must_use]
pub const fn size_to_gib(size_bytes: u64) -> Option<u64> {
    if size_bytes == 0 {
        return None;
    }
    Some(size_bytes.div_ceil(BYTES_PER_GIB))
}

/// Converts a provider GiB size to bytes, saturating on overflow.
#[must_use]
pub const fn gib_to_bytes(size_gib: u64) -> u64 {
    size_gib.saturating_mul(BYTES_PER_GIB)
}
