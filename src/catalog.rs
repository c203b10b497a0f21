//! Ownership filter separating this cluster's volumes from everything else
//! in a shared cloud account.

use uuid::Uuid;

use crate::provider::{ProviderVolume, VolumeAttachment};
use crate::volume::{CLUSTER_ID_LABEL, DATASET_ID_LABEL, Volume, dataset_id_from_name, gib_to_bytes};

/// Recognises volumes created by this cluster.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VolumeCatalog {
    cluster_id: Uuid,
}

impl VolumeCatalog {
    /// Creates a catalog for the given cluster.
    #[must_use]
    pub const fn new(cluster_id: Uuid) -> Self {
        Self { cluster_id }
    }

    /// Cluster whose volumes this catalog admits.
    #[must_use]
    pub const fn cluster_id(&self) -> Uuid {
        self.cluster_id
    }

    /// Converts a provider volume into a cluster [`Volume`], or returns
    /// `None` when the volume is foreign.
    ///
    /// A volume is ours when its cluster tag matches, its name follows the
    /// `flocker-<dataset id>` convention, and any dataset metadata agrees with
    /// the name.
    #[must_use]
    pub fn adopt(&self, volume: &ProviderVolume) -> Option<Volume> {
        let tagged = volume
            .metadata
            .get(CLUSTER_ID_LABEL)
            .and_then(|value| Uuid::parse_str(value).ok())
            .is_some_and(|owner| owner == self.cluster_id);
        if !tagged {
            return None;
        }

        let dataset_id = volume.name.as_deref().and_then(dataset_id_from_name)?;
        let labelled = volume
            .metadata
            .get(DATASET_ID_LABEL)
            .map(|value| Uuid::parse_str(value).ok());
        if labelled.is_some_and(|parsed| parsed != Some(dataset_id)) {
            return None;
        }

        Some(Volume {
            blockdevice_id: volume.id.clone(),
            dataset_id,
            size: gib_to_bytes(volume.size_gib),
            status: volume.status.clone(),
            attached_to: volume
                .attachment()
                .map(|VolumeAttachment { server_id, .. }| server_id.clone()),
        })
    }

    /// Returns `true` when the volume belongs to this cluster.
    #[must_use]
    pub fn owns(&self, volume: &ProviderVolume) -> bool {
        self.adopt(volume).is_some()
    }

    /// Filters a full provider listing down to this cluster's volumes.
    #[must_use]
    pub fn list_cluster_volumes<'a, I>(&self, volumes: I) -> Vec<Volume>
    where
        I: IntoIterator<Item = &'a ProviderVolume>,
    {
        volumes
            .into_iter()
            .filter_map(|volume| self.adopt(volume))
            .collect()
    }
}
