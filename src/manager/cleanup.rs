//! Best-effort teardown used by callers that do not know how far a volume
//! got through its lifecycle.

use tracing::info;

use super::AttachmentManager;
use crate::clock::Clock;
use crate::error::{BlockDeviceError, ignore_absent};
use crate::provider::{BlockDeviceId, BlockStorageApi, ComputeApi};

impl<B, C, K> AttachmentManager<B, C, K>
where
    B: BlockStorageApi,
    C: ComputeApi,
    K: Clock,
{
    /// Detaches a volume, treating an already detached or missing volume as
    /// done. Returns `true` when a detach was performed.
    ///
    /// # Errors
    ///
    /// Propagates every error other than an absent attachment or volume.
    pub async fn best_effort_detach(&self, volume_id: &BlockDeviceId) -> Result<bool, BlockDeviceError> {
        ignore_absent(self.detach_volume(volume_id).await).map(|done| done.is_some())
    }

    /// Destroys a volume, treating a missing volume as done. Returns `true`
    /// when a delete was performed.
    ///
    /// # Errors
    ///
    /// Propagates every error other than an unknown volume.
    pub async fn best_effort_destroy(&self, volume_id: &BlockDeviceId) -> Result<bool, BlockDeviceError> {
        ignore_absent(self.destroy_volume(volume_id).await).map(|done| done.is_some())
    }

    /// Detaches then destroys a volume, tolerating either step having
    /// already happened.
    ///
    /// # Errors
    ///
    /// Propagates the first error that is not an absent-resource condition.
    pub async fn cleanup_volume(&self, volume_id: &BlockDeviceId) -> Result<(), BlockDeviceError> {
        let detached = self.best_effort_detach(volume_id).await?;
        let destroyed = self.best_effort_destroy(volume_id).await?;
        info!(volume_id = %volume_id, detached, destroyed, "cleaned up volume");
        Ok(())
    }
}
