//! Volume lifecycle operations scoped to a single cluster.
//!
//! [`AttachmentManager`] combines the provider clients with the ownership
//! filter, the state waiter and the device resolver. Every targeted operation
//! first re-reads the volume and refuses to touch anything the cluster does
//! not own.

mod cleanup;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use camino::Utf8PathBuf;
use tokio::sync::OnceCell;
use tracing::{info, warn};
use uuid::Uuid;

use crate::catalog::VolumeCatalog;
use crate::clock::Clock;
use crate::device::DevicePathResolver;
use crate::error::{BlockDeviceError, volume_lookup_error};
use crate::identity::LocalIdentity;
use crate::provider::{
    BlockDeviceId, BlockStorageApi, ComputeApi, CreateVolumeRequest, InstanceId, ProviderError,
    ProviderVolume, ResourceKind,
};
use crate::volume::{
    BYTES_PER_GIB, CLUSTER_ID_LABEL, DATASET_ID_LABEL, Volume, gib_to_bytes, size_to_gib, status,
    volume_name,
};
use crate::wait::{StateQuery, VolumeStateWaiter};

/// Convergence budget used when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Creates, attaches, detaches and destroys this cluster's volumes.
#[derive(Clone, Debug)]
pub struct AttachmentManager<B, C, K>
where
    K: Clock,
{
    block_storage: B,
    compute: C,
    waiter: VolumeStateWaiter<K>,
    catalog: VolumeCatalog,
    resolver: DevicePathResolver,
    timeout: Duration,
    identity: LocalIdentity,
    instance_id: OnceCell<InstanceId>,
}

impl<B, C, K> AttachmentManager<B, C, K>
where
    B: BlockStorageApi,
    C: ComputeApi,
    K: Clock,
{
    /// Creates a manager using [`DEFAULT_TIMEOUT`].
    ///
    /// The local instance is identified by [`LocalIdentity::default`], which
    /// owns no addresses; set a real identity with [`Self::with_identity`]
    /// before resolving device paths.
    #[must_use]
    pub const fn new(
        block_storage: B,
        compute: C,
        waiter: VolumeStateWaiter<K>,
        catalog: VolumeCatalog,
        resolver: DevicePathResolver,
    ) -> Self {
        Self {
            block_storage,
            compute,
            waiter,
            catalog,
            resolver,
            timeout: DEFAULT_TIMEOUT,
            identity: LocalIdentity::Addresses(BTreeSet::new()),
            instance_id: OnceCell::const_new(),
        }
    }

    /// Replaces the convergence timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replaces how the local compute instance is identified. Any instance
    /// id already resolved is forgotten.
    #[must_use]
    pub fn with_identity(mut self, identity: LocalIdentity) -> Self {
        self.identity = identity;
        self.instance_id = OnceCell::new();
        self
    }

    /// Block-storage client.
    #[must_use]
    pub const fn block_storage(&self) -> &B {
        &self.block_storage
    }

    /// Compute client.
    #[must_use]
    pub const fn compute(&self) -> &C {
        &self.compute
    }

    /// State waiter, including its clock.
    #[must_use]
    pub const fn waiter(&self) -> &VolumeStateWaiter<K> {
        &self.waiter
    }

    /// Ownership filter.
    #[must_use]
    pub const fn catalog(&self) -> &VolumeCatalog {
        &self.catalog
    }

    /// Local device resolver.
    #[must_use]
    pub const fn resolver(&self) -> &DevicePathResolver {
        &self.resolver
    }

    /// How the local compute instance is identified.
    #[must_use]
    pub const fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    /// Convergence timeout applied to every wait.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Granularity of volume sizes in bytes. Requests are rounded up to it.
    #[must_use]
    pub const fn allocation_unit(&self) -> u64 {
        BYTES_PER_GIB
    }

    /// Requests a new volume for `dataset_id` and returns without waiting.
    ///
    /// The returned volume carries the provider's initial status, normally
    /// `creating`. Use [`Self::wait_until_available`] before attaching.
    ///
    /// # Errors
    ///
    /// Returns [`BlockDeviceError::Validation`] for a zero size and
    /// [`BlockDeviceError::Provider`] when the create call fails.
    pub async fn create_volume(&self, dataset_id: Uuid, size: u64) -> Result<Volume, BlockDeviceError> {
        let size_gib = size_to_gib(size)
            .ok_or_else(|| BlockDeviceError::Validation(String::from("volume size must be positive")))?;
        let request = CreateVolumeRequest {
            size_gib,
            name: volume_name(dataset_id),
            metadata: BTreeMap::from([
                (String::from(CLUSTER_ID_LABEL), self.catalog.cluster_id().to_string()),
                (String::from(DATASET_ID_LABEL), dataset_id.to_string()),
            ]),
        };
        let created = self.block_storage.create(&request).await?;
        info!(
            volume_id = %created.id,
            dataset_id = %dataset_id,
            size_gib,
            status = %created.status,
            "requested volume"
        );
        Ok(Volume {
            blockdevice_id: created.id,
            dataset_id,
            size: gib_to_bytes(created.size_gib),
            status: created.status,
            attached_to: None,
        })
    }

    /// Lists every volume belonging to this cluster.
    ///
    /// # Errors
    ///
    /// Returns [`BlockDeviceError::Provider`] when the listing fails.
    pub async fn list_volumes(&self) -> Result<Vec<Volume>, BlockDeviceError> {
        let all = self.block_storage.list().await?;
        Ok(self.catalog.list_cluster_volumes(&all))
    }

    /// Waits for a newly created volume to become `available`.
    ///
    /// # Errors
    ///
    /// Returns [`BlockDeviceError::UnknownVolume`] for foreign or missing
    /// volumes and the waiter's errors otherwise.
    pub async fn wait_until_available(&self, volume_id: &BlockDeviceId) -> Result<Volume, BlockDeviceError> {
        self.owned_volume(volume_id).await?;
        let settled = self
            .waiter
            .wait_for_state(&self.block_storage, volume_id, &StateQuery::created(self.timeout))
            .await?;
        self.adopt(&settled)
    }

    /// Attaches an `available` volume to `instance_id` and waits for
    /// `in-use`.
    ///
    /// # Errors
    ///
    /// Returns [`BlockDeviceError::UnexpectedState`] when the volume is not
    /// `available` beforehand or falls back to `available` instead of
    /// attaching, [`BlockDeviceError::Timeout`] when it stays transient too
    /// long, and [`BlockDeviceError::UnknownVolume`] for foreign or missing
    /// volumes.
    pub async fn attach_volume(
        &self,
        volume_id: &BlockDeviceId,
        instance_id: &InstanceId,
    ) -> Result<Volume, BlockDeviceError> {
        let (_, current) = self.owned_volume(volume_id).await?;
        if current.status != status::AVAILABLE {
            return Err(BlockDeviceError::UnexpectedState {
                volume_id: volume_id.to_string(),
                observed: current.status.to_string(),
            });
        }

        let requested = self
            .compute
            .create_server_volume(instance_id, volume_id, None)
            .await
            .map_err(|err| volume_lookup_error(volume_id, err))?;
        info!(
            volume_id = %volume_id,
            instance_id = %instance_id,
            device = requested.device.as_deref().unwrap_or("<unassigned>"),
            "requested attachment"
        );

        let attached = self
            .waiter
            .wait_for_state(&self.block_storage, volume_id, &StateQuery::attached(self.timeout))
            .await?;
        info!(volume_id = %volume_id, instance_id = %instance_id, "volume attached");
        self.adopt(&attached)
    }

    /// Detaches a volume from whichever instance holds it and waits for it
    /// to become `available` again.
    ///
    /// # Errors
    ///
    /// Returns [`BlockDeviceError::UnattachedVolume`] when there is no
    /// attachment, [`BlockDeviceError::UnknownVolume`] for foreign or missing
    /// volumes, and the waiter's errors otherwise.
    pub async fn detach_volume(&self, volume_id: &BlockDeviceId) -> Result<(), BlockDeviceError> {
        let (provider_volume, _) = self.owned_volume(volume_id).await?;
        let server_id = provider_volume
            .attachment()
            .map(|attachment| attachment.server_id.clone())
            .ok_or_else(|| BlockDeviceError::UnattachedVolume {
                volume_id: volume_id.to_string(),
            })?;

        self.compute
            .delete_server_volume(&server_id, volume_id)
            .await
            .map_err(|err| detach_error(volume_id, err))?;
        info!(volume_id = %volume_id, instance_id = %server_id, "requested detach");

        self.waiter
            .wait_for_state(&self.block_storage, volume_id, &StateQuery::detached(self.timeout))
            .await?;
        info!(volume_id = %volume_id, "volume detached");
        Ok(())
    }

    /// Deletes a volume and waits until the provider no longer lists it.
    ///
    /// # Errors
    ///
    /// Returns [`BlockDeviceError::UnknownVolume`] for foreign or missing
    /// volumes, [`BlockDeviceError::Timeout`] when the volume outlives the
    /// timeout, and [`BlockDeviceError::UnexpectedState`] when deletion
    /// fails provider-side.
    pub async fn destroy_volume(&self, volume_id: &BlockDeviceId) -> Result<(), BlockDeviceError> {
        self.owned_volume(volume_id).await?;
        self.block_storage
            .delete(volume_id)
            .await
            .map_err(|err| volume_lookup_error(volume_id, err))?;
        info!(volume_id = %volume_id, "requested delete");

        self.waiter
            .wait_until_gone(&self.block_storage, volume_id, self.timeout)
            .await?;
        info!(volume_id = %volume_id, "volume destroyed");
        Ok(())
    }

    /// Identifier of the compute instance this process runs on.
    ///
    /// Resolved once through the compute client and cached for the lifetime
    /// of the manager. A failed lookup is not cached.
    ///
    /// # Errors
    ///
    /// Returns [`BlockDeviceError::UnknownInstance`] when no single server
    /// matches the local identity and [`BlockDeviceError::Provider`] when
    /// the server listing fails.
    pub async fn compute_instance_id(&self) -> Result<InstanceId, BlockDeviceError> {
        self.instance_id
            .get_or_try_init(|| async {
                let id = self.identity.resolve(&self.compute).await?;
                info!(instance_id = %id, "identified local compute instance");
                Ok::<_, BlockDeviceError>(id)
            })
            .await
            .cloned()
    }

    /// Instances the compute plane reports as running.
    ///
    /// # Errors
    ///
    /// Returns [`BlockDeviceError::Provider`] when the server listing fails.
    pub async fn list_live_nodes(&self) -> Result<Vec<InstanceId>, BlockDeviceError> {
        let servers = self.compute.list_servers().await?;
        Ok(servers
            .into_iter()
            .filter(|server| server.is_active())
            .map(|server| server.id)
            .collect())
    }

    /// Resolves the local device node of a volume attached to this instance.
    ///
    /// # Errors
    ///
    /// Returns [`BlockDeviceError::UnattachedVolume`] when the volume has no
    /// attachment, is attached to another instance, or no device can be
    /// found for it. Returns [`BlockDeviceError::UnknownVolume`] for foreign
    /// or missing volumes and [`BlockDeviceError::UnknownInstance`] when the
    /// local instance cannot be identified.
    pub async fn get_device_path(&self, volume_id: &BlockDeviceId) -> Result<Utf8PathBuf, BlockDeviceError> {
        let (provider_volume, _) = self.owned_volume(volume_id).await?;
        let attachment = provider_volume
            .attachment()
            .ok_or_else(|| BlockDeviceError::UnattachedVolume {
                volume_id: volume_id.to_string(),
            })?;
        let local = self.compute_instance_id().await?;
        self.resolver.resolve_attachment(volume_id, attachment, &local)
    }

    async fn owned_volume(
        &self,
        volume_id: &BlockDeviceId,
    ) -> Result<(ProviderVolume, Volume), BlockDeviceError> {
        let provider_volume = self
            .block_storage
            .get(volume_id)
            .await
            .map_err(|err| volume_lookup_error(volume_id, err))?;
        let volume = self.adopt(&provider_volume)?;
        Ok((provider_volume, volume))
    }

    fn adopt(&self, provider_volume: &ProviderVolume) -> Result<Volume, BlockDeviceError> {
        self.catalog.adopt(provider_volume).ok_or_else(|| {
            warn!(
                volume_id = %provider_volume.id,
                cluster_id = %self.catalog.cluster_id(),
                "refusing to operate on volume outside this cluster"
            );
            BlockDeviceError::UnknownVolume {
                volume_id: provider_volume.id.to_string(),
            }
        })
    }
}

fn detach_error(volume_id: &BlockDeviceId, err: ProviderError) -> BlockDeviceError {
    match err {
        ProviderError::NotFound {
            resource: ResourceKind::Attachment | ResourceKind::Server,
            ..
        } => BlockDeviceError::UnattachedVolume {
            volume_id: volume_id.to_string(),
        },
        other => volume_lookup_error(volume_id, other),
    }
}
