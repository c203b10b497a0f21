//! Provider client abstractions for the block-storage and compute planes.
//!
//! Everything above this module works with [`ProviderVolume`], a single
//! normalised view of a provider volume. The [`adapter`] submodule is the only
//! place that knows how the wire representation differs across API versions.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

pub mod adapter;
mod types;

pub use adapter::ApiVersion;
pub use types::{BlockDeviceId, InstanceId, VolumeStatus};

/// Future returned by provider operations.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

/// Kind of provider resource named in a [`ProviderError::NotFound`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResourceKind {
    /// A block-storage volume.
    Volume,
    /// A compute instance.
    Server,
    /// A volume attachment record on a compute instance.
    Attachment,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Volume => "volume",
            Self::Server => "server",
            Self::Attachment => "attachment",
        };
        f.write_str(name)
    }
}

/// Errors raised by provider clients.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProviderError {
    /// Raised when the provider has no record of the addressed resource.
    #[error("{resource} {id} not found")]
    NotFound {
        /// Kind of resource that was addressed.
        resource: ResourceKind,
        /// Identifier that was addressed.
        id: String,
    },
    /// Raised when the provider rejects a request.
    #[error("provider returned status {status}: {message}")]
    Api {
        /// HTTP status code returned by the provider.
        status: u16,
        /// Response body or summary.
        message: String,
    },
    /// Raised when the request could not be delivered.
    #[error("transport error: {message}")]
    Transport {
        /// Message from the HTTP client.
        message: String,
    },
    /// Raised when a provider response cannot be decoded.
    #[error("failed to decode provider response: {message}")]
    Decode {
        /// Parser error message.
        message: String,
    },
}

/// Attachment record as reported by the block-storage plane.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeAttachment {
    /// Instance the volume is attached to.
    pub server_id: InstanceId,
    /// Device name the provider believes the volume was given, if any.
    pub device: Option<String>,
}

/// Normalised view of a provider volume, independent of API version.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProviderVolume {
    /// Provider identifier.
    pub id: BlockDeviceId,
    /// Current provider status.
    pub status: VolumeStatus,
    /// Size in GiB as reported by the provider.
    pub size_gib: u64,
    /// Human-readable name, whichever attribute carried it.
    pub name: Option<String>,
    /// Free-form metadata attached at creation.
    pub metadata: BTreeMap<String, String>,
    /// Current attachments.
    pub attachments: Vec<VolumeAttachment>,
}

impl ProviderVolume {
    /// Returns the first attachment record, if any.
    #[must_use]
    pub fn attachment(&self) -> Option<&VolumeAttachment> {
        self.attachments.first()
    }
}

/// Parameters for a provider volume creation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreateVolumeRequest {
    /// Size in GiB.
    pub size_gib: u64,
    /// Human-readable name.
    pub name: String,
    /// Metadata stored alongside the volume.
    pub metadata: BTreeMap<String, String>,
}

/// Attachment record returned by the compute plane.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerAttachment {
    /// Instance the volume was attached to.
    pub server_id: InstanceId,
    /// Volume that was attached.
    pub volume_id: BlockDeviceId,
    /// Device name chosen by the compute plane.
    pub device: Option<String>,
}

/// Compute instance as listed by the compute plane.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerSummary {
    /// Instance identifier.
    pub id: InstanceId,
    /// Human-readable name.
    pub name: String,
    /// Compute status such as `ACTIVE` or `SHUTOFF`.
    pub status: String,
    /// Every address assigned to the instance, across all networks.
    pub addresses: Vec<IpAddr>,
}

impl ServerSummary {
    /// Status the compute plane reports for a running instance.
    pub const ACTIVE: &'static str = "ACTIVE";

    /// Returns `true` when the instance is running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == Self::ACTIVE
    }
}

/// Block-storage control plane operations.
pub trait BlockStorageApi: Send + Sync {
    /// Creates a volume and returns its initial state.
    fn create<'a>(&'a self, request: &'a CreateVolumeRequest)
    -> ProviderFuture<'a, ProviderVolume>;

    /// Fetches a volume by identifier.
    fn get<'a>(&'a self, id: &'a BlockDeviceId) -> ProviderFuture<'a, ProviderVolume>;

    /// Requests deletion of a volume. Deletion completes asynchronously.
    fn delete<'a>(&'a self, id: &'a BlockDeviceId) -> ProviderFuture<'a, ()>;

    /// Lists every volume visible to the account.
    fn list(&self) -> ProviderFuture<'_, Vec<ProviderVolume>>;
}

/// Compute control plane operations used for attachment.
pub trait ComputeApi: Send + Sync {
    /// Attaches a volume to a server. `device` is a hint that some guest
    /// drivers ignore.
    fn create_server_volume<'a>(
        &'a self,
        server_id: &'a InstanceId,
        volume_id: &'a BlockDeviceId,
        device: Option<&'a str>,
    ) -> ProviderFuture<'a, ServerAttachment>;

    /// Detaches a volume from a server.
    fn delete_server_volume<'a>(
        &'a self,
        server_id: &'a InstanceId,
        volume_id: &'a BlockDeviceId,
    ) -> ProviderFuture<'a, ()>;

    /// Lists every server visible to the account.
    fn list_servers(&self) -> ProviderFuture<'_, Vec<ServerSummary>>;
}

impl<T: BlockStorageApi + ?Sized> BlockStorageApi for std::sync::Arc<T> {
    fn create<'a>(
        &'a self,
        request: &'a CreateVolumeRequest,
    ) -> ProviderFuture<'a, ProviderVolume> {
        (**self).create(request)
    }

    fn get<'a>(&'a self, id: &'a BlockDeviceId) -> ProviderFuture<'a, ProviderVolume> {
        (**self).get(id)
    }

    fn delete<'a>(&'a self, id: &'a BlockDeviceId) -> ProviderFuture<'a, ()> {
        (**self).delete(id)
    }

    fn list(&self) -> ProviderFuture<'_, Vec<ProviderVolume>> {
        (**self).list()
    }
}

impl<T: ComputeApi + ?Sized> ComputeApi for std::sync::Arc<T> {
    fn create_server_volume<'a>(
        &'a self,
        server_id: &'a InstanceId,
        volume_id: &'a BlockDeviceId,
        device: Option<&'a str>,
    ) -> ProviderFuture<'a, ServerAttachment> {
        (**self).create_server_volume(server_id, volume_id, device)
    }

    fn delete_server_volume<'a>(
        &'a self,
        server_id: &'a InstanceId,
        volume_id: &'a BlockDeviceId,
    ) -> ProviderFuture<'a, ()> {
        (**self).delete_server_volume(server_id, volume_id)
    }

    fn list_servers(&self) -> ProviderFuture<'_, Vec<ServerSummary>> {
        (**self).list_servers()
    }
}
