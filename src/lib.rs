//! Block-device lifecycle for cluster datasets on OpenStack Cinder.
//!
//! The crate creates, attaches, detaches and destroys volumes on behalf of a
//! single cluster sharing a cloud account with other tenants. Volumes are
//! recognised by a cluster tag and a `flocker-<dataset id>` name; anything
//! else is invisible. Provider state changes are asynchronous, so every
//! mutating call polls until the volume converges, fails fast when it leaves
//! the expected path, and reports a timeout only while progress is still
//! plausible.
//!
//! [`cinder::connect`] wires an [`AttachmentManager`] to the OpenStack HTTP
//! clients. Tests substitute [`test_support::FakeCloud`] and
//! [`test_support::ManualClock`].

pub mod catalog;
pub mod cinder;
pub mod clock;
pub mod config;
pub mod device;
pub mod error;
pub mod identity;
pub mod manager;
pub mod provider;
pub mod test_support;
pub mod volume;
pub mod wait;

pub use catalog::VolumeCatalog;
pub use cinder::{CinderClient, CinderManager, NovaClient, connect};
pub use clock::{Clock, SystemClock};
pub use config::{CinderConfig, ConfigError};
pub use device::{DevicePathResolver, DeviceSnapshot};
pub use error::{BlockDeviceError, ignore_absent};
pub use identity::LocalIdentity;
pub use manager::{AttachmentManager, DEFAULT_TIMEOUT};
pub use provider::{
    ApiVersion, BlockDeviceId, BlockStorageApi, ComputeApi, InstanceId, ProviderError,
    ProviderVolume, ServerSummary, VolumeStatus,
};
pub use volume::Volume;
pub use wait::{StateQuery, VolumeStateWaiter};
