//! OpenStack implementation of the provider traits.
//!
//! [`CinderClient`] speaks the Cinder v1 or v2 volume API and [`NovaClient`]
//! the Nova `os-volume_attachments` extension. Both authenticate with a
//! pre-issued token; obtaining that token is the caller's concern.

mod http;
mod nova;

use reqwest::Client;

use crate::catalog::VolumeCatalog;
use crate::clock::SystemClock;
use crate::config::{CinderConfig, ConfigError};
use crate::device::DevicePathResolver;
use crate::manager::AttachmentManager;
use crate::provider::adapter::{decode_volume, decode_volumes, encode_create};
use crate::provider::{
    ApiVersion, BlockDeviceId, BlockStorageApi, CreateVolumeRequest, ProviderError,
    ProviderFuture, ProviderVolume, ResourceKind,
};
use crate::wait::VolumeStateWaiter;

pub use nova::NovaClient;

/// Cinder block-storage client.
#[derive(Clone, Debug)]
pub struct CinderClient {
    http: Client,
    base_url: String,
    token: String,
    version: ApiVersion,
}

impl CinderClient {
    /// Creates a client for the given endpoint and API version.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Transport`] when the HTTP client cannot be
    /// built, for example when no TLS backend initialises.
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        version: ApiVersion,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            http: http::build_client()?,
            base_url: base_url.into(),
            token: token.into(),
            version,
        })
    }

    /// API version spoken by this client.
    #[must_use]
    pub const fn version(&self) -> ApiVersion {
        self.version
    }

    fn volume_url(&self, id: &BlockDeviceId) -> String {
        http::endpoint(&self.base_url, &format!("volumes/{id}"))
    }
}

impl BlockStorageApi for CinderClient {
    fn create<'a>(
        &'a self,
        request: &'a CreateVolumeRequest,
    ) -> ProviderFuture<'a, ProviderVolume> {
        Box::pin(async move {
            let body = encode_create(request, self.version)?;
            let response = http::send(
                self.http
                    .post(http::endpoint(&self.base_url, "volumes"))
                    .header(http::AUTH_HEADER, &self.token)
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(body),
                ResourceKind::Volume,
                &request.name,
            )
            .await?;
            decode_volume(&response, self.version)
        })
    }

    fn get<'a>(&'a self, id: &'a BlockDeviceId) -> ProviderFuture<'a, ProviderVolume> {
        Box::pin(async move {
            let response = http::send(
                self.http
                    .get(self.volume_url(id))
                    .header(http::AUTH_HEADER, &self.token),
                ResourceKind::Volume,
                id,
            )
            .await?;
            decode_volume(&response, self.version)
        })
    }

    fn delete<'a>(&'a self, id: &'a BlockDeviceId) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            http::send(
                self.http
                    .delete(self.volume_url(id))
                    .header(http::AUTH_HEADER, &self.token),
                ResourceKind::Volume,
                id,
            )
            .await
            .map(|_| ())
        })
    }

    fn list(&self) -> ProviderFuture<'_, Vec<ProviderVolume>> {
        Box::pin(async move {
            let response = http::send(
                self.http
                    .get(http::endpoint(&self.base_url, "volumes/detail"))
                    .header(http::AUTH_HEADER, &self.token),
                ResourceKind::Volume,
                "detail",
            )
            .await?;
            decode_volumes(&response, self.version)
        })
    }
}

/// Manager wired to the OpenStack clients and the system clock.
pub type CinderManager = AttachmentManager<CinderClient, NovaClient, SystemClock>;

/// Builds a production [`AttachmentManager`] from configuration.
///
/// # Errors
///
/// Returns [`ConfigError`] when the configuration fails validation or an
/// HTTP client cannot be built.
pub fn connect(config: &CinderConfig) -> Result<CinderManager, ConfigError> {
    config.validate()?;
    let cluster_id = config.cluster_uuid()?;
    let block_storage = CinderClient::new(
        config.block_storage_url.trim(),
        config.auth_token.trim(),
        config.api()?,
    )
    .map_err(|err| client_error(&err))?;
    let compute = NovaClient::new(config.compute_url.trim(), config.auth_token.trim())
        .map_err(|err| client_error(&err))?;
    Ok(AttachmentManager::new(
        block_storage,
        compute,
        VolumeStateWaiter::new(SystemClock::new(), config.poll_interval()),
        VolumeCatalog::new(cluster_id),
        DevicePathResolver::new(
            config.device_by_id_dir.trim(),
            config.sys_block_dir.trim(),
        ),
    )
    .with_timeout(config.timeout())
    .with_identity(config.identity()?))
}

fn client_error(err: &ProviderError) -> ConfigError {
    ConfigError::Client(err.to_string())
}
