//! Nova volume attachment client.

use reqwest::Client;

use super::http;
use crate::provider::adapter::{decode_server_attachment, decode_servers, encode_attach};
use crate::provider::{
    BlockDeviceId, ComputeApi, InstanceId, ProviderError, ProviderFuture, ResourceKind,
    ServerAttachment, ServerSummary,
};

/// Compute client for attaching and detaching volumes.
#[derive(Clone, Debug)]
pub struct NovaClient {
    http: Client,
    base_url: String,
    token: String,
}

impl NovaClient {
    /// Creates a client for the given compute endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Transport`] when the HTTP client cannot be
    /// built.
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            http: http::build_client()?,
            base_url: base_url.into(),
            token: token.into(),
        })
    }

    fn attachments_url(&self, server_id: &InstanceId) -> String {
        http::endpoint(
            &self.base_url,
            &format!("servers/{server_id}/os-volume_attachments"),
        )
    }
}

impl ComputeApi for NovaClient {
    fn create_server_volume<'a>(
        &'a self,
        server_id: &'a InstanceId,
        volume_id: &'a BlockDeviceId,
        device: Option<&'a str>,
    ) -> ProviderFuture<'a, ServerAttachment> {
        Box::pin(async move {
            let body = encode_attach(volume_id, device)?;
            let response = http::send(
                self.http
                    .post(self.attachments_url(server_id))
                    .header(http::AUTH_HEADER, &self.token)
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(body),
                ResourceKind::Server,
                server_id,
            )
            .await?;
            decode_server_attachment(&response)
        })
    }

    fn delete_server_volume<'a>(
        &'a self,
        server_id: &'a InstanceId,
        volume_id: &'a BlockDeviceId,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let url = format!("{}/{volume_id}", self.attachments_url(server_id));
            http::send(
                self.http.delete(url).header(http::AUTH_HEADER, &self.token),
                ResourceKind::Attachment,
                volume_id,
            )
            .await
            .map(|_| ())
        })
    }

    fn list_servers(&self) -> ProviderFuture<'_, Vec<ServerSummary>> {
        Box::pin(async move {
            let response = http::send(
                self.http
                    .get(http::endpoint(&self.base_url, "servers/detail"))
                    .header(http::AUTH_HEADER, &self.token),
                ResourceKind::Server,
                "detail",
            )
            .await?;
            decode_servers(&response)
        })
    }
}
