//! Shared HTTP plumbing for the Cinder and Nova clients.

use std::time::Duration;

use reqwest::{Client, RequestBuilder};

use crate::provider::{ProviderError, ResourceKind};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
pub(super) const AUTH_HEADER: &str = "X-Auth-Token";

/// Builds the HTTP client shared by every request of one provider client.
pub(super) fn build_client() -> Result<Client, ProviderError> {
    Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|err| transport(&err))
}

pub(super) fn endpoint(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

fn transport(err: &reqwest::Error) -> ProviderError {
    ProviderError::Transport {
        message: err.to_string(),
    }
}

/// Maps an HTTP status to success or a provider error.
pub(super) fn classify(
    status: u16,
    body: &[u8],
    resource: ResourceKind,
    id: &str,
) -> Result<(), ProviderError> {
    match status {
        200..=299 => Ok(()),
        404 => Err(ProviderError::NotFound {
            resource,
            id: id.to_owned(),
        }),
        _ => Err(ProviderError::Api {
            status,
            message: String::from_utf8_lossy(body).into_owned(),
        }),
    }
}

/// Sends a request and returns the body of a successful response.
pub(super) async fn send(
    request: RequestBuilder,
    resource: ResourceKind,
    id: &str,
) -> Result<Vec<u8>, ProviderError> {
    let response = request.send().await.map_err(|err| transport(&err))?;
    let status = response.status().as_u16();
    let body = response.bytes().await.map_err(|err| transport(&err))?;
    classify(status, &body, resource, id)?;
    Ok(body.to_vec())
}
