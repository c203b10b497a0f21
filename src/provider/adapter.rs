//! Wire adapter normalising Cinder v1 and v2 volume payloads.
//!
//! v1 calls the human-readable name `display_name`; v2 calls it `name`. Reads
//! check the version's own attribute first and fall back to the other, so a
//! proxy or mixed deployment still yields a name. Writes use exactly the
//! attribute the configured version expects.

use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use super::{
    BlockDeviceId, CreateVolumeRequest, InstanceId, ProviderError, ProviderVolume,
    ServerAttachment, ServerSummary, VolumeAttachment, VolumeStatus,
};

/// Block-storage API version spoken by the client.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ApiVersion {
    /// Cinder v1 (`display_name`).
    V1,
    /// Cinder v2 (`name`).
    #[default]
    V2,
}

impl ApiVersion {
    /// Attribute carrying the volume name for this version.
    #[must_use]
    pub const fn name_attribute(self) -> &'static str {
        match self {
            Self::V1 => "display_name",
            Self::V2 => "name",
        }
    }
}

impl TryFrom<u8> for ApiVersion {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            other => Err(other),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireAttachment {
    #[serde(default)]
    server_id: Option<String>,
    #[serde(default)]
    device: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireVolume {
    id: String,
    status: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
    #[serde(default)]
    attachments: Vec<WireAttachment>,
}

impl WireVolume {
    fn normalise(self, version: ApiVersion) -> ProviderVolume {
        let name = match version {
            ApiVersion::V1 => self.display_name.or(self.name),
            ApiVersion::V2 => self.name.or(self.display_name),
        };
        // v1 reports `[{}]` for some detached volumes.
        let attachments = self
            .attachments
            .into_iter()
            .filter_map(|attachment| {
                attachment.server_id.map(|server_id| VolumeAttachment {
                    server_id: InstanceId::from(server_id),
                    device: attachment.device,
                })
            })
            .collect();
        ProviderVolume {
            id: BlockDeviceId::from(self.id),
            status: VolumeStatus::from(self.status),
            size_gib: self.size,
            name,
            metadata: self.metadata,
            attachments,
        }
    }
}

#[derive(Deserialize)]
struct VolumeEnvelope {
    volume: WireVolume,
}

#[derive(Deserialize)]
struct VolumesEnvelope {
    volumes: Vec<WireVolume>,
}

#[derive(Serialize)]
struct WireCreateVolume<'a> {
    size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    display_name: Option<&'a str>,
    metadata: &'a BTreeMap<String, String>,
}

#[derive(Serialize)]
struct CreateVolumeEnvelope<'a> {
    volume: WireCreateVolume<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireAttachRequest<'a> {
    volume_id: &'a str,
    device: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AttachEnvelope<'a> {
    volume_attachment: WireAttachRequest<'a>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireServerAttachment {
    server_id: String,
    volume_id: String,
    #[serde(default)]
    device: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerAttachmentEnvelope {
    volume_attachment: WireServerAttachment,
}

#[derive(Deserialize)]
struct WireAddress {
    addr: String,
}

#[derive(Deserialize)]
struct WireServer {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    addresses: BTreeMap<String, Vec<WireAddress>>,
}

impl WireServer {
    fn normalise(self) -> ServerSummary {
        // Addresses are keyed by network name; only the addresses matter.
        let addresses = self
            .addresses
            .into_values()
            .flatten()
            .filter_map(|address| address.addr.parse::<IpAddr>().ok())
            .collect();
        ServerSummary {
            id: InstanceId::from(self.id),
            name: self.name,
            status: self.status,
            addresses,
        }
    }
}

#[derive(Deserialize)]
struct ServersEnvelope {
    servers: Vec<WireServer>,
}

fn decode_error(err: &serde_json::Error) -> ProviderError {
    ProviderError::Decode {
        message: err.to_string(),
    }
}

/// Encodes a create request using the attribute names of `version`.
///
/// # Errors
///
/// Returns [`ProviderError::Decode`] if serialisation fails.
pub fn encode_create(
    request: &CreateVolumeRequest,
    version: ApiVersion,
) -> Result<Vec<u8>, ProviderError> {
    let (name, display_name) = match version {
        ApiVersion::V1 => (None, Some(request.name.as_str())),
        ApiVersion::V2 => (Some(request.name.as_str()), None),
    };
    let envelope = CreateVolumeEnvelope {
        volume: WireCreateVolume {
            size: request.size_gib,
            name,
            display_name,
            metadata: &request.metadata,
        },
    };
    serde_json::to_vec(&envelope).map_err(|err| decode_error(&err))
}

/// Decodes a `{"volume": {...}}` response.
///
/// # Errors
///
/// Returns [`ProviderError::Decode`] when the payload is malformed.
pub fn decode_volume(body: &[u8], version: ApiVersion) -> Result<ProviderVolume, ProviderError> {
    serde_json::from_slice::<VolumeEnvelope>(body)
        .map(|envelope| envelope.volume.normalise(version))
        .map_err(|err| decode_error(&err))
}

/// Decodes a `{"volumes": [...]}` response.
///
/// # Errors
///
/// Returns [`ProviderError::Decode`] when the payload is malformed.
pub fn decode_volumes(
    body: &[u8],
    version: ApiVersion,
) -> Result<Vec<ProviderVolume>, ProviderError> {
    serde_json::from_slice::<VolumesEnvelope>(body)
        .map(|envelope| {
            envelope
                .volumes
                .into_iter()
                .map(|volume| volume.normalise(version))
                .collect()
        })
        .map_err(|err| decode_error(&err))
}

/// Encodes a compute `os-volume_attachments` request.
///
/// # Errors
///
/// Returns [`ProviderError::Decode`] if serialisation fails.
pub fn encode_attach(volume_id: &BlockDeviceId, device: Option<&str>) -> Result<Vec<u8>, ProviderError> {
    let envelope = AttachEnvelope {
        volume_attachment: WireAttachRequest {
            volume_id: volume_id.as_str(),
            device,
        },
    };
    serde_json::to_vec(&envelope).map_err(|err| decode_error(&err))
}

/// Decodes a compute `{"volumeAttachment": {...}}` response.
///
/// # Errors
///
/// Returns [`ProviderError::Decode`] when the payload is malformed.
pub fn decode_server_attachment(body: &[u8]) -> Result<ServerAttachment, ProviderError> {
    serde_json::from_slice::<ServerAttachmentEnvelope>(body)
        .map(|envelope| ServerAttachment {
            server_id: InstanceId::from(envelope.volume_attachment.server_id),
            volume_id: BlockDeviceId::from(envelope.volume_attachment.volume_id),
            device: envelope.volume_attachment.device,
        })
        .map_err(|err| decode_error(&err))
}

/// Decodes a compute `{"servers": [...]}` detail listing.
///
/// # Errors
///
/// Returns [`ProviderError::Decode`] when the payload is malformed.
pub fn decode_servers(body: &[u8]) -> Result<Vec<ServerSummary>, ProviderError> {
    serde_json::from_slice::<ServersEnvelope>(body)
        .map(|envelope| envelope.servers.into_iter().map(WireServer::normalise).collect())
        .map_err(|err| decode_error(&err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const V1_VOLUME: &str = r#"{"volume": {
        "id": "vol-1", "status": "in-use", "size": 10,
        "display_name": "flocker-abc",
        "metadata": {"flocker-cluster-id": "c1"},
        "attachments": [{"server_id": "srv-1", "device": "/dev/vdb"}]
    }}"#;

    const V2_VOLUME: &str = r#"{"volume": {
        "id": "vol-2", "status": "available", "size": 1,
        "name": "flocker-def", "metadata": {}, "attachments": []
    }}"#;

    #[test]
    fn v1_payload_uses_display_name() {
        let volume = decode_volume(V1_VOLUME.as_bytes(), ApiVersion::V1).expect("decode v1");
        assert_eq!(volume.name.as_deref(), Some("flocker-abc"));
        assert_eq!(volume.status, "in-use");
        assert_eq!(volume.size_gib, 10);
        let attachment = volume.attachment().expect("attachment");
        assert_eq!(attachment.server_id, "srv-1");
        assert_eq!(attachment.device.as_deref(), Some("/dev/vdb"));
    }

    #[test]
    fn v2_payload_uses_name() {
        let volume = decode_volume(V2_VOLUME.as_bytes(), ApiVersion::V2).expect("decode v2");
        assert_eq!(volume.name.as_deref(), Some("flocker-def"));
        assert!(volume.attachments.is_empty());
    }

    #[rstest]
    #[case(ApiVersion::V1, V2_VOLUME, "flocker-def")]
    #[case(ApiVersion::V2, V1_VOLUME, "flocker-abc")]
    fn name_lookup_falls_back_to_other_attribute(
        #[case] version: ApiVersion,
        #[case] body: &str,
        #[case] expected: &str,
    ) {
        let volume = decode_volume(body.as_bytes(), version).expect("decode");
        assert_eq!(volume.name.as_deref(), Some(expected));
    }

    #[test]
    fn missing_name_attributes_decode_as_none() {
        let body = br#"{"volumes": [{"id": "x", "status": "available", "name": null}]}"#;
        let volumes = decode_volumes(body, ApiVersion::V2).expect("decode list");
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes.first().and_then(|v| v.name.clone()), None);
    }

    #[test]
    fn empty_v1_attachment_records_are_dropped() {
        let body = br#"{"volume": {"id": "x", "status": "available", "attachments": [{}]}}"#;
        let volume = decode_volume(body, ApiVersion::V1).expect("decode");
        assert!(volume.attachment().is_none());
    }

    #[rstest]
    #[case(ApiVersion::V1, "display_name", "name")]
    #[case(ApiVersion::V2, "name", "display_name")]
    fn create_body_uses_version_attribute(
        #[case] version: ApiVersion,
        #[case] present: &str,
        #[case] absent: &str,
    ) {
        let request = CreateVolumeRequest {
            size_gib: 2,
            name: String::from("flocker-xyz"),
            metadata: BTreeMap::from([(String::from("k"), String::from("v"))]),
        };
        let bytes = encode_create(&request, version).expect("encode");
        let value: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        let volume = value.get("volume").expect("volume key");
        assert_eq!(volume.get(present).and_then(|v| v.as_str()), Some("flocker-xyz"));
        assert!(volume.get(absent).is_none());
        assert_eq!(volume.get("size").and_then(serde_json::Value::as_u64), Some(2));
        assert_eq!(version.name_attribute(), present);
    }

    #[test]
    fn attach_request_uses_compute_field_names() {
        let bytes = encode_attach(&BlockDeviceId::from("vol-1"), None).expect("encode");
        let value: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        let attachment = value.get("volumeAttachment").expect("envelope");
        assert_eq!(
            attachment.get("volumeId").and_then(|v| v.as_str()),
            Some("vol-1")
        );
        assert!(attachment.get("device").is_some_and(serde_json::Value::is_null));
    }

    #[test]
    fn server_attachment_decodes() {
        let body = br#"{"volumeAttachment": {"id": "a", "serverId": "srv", "volumeId": "vol", "device": "/dev/vdc"}}"#;
        let attachment = decode_server_attachment(body).expect("decode");
        assert_eq!(attachment.server_id, "srv");
        assert_eq!(attachment.volume_id, "vol");
        assert_eq!(attachment.device.as_deref(), Some("/dev/vdc"));
    }

    #[test]
    fn server_listing_flattens_network_addresses() {
        let body = br#"{"servers": [
            {"id": "srv-1", "name": "node-a", "status": "ACTIVE",
             "addresses": {"private": [{"addr": "10.0.0.5", "version": 4}],
                           "public": [{"addr": "2001:db8::5", "version": 6}]}},
            {"id": "srv-2", "name": "node-b", "status": "SHUTOFF", "addresses": {}}
        ]}"#;
        let servers = decode_servers(body).expect("decode servers");
        let [first, second] = servers.as_slice() else {
            panic!("expected two servers, got {servers:?}");
        };
        assert!(first.is_active());
        assert!(!second.is_active());
        assert_eq!(
            first.addresses,
            vec![
                "10.0.0.5".parse::<IpAddr>().expect("v4"),
                "2001:db8::5".parse::<IpAddr>().expect("v6"),
            ]
        );
        assert!(second.addresses.is_empty());
    }

    #[rstest]
    #[case(1, Ok(ApiVersion::V1))]
    #[case(2, Ok(ApiVersion::V2))]
    #[case(3, Err(3))]
    fn api_version_from_number(#[case] raw: u8, #[case] expected: Result<ApiVersion, u8>) {
        assert_eq!(ApiVersion::try_from(raw), expected);
    }
}
