//! OpenStack clients exercised against a local HTTP server speaking the
//! Cinder and Nova wire formats.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::time::Duration;

use cinderblock::provider::{CreateVolumeRequest, ServerAttachment};
use cinderblock::test_support::ManualClock;
use cinderblock::volume::{CLUSTER_ID_LABEL, DATASET_ID_LABEL, volume_name};
use cinderblock::{
    ApiVersion, AttachmentManager, BlockDeviceError, BlockDeviceId, BlockStorageApi,
    CinderClient, ComputeApi, DevicePathResolver, InstanceId, LocalIdentity, NovaClient,
    VolumeCatalog, VolumeStateWaiter,
};
use rstest::rstest;
use serde_json::{Value, json};
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOKEN: &str = "gAAAAABtoken";
const CLUSTER: Uuid = Uuid::from_u128(0x6f1a_3e0b_5d55_4b7a_8a64_2d8c_2b3e_9c11);
const DATASET: Uuid = Uuid::from_u128(0x1234_5678_9abc_4def_8123_4567_89ab_cdef);

fn version_number(version: ApiVersion) -> u8 {
    match version {
        ApiVersion::V1 => 1,
        ApiVersion::V2 => 2,
    }
}

fn volume_prefix(version: ApiVersion) -> String {
    format!("/v{}/proj", version_number(version))
}

fn cinder(server: &MockServer, version: ApiVersion) -> CinderClient {
    CinderClient::new(
        format!("{}{}", server.uri(), volume_prefix(version)),
        TOKEN,
        version,
    )
    .unwrap_or_else(|err| panic!("cinder client: {err}"))
}

fn nova(server: &MockServer) -> NovaClient {
    NovaClient::new(format!("{}/v2.1/proj", server.uri()), TOKEN)
        .unwrap_or_else(|err| panic!("nova client: {err}"))
}

fn cluster_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        (String::from(CLUSTER_ID_LABEL), CLUSTER.to_string()),
        (String::from(DATASET_ID_LABEL), DATASET.to_string()),
    ])
}

fn volume_body(version: ApiVersion, id: &str, status: &str, server_id: Option<&str>) -> Value {
    let attachments = server_id.map_or_else(Vec::new, |server_id| {
        vec![json!({"server_id": server_id, "device": "/dev/vdb"})]
    });
    let mut volume = json!({
        "id": id,
        "status": status,
        "size": 2,
        "metadata": cluster_labels(),
        "attachments": attachments,
    });
    volume[version.name_attribute()] = json!(volume_name(DATASET));
    volume
}

fn manager(server: &MockServer) -> AttachmentManager<CinderClient, NovaClient, ManualClock> {
    AttachmentManager::new(
        cinder(server, ApiVersion::V2),
        nova(server),
        VolumeStateWaiter::new(ManualClock::new(), Duration::from_secs(1)),
        VolumeCatalog::new(CLUSTER),
        DevicePathResolver::default(),
    )
    .with_timeout(Duration::from_secs(10))
}

#[rstest]
#[case(ApiVersion::V1, "display_name", "name")]
#[case(ApiVersion::V2, "name", "display_name")]
#[tokio::test]
async fn create_writes_the_versioned_name_attribute(
    #[case] version: ApiVersion,
    #[case] attribute: &str,
    #[case] other_attribute: &str,
) {
    let server = MockServer::start().await;
    let mut expected_volume = json!({"size": 2, "metadata": cluster_labels()});
    expected_volume[attribute] = json!(volume_name(DATASET));
    Mock::given(method("POST"))
        .and(path(format!("{}/volumes", volume_prefix(version))))
        .and(header("X-Auth-Token", TOKEN))
        .and(header("Content-Type", "application/json"))
        .and(body_partial_json(json!({ "volume": expected_volume })))
        .respond_with(
            ResponseTemplate::new(202)
                .set_body_json(json!({"volume": volume_body(version, "vol-1", "creating", None)})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let created = cinder(&server, version)
        .create(&CreateVolumeRequest {
            size_gib: 2,
            name: volume_name(DATASET),
            metadata: cluster_labels(),
        })
        .await
        .unwrap_or_else(|err| panic!("create: {err}"));

    assert_eq!(created.id, "vol-1");
    assert_eq!(created.status, "creating");
    assert_eq!(created.name, Some(volume_name(DATASET)));
    let requests = server
        .received_requests()
        .await
        .unwrap_or_else(|| panic!("request recording disabled"));
    let [request] = requests.as_slice() else {
        panic!("expected one request, got {}", requests.len());
    };
    let body: Value = request
        .body_json()
        .unwrap_or_else(|err| panic!("request body: {err}"));
    assert!(
        body["volume"].get(other_attribute).is_none(),
        "unexpected {other_attribute} in {body}"
    );
}

#[rstest]
#[case(ApiVersion::V1)]
#[case(ApiVersion::V2)]
#[tokio::test]
async fn get_and_list_decode_volumes(#[case] version: ApiVersion) {
    let server = MockServer::start().await;
    let prefix = volume_prefix(version);
    Mock::given(method("GET"))
        .and(path(format!("{prefix}/volumes/vol-1")))
        .and(header("X-Auth-Token", TOKEN))
        .respond_with(ResponseTemplate::new(200).set_body_json(
            json!({"volume": volume_body(version, "vol-1", "in-use", Some("srv-1"))}),
        ))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{prefix}/volumes/detail")))
        .and(header("X-Auth-Token", TOKEN))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"volumes": [
            volume_body(version, "vol-1", "in-use", Some("srv-1")),
            {"id": "vol-2", "status": "available", "size": 1, "attachments": [{}]},
        ]})))
        .expect(1)
        .mount(&server)
        .await;
    let client = cinder(&server, version);

    let volume = client
        .get(&BlockDeviceId::from("vol-1"))
        .await
        .unwrap_or_else(|err| panic!("get: {err}"));
    let listed = client
        .list()
        .await
        .unwrap_or_else(|err| panic!("list: {err}"));

    assert_eq!(volume.status, "in-use");
    assert_eq!(volume.size_gib, 2);
    assert_eq!(volume.name, Some(volume_name(DATASET)));
    let attachment = volume
        .attachment()
        .unwrap_or_else(|| panic!("attachment expected"));
    assert_eq!(attachment.server_id, "srv-1");
    assert_eq!(attachment.device.as_deref(), Some("/dev/vdb"));
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0], volume);
    assert_eq!(listed[1].name, None);
    assert!(listed[1].attachments.is_empty());
}

#[rstest]
#[tokio::test]
async fn delete_targets_the_volume_url() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/v2/proj/volumes/vol-1"))
        .and(header("X-Auth-Token", TOKEN))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    cinder(&server, ApiVersion::V2)
        .delete(&BlockDeviceId::from("vol-1"))
        .await
        .unwrap_or_else(|err| panic!("delete: {err}"));
}

#[rstest]
#[tokio::test]
async fn attach_and_detach_use_the_server_attachment_collection() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2.1/proj/servers/srv-1/os-volume_attachments"))
        .and(header("X-Auth-Token", TOKEN))
        .and(body_partial_json(
            json!({"volumeAttachment": {"volumeId": "vol-1"}}),
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "volumeAttachment": {
                "id": "vol-1",
                "serverId": "srv-1",
                "volumeId": "vol-1",
                "device": "/dev/vdb",
            }
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/v2.1/proj/servers/srv-1/os-volume_attachments/vol-1"))
        .and(header("X-Auth-Token", TOKEN))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;
    let client = nova(&server);
    let (server_id, volume_id) = (InstanceId::from("srv-1"), BlockDeviceId::from("vol-1"));

    let attachment = client
        .create_server_volume(&server_id, &volume_id, None)
        .await
        .unwrap_or_else(|err| panic!("attach: {err}"));
    client
        .delete_server_volume(&server_id, &volume_id)
        .await
        .unwrap_or_else(|err| panic!("detach: {err}"));

    assert_eq!(
        attachment,
        ServerAttachment {
            server_id,
            volume_id,
            device: Some(String::from("/dev/vdb")),
        }
    );
}

#[rstest]
#[tokio::test]
async fn server_listing_reports_status_and_addresses() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2.1/proj/servers/detail"))
        .and(header("X-Auth-Token", TOKEN))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"servers": [
            {"id": "srv-1", "name": "node-a", "status": "ACTIVE",
             "addresses": {"private": [{"addr": "10.0.0.4", "version": 4}]}},
            {"id": "srv-2", "name": "node-b", "status": "SHUTOFF", "addresses": {}},
        ]})))
        .expect(1)
        .mount(&server)
        .await;

    let servers = nova(&server)
        .list_servers()
        .await
        .unwrap_or_else(|err| panic!("list servers: {err}"));

    assert_eq!(servers.len(), 2);
    assert!(servers[0].is_active());
    let private: IpAddr = "10.0.0.4"
        .parse()
        .unwrap_or_else(|err| panic!("address: {err}"));
    assert_eq!(servers[0].addresses, vec![private]);
    assert!(!servers[1].is_active());
}

#[rstest]
#[tokio::test]
async fn missing_volume_is_unknown_to_the_manager() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/proj/volumes/vol-gone"))
        .respond_with(ResponseTemplate::new(404).set_body_string("Volume could not be found"))
        .mount(&server)
        .await;

    let err = manager(&server)
        .destroy_volume(&BlockDeviceId::from("vol-gone"))
        .await
        .expect_err("volume does not exist");

    assert_eq!(
        err,
        BlockDeviceError::UnknownVolume {
            volume_id: String::from("vol-gone")
        }
    );
}

#[rstest]
#[tokio::test]
async fn missing_attachment_is_unattached_to_the_manager() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/proj/volumes/vol-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(
            json!({"volume": volume_body(ApiVersion::V2, "vol-1", "in-use", Some("srv-1"))}),
        ))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/v2.1/proj/servers/srv-1/os-volume_attachments/vol-1"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let err = manager(&server)
        .detach_volume(&BlockDeviceId::from("vol-1"))
        .await
        .expect_err("attachment already gone");

    assert_eq!(
        err,
        BlockDeviceError::UnattachedVolume {
            volume_id: String::from("vol-1")
        }
    );
}

#[rstest]
#[tokio::test]
async fn volume_on_another_server_has_no_local_device() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/proj/volumes/vol-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(
            json!({"volume": volume_body(ApiVersion::V2, "vol-1", "in-use", Some("srv-2"))}),
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2.1/proj/servers/detail"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"servers": [
            {"id": "srv-1", "status": "ACTIVE",
             "addresses": {"private": [{"addr": "10.0.0.4"}]}},
            {"id": "srv-2", "status": "ACTIVE",
             "addresses": {"private": [{"addr": "10.0.0.5"}]}},
        ]})))
        .expect(1)
        .mount(&server)
        .await;
    let local: IpAddr = "10.0.0.4"
        .parse()
        .unwrap_or_else(|err| panic!("address: {err}"));
    let manager = manager(&server).with_identity(LocalIdentity::Addresses(BTreeSet::from([local])));

    let err = manager
        .get_device_path(&BlockDeviceId::from("vol-1"))
        .await
        .expect_err("attached to srv-2");

    assert_eq!(
        err,
        BlockDeviceError::UnattachedVolume {
            volume_id: String::from("vol-1")
        }
    );
    assert_eq!(manager.compute_instance_id().await, Ok(InstanceId::from("srv-1")));
}
