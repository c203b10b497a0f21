//! Tests for device path resolution.

use std::fs;
use std::os::unix::fs::symlink;

use camino::{Utf8Path, Utf8PathBuf};
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::{DevicePathResolver, DeviceSnapshot, virtio_link_name};
use crate::error::BlockDeviceError;
use crate::provider::{BlockDeviceId, InstanceId, VolumeAttachment};

struct Namespace {
    _tmp: TempDir,
    dev: Utf8PathBuf,
    by_id: Utf8PathBuf,
    sys_block: Utf8PathBuf,
}

impl Namespace {
    fn resolver(&self) -> DevicePathResolver {
        DevicePathResolver::new(self.by_id.clone(), self.sys_block.clone())
    }

    fn add_node(&self, name: &str) -> Utf8PathBuf {
        let node = self.dev.join(name);
        fs::write(&node, b"").unwrap_or_else(|err| panic!("create node {node}: {err}"));
        node.canonicalize_utf8()
            .unwrap_or_else(|err| panic!("canonicalize {node}: {err}"))
    }

    fn link(&self, volume_id: &BlockDeviceId, target: &Utf8Path) {
        let link = self.by_id.join(virtio_link_name(volume_id));
        symlink(target, &link).unwrap_or_else(|err| panic!("symlink {link}: {err}"));
    }

    fn set_driver(&self, device: &str, driver: &str) {
        let device_dir = self.sys_block.join(device).join("device");
        let drivers = self.sys_block.join("drivers");
        fs::create_dir_all(&device_dir).unwrap_or_else(|err| panic!("sys dir: {err}"));
        fs::create_dir_all(drivers.join(driver)).unwrap_or_else(|err| panic!("driver dir: {err}"));
        symlink(drivers.join(driver), device_dir.join("driver"))
            .unwrap_or_else(|err| panic!("driver link: {err}"));
    }
}

#[fixture]
fn namespace() -> Namespace {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .unwrap_or_else(|path| panic!("non UTF-8 tempdir: {}", path.display()));
    let dev = root.join("dev");
    let by_id = dev.join("disk").join("by-id");
    let sys_block = root.join("sys").join("class").join("block");
    for dir in [&by_id, &sys_block] {
        fs::create_dir_all(dir).unwrap_or_else(|err| panic!("create {dir}: {err}"));
    }
    Namespace {
        _tmp: tmp,
        dev,
        by_id,
        sys_block,
    }
}

#[rstest]
#[case("0123456789", "virtio-0123456789")]
#[case(
    "3f0c1f5e-8f7d-4a71-9d4e-111111111111",
    "virtio-3f0c1f5e-8f7d-4a71-9"
)]
fn link_name_truncates_to_serial_length(#[case] id: &str, #[case] expected: &str) {
    assert_eq!(virtio_link_name(&BlockDeviceId::from(id)), expected);
}

#[rstest]
fn resolves_by_id_link_to_target(namespace: Namespace) {
    let id = BlockDeviceId::from("3f0c1f5e-8f7d-4a71-9d4e-222222222222");
    let node = namespace.add_node("vdc");
    namespace.link(&id, &node);

    let resolved = namespace
        .resolver()
        .resolve(&id, Some(Utf8Path::new("/dev/vdb")))
        .expect("link should resolve");

    assert_eq!(resolved, node);
}

#[rstest]
fn missing_link_is_unattached(namespace: Namespace) {
    let id = BlockDeviceId::from("vol-without-link");

    let err = namespace
        .resolver()
        .resolve(&id, None)
        .expect_err("no link present");

    assert_eq!(
        err,
        BlockDeviceError::UnattachedVolume {
            volume_id: String::from("vol-without-link")
        }
    );
}

#[rstest]
fn falls_back_to_reported_device_for_non_virtio_driver(namespace: Namespace) {
    let id = BlockDeviceId::from("xen-volume");
    let node = namespace.add_node("xvdb");
    namespace.set_driver("xvdb", "vbd");

    let resolved = namespace
        .resolver()
        .resolve(&id, Some(&node))
        .expect("reported device usable");

    assert_eq!(resolved, node);
}

#[rstest]
fn reported_virtio_device_is_not_trusted(namespace: Namespace) {
    let id = BlockDeviceId::from("virtio-volume");
    let node = namespace.add_node("vdb");
    namespace.set_driver("vdb", "virtio_blk");

    let err = namespace
        .resolver()
        .resolve(&id, Some(&node))
        .expect_err("virtio_blk ignores requested names");

    assert!(matches!(err, BlockDeviceError::UnattachedVolume { .. }));
}

#[rstest]
fn reported_device_absent_locally_is_unattached(namespace: Namespace) {
    let id = BlockDeviceId::from("not-yet-visible");
    let missing = namespace.dev.join("xvdz");

    let err = namespace
        .resolver()
        .resolve(&id, Some(&missing))
        .expect_err("device node missing");

    assert!(matches!(err, BlockDeviceError::UnattachedVolume { .. }));
}

#[rstest]
#[case("srv-local", true)]
#[case("srv-remote", false)]
fn attachment_resolves_only_on_the_owning_instance(
    namespace: Namespace,
    #[case] attached_to: &str,
    #[case] resolves: bool,
) {
    let id = BlockDeviceId::from("shared-name");
    let node = namespace.add_node("xvdb");
    namespace.set_driver("xvdb", "vbd");
    let attachment = VolumeAttachment {
        server_id: InstanceId::from(attached_to),
        device: Some(node.to_string()),
    };

    let result =
        namespace
            .resolver()
            .resolve_attachment(&id, &attachment, &InstanceId::from("srv-local"));

    if resolves {
        assert_eq!(result, Ok(node));
    } else {
        assert_eq!(
            result,
            Err(BlockDeviceError::UnattachedVolume {
                volume_id: String::from("shared-name")
            })
        );
    }
}

#[rstest]
fn snapshot_diff_finds_new_node(namespace: Namespace) {
    namespace.add_node("vda");
    let before = DeviceSnapshot::capture(&namespace.dev).expect("before");
    namespace.add_node("vdb");
    let after = DeviceSnapshot::capture(&namespace.dev).expect("after");

    assert_eq!(after.new_since(&before), vec![namespace.dev.join("vdb")]);
    assert!(before.new_since(&after).is_empty());
}

#[test]
fn snapshot_of_missing_directory_fails() {
    let err = DeviceSnapshot::capture(Utf8Path::new("/nonexistent/cinderblock/dev"))
        .expect_err("directory is missing");
    assert!(matches!(err, BlockDeviceError::Device { .. }));
}
