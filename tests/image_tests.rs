//! Integration tests against disk image files.

mod common;

use blockmux::blockdev::VirtualBlockDevice;
use blockmux::device::{ImageDevice, PhysicalDevice};
use blockmux::partition::{resolve, scan, PartitionKind, PartitionScheme};
use blockmux::{ManagerConfig, Registry, VolumeManager};
use common::{gpt_image, mbr_image, MockEngine};
use rand::{Rng, SeedableRng};
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;

fn image_file(bytes: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(bytes).expect("write image");
    file.flush().expect("flush image");
    file
}

#[test]
fn test_scan_gpt_image_file() {
    let file = image_file(&gpt_image(512, 16384, &[(0, 2048, 4095), (5, 8192, 16000)]));
    let device = ImageDevice::read_only(file.path(), 512).unwrap();

    let scheme = scan(&device);
    let PartitionScheme::Gpt(table) = &scheme else {
        panic!("expected GPT, got {}", scheme.name());
    };
    let ids: Vec<usize> = table.populated().map(|(id, _)| id).collect();
    assert_eq!(ids, vec![0, 5]);
    assert!(matches!(table.get(5).unwrap().kind, PartitionKind::Gpt { .. }));

    let extent = resolve(5, &scheme).unwrap();
    assert_eq!(extent.offset, 8192);
    assert_eq!(extent.size, (16000 - 8192 + 1) * 512);

    // Unused slots resolve to an empty extent.
    assert_eq!(resolve(1, &scheme).unwrap().size, 0);
}

#[test]
fn test_scan_json_shape() {
    let file = image_file(&mbr_image(512, 4096, &[(2, 0x0C, 63, 1000)]));
    let device = ImageDevice::read_only(file.path(), 512).unwrap();
    let json = serde_json::to_value(scan(&device)).unwrap();

    assert_eq!(json["scheme"], "mbr");
    assert_eq!(json["table"]["entries"][2]["offset"], 63);
    assert_eq!(json["table"]["entries"][2]["kind"]["type"], "mbr");
    assert_eq!(json["table"]["entries"][0]["kind"]["type"], "empty");
}

#[test]
fn test_mount_image_and_persist() {
    let file = image_file(&mbr_image(512, 8192, &[(0, 0x83, 2048, 6144)]));
    let mgr = VolumeManager::new(Arc::new(MockEngine::new()), ManagerConfig::default()).unwrap();
    let device = Arc::new(ImageDevice::new(file.path(), 512).unwrap());

    mgr.mkfs(device.clone(), Some(0)).unwrap();
    mgr.mount(device.clone(), 0, "/sd").unwrap();
    assert_eq!(mgr.statfs("/sd").unwrap().total_blocks, 768);
    mgr.unmount("/sd").unwrap();

    let bytes = std::fs::read(file.path()).unwrap();
    assert_eq!(&bytes[1 << 20..(1 << 20) + 8], b"MOCKFS01");
    assert_eq!(&bytes[510..512], &[0x55, 0xAA]);
}

#[test]
fn test_random_blocks_round_trip_through_registry() {
    let file = image_file(&mbr_image(512, 8192, &[(1, 0x83, 4096, 4096)]));
    let device: Arc<dyn PhysicalDevice> = Arc::new(ImageDevice::new(file.path(), 512).unwrap());

    let scheme = scan(device.as_ref());
    let mut desc = VirtualBlockDevice::new(4096);
    desc.set_partition(resolve(1, &scheme).unwrap());

    let registry = Registry::new(&ManagerConfig::default());
    let slot = registry.allocate_slot().unwrap();
    registry.bind(slot, Arc::clone(&device), desc).unwrap();
    registry.open(slot).unwrap();
    let desc = registry.descriptor(slot).unwrap();
    assert_eq!(desc.first_block(), 512);
    assert_eq!(desc.block_count(), 512);

    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let mut written = Vec::new();
    for _ in 0..16 {
        let block = rng.gen_range(0..desc.block_count() - 4);
        let count = rng.gen_range(1..=4u32);
        let data: Vec<u8> = (0..desc.transfer_len(count)).map(|_| rng.gen()).collect();
        registry
            .write(slot, desc.first_block() + block, count, &data)
            .unwrap();
        written.push((block, count, data));
    }

    // Later writes may overlap earlier ones; verify only the last.
    let (block, count, data) = written.pop().unwrap();
    let mut buf = vec![0u8; data.len()];
    registry
        .read(slot, desc.first_block() + block, count, &mut buf)
        .unwrap();
    assert_eq!(buf, data);

    registry.close(slot).unwrap();
    registry.release_slot(slot).unwrap();

    let bytes = std::fs::read(file.path()).unwrap();
    let at = ((4096 + block * 8) * 512) as usize;
    assert_eq!(&bytes[at..at + data.len()], &data[..]);
}

#[test]
fn test_missing_image_fails_open() {
    let dir = tempfile::tempdir().unwrap();
    let device = ImageDevice::new(&dir.path().join("absent.img"), 512).unwrap();
    assert!(device.open().is_err());
    assert_eq!(scan(&device), PartitionScheme::None);
}
