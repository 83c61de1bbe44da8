// Integration tests for the disklabel engine: build disk images in a temp
// file, drive the engine through probe -> create -> commit -> re-probe, and
// check the exact bytes and in-memory model that come back out.

use diskforge_core::device::FileBlockDevice;
use diskforge_core::geometry::Geometry;
use diskforge_disklabel::tree::{DeviceNode, DisklabelVariant, Handle};
use diskforge_disklabel::{ebr, gpt, mbr};
use std::io::{Read, Seek, SeekFrom, Write};
use tempfile::NamedTempFile;

fn blank_image(mib: u64) -> NamedTempFile {
    let file = NamedTempFile::new().expect("failed to create temp file");
    file.as_file()
        .set_len(mib * 1024 * 1024)
        .expect("failed to size temp file");
    file
}

fn open_writable(file: &NamedTempFile) -> diskforge_disklabel::tree::DeviceRef {
    let backend = FileBlockDevice::open(file.path(), true).expect("failed to open backend");
    DeviceNode::new(Box::new(backend))
}

#[test]
fn mbr_with_one_primary_matches_expected_bytes() {
    let file = blank_image(100);
    let device = open_writable(&file);

    let label = mbr::create(Handle::Device(device.clone())).unwrap();
    device.borrow_mut().disklabel = Some(label.clone());

    let partition = mbr::create_partition(
        &label,
        Geometry::new(2048, 2).unwrap(),
        Geometry::new(204798, 2).unwrap(),
        mbr::MbrPartitionType::Primary,
    )
    .unwrap();
    assert_eq!(partition.borrow().start, 2048);

    mbr::commit(&label).unwrap();

    let mut raw = vec![0u8; 512];
    let mut f = file.reopen().unwrap();
    f.seek(SeekFrom::Start(0)).unwrap();
    f.read_exact(&mut raw).unwrap();

    assert_eq!(raw[510], 0x55);
    assert_eq!(raw[511], 0xAA);
    let entry0 = &raw[446..462];
    assert_eq!(entry0[4], 0x83, "entry 0 type byte");
    assert_eq!(u32::from_le_bytes(entry0[8..12].try_into().unwrap()), 2048);
    assert_eq!(u32::from_le_bytes(entry0[12..16].try_into().unwrap()), 202751);
    for slot in 1..4 {
        let entry = &raw[446 + slot * 16..446 + slot * 16 + 16];
        assert!(entry.iter().all(|&b| b == 0), "entry {slot} must be all-zero");
    }
}

#[test]
fn extended_partition_chains_two_logicals_and_reprobes() {
    let file = blank_image(100);
    let device = open_writable(&file);

    let mbr_label = mbr::create(Handle::Device(device.clone())).unwrap();
    device.borrow_mut().disklabel = Some(mbr_label.clone());

    let extended = mbr::create_partition(
        &mbr_label,
        Geometry::new(2048, 1).unwrap(),
        Geometry::new(204799, 1).unwrap(),
        mbr::MbrPartitionType::ExtendedLba,
    )
    .unwrap();
    let ebr_label = extended.borrow().disklabel().unwrap();

    ebr::create_partition(
        &ebr_label,
        Geometry::new(2048, 1).unwrap(),
        Geometry::new(102000, 1).unwrap(),
        ebr::EbrPartitionType::Logical,
    )
    .unwrap();
    ebr::create_partition(
        &ebr_label,
        Geometry::new(102400, 1).unwrap(),
        Geometry::new(204000, 1).unwrap(),
        ebr::EbrPartitionType::Logical,
    )
    .unwrap();

    mbr::commit(&mbr_label).unwrap();

    let reprobed_mbr = mbr::probe(Handle::Device(device.clone())).unwrap().unwrap();
    let node = reprobed_mbr.borrow();
    let DisklabelVariant::Mbr(mbr_state) = &node.variant else {
        panic!("expected MBR");
    };
    assert_eq!(mbr_state.entries[0].ptype, 0x0F, "extended entry must be LBA-extended");

    let reprobed_extended = mbr_state.children[0].as_ref().unwrap();
    let reprobed_ebr = reprobed_extended.borrow().disklabel().unwrap();
    let ebr_node = reprobed_ebr.borrow();
    let DisklabelVariant::Ebr(ebr_state) = &ebr_node.variant else {
        panic!("expected EBR chain");
    };
    assert_eq!(ebr_state.links.len(), 2);
    let first_logical = ebr_state.links[0].logical.as_ref().unwrap().borrow();
    assert_eq!(first_logical.start, ebr_state.links[0].base + ebr_state.links[0].entry0.first_lba as u64);
}

#[test]
fn gpt_create_remove_and_reprobe_clears_entry_and_crc() {
    let file = blank_image(1024);
    let device = open_writable(&file);

    let label = gpt::create(Handle::Device(device.clone())).unwrap();
    device.borrow_mut().disklabel = Some(label.clone());

    gpt::create_partition(
        &label,
        Geometry::new(1_000_000, 2).unwrap(),
        Geometry::new(2_000_000, 2).unwrap(),
    )
    .unwrap();
    gpt::commit(&label).unwrap();

    let reprobed = gpt::probe(Handle::Device(device.clone())).unwrap().unwrap();
    assert_eq!(gpt::count_partitions(&reprobed), 1);

    gpt::remove_partition(&reprobed, 1).unwrap();
    gpt::commit(&reprobed).unwrap();

    let reprobed2 = gpt::probe(Handle::Device(device.clone())).unwrap().unwrap();
    assert_eq!(gpt::count_partitions(&reprobed2), 0);
    let node = reprobed2.borrow();
    let DisklabelVariant::Gpt(gpt_state) = &node.variant else {
        panic!("expected GPT");
    };
    let zeros = vec![0u8; gpt_state.entries_raw.len()];
    assert_eq!(gpt_state.entries_raw, zeros);
    let expected_crc = diskforge_core::crc32::crc32_gpt(&zeros);
    assert_eq!(gpt_state.primary.partition_crc32, expected_crc);
}

#[test]
fn gpt_backup_header_still_parses_after_primary_corruption() {
    let file = blank_image(1024);
    let device = open_writable(&file);

    let label = gpt::create(Handle::Device(device.clone())).unwrap();
    device.borrow_mut().disklabel = Some(label.clone());
    gpt::create_partition(
        &label,
        Geometry::new(1_000_000, 2).unwrap(),
        Geometry::new(2_000_000, 2).unwrap(),
    )
    .unwrap();
    gpt::commit(&label).unwrap();

    // Flip one byte of the primary header's stored CRC field on disk.
    let mut f = file.reopen().unwrap();
    f.seek(SeekFrom::Start(16)).unwrap();
    let mut byte = [0u8; 1];
    f.read_exact(&mut byte).unwrap();
    drop(f);
    let mut f = std::fs::OpenOptions::new().write(true).open(file.path()).unwrap();
    f.seek(SeekFrom::Start(16)).unwrap();
    f.write_all(&[byte[0] ^ 0xFF]).unwrap();
    drop(f);

    // The backup header, at the far end of the device, is untouched and
    // must still parse on its own merits.
    let mut f = file.reopen().unwrap();
    let backup_lba = { label.borrow() };
    let DisklabelVariant::Gpt(gpt_state) = &backup_lba.variant else {
        panic!("expected GPT");
    };
    let backup_offset = gpt_state.primary.lba_backup * 512;
    drop(backup_lba);
    f.seek(SeekFrom::Start(backup_offset)).unwrap();
    let mut backup_sector = vec![0u8; 512];
    f.read_exact(&mut backup_sector).unwrap();
    assert_eq!(&backup_sector[0..8], b"EFI PART");
}

#[test]
fn overlap_attempt_is_rejected_and_label_is_unchanged() {
    let file = blank_image(100);
    let device = open_writable(&file);
    let label = mbr::create(Handle::Device(device.clone())).unwrap();
    device.borrow_mut().disklabel = Some(label.clone());

    mbr::create_partition(
        &label,
        Geometry::new(2048, 1).unwrap(),
        Geometry::new(4095, 1).unwrap(),
        mbr::MbrPartitionType::Primary,
    )
    .unwrap();

    let err = mbr::create_partition(
        &label,
        Geometry::new(3000, 2000).unwrap(),
        Geometry::new(5000, 1).unwrap(),
        mbr::MbrPartitionType::Primary,
    )
    .unwrap_err();
    assert!(matches!(
        err,
        diskforge_core::DiskforgeError::Geometry {
            endpoint: diskforge_core::Endpoint::Start,
            ..
        }
    ));

    let node = label.borrow();
    let DisklabelVariant::Mbr(mbr_state) = &node.variant else {
        panic!("expected MBR");
    };
    assert!(mbr_state.children[1].is_none(), "second slot must remain empty");
}

#[test]
fn commit_then_reprobe_reconstructs_an_equal_model() {
    let file = blank_image(1024);
    let device = open_writable(&file);
    let label = gpt::create(Handle::Device(device.clone())).unwrap();
    device.borrow_mut().disklabel = Some(label.clone());

    let partition = gpt::create_partition(
        &label,
        Geometry::new(1_000_000, 2).unwrap(),
        Geometry::new(2_000_000, 2).unwrap(),
    )
    .unwrap();
    let (start, end) = (partition.borrow().start, partition.borrow().end);
    gpt::commit(&label).unwrap();

    let reprobed = gpt::probe(Handle::Device(device.clone())).unwrap().unwrap();
    let node = reprobed.borrow();
    let DisklabelVariant::Gpt(gpt_state) = &node.variant else {
        panic!("expected GPT");
    };
    let reprobed_partition = gpt_state.children.iter().flatten().next().unwrap();
    assert_eq!(reprobed_partition.borrow().start, start);
    assert_eq!(reprobed_partition.borrow().end, end);
}
