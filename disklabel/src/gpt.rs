//! GPT disklabel (spec component C9): dual primary/backup header, a
//! flat entries array, CRC32 validation and regeneration on every
//! mutation (spec §4.7).

use std::rc::Rc;

use byteorder::{ByteOrder, LittleEndian};
use diskforge_core::device::Whence;
use diskforge_core::geometry::Geometry;
use diskforge_core::math;
use diskforge_core::{crc32, DiskforgeError, Endpoint, Result};
use log::info;
use static_assertions::const_assert_eq;
use uuid::Uuid;

use crate::tree::{
    parent_link, DisklabelNode, DisklabelRef, DisklabelVariant, Handle, PartitionNode,
    PartitionRef, PartitionVariant,
};

/// Default GPT layout (spec §3 "GptLabel"): 128 entries of 128 bytes.
pub const DEFAULT_NPARTITIONS: u32 = 128;
pub const DEFAULT_ENTRY_SIZE: u32 = 128;
const HEADER_FIXED_SIZE: usize = 92;

const FLAG_SYSTEM: u64 = 0x1;
const FLAG_READONLY: u64 = 0x1000_0000_0000_0000;

// Pin the layout constants the way the teacher pins its on-disk struct
// sizes (`assert_eq_size!` in `formatters/.../structures.rs`); the header
// and default entry record aren't plain byte arrays here, so the fixed
// sizes are asserted directly instead.
const_assert_eq!(HEADER_FIXED_SIZE, 92);
const_assert_eq!(DEFAULT_ENTRY_SIZE, 128);

fn basic_data_type_guid() -> Uuid {
    Uuid::parse_str("EBD0A0A2-B9E5-4433-87C0-68B6B72699C7").expect("valid constant GUID")
}

/// GUIDs are stored on disk "mixed-endian": the first three fields
/// little-endian, the last two as a plain big-endian byte sequence
/// (spec §3, §6). `uuid::Uuid` stores the RFC 4122 big-endian form, so
/// the first three groups need byte-swapping on the way to/from disk.
fn guid_to_mixed_endian(guid: Uuid) -> [u8; 16] {
    let b = *guid.as_bytes();
    let mut out = [0u8; 16];
    out[0..4].copy_from_slice(&b[0..4]);
    out[0..4].reverse();
    out[4..6].copy_from_slice(&b[4..6]);
    out[4..6].reverse();
    out[6..8].copy_from_slice(&b[6..8]);
    out[6..8].reverse();
    out[8..16].copy_from_slice(&b[8..16]);
    out
}

/// GPT header fields, kept as host-native integers; conversion to/from
/// little-endian happens only in `to_bytes`/`from_bytes` (spec §9
/// "Endian handling").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptHeader {
    pub revision: u32,
    pub header_size: u32,
    pub header_crc32: u32,
    pub lba_current: u64,
    pub lba_backup: u64,
    pub lba_first_usable: u64,
    pub lba_last_usable: u64,
    pub disk_guid: [u8; 16],
    pub lba_first_entry: u64,
    pub npartitions: u32,
    pub partition_entry_size: u32,
    pub partition_crc32: u32,
}

impl GptHeader {
    /// `header_size` bytes: the fixed 92-byte field layout, zero-padded
    /// out to `header_size` if larger.
    pub fn to_bytes(&self) -> Vec<u8> {
        let size = (self.header_size as usize).max(HEADER_FIXED_SIZE);
        let mut buf = vec![0u8; size];
        buf[0..8].copy_from_slice(b"EFI PART");
        LittleEndian::write_u32(&mut buf[8..12], self.revision);
        LittleEndian::write_u32(&mut buf[12..16], self.header_size);
        LittleEndian::write_u32(&mut buf[16..20], self.header_crc32);
        LittleEndian::write_u64(&mut buf[24..32], self.lba_current);
        LittleEndian::write_u64(&mut buf[32..40], self.lba_backup);
        LittleEndian::write_u64(&mut buf[40..48], self.lba_first_usable);
        LittleEndian::write_u64(&mut buf[48..56], self.lba_last_usable);
        buf[56..72].copy_from_slice(&self.disk_guid);
        LittleEndian::write_u64(&mut buf[72..80], self.lba_first_entry);
        LittleEndian::write_u32(&mut buf[80..84], self.npartitions);
        LittleEndian::write_u32(&mut buf[84..88], self.partition_entry_size);
        LittleEndian::write_u32(&mut buf[88..92], self.partition_crc32);
        buf
    }

    pub fn from_bytes(b: &[u8]) -> Result<Self> {
        if b.len() < HEADER_FIXED_SIZE || &b[0..8] != b"EFI PART" {
            return Err(DiskforgeError::Internal("not a GPT header".into()));
        }
        Ok(GptHeader {
            revision: LittleEndian::read_u32(&b[8..12]),
            header_size: LittleEndian::read_u32(&b[12..16]),
            header_crc32: LittleEndian::read_u32(&b[16..20]),
            lba_current: LittleEndian::read_u64(&b[24..32]),
            lba_backup: LittleEndian::read_u64(&b[32..40]),
            lba_first_usable: LittleEndian::read_u64(&b[40..48]),
            lba_last_usable: LittleEndian::read_u64(&b[48..56]),
            disk_guid: b[56..72].try_into().unwrap(),
            lba_first_entry: LittleEndian::read_u64(&b[72..80]),
            // Read as 32-bit everywhere — the source's entry-loop read of
            // this field via a 64-bit accessor is a latent bug, not
            // carried forward (spec §9 open question 1).
            npartitions: LittleEndian::read_u32(&b[80..84]),
            partition_entry_size: LittleEndian::read_u32(&b[84..88]),
            partition_crc32: LittleEndian::read_u32(&b[88..92]),
        })
    }

    /// Recompute over `self` with `header_crc32` treated as zero, per
    /// spec §3 invariant 4.
    fn compute_crc(&self) -> u32 {
        let mut bytes = self.to_bytes();
        bytes[16..20].fill(0);
        crc32::crc32_gpt(&bytes)
    }
}

pub struct GptLabel {
    pub sector_size: u32,
    pub primary: GptHeader,
    pub backup: GptHeader,
    /// `npartitions × entry_size` bytes, flat.
    pub entries_raw: Vec<u8>,
    pub children: Vec<Option<PartitionRef>>,
}

fn entry_bytes(label: &GptLabel, idx: usize) -> &[u8] {
    let sz = label.primary.partition_entry_size as usize;
    &label.entries_raw[idx * sz..idx * sz + sz]
}

fn entry_bytes_mut(label: &mut GptLabel, idx: usize) -> &mut [u8] {
    let sz = label.primary.partition_entry_size as usize;
    &mut label.entries_raw[idx * sz..idx * sz + sz]
}

fn entry_is_unused(bytes: &[u8]) -> bool {
    bytes[0..16].iter().all(|&b| b == 0)
}

fn entry_first_lba(bytes: &[u8]) -> u64 {
    LittleEndian::read_u64(&bytes[32..40])
}

fn entry_last_lba(bytes: &[u8]) -> u64 {
    LittleEndian::read_u64(&bytes[40..48])
}

fn entry_flags(bytes: &[u8]) -> u64 {
    LittleEndian::read_u64(&bytes[48..56])
}

fn write_entry(bytes: &mut [u8], type_guid: [u8; 16], unique_guid: [u8; 16], first_lba: u64, last_lba: u64) {
    bytes.fill(0);
    bytes[0..16].copy_from_slice(&type_guid);
    bytes[16..32].copy_from_slice(&unique_guid);
    LittleEndian::write_u64(&mut bytes[32..40], first_lba);
    LittleEndian::write_u64(&mut bytes[40..48], last_lba);
    // flags (48..56) and name (56..) left zero.
}

fn recompute_crcs(primary: &mut GptHeader, backup: &mut GptHeader, entries_raw: &[u8]) {
    let part_crc = crc32::crc32_gpt(entries_raw);
    primary.partition_crc32 = part_crc;
    backup.partition_crc32 = part_crc;
    primary.header_crc32 = primary.compute_crc();
    backup.header_crc32 = backup.compute_crc();
}

fn header_sector(header: &GptHeader, sector_size: u32) -> Vec<u8> {
    let mut buf = vec![0u8; sector_size as usize];
    let hb = header.to_bytes();
    let n = hb.len().min(buf.len());
    buf[0..n].copy_from_slice(&hb[0..n]);
    buf
}

/// Read the primary header at `parent`'s first sector; if the `"EFI
/// PART"` signature is absent, return `Ok(None)` (spec §4.7, §4.8).
pub fn probe(parent: Handle) -> Result<Option<DisklabelRef>> {
    let start_lba = parent.start()?;
    let sector_size = parent.sector_size()?;
    let mut sector = vec![0u8; sector_size as usize];
    parent.with_device_mut(|dev| {
        dev.seek(Whence::Start(start_lba), 0)?;
        dev.read_exact(&mut sector)
    })?;
    if sector.len() < 8 || &sector[0..8] != b"EFI PART" {
        return Ok(None);
    }
    let primary = GptHeader::from_bytes(&sector)?;

    let entry_size = primary.partition_entry_size as usize;
    let npartitions = primary.npartitions as usize;
    let mut entries_raw = vec![0u8; npartitions * entry_size];
    parent.with_device_mut(|dev| {
        dev.seek(Whence::Start(primary.lba_first_entry), 0)?;
        dev.read_exact(&mut entries_raw)
    })?;

    let mut backup_sector = vec![0u8; sector_size as usize];
    parent.with_device_mut(|dev| {
        dev.seek(Whence::Start(primary.lba_backup), 0)?;
        dev.read_exact(&mut backup_sector)
    })?;
    let backup = GptHeader::from_bytes(&backup_sector)?;

    let label = DisklabelNode::new(
        parent_link(&parent)?,
        DisklabelVariant::Gpt(GptLabel {
            sector_size,
            primary,
            backup,
            entries_raw,
            children: vec![None; npartitions],
        }),
    );

    for idx in 0..npartitions {
        let bytes = {
            let node = label.borrow();
            let DisklabelVariant::Gpt(gpt) = &node.variant else {
                unreachable!("just constructed as Gpt");
            };
            entry_bytes(gpt, idx).to_vec()
        };
        if entry_is_unused(&bytes) {
            continue;
        }
        let first_lba = entry_first_lba(&bytes);
        let last_lba = entry_last_lba(&bytes);
        let partition = PartitionNode::new(Rc::downgrade(&label), first_lba, last_lba, idx, PartitionVariant::Primary);
        if let DisklabelVariant::Gpt(gpt) = &mut label.borrow_mut().variant {
            gpt.children[idx] = Some(partition);
        }
    }
    info!("gpt: probed at lba {start_lba}, {npartitions} slots");
    Ok(Some(label))
}

/// Construct a fresh GPT with the default 128×128-byte layout, spanning
/// the usable range between the header/entries and their backups.
pub fn create(parent: Handle) -> Result<DisklabelRef> {
    create_with_layout(parent, DEFAULT_NPARTITIONS, DEFAULT_ENTRY_SIZE)
}

pub fn create_with_layout(parent: Handle, npartitions: u32, entry_size: u32) -> Result<DisklabelRef> {
    let start_lba = parent.start()?;
    let end_lba = parent.end()?;
    let sector_size = parent.sector_size()?;
    let entries_bytes = npartitions as u64 * entry_size as u64;
    let entries_sectors = (entries_bytes + sector_size as u64 - 1) / sector_size as u64;

    let lba_current = start_lba;
    let lba_first_entry = start_lba + 1;
    let lba_first_usable = lba_first_entry + entries_sectors;
    let lba_backup = end_lba;
    let lba_last_usable = lba_backup
        .checked_sub(entries_sectors + 1)
        .ok_or_else(|| DiskforgeError::Internal("device too small for a GPT layout".into()))?;
    if lba_last_usable < lba_first_usable {
        return Err(DiskforgeError::Internal("device too small for a GPT layout".into()));
    }

    let disk_guid = guid_to_mixed_endian(Uuid::new_v4());
    let mut primary = GptHeader {
        revision: 0x0001_0000,
        header_size: HEADER_FIXED_SIZE as u32,
        header_crc32: 0,
        lba_current,
        lba_backup,
        lba_first_usable,
        lba_last_usable,
        disk_guid,
        lba_first_entry,
        npartitions,
        partition_entry_size: entry_size,
        partition_crc32: 0,
    };
    let mut backup = GptHeader {
        lba_current: lba_backup,
        lba_backup: lba_current,
        ..primary.clone()
    };
    let entries_raw = vec![0u8; entries_bytes as usize];
    recompute_crcs(&mut primary, &mut backup, &entries_raw);

    Ok(DisklabelNode::new(
        parent_link(&parent)?,
        DisklabelVariant::Gpt(GptLabel {
            sector_size,
            primary,
            backup,
            entries_raw,
            children: vec![None; npartitions as usize],
        }),
    ))
}

fn classify_overlap(start: u64, end: u64, sib_start: u64, sib_end: u64) -> Option<Endpoint> {
    if end < sib_start || start > sib_end {
        return None;
    }
    let start_in = start >= sib_start && start <= sib_end;
    if start_in {
        Some(Endpoint::Start)
    } else {
        Some(Endpoint::End)
    }
}

fn check_overlap(label: &DisklabelRef, skip_slot: usize, start: u64, end: u64) -> Result<()> {
    let node = label.borrow();
    let DisklabelVariant::Gpt(gpt) = &node.variant else {
        return Err(DiskforgeError::Internal("expected a GPT disklabel".into()));
    };
    for (i, child) in gpt.children.iter().enumerate() {
        if i == skip_slot {
            continue;
        }
        let Some(sibling) = child else { continue };
        let sib = sibling.borrow();
        if let Some(endpoint) = classify_overlap(start, end, sib.start, sib.end) {
            return Err(DiskforgeError::Geometry {
                endpoint,
                reason: format!(
                    "candidate range [{start}, {end}] overlaps slot {} range [{}, {}]",
                    i + 1,
                    sib.start,
                    sib.end
                ),
            });
        }
    }
    Ok(())
}

/// Create a Basic-Data partition in the first free slot (spec §4.7
/// "Create-partition"). Only the Basic Data GUID is assigned; partition
/// type enumeration beyond that is an explicit non-goal (spec §1).
pub fn create_partition(label: &DisklabelRef, start_range: Geometry, end_range: Geometry) -> Result<PartitionRef> {
    let handle = Handle::Disklabel(label.clone());
    let sector_size = handle.sector_size()? as u64;
    let optimal_alignment_bytes = handle.optimal_alignment()?;
    let alignment = (optimal_alignment_bytes / sector_size).max(1);

    let (lba_first_usable, lba_last_usable) = {
        let node = label.borrow();
        let DisklabelVariant::Gpt(gpt) = &node.variant else {
            return Err(DiskforgeError::Internal("expected a GPT disklabel".into()));
        };
        (gpt.primary.lba_first_usable, gpt.primary.lba_last_usable)
    };

    let start = math::round(start_range.midpoint(), alignment)?;
    if start < lba_first_usable || start > lba_last_usable || !start_range.contains(start) {
        return Err(DiskforgeError::Geometry {
            endpoint: Endpoint::Start,
            reason: format!("candidate start {start} outside the usable range"),
        });
    }
    let end = math::round(end_range.midpoint(), alignment)?;
    if end > lba_last_usable || end < start || !end_range.contains(end) {
        return Err(DiskforgeError::Geometry {
            endpoint: Endpoint::End,
            reason: format!("candidate end {end} outside the usable range"),
        });
    }

    let slot = {
        let node = label.borrow();
        let DisklabelVariant::Gpt(gpt) = &node.variant else {
            unreachable!("checked above");
        };
        (0..gpt.children.len())
            .find(|&i| gpt.children[i].is_none())
            .ok_or(DiskforgeError::DisklabelFull)?
    };

    check_overlap(label, slot, start, end)?;

    let type_guid = guid_to_mixed_endian(basic_data_type_guid());
    let unique_guid = guid_to_mixed_endian(Uuid::new_v4());
    let partition = PartitionNode::new(Rc::downgrade(label), start, end, slot, PartitionVariant::Primary);

    {
        let mut node = label.borrow_mut();
        let DisklabelVariant::Gpt(gpt) = &mut node.variant else {
            unreachable!("checked above");
        };
        write_entry(entry_bytes_mut(gpt, slot), type_guid, unique_guid, start, end);
        gpt.children[slot] = Some(partition.clone());
        let entries_raw = gpt.entries_raw.clone();
        recompute_crcs(&mut gpt.primary, &mut gpt.backup, &entries_raw);
    }
    info!("gpt: created partition at [{start}, {end}] in slot {}", slot + 1);
    Ok(partition)
}

/// Reject removal of a `system`- or `readonly`-flagged entry, then zero
/// it and regenerate every CRC (spec §4.7 "Remove-partition").
pub fn remove_partition(label: &DisklabelRef, number: u32) -> Result<()> {
    let idx = number
        .checked_sub(1)
        .ok_or(DiskforgeError::PartitionNumber(number))? as usize;
    let mut node = label.borrow_mut();
    let DisklabelVariant::Gpt(gpt) = &mut node.variant else {
        return Err(DiskforgeError::Internal("expected a GPT disklabel".into()));
    };
    if idx >= gpt.children.len() || gpt.children[idx].is_none() {
        return Err(DiskforgeError::PartitionNumber(number));
    }
    let flags = entry_flags(entry_bytes(gpt, idx));
    if flags & FLAG_SYSTEM != 0 || flags & FLAG_READONLY != 0 {
        return Err(DiskforgeError::Partition(
            "cannot remove a system- or read-only-flagged GPT entry".into(),
        ));
    }
    entry_bytes_mut(gpt, idx).fill(0);
    gpt.children[idx] = None;
    let entries_raw = gpt.entries_raw.clone();
    recompute_crcs(&mut gpt.primary, &mut gpt.backup, &entries_raw);
    Ok(())
}

pub fn count_partitions(label: &DisklabelRef) -> usize {
    let node = label.borrow();
    let DisklabelVariant::Gpt(gpt) = &node.variant else {
        return 0;
    };
    // Explicitly seeded at zero (spec §9 open question 2 — the source
    // increments an uninitialized local here).
    let mut count = 0usize;
    for child in &gpt.children {
        if child.is_some() {
            count += 1;
        }
    }
    count
}

/// One sector header followed by the entries buffer — no backup header,
/// no device I/O (spec §6 "Raw-dump interface").
pub fn raw(label: &DisklabelRef) -> Result<Vec<u8>> {
    let node = label.borrow();
    let DisklabelVariant::Gpt(gpt) = &node.variant else {
        return Err(DiskforgeError::Internal("expected a GPT disklabel".into()));
    };
    let mut buf = header_sector(&gpt.primary, gpt.sector_size);
    buf.extend_from_slice(&gpt.entries_raw);
    Ok(buf)
}

/// Primary header, then entries, then entries-backup, then backup
/// header — in that order, so a crash after the primary write still
/// leaves a recoverable backup (spec §4.7 "Commit order").
pub fn commit(label: &DisklabelRef) -> Result<()> {
    let handle = Handle::Disklabel(label.clone());
    let writable = handle.with_device_mut(|dev| Ok(dev.is_writable()))?;
    if !writable {
        return Err(DiskforgeError::Partition("device was opened read-only".into()));
    }

    let (primary_sector, backup_sector, entries_raw, lba_current, lba_first_entry, lba_last_usable, lba_backup) = {
        let node = label.borrow();
        let DisklabelVariant::Gpt(gpt) = &node.variant else {
            return Err(DiskforgeError::Internal("expected a GPT disklabel".into()));
        };
        (
            header_sector(&gpt.primary, gpt.sector_size),
            header_sector(&gpt.backup, gpt.sector_size),
            gpt.entries_raw.clone(),
            gpt.primary.lba_current,
            gpt.primary.lba_first_entry,
            gpt.primary.lba_last_usable,
            gpt.primary.lba_backup,
        )
    };

    handle.with_device_mut(|dev| {
        dev.seek(Whence::Start(lba_current), 0)?;
        dev.write_all(&primary_sector)
    })?;
    handle.with_device_mut(|dev| {
        dev.seek(Whence::Start(lba_first_entry), 0)?;
        dev.write_all(&entries_raw)
    })?;
    handle.with_device_mut(|dev| {
        dev.seek(Whence::Start(lba_last_usable + 1), 0)?;
        dev.write_all(&entries_raw)
    })?;
    handle.with_device_mut(|dev| {
        dev.seek(Whence::Start(lba_backup), 0)?;
        dev.write_all(&backup_sector)
    })?;
    info!("gpt: committed primary + backup");
    Ok(())
}
