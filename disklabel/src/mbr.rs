//! MBR disklabel (spec component C7): the 4-entry primary partition table
//! at sector 0, classifying each entry as primary / DOS-extended /
//! LBA-extended / EFI-protective / anything-else (spec §4.5).

use std::rc::Rc;

use byteorder::{ByteOrder, LittleEndian};
use diskforge_core::chs::{self, Chs};
use diskforge_core::device::Whence;
use diskforge_core::geometry::Geometry;
use diskforge_core::math;
use diskforge_core::{DiskforgeError, Endpoint, Result};
use log::{debug, info};
use static_assertions::assert_eq_size;

use crate::ebr;
use crate::gpt;
use crate::tree::{
    parent_link, DisklabelNode, DisklabelRef, DisklabelVariant, Handle, PartitionNode,
    PartitionRef, PartitionVariant,
};

/// A single 16-byte on-disk partition-table entry, kept verbatim so that
/// `raw()` reproduces exactly what was parsed (spec §8 testable property
/// 1), independent of which fields the in-memory model treats as
/// authoritative for a given type.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbrEntry {
    pub status: u8,
    pub first_chs: [u8; 3],
    pub ptype: u8,
    pub last_chs: [u8; 3],
    pub first_lba: u32,
    pub sectors: u32,
}

assert_eq_size!(MbrEntry, [u8; 16]);

impl MbrEntry {
    pub const EMPTY: MbrEntry = MbrEntry {
        status: 0,
        first_chs: [0; 3],
        ptype: 0,
        last_chs: [0; 3],
        first_lba: 0,
        sectors: 0,
    };

    pub fn from_bytes(b: &[u8]) -> Self {
        MbrEntry {
            status: b[0],
            first_chs: [b[1], b[2], b[3]],
            ptype: b[4],
            last_chs: [b[5], b[6], b[7]],
            first_lba: LittleEndian::read_u32(&b[8..12]),
            sectors: LittleEndian::read_u32(&b[12..16]),
        }
    }

    pub fn to_bytes(self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0] = self.status;
        out[1..4].copy_from_slice(&self.first_chs);
        out[4] = self.ptype;
        out[5..8].copy_from_slice(&self.last_chs);
        LittleEndian::write_u32(&mut out[8..12], self.first_lba);
        LittleEndian::write_u32(&mut out[12..16], self.sectors);
        out
    }
}

pub struct MbrLabel {
    pub boot_code: [u8; 446],
    pub entries: [MbrEntry; 4],
    pub children: [Option<PartitionRef>; 4],
}

/// Partition-type discriminant accepted by [`create_partition`] (spec
/// §4.5 step 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MbrPartitionType {
    Primary,
    Extended,
    ExtendedLba,
}

const TYPE_DOS_EXTENDED: u8 = 0x05;
const TYPE_LBA_EXTENDED: u8 = 0x0F;
const TYPE_LINUX_EXTENDED: u8 = 0x85;
const TYPE_EFI_PROTECTIVE: u8 = 0xEE;
const TYPE_LINUX_NATIVE: u8 = 0x83;

/// Read sector 0 of `parent` (always a `Device` in practice — MBR is
/// never itself nested) and, if the `0x55AA` magic is present, build the
/// in-memory model including every non-empty entry's child partition.
/// Returns `Ok(None)` on a magic mismatch so the dispatcher can fall
/// through to a GPT probe at the same sector (spec §4.8).
pub fn probe(parent: Handle) -> Result<Option<DisklabelRef>> {
    let start_lba = parent.start()?;
    let mut buf = vec![0u8; 512];
    parent.with_device_mut(|dev| {
        dev.seek(Whence::Start(start_lba), 0)?;
        dev.read_exact(&mut buf)
    })?;
    if buf[510] != 0x55 || buf[511] != 0xAA {
        debug!("mbr: no 0x55AA magic at lba {start_lba}, not an MBR");
        return Ok(None);
    }

    let mut boot_code = [0u8; 446];
    boot_code.copy_from_slice(&buf[0..446]);
    let mut entries = [MbrEntry::EMPTY; 4];
    for (i, entry) in entries.iter_mut().enumerate() {
        *entry = MbrEntry::from_bytes(&buf[446 + i * 16..446 + i * 16 + 16]);
    }

    let label = DisklabelNode::new(
        parent_link(&parent)?,
        DisklabelVariant::Mbr(MbrLabel {
            boot_code,
            entries,
            children: [None, None, None, None],
        }),
    );

    for slot in 0..4 {
        if entries[slot].ptype == 0x00 {
            continue;
        }
        let partition = build_partition_from_entry(&label, slot, entries[slot])?;
        if let DisklabelVariant::Mbr(mbr) = &mut label.borrow_mut().variant {
            mbr.children[slot] = Some(partition);
        }
    }
    info!("mbr: probed at lba {start_lba}, {} occupied slots", 4 - entries.iter().filter(|e| e.ptype == 0).count());
    Ok(Some(label))
}

fn build_partition_from_entry(
    label: &DisklabelRef,
    slot: usize,
    entry: MbrEntry,
) -> Result<PartitionRef> {
    let parent_weak = Rc::downgrade(label);
    match entry.ptype {
        TYPE_DOS_EXTENDED => {
            let geometry = Handle::Disklabel(label.clone()).chs_geometry()?;
            let start = chs::chs_to_lba(Chs::from_bytes(entry.first_chs), geometry)?;
            let end = chs::chs_to_lba(Chs::from_bytes(entry.last_chs), geometry)?;
            // Placeholder variant; replaced immediately below once the
            // partition handle exists to parent the nested EBR chain.
            let partition = PartitionNode::new(parent_weak, start, end, slot, PartitionVariant::Primary);
            let ebr_label = ebr::probe(Handle::Partition(partition.clone()), false)?;
            partition.borrow_mut().variant = PartitionVariant::Extended {
                lba_mode: false,
                disklabel: ebr_label,
            };
            Ok(partition)
        }
        TYPE_LBA_EXTENDED | TYPE_LINUX_EXTENDED => {
            let start = entry.first_lba as u64;
            let end = start + entry.sectors as u64 - 1;
            let partition = PartitionNode::new(parent_weak, start, end, slot, PartitionVariant::Primary);
            let ebr_label = ebr::probe(Handle::Partition(partition.clone()), true)?;
            partition.borrow_mut().variant = PartitionVariant::Extended {
                lba_mode: true,
                disklabel: ebr_label,
            };
            Ok(partition)
        }
        TYPE_EFI_PROTECTIVE => {
            let start = entry.first_lba as u64;
            let end = start + entry.sectors as u64 - 1;
            let partition = PartitionNode::new(parent_weak, start, end, slot, PartitionVariant::Primary);
            let gpt_label = gpt::probe(Handle::Partition(partition.clone()))?.ok_or_else(|| {
                DiskforgeError::Internal("protective MBR entry has no GPT signature".into())
            })?;
            partition.borrow_mut().variant = PartitionVariant::GuidProtective { disklabel: gpt_label };
            Ok(partition)
        }
        _ => {
            let geometry = Handle::Disklabel(label.clone()).chs_geometry()?;
            let start = chs::chs_to_lba(Chs::from_bytes(entry.first_chs), geometry)?;
            let end = chs::chs_to_lba(Chs::from_bytes(entry.last_chs), geometry)?;
            Ok(PartitionNode::new(parent_weak, start, end, slot, PartitionVariant::Primary))
        }
    }
}

/// Construct a fresh, empty MBR on `parent` (always a `Device`).
pub fn create(parent: Handle) -> Result<DisklabelRef> {
    Ok(DisklabelNode::new(
        parent_link(&parent)?,
        DisklabelVariant::Mbr(MbrLabel {
            boot_code: [0u8; 446],
            entries: [MbrEntry::EMPTY; 4],
            children: [None, None, None, None],
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
    let DisklabelVariant::Mbr(mbr) = &node.variant else {
        return Err(DiskforgeError::Internal("expected an MBR disklabel".into()));
    };
    for (i, child) in mbr.children.iter().enumerate() {
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

/// Create a new partition in the first free slot (spec §4.5 steps 1-5).
/// On any validation failure, no mutation to `label` has happened yet.
pub fn create_partition(
    label: &DisklabelRef,
    start_range: Geometry,
    end_range: Geometry,
    ptype: MbrPartitionType,
) -> Result<PartitionRef> {
    let handle = Handle::Disklabel(label.clone());
    let parent_start = handle.start()?;
    let parent_end = handle.end()?;
    let geometry = handle.chs_geometry()?;
    let spt = geometry.sectors_per_track as u64;

    let start = math::round(start_range.midpoint(), spt)?;
    if !start_range.contains(start) || start < parent_start || start > parent_end {
        return Err(DiskforgeError::Geometry {
            endpoint: Endpoint::Start,
            reason: format!("candidate start {start} outside start range or device bounds"),
        });
    }
    let end = math::round(end_range.midpoint(), spt)?;
    if !end_range.contains(end) || end > parent_end || end < start {
        return Err(DiskforgeError::Geometry {
            endpoint: Endpoint::End,
            reason: format!("candidate end {end} outside end range or precedes start"),
        });
    }

    let slot = {
        let node = label.borrow();
        let DisklabelVariant::Mbr(mbr) = &node.variant else {
            return Err(DiskforgeError::Internal("expected an MBR disklabel".into()));
        };
        (0..4)
            .find(|&i| mbr.children[i].is_none())
            .ok_or(DiskforgeError::DisklabelFull)?
    };

    check_overlap(label, slot, start, end)?;

    let first_chs = chs::lba_to_chs(start, geometry)?;
    let last_chs = chs::lba_to_chs(end, geometry)?;
    let sectors = (end - start + 1) as u32;
    let ptype_byte = match ptype {
        MbrPartitionType::Primary => TYPE_LINUX_NATIVE,
        MbrPartitionType::ExtendedLba => TYPE_LBA_EXTENDED,
        MbrPartitionType::Extended => TYPE_DOS_EXTENDED,
    };
    let entry = MbrEntry {
        status: 0x00,
        first_chs: first_chs.to_bytes(),
        ptype: ptype_byte,
        last_chs: last_chs.to_bytes(),
        first_lba: start as u32,
        sectors,
    };

    let partition = PartitionNode::new(Rc::downgrade(label), start, end, slot, PartitionVariant::Primary);
    match ptype {
        MbrPartitionType::Primary => {}
        MbrPartitionType::Extended | MbrPartitionType::ExtendedLba => {
            let lba_mode = matches!(ptype, MbrPartitionType::ExtendedLba);
            let nested = ebr::new_empty(Handle::Partition(partition.clone()), lba_mode)?;
            partition.borrow_mut().variant = PartitionVariant::Extended {
                lba_mode,
                disklabel: nested,
            };
        }
    }

    {
        let mut node = label.borrow_mut();
        let DisklabelVariant::Mbr(mbr) = &mut node.variant else {
            unreachable!("checked above");
        };
        mbr.entries[slot] = entry;
        mbr.children[slot] = Some(partition.clone());
    }
    info!("mbr: created {:?} at [{start}, {end}] in slot {}", ptype, slot + 1);
    Ok(partition)
}

/// Zero the entry and drop the child slot. `number` is the 1-based slot.
pub fn remove_partition(label: &DisklabelRef, number: u32) -> Result<()> {
    let idx = number
        .checked_sub(1)
        .ok_or(DiskforgeError::PartitionNumber(number))? as usize;
    let mut node = label.borrow_mut();
    let DisklabelVariant::Mbr(mbr) = &mut node.variant else {
        return Err(DiskforgeError::Internal("expected an MBR disklabel".into()));
    };
    if idx >= 4 || mbr.children[idx].is_none() {
        return Err(DiskforgeError::PartitionNumber(number));
    }
    mbr.children[idx] = None;
    mbr.entries[idx] = MbrEntry::EMPTY;
    Ok(())
}

/// 512 bytes: boot code, four entries, `0x55AA` — exactly what `commit`
/// would write, without touching the device (spec §6 "Raw-dump
/// interface").
pub fn raw(label: &DisklabelRef) -> Result<Vec<u8>> {
    let node = label.borrow();
    let DisklabelVariant::Mbr(mbr) = &node.variant else {
        return Err(DiskforgeError::Internal("expected an MBR disklabel".into()));
    };
    let mut buf = vec![0u8; 512];
    buf[0..446].copy_from_slice(&mbr.boot_code);
    for (i, entry) in mbr.entries.iter().enumerate() {
        buf[446 + i * 16..446 + i * 16 + 16].copy_from_slice(&entry.to_bytes());
    }
    buf[510] = 0x55;
    buf[511] = 0xAA;
    Ok(buf)
}

/// Write the MBR sector, then depth-first commit every nested disklabel
/// (spec §4.5 "Commit").
pub fn commit(label: &DisklabelRef) -> Result<()> {
    let handle = Handle::Disklabel(label.clone());
    let writable = handle.with_device_mut(|dev| Ok(dev.is_writable()))?;
    if !writable {
        return Err(DiskforgeError::Partition("device was opened read-only".into()));
    }
    let start_lba = handle.start()?;
    let bytes = raw(label)?;
    handle.with_device_mut(|dev| {
        dev.seek(Whence::Start(start_lba), 0)?;
        dev.write_all(&bytes)
    })?;

    let children: Vec<PartitionRef> = {
        let node = label.borrow();
        let DisklabelVariant::Mbr(mbr) = &node.variant else {
            unreachable!("checked above");
        };
        mbr.children.iter().flatten().cloned().collect()
    };
    for child in children {
        let nested = child.borrow().disklabel();
        if let Some(nested) = nested {
            commit_nested(&nested)?;
        }
    }
    info!("mbr: committed at lba {start_lba}");
    Ok(())
}

fn commit_nested(label: &DisklabelRef) -> Result<()> {
    let kind = {
        let node = label.borrow();
        match &node.variant {
            DisklabelVariant::Ebr(_) => "ebr",
            DisklabelVariant::Gpt(_) => "gpt",
            DisklabelVariant::Mbr(_) => "mbr",
        }
    };
    match kind {
        "ebr" => ebr::commit(label),
        "gpt" => gpt::commit(label),
        _ => Err(DiskforgeError::Internal("MBR cannot nest inside MBR".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::DeviceNode;
    use diskforge_core::device::FileBlockDevice;
    use tempfile::NamedTempFile;

    fn blank_device(mib: u64) -> (NamedTempFile, crate::tree::DeviceRef) {
        let file = NamedTempFile::new().unwrap();
        file.as_file().set_len(mib * 1024 * 1024).unwrap();
        let backend = FileBlockDevice::open(file.path(), true).unwrap();
        (file, DeviceNode::new(Box::new(backend)))
    }

    #[test]
    fn create_one_primary_and_commit_round_trips() {
        let (_file, device) = blank_device(100);
        let label = create(Handle::Device(device.clone())).unwrap();
        device.borrow_mut().disklabel = Some(label.clone());

        let start_range = Geometry::new(2048, 2).unwrap();
        let end_range = Geometry::new(204798, 2).unwrap();
        let partition = create_partition(&label, start_range, end_range, MbrPartitionType::Primary).unwrap();
        assert_eq!(partition.borrow().start, 2048);

        commit(&label).unwrap();

        let reprobed = probe(Handle::Device(device.clone())).unwrap().unwrap();
        let node = reprobed.borrow();
        let DisklabelVariant::Mbr(mbr) = &node.variant else { panic!() };
        assert_eq!(mbr.entries[0].ptype, TYPE_LINUX_NATIVE);
        assert_eq!(mbr.entries[0].first_lba, 2048);
        for entry in &mbr.entries[1..] {
            assert_eq!(*entry, MbrEntry::EMPTY);
        }
    }

    #[test]
    fn overlap_is_rejected_and_state_is_unchanged() {
        let (_file, device) = blank_device(100);
        let label = create(Handle::Device(device.clone())).unwrap();
        create_partition(
            &label,
            Geometry::new(2048, 1).unwrap(),
            Geometry::new(4095, 1).unwrap(),
            MbrPartitionType::Primary,
        )
        .unwrap();

        let err = create_partition(
            &label,
            Geometry::new(3000, 2000).unwrap(),
            Geometry::new(5000, 1).unwrap(),
            MbrPartitionType::Primary,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            DiskforgeError::Geometry { endpoint: Endpoint::Start, .. }
        ));

        let node = label.borrow();
        let DisklabelVariant::Mbr(mbr) = &node.variant else { panic!() };
        assert!(mbr.children[1].is_none());
    }

    #[test]
    fn disklabel_full_after_four_entries() {
        let (_file, device) = blank_device(200);
        let label = create(Handle::Device(device.clone())).unwrap();
        for i in 0..4 {
            let lo = 2048 + i * 100_000;
            create_partition(
                &label,
                Geometry::new(lo, 1).unwrap(),
                Geometry::new(lo + 90_000, 1).unwrap(),
                MbrPartitionType::Primary,
            )
            .unwrap();
        }
        let err = create_partition(
            &label,
            Geometry::new(2_000_000, 1).unwrap(),
            Geometry::new(2_001_000, 1).unwrap(),
            MbrPartitionType::Primary,
        )
        .unwrap_err();
        assert!(matches!(err, DiskforgeError::DisklabelFull));
    }
}
