//! EBR chain (spec component C8): the singly linked list of single-entry
//! sectors describing the logical partitions inside an extended
//! partition (spec §4.6).

use std::rc::Rc;

use diskforge_core::chs::{self, Chs};
use diskforge_core::device::Whence;
use diskforge_core::geometry::Geometry;
use diskforge_core::math;
use diskforge_core::{DiskforgeError, Endpoint, Result};
use log::{debug, info};

use crate::mbr::MbrEntry;
use crate::tree::{
    parent_link, DisklabelNode, DisklabelRef, DisklabelVariant, Handle, PartitionNode, PartitionRef,
    PartitionVariant,
};

const TYPE_LOGICAL: u8 = 0x83;
const TYPE_NESTED_EXTENDED: u8 = 0x85;

/// One EBR sector: its own absolute LBA, the two leading entries as
/// parsed off disk (kept verbatim so `raw()` round-trips byte-exact —
/// spec §8 testable property 1), and the tree-level interpretation of
/// each (the logical partition it describes, and the next link's base).
pub struct EbrLink {
    pub base: u64,
    pub reserved: [u8; 446],
    pub entry0: MbrEntry,
    pub entry1: MbrEntry,
    pub logical: Option<PartitionRef>,
    pub next_base: Option<u64>,
}

pub struct EbrLabel {
    pub lba_mode: bool,
    pub links: Vec<EbrLink>,
}

/// Accepted partition-type discriminant for [`create_partition`] (spec
/// §4.6 "Accept types LOGICAL and EXTENDED").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EbrPartitionType {
    Logical,
    Extended,
}

/// Build an EBR chain with no links — the state of a freshly created
/// `Extended` partition before any logical partition has been added.
pub fn new_empty(parent: Handle, lba_mode: bool) -> Result<DisklabelRef> {
    Ok(DisklabelNode::new(
        parent_link(&parent)?,
        DisklabelVariant::Ebr(EbrLabel {
            lba_mode,
            links: Vec::new(),
        }),
    ))
}

/// Read the chain starting at `parent`'s first sector. If the leading
/// sector lacks the `0x55AA` magic, the extended partition has no
/// logical partitions yet and an empty chain is returned rather than an
/// error — an `Extended` partition always owns an EBR disklabel (spec
/// §3 "Partition"), even an empty one.
pub fn probe(parent: Handle, lba_mode: bool) -> Result<DisklabelRef> {
    let label = new_empty(parent.clone(), lba_mode)?;
    let extended_start = parent.start()?;
    let mut links = Vec::new();
    let mut base = extended_start;

    loop {
        let mut buf = vec![0u8; 512];
        let handle = Handle::Disklabel(label.clone());
        let read_ok = handle
            .with_device_mut(|dev| {
                dev.seek(Whence::Start(base), 0)?;
                dev.read_exact(&mut buf)
            })
            .is_ok();
        if !read_ok || buf[510] != 0x55 || buf[511] != 0xAA {
            debug!("ebr: chain ends at lba {base} (no magic)");
            break;
        }

        let mut reserved = [0u8; 446];
        reserved.copy_from_slice(&buf[0..446]);
        let entry0 = MbrEntry::from_bytes(&buf[446..462]);
        let entry1 = MbrEntry::from_bytes(&buf[462..478]);

        let slot = links.len();
        let logical = if entry0.ptype != 0x00 {
            Some(build_logical(&label, slot, base, entry0, lba_mode)?)
        } else {
            None
        };

        let next_base = if entry1.ptype != 0x00 {
            Some(if lba_mode {
                extended_start + entry1.first_lba as u64
            } else {
                let geometry = parent.chs_geometry()?;
                chs::chs_to_lba(Chs::from_bytes(entry1.first_chs), geometry)?
            })
        } else {
            None
        };

        links.push(EbrLink {
            base,
            reserved,
            entry0,
            entry1,
            logical,
            next_base,
        });

        match next_base {
            Some(nb) => base = nb,
            None => break,
        }
    }

    if let DisklabelVariant::Ebr(ebr) = &mut label.borrow_mut().variant {
        ebr.links = links;
    }
    info!("ebr: probed chain with {} link(s)", label_link_count(&label));
    Ok(label)
}

fn label_link_count(label: &DisklabelRef) -> usize {
    match &label.borrow().variant {
        DisklabelVariant::Ebr(ebr) => ebr.links.len(),
        _ => 0,
    }
}

fn build_logical(
    label: &DisklabelRef,
    slot: usize,
    base: u64,
    entry0: MbrEntry,
    lba_mode: bool,
) -> Result<PartitionRef> {
    let (start, end) = if lba_mode {
        let s = base + entry0.first_lba as u64;
        (s, s + entry0.sectors as u64 - 1)
    } else {
        let geometry = Handle::Disklabel(label.clone()).chs_geometry()?;
        let s = chs::chs_to_lba(Chs::from_bytes(entry0.first_chs), geometry)?;
        let e = chs::chs_to_lba(Chs::from_bytes(entry0.last_chs), geometry)?;
        (s, e)
    };
    let partition = PartitionNode::new(Rc::downgrade(label), start, end, slot, PartitionVariant::Primary);
    match entry0.ptype {
        TYPE_NESTED_EXTENDED if lba_mode => {
            let nested = probe(Handle::Partition(partition.clone()), true)?;
            partition.borrow_mut().variant = PartitionVariant::Extended {
                lba_mode: true,
                disklabel: nested,
            };
        }
        _ => {
            partition.borrow_mut().variant = PartitionVariant::Logical;
        }
    }
    Ok(partition)
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

/// Check the candidate `[start, end]` against every occupied link's
/// `entry0` record — the conservative reading of spec §9 open question 3
/// (a straddling logical partition would otherwise slip past a check
/// limited to the last link).
fn check_overlap(label: &DisklabelRef, start: u64, end: u64) -> Result<()> {
    let node = label.borrow();
    let DisklabelVariant::Ebr(ebr) = &node.variant else {
        return Err(DiskforgeError::Internal("expected an EBR disklabel".into()));
    };
    for link in &ebr.links {
        let Some(logical) = &link.logical else { continue };
        let p = logical.borrow();
        if let Some(endpoint) = classify_overlap(start, end, p.start, p.end) {
            return Err(DiskforgeError::Geometry {
                endpoint,
                reason: format!(
                    "candidate range [{start}, {end}] overlaps logical partition at [{}, {}]",
                    p.start, p.end
                ),
            });
        }
    }
    Ok(())
}

/// Create a logical (or nested extended) partition in the chain (spec
/// §4.6 "Create-partition in an EBR chain").
pub fn create_partition(
    label: &DisklabelRef,
    start_range: Geometry,
    end_range: Geometry,
    ptype: EbrPartitionType,
) -> Result<PartitionRef> {
    let handle = Handle::Disklabel(label.clone());
    let extended_handle = handle.parent().ok_or_else(|| {
        DiskforgeError::Internal("ebr chain has no owning extended partition".into())
    })?;
    let extended_start = extended_handle.start()?;
    let extended_end = extended_handle.end()?;

    let (lba_mode, is_empty_chain) = {
        let node = label.borrow();
        let DisklabelVariant::Ebr(ebr) = &node.variant else {
            return Err(DiskforgeError::Internal("expected an EBR disklabel".into()));
        };
        (ebr.lba_mode, ebr.links.is_empty())
    };
    if matches!(ptype, EbrPartitionType::Extended) && !lba_mode {
        return Err(DiskforgeError::PartitionType(
            "nested extended partitions require an LBA-extended chain".into(),
        ));
    }

    let spt = handle.chs_geometry()?.sectors_per_track as u64;
    let base = math::round(start_range.midpoint(), spt)?;
    if base < extended_start || base > extended_end || !start_range.contains(base) {
        return Err(DiskforgeError::Geometry {
            endpoint: Endpoint::Start,
            reason: format!("ebr base {base} outside start range or extended partition bounds"),
        });
    }
    let start = math::round_up(base + 1, spt)?;
    let end = math::round(end_range.midpoint(), spt)?;
    if end < start || end > extended_end || !end_range.contains(end) {
        return Err(DiskforgeError::Geometry {
            endpoint: Endpoint::End,
            reason: format!("ebr logical end {end} outside end range or precedes start"),
        });
    }

    check_overlap(label, start, end)?;

    let slot = {
        let node = label.borrow();
        let DisklabelVariant::Ebr(ebr) = &node.variant else {
            unreachable!("checked above");
        };
        ebr.links.len()
    };

    let logical = PartitionNode::new(Rc::downgrade(label), start, end, slot, PartitionVariant::Primary);
    let entry0 = MbrEntry {
        status: 0x00,
        first_chs: chs::lba_to_chs(start, handle.chs_geometry()?)?.to_bytes(),
        ptype: if matches!(ptype, EbrPartitionType::Extended) {
            TYPE_NESTED_EXTENDED
        } else {
            TYPE_LOGICAL
        },
        last_chs: chs::lba_to_chs(end, handle.chs_geometry()?)?.to_bytes(),
        first_lba: (start - base) as u32,
        sectors: (end - start + 1) as u32,
    };
    match ptype {
        EbrPartitionType::Logical => {
            logical.borrow_mut().variant = PartitionVariant::Logical;
        }
        EbrPartitionType::Extended => {
            let nested = new_empty(Handle::Partition(logical.clone()), true)?;
            logical.borrow_mut().variant = PartitionVariant::Extended {
                lba_mode: true,
                disklabel: nested,
            };
        }
    }

    {
        let mut node = label.borrow_mut();
        let DisklabelVariant::Ebr(ebr) = &mut node.variant else {
            unreachable!("checked above");
        };
        if !is_empty_chain {
            if let Some(tail) = ebr.links.last_mut() {
                tail.next_base = Some(base);
                tail.entry1 = MbrEntry {
                    status: 0x00,
                    first_chs: [0; 3],
                    ptype: TYPE_LOGICAL,
                    last_chs: [0; 3],
                    first_lba: (base - extended_start) as u32,
                    sectors: 1,
                };
            }
        }
        ebr.links.push(EbrLink {
            base,
            reserved: [0u8; 446],
            entry0,
            entry1: MbrEntry::EMPTY,
            logical: Some(logical.clone()),
            next_base: None,
        });
    }
    info!("ebr: created {:?} at [{start}, {end}] with base {base}", ptype);
    Ok(logical)
}

/// Zero the slot's logical child; if it was the chain's tail, drop the
/// link and un-chain the new tail.
pub fn remove_partition(label: &DisklabelRef, number: u32) -> Result<()> {
    let idx = number
        .checked_sub(1)
        .ok_or(DiskforgeError::PartitionNumber(number))? as usize;
    let mut node = label.borrow_mut();
    let DisklabelVariant::Ebr(ebr) = &mut node.variant else {
        return Err(DiskforgeError::Internal("expected an EBR disklabel".into()));
    };
    if idx >= ebr.links.len() || ebr.links[idx].logical.is_none() {
        return Err(DiskforgeError::PartitionNumber(number));
    }
    ebr.links[idx].logical = None;
    ebr.links[idx].entry0 = MbrEntry::EMPTY;
    if idx == ebr.links.len() - 1 {
        ebr.links.pop();
        if let Some(tail) = ebr.links.last_mut() {
            tail.next_base = None;
            tail.entry1 = MbrEntry::EMPTY;
        }
    }
    Ok(())
}

fn link_bytes(link: &EbrLink) -> Vec<u8> {
    let mut buf = vec![0u8; 512];
    buf[0..446].copy_from_slice(&link.reserved);
    buf[446..462].copy_from_slice(&link.entry0.to_bytes());
    buf[462..478].copy_from_slice(&link.entry1.to_bytes());
    // Entries 2 and 3 are always zero (spec invariant 6).
    buf[510] = 0x55;
    buf[511] = 0xAA;
    buf
}

/// `N × 512` bytes, one sector per link in chain order (spec §6
/// "Raw-dump interface").
pub fn raw(label: &DisklabelRef) -> Result<Vec<u8>> {
    let node = label.borrow();
    let DisklabelVariant::Ebr(ebr) = &node.variant else {
        return Err(DiskforgeError::Internal("expected an EBR disklabel".into()));
    };
    let mut buf = Vec::with_capacity(ebr.links.len() * 512);
    for link in &ebr.links {
        buf.extend_from_slice(&link_bytes(link));
    }
    Ok(buf)
}

/// Write each link's sector at its absolute `base` in chain order, then
/// commit every link's partition child (spec §4.6 "Commit").
pub fn commit(label: &DisklabelRef) -> Result<()> {
    let handle = Handle::Disklabel(label.clone());
    let writable = handle.with_device_mut(|dev| Ok(dev.is_writable()))?;
    if !writable {
        return Err(DiskforgeError::Partition("device was opened read-only".into()));
    }

    let (writes, logicals): (Vec<(u64, Vec<u8>)>, Vec<PartitionRef>) = {
        let node = label.borrow();
        let DisklabelVariant::Ebr(ebr) = &node.variant else {
            return Err(DiskforgeError::Internal("expected an EBR disklabel".into()));
        };
        let writes = ebr.links.iter().map(|l| (l.base, link_bytes(l))).collect();
        let logicals = ebr.links.iter().filter_map(|l| l.logical.clone()).collect();
        (writes, logicals)
    };

    for (base, bytes) in writes {
        handle.with_device_mut(|dev| {
            dev.seek(Whence::Start(base), 0)?;
            dev.write_all(&bytes)
        })?;
    }
    for logical in logicals {
        if let Some(nested) = logical.borrow().disklabel() {
            commit(&nested)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mbr::{self, MbrPartitionType};
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
    fn two_logicals_chain_and_round_trip() {
        let (_file, device) = blank_device(100);
        let mbr_label = mbr::create(Handle::Device(device.clone())).unwrap();
        device.borrow_mut().disklabel = Some(mbr_label.clone());

        let extended = mbr::create_partition(
            &mbr_label,
            Geometry::new(2048, 1).unwrap(),
            Geometry::new(204799, 1).unwrap(),
            MbrPartitionType::ExtendedLba,
        )
        .unwrap();
        let ebr_label = extended.borrow().disklabel().unwrap();

        let logical1 = create_partition(
            &ebr_label,
            Geometry::new(2048, 1).unwrap(),
            Geometry::new(102000, 1).unwrap(),
            EbrPartitionType::Logical,
        )
        .unwrap();
        let logical2 = create_partition(
            &ebr_label,
            Geometry::new(102400, 1).unwrap(),
            Geometry::new(204000, 1).unwrap(),
            EbrPartitionType::Logical,
        )
        .unwrap();
        assert!(logical1.borrow().start < logical2.borrow().start);

        mbr::commit(&mbr_label).unwrap();

        let reprobed_mbr = mbr::probe(Handle::Device(device.clone())).unwrap().unwrap();
        let node = reprobed_mbr.borrow();
        let DisklabelVariant::Mbr(mbr) = &node.variant else { panic!() };
        let reprobed_ext = mbr.children[0].as_ref().unwrap();
        let reprobed_ebr = reprobed_ext.borrow().disklabel().unwrap();
        let ebr_node = reprobed_ebr.borrow();
        let DisklabelVariant::Ebr(ebr) = &ebr_node.variant else { panic!() };
        assert_eq!(ebr.links.len(), 2);
    }

    #[test]
    fn overlap_within_chain_is_rejected() {
        let (_file, device) = blank_device(100);
        let mbr_label = mbr::create(Handle::Device(device.clone())).unwrap();
        let extended = mbr::create_partition(
            &mbr_label,
            Geometry::new(2048, 1).unwrap(),
            Geometry::new(204799, 1).unwrap(),
            MbrPartitionType::ExtendedLba,
        )
        .unwrap();
        let ebr_label = extended.borrow().disklabel().unwrap();
        create_partition(
            &ebr_label,
            Geometry::new(2048, 1).unwrap(),
            Geometry::new(102000, 1).unwrap(),
            EbrPartitionType::Logical,
        )
        .unwrap();

        let err = create_partition(
            &ebr_label,
            Geometry::new(50_000, 1).unwrap(),
            Geometry::new(150_000, 1).unwrap(),
            EbrPartitionType::Logical,
        )
        .unwrap_err();
        assert!(matches!(err, DiskforgeError::Geometry { .. }));
    }
}
