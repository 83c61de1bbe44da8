//! Partition public API (spec component C10, §4.9): thin accessors over
//! a `PartitionNode`, plus bounds-checked raw I/O confined to the
//! partition's own sector range.

use diskforge_core::device::Whence;
use diskforge_core::{DiskforgeError, Result};

use crate::tree::{DisklabelRef, Handle, PartitionRef};

pub fn type_name(partition: &PartitionRef) -> &'static str {
    partition.borrow().type_name()
}

pub fn start(partition: &PartitionRef) -> u64 {
    partition.borrow().start
}

pub fn length(partition: &PartitionRef) -> u64 {
    partition.borrow().length()
}

/// 1-based, per spec §3 "Partition.number" — `slot + 1`.
pub fn number(partition: &PartitionRef) -> u32 {
    partition.borrow().slot as u32 + 1
}

pub fn have_disklabel(partition: &PartitionRef) -> bool {
    partition.borrow().have_disklabel()
}

pub fn disklabel(partition: &PartitionRef) -> Option<DisklabelRef> {
    partition.borrow().disklabel()
}

/// Translate a `[offset_sectors, offset_sectors + sectors)` request
/// relative to the partition into an absolute device LBA, rejecting
/// anything that would read or write past the partition's own bounds.
/// Out-of-range fails `EIO` (spec §4.9 "Read/Write"), not a geometry
/// error — the range is a caller-supplied I/O request, not a candidate
/// partition layout.
fn bounds_check(partition: &PartitionRef, offset_sectors: u64, sectors: u64) -> Result<u64> {
    let node = partition.borrow();
    let partition_len = node.length();
    let range_end = offset_sectors
        .checked_add(sectors)
        .ok_or_else(|| DiskforgeError::Internal("partition I/O range overflowed".into()))?;
    if range_end > partition_len {
        return Err(DiskforgeError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!(
                "I/O range [{offset_sectors}, {range_end}) sectors exceeds partition length {partition_len}"
            ),
        )));
    }
    Ok(node.start)
}

/// Read into `buf`, `offset_sectors` sectors past the partition's start
/// (spec §4.9 "Read/Write"). Nothing is read from the device until the
/// range has been checked against the partition's own bounds.
pub fn read(partition: &PartitionRef, offset_sectors: u64, buf: &mut [u8]) -> Result<()> {
    let handle = Handle::Partition(partition.clone());
    let sector_size = handle.sector_size()? as u64;
    let sectors = (buf.len() as u64).div_ceil(sector_size).max(1);
    let partition_start = bounds_check(partition, offset_sectors, sectors)?;
    handle.with_device_mut(|dev| {
        dev.seek(Whence::Start(partition_start + offset_sectors), 0)?;
        dev.read_exact(buf)
    })
}

pub fn write(partition: &PartitionRef, offset_sectors: u64, buf: &[u8]) -> Result<()> {
    let handle = Handle::Partition(partition.clone());
    let sector_size = handle.sector_size()? as u64;
    let sectors = (buf.len() as u64).div_ceil(sector_size).max(1);
    let partition_start = bounds_check(partition, offset_sectors, sectors)?;
    handle.with_device_mut(|dev| {
        dev.seek(Whence::Start(partition_start + offset_sectors), 0)?;
        dev.write_all(buf)
    })
}

/// Always fails — relocating a partition in place is out of scope for
/// every disklabel variant (spec §9 open question 5, §1 non-goals).
pub fn move_partition(_partition: &PartitionRef, _new_start: u64) -> Result<()> {
    Err(DiskforgeError::NotSupported("move".into()))
}

/// Always fails, for the same reason as [`move_partition`].
pub fn resize(_partition: &PartitionRef, _new_length: u64) -> Result<()> {
    Err(DiskforgeError::NotSupported("resize".into()))
}
