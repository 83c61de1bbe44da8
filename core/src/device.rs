//! The `BlockDevice` capability (spec component C5).
//!
//! This is the seam between the disklabel engine and whatever backend owns
//! the real storage (a Linux block special via `ioctl(HDIO_GETGEO)`, a
//! regular file, a `blkid`-derived topology probe, ...). The engine never
//! talks to the OS directly; it only ever asks for a `BlockDevice`.

use crate::error::{DiskforgeError, Result};
use crate::options::{OpenOptions as ModuleOptions, Parameter};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Origin for a seek request, expressed in whole sectors for the
/// LBA-relative addressing the engine actually uses, plus a byte offset
/// for records that don't start on a sector boundary.
#[derive(Debug, Clone, Copy)]
pub enum Whence {
    /// Absolute LBA from the start of the device.
    Start(u64),
    /// LBA relative to the current position.
    Current(i64),
    /// LBA relative to the end of the device.
    End(i64),
}

/// Disk topology as reported by the backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct Geometry3D {
    pub cylinders: u64,
    pub heads: u32,
    pub sectors_per_track: u32,
}

/// Capability the disklabel engine consumes. A backend implements this once
/// per device kind (raw block special, regular file, loopback, ...); the
/// engine is otherwise backend-agnostic.
pub trait BlockDevice {
    /// Sector size in bytes. Backends that cannot determine this should
    /// default to 512, per spec §3.
    fn sector_size(&self) -> u32;

    /// Total device size in bytes.
    fn size_bytes(&self) -> u64;

    /// CHS geometry. `Err(EHeads|ESectors)` when the backend has no
    /// topology and the caller needs one of these fields.
    fn geometry(&self) -> Result<Geometry3D>;

    /// Minimum required alignment, in bytes.
    fn minimum_alignment(&self) -> u64;

    /// Optimal alignment, in bytes (used for GPT partition placement).
    fn optimal_alignment(&self) -> u64;

    /// Seek to a sector-granular position plus an in-sector byte offset.
    fn seek(&mut self, whence: Whence, byte_offset: i64) -> Result<u64>;

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()>;

    fn write_all(&mut self, buf: &[u8]) -> Result<()>;

    /// Whether the device was opened for writing. `commit()` on any
    /// disklabel must fail before issuing a single write when this is
    /// false, matching the `readonly` open option (spec §6).
    fn is_writable(&self) -> bool;

    /// Flush any buffered writes to the underlying storage. The core never
    /// calls this itself (spec §5: "the core does not issue explicit
    /// flushes; that is the backend's responsibility") — it is exposed here
    /// so a caller driving `commit()` can request one explicitly. The
    /// default no-op suits backends (like a plain file opened without
    /// buffering) that already write through on every `write_all`.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// `set_parameter`/`get_parameter` surface (spec §6): read or override
    /// one of `CYLINDERS`/`HEADS`/`SECTORS`/`SECTOR-SIZE` at runtime. The
    /// payload-size check (native signed 64-bit width) happens in
    /// [`crate::options::set_parameter`]/[`crate::options::get_parameter`],
    /// which are the entry points callers should use; these two methods are
    /// the per-backend part of that surface.
    fn set_parameter(&mut self, param: Parameter, value: i64) -> Result<()>;

    fn get_parameter(&self, param: Parameter) -> Result<i64>;
}

/// Reference `BlockDevice` over a regular file, used for file-backed disk
/// images and for the engine's own tests. Cylinders/heads/sectors default
/// to a conventional 255/63 geometry when not overridden; a real backend
/// is expected to supply topology from the OS instead.
pub struct FileBlockDevice {
    file: File,
    sector_size: u32,
    size_bytes: u64,
    cylinders: u64,
    heads: u32,
    sectors_per_track: u32,
    minimum_alignment: u64,
    optimal_alignment: u64,
    writable: bool,
}

impl FileBlockDevice {
    pub fn open<P: AsRef<Path>>(path: P, writable: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path.as_ref())
            .map_err(|e| DiskforgeError::Path(format!("{}: {}", path.as_ref().display(), e)))?;
        let size_bytes = file.metadata().map_err(DiskforgeError::Io)?.len();
        let sector_size = 512u32;
        let sectors = size_bytes / sector_size as u64;
        // A plain file has no real CHS topology to probe (spec §3: "Geometry
        // fields may be zero when undetermined"). Rather than fabricate a
        // legacy 255/63 geometry that would silently misalign every caller's
        // chosen sector range, this falls back to a trivial one-sector grain
        // (and a one-sector "optimal" alignment below) so rounding is a
        // no-op until a caller supplies real topology via `with_geometry`/
        // `with_optimal_alignment`. A real backend over an actual block
        // device reports the kernel's ioctl(HDIO_GETGEO) geometry instead.
        let sectors_per_track = 1u32;
        let heads = 255u32;
        let cylinders = sectors / (heads as u64 * sectors_per_track as u64);
        Ok(Self {
            file,
            sector_size,
            size_bytes,
            cylinders,
            heads,
            sectors_per_track,
            minimum_alignment: sector_size as u64,
            optimal_alignment: sector_size as u64,
            writable,
        })
    }

    pub fn with_geometry(mut self, cylinders: u64, heads: u32, sectors_per_track: u32) -> Self {
        self.cylinders = cylinders;
        self.heads = heads;
        self.sectors_per_track = sectors_per_track;
        self
    }

    pub fn with_sector_size(mut self, sector_size: u32) -> Self {
        self.sector_size = sector_size;
        self
    }

    /// Override the optimal-alignment hint GPT partition placement rounds
    /// to (spec §4.7 step 1); in bytes, as reported by the real backend's
    /// topology probe.
    pub fn with_optimal_alignment(mut self, optimal_alignment: u64) -> Self {
        self.optimal_alignment = optimal_alignment;
        self
    }

    /// Open, then apply a parsed module open-option string (spec §6): the
    /// `readonly` flag and any `cylinders=`/`heads=`/`sectors=`/
    /// `sector-size=` overrides on top of whatever this constructor's
    /// probe would otherwise have guessed.
    pub fn open_with_options<P: AsRef<Path>>(path: P, options: &ModuleOptions) -> Result<Self> {
        let mut dev = Self::open(path, !options.readonly)?;
        if let Some(cylinders) = options.cylinders {
            dev.cylinders = cylinders;
        }
        if let Some(heads) = options.heads {
            dev.heads = heads;
        }
        if let Some(spt) = options.sectors_per_track {
            dev.sectors_per_track = spt;
        }
        if let Some(sector_size) = options.sector_size {
            dev.sector_size = sector_size;
        }
        Ok(dev)
    }
}

impl BlockDevice for FileBlockDevice {
    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    fn geometry(&self) -> Result<Geometry3D> {
        if self.heads == 0 {
            return Err(DiskforgeError::Heads);
        }
        if self.sectors_per_track == 0 {
            return Err(DiskforgeError::Sectors);
        }
        Ok(Geometry3D {
            cylinders: self.cylinders,
            heads: self.heads,
            sectors_per_track: self.sectors_per_track,
        })
    }

    fn minimum_alignment(&self) -> u64 {
        self.minimum_alignment
    }

    fn optimal_alignment(&self) -> u64 {
        self.optimal_alignment
    }

    fn seek(&mut self, whence: Whence, byte_offset: i64) -> Result<u64> {
        let sector_size = self.sector_size as i64;
        let pos = match whence {
            Whence::Start(lba) => SeekFrom::Start((lba as i64 * sector_size + byte_offset) as u64),
            Whence::Current(delta) => SeekFrom::Current(delta * sector_size + byte_offset),
            Whence::End(delta) => SeekFrom::End(delta * sector_size + byte_offset),
        };
        self.file.seek(pos).map_err(DiskforgeError::Io)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact(buf).map_err(DiskforgeError::Io)
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(DiskforgeError::Partition(
                "device was opened read-only".into(),
            ));
        }
        self.file.write_all(buf).map_err(DiskforgeError::Io)?;
        self.file.flush().map_err(DiskforgeError::Io)
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn flush(&mut self) -> Result<()> {
        self.file.flush().map_err(DiskforgeError::Io)
    }

    fn set_parameter(&mut self, param: Parameter, value: i64) -> Result<()> {
        match param {
            Parameter::Cylinders => self.cylinders = value as u64,
            Parameter::Heads => self.heads = value as u32,
            Parameter::Sectors => self.sectors_per_track = value as u32,
            Parameter::SectorSize => self.sector_size = value as u32,
        }
        Ok(())
    }

    fn get_parameter(&self, param: Parameter) -> Result<i64> {
        Ok(match param {
            Parameter::Cylinders => self.cylinders as i64,
            Parameter::Heads => self.heads as i64,
            Parameter::Sectors => self.sectors_per_track as i64,
            Parameter::SectorSize => self.sector_size as i64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn blank_file(mib: u64) -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        file.as_file().set_len(mib * 1024 * 1024).unwrap();
        file
    }

    #[test]
    fn open_with_options_applies_readonly_and_geometry_overrides() {
        let file = blank_file(10);
        let options = ModuleOptions::parse("readonly,cylinders=100,heads=16,sectors=32,sector-size=4096").unwrap();
        let dev = FileBlockDevice::open_with_options(file.path(), &options).unwrap();

        assert!(!dev.is_writable());
        assert_eq!(dev.sector_size(), 4096);
        let geometry = dev.geometry().unwrap();
        assert_eq!(geometry.cylinders, 100);
        assert_eq!(geometry.heads, 16);
        assert_eq!(geometry.sectors_per_track, 32);
    }

    #[test]
    fn readonly_device_rejects_writes() {
        let file = blank_file(1);
        let mut dev = FileBlockDevice::open(file.path(), false).unwrap();
        dev.seek(Whence::Start(0), 0).unwrap();
        assert!(dev.write_all(&[0u8; 512]).is_err());
    }

    #[test]
    fn flush_on_a_writable_device_succeeds() {
        let file = blank_file(1);
        let mut dev = FileBlockDevice::open(file.path(), true).unwrap();
        assert!(dev.flush().is_ok());
    }
}
