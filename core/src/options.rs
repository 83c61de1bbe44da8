//! Module open-option and `set_parameter`/`get_parameter` surface (spec §6).
//!
//! The source parses a comma-separated suboption string into a global
//! mutable `options[]` array; per the redesign notes in spec §9 this
//! becomes a plain enumeration with string-to-enum lookup plus a
//! configuration struct the backend constructor consumes directly.

use crate::device::BlockDevice;
use crate::error::{DiskforgeError, Result};

/// One `key=value` (or bare `key`) open option, recognized case-sensitively
/// on the key per spec §6's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOption {
    ReadOnly,
    Cylinders(u64),
    Heads(u32),
    SectorsPerTrack(u32),
    SectorSize(u32),
}

/// Parsed module open options, applied on top of whatever topology the
/// backend probed.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOptions {
    pub readonly: bool,
    pub cylinders: Option<u64>,
    pub heads: Option<u32>,
    pub sectors_per_track: Option<u32>,
    pub sector_size: Option<u32>,
}

impl OpenOptions {
    /// Parse a comma-separated suboption string, e.g.
    /// `"readonly,cylinders=1024,heads=255"`.
    pub fn parse(suboptions: &str) -> Result<Self> {
        let mut out = OpenOptions::default();
        for raw in suboptions.split(',').filter(|s| !s.is_empty()) {
            out.apply(parse_one(raw)?);
        }
        Ok(out)
    }

    fn apply(&mut self, option: OpenOption) {
        match option {
            OpenOption::ReadOnly => self.readonly = true,
            OpenOption::Cylinders(n) => self.cylinders = Some(n),
            OpenOption::Heads(n) => self.heads = Some(n),
            OpenOption::SectorsPerTrack(n) => self.sectors_per_track = Some(n),
            OpenOption::SectorSize(n) => self.sector_size = Some(n),
        }
    }
}

fn parse_one(raw: &str) -> Result<OpenOption> {
    match raw.split_once('=') {
        None if raw == "readonly" => Ok(OpenOption::ReadOnly),
        Some(("cylinders", v)) => Ok(OpenOption::Cylinders(parse_u64(v)?)),
        Some(("heads", v)) => Ok(OpenOption::Heads(parse_u32(v)?)),
        Some(("sectors", v)) => Ok(OpenOption::SectorsPerTrack(parse_u32(v)?)),
        Some(("sector-size", v)) => Ok(OpenOption::SectorSize(parse_u32(v)?)),
        _ => Err(DiskforgeError::Parameter(raw.to_string())),
    }
}

fn parse_u64(v: &str) -> Result<u64> {
    v.parse().map_err(|_| DiskforgeError::Parameter(v.to_string()))
}

fn parse_u32(v: &str) -> Result<u32> {
    v.parse().map_err(|_| DiskforgeError::Parameter(v.to_string()))
}

/// The four runtime-settable geometry parameters recognized by
/// `set_parameter`/`get_parameter`, case-insensitive on the name (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parameter {
    Cylinders,
    Heads,
    Sectors,
    SectorSize,
}

impl Parameter {
    /// Payload size every parameter carries: a native signed 64-bit width.
    pub const PAYLOAD_SIZE: usize = 8;

    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_uppercase().as_str() {
            "CYLINDERS" => Ok(Parameter::Cylinders),
            "HEADS" => Ok(Parameter::Heads),
            "SECTORS" => Ok(Parameter::Sectors),
            "SECTOR-SIZE" => Ok(Parameter::SectorSize),
            _ => Err(DiskforgeError::Parameter(name.to_string())),
        }
    }

    /// Validate a payload length against [`Self::PAYLOAD_SIZE`].
    pub fn check_payload(len: usize) -> Result<()> {
        if len != Self::PAYLOAD_SIZE {
            return Err(DiskforgeError::ParameterSize {
                expected: Self::PAYLOAD_SIZE,
                got: len,
            });
        }
        Ok(())
    }
}

/// `set_parameter` entry point (spec §6): `name` is looked up
/// case-insensitively, `payload` must be exactly [`Parameter::PAYLOAD_SIZE`]
/// bytes (a native little-endian signed 64-bit width), and the decoded
/// value is handed to the backend.
pub fn set_parameter(device: &mut dyn BlockDevice, name: &str, payload: &[u8]) -> Result<()> {
    let param = Parameter::parse(name)?;
    Parameter::check_payload(payload.len())?;
    let value = i64::from_le_bytes(payload.try_into().unwrap());
    device.set_parameter(param, value)
}

/// `get_parameter` entry point: reads the named parameter back out of the
/// backend and writes it into `out` as a native little-endian signed
/// 64-bit value. `out` must be exactly [`Parameter::PAYLOAD_SIZE`] bytes.
pub fn get_parameter(device: &dyn BlockDevice, name: &str, out: &mut [u8]) -> Result<()> {
    let param = Parameter::parse(name)?;
    Parameter::check_payload(out.len())?;
    let value = device.get_parameter(param)?;
    out.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_combined_suboptions() {
        let opts = OpenOptions::parse("readonly,cylinders=1024,heads=255,sectors=63,sector-size=4096")
            .unwrap();
        assert!(opts.readonly);
        assert_eq!(opts.cylinders, Some(1024));
        assert_eq!(opts.heads, Some(255));
        assert_eq!(opts.sectors_per_track, Some(63));
        assert_eq!(opts.sector_size, Some(4096));
    }

    #[test]
    fn unknown_key_is_rejected() {
        assert!(OpenOptions::parse("bogus=1").is_err());
    }

    #[test]
    fn parameter_name_is_case_insensitive() {
        assert_eq!(Parameter::parse("sector-size").unwrap(), Parameter::SectorSize);
        assert_eq!(Parameter::parse("SECTOR-SIZE").unwrap(), Parameter::SectorSize);
    }

    #[test]
    fn parameter_payload_size_is_checked() {
        assert!(Parameter::check_payload(8).is_ok());
        assert!(matches!(
            Parameter::check_payload(4),
            Err(DiskforgeError::ParameterSize { expected: 8, got: 4 })
        ));
    }

    #[test]
    fn set_parameter_then_get_parameter_round_trips_through_a_device() {
        use crate::device::FileBlockDevice;
        use tempfile::NamedTempFile;

        let file = NamedTempFile::new().unwrap();
        file.as_file().set_len(10 * 1024 * 1024).unwrap();
        let mut dev = FileBlockDevice::open(file.path(), true).unwrap();

        set_parameter(&mut dev, "heads", &16i64.to_le_bytes()).unwrap();
        let mut out = [0u8; 8];
        get_parameter(&dev, "HEADS", &mut out).unwrap();
        assert_eq!(i64::from_le_bytes(out), 16);
    }

    #[test]
    fn set_parameter_rejects_wrong_payload_size() {
        use crate::device::FileBlockDevice;
        use tempfile::NamedTempFile;

        let file = NamedTempFile::new().unwrap();
        file.as_file().set_len(10 * 1024 * 1024).unwrap();
        let mut dev = FileBlockDevice::open(file.path(), true).unwrap();

        assert!(matches!(
            set_parameter(&mut dev, "heads", &[1, 2, 3]),
            Err(DiskforgeError::ParameterSize { expected: 8, got: 3 })
        ));
    }
}
