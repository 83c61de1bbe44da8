//! `diskforge-core`: the primitives every disklabel component depends on.
//!
//! This crate has no notion of MBR/EBR/GPT; it is the seam (the
//! `BlockDevice` capability), the geometric arithmetic (`Geometry`,
//! `math`, `chs`), the checksum `diskforge-disklabel` relies on (`crc32`),
//! the error taxonomy (`error`), and the module open-option / parameter
//! surface (`options`). See spec §1 for why the backend and UI stay out.

pub mod chs;
pub mod crc32;
pub mod device;
pub mod error;
pub mod geometry;
pub mod math;
pub mod options;

pub use device::{BlockDevice, FileBlockDevice, Geometry3D, Whence};
pub use error::{DiskforgeError, Endpoint, Result};
pub use geometry::Geometry;
pub use options::{get_parameter, set_parameter, OpenOption, OpenOptions, Parameter};
