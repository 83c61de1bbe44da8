//! Rounding and checked division helpers (spec component C2).
//!
//! Every placement decision in the disklabel engine starts from a midpoint
//! and snaps it to a grain (a sectors-per-track count for MBR/EBR, an
//! optimal-alignment sector count for GPT). This module is the one place
//! that arithmetic lives so the rounding tie-break rule stays consistent.

use crate::error::{DiskforgeError, Result};

/// Round `v` to the nearest multiple of `grain`, ties breaking down.
pub fn round(v: u64, grain: u64) -> Result<u64> {
    let down = round_down(v, grain)?;
    let up = round_up(v, grain)?;
    if up - v < v - down {
        Ok(up)
    } else {
        Ok(down)
    }
}

pub fn round_down(v: u64, grain: u64) -> Result<u64> {
    if grain == 0 {
        return Err(DiskforgeError::Internal("round by zero grain".into()));
    }
    Ok((v / grain) * grain)
}

pub fn round_up(v: u64, grain: u64) -> Result<u64> {
    if grain == 0 {
        return Err(DiskforgeError::Internal("round by zero grain".into()));
    }
    let down = round_down(v, grain)?;
    if down == v {
        Ok(down)
    } else {
        Ok(down + grain)
    }
}

/// Checked division; `EInternal` on division by zero rather than a panic,
/// matching the spec's treatment of zero grains/geometry.
pub fn checked_div(a: u64, b: u64) -> Result<u64> {
    a.checked_div(b)
        .ok_or_else(|| DiskforgeError::Internal("division by zero".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_ties_break_down() {
        assert_eq!(round(10, 4).unwrap(), 8);
        assert_eq!(round(11, 4).unwrap(), 12);
        assert_eq!(round(12, 4).unwrap(), 12);
    }

    #[test]
    fn round_up_down_exact() {
        assert_eq!(round_up(16, 4).unwrap(), 16);
        assert_eq!(round_down(16, 4).unwrap(), 16);
        assert_eq!(round_up(17, 4).unwrap(), 20);
        assert_eq!(round_down(17, 4).unwrap(), 16);
    }

    #[test]
    fn zero_grain_is_internal_error() {
        assert!(matches!(round(1, 0), Err(DiskforgeError::Internal(_))));
        assert!(matches!(checked_div(1, 0), Err(DiskforgeError::Internal(_))));
    }
}
