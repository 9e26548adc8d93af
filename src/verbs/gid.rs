//! Global identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::bindings::ibv_gid;

/// A 128-bit global identifier of an HCA port.
///
/// A zeroed GID is valid on fabrics that route by LID only.
#[derive(Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gid(pub [u8; 16]);

impl Gid {
    /// The all-zero GID.
    pub const ZERO: Gid = Gid([0; 16]);

    /// Whether this GID is all-zero.
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 16]
    }
}

impl fmt::Debug for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, chunk) in self.0.chunks(2).enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{:02x}{:02x}", chunk[0], chunk[1])?;
        }
        Ok(())
    }
}

impl From<ibv_gid> for Gid {
    fn from(gid: ibv_gid) -> Self {
        // SAFETY: both union members are plain byte representations.
        Gid(unsafe { gid.raw })
    }
}

impl From<Gid> for ibv_gid {
    fn from(gid: Gid) -> Self {
        ibv_gid { raw: gid.0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_through_raw() {
        let mut bytes = [0u8; 16];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = 0x10 + i as u8;
        }
        let gid = Gid(bytes);
        assert_eq!(Gid::from(ibv_gid::from(gid)), gid);
        assert!(!gid.is_zero());
        assert!(Gid::ZERO.is_zero());
    }

    #[test]
    fn debug_renders_colon_groups() {
        let gid = Gid([0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(
            format!("{:?}", gid),
            "fe80:0000:0000:0000:0000:0000:0000:0001"
        );
    }
}
