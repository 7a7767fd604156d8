//! BLE UUIDs (16 or 128 bits) and the attribute type UUIDs used by the profiles.
//!
//! Shorter UUIDs can be converted to their full 128-bit counterparts by placing them in the first
//! 4 Bytes of the Bluetooth Base UUID, `00000000-0000-1000-8000-00805F9B34FB`.

use crate::{bytes::*, Error};
use core::fmt;

const BASE_UUID: [u8; 16] = [
    0x00, 0x00, 0x00, 0x00, /*-*/ 0x00, 0x00, /*-*/ 0x10, 0x00, /*-*/ 0x80, 0x00,
    /*-*/ 0x00, 0x80, 0x5F, 0x9B, 0x34, 0xFB,
];

/// A 16-bit UUID alias.
#[derive(PartialEq, Eq, Copy, Clone)]
pub struct Uuid16(pub u16);

/// A full 128-bit UUID, stored big-endian.
#[derive(PartialEq, Eq, Copy, Clone)]
pub struct Uuid128([u8; 16]);

impl Uuid128 {
    /// Creates a 128-bit UUID from 16 raw bytes (encoded in big-endian).
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// If `self` lies in the Bluetooth base range and has a 16-bit alias, returns it.
    pub fn as_uuid16(&self) -> Option<Uuid16> {
        if self.0[4..] == BASE_UUID[4..] && self.0[..2] == [0, 0] {
            Some(Uuid16(u16::from_be_bytes([self.0[2], self.0[3]])))
        } else {
            None
        }
    }
}

impl From<Uuid16> for Uuid128 {
    fn from(uuid: Uuid16) -> Self {
        let mut buf = BASE_UUID;
        buf[2..4].copy_from_slice(&uuid.0.to_be_bytes());
        Uuid128(buf)
    }
}

impl From<uuid::Uuid> for Uuid128 {
    fn from(uuid: uuid::Uuid) -> Self {
        Uuid128(*uuid.as_bytes())
    }
}

impl From<Uuid128> for uuid::Uuid {
    fn from(uuid: Uuid128) -> Self {
        uuid::Uuid::from_bytes(uuid.0)
    }
}

impl ToBytes for Uuid16 {
    fn to_bytes(&self, buffer: &mut ByteWriter<'_>) -> Result<(), Error> {
        buffer.write_u16_le(self.0)
    }
}

/// 128-bit UUIDs go over the air in little-endian order.
impl ToBytes for Uuid128 {
    fn to_bytes(&self, buffer: &mut ByteWriter<'_>) -> Result<(), Error> {
        let mut le = self.0;
        le.reverse();
        buffer.write_slice(&le)
    }
}

impl FromBytes<'_> for Uuid16 {
    fn from_bytes(bytes: &mut ByteReader<'_>) -> Result<Self, Error> {
        Ok(Uuid16(bytes.read_u16_le()?))
    }
}

impl FromBytes<'_> for Uuid128 {
    fn from_bytes(bytes: &mut ByteReader<'_>) -> Result<Self, Error> {
        let mut array: [u8; 16] = bytes.read_array()?;
        array.reverse();
        Ok(Uuid128(array))
    }
}

impl fmt::Debug for Uuid16 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uuid16({:04x})", self.0)
    }
}

impl fmt::Debug for Uuid128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", uuid::Uuid::from_bytes(self.0).to_hyphenated())
    }
}

/// UUID of an attribute (either a 16 or a 128-bit UUID).
#[derive(Copy, Clone, Eq)]
pub enum AttUuid {
    Uuid16(Uuid16),
    Uuid128(Uuid128),
}

impl AttUuid {
    /// Shorthand for a 16-bit attribute UUID, usable in `const` tables.
    pub const fn short(raw: u16) -> Self {
        AttUuid::Uuid16(Uuid16(raw))
    }
}

impl PartialEq for AttUuid {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (AttUuid::Uuid16(a), AttUuid::Uuid16(b)) => a == b,
            (AttUuid::Uuid128(a), b) | (b, AttUuid::Uuid128(a)) => {
                let b: Uuid128 = (*b).into();
                *a == b
            }
        }
    }
}

impl PartialEq<Uuid16> for AttUuid {
    fn eq(&self, other: &Uuid16) -> bool {
        *self == AttUuid::Uuid16(*other)
    }
}

impl From<Uuid16> for AttUuid {
    fn from(uu: Uuid16) -> Self {
        AttUuid::Uuid16(uu)
    }
}

impl From<Uuid128> for AttUuid {
    fn from(uu: Uuid128) -> Self {
        AttUuid::Uuid128(uu)
    }
}

impl From<AttUuid> for Uuid128 {
    fn from(uu: AttUuid) -> Self {
        match uu {
            AttUuid::Uuid16(u) => u.into(),
            AttUuid::Uuid128(u) => u,
        }
    }
}

impl FromBytes<'_> for AttUuid {
    fn from_bytes(bytes: &mut ByteReader<'_>) -> Result<Self, Error> {
        Ok(match bytes.bytes_left() {
            2 => AttUuid::Uuid16(Uuid16::from_bytes(bytes)?),
            16 => AttUuid::Uuid128(<Uuid128 as FromBytes<'_>>::from_bytes(bytes)?),
            _ => return Err(Error::InvalidLength),
        })
    }
}

impl ToBytes for AttUuid {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        match self {
            AttUuid::Uuid16(uuid) => uuid.to_bytes(writer),
            AttUuid::Uuid128(uuid) => uuid.to_bytes(writer),
        }
    }
}

impl fmt::Debug for AttUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttUuid::Uuid16(u) => u.fmt(f),
            AttUuid::Uuid128(u) => u.fmt(f),
        }
    }
}

/// GATT declaration and descriptor types.
pub mod decl {
    use super::Uuid16;

    pub const PRIMARY_SERVICE: Uuid16 = Uuid16(0x2800);
    pub const INCLUDE: Uuid16 = Uuid16(0x2802);
    pub const CHARACTERISTIC: Uuid16 = Uuid16(0x2803);

    pub const CHAR_EXT_PROPS: Uuid16 = Uuid16(0x2900);
    pub const CLIENT_CHAR_CFG: Uuid16 = Uuid16(0x2902);
    pub const CHAR_PRES_FMT: Uuid16 = Uuid16(0x2904);
    pub const EXT_REPORT_REF: Uuid16 = Uuid16(0x2907);
    pub const REPORT_REF: Uuid16 = Uuid16(0x2908);
}
