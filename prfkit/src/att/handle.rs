//! Attribute handles and the handle layout of a created service.

use crate::{bytes::*, Error};
use core::fmt;

/// A 16-bit handle uniquely identifying an attribute in the attribute database.
///
/// The `0x0000` handle (`NULL`) is invalid and is only used before a service has been created.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct AttHandle(u16);

impl AttHandle {
    /// Placeholder for "no attribute".
    pub const NULL: Self = AttHandle(0x0000);

    /// Returns the raw 16-bit integer representing this handle.
    pub fn as_u16(&self) -> u16 {
        self.0
    }

    /// Create an attribute handle from a raw u16
    pub const fn from_raw(raw: u16) -> Self {
        AttHandle(raw)
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Returns the handle `offset` positions after `self`.
    pub fn offset(&self, offset: u16) -> Self {
        AttHandle(self.0.wrapping_add(offset))
    }
}

impl fmt::Debug for AttHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06X}", self.0)
    }
}

impl FromBytes<'_> for AttHandle {
    fn from_bytes(bytes: &mut ByteReader<'_>) -> Result<Self, Error> {
        Ok(AttHandle(bytes.read_u16_le()?))
    }
}

impl ToBytes for AttHandle {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u16_le(self.0)
    }
}

/// Handles assigned to a service created from a descriptor table.
///
/// Only the table entries whose bit is set in the configuration mask are created. They get
/// consecutive handles starting at the service declaration, so the handle of table entry `i` is
/// the start handle plus the number of created entries before `i`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct ServiceLayout {
    start: AttHandle,
    cfg: u64,
}

impl ServiceLayout {
    pub fn new(start: AttHandle, cfg: u64) -> Self {
        Self { start, cfg }
    }

    /// The handle of the service declaration.
    pub fn start(&self) -> AttHandle {
        self.start
    }

    /// The configuration mask the service was created with.
    pub fn cfg(&self) -> u64 {
        self.cfg
    }

    /// Whether table entry `idx` was created.
    pub fn contains(&self, idx: usize) -> bool {
        idx < 64 && self.cfg & (1 << idx) != 0
    }

    /// Returns the handle of table entry `idx`, or `None` if the entry was not created.
    pub fn handle(&self, idx: usize) -> Option<AttHandle> {
        if self.start.is_null() || !self.contains(idx) {
            return None;
        }
        let below = self.cfg & ((1u64 << idx) - 1);
        Some(self.start.offset(below.count_ones() as u16))
    }

    /// Maps an attribute handle back to its table index.
    pub fn index_of(&self, handle: AttHandle) -> Option<usize> {
        if self.start.is_null() || handle < self.start {
            return None;
        }
        (0..64).find(|&idx| self.handle(idx) == Some(handle))
    }

    /// The number of attributes in the created service.
    pub fn len(&self) -> usize {
        self.cfg.count_ones() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_skip_absent_entries() {
        // Entries 0, 1, 2 and 4 are present, entry 3 is not.
        let layout = ServiceLayout::new(AttHandle::from_raw(0x10), 0b1_0111);
        assert_eq!(layout.handle(0), Some(AttHandle::from_raw(0x10)));
        assert_eq!(layout.handle(2), Some(AttHandle::from_raw(0x12)));
        assert_eq!(layout.handle(3), None);
        assert_eq!(layout.handle(4), Some(AttHandle::from_raw(0x13)));
        assert_eq!(layout.index_of(AttHandle::from_raw(0x13)), Some(4));
        assert_eq!(layout.index_of(AttHandle::from_raw(0x14)), None);
        assert_eq!(layout.len(), 4);
    }

    #[test]
    fn default_layout_has_no_handles() {
        let layout = ServiceLayout::default();
        assert_eq!(layout.handle(0), None);
        assert_eq!(layout.index_of(AttHandle::from_raw(1)), None);
    }
}
