//! Allocation handles.
//!
//! An [`AllocHandle`] replaces a raw payload pointer. It names the region
//! the payload lives in, the payload offset inside that region's data
//! area, and the requested payload length. Every payload is preceded in
//! its region by an 8-byte size header; the handle never exposes it.

use std::fmt;

use crate::id::RegionId;

/// Handle to a live allocation.
///
/// Handles are plain `Copy` values: holding one does not keep the memory
/// alive, and using a handle after `free` (or after its tenant closed) is
/// detected through the region's generation tag where possible.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AllocHandle {
    region: RegionId,
    offset: u32,
    len: u32,
}

impl AllocHandle {
    /// Size of the packed little-endian encoding: region, offset, length.
    pub const ENCODED_LEN: usize = 12;

    /// Size of the header stored immediately before every payload.
    pub const HEADER_BYTES: u32 = 8;

    /// Create a handle. Intended for allocator implementations.
    pub fn new(region: RegionId, offset: u32, len: u32) -> Self {
        Self {
            region,
            offset,
            len,
        }
    }

    /// The region this allocation lives in.
    pub fn region(&self) -> RegionId {
        self.region
    }

    /// Payload offset within the region's data area.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Requested payload length in bytes.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Whether the payload is zero bytes long.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The same allocation with a different recorded length.
    pub fn with_len(self, len: u32) -> Self {
        Self { len, ..self }
    }

    /// Encode as 12 little-endian bytes (region, offset, length).
    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[0..4].copy_from_slice(&self.region.to_bits().to_le_bytes());
        out[4..8].copy_from_slice(&self.offset.to_le_bytes());
        out[8..12].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    /// Decode from the 12-byte form produced by [`AllocHandle::to_bytes`].
    pub fn from_bytes(bytes: [u8; Self::ENCODED_LEN]) -> Self {
        let word =
            |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Self {
            region: RegionId::from_bits(word(0)),
            offset: word(4),
            len: word(8),
        }
    }
}

impl fmt::Display for AllocHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AllocHandle({}, off={}, len={})",
            self.region, self.offset, self.len
        )
    }
}
