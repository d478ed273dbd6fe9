//! Strongly-typed identifiers for tenants and memory regions.

use std::fmt;

/// Identifies a tenant: one isolation boundary per open document.
///
/// Tenants are created implicitly by their first allocation and destroyed
/// by `notify_tenant_closed`. The id itself carries no state, so a closed
/// tenant id may be reused and starts a fresh history.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TenantId(pub u32);

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for TenantId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

/// The two segregated allocation pools.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Pool {
    /// Chunk-based, tenant-affine pool for small payloads.
    Small,
    /// Directly committed blocks for payloads above the large threshold.
    Large,
}

/// Packed identifier of the region an allocation lives in.
///
/// Layout of the 32-bit word:
///
/// ```text
///  31  30 ............................ 8  7 ........ 0
/// ┌────┬───────────────────────────────┬─────────────┐
/// │pool│        slot index (23 bits)   │ generation  │
/// └────┴───────────────────────────────┴─────────────┘
/// ```
///
/// For the small pool the slot index is the chunk index; for the large
/// pool it indexes the large-block table. The generation tag is compared
/// against the slot's current generation to detect stale handles. It wraps
/// modulo 256.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionId(u32);

impl RegionId {
    const LARGE_BIT: u32 = 1 << 31;
    const INDEX_SHIFT: u32 = 8;

    /// Largest slot index that fits in the packed layout.
    pub const MAX_INDEX: u32 = (1 << 23) - 1;

    /// A region in the small (chunk) pool.
    ///
    /// # Panics
    ///
    /// Panics if `index` exceeds [`RegionId::MAX_INDEX`].
    pub fn small(index: u32, generation: u8) -> Self {
        assert!(index <= Self::MAX_INDEX, "chunk index {index} out of range");
        Self((index << Self::INDEX_SHIFT) | generation as u32)
    }

    /// A region in the large-block pool.
    ///
    /// # Panics
    ///
    /// Panics if `index` exceeds [`RegionId::MAX_INDEX`].
    pub fn large(index: u32, generation: u8) -> Self {
        assert!(index <= Self::MAX_INDEX, "block index {index} out of range");
        Self(Self::LARGE_BIT | (index << Self::INDEX_SHIFT) | generation as u32)
    }

    /// Which pool this region belongs to.
    pub fn pool(self) -> Pool {
        if self.0 & Self::LARGE_BIT == 0 {
            Pool::Small
        } else {
            Pool::Large
        }
    }

    /// Slot index within the owning pool.
    pub fn index(self) -> u32 {
        (self.0 & !Self::LARGE_BIT) >> Self::INDEX_SHIFT
    }

    /// Generation tag captured when the handle was minted.
    pub fn generation(self) -> u8 {
        self.0 as u8
    }

    /// Raw packed representation.
    pub fn to_bits(self) -> u32 {
        self.0
    }

    /// Rebuild from the packed representation.
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }
}

impl fmt::Debug for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionId")
            .field("pool", &self.pool())
            .field("index", &self.index())
            .field("generation", &self.generation())
            .finish()
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pool = match self.pool() {
            Pool::Small => "chunk",
            Pool::Large => "block",
        };
        write!(f, "{pool}#{}@g{}", self.index(), self.generation())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_region_round_trip() {
        let r = RegionId::small(1234, 7);
        assert_eq!(r.pool(), Pool::Small);
        assert_eq!(r.index(), 1234);
        assert_eq!(r.generation(), 7);
        assert_eq!(RegionId::from_bits(r.to_bits()), r);
    }

    #[test]
    fn large_region_sets_pool_bit() {
        let r = RegionId::large(RegionId::MAX_INDEX, 255);
        assert_eq!(r.pool(), Pool::Large);
        assert_eq!(r.index(), RegionId::MAX_INDEX);
        assert_eq!(r.generation(), 255);
    }

    #[test]
    fn same_index_different_pool_is_distinct() {
        assert_ne!(RegionId::small(3, 0), RegionId::large(3, 0));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn oversized_index_panics() {
        let _ = RegionId::small(RegionId::MAX_INDEX + 1, 0);
    }

    #[test]
    fn display_names_pool() {
        assert_eq!(RegionId::small(2, 1).to_string(), "chunk#2@g1");
        assert_eq!(RegionId::large(9, 0).to_string(), "block#9@g0");
        assert_eq!(TenantId(5).to_string(), "5");
    }
}
