//! Fixed-size chunks with sorted, coalescing free-range tables.
//!
//! A [`Chunk`] is a 4 MiB slab: a small metadata header (the free-range
//! table and counters) followed by the data area payloads are carved from.
//! Each chunk belongs to exactly one tenant at a time and is guarded by its
//! own lock in the arena, so chunks of different tenants never contend.
//!
//! Allocation is first-fit with a cached hint: the range that satisfied
//! the previous request is probed first, then the table is scanned from
//! the lowest offset. Freed spans are merged with both neighbours, so the
//! table always holds maximal, non-overlapping, offset-sorted ranges.
//!
//! A start bitmap with one bit per [`CHUNK_ALIGN`] bytes marks where live
//! spans begin. A free is only accepted at a marked start, so a span that
//! was freed and then covered by a larger allocation cannot be freed again
//! through its old offset.

use strata_core::TenantId;

use crate::address_space::CommittedPages;

/// Size of one chunk in the small-pool address range.
pub const CHUNK_BYTES: usize = 4 * 1024 * 1024;

/// Bytes of each chunk reserved for the metadata header.
pub const CHUNK_METADATA_BYTES: usize = 4096;

/// Usable data-area bytes per chunk.
pub const CHUNK_DATA_BYTES: usize = CHUNK_BYTES - CHUNK_METADATA_BYTES;

/// Capacity of the free-range table. The table never grows past this.
pub const MAX_FREE_RANGES: usize = 498;

/// Allocation granularity within a chunk.
pub const CHUNK_ALIGN: u32 = 8;

/// A contiguous run of free bytes in a chunk's data area.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreeRange {
    /// Offset of the first free byte.
    pub start: u32,
    /// Number of free bytes.
    pub len: u32,
}

impl FreeRange {
    /// One past the last free byte.
    pub fn end(&self) -> u32 {
        self.start + self.len
    }
}

/// Why a [`Chunk::free`] call was refused. The chunk is unchanged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FreeRejection {
    /// The span is empty, misaligned, or runs past the data area.
    OutOfBounds,
    /// The span overlaps bytes that are already free.
    Overlap,
    /// The span would need a new table entry and the table is full.
    TableFull,
    /// No live span starts at the offset.
    NotAllocated,
}

const START_WORDS: usize = CHUNK_DATA_BYTES / CHUNK_ALIGN as usize / 64;

/// Point-in-time usage summary of one chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkUsage {
    /// Slot index of the chunk.
    pub index: u32,
    /// Owning tenant, `None` while decommitted.
    pub owner: Option<TenantId>,
    /// Current generation tag.
    pub generation: u8,
    /// Total free bytes.
    pub free_bytes: u32,
    /// Total used bytes (headers and alignment padding included).
    pub used_bytes: u32,
    /// Number of entries in the free-range table.
    pub free_ranges: usize,
    /// Size of the largest free range.
    pub largest_free: u32,
    /// Cached allocation hint.
    pub hint: usize,
}

/// A slab of the small pool.
#[derive(Debug)]
pub struct Chunk {
    index: u32,
    generation: u8,
    owner: Option<TenantId>,
    pages: Option<CommittedPages>,
    free_ranges: Vec<FreeRange>,
    starts: Box<[u64]>,
    total_free: u32,
    total_used: u32,
    hint: usize,
}

impl Chunk {
    /// Construct a chunk over freshly committed pages for `tenant`.
    ///
    /// # Panics
    ///
    /// Panics if `pages` is not exactly [`CHUNK_DATA_BYTES`] long.
    pub fn new(index: u32, tenant: TenantId, pages: CommittedPages) -> Self {
        let mut chunk = Self {
            index,
            generation: 0,
            owner: None,
            pages: None,
            free_ranges: Vec::with_capacity(MAX_FREE_RANGES),
            starts: vec![0; START_WORDS].into_boxed_slice(),
            total_free: 0,
            total_used: 0,
            hint: 0,
        };
        chunk.install(tenant, pages);
        chunk
    }

    /// Reinitialise a recycled chunk for `tenant`.
    ///
    /// The free-range table collapses to a single range spanning the data
    /// area, the data is zeroed, and the generation advances so handles
    /// minted before the reset are recognised as stale.
    pub fn reset(&mut self, tenant: TenantId, pages: CommittedPages) {
        self.generation = self.generation.wrapping_add(1);
        self.install(tenant, pages);
    }

    fn install(&mut self, tenant: TenantId, mut pages: CommittedPages) {
        assert_eq!(
            pages.len(),
            CHUNK_DATA_BYTES,
            "chunk pages must cover the data area"
        );
        pages.as_mut_slice().fill(0);
        self.owner = Some(tenant);
        self.pages = Some(pages);
        self.free_ranges.clear();
        self.free_ranges.push(FreeRange {
            start: 0,
            len: CHUNK_DATA_BYTES as u32,
        });
        self.starts.fill(0);
        self.total_free = CHUNK_DATA_BYTES as u32;
        self.total_used = 0;
        self.hint = 0;
    }

    /// Detach the chunk from its tenant and hand back its pages for
    /// decommit. Returns `None` if the chunk was already retired.
    pub fn retire(&mut self) -> Option<CommittedPages> {
        let pages = self.pages.take()?;
        self.owner = None;
        self.free_ranges.clear();
        self.starts.fill(0);
        self.total_free = 0;
        self.total_used = 0;
        self.hint = 0;
        Some(pages)
    }

    /// Carve `size` bytes from the data area.
    ///
    /// `size` must already include the allocation header and be a multiple
    /// of [`CHUNK_ALIGN`]. Returns the offset of the span, or `None` if no
    /// free range is large enough (or the chunk is retired).
    pub fn allocate(&mut self, size: u32) -> Option<u32> {
        if size == 0 || size as usize > CHUNK_DATA_BYTES || self.pages.is_none() {
            return None;
        }
        debug_assert_eq!(size % CHUNK_ALIGN, 0);

        let index = match self.free_ranges.get(self.hint) {
            Some(range) if range.len >= size => self.hint,
            _ => self.free_ranges.iter().position(|r| r.len >= size)?,
        };

        let range = &mut self.free_ranges[index];
        let start = range.start;
        if range.len == size {
            self.free_ranges.remove(index);
            self.hint = if index < self.free_ranges.len() { index } else { 0 };
        } else {
            range.start += size;
            range.len -= size;
            self.hint = index;
        }
        self.total_free -= size;
        self.total_used += size;
        self.mark_start(start, true);
        Some(start)
    }

    /// Return the span `offset..offset + size` to the free-range table.
    ///
    /// Merges with the preceding and following ranges when they touch the
    /// span. A span that overlaps free bytes, that does not begin where a
    /// live span begins, or that needs a new entry while the table is full,
    /// is refused and the chunk is left as is.
    pub fn free(&mut self, offset: u32, size: u32) -> Result<(), FreeRejection> {
        let in_bounds = size > 0
            && offset % CHUNK_ALIGN == 0
            && size % CHUNK_ALIGN == 0
            && (offset as usize + size as usize) <= CHUNK_DATA_BYTES;
        if !in_bounds || self.pages.is_none() {
            return Err(FreeRejection::OutOfBounds);
        }

        let end = offset + size;
        let index = self.free_ranges.partition_point(|r| r.start < offset);
        let prev = index.checked_sub(1).map(|i| self.free_ranges[i]);
        let next = self.free_ranges.get(index).copied();

        if prev.is_some_and(|p| p.end() > offset) || next.is_some_and(|n| n.start < end) {
            return Err(FreeRejection::Overlap);
        }
        if !self.is_allocation_start(offset) {
            return Err(FreeRejection::NotAllocated);
        }
        let merge_prev = prev.is_some_and(|p| p.end() == offset);
        let merge_next = next.is_some_and(|n| n.start == end);

        let merged = match (merge_prev, merge_next) {
            (true, true) => {
                let absorbed = self.free_ranges.remove(index);
                self.free_ranges[index - 1].len += size + absorbed.len;
                if self.hint >= index {
                    self.hint = self.hint.saturating_sub(1);
                }
                index - 1
            }
            (true, false) => {
                self.free_ranges[index - 1].len += size;
                index - 1
            }
            (false, true) => {
                let range = &mut self.free_ranges[index];
                range.start = offset;
                range.len += size;
                index
            }
            (false, false) => {
                if self.free_ranges.len() >= MAX_FREE_RANGES {
                    return Err(FreeRejection::TableFull);
                }
                self.free_ranges.insert(index, FreeRange { start: offset, len: size });
                if self.hint >= index && self.free_ranges.len() > 1 {
                    self.hint += 1;
                }
                index
            }
        };

        // Prefer the lowest recently freed range for the next fast path.
        self.hint = self.hint.min(merged);
        self.total_free += size;
        self.total_used -= size;
        self.mark_start(offset, false);
        Ok(())
    }

    /// Whether a live span begins at `offset`.
    pub fn is_allocation_start(&self, offset: u32) -> bool {
        if offset % CHUNK_ALIGN != 0 {
            return false;
        }
        let bit = (offset / CHUNK_ALIGN) as usize;
        self.starts
            .get(bit / 64)
            .is_some_and(|&word| word & (1u64 << (bit % 64)) != 0)
    }

    fn mark_start(&mut self, offset: u32, live: bool) {
        let bit = (offset / CHUNK_ALIGN) as usize;
        if let Some(word) = self.starts.get_mut(bit / 64) {
            if live {
                *word |= 1u64 << (bit % 64);
            } else {
                *word &= !(1u64 << (bit % 64));
            }
        }
    }

    /// Slot index of this chunk.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Current generation tag.
    pub fn generation(&self) -> u8 {
        self.generation
    }

    /// Owning tenant, `None` while retired.
    pub fn owner(&self) -> Option<TenantId> {
        self.owner
    }

    /// Whether the chunk currently has committed pages.
    pub fn is_committed(&self) -> bool {
        self.pages.is_some()
    }

    /// Total free bytes.
    pub fn total_free(&self) -> u32 {
        self.total_free
    }

    /// Total used bytes.
    pub fn total_used(&self) -> u32 {
        self.total_used
    }

    /// The free-range table, sorted by offset.
    pub fn free_ranges(&self) -> &[FreeRange] {
        &self.free_ranges
    }

    /// Cached allocation hint.
    pub fn hint(&self) -> usize {
        self.hint
    }

    /// Bytes `offset..offset + len` of the data area.
    pub fn bytes(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let pages = self.pages.as_ref()?;
        pages.as_slice().get(offset..offset.checked_add(len)?)
    }

    /// Bytes `offset..offset + len` of the data area, mutably.
    pub fn bytes_mut(&mut self, offset: usize, len: usize) -> Option<&mut [u8]> {
        let pages = self.pages.as_mut()?;
        pages.as_mut_slice().get_mut(offset..offset.checked_add(len)?)
    }

    /// Usage summary.
    pub fn usage(&self) -> ChunkUsage {
        ChunkUsage {
            index: self.index,
            owner: self.owner,
            generation: self.generation,
            free_bytes: self.total_free,
            used_bytes: self.total_used,
            free_ranges: self.free_ranges.len(),
            largest_free: self.free_ranges.iter().map(|r| r.len).max().unwrap_or(0),
            hint: self.hint,
        }
    }

    /// Check the free-range table invariants: ranges are non-empty,
    /// sorted, non-overlapping, never adjacent, within the data area, and
    /// free + used bytes account for the whole data area.
    pub fn is_consistent(&self) -> bool {
        if self.pages.is_none() {
            return self.free_ranges.is_empty() && self.total_free == 0 && self.total_used == 0;
        }
        let sorted_and_merged = self
            .free_ranges
            .windows(2)
            .all(|w| w[0].end() < w[1].start);
        let in_bounds = self
            .free_ranges
            .iter()
            .all(|r| r.len > 0 && r.end() as usize <= CHUNK_DATA_BYTES);
        let sum: u64 = self.free_ranges.iter().map(|r| r.len as u64).sum();
        sorted_and_merged
            && in_bounds
            && self.free_ranges.len() <= MAX_FREE_RANGES
            && sum == self.total_free as u64
            && self.total_free as usize + self.total_used as usize == CHUNK_DATA_BYTES
    }
}
