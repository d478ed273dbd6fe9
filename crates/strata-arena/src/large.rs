//! Large-object pool.
//!
//! Payloads too big for a chunk get their own span in the upper half of
//! the reservation. Spans are page multiples, placed first-fit from a free
//! map ordered by offset, or bump-allocated past the highest span in use.
//! Released spans coalesce with their neighbours and roll the bump pointer
//! back when they end at it.
//!
//! Live blocks sit in a slot table with a per-slot generation so handles to
//! released blocks are recognised as stale. Each block's pages carry their
//! own lock, so payload access holds the arena lock only long enough to
//! clone the block's [`BlockPages`].

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use strata_core::{AllocError, RegionId, TenantId};

use crate::address_space::{CommittedPages, PAGE_SIZE};

/// Bytes in front of every large payload: 8 bytes of padding followed by
/// the 8-byte size header. Keeps payloads 16-byte aligned.
pub const LARGE_HEADER_BYTES: u32 = 16;

/// Span needed for a large payload of `size` bytes, in whole pages.
pub fn large_span(size: u64) -> u64 {
    (LARGE_HEADER_BYTES as u64 + size).div_ceil(PAGE_SIZE as u64) * PAGE_SIZE as u64
}

/// Committed bytes of one large block. `None` once the block is released.
pub type BlockPages = Arc<Mutex<Option<CommittedPages>>>;

/// A committed large allocation.
#[derive(Debug)]
pub struct LargeBlock {
    /// Tenant that allocated the block.
    pub owner: TenantId,
    /// Offset of the span within the large region.
    pub start: u64,
    /// Span length in bytes.
    pub span: u64,
    /// Committed bytes of the span, shared with in-flight accessors.
    pub pages: BlockPages,
}

impl LargeBlock {
    /// Wrap freshly committed `pages` for `owner`.
    pub fn new(owner: TenantId, start: u64, span: u64, pages: CommittedPages) -> Self {
        Self {
            owner,
            start,
            span,
            pages: Arc::new(Mutex::new(Some(pages))),
        }
    }

    /// Take the pages out for decommit. Waits for any accessor still
    /// holding the block; later accessors find it empty.
    pub fn take_pages(&self) -> Option<CommittedPages> {
        self.pages.lock().take()
    }
}

#[derive(Debug)]
struct Slot {
    generation: u8,
    block: Option<LargeBlock>,
}

/// Placement and slot bookkeeping for large blocks.
#[derive(Debug)]
pub struct LargePool {
    region_len: u64,
    min_split: u64,
    bump: u64,
    /// Free spans below `bump`: start → length.
    free: BTreeMap<u64, u64>,
    slots: Vec<Slot>,
    free_slots: Vec<u32>,
    live: usize,
}

impl LargePool {
    /// Create a pool managing `region_len` bytes.
    pub fn new(region_len: u64, min_split: u32) -> Self {
        Self {
            region_len,
            min_split: min_split as u64,
            bump: 0,
            free: BTreeMap::new(),
            slots: Vec::new(),
            free_slots: Vec::new(),
            live: 0,
        }
    }

    /// Find room for a span of `span` bytes. Returns `(start, span)`; the
    /// span handed out may be longer than asked for when splitting the
    /// free span would leave less than the split threshold.
    pub fn place(&mut self, span: u64) -> Option<(u64, u64)> {
        let found = self
            .free
            .iter()
            .find(|&(_, &len)| len >= span)
            .map(|(&start, &len)| (start, len));
        if let Some((start, len)) = found {
            self.free.remove(&start);
            let rest = len - span;
            if rest >= self.min_split {
                self.free.insert(start + span, rest);
                return Some((start, span));
            }
            return Some((start, len));
        }

        let end = self.bump.checked_add(span)?;
        if end > self.region_len {
            return None;
        }
        let start = self.bump;
        self.bump = end;
        Some((start, span))
    }

    /// Return a span to the free map, merging neighbours.
    pub fn unplace(&mut self, start: u64, span: u64) {
        let mut start = start;
        let mut len = span;

        if let Some((&prev, &prev_len)) = self.free.range(..start).next_back() {
            if prev + prev_len == start {
                self.free.remove(&prev);
                start = prev;
                len += prev_len;
            }
        }
        if let Some(next_len) = self.free.remove(&(start + len)) {
            len += next_len;
        }

        if start + len == self.bump {
            self.bump = start;
        } else {
            self.free.insert(start, len);
        }
    }

    /// Whether another block can be registered.
    pub fn has_free_slot(&self) -> bool {
        !self.free_slots.is_empty() || self.slots.len() as u64 <= RegionId::MAX_INDEX as u64
    }

    /// Register a committed block and mint its region id.
    ///
    /// # Panics
    ///
    /// Panics if [`LargePool::has_free_slot`] is false.
    pub fn insert(&mut self, block: LargeBlock) -> RegionId {
        let index = match self.free_slots.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    block: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.block = Some(block);
        self.live += 1;
        RegionId::large(index, slot.generation)
    }

    /// The live block named by `region`.
    pub fn get(&self, region: RegionId) -> Result<&LargeBlock, AllocError> {
        let slot = self
            .slots
            .get(region.index() as usize)
            .ok_or(AllocError::InvalidHandle { region })?;
        match &slot.block {
            Some(block) if slot.generation == region.generation() => Ok(block),
            _ => Err(AllocError::StaleHandle { region }),
        }
    }

    /// Unregister the block named by `region` and free its span. The
    /// caller decommits the returned pages.
    pub fn remove(&mut self, region: RegionId) -> Result<LargeBlock, AllocError> {
        self.get(region)?;
        let index = region.index();
        let slot = &mut self.slots[index as usize];
        let block = slot.block.take().ok_or(AllocError::StaleHandle { region })?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_slots.push(index);
        self.live -= 1;
        self.unplace(block.start, block.span);
        Ok(block)
    }

    /// Region ids of every live block owned by `tenant`.
    pub fn blocks_of(&self, tenant: TenantId) -> Vec<RegionId> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| match &slot.block {
                Some(b) if b.owner == tenant => Some(RegionId::large(i as u32, slot.generation)),
                _ => None,
            })
            .collect()
    }

    /// Unregister every live block, leaving the pool empty.
    pub fn drain(&mut self) -> Vec<LargeBlock> {
        let blocks: Vec<LargeBlock> = self
            .slots
            .iter_mut()
            .filter_map(|slot| slot.block.take())
            .collect();
        self.slots.clear();
        self.free_slots.clear();
        self.free.clear();
        self.bump = 0;
        self.live = 0;
        blocks
    }

    /// Number of live blocks.
    pub fn live_blocks(&self) -> usize {
        self.live
    }

    /// Number of entries in the free map.
    pub fn free_spans(&self) -> usize {
        self.free.len()
    }

    /// Offset one past the highest span handed out.
    pub fn high_water(&self) -> u64 {
        self.bump
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_space::{AddressSpace, HeapAddressSpace};

    const PAGE: u64 = PAGE_SIZE as u64;

    fn block(space: &HeapAddressSpace, owner: u32, start: u64, span: u64) -> LargeBlock {
        let reservation = space.reserve(1 << 30).unwrap();
        LargeBlock::new(
            TenantId(owner),
            start,
            span,
            space.commit(&reservation, start, 64).unwrap(),
        )
    }

    #[test]
    fn span_is_page_rounded_and_includes_header() {
        assert_eq!(large_span(1), PAGE);
        assert_eq!(large_span(PAGE - 16), PAGE);
        assert_eq!(large_span(PAGE - 15), 2 * PAGE);
    }

    #[test]
    fn bump_placement_is_sequential() {
        let mut pool = LargePool::new(1 << 30, 64 * 1024);
        assert_eq!(pool.place(PAGE), Some((0, PAGE)));
        assert_eq!(pool.place(2 * PAGE), Some((PAGE, 2 * PAGE)));
        assert_eq!(pool.high_water(), 3 * PAGE);
    }

    #[test]
    fn exhausted_region_returns_none() {
        let mut pool = LargePool::new(4 * PAGE, 16);
        assert!(pool.place(4 * PAGE).is_some());
        assert_eq!(pool.place(PAGE), None);
    }

    #[test]
    fn freed_tail_rolls_bump_back() {
        let mut pool = LargePool::new(1 << 30, 16);
        let (a, _) = pool.place(PAGE).unwrap();
        let (b, _) = pool.place(PAGE).unwrap();
        pool.unplace(b, PAGE);
        assert_eq!(pool.high_water(), PAGE);
        pool.unplace(a, PAGE);
        assert_eq!(pool.high_water(), 0);
        assert_eq!(pool.free_spans(), 0);
    }

    #[test]
    fn freed_spans_coalesce_and_are_reused_first_fit() {
        let mut pool = LargePool::new(1 << 30, 16);
        let (a, _) = pool.place(PAGE).unwrap();
        let (b, _) = pool.place(PAGE).unwrap();
        let _guard = pool.place(PAGE).unwrap();
        pool.unplace(a, PAGE);
        pool.unplace(b, PAGE);
        assert_eq!(pool.free_spans(), 1);
        assert_eq!(pool.place(2 * PAGE), Some((0, 2 * PAGE)));
    }

    #[test]
    fn small_remainder_is_not_split() {
        let mut pool = LargePool::new(1 << 30, 64 * 1024);
        let (a, _) = pool.place(4 * PAGE).unwrap();
        let _guard = pool.place(PAGE).unwrap();
        pool.unplace(a, 4 * PAGE);
        // 3 pages left over is below the 64 KiB threshold.
        assert_eq!(pool.place(PAGE), Some((0, 4 * PAGE)));
        assert_eq!(pool.free_spans(), 0);
    }

    #[test]
    fn large_remainder_is_split() {
        let mut pool = LargePool::new(1 << 30, 16);
        let (a, _) = pool.place(4 * PAGE).unwrap();
        let _guard = pool.place(PAGE).unwrap();
        pool.unplace(a, 4 * PAGE);
        assert_eq!(pool.place(PAGE), Some((0, PAGE)));
        assert_eq!(pool.place(3 * PAGE), Some((PAGE, 3 * PAGE)));
    }

    #[test]
    fn removed_slot_is_stale_and_reused_with_new_generation() {
        let space = HeapAddressSpace::new();
        let mut pool = LargePool::new(1 << 30, 16);
        let (start, span) = pool.place(PAGE).unwrap();
        let first = pool.insert(block(&space, 1, start, span));
        assert_eq!(pool.live_blocks(), 1);

        let removed = pool.remove(first).unwrap();
        let shared = Arc::clone(&removed.pages);
        space.decommit(removed.take_pages().unwrap());
        assert!(shared.lock().is_none());
        assert!(removed.take_pages().is_none());
        assert!(matches!(
            pool.get(first),
            Err(AllocError::StaleHandle { .. })
        ));
        assert!(matches!(
            pool.remove(first),
            Err(AllocError::StaleHandle { .. })
        ));

        let (start, span) = pool.place(PAGE).unwrap();
        let second = pool.insert(block(&space, 2, start, span));
        assert_eq!(second.index(), first.index());
        assert_eq!(second.generation(), first.generation().wrapping_add(1));
        assert!(pool.get(second).is_ok());
    }

    #[test]
    fn unknown_slot_is_invalid() {
        let pool = LargePool::new(1 << 30, 16);
        assert!(matches!(
            pool.get(RegionId::large(5, 0)),
            Err(AllocError::InvalidHandle { .. })
        ));
    }

    #[test]
    fn blocks_of_filters_by_owner() {
        let space = HeapAddressSpace::new();
        let mut pool = LargePool::new(1 << 30, 16);
        let mut ids = Vec::new();
        for owner in [1, 2, 1] {
            let (start, span) = pool.place(PAGE).unwrap();
            ids.push(pool.insert(block(&space, owner, start, span)));
        }
        assert_eq!(pool.blocks_of(TenantId(1)), vec![ids[0], ids[2]]);
        assert_eq!(pool.blocks_of(TenantId(3)), vec![]);
    }

    #[cfg(not(miri))]
    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn placed_spans_never_overlap(
                ops in proptest::collection::vec((1u64..8, any::<bool>(), any::<usize>()), 1..100)
            ) {
                let mut pool = LargePool::new(1 << 24, 16);
                let mut live: Vec<(u64, u64)> = Vec::new();
                for (pages, alloc, pick) in ops {
                    if alloc || live.is_empty() {
                        if let Some(span) = pool.place(pages * PAGE) {
                            live.push(span);
                        }
                    } else {
                        let (start, span) = live.swap_remove(pick % live.len());
                        pool.unplace(start, span);
                    }
                    let mut sorted = live.clone();
                    sorted.sort_unstable();
                    for w in sorted.windows(2) {
                        prop_assert!(w[0].0 + w[0].1 <= w[1].0);
                    }
                    prop_assert!(sorted.last().is_none_or(|&(s, l)| s + l <= pool.high_water()));
                }
                for (start, span) in live {
                    pool.unplace(start, span);
                }
                prop_assert_eq!(pool.high_water(), 0);
                prop_assert_eq!(pool.free_spans(), 0);
            }
        }
    }
}
