//! The tenant arena: routing, chunk provisioning, and tenant lifecycle.
//!
//! Locking is two-level. The global state lock guards the chunk slot
//! table, tenant records, the recyclable list, and the large pool. Each
//! chunk has its own lock for its free-range table. When both are needed
//! the global lock is always taken first; the small-pool fast path and
//! small frees hold only the chunk lock while chunk logic runs. Large
//! blocks keep their pages behind a lock of their own, and payload access
//! takes it only after the global lock is released.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, error, info, warn};

use strata_core::{AllocError, AllocHandle, ByteArena, Pool, RegionId, TenantId};

use crate::address_space::{AddressSpace, CommittedPages, HeapAddressSpace, Reservation};
use crate::chunk::{
    Chunk, ChunkUsage, FreeRejection, CHUNK_ALIGN, CHUNK_BYTES, CHUNK_DATA_BYTES,
    CHUNK_METADATA_BYTES,
};
use crate::config::ArenaConfig;
use crate::error::ArenaError;
use crate::large::{large_span, BlockPages, LargeBlock, LargePool, LARGE_HEADER_BYTES};

/// Size header stored in front of every payload.
pub const ALLOC_HEADER_BYTES: usize = AllocHandle::HEADER_BYTES as usize;

/// Header plus payload sizes above this go to the large pool.
pub const LARGE_ALLOC_THRESHOLD: usize = CHUNK_DATA_BYTES / 4;

/// Bytes a small allocation of `size` payload bytes occupies in its chunk.
pub fn small_footprint(size: usize) -> u32 {
    let align = CHUNK_ALIGN as usize;
    ((ALLOC_HEADER_BYTES + size).div_ceil(align) * align) as u32
}

/// Pool a payload of `size` bytes is served from.
pub fn route(size: usize) -> Pool {
    match size.checked_add(ALLOC_HEADER_BYTES) {
        Some(total) if total <= LARGE_ALLOC_THRESHOLD => Pool::Small,
        _ => Pool::Large,
    }
}

type SharedChunk = Arc<Mutex<Chunk>>;

#[derive(Debug, Default)]
struct TenantRecord {
    active: Option<u32>,
    chunks: SmallVec<[u32; 4]>,
}

#[derive(Debug)]
struct ArenaState {
    chunks: Vec<SharedChunk>,
    recyclable: Vec<u32>,
    tenants: IndexMap<TenantId, TenantRecord>,
    large: LargePool,
    over_soft_limit: bool,
}

impl ArenaState {
    fn active_chunk(&self, tenant: TenantId) -> Option<SharedChunk> {
        let index = self.tenants.get(&tenant)?.active?;
        self.chunks.get(index as usize).cloned()
    }

    fn chunk(&self, region: RegionId) -> Result<SharedChunk, AllocError> {
        self.chunks
            .get(region.index() as usize)
            .cloned()
            .ok_or(AllocError::InvalidHandle { region })
    }
}

/// What [`TenantArena::notify_tenant_closed`] gave back.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TenantRelease {
    /// Chunks decommitted and moved to the recyclable list.
    pub chunks: usize,
    /// Large blocks decommitted.
    pub large_blocks: usize,
}

/// Point-in-time summary of the whole arena.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArenaStats {
    /// Chunk slots ever created.
    pub chunks_total: usize,
    /// Chunks currently committed and owned by a tenant.
    pub chunks_committed: usize,
    /// Decommitted chunks waiting for reuse.
    pub chunks_recyclable: usize,
    /// Tenants with at least one chunk.
    pub tenants: usize,
    /// Live large blocks.
    pub large_blocks: usize,
    /// Entries in the large-pool free map.
    pub large_free_spans: usize,
    /// Bytes committed through the address space.
    pub committed_bytes: u64,
    /// Frees refused since construction.
    pub rejected_frees: u64,
    /// Whether committed bytes currently exceed the soft limit.
    pub over_soft_limit: bool,
}

/// Tenant-scoped arena with a chunked small pool and a large-block pool.
///
/// Reserves its address range on construction and releases it on drop.
/// Shared between threads by reference or `Arc`.
///
/// # Examples
///
/// ```
/// use strata_arena::{ArenaConfig, TenantArena};
/// use strata_core::TenantId;
///
/// let arena = TenantArena::new(ArenaConfig::new().with_reserve_bytes(64 << 20)).unwrap();
/// let handle = arena.allocate(100, TenantId(5)).unwrap();
/// arena.with_bytes_mut(handle, |b| b[0] = 7).unwrap();
/// assert_eq!(arena.with_bytes(handle, |b| b[0]).unwrap(), 7);
/// arena.free(handle);
/// ```
pub struct TenantArena<S: AddressSpace = HeapAddressSpace> {
    config: ArenaConfig,
    space: S,
    reservation: Option<Reservation>,
    max_chunks: u64,
    large_base: u64,
    state: Mutex<ArenaState>,
    rejected_frees: AtomicU64,
}

impl TenantArena<HeapAddressSpace> {
    /// Create an arena over a heap-backed address space.
    pub fn new(config: ArenaConfig) -> Result<Self, ArenaError> {
        Self::with_address_space(config, HeapAddressSpace::new())
    }
}

impl<S: AddressSpace> TenantArena<S> {
    /// Create an arena over `space`.
    pub fn with_address_space(config: ArenaConfig, space: S) -> Result<Self, ArenaError> {
        config.validate()?;
        let reservation = space.reserve(config.reserve_bytes)?;
        let large_base = config.small_region_bytes();
        let max_chunks = config.max_chunks().min(RegionId::MAX_INDEX as u64 + 1);
        let large = LargePool::new(
            config.reserve_bytes - large_base,
            config.large_min_split,
        );
        debug!(
            base = reservation.base(),
            bytes = reservation.len(),
            max_chunks,
            "reserved arena address range"
        );
        Ok(Self {
            config,
            space,
            reservation: Some(reservation),
            max_chunks,
            large_base,
            state: Mutex::new(ArenaState {
                chunks: Vec::new(),
                recyclable: Vec::new(),
                tenants: IndexMap::new(),
                large,
                over_soft_limit: false,
            }),
            rejected_frees: AtomicU64::new(0),
        })
    }

    /// The configuration this arena was built with.
    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    /// Largest payload [`TenantArena::allocate`] can ever satisfy.
    pub fn max_allocation(&self) -> usize {
        let region = self.config.reserve_bytes - self.large_base;
        let by_region = region.saturating_sub(LARGE_HEADER_BYTES as u64);
        by_region.min((u32::MAX - LARGE_HEADER_BYTES) as u64) as usize
    }

    /// Allocate `size` zeroed payload bytes for `tenant`.
    ///
    /// Payloads whose header plus size fit in [`LARGE_ALLOC_THRESHOLD`]
    /// come from the tenant's chunks; larger ones get a dedicated block.
    pub fn allocate(&self, size: usize, tenant: TenantId) -> Result<AllocHandle, AllocError> {
        match route(size) {
            Pool::Small => self.allocate_small(size, tenant),
            Pool::Large => self.allocate_large(size, tenant),
        }
    }

    fn allocate_small(&self, size: usize, tenant: TenantId) -> Result<AllocHandle, AllocError> {
        let footprint = small_footprint(size);

        let active = self.state.lock().active_chunk(tenant);
        if let Some(chunk) = active {
            if let Some(handle) = carve(&chunk, tenant, size, footprint) {
                return Ok(handle);
            }
        }

        let mut state = self.state.lock();
        // Another thread may have installed a fresh chunk meanwhile.
        if let Some(chunk) = state.active_chunk(tenant) {
            if let Some(handle) = carve(&chunk, tenant, size, footprint) {
                return Ok(handle);
            }
        }

        let chunk = self.provision_chunk(&mut state, tenant, size)?;
        carve(&chunk, tenant, size, footprint).ok_or(AllocError::OutOfMemory {
            requested: size,
            tenant,
        })
    }

    /// Hand `tenant` a recycled or freshly committed chunk and make it the
    /// tenant's active chunk.
    fn provision_chunk(
        &self,
        state: &mut ArenaState,
        tenant: TenantId,
        requested: usize,
    ) -> Result<SharedChunk, AllocError> {
        let oom = AllocError::OutOfMemory { requested, tenant };

        let (index, chunk) = if let Some(index) = state.recyclable.pop() {
            let pages = match self.commit_chunk(index) {
                Ok(pages) => pages,
                Err(e) => {
                    state.recyclable.push(index);
                    error!(%tenant, chunk = index, error = %e, "failed to recommit chunk");
                    return Err(oom);
                }
            };
            let chunk = Arc::clone(&state.chunks[index as usize]);
            let generation = {
                let mut guard = chunk.lock();
                guard.reset(tenant, pages);
                guard.generation()
            };
            debug!(%tenant, chunk = index, generation, "recycled chunk");
            (index, chunk)
        } else {
            let next = state.chunks.len() as u64;
            if next >= self.max_chunks {
                error!(%tenant, requested, chunks = next, "small pool address range exhausted");
                return Err(oom);
            }
            let index = next as u32;
            let pages = self.commit_chunk(index).map_err(|e| {
                error!(%tenant, chunk = index, error = %e, "failed to commit chunk");
                oom.clone()
            })?;
            let chunk = Arc::new(Mutex::new(Chunk::new(index, tenant, pages)));
            state.chunks.push(Arc::clone(&chunk));
            debug!(%tenant, chunk = index, "committed chunk");
            (index, chunk)
        };

        let record = state.tenants.entry(tenant).or_default();
        record.active = Some(index);
        record.chunks.push(index);
        self.track_soft_limit(state);
        Ok(chunk)
    }

    fn commit_chunk(&self, index: u32) -> Result<CommittedPages, AllocError> {
        let offset = index as u64 * CHUNK_BYTES as u64 + CHUNK_METADATA_BYTES as u64;
        self.space
            .commit(self.reservation()?, offset, CHUNK_DATA_BYTES)
    }

    fn allocate_large(&self, size: usize, tenant: TenantId) -> Result<AllocHandle, AllocError> {
        let max = self.max_allocation();
        if size > max {
            return Err(AllocError::TooLarge {
                requested: size,
                max,
            });
        }
        let oom = AllocError::OutOfMemory {
            requested: size,
            tenant,
        };

        let mut state = self.state.lock();
        if !state.large.has_free_slot() {
            error!(%tenant, requested = size, "large block table exhausted");
            return Err(oom);
        }
        let Some((start, span)) = state.large.place(large_span(size as u64)) else {
            error!(%tenant, requested = size, "large pool address range exhausted");
            return Err(oom);
        };
        let mut pages = match self.reservation().and_then(|r| {
            self.space.commit(r, self.large_base + start, span as usize)
        }) {
            Ok(pages) => pages,
            Err(e) => {
                state.large.unplace(start, span);
                error!(%tenant, requested = size, error = %e, "failed to commit large block");
                return Err(oom);
            }
        };

        let header = LARGE_HEADER_BYTES as usize - ALLOC_HEADER_BYTES;
        pages.as_mut_slice()[header..header + ALLOC_HEADER_BYTES]
            .copy_from_slice(&(size as u64).to_le_bytes());
        let region = state
            .large
            .insert(LargeBlock::new(tenant, start, span, pages));
        debug!(%tenant, %region, span, "committed large block");
        self.track_soft_limit(&mut state);
        Ok(AllocHandle::new(region, LARGE_HEADER_BYTES, size as u32))
    }

    /// Release an allocation.
    ///
    /// Unknown, stale, mismatched, or repeated frees are logged, counted in
    /// [`ArenaStats::rejected_frees`], and otherwise ignored. A free that
    /// would overflow its chunk's free-range table is dropped the same way;
    /// those bytes stay used until the chunk is recycled.
    pub fn free(&self, handle: AllocHandle) {
        let result = match handle.region().pool() {
            Pool::Small => self.free_small(handle),
            Pool::Large => self.free_large(handle),
        };
        if let Err(reason) = result {
            self.rejected_frees.fetch_add(1, Ordering::Relaxed);
            warn!(%handle, reason, "rejected free");
        }
    }

    fn free_small(&self, handle: AllocHandle) -> Result<(), &'static str> {
        let region = handle.region();
        let chunk = self
            .state
            .lock()
            .chunk(region)
            .map_err(|_| "unknown chunk")?;
        let mut chunk = chunk.lock();
        check_small(&chunk, handle).map_err(|e| match e {
            AllocError::StaleHandle { .. } => "stale handle",
            _ => "header mismatch",
        })?;
        let start = handle.offset() - AllocHandle::HEADER_BYTES;
        chunk
            .free(start, small_footprint(handle.len() as usize))
            .map_err(|rejection| match rejection {
                FreeRejection::OutOfBounds => "out of chunk bounds",
                FreeRejection::Overlap => "double free",
                FreeRejection::TableFull => "free-range table full",
                FreeRejection::NotAllocated => "not an allocation start",
            })?;
        // Cleared so later use of the same handle fails the header check.
        if let Some(header) = chunk.bytes_mut(start as usize, ALLOC_HEADER_BYTES) {
            header.fill(0);
        }
        Ok(())
    }

    fn free_large(&self, handle: AllocHandle) -> Result<(), &'static str> {
        let mut state = self.state.lock();
        let block = state.large.get(handle.region()).map_err(|e| match e {
            AllocError::InvalidHandle { .. } => "unknown block",
            _ => "stale handle",
        })?;
        match block.pages.lock().as_ref() {
            Some(pages) => check_large(pages, handle).map_err(|_| "header mismatch")?,
            None => return Err("stale handle"),
        }
        let block = state
            .large
            .remove(handle.region())
            .map_err(|_| "stale handle")?;
        debug!(tenant = %block.owner, region = %handle.region(), "released large block");
        if let Some(pages) = block.take_pages() {
            self.space.decommit(pages);
        }
        self.track_soft_limit(&mut state);
        Ok(())
    }

    /// Run `f` over the payload of `handle`.
    ///
    /// The chunk or large block holding the payload stays locked while `f`
    /// runs, so `f` must not call back into the arena. The arena-wide lock
    /// is not held, so other tenants are not blocked.
    pub fn with_bytes<R>(
        &self,
        handle: AllocHandle,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R, AllocError> {
        match handle.region().pool() {
            Pool::Small => {
                let chunk = self.state.lock().chunk(handle.region())?;
                let chunk = chunk.lock();
                check_small(&chunk, handle)?;
                let bytes = chunk
                    .bytes(handle.offset() as usize, handle.len() as usize)
                    .ok_or(out_of_bounds(handle, CHUNK_DATA_BYTES))?;
                Ok(f(bytes))
            }
            Pool::Large => {
                let (pages, _, _) = self.large_block(handle.region())?;
                let guard = pages.lock();
                let pages = guard.as_ref().ok_or(AllocError::StaleHandle {
                    region: handle.region(),
                })?;
                check_large(pages, handle)?;
                let bytes = pages
                    .as_slice()
                    .get(payload_range(handle))
                    .ok_or(out_of_bounds(handle, pages.len()))?;
                Ok(f(bytes))
            }
        }
    }

    /// Run `f` over the mutable payload of `handle`. Same locking rules as
    /// [`TenantArena::with_bytes`].
    pub fn with_bytes_mut<R>(
        &self,
        handle: AllocHandle,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, AllocError> {
        match handle.region().pool() {
            Pool::Small => {
                let chunk = self.state.lock().chunk(handle.region())?;
                let mut chunk = chunk.lock();
                check_small(&chunk, handle)?;
                let bytes = chunk
                    .bytes_mut(handle.offset() as usize, handle.len() as usize)
                    .ok_or(out_of_bounds(handle, CHUNK_DATA_BYTES))?;
                Ok(f(bytes))
            }
            Pool::Large => {
                let (pages, _, _) = self.large_block(handle.region())?;
                let mut guard = pages.lock();
                let pages = guard.as_mut().ok_or(AllocError::StaleHandle {
                    region: handle.region(),
                })?;
                check_large(pages, handle)?;
                let capacity = pages.len();
                let bytes = pages
                    .as_mut_slice()
                    .get_mut(payload_range(handle))
                    .ok_or(out_of_bounds(handle, capacity))?;
                Ok(f(bytes))
            }
        }
    }

    /// Resize an allocation, preserving `min(old, new)` payload bytes.
    ///
    /// Stays in place when the small-pool footprint is unchanged or the
    /// large block's span already covers the new size; the returned handle
    /// then names the same bytes with the new length. Otherwise the payload
    /// moves to a fresh allocation for the same tenant and the old one is
    /// freed. Bytes past the old length read as zero.
    pub fn reallocate(
        &self,
        handle: AllocHandle,
        new_size: usize,
    ) -> Result<AllocHandle, AllocError> {
        let old_len = handle.len() as usize;
        let tenant = match handle.region().pool() {
            Pool::Small => {
                let chunk = self.state.lock().chunk(handle.region())?;
                let mut chunk = chunk.lock();
                check_small(&chunk, handle)?;
                let owner = chunk.owner().ok_or(AllocError::StaleHandle {
                    region: handle.region(),
                })?;
                let same_footprint = small_footprint(old_len) == small_footprint(new_size);
                if route(new_size) == Pool::Small && same_footprint {
                    let start = (handle.offset() - AllocHandle::HEADER_BYTES) as usize;
                    if let Some(bytes) = chunk.bytes_mut(start, ALLOC_HEADER_BYTES + new_size) {
                        resize_in_place(bytes, old_len, new_size);
                        return Ok(handle.with_len(new_size as u32));
                    }
                }
                owner
            }
            Pool::Large => {
                let (pages, owner, span) = self.large_block(handle.region())?;
                let mut guard = pages.lock();
                let pages = guard.as_mut().ok_or(AllocError::StaleHandle {
                    region: handle.region(),
                })?;
                check_large(pages, handle)?;
                if route(new_size) == Pool::Large && large_span(new_size as u64) <= span {
                    let start = (LARGE_HEADER_BYTES - AllocHandle::HEADER_BYTES) as usize;
                    let end = LARGE_HEADER_BYTES as usize + new_size;
                    if let Some(bytes) = pages.as_mut_slice().get_mut(start..end) {
                        resize_in_place(bytes, old_len, new_size);
                        return Ok(handle.with_len(new_size as u32));
                    }
                }
                owner
            }
        };

        let kept = old_len.min(new_size);
        let mut carried = vec![0u8; kept];
        self.read(handle, 0, &mut carried)?;
        let moved = self.allocate(new_size, tenant)?;
        self.write(moved, 0, &carried)?;
        self.free(handle);
        Ok(moved)
    }

    /// Decommit every chunk and large block owned by `tenant`.
    ///
    /// Chunks move to the recyclable list and the tenant record is removed,
    /// so a later allocation for the same id starts a fresh history. Large
    /// blocks are decommitted and their spans returned to the free map.
    /// Handles minted for the tenant become stale.
    pub fn notify_tenant_closed(&self, tenant: TenantId) -> TenantRelease {
        let mut state = self.state.lock();
        let mut release = TenantRelease::default();

        if let Some(record) = state.tenants.shift_remove(&tenant) {
            for index in record.chunks {
                let pages = state.chunks[index as usize].lock().retire();
                if let Some(pages) = pages {
                    self.space.decommit(pages);
                }
                state.recyclable.push(index);
                release.chunks += 1;
            }
        }
        for region in state.large.blocks_of(tenant) {
            if let Ok(block) = state.large.remove(region) {
                if let Some(pages) = block.take_pages() {
                    self.space.decommit(pages);
                }
                release.large_blocks += 1;
            }
        }

        self.track_soft_limit(&mut state);
        debug!(
            %tenant,
            chunks = release.chunks,
            large_blocks = release.large_blocks,
            "tenant closed"
        );
        release
    }

    /// Report on chunk `index`. Live allocations are not moved.
    pub fn defragment(&self, index: u32) -> Option<ChunkUsage> {
        let usage = self.chunk_usage(index)?;
        info!(
            chunk = index,
            free_bytes = usage.free_bytes,
            free_ranges = usage.free_ranges,
            largest_free = usage.largest_free,
            "defragment requested; compaction is not performed"
        );
        Some(usage)
    }

    /// Usage summary of chunk `index`, if it exists.
    pub fn chunk_usage(&self, index: u32) -> Option<ChunkUsage> {
        let chunk = self.state.lock().chunks.get(index as usize).cloned()?;
        let usage = chunk.lock().usage();
        Some(usage)
    }

    /// Chunk indices owned by `tenant`, oldest first.
    pub fn tenant_chunks(&self, tenant: TenantId) -> Vec<u32> {
        self.state
            .lock()
            .tenants
            .get(&tenant)
            .map(|r| r.chunks.to_vec())
            .unwrap_or_default()
    }

    /// Chunk indices waiting in the recyclable list.
    pub fn recyclable_chunks(&self) -> Vec<u32> {
        self.state.lock().recyclable.clone()
    }

    /// Virtual address of the payload `handle` names.
    pub fn address_of(&self, handle: AllocHandle) -> Result<u64, AllocError> {
        let base = self.reservation()?.base();
        let region = handle.region();
        match region.pool() {
            Pool::Small => {
                let chunk = self.state.lock().chunk(region)?;
                check_small(&chunk.lock(), handle)?;
                Ok(base
                    + region.index() as u64 * CHUNK_BYTES as u64
                    + CHUNK_METADATA_BYTES as u64
                    + handle.offset() as u64)
            }
            Pool::Large => {
                let state = self.state.lock();
                let block = state.large.get(region)?;
                Ok(base + self.large_base + block.start + handle.offset() as u64)
            }
        }
    }

    /// Arena-wide counters.
    pub fn stats(&self) -> ArenaStats {
        let state = self.state.lock();
        let chunks_committed = state
            .chunks
            .iter()
            .filter(|c| c.lock().is_committed())
            .count();
        ArenaStats {
            chunks_total: state.chunks.len(),
            chunks_committed,
            chunks_recyclable: state.recyclable.len(),
            tenants: state.tenants.len(),
            large_blocks: state.large.live_blocks(),
            large_free_spans: state.large.free_spans(),
            committed_bytes: self.space.committed_bytes(),
            rejected_frees: self.rejected_frees.load(Ordering::Relaxed),
            over_soft_limit: state.over_soft_limit,
        }
    }

    /// Page lock, owner, and span of large block `region`. Only the clone
    /// happens under the arena lock.
    fn large_block(&self, region: RegionId) -> Result<(BlockPages, TenantId, u64), AllocError> {
        let state = self.state.lock();
        let block = state.large.get(region)?;
        Ok((Arc::clone(&block.pages), block.owner, block.span))
    }

    fn reservation(&self) -> Result<&Reservation, AllocError> {
        self.reservation
            .as_ref()
            .ok_or(AllocError::ReservationFailed {
                requested: self.config.reserve_bytes,
            })
    }

    /// Warn once each time committed memory rises past the soft limit.
    fn track_soft_limit(&self, state: &mut ArenaState) {
        let committed = self.space.committed_bytes();
        let over = committed > self.config.soft_limit_bytes;
        if over && !state.over_soft_limit {
            warn!(
                committed,
                soft_limit = self.config.soft_limit_bytes,
                "committed memory exceeds soft limit"
            );
        } else if !over && state.over_soft_limit {
            debug!(committed, "committed memory back under soft limit");
        }
        state.over_soft_limit = over;
    }
}

impl<S: AddressSpace> Drop for TenantArena<S> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for chunk in &state.chunks {
            if let Some(pages) = chunk.lock().retire() {
                self.space.decommit(pages);
            }
        }
        for block in state.large.drain() {
            if let Some(pages) = block.take_pages() {
                self.space.decommit(pages);
            }
        }
        if let Some(reservation) = self.reservation.take() {
            self.space.release(reservation);
        }
    }
}

impl<S: AddressSpace> ByteArena for TenantArena<S> {
    fn allocate(&self, size: usize, tenant: TenantId) -> Result<AllocHandle, AllocError> {
        Self::allocate(self, size, tenant)
    }

    fn free(&self, handle: AllocHandle) {
        Self::free(self, handle)
    }

    fn with_bytes<R>(
        &self,
        handle: AllocHandle,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R, AllocError> {
        Self::with_bytes(self, handle, f)
    }

    fn with_bytes_mut<R>(
        &self,
        handle: AllocHandle,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, AllocError> {
        Self::with_bytes_mut(self, handle, f)
    }
}

/// Try to serve a small allocation from `chunk`. Fails if the chunk has no
/// room or no longer belongs to `tenant`.
fn carve(chunk: &SharedChunk, tenant: TenantId, size: usize, footprint: u32) -> Option<AllocHandle> {
    let mut chunk = chunk.lock();
    if chunk.owner() != Some(tenant) {
        return None;
    }
    let start = chunk.allocate(footprint)?;
    let bytes = chunk.bytes_mut(start as usize, ALLOC_HEADER_BYTES + size)?;
    bytes[..ALLOC_HEADER_BYTES].copy_from_slice(&(size as u64).to_le_bytes());
    bytes[ALLOC_HEADER_BYTES..].fill(0);
    let region = RegionId::small(chunk.index(), chunk.generation());
    Some(AllocHandle::new(
        region,
        start + AllocHandle::HEADER_BYTES,
        size as u32,
    ))
}

/// Check that `handle` names a live allocation in `chunk`.
fn check_small(chunk: &Chunk, handle: AllocHandle) -> Result<(), AllocError> {
    let region = handle.region();
    if !chunk.is_committed() || chunk.generation() != region.generation() {
        return Err(AllocError::StaleHandle { region });
    }
    let invalid = AllocError::InvalidHandle { region };
    let start = handle
        .offset()
        .checked_sub(AllocHandle::HEADER_BYTES)
        .ok_or(invalid.clone())?;
    if !chunk.is_allocation_start(start) {
        return Err(invalid);
    }
    let header = chunk
        .bytes(start as usize, ALLOC_HEADER_BYTES)
        .ok_or(invalid.clone())?;
    if read_header(header) != handle.len() as u64 {
        return Err(invalid);
    }
    Ok(())
}

fn check_large(pages: &CommittedPages, handle: AllocHandle) -> Result<(), AllocError> {
    let invalid = AllocError::InvalidHandle {
        region: handle.region(),
    };
    let start = (LARGE_HEADER_BYTES - AllocHandle::HEADER_BYTES) as usize;
    let header = pages
        .as_slice()
        .get(start..start + ALLOC_HEADER_BYTES)
        .ok_or(invalid.clone())?;
    if handle.offset() != LARGE_HEADER_BYTES || read_header(header) != handle.len() as u64 {
        return Err(invalid);
    }
    Ok(())
}

fn read_header(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; ALLOC_HEADER_BYTES];
    raw.copy_from_slice(&bytes[..ALLOC_HEADER_BYTES]);
    u64::from_le_bytes(raw)
}

/// Rewrite the size header at the front of `bytes` and zero any growth.
fn resize_in_place(bytes: &mut [u8], old_len: usize, new_len: usize) {
    bytes[..ALLOC_HEADER_BYTES].copy_from_slice(&(new_len as u64).to_le_bytes());
    if new_len > old_len {
        bytes[ALLOC_HEADER_BYTES + old_len..ALLOC_HEADER_BYTES + new_len].fill(0);
    }
}

fn payload_range(handle: AllocHandle) -> std::ops::Range<usize> {
    let start = handle.offset() as usize;
    start..start + handle.len() as usize
}

fn out_of_bounds(handle: AllocHandle, capacity: usize) -> AllocError {
    AllocError::OutOfBounds {
        offset: handle.offset() as usize,
        len: handle.len() as usize,
        capacity,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMALL_RESERVE: u64 = 64 << 20;

    fn arena() -> TenantArena {
        TenantArena::new(ArenaConfig::new().with_reserve_bytes(SMALL_RESERVE)).unwrap()
    }

    fn header_of(arena: &TenantArena, handle: AllocHandle) -> u64 {
        let chunk = arena.state.lock().chunk(handle.region()).unwrap();
        let chunk = chunk.lock();
        let start = (handle.offset() - AllocHandle::HEADER_BYTES) as usize;
        read_header(chunk.bytes(start, ALLOC_HEADER_BYTES).unwrap())
    }

    #[test]
    fn small_allocation_writes_header_and_charges_footprint() {
        let arena = arena();
        let h = arena.allocate(100, TenantId(5)).unwrap();
        assert_eq!(h.region().pool(), Pool::Small);
        assert_eq!(h.len(), 100);
        assert_eq!(header_of(&arena, h), 100);
        let usage = arena.chunk_usage(h.region().index()).unwrap();
        assert_eq!(usage.used_bytes, small_footprint(100));
        assert_eq!(usage.used_bytes, 112);
        assert_eq!(usage.owner, Some(TenantId(5)));
    }

    #[test]
    fn routing_boundary_is_inclusive_for_small_pool() {
        let arena = arena();
        let at = LARGE_ALLOC_THRESHOLD - ALLOC_HEADER_BYTES;
        assert_eq!(route(at), Pool::Small);
        assert_eq!(route(at + 1), Pool::Large);
        let small = arena.allocate(at, TenantId(1)).unwrap();
        let large = arena.allocate(at + 1, TenantId(1)).unwrap();
        assert_eq!(small.region().pool(), Pool::Small);
        assert_eq!(large.region().pool(), Pool::Large);
    }

    #[test]
    fn large_allocation_is_aligned_and_outside_small_region() {
        let arena = arena();
        let small = arena.allocate(64, TenantId(1)).unwrap();
        let large = arena.allocate(2_000_000, TenantId(1)).unwrap();
        assert_eq!(large.region().pool(), Pool::Large);

        let small_addr = arena.address_of(small).unwrap();
        let large_addr = arena.address_of(large).unwrap();
        assert_eq!(large_addr % 16, 0);
        let base = arena.reservation().unwrap().base();
        assert!(small_addr < base + arena.large_base);
        assert!(large_addr >= base + arena.large_base);

        arena.with_bytes_mut(large, |b| b[1_999_999] = 9).unwrap();
        assert_eq!(arena.with_bytes(large, |b| b[1_999_999]).unwrap(), 9);
    }

    #[test]
    fn free_then_allocate_returns_same_offset() {
        let arena = arena();
        let a = arena.allocate(48, TenantId(2)).unwrap();
        arena.free(a);
        let b = arena.allocate(48, TenantId(2)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn payload_is_zeroed_on_reuse() {
        let arena = arena();
        let a = arena.allocate(32, TenantId(2)).unwrap();
        arena.with_bytes_mut(a, |b| b.fill(0xFF)).unwrap();
        arena.free(a);
        let b = arena.allocate(32, TenantId(2)).unwrap();
        assert!(arena.with_bytes(b, |p| p.iter().all(|&x| x == 0)).unwrap());
    }

    #[test]
    fn tenants_get_separate_chunks() {
        let arena = arena();
        let a = arena.allocate(16, TenantId(1)).unwrap();
        let b = arena.allocate(16, TenantId(2)).unwrap();
        assert_ne!(a.region().index(), b.region().index());
        assert_eq!(arena.tenant_chunks(TenantId(1)), vec![a.region().index()]);
        assert_eq!(arena.tenant_chunks(TenantId(2)), vec![b.region().index()]);
    }

    #[test]
    fn full_chunk_provisions_another() {
        let arena = arena();
        let size = LARGE_ALLOC_THRESHOLD - ALLOC_HEADER_BYTES;
        let handles: Vec<_> = (0..5)
            .map(|_| arena.allocate(size, TenantId(3)).unwrap())
            .collect();
        // Four threshold-sized payloads fill a chunk exactly.
        assert_eq!(handles[3].region().index(), handles[0].region().index());
        assert_ne!(handles[4].region().index(), handles[0].region().index());
        assert_eq!(arena.tenant_chunks(TenantId(3)).len(), 2);
    }

    #[test]
    fn double_free_is_counted_not_fatal() {
        let arena = arena();
        let a = arena.allocate(24, TenantId(1)).unwrap();
        let _b = arena.allocate(24, TenantId(1)).unwrap();
        arena.free(a);
        arena.free(a);
        assert_eq!(arena.stats().rejected_frees, 1);
        let usage = arena.chunk_usage(a.region().index()).unwrap();
        assert_eq!(usage.used_bytes, small_footprint(24));
    }

    #[test]
    fn stale_free_inside_a_reused_span_is_rejected() {
        let arena = arena();
        let tenant = TenantId(1);
        let first = arena.allocate(8, tenant).unwrap();
        let stale = arena.allocate(8, tenant).unwrap();
        let _pin = arena.allocate(8, tenant).unwrap();
        arena.free(first);
        arena.free(stale);

        // One allocation now covers both old spans.
        let wide = arena.allocate(24, tenant).unwrap();
        assert_eq!(wide.offset(), first.offset());
        // Payload bytes that look like the stale handle's size header.
        arena.write(wide, 8, &8u64.to_le_bytes()).unwrap();

        arena.free(stale);
        assert_eq!(arena.stats().rejected_frees, 1);
        assert!(matches!(
            arena.with_bytes(stale, |_| ()),
            Err(AllocError::InvalidHandle { .. })
        ));

        let next = arena.allocate(8, tenant).unwrap();
        let covered = wide.offset()..wide.offset() + wide.len();
        assert!(!covered.contains(&next.offset()));
        assert_eq!(&arena.to_vec(wide).unwrap()[8..16], &8u64.to_le_bytes());
        let usage = arena.chunk_usage(wide.region().index()).unwrap();
        assert_eq!(
            usage.used_bytes,
            small_footprint(24) + 2 * small_footprint(8)
        );
    }

    #[test]
    fn mismatched_or_unknown_handles_are_rejected() {
        let arena = arena();
        let a = arena.allocate(24, TenantId(1)).unwrap();
        arena.free(a.with_len(25));
        arena.free(AllocHandle::new(RegionId::small(40, 0), 8, 8));
        arena.free(AllocHandle::new(RegionId::large(3, 0), 16, 8));
        assert_eq!(arena.stats().rejected_frees, 3);
        assert!(matches!(
            arena.with_bytes(a.with_len(25), |_| ()),
            Err(AllocError::InvalidHandle { .. })
        ));
        arena.free(a);
        assert_eq!(arena.stats().rejected_frees, 3);
    }

    #[test]
    fn close_recycles_chunks_and_stales_handles() {
        let arena = arena();
        let a = arena.allocate(64, TenantId(7)).unwrap();
        let big = arena.allocate(1 << 21, TenantId(7)).unwrap();
        let release = arena.notify_tenant_closed(TenantId(7));
        assert_eq!(
            release,
            TenantRelease {
                chunks: 1,
                large_blocks: 1
            }
        );
        assert!(arena.tenant_chunks(TenantId(7)).is_empty());
        assert_eq!(arena.recyclable_chunks(), vec![a.region().index()]);
        assert_eq!(arena.stats().committed_bytes, 0);

        assert!(matches!(
            arena.with_bytes(a, |_| ()),
            Err(AllocError::StaleHandle { .. })
        ));
        assert!(matches!(
            arena.with_bytes(big, |_| ()),
            Err(AllocError::StaleHandle { .. })
        ));

        // Reuse by another tenant bumps the generation.
        let b = arena.allocate(64, TenantId(8)).unwrap();
        assert_eq!(b.region().index(), a.region().index());
        assert_eq!(b.region().generation(), a.region().generation() + 1);
        arena.free(a);
        assert_eq!(arena.stats().rejected_frees, 1);
        assert!(arena.recyclable_chunks().is_empty());
    }

    #[test]
    fn closing_unknown_tenant_is_a_no_op() {
        let arena = arena();
        assert_eq!(
            arena.notify_tenant_closed(TenantId(99)),
            TenantRelease::default()
        );
    }

    #[test]
    fn exhausted_small_pool_reports_out_of_memory() {
        // Two chunks of small region.
        let arena =
            TenantArena::new(ArenaConfig::new().with_reserve_bytes(4 * CHUNK_BYTES as u64))
                .unwrap();
        let size = LARGE_ALLOC_THRESHOLD - ALLOC_HEADER_BYTES;
        for _ in 0..8 {
            arena.allocate(size, TenantId(1)).unwrap();
        }
        assert_eq!(
            arena.allocate(size, TenantId(1)),
            Err(AllocError::OutOfMemory {
                requested: size,
                tenant: TenantId(1)
            })
        );
    }

    #[test]
    fn commit_failure_reports_out_of_memory() {
        let space = HeapAddressSpace::with_commit_limit(CHUNK_DATA_BYTES as u64);
        let arena = TenantArena::with_address_space(
            ArenaConfig::new().with_reserve_bytes(SMALL_RESERVE),
            space,
        )
        .unwrap();
        arena.allocate(8, TenantId(1)).unwrap();
        assert!(matches!(
            arena.allocate(8, TenantId(2)),
            Err(AllocError::OutOfMemory { .. })
        ));
        assert!(matches!(
            arena.allocate(1 << 21, TenantId(1)),
            Err(AllocError::OutOfMemory { .. })
        ));
        assert_eq!(arena.stats().large_free_spans, 0);
    }

    #[test]
    fn oversized_request_is_too_large() {
        let arena = arena();
        let max = arena.max_allocation();
        assert!(matches!(
            arena.allocate(max + 1, TenantId(1)),
            Err(AllocError::TooLarge { .. })
        ));
    }

    #[test]
    fn soft_limit_flag_tracks_crossings() {
        let arena = TenantArena::new(
            ArenaConfig::new()
                .with_reserve_bytes(SMALL_RESERVE)
                .with_soft_limit_bytes(CHUNK_DATA_BYTES as u64),
        )
        .unwrap();
        arena.allocate(8, TenantId(1)).unwrap();
        assert!(!arena.stats().over_soft_limit);
        arena.allocate(8, TenantId(2)).unwrap();
        assert!(arena.stats().over_soft_limit);
        arena.notify_tenant_closed(TenantId(2));
        assert!(!arena.stats().over_soft_limit);
    }

    #[test]
    fn reallocate_in_place_keeps_location() {
        let arena = arena();
        let a = arena.allocate(10, TenantId(1)).unwrap();
        arena.write(a, 0, &[1; 10]).unwrap();
        let b = arena.reallocate(a, 12).unwrap();
        assert_eq!(b.region(), a.region());
        assert_eq!(b.offset(), a.offset());
        assert_eq!(header_of(&arena, b), 12);
        assert_eq!(arena.to_vec(b).unwrap(), [&[1u8; 10][..], &[0, 0]].concat());
    }

    #[test]
    fn reallocate_moves_when_footprint_changes() {
        let arena = arena();
        let a = arena.allocate(8, TenantId(1)).unwrap();
        let _pin = arena.allocate(8, TenantId(1)).unwrap();
        arena.write(a, 0, b"abcdefgh").unwrap();
        let b = arena.reallocate(a, 64).unwrap();
        assert_ne!(b.offset(), a.offset());
        assert_eq!(&arena.to_vec(b).unwrap()[..8], b"abcdefgh");
        assert!(arena.with_bytes(a, |_| ()).is_err());

        let c = arena.reallocate(b, 4).unwrap();
        assert_eq!(arena.to_vec(c).unwrap(), b"abcd");
        assert_eq!(arena.stats().rejected_frees, 0);
    }

    #[test]
    fn reallocate_crosses_pools() {
        let arena = arena();
        let a = arena.allocate(16, TenantId(4)).unwrap();
        arena.write(a, 0, &[5; 16]).unwrap();
        let big = arena.reallocate(a, 2_000_000).unwrap();
        assert_eq!(big.region().pool(), Pool::Large);
        assert_eq!(&arena.to_vec(big).unwrap()[..16], &[5; 16]);
        let grown = arena.reallocate(big, 2_000_100).unwrap();
        assert_eq!(grown.region(), big.region());
        let small = arena.reallocate(grown, 16).unwrap();
        assert_eq!(small.region().pool(), Pool::Small);
        assert_eq!(arena.to_vec(small).unwrap(), vec![5; 16]);
        assert_eq!(arena.stats().large_blocks, 0);
    }

    #[test]
    fn defragment_reports_usage_without_moving() {
        let arena = arena();
        let a = arena.allocate(8, TenantId(1)).unwrap();
        let usage = arena.defragment(a.region().index()).unwrap();
        assert_eq!(usage.used_bytes, 16);
        assert!(arena.defragment(1000).is_none());
        assert!(arena.with_bytes(a, |_| ()).is_ok());
    }

    #[test]
    fn drop_returns_committed_memory() {
        struct Shared(Arc<HeapAddressSpace>);
        impl AddressSpace for Shared {
            fn reserve(&self, size: u64) -> Result<Reservation, AllocError> {
                self.0.reserve(size)
            }
            fn commit(
                &self,
                reservation: &Reservation,
                offset: u64,
                len: usize,
            ) -> Result<CommittedPages, AllocError> {
                self.0.commit(reservation, offset, len)
            }
            fn decommit(&self, pages: CommittedPages) {
                self.0.decommit(pages)
            }
            fn release(&self, reservation: Reservation) {
                self.0.release(reservation)
            }
            fn committed_bytes(&self) -> u64 {
                self.0.committed_bytes()
            }
        }

        let space = Arc::new(HeapAddressSpace::new());
        let arena = TenantArena::with_address_space(
            ArenaConfig::new().with_reserve_bytes(SMALL_RESERVE),
            Shared(Arc::clone(&space)),
        )
        .unwrap();
        arena.allocate(8, TenantId(1)).unwrap();
        arena.allocate(1 << 21, TenantId(1)).unwrap();
        assert!(space.committed_bytes() > 0);
        drop(arena);
        assert_eq!(space.committed_bytes(), 0);
    }
}
