//! Virtual address-space reservation.
//!
//! The arena reserves one large contiguous range up front and commits or
//! decommits sub-ranges of it on demand. [`AddressSpace`] is the seam to
//! that OS facility. [`HeapAddressSpace`] is the portable implementation:
//! reservations are bookkeeping only, and committing a range hands out an
//! owned, zeroed heap buffer that stands in for the committed pages.

use std::sync::atomic::{AtomicU64, Ordering};

use strata_core::AllocError;

/// Granularity at which commits are accounted.
pub const PAGE_SIZE: usize = 4096;

/// Counter for distinct reservation bases across every address space in
/// the process. Starts above zero so no address is ever null.
static NEXT_RESERVATION_BASE: AtomicU64 = AtomicU64::new(1 << 40);

/// A reserved virtual range. Returned by [`AddressSpace::reserve`] and
/// consumed by [`AddressSpace::release`].
#[derive(Debug, PartialEq, Eq)]
pub struct Reservation {
    base: u64,
    len: u64,
}

impl Reservation {
    /// First address of the range.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Length of the range in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the range is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `offset..offset + len` lies inside the range.
    pub fn contains(&self, offset: u64, len: u64) -> bool {
        offset
            .checked_add(len)
            .is_some_and(|end| end <= self.len)
    }
}

/// Committed backing memory for a sub-range of a [`Reservation`].
///
/// Always zeroed when returned by [`AddressSpace::commit`].
#[derive(Debug)]
pub struct CommittedPages {
    offset: u64,
    accounted: usize,
    bytes: Box<[u8]>,
}

impl CommittedPages {
    /// Offset of the committed range within its reservation.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Usable length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the committed range is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Bytes charged against the committed total (page-rounded).
    pub fn accounted(&self) -> usize {
        self.accounted
    }

    /// The committed bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// The committed bytes, mutably.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

/// Reserve/commit/decommit/release contract of the OS memory facility.
pub trait AddressSpace: Send + Sync {
    /// Reserve `size` bytes of address space without committing memory.
    fn reserve(&self, size: u64) -> Result<Reservation, AllocError>;

    /// Commit `len` bytes at `offset` within `reservation`.
    fn commit(
        &self,
        reservation: &Reservation,
        offset: u64,
        len: usize,
    ) -> Result<CommittedPages, AllocError>;

    /// Return committed memory to the OS. The range stays reserved.
    fn decommit(&self, pages: CommittedPages);

    /// Release a whole reservation at shutdown.
    fn release(&self, reservation: Reservation);

    /// Bytes currently committed through this address space.
    fn committed_bytes(&self) -> u64;
}

/// Heap-backed [`AddressSpace`].
///
/// An optional commit limit makes physical-memory exhaustion reproducible
/// in tests.
#[derive(Debug, Default)]
pub struct HeapAddressSpace {
    committed: AtomicU64,
    commit_limit: Option<u64>,
}

impl HeapAddressSpace {
    /// Create an address space with no commit limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an address space that refuses to commit more than `limit`
    /// bytes (page-rounded) at once.
    pub fn with_commit_limit(limit: u64) -> Self {
        Self {
            committed: AtomicU64::new(0),
            commit_limit: Some(limit),
        }
    }
}

impl AddressSpace for HeapAddressSpace {
    fn reserve(&self, size: u64) -> Result<Reservation, AllocError> {
        if size == 0 {
            return Err(AllocError::ReservationFailed { requested: size });
        }
        let span = size.div_ceil(PAGE_SIZE as u64) * PAGE_SIZE as u64;
        let base = NEXT_RESERVATION_BASE
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |b| b.checked_add(span))
            .map_err(|_| AllocError::ReservationFailed { requested: size })?;
        Ok(Reservation { base, len: size })
    }

    fn commit(
        &self,
        reservation: &Reservation,
        offset: u64,
        len: usize,
    ) -> Result<CommittedPages, AllocError> {
        let failed = AllocError::CommitFailed { offset, len };
        if !reservation.contains(offset, len as u64) {
            return Err(failed);
        }
        let accounted = len.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let before = self.committed.fetch_add(accounted as u64, Ordering::Relaxed);
        if let Some(limit) = self.commit_limit {
            if before + accounted as u64 > limit {
                self.committed.fetch_sub(accounted as u64, Ordering::Relaxed);
                return Err(failed);
            }
        }

        let mut bytes = Vec::new();
        if bytes.try_reserve_exact(len).is_err() {
            self.committed.fetch_sub(accounted as u64, Ordering::Relaxed);
            return Err(failed);
        }
        bytes.resize(len, 0);
        Ok(CommittedPages {
            offset,
            accounted,
            bytes: bytes.into_boxed_slice(),
        })
    }

    fn decommit(&self, pages: CommittedPages) {
        self.committed
            .fetch_sub(pages.accounted as u64, Ordering::Relaxed);
    }

    fn release(&self, _reservation: Reservation) {}

    fn committed_bytes(&self) -> u64 {
        self.committed.load(Ordering::Relaxed)
    }
}
