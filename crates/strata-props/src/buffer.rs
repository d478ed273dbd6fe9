//! Growable byte buffers packed inside arena allocations.
//!
//! A [`PackedBuffer`] owns at most one arena allocation whose length is
//! one of a fixed ladder of sizes. `used` bytes at the front are live;
//! the rest is zero. Growth moves to the next rung that fits by copying
//! through a scratch vector, since payload closures must not re-enter the
//! arena.

use strata_core::{AllocHandle, ByteArena, TenantId};
use tracing::trace;

use crate::error::PropertyError;

/// Growth ladder for fixed-property buffers.
pub const FIXED_STEPS: &[u32] = &[32, 64, 128, 256, 512, 1024, 2048];

/// Growth ladder for variable-descriptor buffers.
pub const VAR_STEPS: &[u32] = &[32, 64, 128, 256, 512, 1024];

/// A packed byte buffer backed by one arena allocation.
///
/// Not `Clone`: the buffer owns its handle. Use
/// [`PackedBuffer::try_clone_in`] for a copy with its own allocation.
#[derive(Debug)]
pub struct PackedBuffer {
    handle: Option<AllocHandle>,
    used: u32,
    steps: &'static [u32],
}

impl PackedBuffer {
    /// An empty buffer that grows along `steps`.
    pub const fn new(steps: &'static [u32]) -> Self {
        Self {
            handle: None,
            used: 0,
            steps,
        }
    }

    /// Live bytes.
    pub fn used(&self) -> u32 {
        self.used
    }

    /// Allocated bytes.
    pub fn capacity(&self) -> u32 {
        self.handle.map_or(0, |h| h.len())
    }

    /// Largest size the buffer can grow to.
    pub fn max_capacity(&self) -> u32 {
        self.steps.last().copied().unwrap_or(0)
    }

    /// The backing allocation, if any.
    pub fn handle(&self) -> Option<AllocHandle> {
        self.handle
    }

    fn step_for(&self, needed: u32) -> Result<u32, PropertyError> {
        self.steps
            .iter()
            .copied()
            .find(|&s| s >= needed)
            .ok_or(PropertyError::BufferFull {
                needed,
                max: self.max_capacity(),
            })
    }

    /// Make room for at least `needed` bytes in total.
    pub fn reserve<A: ByteArena>(
        &mut self,
        arena: &A,
        tenant: TenantId,
        needed: u32,
    ) -> Result<(), PropertyError> {
        if needed <= self.capacity() {
            return Ok(());
        }
        let size = self.step_for(needed)?;
        self.move_to(arena, tenant, size)
    }

    /// Move to the smallest step holding the live bytes, or drop the
    /// allocation when nothing is live.
    pub fn shrink_to_fit<A: ByteArena>(
        &mut self,
        arena: &A,
        tenant: TenantId,
    ) -> Result<(), PropertyError> {
        if self.used == 0 {
            self.release(arena);
            return Ok(());
        }
        let size = self.step_for(self.used)?;
        if size < self.capacity() {
            self.move_to(arena, tenant, size)?;
        }
        Ok(())
    }

    fn move_to<A: ByteArena>(
        &mut self,
        arena: &A,
        tenant: TenantId,
        size: u32,
    ) -> Result<(), PropertyError> {
        let live = self.to_vec(arena)?;
        let fresh = arena.allocate(size as usize, tenant)?;
        if let Err(e) = arena.write(fresh, 0, &live) {
            arena.free(fresh);
            return Err(e.into());
        }
        if let Some(old) = self.handle.replace(fresh) {
            arena.free(old);
        }
        trace!(%tenant, from = live.len(), to = size, "moved packed buffer");
        Ok(())
    }

    /// Copy the live bytes into a fresh allocation of the same capacity.
    pub fn try_clone_in<A: ByteArena>(
        &self,
        arena: &A,
        tenant: TenantId,
    ) -> Result<Self, PropertyError> {
        let mut copy = Self::new(self.steps);
        let Some(handle) = self.handle else {
            return Ok(copy);
        };
        let live = self.to_vec(arena)?;
        let fresh = arena.allocate(handle.len() as usize, tenant)?;
        if let Err(e) = arena.write(fresh, 0, &live) {
            arena.free(fresh);
            return Err(e.into());
        }
        copy.handle = Some(fresh);
        copy.used = self.used;
        Ok(copy)
    }

    /// Shift bytes `at..used` right by `width` and zero the gap.
    ///
    /// Capacity must already cover `used + width`.
    pub fn open_gap<A: ByteArena>(
        &mut self,
        arena: &A,
        at: u32,
        width: u32,
    ) -> Result<(), PropertyError> {
        let used = self.used;
        if at > used {
            return Err(PropertyError::OutOfRange {
                offset: at,
                len: width,
                used,
            });
        }
        let handle = self.live_handle(used + width)?;
        let (at, width, used) = (at as usize, width as usize, used as usize);
        arena.with_bytes_mut(handle, |bytes| {
            bytes.copy_within(at..used, at + width);
            bytes[at..at + width].fill(0);
        })?;
        self.used += width as u32;
        Ok(())
    }

    /// Remove bytes `at..at + width`, shifting the tail left.
    pub fn close_gap<A: ByteArena>(
        &mut self,
        arena: &A,
        at: u32,
        width: u32,
    ) -> Result<(), PropertyError> {
        let used = self.used;
        self.check_range(at, width)?;
        let handle = self.live_handle(used)?;
        let (at, width, used) = (at as usize, width as usize, used as usize);
        arena.with_bytes_mut(handle, |bytes| {
            bytes.copy_within(at + width..used, at);
            bytes[used - width..used].fill(0);
        })?;
        self.used -= width as u32;
        Ok(())
    }

    /// Copy live bytes at `at` into `out`.
    pub fn read<A: ByteArena>(
        &self,
        arena: &A,
        at: u32,
        out: &mut [u8],
    ) -> Result<(), PropertyError> {
        self.check_range(at, out.len() as u32)?;
        let handle = self.live_handle(self.used)?;
        arena.read(handle, at as usize, out)?;
        Ok(())
    }

    /// Overwrite live bytes at `at` with `bytes`.
    pub fn write<A: ByteArena>(
        &mut self,
        arena: &A,
        at: u32,
        bytes: &[u8],
    ) -> Result<(), PropertyError> {
        self.check_range(at, bytes.len() as u32)?;
        let handle = self.live_handle(self.used)?;
        arena.write(handle, at as usize, bytes)?;
        Ok(())
    }

    /// The live bytes.
    pub fn to_vec<A: ByteArena>(&self, arena: &A) -> Result<Vec<u8>, PropertyError> {
        let mut out = vec![0u8; self.used as usize];
        if let Some(handle) = self.handle {
            arena.read(handle, 0, &mut out)?;
        }
        Ok(out)
    }

    /// Free the backing allocation and forget all bytes.
    pub fn release<A: ByteArena>(&mut self, arena: &A) {
        if let Some(handle) = self.handle.take() {
            arena.free(handle);
        }
        self.used = 0;
    }

    /// Drop the handle without freeing it. For buffers whose allocation
    /// the arena already reclaimed.
    pub fn forget(&mut self) {
        self.handle = None;
        self.used = 0;
    }

    fn check_range(&self, at: u32, len: u32) -> Result<(), PropertyError> {
        match at.checked_add(len) {
            Some(end) if end <= self.used => Ok(()),
            _ => Err(PropertyError::OutOfRange {
                offset: at,
                len,
                used: self.used,
            }),
        }
    }

    fn live_handle(&self, needed: u32) -> Result<AllocHandle, PropertyError> {
        match self.handle {
            Some(h) if h.len() >= needed => Ok(h),
            _ => Err(PropertyError::BufferFull {
                needed,
                max: self.capacity(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_test_utils::MockArena;

    const T: TenantId = TenantId(1);

    fn filled(arena: &MockArena, bytes: &[u8]) -> PackedBuffer {
        let mut buf = PackedBuffer::new(FIXED_STEPS);
        buf.reserve(arena, T, bytes.len() as u32).unwrap();
        buf.open_gap(arena, 0, bytes.len() as u32).unwrap();
        buf.write(arena, 0, bytes).unwrap();
        buf
    }

    #[test]
    fn reserve_walks_the_ladder() {
        let arena = MockArena::new();
        let mut buf = PackedBuffer::new(FIXED_STEPS);
        assert_eq!(buf.capacity(), 0);
        buf.reserve(&arena, T, 1).unwrap();
        assert_eq!(buf.capacity(), 32);
        buf.reserve(&arena, T, 33).unwrap();
        assert_eq!(buf.capacity(), 64);
        buf.reserve(&arena, T, 2000).unwrap();
        assert_eq!(buf.capacity(), 2048);
        assert_eq!(arena.live_allocations(), 1);
        assert_eq!(
            buf.reserve(&arena, T, 2049),
            Err(PropertyError::BufferFull {
                needed: 2049,
                max: 2048
            })
        );
    }

    #[test]
    fn growth_preserves_live_bytes() {
        let arena = MockArena::new();
        let mut buf = filled(&arena, &[1, 2, 3, 4, 5]);
        buf.reserve(&arena, T, 100).unwrap();
        assert_eq!(buf.capacity(), 128);
        assert_eq!(buf.to_vec(&arena).unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn gaps_shift_tail_bytes() {
        let arena = MockArena::new();
        let mut buf = filled(&arena, &[1, 2, 3, 4]);
        buf.open_gap(&arena, 2, 2).unwrap();
        assert_eq!(buf.to_vec(&arena).unwrap(), vec![1, 2, 0, 0, 3, 4]);
        buf.close_gap(&arena, 0, 2).unwrap();
        assert_eq!(buf.to_vec(&arena).unwrap(), vec![0, 0, 3, 4]);
        assert_eq!(buf.used(), 4);
    }

    #[test]
    fn open_gap_needs_capacity() {
        let arena = MockArena::new();
        let mut buf = filled(&arena, &[9; 32]);
        assert!(matches!(
            buf.open_gap(&arena, 0, 1),
            Err(PropertyError::BufferFull { .. })
        ));
        assert_eq!(buf.used(), 32);
    }

    #[test]
    fn reads_past_used_are_rejected() {
        let arena = MockArena::new();
        let buf = filled(&arena, &[1, 2]);
        let mut out = [0u8; 2];
        assert!(matches!(
            buf.read(&arena, 1, &mut out),
            Err(PropertyError::OutOfRange { .. })
        ));
    }

    #[test]
    fn clone_gets_its_own_allocation() {
        let arena = MockArena::new();
        let mut buf = filled(&arena, &[1, 2, 3]);
        let mut copy = buf.try_clone_in(&arena, TenantId(2)).unwrap();
        assert_ne!(copy.handle(), buf.handle());
        assert_eq!(copy.capacity(), buf.capacity());
        assert_eq!(arena.allocations_of(TenantId(2)), 1);

        copy.write(&arena, 0, &[9]).unwrap();
        assert_eq!(buf.to_vec(&arena).unwrap(), vec![1, 2, 3]);
        assert_eq!(copy.to_vec(&arena).unwrap(), vec![9, 2, 3]);

        buf.release(&arena);
        copy.release(&arena);
        assert_eq!(arena.live_allocations(), 0);
        assert_eq!(arena.rejected_frees(), 0);

        let empty = PackedBuffer::new(VAR_STEPS);
        assert!(empty.try_clone_in(&arena, T).unwrap().handle().is_none());
    }

    #[test]
    fn shrink_and_release_return_memory() {
        let arena = MockArena::new();
        let mut buf = filled(&arena, &[7; 10]);
        buf.reserve(&arena, T, 500).unwrap();
        assert_eq!(buf.capacity(), 512);
        buf.shrink_to_fit(&arena, T).unwrap();
        assert_eq!(buf.capacity(), 32);
        assert_eq!(buf.to_vec(&arena).unwrap(), vec![7; 10]);
        buf.release(&arena);
        assert_eq!(buf.capacity(), 0);
        assert_eq!(arena.live_allocations(), 0);
    }
}
