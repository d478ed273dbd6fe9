//! The allocation seam between the arena and its consumers.

use crate::error::AllocError;
use crate::handle::AllocHandle;
use crate::id::TenantId;

/// Tenant-scoped byte allocator with handle-based payload access.
///
/// Implemented by `strata_arena::TenantArena` and by the mock arena in
/// `strata-test-utils`. The property store is generic over this trait so
/// it can be exercised against either.
///
/// Payload access is closure-scoped: the slice handed to `f` is exactly
/// `handle.len()` bytes long and is only valid for the duration of the
/// call. Implementations may hold a lock while `f` runs, so `f` must not
/// call back into the arena.
pub trait ByteArena {
    /// Allocate `size` payload bytes for `tenant`.
    ///
    /// The payload is zero-initialised.
    fn allocate(&self, size: usize, tenant: TenantId) -> Result<AllocHandle, AllocError>;

    /// Release an allocation.
    ///
    /// Invalid, stale, or repeated frees are reported through diagnostics
    /// and otherwise ignored.
    fn free(&self, handle: AllocHandle);

    /// Run `f` over the payload bytes.
    fn with_bytes<R>(
        &self,
        handle: AllocHandle,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R, AllocError>;

    /// Run `f` over the mutable payload bytes.
    fn with_bytes_mut<R>(
        &self,
        handle: AllocHandle,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, AllocError>;

    /// Copy `bytes` into the payload at `at`.
    fn write(&self, handle: AllocHandle, at: usize, bytes: &[u8]) -> Result<(), AllocError> {
        self.with_bytes_mut(handle, |payload| {
            let end = at.checked_add(bytes.len()).filter(|&end| end <= payload.len());
            match end {
                Some(end) => {
                    payload[at..end].copy_from_slice(bytes);
                    Ok(())
                }
                None => Err(AllocError::OutOfBounds {
                    offset: at,
                    len: bytes.len(),
                    capacity: payload.len(),
                }),
            }
        })?
    }

    /// Copy payload bytes starting at `at` into `out`.
    fn read(&self, handle: AllocHandle, at: usize, out: &mut [u8]) -> Result<(), AllocError> {
        self.with_bytes(handle, |payload| {
            let end = at.checked_add(out.len()).filter(|&end| end <= payload.len());
            match end {
                Some(end) => {
                    out.copy_from_slice(&payload[at..end]);
                    Ok(())
                }
                None => Err(AllocError::OutOfBounds {
                    offset: at,
                    len: out.len(),
                    capacity: payload.len(),
                }),
            }
        })?
    }

    /// Copy the whole payload into a fresh vector.
    fn to_vec(&self, handle: AllocHandle) -> Result<Vec<u8>, AllocError> {
        self.with_bytes(handle, |payload| payload.to_vec())
    }
}
