//! Test utilities and mock types for Strata development.
//!
//! Provides [`MockArena`], a [`ByteArena`] backed by one heap vector per
//! allocation, plus schema fixtures and a tracing initialiser in
//! [`fixtures`].

#![forbid(unsafe_code)]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod fixtures;

pub use fixtures::{init_tracing, pipe_schema, vessel_schema};

use std::collections::HashMap;

use parking_lot::Mutex;
use strata_core::{AllocError, AllocHandle, ByteArena, RegionId, TenantId};
use tracing::warn;

/// Offset every mock handle reports, mirroring the arena's size header.
const MOCK_PAYLOAD_OFFSET: u32 = AllocHandle::HEADER_BYTES;

struct MockAllocation {
    tenant: TenantId,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct MockState {
    next: u32,
    live: HashMap<u32, MockAllocation>,
    live_bytes: usize,
    rejected_frees: u64,
}

/// Mock implementation of [`ByteArena`].
///
/// Every allocation gets its own region index and never reuses one, so
/// any access through a freed handle fails with
/// [`AllocError::StaleHandle`]. An optional byte limit makes allocation
/// fail with [`AllocError::OutOfMemory`] once live payloads would exceed
/// it.
pub struct MockArena {
    state: Mutex<MockState>,
    limit: Option<usize>,
}

impl MockArena {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            limit: None,
        }
    }

    /// A mock that refuses to hold more than `bytes` live payload bytes.
    pub fn with_limit(bytes: usize) -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            limit: Some(bytes),
        }
    }

    /// Number of allocations not yet freed.
    pub fn live_allocations(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Total payload bytes not yet freed.
    pub fn live_bytes(&self) -> usize {
        self.state.lock().live_bytes
    }

    /// Live allocations owned by `tenant`.
    pub fn allocations_of(&self, tenant: TenantId) -> usize {
        self.state
            .lock()
            .live
            .values()
            .filter(|a| a.tenant == tenant)
            .count()
    }

    /// Frees that named no live allocation.
    pub fn rejected_frees(&self) -> u64 {
        self.state.lock().rejected_frees
    }
}

impl Default for MockArena {
    fn default() -> Self {
        Self::new()
    }
}

fn lookup(
    live: &mut HashMap<u32, MockAllocation>,
    handle: AllocHandle,
) -> Result<&mut MockAllocation, AllocError> {
    let region = handle.region();
    match live.get_mut(&region.index()) {
        Some(alloc) if alloc.bytes.len() == handle.len() as usize => Ok(alloc),
        Some(_) => Err(AllocError::InvalidHandle { region }),
        None => Err(AllocError::StaleHandle { region }),
    }
}

impl ByteArena for MockArena {
    fn allocate(&self, size: usize, tenant: TenantId) -> Result<AllocHandle, AllocError> {
        let len = u32::try_from(size).map_err(|_| AllocError::TooLarge {
            requested: size,
            max: u32::MAX as usize,
        })?;
        let mut state = self.state.lock();
        if let Some(limit) = self.limit {
            if state.live_bytes + size > limit {
                return Err(AllocError::OutOfMemory {
                    requested: size,
                    tenant,
                });
            }
        }
        state.next += 1;
        let index = state.next;
        state.live.insert(
            index,
            MockAllocation {
                tenant,
                bytes: vec![0u8; size],
            },
        );
        state.live_bytes += size;
        Ok(AllocHandle::new(
            RegionId::small(index, 0),
            MOCK_PAYLOAD_OFFSET,
            len,
        ))
    }

    fn free(&self, handle: AllocHandle) {
        let mut state = self.state.lock();
        let verdict = lookup(&mut state.live, handle).map(|alloc| alloc.bytes.len());
        match verdict {
            Ok(len) => {
                state.live.remove(&handle.region().index());
                state.live_bytes -= len;
            }
            Err(e) => {
                state.rejected_frees += 1;
                warn!(%handle, error = %e, "mock arena rejected free");
            }
        }
    }

    fn with_bytes<R>(
        &self,
        handle: AllocHandle,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R, AllocError> {
        let mut state = self.state.lock();
        let alloc = lookup(&mut state.live, handle)?;
        Ok(f(&alloc.bytes))
    }

    fn with_bytes_mut<R>(
        &self,
        handle: AllocHandle,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, AllocError> {
        let mut state = self.state.lock();
        let alloc = lookup(&mut state.live, handle)?;
        Ok(f(&mut alloc.bytes))
    }
}
