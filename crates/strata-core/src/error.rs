//! Allocation error type shared by the arena and its consumers.
//!
//! Only conditions the caller must act on are errors. Misuse of `free`
//! (foreign, stale, or double frees) is logged and counted by the arena
//! instead, so one tenant's bug cannot cascade into another's failure.

use std::error::Error;
use std::fmt;

use crate::id::{RegionId, TenantId};

/// Errors returned by allocation and payload-access operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllocError {
    /// Neither pool can satisfy the request: the reserved virtual space is
    /// exhausted or the backing memory could not be committed.
    OutOfMemory {
        /// Payload bytes requested.
        requested: usize,
        /// Tenant the request was made for.
        tenant: TenantId,
    },
    /// The request can never be satisfied by this allocator.
    TooLarge {
        /// Payload bytes requested.
        requested: usize,
        /// Largest payload this allocator accepts.
        max: usize,
    },
    /// The handle names a slot that does not exist.
    InvalidHandle {
        /// The region encoded in the handle.
        region: RegionId,
    },
    /// The handle's generation no longer matches its slot: the memory was
    /// freed, its tenant was closed, or the slot was recycled.
    StaleHandle {
        /// The region encoded in the handle.
        region: RegionId,
    },
    /// A byte range falls outside the addressed payload.
    OutOfBounds {
        /// Start of the requested range.
        offset: usize,
        /// Length of the requested range.
        len: usize,
        /// Size of the payload or buffer being addressed.
        capacity: usize,
    },
    /// The address-space collaborator refused the reservation.
    ReservationFailed {
        /// Bytes requested.
        requested: u64,
    },
    /// The address-space collaborator could not commit backing memory.
    CommitFailed {
        /// Offset within the reservation.
        offset: u64,
        /// Bytes requested.
        len: usize,
    },
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested, tenant } => {
                write!(
                    f,
                    "out of memory: {requested} bytes requested for tenant {tenant}"
                )
            }
            Self::TooLarge { requested, max } => {
                write!(f, "allocation too large: {requested} bytes, max {max} bytes")
            }
            Self::InvalidHandle { region } => write!(f, "invalid handle: {region}"),
            Self::StaleHandle { region } => write!(f, "stale handle: {region}"),
            Self::OutOfBounds {
                offset,
                len,
                capacity,
            } => {
                write!(
                    f,
                    "range {offset}..{} out of bounds for {capacity} bytes",
                    offset + len
                )
            }
            Self::ReservationFailed { requested } => {
                write!(f, "failed to reserve {requested} bytes of address space")
            }
            Self::CommitFailed { offset, len } => {
                write!(f, "failed to commit {len} bytes at offset {offset}")
            }
        }
    }
}

impl Error for AllocError {}
