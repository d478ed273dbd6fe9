//! Tenant-scoped arena allocation for Strata.
//!
//! Every allocation belongs to a tenant (one per open document). Small
//! payloads are carved from 4 MiB chunks that a single tenant owns; large
//! payloads get dedicated, separately committed blocks. Closing a tenant
//! decommits everything it owns in one step and recycles its chunks for
//! other tenants.
//!
//! # Architecture
//!
//! ```text
//! TenantArena (orchestrator, one reservation)
//! ├── AddressSpace (reserve / commit / decommit / release)
//! ├── small region [0, reserve/2)
//! │   └── Arc<Mutex<Chunk>>[]  (4 MiB slots, generation-tagged)
//! │       └── free-range table  (≤498 sorted, coalesced ranges)
//! ├── large region [reserve/2, reserve)
//! │   └── LargePool  (first-fit free map + bump pointer, slot table)
//! └── tenants: TenantId → { active chunk, owned chunks }
//! ```
//!
//! # Handles
//!
//! Allocations are named by [`AllocHandle`](strata_core::AllocHandle)
//! values carrying (region, payload offset, length). Payloads are reached
//! through closure-scoped accessors that check the handle's generation and
//! size header before exposing exactly `len` bytes.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod address_space;
pub mod chunk;
pub mod config;
pub mod error;
pub mod large;
pub mod manager;

// Public re-exports for the primary API surface.
pub use address_space::{AddressSpace, CommittedPages, HeapAddressSpace, Reservation};
pub use chunk::{ChunkUsage, CHUNK_BYTES, CHUNK_DATA_BYTES, MAX_FREE_RANGES};
pub use config::{ArenaConfig, ConfigError};
pub use error::ArenaError;
pub use manager::{
    route, small_footprint, ArenaStats, TenantArena, TenantRelease, ALLOC_HEADER_BYTES,
    LARGE_ALLOC_THRESHOLD,
};
