//! Core types and traits for the Strata tenant arena.
//!
//! This is the leaf crate with zero internal dependencies. It defines
//! the vocabulary shared by the allocator and its consumers: tenant and
//! region identifiers, the packed [`AllocHandle`], the allocation error
//! type, and the [`ByteArena`] trait through which the property store
//! (and any other consumer) requests memory.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod error;
pub mod handle;
pub mod id;
pub mod traits;

pub use error::AllocError;
pub use handle::AllocHandle;
pub use id::{Pool, RegionId, TenantId};
pub use traits::ByteArena;
