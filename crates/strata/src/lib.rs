//! Strata: tenant-scoped arena allocation and sparse property storage.
//!
//! This is the top-level facade crate that re-exports the public API from
//! the Strata sub-crates.
//!
//! # Quick start
//!
//! ```rust
//! use strata::prelude::*;
//!
//! let arena = TenantArena::new(ArenaConfig::new().with_reserve_bytes(64 << 20)).unwrap();
//! let schema = PropertySchema::builder("Valve")
//!     .fixed("size", PropertyType::F32)
//!     .fixed("rating", PropertyType::U16)
//!     .var("notes")
//!     .build()
//!     .unwrap();
//!
//! let document = TenantId(1);
//! let mut props = OptionalPropertySet::new(document);
//! let rating = schema.fixed_key::<u16>("rating").unwrap();
//! props.set(&arena, &schema, rating, 600).unwrap();
//! props
//!     .set_bytes(&arena, schema.var_key("notes").unwrap(), b"locked open")
//!     .unwrap();
//! assert_eq!(props.value(&arena, &schema, rating).unwrap(), Some(600));
//! assert_eq!(props.used_bytes(), 2);
//!
//! // Closing the document releases everything it allocated at once.
//! let release = arena.notify_tenant_closed(document);
//! assert_eq!(release.chunks, 1);
//! props.abandon();
//! ```
//!
//! # Modules
//!
//! | Module | Sub-crate | Contents |
//! |--------|-----------|----------|
//! | [`types`] | `strata-core` | Tenant and region ids, handles, `ByteArena` |
//! | [`arena`] | `strata-arena` | `TenantArena`, chunks, large pool, config |
//! | [`props`] | `strata-props` | Schemas, value types, `OptionalPropertySet` |

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

/// Identifiers, handles, and the allocation trait (`strata-core`).
pub use strata_core as types;

/// The tenant arena and its pools (`strata-arena`).
///
/// [`arena::TenantArena`] is the allocator; [`arena::ArenaConfig`]
/// sizes it.
pub use strata_arena as arena;

/// Sparse optional-property storage (`strata-props`).
pub use strata_props as props;

/// Common imports for typical Strata usage.
///
/// ```rust
/// use strata::prelude::*;
/// ```
pub mod prelude {
    // Core
    pub use strata_core::{AllocError, AllocHandle, ByteArena, TenantId};

    // Arena
    pub use strata_arena::{ArenaConfig, ArenaError, TenantArena, TenantRelease};

    // Properties
    pub use strata_props::{
        Bf16, Byte16, Byte32, OptionalPropertySet, PropertyError, PropertySchema, PropertyType,
        VarKey,
    };
}
