//! Sparse optional-property storage for Strata objects.
//!
//! A CAD object type declares up to 64 fixed-width properties and up to 64
//! variable-length ones in a [`PropertySchema`]. Most objects set only a
//! handful, so an [`OptionalPropertySet`] stores just the set values,
//! packed back to back in schema order inside arena allocations. A
//! property's byte offset is the width-weighted popcount of the presence
//! mask below its index.
//!
//! # Architecture
//!
//! ```text
//! OptionalPropertySet (one per object)
//! ├── fixed_mask: u64 ── packed_offset(mask, index, FieldWidths)
//! ├── x: PackedBuffer  (fixed values, 32..2048 B ladder)
//! ├── var_mask: u64
//! └── y: PackedBuffer  (12-byte AllocHandle descriptors, 32..1024 B)
//!         └── one arena allocation per variable value
//! ```
//!
//! Every operation takes the arena as a `&impl ByteArena`
//! ([`strata_core::ByteArena`]), so the store runs equally over
//! `strata_arena::TenantArena` or a test mock.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod buffer;
pub mod error;
pub mod offset;
pub mod schema;
pub mod set;
pub mod value;

pub use buffer::{PackedBuffer, FIXED_STEPS, VAR_STEPS};
pub use error::{PropertyError, SchemaError};
pub use offset::{packed_offset, weighted_popcount, weighted_popcount_lanes};
pub use schema::{
    FieldWidths, FixedKey, FixedProperty, PropertySchema, SchemaBuilder, VarKey, VarProperty,
    MAX_FIXED_PROPERTIES, MAX_VAR_PROPERTIES,
};
pub use set::{OptionalPropertySet, VAR_DESCRIPTOR_BYTES};
pub use value::{Bf16, Byte16, Byte32, PropertyType, PropertyValue};
