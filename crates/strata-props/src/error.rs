//! Property-store error types.

use std::error::Error;
use std::fmt;

use strata_core::AllocError;

use crate::value::PropertyType;

/// Errors from property-set operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PropertyError {
    /// The backing arena refused an allocation or payload access.
    Alloc(AllocError),
    /// The index is outside the schema (or has zero width).
    UnknownProperty {
        /// The property index.
        index: u8,
    },
    /// No property of that name is declared.
    UnknownName {
        /// The name looked up.
        name: String,
    },
    /// The property is declared with a different type.
    TypeMismatch {
        /// The property name.
        name: String,
        /// Declared type.
        declared: PropertyType,
        /// Type requested by the caller.
        requested: PropertyType,
    },
    /// A value's width does not match the width table entry.
    WidthMismatch {
        /// The property index.
        index: u8,
        /// Width in the table.
        width: u8,
        /// Width of the value type.
        value_width: u8,
    },
    /// Growing a packed buffer would exceed its largest step.
    BufferFull {
        /// Bytes needed.
        needed: u32,
        /// Largest buffer size.
        max: u32,
    },
    /// A byte range falls outside the used part of a packed buffer.
    OutOfRange {
        /// Start of the range.
        offset: u32,
        /// Length of the range.
        len: u32,
        /// Used bytes of the buffer.
        used: u32,
    },
    /// A variable-field descriptor could not be read back.
    CorruptDescriptor {
        /// The variable property index.
        index: u8,
    },
}

impl fmt::Display for PropertyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Alloc(e) => write!(f, "arena error: {e}"),
            Self::UnknownProperty { index } => write!(f, "unknown property index {index}"),
            Self::UnknownName { name } => write!(f, "unknown property {name:?}"),
            Self::TypeMismatch {
                name,
                declared,
                requested,
            } => write!(
                f,
                "property {name:?} is declared {declared}, requested as {requested}"
            ),
            Self::WidthMismatch {
                index,
                width,
                value_width,
            } => write!(
                f,
                "property {index} is {width} bytes wide, value is {value_width} bytes"
            ),
            Self::BufferFull { needed, max } => {
                write!(f, "packed buffer needs {needed} bytes, max {max}")
            }
            Self::OutOfRange { offset, len, used } => write!(
                f,
                "range {offset}..{} outside {used} used bytes",
                offset + len
            ),
            Self::CorruptDescriptor { index } => {
                write!(f, "descriptor for variable property {index} is unreadable")
            }
        }
    }
}

impl Error for PropertyError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Alloc(e) => Some(e),
            _ => None,
        }
    }
}

impl From<AllocError> for PropertyError {
    fn from(e: AllocError) -> Self {
        Self::Alloc(e)
    }
}

/// Errors from schema construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SchemaError {
    /// The schema declares no properties.
    Empty,
    /// More than 64 fixed-width properties.
    TooManyFixed {
        /// Number declared.
        count: usize,
    },
    /// More than 64 variable-length properties.
    TooManyVar {
        /// Number declared.
        count: usize,
    },
    /// Two properties share a name.
    DuplicateName {
        /// The repeated name.
        name: String,
    },
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "schema declares no properties"),
            Self::TooManyFixed { count } => {
                write!(f, "{count} fixed properties declared, max 64")
            }
            Self::TooManyVar { count } => {
                write!(f, "{count} variable properties declared, max 64")
            }
            Self::DuplicateName { name } => write!(f, "duplicate property name {name:?}"),
        }
    }
}

impl Error for SchemaError {}
