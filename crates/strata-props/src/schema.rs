//! Property schemas: the declared, ordered property list of an object type.
//!
//! A schema fixes the order properties are packed in. Fixed-width
//! properties are numbered 0..64 in declaration order, variable-length
//! ones separately 0..64. The per-index width table is computed once at
//! build time and handed to every offset computation.

use std::fmt;
use std::marker::PhantomData;

use indexmap::IndexMap;

use crate::error::{PropertyError, SchemaError};
use crate::value::{PropertyType, PropertyValue};

/// Most fixed-width properties a schema can declare.
pub const MAX_FIXED_PROPERTIES: usize = 64;

/// Most variable-length properties a schema can declare.
pub const MAX_VAR_PROPERTIES: usize = 64;

/// Width in bytes of each fixed property index; zero for undeclared ones.
///
/// Also keeps the widths packed eight to a `u64` lane group for the
/// byte-lane offset kernel.
#[derive(Clone, PartialEq, Eq)]
pub struct FieldWidths {
    widths: [u8; MAX_FIXED_PROPERTIES],
    lanes: [u64; MAX_FIXED_PROPERTIES / 8],
}

impl FieldWidths {
    /// Build from a full 64-entry table.
    pub fn new(widths: [u8; MAX_FIXED_PROPERTIES]) -> Self {
        let mut lanes = [0u64; MAX_FIXED_PROPERTIES / 8];
        for (lane, group) in lanes.iter_mut().zip(widths.chunks_exact(8)) {
            *lane = group
                .iter()
                .rev()
                .fold(0u64, |acc, &w| (acc << 8) | w as u64);
        }
        Self { widths, lanes }
    }

    /// Build from the widths of indices `0..widths.len()`; the rest are
    /// zero. Extra entries past 64 are ignored.
    pub fn from_slice(widths: &[u8]) -> Self {
        let mut table = [0u8; MAX_FIXED_PROPERTIES];
        for (slot, &w) in table.iter_mut().zip(widths) {
            *slot = w;
        }
        Self::new(table)
    }

    /// Width of property `index`, zero if undeclared or out of range.
    pub fn get(&self, index: u8) -> u8 {
        self.widths.get(index as usize).copied().unwrap_or(0)
    }

    /// The raw table.
    pub fn as_array(&self) -> &[u8; MAX_FIXED_PROPERTIES] {
        &self.widths
    }

    /// Widths packed little-endian, eight indices per lane group.
    pub fn lanes(&self) -> &[u64; MAX_FIXED_PROPERTIES / 8] {
        &self.lanes
    }

    /// Sum of all widths: the packed size with every property set.
    pub fn total(&self) -> u32 {
        self.widths.iter().map(|&w| w as u32).sum()
    }
}

impl fmt::Debug for FieldWidths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let declared = self.widths.iter().rposition(|&w| w != 0).map_or(0, |i| i + 1);
        f.debug_tuple("FieldWidths")
            .field(&&self.widths[..declared])
            .finish()
    }
}

/// A declared fixed-width property.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FixedProperty {
    /// Property name, unique within the schema.
    pub name: String,
    /// Stored type.
    pub ty: PropertyType,
    /// Index in declaration order.
    pub index: u8,
}

/// A declared variable-length property.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VarProperty {
    /// Property name, unique within the schema.
    pub name: String,
    /// Index in declaration order among variable properties.
    pub index: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Slot {
    Fixed(u8),
    Var(u8),
}

/// Typed handle to a fixed property, obtained from
/// [`PropertySchema::fixed_key`] after a type check.
pub struct FixedKey<T> {
    index: u8,
    _marker: PhantomData<fn() -> T>,
}

impl<T> FixedKey<T> {
    fn new(index: u8) -> Self {
        Self {
            index,
            _marker: PhantomData,
        }
    }

    /// The property index.
    pub fn index(&self) -> u8 {
        self.index
    }
}

impl<T> Clone for FixedKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for FixedKey<T> {}

impl<T> fmt::Debug for FixedKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FixedKey({})", self.index)
    }
}

/// Handle to a variable-length property slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VarKey {
    index: u8,
}

impl VarKey {
    /// Key for variable slot `index`.
    pub fn new(index: u8) -> Result<Self, PropertyError> {
        if index as usize >= MAX_VAR_PROPERTIES {
            return Err(PropertyError::UnknownProperty { index });
        }
        Ok(Self { index })
    }

    /// The slot index.
    pub fn index(&self) -> u8 {
        self.index
    }
}

/// An object type's declared properties.
///
/// # Examples
///
/// ```
/// use strata_props::{PropertySchema, PropertyType};
///
/// let schema = PropertySchema::builder("Pipe")
///     .fixed("diameter", PropertyType::F64)
///     .fixed("rating", PropertyType::U32)
///     .var("notes")
///     .build()
///     .unwrap();
/// assert_eq!(schema.widths().get(1), 4);
/// assert!(schema.fixed_key::<f64>("diameter").is_ok());
/// assert!(schema.fixed_key::<u32>("diameter").is_err());
/// ```
#[derive(Clone, Debug)]
pub struct PropertySchema {
    type_name: String,
    fixed: Vec<FixedProperty>,
    var: Vec<VarProperty>,
    widths: FieldWidths,
    by_name: IndexMap<String, Slot>,
    hash: u64,
}

impl PropertySchema {
    /// Start declaring a schema for `type_name`.
    pub fn builder(type_name: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            type_name: type_name.into(),
            entries: Vec::new(),
        }
    }

    /// Object type name.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Width table for the fixed properties.
    pub fn widths(&self) -> &FieldWidths {
        &self.widths
    }

    /// Fixed properties in index order.
    pub fn fixed(&self) -> &[FixedProperty] {
        &self.fixed
    }

    /// Variable properties in index order.
    pub fn var(&self) -> &[VarProperty] {
        &self.var
    }

    /// Fixed property `index`, if declared.
    pub fn fixed_property(&self, index: u8) -> Option<&FixedProperty> {
        self.fixed.get(index as usize)
    }

    /// Index of the fixed property called `name`.
    pub fn fixed_index(&self, name: &str) -> Option<u8> {
        match self.by_name.get(name)? {
            Slot::Fixed(i) => Some(*i),
            Slot::Var(_) => None,
        }
    }

    /// Index of the variable property called `name`.
    pub fn var_index(&self, name: &str) -> Option<u8> {
        match self.by_name.get(name)? {
            Slot::Var(i) => Some(*i),
            Slot::Fixed(_) => None,
        }
    }

    /// Typed key for the fixed property `name`, checked against `T`.
    pub fn fixed_key<T: PropertyValue>(&self, name: &str) -> Result<FixedKey<T>, PropertyError> {
        let index = self.fixed_index(name).ok_or_else(|| PropertyError::UnknownName {
            name: name.to_string(),
        })?;
        let declared = self.fixed[index as usize].ty;
        if declared != T::TYPE {
            return Err(PropertyError::TypeMismatch {
                name: name.to_string(),
                declared,
                requested: T::TYPE,
            });
        }
        Ok(FixedKey::new(index))
    }

    /// Key for the variable property `name`.
    pub fn var_key(&self, name: &str) -> Result<VarKey, PropertyError> {
        let index = self.var_index(name).ok_or_else(|| PropertyError::UnknownName {
            name: name.to_string(),
        })?;
        Ok(VarKey { index })
    }

    /// 64-bit FNV-1a digest of the type name and declared properties.
    ///
    /// Two schemas with the same hash declare the same layout.
    pub fn schema_hash(&self) -> u64 {
        self.hash
    }

    fn compute_hash(type_name: &str, fixed: &[FixedProperty], var: &[VarProperty]) -> u64 {
        let mut h = Fnv1a::new();
        h.write(type_name.as_bytes());
        for p in fixed {
            h.write(&[0x01]);
            h.write(p.name.as_bytes());
            h.write(&[0x00, p.ty.tag()]);
        }
        for p in var {
            h.write(&[0x02]);
            h.write(p.name.as_bytes());
            h.write(&[0x00]);
        }
        h.finish()
    }
}

struct Fnv1a(u64);

impl Fnv1a {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    fn new() -> Self {
        Self(Self::OFFSET_BASIS)
    }

    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(Self::PRIME);
        }
    }

    fn finish(&self) -> u64 {
        self.0
    }
}

enum Entry {
    Fixed(String, PropertyType),
    Var(String),
}

/// Builder returned by [`PropertySchema::builder`].
pub struct SchemaBuilder {
    type_name: String,
    entries: Vec<Entry>,
}

impl SchemaBuilder {
    /// Declare the next fixed-width property.
    pub fn fixed(mut self, name: impl Into<String>, ty: PropertyType) -> Self {
        self.entries.push(Entry::Fixed(name.into(), ty));
        self
    }

    /// Declare the next variable-length property.
    pub fn var(mut self, name: impl Into<String>) -> Self {
        self.entries.push(Entry::Var(name.into()));
        self
    }

    /// Validate and freeze the schema.
    pub fn build(self) -> Result<PropertySchema, SchemaError> {
        if self.entries.is_empty() {
            return Err(SchemaError::Empty);
        }
        let fixed_count = self
            .entries
            .iter()
            .filter(|e| matches!(e, Entry::Fixed(..)))
            .count();
        if fixed_count > MAX_FIXED_PROPERTIES {
            return Err(SchemaError::TooManyFixed { count: fixed_count });
        }
        let var_count = self.entries.len() - fixed_count;
        if var_count > MAX_VAR_PROPERTIES {
            return Err(SchemaError::TooManyVar { count: var_count });
        }

        let mut fixed = Vec::with_capacity(fixed_count);
        let mut var = Vec::with_capacity(var_count);
        let mut by_name = IndexMap::with_capacity(self.entries.len());
        let mut widths = [0u8; MAX_FIXED_PROPERTIES];

        for entry in self.entries {
            let (name, slot) = match entry {
                Entry::Fixed(name, ty) => {
                    let index = fixed.len() as u8;
                    widths[index as usize] = ty.width();
                    fixed.push(FixedProperty {
                        name: name.clone(),
                        ty,
                        index,
                    });
                    (name, Slot::Fixed(index))
                }
                Entry::Var(name) => {
                    let index = var.len() as u8;
                    var.push(VarProperty {
                        name: name.clone(),
                        index,
                    });
                    (name, Slot::Var(index))
                }
            };
            if by_name.contains_key(&name) {
                return Err(SchemaError::DuplicateName { name });
            }
            by_name.insert(name, slot);
        }

        let hash = PropertySchema::compute_hash(&self.type_name, &fixed, &var);
        Ok(PropertySchema {
            type_name: self.type_name,
            fixed,
            var,
            widths: FieldWidths::new(widths),
            by_name,
            hash,
        })
    }
}
