//! Sparse optional-property sets.
//!
//! An [`OptionalPropertySet`] stores only the properties that are set.
//! Two 64-bit presence masks record which fixed and which variable
//! properties exist. Fixed values are packed back to back in schema order
//! in the `x` buffer; variable properties each get a 12-byte descriptor
//! (an encoded [`AllocHandle`]) in the `y` buffer pointing at a separate
//! arena allocation holding their bytes.
//!
//! The set holds arena allocations but no reference to the arena, so it
//! must be emptied with [`OptionalPropertySet::release`] before it is
//! dropped, or given up with [`OptionalPropertySet::abandon`] once its
//! tenant has been closed. Debug builds assert this on drop. The set is
//! not `Clone`; [`OptionalPropertySet::try_clone_in`] copies it into fresh
//! allocations.

use std::fmt::Write as _;

use smallvec::SmallVec;
use strata_core::{AllocHandle, ByteArena, TenantId};
use tracing::warn;

use crate::buffer::{PackedBuffer, FIXED_STEPS, VAR_STEPS};
use crate::error::PropertyError;
use crate::offset::packed_offset;
use crate::schema::{FieldWidths, FixedKey, PropertySchema, VarKey};
use crate::value::{Bf16, Byte16, Byte32, PropertyType, PropertyValue};

/// Bytes of one variable-property descriptor.
pub const VAR_DESCRIPTOR_BYTES: u32 = AllocHandle::ENCODED_LEN as u32;

/// Property values of one object, packed by presence mask.
#[derive(Debug)]
pub struct OptionalPropertySet {
    tenant: TenantId,
    fixed_mask: u64,
    var_mask: u64,
    x: PackedBuffer,
    y: PackedBuffer,
}

fn bit(index: u8) -> u64 {
    1u64 << index
}

impl OptionalPropertySet {
    /// An empty set whose allocations belong to `tenant`.
    pub const fn new(tenant: TenantId) -> Self {
        Self {
            tenant,
            fixed_mask: 0,
            var_mask: 0,
            x: PackedBuffer::new(FIXED_STEPS),
            y: PackedBuffer::new(VAR_STEPS),
        }
    }

    /// Tenant the set allocates for.
    pub fn tenant(&self) -> TenantId {
        self.tenant
    }

    /// Presence mask of fixed properties.
    pub fn fixed_mask(&self) -> u64 {
        self.fixed_mask
    }

    /// Presence mask of variable properties.
    pub fn var_mask(&self) -> u64 {
        self.var_mask
    }

    /// Packed bytes in use by fixed values.
    pub fn used_bytes(&self) -> u32 {
        self.x.used()
    }

    /// Allocated bytes of the fixed-value buffer.
    pub fn fixed_capacity(&self) -> u32 {
        self.x.capacity()
    }

    /// Allocated bytes of the descriptor buffer.
    pub fn var_capacity(&self) -> u32 {
        self.y.capacity()
    }

    /// Whether fixed property `index` is set.
    pub fn is_set(&self, index: u8) -> bool {
        index < 64 && self.fixed_mask & bit(index) != 0
    }

    /// Whether variable property `index` is set.
    pub fn is_var_set(&self, index: u8) -> bool {
        index < 64 && self.var_mask & bit(index) != 0
    }

    /// Whether nothing is set.
    pub fn is_empty(&self) -> bool {
        self.fixed_mask == 0 && self.var_mask == 0
    }

    /// Offset of fixed property `index` if it is set.
    pub fn offset_of(&self, index: u8, widths: &FieldWidths) -> Option<u32> {
        self.is_set(index)
            .then(|| packed_offset(self.fixed_mask, index, widths))
    }

    fn width_of(index: u8, widths: &FieldWidths) -> Result<u32, PropertyError> {
        match widths.get(index) {
            0 => Err(PropertyError::UnknownProperty { index }),
            w => Ok(w as u32),
        }
    }

    /// Make room for fixed property `index` and return its offset.
    ///
    /// Already-set properties keep their bytes and offset. Otherwise the
    /// bytes of every later set property shift right by the property's
    /// width and the new slot reads as zero.
    pub fn enable_property<A: ByteArena>(
        &mut self,
        arena: &A,
        index: u8,
        widths: &FieldWidths,
    ) -> Result<u32, PropertyError> {
        let width = Self::width_of(index, widths)?;
        let offset = packed_offset(self.fixed_mask, index, widths);
        if self.is_set(index) {
            return Ok(offset);
        }
        self.x.reserve(arena, self.tenant, self.x.used() + width)?;
        self.x.open_gap(arena, offset, width)?;
        self.fixed_mask |= bit(index);
        Ok(offset)
    }

    /// Remove fixed property `index`, shifting later bytes left.
    ///
    /// Returns whether it was set. The buffer keeps its capacity.
    pub fn unset<A: ByteArena>(
        &mut self,
        arena: &A,
        index: u8,
        widths: &FieldWidths,
    ) -> Result<bool, PropertyError> {
        let width = Self::width_of(index, widths)?;
        if !self.is_set(index) {
            return Ok(false);
        }
        let offset = packed_offset(self.fixed_mask, index, widths);
        self.x.close_gap(arena, offset, width)?;
        self.fixed_mask &= !bit(index);
        Ok(true)
    }

    /// Read a `T` at packed `offset`.
    pub fn read_at<T: PropertyValue, A: ByteArena>(
        &self,
        arena: &A,
        offset: u32,
    ) -> Result<T, PropertyError> {
        let mut raw = [0u8; 32];
        let raw = &mut raw[..T::TYPE.width() as usize];
        self.x.read(arena, offset, raw)?;
        Ok(T::read_le(raw))
    }

    /// Write `value` at packed `offset`.
    pub fn set_at<T: PropertyValue, A: ByteArena>(
        &mut self,
        arena: &A,
        offset: u32,
        value: T,
    ) -> Result<(), PropertyError> {
        let mut raw = [0u8; 32];
        let raw = &mut raw[..T::TYPE.width() as usize];
        value.write_le(raw);
        self.x.write(arena, offset, raw)
    }

    /// Value of fixed property `index`, or `T::default()` when unset.
    pub fn get<T: PropertyValue, A: ByteArena>(
        &self,
        arena: &A,
        index: u8,
        widths: &FieldWidths,
    ) -> Result<T, PropertyError> {
        let width = Self::width_of(index, widths)?;
        if width != T::TYPE.width() as u32 {
            return Err(PropertyError::WidthMismatch {
                index,
                width: width as u8,
                value_width: T::TYPE.width(),
            });
        }
        match self.offset_of(index, widths) {
            Some(offset) => self.read_at(arena, offset),
            None => Ok(T::default()),
        }
    }

    /// Set the property named by `key`.
    pub fn set<T: PropertyValue, A: ByteArena>(
        &mut self,
        arena: &A,
        schema: &PropertySchema,
        key: FixedKey<T>,
        value: T,
    ) -> Result<(), PropertyError> {
        let offset = self.enable_property(arena, key.index(), schema.widths())?;
        self.set_at(arena, offset, value)
    }

    /// Value of the property named by `key`, `None` when unset.
    pub fn value<T: PropertyValue, A: ByteArena>(
        &self,
        arena: &A,
        schema: &PropertySchema,
        key: FixedKey<T>,
    ) -> Result<Option<T>, PropertyError> {
        match self.offset_of(key.index(), schema.widths()) {
            Some(offset) => self.read_at(arena, offset).map(Some),
            None => Ok(None),
        }
    }

    /// Remove the property named by `key`. Returns whether it was set.
    pub fn clear<T: PropertyValue, A: ByteArena>(
        &mut self,
        arena: &A,
        schema: &PropertySchema,
        key: FixedKey<T>,
    ) -> Result<bool, PropertyError> {
        self.unset(arena, key.index(), schema.widths())
    }

    fn descriptor_offset(&self, index: u8) -> u32 {
        let below = self.var_mask & (bit(index) - 1);
        below.count_ones() * VAR_DESCRIPTOR_BYTES
    }

    fn descriptor<A: ByteArena>(&self, arena: &A, index: u8) -> Result<AllocHandle, PropertyError> {
        let mut raw = [0u8; AllocHandle::ENCODED_LEN];
        self.y
            .read(arena, self.descriptor_offset(index), &mut raw)
            .map_err(|_| PropertyError::CorruptDescriptor { index })?;
        Ok(AllocHandle::from_bytes(raw))
    }

    /// Store `bytes` as variable property `key`, replacing any old value.
    pub fn set_bytes<A: ByteArena>(
        &mut self,
        arena: &A,
        key: VarKey,
        bytes: &[u8],
    ) -> Result<(), PropertyError> {
        let index = key.index();
        let fresh = arena.allocate(bytes.len(), self.tenant)?;
        if let Err(e) = arena.write(fresh, 0, bytes) {
            arena.free(fresh);
            return Err(e.into());
        }

        let at = self.descriptor_offset(index);
        let stored = if self.is_var_set(index) {
            let old = match self.descriptor(arena, index) {
                Ok(old) => Some(old),
                Err(e) => {
                    warn!(
                        tenant = %self.tenant,
                        index,
                        error = %e,
                        "replacing unreadable descriptor; old payload not freed"
                    );
                    None
                }
            };
            self.y.write(arena, at, &fresh.to_bytes()).map(|()| old)
        } else {
            self.y
                .reserve(arena, self.tenant, self.y.used() + VAR_DESCRIPTOR_BYTES)
                .and_then(|()| self.y.open_gap(arena, at, VAR_DESCRIPTOR_BYTES))
                .and_then(|()| self.y.write(arena, at, &fresh.to_bytes()))
                .map(|()| {
                    self.var_mask |= bit(index);
                    None
                })
        };
        match stored {
            Ok(old) => {
                if let Some(old) = old {
                    arena.free(old);
                }
                Ok(())
            }
            Err(e) => {
                arena.free(fresh);
                Err(e)
            }
        }
    }

    /// Bytes of variable property `key`, `None` when unset.
    pub fn bytes<A: ByteArena>(
        &self,
        arena: &A,
        key: VarKey,
    ) -> Result<Option<Vec<u8>>, PropertyError> {
        if !self.is_var_set(key.index()) {
            return Ok(None);
        }
        let handle = self.descriptor(arena, key.index())?;
        Ok(Some(arena.to_vec(handle)?))
    }

    /// Remove variable property `key` and free its arena bytes. Returns
    /// whether it was set.
    ///
    /// The payload is freed only after its descriptor is gone, so a failed
    /// call leaves the property readable.
    pub fn unset_var<A: ByteArena>(
        &mut self,
        arena: &A,
        key: VarKey,
    ) -> Result<bool, PropertyError> {
        let index = key.index();
        if !self.is_var_set(index) {
            return Ok(false);
        }
        let handle = self.descriptor(arena, index)?;
        self.y
            .close_gap(arena, self.descriptor_offset(index), VAR_DESCRIPTOR_BYTES)?;
        self.var_mask &= !bit(index);
        arena.free(handle);
        Ok(true)
    }

    /// Grow both buffers ahead of inserting `fixed_bytes` more packed bytes
    /// and `var_count` more variable properties.
    pub fn reserve_for_bulk_insert<A: ByteArena>(
        &mut self,
        arena: &A,
        fixed_bytes: u32,
        var_count: u32,
    ) -> Result<(), PropertyError> {
        if fixed_bytes > 0 {
            self.x
                .reserve(arena, self.tenant, self.x.used().saturating_add(fixed_bytes))?;
        }
        if var_count > 0 {
            let needed = var_count.saturating_mul(VAR_DESCRIPTOR_BYTES);
            self.y
                .reserve(arena, self.tenant, self.y.used().saturating_add(needed))?;
        }
        Ok(())
    }

    /// Shrink both buffers to the smallest step holding their bytes.
    pub fn compact<A: ByteArena>(&mut self, arena: &A) -> Result<(), PropertyError> {
        self.x.shrink_to_fit(arena, self.tenant)?;
        self.y.shrink_to_fit(arena, self.tenant)
    }

    /// Free every arena allocation the set owns and clear it.
    pub fn release<A: ByteArena>(&mut self, arena: &A) {
        let handles: SmallVec<[AllocHandle; 8]> = (0..64u8)
            .filter(|&i| self.is_var_set(i))
            .filter_map(|i| self.descriptor(arena, i).ok())
            .collect();
        for handle in handles {
            arena.free(handle);
        }
        self.x.release(arena);
        self.y.release(arena);
        self.fixed_mask = 0;
        self.var_mask = 0;
    }

    /// Forget every allocation without freeing it and drop the set.
    ///
    /// For sets whose tenant was closed: the arena has already reclaimed
    /// their bytes and any free would be rejected as stale.
    pub fn abandon(mut self) {
        self.x.forget();
        self.y.forget();
        self.fixed_mask = 0;
        self.var_mask = 0;
    }

    /// Deep copy into fresh allocations for the same tenant.
    ///
    /// Fixed values and descriptors get new buffers and every variable
    /// payload is duplicated. On failure the partial copy is released.
    pub fn try_clone_in<A: ByteArena>(&self, arena: &A) -> Result<Self, PropertyError> {
        let mut copy = Self::new(self.tenant);
        match self.copy_into(arena, &mut copy) {
            Ok(()) => Ok(copy),
            Err(e) => {
                copy.release(arena);
                Err(e)
            }
        }
    }

    fn copy_into<A: ByteArena>(&self, arena: &A, copy: &mut Self) -> Result<(), PropertyError> {
        copy.x = self.x.try_clone_in(arena, self.tenant)?;
        copy.fixed_mask = self.fixed_mask;
        copy.y = self.y.try_clone_in(arena, self.tenant)?;
        // Ascending order keeps the copied prefix of `var_mask` in step
        // with the descriptors already rewritten.
        for index in (0..64u8).filter(|&i| self.is_var_set(i)) {
            let payload = arena.to_vec(self.descriptor(arena, index)?)?;
            let fresh = arena.allocate(payload.len(), self.tenant)?;
            let written = arena
                .write(fresh, 0, &payload)
                .map_err(PropertyError::from)
                .and_then(|()| {
                    copy.y
                        .write(arena, self.descriptor_offset(index), &fresh.to_bytes())
                });
            if let Err(e) = written {
                arena.free(fresh);
                return Err(e);
            }
            copy.var_mask |= bit(index);
        }
        Ok(())
    }

    /// Human-readable listing of every set property.
    pub fn debug_dump<A: ByteArena>(
        &self,
        arena: &A,
        schema: &PropertySchema,
    ) -> Result<String, PropertyError> {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} schema={:016x} tenant={} fixed={}/{}B var={}/{}B",
            schema.type_name(),
            schema.schema_hash(),
            self.tenant,
            self.x.used(),
            self.x.capacity(),
            self.y.used(),
            self.y.capacity(),
        );
        for prop in schema.fixed() {
            let Some(offset) = self.offset_of(prop.index, schema.widths()) else {
                continue;
            };
            let value = self.format_value(arena, prop.ty, offset)?;
            let _ = writeln!(
                out,
                "  [{}] {}: {} @{} = {}",
                prop.index, prop.name, prop.ty, offset, value
            );
        }
        for prop in schema.var() {
            if !self.is_var_set(prop.index) {
                continue;
            }
            let handle = self.descriptor(arena, prop.index)?;
            let _ = writeln!(
                out,
                "  <{}> {}: {} bytes in {}",
                prop.index,
                prop.name,
                handle.len(),
                handle.region()
            );
        }
        Ok(out)
    }

    fn format_value<A: ByteArena>(
        &self,
        arena: &A,
        ty: PropertyType,
        offset: u32,
    ) -> Result<String, PropertyError> {
        let s = match ty {
            PropertyType::Bool => self.read_at::<bool, _>(arena, offset)?.to_string(),
            PropertyType::U8 => self.read_at::<u8, _>(arena, offset)?.to_string(),
            PropertyType::I8 => self.read_at::<i8, _>(arena, offset)?.to_string(),
            PropertyType::U16 => self.read_at::<u16, _>(arena, offset)?.to_string(),
            PropertyType::I16 => self.read_at::<i16, _>(arena, offset)?.to_string(),
            PropertyType::Bf16 => self.read_at::<Bf16, _>(arena, offset)?.to_f32().to_string(),
            PropertyType::U32 => self.read_at::<u32, _>(arena, offset)?.to_string(),
            PropertyType::I32 => self.read_at::<i32, _>(arena, offset)?.to_string(),
            PropertyType::F32 => self.read_at::<f32, _>(arena, offset)?.to_string(),
            PropertyType::U64 => self.read_at::<u64, _>(arena, offset)?.to_string(),
            PropertyType::I64 => self.read_at::<i64, _>(arena, offset)?.to_string(),
            PropertyType::F64 => self.read_at::<f64, _>(arena, offset)?.to_string(),
            PropertyType::Byte16 => format!("{:?}", self.read_at::<Byte16, _>(arena, offset)?),
            PropertyType::Byte32 => format!("{:?}", self.read_at::<Byte32, _>(arena, offset)?),
        };
        Ok(s)
    }
}

impl Drop for OptionalPropertySet {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert!(
                self.is_empty() && self.x.handle().is_none() && self.y.handle().is_none(),
                "property set dropped while holding arena allocations"
            );
        }
    }
}
