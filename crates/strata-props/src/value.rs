//! Property value types and their packed byte encodings.
//!
//! Values are stored little-endian and unaligned inside packed buffers.
//! Encoding and decoding always go through byte copies so no aligned load
//! is ever issued against buffer memory.

use std::fmt;

/// The fixed-width types a property can have.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PropertyType {
    /// `bool`, one byte (0 or 1).
    Bool,
    /// `u8`.
    U8,
    /// `i8`.
    I8,
    /// `u16`.
    U16,
    /// `i16`.
    I16,
    /// Brain float, see [`Bf16`].
    Bf16,
    /// `u32`.
    U32,
    /// `i32`.
    I32,
    /// `f32`.
    F32,
    /// `u64`.
    U64,
    /// `i64`.
    I64,
    /// `f64`.
    F64,
    /// 16-byte small string, see [`Byte16`].
    Byte16,
    /// 32-byte small string, see [`Byte32`].
    Byte32,
}

impl PropertyType {
    /// Stored width in bytes.
    pub const fn width(self) -> u8 {
        match self {
            Self::Bool | Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 | Self::Bf16 => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
            Self::U64 | Self::I64 | Self::F64 => 8,
            Self::Byte16 => 16,
            Self::Byte32 => 32,
        }
    }

    /// Stable one-byte tag, used when hashing schemas.
    pub const fn tag(self) -> u8 {
        match self {
            Self::Bool => 0,
            Self::U8 => 1,
            Self::I8 => 2,
            Self::U16 => 3,
            Self::I16 => 4,
            Self::Bf16 => 5,
            Self::U32 => 6,
            Self::I32 => 7,
            Self::F32 => 8,
            Self::U64 => 9,
            Self::I64 => 10,
            Self::F64 => 11,
            Self::Byte16 => 12,
            Self::Byte32 => 13,
        }
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bool => "bool",
            Self::U8 => "u8",
            Self::I8 => "i8",
            Self::U16 => "u16",
            Self::I16 => "i16",
            Self::Bf16 => "bf16",
            Self::U32 => "u32",
            Self::I32 => "i32",
            Self::F32 => "f32",
            Self::U64 => "u64",
            Self::I64 => "i64",
            Self::F64 => "f64",
            Self::Byte16 => "byte16",
            Self::Byte32 => "byte32",
        };
        f.write_str(name)
    }
}

/// A Rust type that can be stored as a property.
///
/// `write_le` receives and `read_le` is given exactly
/// `Self::TYPE.width()` bytes.
pub trait PropertyValue: Copy + Default + fmt::Debug + 'static {
    /// The stored type.
    const TYPE: PropertyType;

    /// Encode into `out`.
    fn write_le(&self, out: &mut [u8]);

    /// Decode from `bytes`.
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_numeric {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl PropertyValue for $ty {
                const TYPE: PropertyType = PropertyType::$variant;

                fn write_le(&self, out: &mut [u8]) {
                    out.copy_from_slice(&self.to_le_bytes());
                }

                fn read_le(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    <$ty>::from_le_bytes(raw)
                }
            }
        )*
    };
}

impl_numeric!(
    u8 => U8,
    i8 => I8,
    u16 => U16,
    i16 => I16,
    u32 => U32,
    i32 => I32,
    f32 => F32,
    u64 => U64,
    i64 => I64,
    f64 => F64,
);

impl PropertyValue for bool {
    const TYPE: PropertyType = PropertyType::Bool;

    fn write_le(&self, out: &mut [u8]) {
        out[0] = u8::from(*self);
    }

    fn read_le(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

/// Brain floating point: the upper 16 bits of an IEEE-754 `f32`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Bf16(pub u16);

impl Bf16 {
    /// Convert from `f32`, rounding to nearest even. NaN stays NaN.
    pub fn from_f32(value: f32) -> Self {
        let bits = value.to_bits();
        if value.is_nan() {
            return Self(((bits >> 16) as u16) | 0x0040);
        }
        let round = 0x7FFF + ((bits >> 16) & 1);
        Self((bits.wrapping_add(round) >> 16) as u16)
    }

    /// Widen to `f32` (exact).
    pub fn to_f32(self) -> f32 {
        f32::from_bits((self.0 as u32) << 16)
    }
}

impl From<f32> for Bf16 {
    fn from(value: f32) -> Self {
        Self::from_f32(value)
    }
}

impl From<Bf16> for f32 {
    fn from(value: Bf16) -> Self {
        value.to_f32()
    }
}

impl PropertyValue for Bf16 {
    const TYPE: PropertyType = PropertyType::Bf16;

    fn write_le(&self, out: &mut [u8]) {
        out.copy_from_slice(&self.0.to_le_bytes());
    }

    fn read_le(bytes: &[u8]) -> Self {
        Self(u16::from_le_bytes([bytes[0], bytes[1]]))
    }
}

macro_rules! small_string {
    ($name:ident, $len:literal, $variant:ident) => {
        #[doc = concat!(
            "Fixed ", stringify!($len),
            "-byte UTF-8 string, NUL-padded. Holds up to ",
            stringify!($len), " bytes."
        )]
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            /// Capacity in bytes.
            pub const CAPACITY: usize = $len;

            /// Pack `s`, or `None` if it is longer than the capacity or
            /// contains a NUL byte.
            pub fn new(s: &str) -> Option<Self> {
                if s.len() > $len || s.as_bytes().contains(&0) {
                    return None;
                }
                let mut raw = [0u8; $len];
                raw[..s.len()].copy_from_slice(s.as_bytes());
                Some(Self(raw))
            }

            /// The text up to the first NUL, or `None` if it is not UTF-8.
            pub fn as_str(&self) -> Option<&str> {
                let end = self.0.iter().position(|&b| b == 0).unwrap_or($len);
                std::str::from_utf8(&self.0[..end]).ok()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self([0u8; $len])
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.as_str() {
                    Some(s) => write!(f, "{}({s:?})", stringify!($name)),
                    None => write!(f, "{}({:?})", stringify!($name), &self.0[..]),
                }
            }
        }

        impl PropertyValue for $name {
            const TYPE: PropertyType = PropertyType::$variant;

            fn write_le(&self, out: &mut [u8]) {
                out.copy_from_slice(&self.0);
            }

            fn read_le(bytes: &[u8]) -> Self {
                let mut raw = [0u8; $len];
                raw.copy_from_slice(bytes);
                Self(raw)
            }
        }
    };
}

small_string!(Byte16, 16, Byte16);
small_string!(Byte32, 32, Byte32);
