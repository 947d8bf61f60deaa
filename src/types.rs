//! Core data types for canvis-rs
//!
//! This module contains the fundamental data structures used throughout
//! the library for addressing remote objects and converting their raw
//! little-endian byte buffers to and from numbers.
//!
//! # Main Types
//!
//! - [`ObjectAddress`] - Identifies one parameter on a remote node
//!   (node id, object index, sub-index)
//! - [`CoValueType`] - Enum of supported value encodings (i32, u16, iq15, ...)
//! - [`Direction`] - Whether a transfer reads from or writes to the device
//! - [`Scalar`] - Trait for exact-width little-endian scalar access
//!
//! # Value Encodings
//!
//! The encoding set is closed and mirrors what the remote firmware speaks:
//!
//! - Signed/unsigned integers: i8, i16, i32, u8, u16, u32
//! - Fixed point: iq24, iq15, iq7 (an i32 scaled by 2^24, 2^15, 2^7)
//! - Opaque: str, mem (no numeric codec; width comes from the transfer)
//!
//! # Fixed Point
//!
//! IQn values decode by dividing the stored i32 by the scale and encode by
//! multiplying and truncating toward zero. Truncating on both paths keeps
//! `decode(encode(x))` stable within one least-significant bit of the scale.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CanVisError, Result};

/// Lowest valid node id on the bus
pub const NODE_ID_MIN: u8 = 1;
/// Highest valid node id on the bus
pub const NODE_ID_MAX: u8 = 127;

const IQ24_SCALE: f64 = 16_777_216.0;
const IQ15_SCALE: f64 = 32_768.0;
const IQ7_SCALE: f64 = 128.0;

/// Address of one object on a remote node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectAddress {
    /// Node id (1..=127)
    pub node_id: u8,
    /// 16-bit object index
    pub index: u16,
    /// 8-bit sub-index
    pub sub_index: u8,
}

impl ObjectAddress {
    /// Create a new address, validating the node id range
    pub fn new(node_id: u8, index: u16, sub_index: u8) -> Result<Self> {
        if !(NODE_ID_MIN..=NODE_ID_MAX).contains(&node_id) {
            return Err(CanVisError::Validation(format!(
                "node id {} out of range {}..={}",
                node_id, NODE_ID_MIN, NODE_ID_MAX
            )));
        }
        Ok(Self {
            node_id,
            index,
            sub_index,
        })
    }
}

impl fmt::Display for ObjectAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:0x{:04X}.{:02X}",
            self.node_id, self.index, self.sub_index
        )
    }
}

/// Direction of an SDO transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Direction {
    /// Read from the device
    #[default]
    Upload,
    /// Write to the device
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upload => write!(f, "upload"),
            Direction::Download => write!(f, "download"),
        }
    }
}

/// Encoding of a remote object's value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CoValueType {
    /// 32-bit signed integer
    #[default]
    I32,
    /// 16-bit signed integer
    I16,
    /// 8-bit signed integer
    I8,
    /// 32-bit unsigned integer
    U32,
    /// 16-bit unsigned integer
    U16,
    /// 8-bit unsigned integer
    U8,
    /// Fixed point, i32 scaled by 2^24
    Iq24,
    /// Fixed point, i32 scaled by 2^15
    Iq15,
    /// Fixed point, i32 scaled by 2^7
    Iq7,
    /// Opaque string, width declared by the transfer
    Str,
    /// Opaque memory blob, width declared by the transfer
    Mem,
}

impl CoValueType {
    /// Byte width of this encoding, `None` for the opaque encodings
    pub fn size_bytes(&self) -> Option<usize> {
        match self {
            CoValueType::I32 | CoValueType::U32 => Some(4),
            CoValueType::I16 | CoValueType::U16 => Some(2),
            CoValueType::I8 | CoValueType::U8 => Some(1),
            CoValueType::Iq24 | CoValueType::Iq15 | CoValueType::Iq7 => Some(4),
            CoValueType::Str | CoValueType::Mem => None,
        }
    }

    /// Whether this encoding has a numeric codec
    pub fn is_numeric(&self) -> bool {
        !matches!(self, CoValueType::Str | CoValueType::Mem)
    }

    /// Decode a value from the leading bytes of a little-endian buffer
    pub fn decode(&self, bytes: &[u8]) -> Result<f64> {
        match self {
            CoValueType::I32 => Ok(read_prefix::<i32>(bytes)? as f64),
            CoValueType::I16 => Ok(read_prefix::<i16>(bytes)? as f64),
            CoValueType::I8 => Ok(read_prefix::<i8>(bytes)? as f64),
            CoValueType::U32 => Ok(read_prefix::<u32>(bytes)? as f64),
            CoValueType::U16 => Ok(read_prefix::<u16>(bytes)? as f64),
            CoValueType::U8 => Ok(read_prefix::<u8>(bytes)? as f64),
            CoValueType::Iq24 => Ok(read_prefix::<i32>(bytes)? as f64 / IQ24_SCALE),
            CoValueType::Iq15 => Ok(read_prefix::<i32>(bytes)? as f64 / IQ15_SCALE),
            CoValueType::Iq7 => Ok(read_prefix::<i32>(bytes)? as f64 / IQ7_SCALE),
            CoValueType::Str | CoValueType::Mem => Err(CanVisError::UnsupportedType(format!(
                "{self} values have no numeric codec"
            ))),
        }
    }

    /// Encode a value into the leading bytes of a little-endian buffer
    ///
    /// Fixed-point encodings multiply by the scale and truncate toward zero,
    /// matching the truncation applied on decode.
    pub fn encode(&self, value: f64, bytes: &mut [u8]) -> Result<()> {
        match self {
            CoValueType::I32 => write_prefix(bytes, value as i32),
            CoValueType::I16 => write_prefix(bytes, value as i16),
            CoValueType::I8 => write_prefix(bytes, value as i8),
            CoValueType::U32 => write_prefix(bytes, value as u32),
            CoValueType::U16 => write_prefix(bytes, value as u16),
            CoValueType::U8 => write_prefix(bytes, value as u8),
            CoValueType::Iq24 => write_prefix(bytes, (value * IQ24_SCALE) as i32),
            CoValueType::Iq15 => write_prefix(bytes, (value * IQ15_SCALE) as i32),
            CoValueType::Iq7 => write_prefix(bytes, (value * IQ7_SCALE) as i32),
            CoValueType::Str | CoValueType::Mem => Err(CanVisError::UnsupportedType(format!(
                "{self} values have no numeric codec"
            ))),
        }
    }

    /// All encodings with their display names, for configuration surfaces
    pub fn type_names() -> &'static [(&'static str, CoValueType)] {
        &[
            ("i32", CoValueType::I32),
            ("i16", CoValueType::I16),
            ("i8", CoValueType::I8),
            ("u32", CoValueType::U32),
            ("u16", CoValueType::U16),
            ("u8", CoValueType::U8),
            ("iq24", CoValueType::Iq24),
            ("iq15", CoValueType::Iq15),
            ("iq7", CoValueType::Iq7),
            ("str", CoValueType::Str),
            ("mem", CoValueType::Mem),
        ]
    }
}

impl fmt::Display for CoValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoValueType::I32 => write!(f, "i32"),
            CoValueType::I16 => write!(f, "i16"),
            CoValueType::I8 => write!(f, "i8"),
            CoValueType::U32 => write!(f, "u32"),
            CoValueType::U16 => write!(f, "u16"),
            CoValueType::U8 => write!(f, "u8"),
            CoValueType::Iq24 => write!(f, "iq24"),
            CoValueType::Iq15 => write!(f, "iq15"),
            CoValueType::Iq7 => write!(f, "iq7"),
            CoValueType::Str => write!(f, "str"),
            CoValueType::Mem => write!(f, "mem"),
        }
    }
}

/// Fixed-width little-endian scalar, readable from and writable to raw buffers
pub trait Scalar: Sized + Copy {
    /// Width of the scalar in bytes
    const WIDTH: usize;

    /// Read from the leading bytes of a buffer, `None` if too short
    fn from_le_slice(bytes: &[u8]) -> Option<Self>;

    /// Write into the leading bytes of a buffer, `false` if too short
    fn write_le(self, out: &mut [u8]) -> bool;
}

macro_rules! impl_scalar {
    ($($t:ty),* $(,)?) => {$(
        impl Scalar for $t {
            const WIDTH: usize = std::mem::size_of::<$t>();

            fn from_le_slice(bytes: &[u8]) -> Option<Self> {
                let bytes = bytes.get(..Self::WIDTH)?;
                Some(<$t>::from_le_bytes(bytes.try_into().ok()?))
            }

            fn write_le(self, out: &mut [u8]) -> bool {
                match out.get_mut(..Self::WIDTH) {
                    Some(dst) => {
                        dst.copy_from_slice(&self.to_le_bytes());
                        true
                    }
                    None => false,
                }
            }
        }
    )*};
}

impl_scalar!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

/// Read a scalar whose width exactly matches the buffer
///
/// This is the codec path for opaque typed transfers where no semantic
/// encoding applies: the request succeeds only if the native width equals
/// the declared value width.
pub fn scalar_from_bytes<T: Scalar>(bytes: &[u8]) -> Result<T> {
    if bytes.len() != T::WIDTH {
        return Err(CanVisError::UnsupportedType(format!(
            "requested a {} byte scalar from a {} byte value",
            T::WIDTH,
            bytes.len()
        )));
    }
    T::from_le_slice(bytes).ok_or_else(|| {
        CanVisError::Validation(format!("buffer too short for {} byte scalar", T::WIDTH))
    })
}

/// Write a scalar whose width exactly matches the buffer
pub fn scalar_to_bytes<T: Scalar>(value: T, bytes: &mut [u8]) -> Result<()> {
    if bytes.len() != T::WIDTH {
        return Err(CanVisError::UnsupportedType(format!(
            "cannot store a {} byte scalar into a {} byte value",
            T::WIDTH,
            bytes.len()
        )));
    }
    if value.write_le(bytes) {
        Ok(())
    } else {
        Err(CanVisError::Validation(format!(
            "buffer too short for {} byte scalar",
            T::WIDTH
        )))
    }
}

fn read_prefix<T: Scalar>(bytes: &[u8]) -> Result<T> {
    T::from_le_slice(bytes).ok_or_else(|| {
        CanVisError::Validation(format!(
            "buffer of {} bytes too short for a {} byte value",
            bytes.len(),
            T::WIDTH
        ))
    })
}

fn write_prefix<T: Scalar>(bytes: &mut [u8], value: T) -> Result<()> {
    if value.write_le(bytes) {
        Ok(())
    } else {
        Err(CanVisError::Validation(format!(
            "buffer of {} bytes too short for a {} byte value",
            bytes.len(),
            T::WIDTH
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_address_validation() {
        assert!(ObjectAddress::new(1, 0x2000, 0x01).is_ok());
        assert!(ObjectAddress::new(127, 0xFFFF, 0xFF).is_ok());
        assert!(ObjectAddress::new(0, 0x2000, 0x01).is_err());
        assert!(ObjectAddress::new(128, 0x2000, 0x01).is_err());
    }

    #[test]
    fn test_object_address_display() {
        let addr = ObjectAddress::new(5, 0x2002, 0x10).unwrap();
        assert_eq!(addr.to_string(), "5:0x2002.10");
    }

    #[test]
    fn test_type_sizes() {
        assert_eq!(CoValueType::I32.size_bytes(), Some(4));
        assert_eq!(CoValueType::I16.size_bytes(), Some(2));
        assert_eq!(CoValueType::I8.size_bytes(), Some(1));
        assert_eq!(CoValueType::U32.size_bytes(), Some(4));
        assert_eq!(CoValueType::U16.size_bytes(), Some(2));
        assert_eq!(CoValueType::U8.size_bytes(), Some(1));
        assert_eq!(CoValueType::Iq24.size_bytes(), Some(4));
        assert_eq!(CoValueType::Iq15.size_bytes(), Some(4));
        assert_eq!(CoValueType::Iq7.size_bytes(), Some(4));
        assert_eq!(CoValueType::Str.size_bytes(), None);
        assert_eq!(CoValueType::Mem.size_bytes(), None);
    }

    #[test]
    fn test_integer_decode() {
        let bytes = 1000i32.to_le_bytes();
        assert_eq!(CoValueType::I32.decode(&bytes).unwrap(), 1000.0);

        let bytes = (-2i16).to_le_bytes();
        assert_eq!(CoValueType::I16.decode(&bytes).unwrap(), -2.0);

        let bytes = [0xFFu8];
        assert_eq!(CoValueType::U8.decode(&bytes).unwrap(), 255.0);
        assert_eq!(CoValueType::I8.decode(&bytes).unwrap(), -1.0);
    }

    #[test]
    fn test_iq15_half() {
        // Stored 16384 at scale 2^15 is exactly 0.5
        let bytes = 16_384i32.to_le_bytes();
        assert_eq!(CoValueType::Iq15.decode(&bytes).unwrap(), 0.5);

        let mut out = [0u8; 4];
        CoValueType::Iq15.encode(0.5, &mut out).unwrap();
        assert_eq!(i32::from_le_bytes(out), 16_384);
    }

    #[test]
    fn test_iq_negative() {
        let bytes = (-(1 << 24) as i32).to_le_bytes();
        assert_eq!(CoValueType::Iq24.decode(&bytes).unwrap(), -1.0);

        let mut out = [0u8; 4];
        CoValueType::Iq7.encode(-2.5, &mut out).unwrap();
        assert_eq!(i32::from_le_bytes(out), -320);
    }

    #[test]
    fn test_opaque_types_have_no_codec() {
        let bytes = [0u8; 4];
        assert!(CoValueType::Str.decode(&bytes).is_err());
        assert!(CoValueType::Mem.decode(&bytes).is_err());

        let mut out = [0u8; 4];
        assert!(CoValueType::Str.encode(1.0, &mut out).is_err());
        assert!(CoValueType::Mem.encode(1.0, &mut out).is_err());
    }

    #[test]
    fn test_short_buffer_rejected() {
        let bytes = [0u8; 2];
        assert!(CoValueType::I32.decode(&bytes).is_err());

        let mut out = [0u8; 2];
        assert!(CoValueType::Iq15.encode(0.5, &mut out).is_err());
    }

    #[test]
    fn test_scalar_exact_width() {
        let bytes = 0xDEAD_BEEFu32.to_le_bytes();
        assert_eq!(scalar_from_bytes::<u32>(&bytes).unwrap(), 0xDEAD_BEEF);
        // Width mismatch is rejected in both directions
        assert!(scalar_from_bytes::<u16>(&bytes).is_err());
        assert!(scalar_from_bytes::<u64>(&bytes).is_err());

        let mut out = [0u8; 2];
        scalar_to_bytes(0x1234u16, &mut out).unwrap();
        assert_eq!(out, [0x34, 0x12]);
        assert!(scalar_to_bytes(1u32, &mut out).is_err());
    }

    #[test]
    fn test_type_names_cover_all_types() {
        let names = CoValueType::type_names();
        assert_eq!(names.len(), 11);
        let mut seen = std::collections::HashSet::new();
        for (name, ty) in names {
            assert!(!name.is_empty());
            assert_eq!(&ty.to_string(), name);
            assert!(seen.insert(*ty), "{ty} listed twice");
        }
    }

    // Property-based tests using proptest
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_integer_round_trip(value in -2_147_483_648i64..=2_147_483_647) {
            let mut buf = [0u8; 4];
            CoValueType::I32.encode(value as f64, &mut buf).unwrap();
            prop_assert_eq!(CoValueType::I32.decode(&buf).unwrap(), value as f64);
        }

        #[test]
        fn prop_u16_round_trip(value in 0u32..=65_535) {
            let mut buf = [0u8; 2];
            CoValueType::U16.encode(value as f64, &mut buf).unwrap();
            prop_assert_eq!(CoValueType::U16.decode(&buf).unwrap(), value as f64);
        }

        #[test]
        fn prop_iq15_round_trip_within_one_lsb(value in -60_000.0f64..60_000.0) {
            let mut buf = [0u8; 4];
            CoValueType::Iq15.encode(value, &mut buf).unwrap();
            let decoded = CoValueType::Iq15.decode(&buf).unwrap();
            prop_assert!((decoded - value).abs() <= 1.0 / 32_768.0);
        }

        #[test]
        fn prop_iq7_round_trip_within_one_lsb(value in -10_000_000.0f64..10_000_000.0) {
            let mut buf = [0u8; 4];
            CoValueType::Iq7.encode(value, &mut buf).unwrap();
            let decoded = CoValueType::Iq7.decode(&buf).unwrap();
            prop_assert!((decoded - value).abs() <= 1.0 / 128.0);
        }

        #[test]
        fn prop_stored_iq_decode_encode_is_exact(raw in any::<i32>()) {
            // Values that originate from the device always round-trip exactly
            let bytes = raw.to_le_bytes();
            let decoded = CoValueType::Iq15.decode(&bytes).unwrap();
            let mut out = [0u8; 4];
            CoValueType::Iq15.encode(decoded, &mut out).unwrap();
            prop_assert_eq!(i32::from_le_bytes(out), raw);
        }
    }
}
