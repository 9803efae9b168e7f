//! Low-level byte order and bounds-checked reading/writing utilities.
//!
//! Everything the compiler reads from raw buffers (method-body headers, IL operands, switch
//! tables) and everything it writes into data blobs (method-table records, relocation
//! placeholders) goes through the [`CilIO`] trait defined here, so that every access is
//! bounds-checked and explicitly little-endian.
//!
//! # Key Components
//!
//! - [`CilIO`] - Trait defining endian-aware conversions for primitive types
//! - [`read_le`] / [`read_le_at`] - Little-endian reads with optional auto-advance
//! - [`write_le_at`] - Little-endian writes with auto-advance
//! - [`parser::Parser`] - Cursor-based reader used by the IL decoder

pub mod parser;

use crate::{Error::OutOfBounds, Result};

/// Trait for implementing type-specific safe binary reading and writing operations.
///
/// Implemented for the unsigned and signed integer types and both floating point types, which
/// covers every operand width that appears in an IL stream.
pub trait CilIO: Sized {
    /// Associated type representing the byte array type for this numeric type.
    type Bytes: Sized + for<'a> TryFrom<&'a [u8]>;

    /// Read T from a byte buffer in little-endian
    fn from_le_bytes(bytes: Self::Bytes) -> Self;

    /// Write T to a byte buffer in little-endian
    fn to_le_bytes(self) -> Self::Bytes;
}

macro_rules! impl_cilio {
    ($($ty:ty => $len:expr),* $(,)?) => {
        $(
            impl CilIO for $ty {
                type Bytes = [u8; $len];

                fn from_le_bytes(bytes: Self::Bytes) -> Self {
                    <$ty>::from_le_bytes(bytes)
                }

                fn to_le_bytes(self) -> Self::Bytes {
                    <$ty>::to_le_bytes(self)
                }
            }
        )*
    };
}

impl_cilio! {
    u8 => 1,
    i8 => 1,
    u16 => 2,
    i16 => 2,
    u32 => 4,
    i32 => 4,
    u64 => 8,
    i64 => 8,
    f32 => 4,
    f64 => 8,
}

/// Safely reads a value of type `T` in little-endian byte order from the start of `data`.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes.
pub fn read_le<T: CilIO>(data: &[u8]) -> Result<T> {
    let mut offset = 0_usize;
    read_le_at(data, &mut offset)
}

/// Safely reads a value of type `T` in little-endian byte order at `offset`, advancing it.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes.
pub fn read_le_at<T: CilIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let type_len = std::mem::size_of::<T>();
    let end = offset.checked_add(type_len).ok_or(OutOfBounds)?;
    if end > data.len() {
        return Err(OutOfBounds);
    }

    let Ok(read) = data[*offset..end].try_into() else {
        return Err(OutOfBounds);
    };

    *offset = end;

    Ok(T::from_le_bytes(read))
}

/// Safely writes a value of type `T` in little-endian byte order at `offset`, advancing it.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the buffer is too small.
pub fn write_le_at<T: CilIO>(data: &mut [u8], offset: &mut usize, value: T) -> Result<()>
where
    T::Bytes: AsRef<[u8]>,
{
    let bytes = value.to_le_bytes();
    let bytes = bytes.as_ref();
    let end = offset.checked_add(bytes.len()).ok_or(OutOfBounds)?;
    if end > data.len() {
        return Err(OutOfBounds);
    }

    data[*offset..end].copy_from_slice(bytes);
    *offset = end;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_values_advance() {
        let data = [0x01, 0x00, 0xFF, 0xFF, 0xFF, 0x7F];
        let mut offset = 0;
        assert_eq!(read_le_at::<u16>(&data, &mut offset).unwrap(), 1);
        assert_eq!(read_le_at::<i32>(&data, &mut offset).unwrap(), i32::MAX);
        assert_eq!(offset, 6);
    }

    #[test]
    fn read_past_end_fails() {
        let data = [0x01, 0x02, 0x03];
        let mut offset = 1;
        assert!(matches!(read_le_at::<u32>(&data, &mut offset), Err(OutOfBounds)));
        assert_eq!(offset, 1);
    }

    #[test]
    fn write_then_read() {
        let mut data = [0u8; 12];
        let mut offset = 0;
        write_le_at(&mut data, &mut offset, 0x1234_u16).unwrap();
        write_le_at(&mut data, &mut offset, -2_i64).unwrap();
        assert_eq!(offset, 10);
        assert_eq!(read_le::<u16>(&data).unwrap(), 0x1234);
        assert_eq!(&data[2..4], &[0xFE, 0xFF]);
        assert!(write_le_at(&mut data, &mut offset, 0_u32).is_err());
    }
}
