//! `iovirt-binparse` --- bounds-checked access to packed firmware records.
//!
//! Firmware tables and the topology arena are both plain byte buffers
//! addressed by offsets. This crate provides the two traits used to move
//! fixed-layout records in and out of such buffers:
//!
//! - [`FromBytes`]: read a `Copy` record at a byte offset, returning `None`
//!   instead of reading past the end of the buffer.
//! - [`AsBytes`]: view a record as raw bytes and write it at a byte offset.
//!
//! Reads and writes are unaligned and use native byte order, which is
//! little-endian on every platform that publishes ACPI tables.

#![cfg_attr(not(test), no_std)]

use core::mem::size_of;

/// Types that can be safely created from any byte pattern of the right size.
///
/// # Safety
///
/// Every bit pattern of `size_of::<Self>()` bytes must be a valid value of
/// `Self`. This holds for integers, arrays of `FromBytes` types, and
/// `#[repr(C, packed)]` structs composed only of such fields.
pub unsafe trait FromBytes: Copy {
    /// Read a value starting at byte `offset` of `data`.
    ///
    /// Returns `None` if `offset + size_of::<Self>()` overflows or exceeds
    /// `data.len()`.
    #[must_use]
    fn read_at(data: &[u8], offset: usize) -> Option<Self> {
        let end = offset.checked_add(size_of::<Self>())?;
        let bytes = data.get(offset..end)?;
        // SAFETY: `bytes` covers exactly `size_of::<Self>()` readable bytes, the
        // read is unaligned, and the trait contract makes any pattern valid.
        Some(unsafe { core::ptr::read_unaligned(bytes.as_ptr().cast::<Self>()) })
    }

    /// Read a value from the start of `data`.
    #[must_use]
    fn read_from(data: &[u8]) -> Option<Self> {
        Self::read_at(data, 0)
    }
}

/// Types whose in-memory representation has no padding bytes.
///
/// # Safety
///
/// `Self` must not contain padding or uninitialised bytes, so that viewing a
/// value as `size_of::<Self>()` bytes is always defined.
pub unsafe trait AsBytes: Copy {
    /// Returns the raw bytes of `self`.
    #[must_use]
    fn as_bytes(&self) -> &[u8] {
        // SAFETY: `self` is a valid reference to `size_of::<Self>()` initialised
        // bytes; the trait contract rules out padding.
        unsafe {
            core::slice::from_raw_parts(core::ptr::from_ref(self).cast::<u8>(), size_of::<Self>())
        }
    }

    /// Write `self` at byte `offset` of `data`.
    ///
    /// Returns `None`, leaving `data` untouched, if the record does not fit.
    fn write_at(&self, data: &mut [u8], offset: usize) -> Option<()> {
        let end = offset.checked_add(size_of::<Self>())?;
        data.get_mut(offset..end)?.copy_from_slice(self.as_bytes());
        Some(())
    }
}

macro_rules! impl_integers {
    ($($ty:ty),* $(,)?) => {
        $(
            // SAFETY: integers accept every bit pattern and have no padding.
            unsafe impl FromBytes for $ty {}
            // SAFETY: as above.
            unsafe impl AsBytes for $ty {}
        )*
    };
}

impl_integers!(u8, u16, u32, u64, i8, i16, i32, i64);

// SAFETY: an array of `FromBytes` elements is valid for any byte pattern.
unsafe impl<T: FromBytes, const N: usize> FromBytes for [T; N] {}

// SAFETY: array elements are laid out back to back; element size is a
// multiple of its alignment, so no padding is introduced between them.
unsafe impl<T: AsBytes, const N: usize> AsBytes for [T; N] {}

/// Implements [`FromBytes`] and [`AsBytes`] for `#[repr(C, packed)]` records.
///
/// Each entry states the expected size in bytes, which is checked at compile
/// time so a layout change cannot silently shift every offset after it.
///
/// ```ignore
/// packed_records! {
///     unsafe impl IdMapping = 20;
/// }
/// ```
///
/// The `unsafe` token marks the obligation on the invoker: the type must be
/// `#[repr(C, packed)]` and every field must itself be `FromBytes + AsBytes`.
#[macro_export]
macro_rules! packed_records {
    ($(unsafe impl $ty:ty = $size:expr;)*) => {
        $(
            const _: () = assert!(::core::mem::size_of::<$ty>() == $size);
            // SAFETY: upheld by the invoker, see the macro documentation.
            unsafe impl $crate::FromBytes for $ty {}
            // SAFETY: packed records have no padding.
            unsafe impl $crate::AsBytes for $ty {}
        )*
    };
}
