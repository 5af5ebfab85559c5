//! Cursor-based structured access to a memory region.
//!
//! Values are stored little-endian with no padding. Every access is bounds
//! checked against the region; nothing here synchronizes, so concurrent
//! access is governed by whichever structure owns the region.

use crate::block::SharedMemoryBlock;
use crate::error::{ShmError, ShmResult};
use std::marker::PhantomData;
use uuid::Uuid;

/// Largest encoded size of a single [`FixedField`] value.
pub const MAX_FIXED_SIZE: usize = 64;

/// A value with a fixed little-endian encoding.
pub trait FixedField: Sized {
    /// Encoded size in bytes
    const SIZE: usize;

    /// Write `Self::SIZE` bytes into `out`.
    fn encode(&self, out: &mut [u8]);

    /// Read from the first `Self::SIZE` bytes of `bytes`.
    fn decode(bytes: &[u8]) -> Self;
}

macro_rules! impl_fixed_numeric {
    ($($ty:ty),* $(,)?) => {
        $(
            impl FixedField for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn encode(&self, out: &mut [u8]) {
                    out[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
                }

                fn decode(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[..Self::SIZE]);
                    <$ty>::from_le_bytes(raw)
                }
            }
        )*
    };
}

impl_fixed_numeric!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

impl FixedField for bool {
    const SIZE: usize = 1;

    fn encode(&self, out: &mut [u8]) {
        out[0] = u8::from(*self);
    }

    fn decode(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

impl FixedField for Uuid {
    const SIZE: usize = 16;

    fn encode(&self, out: &mut [u8]) {
        out[..16].copy_from_slice(self.as_bytes());
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut raw = [0u8; 16];
        raw.copy_from_slice(&bytes[..16]);
        Uuid::from_bytes(raw)
    }
}

macro_rules! impl_fixed_tuple {
    ($($ty:ident $var:ident),+) => {
        impl<$($ty: FixedField),+> FixedField for ($($ty,)+) {
            const SIZE: usize = 0 $(+ $ty::SIZE)+;

            fn encode(&self, out: &mut [u8]) {
                let ($($var,)+) = self;
                let mut at = 0;
                $(
                    $var.encode(&mut out[at..]);
                    at += $ty::SIZE;
                )+
                let _ = at;
            }

            fn decode(bytes: &[u8]) -> Self {
                let mut at = 0;
                $(
                    let $var = $ty::decode(&bytes[at..]);
                    at += $ty::SIZE;
                )+
                let _ = at;
                ($($var,)+)
            }
        }
    };
}

impl_fixed_tuple!(A a, B b);
impl_fixed_tuple!(A a, B b, C c);
impl_fixed_tuple!(A a, B b, C c, D d);

/// Read/write cursor over a byte region.
///
/// A view borrows its backing block or buffer, so it can never outlive the
/// memory it points into.
pub struct StructuredMemoryView<'a> {
    base: *mut u8,
    len: usize,
    cursor: usize,
    _marker: PhantomData<&'a [u8]>,
}

impl<'a> StructuredMemoryView<'a> {
    /// View over an entire shared block
    pub fn over_block(block: &'a SharedMemoryBlock) -> Self {
        Self {
            base: block.as_ptr(),
            len: block.size(),
            cursor: 0,
            _marker: PhantomData,
        }
    }

    /// View over `len` bytes of a shared block starting at `offset`
    pub fn over_region(block: &'a SharedMemoryBlock, offset: usize, len: usize) -> ShmResult<Self> {
        check_range(offset, len, block.size())?;
        Ok(Self {
            base: unsafe { block.as_ptr().add(offset) },
            len,
            cursor: 0,
            _marker: PhantomData,
        })
    }

    /// View over a private buffer
    pub fn over_slice(buf: &'a mut [u8]) -> Self {
        Self {
            base: buf.as_mut_ptr(),
            len: buf.len(),
            cursor: 0,
            _marker: PhantomData,
        }
    }

    /// Region size in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for a zero-length region
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current cursor offset
    pub fn position(&self) -> usize {
        self.cursor
    }

    /// Bytes between the cursor and the end of the region
    pub fn remaining(&self) -> usize {
        self.len - self.cursor
    }

    /// Move the cursor to `offset`; `offset == len()` is allowed.
    pub fn seek(&mut self, offset: usize) -> ShmResult<()> {
        check_range(offset, 0, self.len)?;
        self.cursor = offset;
        Ok(())
    }

    /// Advance the cursor by `n` bytes
    pub fn skip(&mut self, n: usize) -> ShmResult<()> {
        check_range(self.cursor, n, self.len)?;
        self.cursor += n;
        Ok(())
    }

    /// Read a value at the cursor without advancing
    pub fn peek_fixed<T: FixedField>(&self) -> ShmResult<T> {
        const { assert!(T::SIZE <= MAX_FIXED_SIZE) };
        check_range(self.cursor, T::SIZE, self.len)?;
        let mut scratch = [0u8; MAX_FIXED_SIZE];
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.base.add(self.cursor),
                scratch.as_mut_ptr(),
                T::SIZE,
            );
        }
        Ok(T::decode(&scratch[..T::SIZE]))
    }

    /// Read a value and advance past it
    pub fn read_fixed<T: FixedField>(&mut self) -> ShmResult<T> {
        let value = self.peek_fixed::<T>()?;
        self.cursor += T::SIZE;
        Ok(value)
    }

    /// Write a value and advance past it
    pub fn write_fixed<T: FixedField>(&mut self, value: T) -> ShmResult<()> {
        const { assert!(T::SIZE <= MAX_FIXED_SIZE) };
        check_range(self.cursor, T::SIZE, self.len)?;
        let mut scratch = [0u8; MAX_FIXED_SIZE];
        value.encode(&mut scratch[..T::SIZE]);
        unsafe {
            std::ptr::copy_nonoverlapping(scratch.as_ptr(), self.base.add(self.cursor), T::SIZE);
        }
        self.cursor += T::SIZE;
        Ok(())
    }

    /// Copy `out.len()` bytes from the cursor into `out`
    pub fn read_into(&mut self, out: &mut [u8]) -> ShmResult<()> {
        check_range(self.cursor, out.len(), self.len)?;
        unsafe {
            std::ptr::copy_nonoverlapping(self.base.add(self.cursor), out.as_mut_ptr(), out.len());
        }
        self.cursor += out.len();
        Ok(())
    }

    /// Read `n` raw bytes
    pub fn read_bytes(&mut self, n: usize) -> ShmResult<Vec<u8>> {
        check_range(self.cursor, n, self.len)?;
        let mut out = vec![0u8; n];
        self.read_into(&mut out)?;
        Ok(out)
    }

    /// Write raw bytes
    pub fn write_bytes(&mut self, data: &[u8]) -> ShmResult<()> {
        check_range(self.cursor, data.len(), self.len)?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.base.add(self.cursor), data.len());
        }
        self.cursor += data.len();
        Ok(())
    }

    /// Write a `u64` length prefix followed by the bytes.
    pub fn write_blob(&mut self, data: &[u8]) -> ShmResult<()> {
        check_range(self.cursor, 8 + data.len(), self.len)?;
        self.write_fixed(data.len() as u64)?;
        self.write_bytes(data)
    }

    /// Read a blob written by [`write_blob`](Self::write_blob).
    ///
    /// On a bad length the cursor is left where it was.
    pub fn read_blob(&mut self) -> ShmResult<Vec<u8>> {
        let start = self.cursor;
        let n = self.read_fixed::<u64>()? as usize;
        match self.read_bytes(n) {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                self.cursor = start;
                Err(e)
            }
        }
    }
}

fn check_range(offset: usize, len: usize, size: usize) -> ShmResult<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(ShmError::OutOfBounds { offset, len, size }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_fields_are_little_endian() {
        let mut buf = [0u8; 16];
        let mut view = StructuredMemoryView::over_slice(&mut buf);
        view.write_fixed(0x0102_0304u32).unwrap();
        view.write_fixed(-2i32).unwrap();
        view.write_fixed(true).unwrap();
        assert_eq!(view.position(), 9);
        drop(view);
        assert_eq!(&buf[..4], &[4, 3, 2, 1]);
        assert_eq!(&buf[4..8], &[0xfe, 0xff, 0xff, 0xff]);
        assert_eq!(buf[8], 1);
    }

    #[test]
    fn test_tuple_layout_and_peek() {
        let mut buf = [0u8; 64];
        let id = Uuid::new_v4();
        let mut view = StructuredMemoryView::over_slice(&mut buf);
        view.write_fixed((7u64, 9u64, id)).unwrap();
        assert_eq!(view.position(), 32);

        view.seek(0).unwrap();
        let peeked: (u64, u64, Uuid) = view.peek_fixed().unwrap();
        assert_eq!(view.position(), 0);
        assert_eq!(peeked, (7, 9, id));

        view.seek(8).unwrap();
        assert_eq!(view.read_fixed::<u64>().unwrap(), 9);
        assert_eq!(view.read_fixed::<Uuid>().unwrap(), id);
    }

    #[test]
    fn test_out_of_bounds_is_an_error() {
        let mut buf = [0u8; 6];
        let mut view = StructuredMemoryView::over_slice(&mut buf);
        view.seek(4).unwrap();
        assert!(matches!(
            view.read_fixed::<u32>(),
            Err(ShmError::OutOfBounds { offset: 4, len: 4, size: 6 })
        ));
        assert!(view.write_fixed(1u64).is_err());
        assert!(view.seek(7).is_err());
        assert!(view.seek(6).is_ok());
        assert_eq!(view.remaining(), 0);
        assert!(view.skip(1).is_err());
    }

    #[test]
    fn test_blob_with_length_prefix() {
        let mut buf = [0u8; 32];
        let mut view = StructuredMemoryView::over_slice(&mut buf);
        view.write_blob(b"facelink").unwrap();
        assert_eq!(view.position(), 16);
        assert!(view.write_blob(&[0u8; 16]).is_err());

        view.seek(0).unwrap();
        assert_eq!(view.read_blob().unwrap(), b"facelink");
    }

    #[test]
    fn test_corrupt_blob_length_restores_cursor() {
        let mut buf = [0u8; 16];
        let mut view = StructuredMemoryView::over_slice(&mut buf);
        view.write_fixed(u64::MAX).unwrap();
        view.seek(0).unwrap();
        assert!(view.read_blob().is_err());
        assert_eq!(view.position(), 0);
    }
}
