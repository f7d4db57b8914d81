//! Typed, move-only message buffers over registered memory.

use std::marker::PhantomData;

use crate::heap::{HeapPtr, RegHandle};

/// Marker trait for element types that can travel through a message buffer.
///
/// # Safety
/// Implementors must be plain-old-data: any bit pattern written by the
/// transport must be a valid value, and `Copy` guarantees no drop glue.
pub unsafe trait Serial: Copy {}

unsafe impl Serial for u8 {}
unsafe impl Serial for u16 {}
unsafe impl Serial for u32 {}
unsafe impl Serial for u64 {}
unsafe impl Serial for usize {}
unsafe impl Serial for i8 {}
unsafe impl Serial for i16 {}
unsafe impl Serial for i32 {}
unsafe impl Serial for i64 {}
unsafe impl Serial for isize {}
unsafe impl Serial for f32 {}
unsafe impl Serial for f64 {}
unsafe impl<T: Copy, const N: usize> Serial for [T; N] {}

/// Untyped view of a (possibly registered) buffer.
///
/// Holding a `RawBuffer` holds the underlying chunk alive: every in-flight
/// operation carries one, so the memory cannot return to the pool while
/// the transport may still touch it. All access goes through raw pointers
/// into the chunk, never through references into it.
pub(crate) struct RawBuffer {
    ptr: *mut u8,
    size: usize,
    chunk: Option<HeapPtr>,
}

unsafe impl Send for RawBuffer {}

impl RawBuffer {
    pub(crate) fn new(chunk: HeapPtr, size: usize) -> Self {
        debug_assert!(size <= chunk.size());
        Self {
            ptr: chunk.ptr(),
            size,
            chunk: Some(chunk),
        }
    }

    pub(crate) fn empty() -> Self {
        Self {
            ptr: std::ptr::NonNull::<u8>::dangling().as_ptr(),
            size: 0,
            chunk: None,
        }
    }

    #[inline]
    pub(crate) fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.size
    }

    /// Registration handle of the backing chunk (default for empty buffers).
    #[inline]
    #[cfg_attr(not(feature = "libfabric"), allow(dead_code))]
    pub(crate) fn reg_handle(&self) -> RegHandle {
        self.chunk.as_ref().map(|c| c.handle()).unwrap_or_default()
    }

    /// Second handle to the same bytes, sharing chunk ownership.
    ///
    /// Used for in-flight aliases (multi-destination sends, the no-callback
    /// send/recv overloads). Aliases are only read or written by the
    /// transport under the completion protocol.
    pub(crate) fn alias(&self) -> RawBuffer {
        Self {
            ptr: self.ptr,
            size: self.size,
            chunk: self.chunk.clone(),
        }
    }

    #[inline]
    pub(crate) fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.size) }
    }

    pub(crate) fn copy_from(&self, src: &[u8]) {
        assert!(
            src.len() <= self.size,
            "incoming message ({} bytes) exceeds receive buffer ({} bytes)",
            src.len(),
            self.size
        );
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr, src.len()) };
    }
}

/// A typed, move-only message buffer backed by registered memory.
///
/// Created through [`crate::Context::make_buffer`]. Ownership transfers on
/// move; the callback overloads of send/recv take the buffer by value and
/// hand it back when the operation completes.
pub struct MessageBuffer<T: Serial> {
    raw: RawBuffer,
    len: usize,
    _marker: PhantomData<T>,
}

impl<T: Serial> MessageBuffer<T> {
    pub(crate) fn from_raw(raw: RawBuffer, len: usize) -> Self {
        Self {
            raw,
            len,
            _marker: PhantomData,
        }
    }

    pub(crate) fn into_raw(self) -> (RawBuffer, usize) {
        (self.raw, self.len)
    }

    pub(crate) fn raw(&self) -> &RawBuffer {
        &self.raw
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size in bytes as seen by the transport.
    pub fn size_bytes(&self) -> usize {
        self.len * std::mem::size_of::<T>()
    }

    pub fn as_slice(&self) -> &[T] {
        unsafe { std::slice::from_raw_parts(self.raw.ptr() as *const T, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        unsafe { std::slice::from_raw_parts_mut(self.raw.ptr() as *mut T, self.len) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{Heap, NullRegistry};

    #[test]
    fn test_typed_view() {
        let heap = Heap::new(Box::new(NullRegistry));
        let chunk = heap.allocate(8 * std::mem::size_of::<u64>()).unwrap();
        let raw = RawBuffer::new(chunk, 8 * std::mem::size_of::<u64>());
        let mut buf = MessageBuffer::<u64>::from_raw(raw, 8);
        assert_eq!(buf.len(), 8);
        assert_eq!(buf.size_bytes(), 64);
        for (i, v) in buf.as_mut_slice().iter_mut().enumerate() {
            *v = i as u64;
        }
        assert_eq!(buf.as_slice()[7], 7);
    }

    #[test]
    fn test_alias_shares_bytes() {
        let heap = Heap::new(Box::new(NullRegistry));
        let chunk = heap.allocate(16).unwrap();
        let raw = RawBuffer::new(chunk, 16);
        let alias = raw.alias();
        alias.copy_from(&[1, 2, 3]);
        assert_eq!(&raw.as_slice()[..3], &[1, 2, 3]);
    }
}
