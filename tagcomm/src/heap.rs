//! Pooled registered-memory heap.
//!
//! Chunks are page-aligned, power-of-two sized, and registered with the
//! transport once at allocation time; released chunks return to a per-size
//! free list with their registration intact so reuse skips the (expensive)
//! registration call. Allocation and release are callable from any thread.

use std::collections::HashMap;
use std::io;
use std::ptr;
use std::sync::{Arc, Mutex, Weak};

/// Smallest chunk size handed out by the pool.
const MIN_CHUNK_SIZE: usize = 64;

/// Alignment of pool-owned chunks.
const CHUNK_ALIGN: usize = 4096;

/// Opaque transport registration handle for a memory region.
///
/// `lkey` is whatever the transport needs to use the region locally
/// (a descriptor pointer for libfabric); `rkey` is the remote key where
/// one exists. Both are zero for transports without registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegHandle {
    pub lkey: u64,
    pub rkey: u64,
}

/// Transport-side registration of raw memory ranges.
pub(crate) trait MemoryRegistry: Send + Sync + 'static {
    fn register(&self, ptr: *mut u8, size: usize) -> io::Result<RegHandle>;
    fn deregister(&self, ptr: *mut u8, size: usize, handle: RegHandle);
}

/// Registry for transports that access memory directly (in-process, MPI).
pub(crate) struct NullRegistry;

impl MemoryRegistry for NullRegistry {
    fn register(&self, _ptr: *mut u8, _size: usize) -> io::Result<RegHandle> {
        Ok(RegHandle::default())
    }

    fn deregister(&self, _ptr: *mut u8, _size: usize, _handle: RegHandle) {}
}

struct FreeChunk {
    ptr: *mut u8,
    size: usize,
    handle: RegHandle,
}

struct HeapInner {
    classes: Mutex<HashMap<usize, Vec<FreeChunk>>>,
    registry: Box<dyn MemoryRegistry>,
}

// Raw pointers in the free lists refer to exclusively-owned allocations.
unsafe impl Send for HeapInner {}
unsafe impl Sync for HeapInner {}

impl Drop for HeapInner {
    fn drop(&mut self) {
        let mut classes = self.classes.lock().unwrap();
        for (_, list) in classes.drain() {
            for fc in list {
                self.registry.deregister(fc.ptr, fc.size, fc.handle);
                unsafe { libc::free(fc.ptr as *mut libc::c_void) };
            }
        }
    }
}

/// A registered chunk of memory. Returned to the pool (or deregistered,
/// for adopted memory) when the last [`HeapPtr`] drops — which is what
/// keeps a buffer alive while any in-flight operation still references it.
pub(crate) struct Chunk {
    ptr: *mut u8,
    size: usize,
    handle: RegHandle,
    /// Pool-owned chunks recycle through the free list; adopted chunks
    /// only deregister.
    pooled: bool,
    heap: Weak<HeapInner>,
}

unsafe impl Send for Chunk {}
unsafe impl Sync for Chunk {}

impl Chunk {
    #[inline]
    pub(crate) fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub(crate) fn handle(&self) -> RegHandle {
        self.handle
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        match self.heap.upgrade() {
            Some(inner) => {
                if self.pooled {
                    inner
                        .classes
                        .lock()
                        .unwrap()
                        .entry(self.size)
                        .or_default()
                        .push(FreeChunk {
                            ptr: self.ptr,
                            size: self.size,
                            handle: self.handle,
                        });
                } else {
                    inner.registry.deregister(self.ptr, self.size, self.handle);
                }
            }
            None => {
                // Heap already torn down; the registration died with the
                // transport, only the memory remains.
                if self.pooled {
                    unsafe { libc::free(self.ptr as *mut libc::c_void) };
                }
            }
        }
    }
}

/// Shared ownership of a chunk.
pub(crate) type HeapPtr = Arc<Chunk>;

/// The registered-memory pool of a context.
#[derive(Clone)]
pub(crate) struct Heap {
    inner: Arc<HeapInner>,
}

impl Heap {
    pub(crate) fn new(registry: Box<dyn MemoryRegistry>) -> Self {
        Self {
            inner: Arc::new(HeapInner {
                classes: Mutex::new(HashMap::new()),
                registry,
            }),
        }
    }

    /// Allocate a registered chunk of at least `size` bytes.
    pub(crate) fn allocate(&self, size: usize) -> io::Result<HeapPtr> {
        let class = size.max(MIN_CHUNK_SIZE).next_power_of_two();

        if let Some(fc) = self
            .inner
            .classes
            .lock()
            .unwrap()
            .entry(class)
            .or_default()
            .pop()
        {
            return Ok(Arc::new(Chunk {
                ptr: fc.ptr,
                size: fc.size,
                handle: fc.handle,
                pooled: true,
                heap: Arc::downgrade(&self.inner),
            }));
        }

        let mut p: *mut libc::c_void = ptr::null_mut();
        let rc = unsafe { libc::posix_memalign(&mut p, CHUNK_ALIGN, class) };
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        let ptr = p as *mut u8;
        let handle = match self.inner.registry.register(ptr, class) {
            Ok(h) => h,
            Err(e) => {
                unsafe { libc::free(p) };
                return Err(e);
            }
        };
        Ok(Arc::new(Chunk {
            ptr,
            size: class,
            handle,
            pooled: true,
            heap: Arc::downgrade(&self.inner),
        }))
    }

    /// Register caller-owned memory without taking ownership of it.
    ///
    /// The memory must outlive the returned chunk; it is deregistered but
    /// never freed when the chunk drops.
    pub(crate) unsafe fn adopt(&self, ptr: *mut u8, size: usize) -> io::Result<HeapPtr> {
        let handle = self.inner.registry.register(ptr, size)?;
        Ok(Arc::new(Chunk {
            ptr,
            size,
            handle,
            pooled: false,
            heap: Arc::downgrade(&self.inner),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_rounds_to_class() {
        let heap = Heap::new(Box::new(NullRegistry));
        let c = heap.allocate(100).unwrap();
        assert_eq!(c.size(), 128);
        assert!(!c.ptr().is_null());
        assert_eq!(c.ptr() as usize % CHUNK_ALIGN, 0);
    }

    #[test]
    fn test_release_recycles() {
        let heap = Heap::new(Box::new(NullRegistry));
        let c = heap.allocate(256).unwrap();
        let ptr = c.ptr();
        drop(c);
        let c2 = heap.allocate(200).unwrap();
        assert_eq!(c2.ptr(), ptr);
    }

    #[test]
    fn test_clone_keeps_chunk_out_of_pool() {
        let heap = Heap::new(Box::new(NullRegistry));
        let c = heap.allocate(64).unwrap();
        let ptr = c.ptr();
        let alias = c.clone();
        drop(c);
        // Still held by `alias`, so a fresh allocation must not reuse it.
        let c2 = heap.allocate(64).unwrap();
        assert_ne!(c2.ptr(), ptr);
        drop(alias);
    }

    #[test]
    fn test_adopt_does_not_free() {
        let heap = Heap::new(Box::new(NullRegistry));
        let mut storage = vec![0u8; 512];
        let c = unsafe { heap.adopt(storage.as_mut_ptr(), 512) }.unwrap();
        assert_eq!(c.ptr(), storage.as_mut_ptr());
        drop(c);
        storage[0] = 1; // still valid
        assert_eq!(storage[0], 1);
    }

    #[test]
    fn test_concurrent_allocate_release() {
        let heap = Heap::new(Box::new(NullRegistry));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let heap = heap.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let c = heap.allocate(128).unwrap();
                        unsafe { c.ptr().write(42) };
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
