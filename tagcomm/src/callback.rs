//! Type-erased single-shot completion callbacks.
//!
//! Small closures are stored inline to keep the posting hot path free of
//! heap allocation; anything larger (or over-aligned) spills to a box.
//! Invocation consumes the callback, which is what makes a second
//! completion report structurally unable to re-fire it.

use std::marker::PhantomData;
use std::mem::{self, ManuallyDrop, MaybeUninit};
use std::ptr;

use crate::message::RawBuffer;
use crate::tag::{Rank, Tag};

const INLINE_WORDS: usize = 6;

union Storage {
    inline: [MaybeUninit<usize>; INLINE_WORDS],
    heap: *mut (),
}

struct VTable {
    invoke: unsafe fn(*mut Storage, RawBuffer, Rank, Tag),
    drop: unsafe fn(*mut Storage),
}

unsafe fn invoke_inline<F: FnOnce(RawBuffer, Rank, Tag)>(
    s: *mut Storage,
    buf: RawBuffer,
    rank: Rank,
    tag: Tag,
) {
    let f = ptr::read((*s).inline.as_ptr().cast::<F>());
    f(buf, rank, tag)
}

unsafe fn drop_inline<F>(s: *mut Storage) {
    ptr::drop_in_place((*s).inline.as_mut_ptr().cast::<F>())
}

unsafe fn invoke_boxed<F: FnOnce(RawBuffer, Rank, Tag)>(
    s: *mut Storage,
    buf: RawBuffer,
    rank: Rank,
    tag: Tag,
) {
    let f = Box::from_raw((*s).heap.cast::<F>());
    (*f)(buf, rank, tag)
}

unsafe fn drop_boxed<F>(s: *mut Storage) {
    drop(Box::from_raw((*s).heap.cast::<F>()))
}

struct VTableOf<F>(PhantomData<F>);

impl<F: FnOnce(RawBuffer, Rank, Tag) + Send + 'static> VTableOf<F> {
    const INLINE: VTable = VTable {
        invoke: invoke_inline::<F>,
        drop: drop_inline::<F>,
    };
    const BOXED: VTable = VTable {
        invoke: invoke_boxed::<F>,
        drop: drop_boxed::<F>,
    };
}

/// A move-only callback invoked at most once with the completed
/// operation's buffer, peer rank, and tag.
pub(crate) struct SingleShot {
    storage: Storage,
    vtable: &'static VTable,
}

// The constructor requires `F: Send`, and the erased value is never shared.
unsafe impl Send for SingleShot {}

impl SingleShot {
    pub(crate) fn new<F>(f: F) -> Self
    where
        F: FnOnce(RawBuffer, Rank, Tag) + Send + 'static,
    {
        let fits_inline = mem::size_of::<F>() <= mem::size_of::<[usize; INLINE_WORDS]>()
            && mem::align_of::<F>() <= mem::align_of::<usize>();
        unsafe {
            if fits_inline {
                let mut storage = Storage {
                    inline: [MaybeUninit::uninit(); INLINE_WORDS],
                };
                ptr::write(storage.inline.as_mut_ptr().cast::<F>(), f);
                Self {
                    storage,
                    vtable: &VTableOf::<F>::INLINE,
                }
            } else {
                Self {
                    storage: Storage {
                        heap: Box::into_raw(Box::new(f)).cast(),
                    },
                    vtable: &VTableOf::<F>::BOXED,
                }
            }
        }
    }

    /// Callback that only releases the buffer, for the no-callback
    /// send/recv overloads.
    pub(crate) fn noop() -> Self {
        Self::new(|_buf, _rank, _tag| {})
    }

    pub(crate) fn invoke(self, buf: RawBuffer, rank: Rank, tag: Tag) {
        let mut this = ManuallyDrop::new(self);
        unsafe { (this.vtable.invoke)(&mut this.storage, buf, rank, tag) }
    }
}

impl Drop for SingleShot {
    fn drop(&mut self) {
        unsafe { (self.vtable.drop)(&mut self.storage) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_invoke_runs_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let cb = SingleShot::new(move |_b, rank, tag| {
            assert_eq!(rank, 3);
            assert_eq!(tag, 7);
            h.fetch_add(1, Ordering::SeqCst);
        });
        cb.invoke(RawBuffer::empty(), 3, 7);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_without_invoke_releases_capture() {
        let token = Arc::new(());
        let t = token.clone();
        let cb = SingleShot::new(move |_b, _r, _t| {
            let _keep = &t;
        });
        assert_eq!(Arc::strong_count(&token), 2);
        drop(cb);
        assert_eq!(Arc::strong_count(&token), 1);
    }

    #[test]
    fn test_large_capture_spills_to_heap() {
        let payload = [7u64; 32]; // larger than the inline words
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let cb = SingleShot::new(move |_b, _r, _t| {
            assert_eq!(payload[31], 7);
            h.fetch_add(1, Ordering::SeqCst);
        });
        cb.invoke(RawBuffer::empty(), 0, 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_large_capture_drop_without_invoke() {
        let payload = [0u8; 1024];
        let token = Arc::new(());
        let t = token.clone();
        let cb = SingleShot::new(move |_b, _r, _t| {
            let _keep = (&t, &payload);
        });
        drop(cb);
        assert_eq!(Arc::strong_count(&token), 1);
    }
}
