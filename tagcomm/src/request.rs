//! Per-operation request state and user-visible request handles.
//!
//! A request moves through exactly one of three terminal paths: completed
//! (callback fired), canceled (callback dropped), or deferred (marked
//! ready under the progress-depth guard, callback fired when the nesting
//! unwinds). The state object itself is moved out of the backend's pending
//! storage at the moment the outcome is decided, so every path consumes it
//! exactly once.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::callback::SingleShot;
use crate::communicator::Communicator;
use crate::message::RawBuffer;
use crate::tag::{Rank, Tag};

/// Outstanding-operation counters of a communicator (or, for shared
/// receives, of the whole context). Relaxed atomics: these are progress
/// indicators, not synchronization edges.
pub(crate) struct SchedCounters {
    sends: AtomicUsize,
    recvs: AtomicUsize,
}

impl SchedCounters {
    pub(crate) fn new() -> Self {
        Self {
            sends: AtomicUsize::new(0),
            recvs: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub(crate) fn inc(&self, dir: Direction) {
        match dir {
            Direction::Send => self.sends.fetch_add(1, Ordering::Relaxed),
            Direction::Recv => self.recvs.fetch_add(1, Ordering::Relaxed),
        };
    }

    #[inline]
    pub(crate) fn dec(&self, dir: Direction) {
        match dir {
            Direction::Send => self.sends.fetch_sub(1, Ordering::Relaxed),
            Direction::Recv => self.recvs.fetch_sub(1, Ordering::Relaxed),
        };
    }

    #[inline]
    pub(crate) fn sends(&self) -> usize {
        self.sends.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn recvs(&self) -> usize {
        self.recvs.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Send,
    Recv,
}

/// Flags shared between a request handle and the state parked in the
/// backend. `index` is the operation's current slot in the backend's
/// pending storage; compaction keeps it up to date so cancellation can
/// find the operation in O(1).
pub(crate) struct ReqFlags {
    ready: AtomicBool,
    canceled: AtomicBool,
    index: AtomicUsize,
}

impl ReqFlags {
    pub(crate) fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
            index: AtomicUsize::new(usize::MAX),
        }
    }

    #[inline]
    pub(crate) fn ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// The operation reached a terminal state (completed or canceled).
    #[inline]
    pub(crate) fn done(&self) -> bool {
        self.ready() || self.canceled()
    }

    /// Used by aggregate requests whose readiness is settled outside of a
    /// [`RequestState`] terminal path.
    #[inline]
    pub(crate) fn set_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    #[inline]
    pub(crate) fn set_index(&self, i: usize) {
        self.index.store(i, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn index(&self) -> usize {
        self.index.load(Ordering::Relaxed)
    }
}

/// Everything needed to finish one send or one receive.
pub(crate) struct RequestState {
    pub(crate) cb: SingleShot,
    pub(crate) buffer: RawBuffer,
    /// Peer rank; for any-source receives this is fixed up to the actual
    /// sender before the completion is dispatched.
    pub(crate) peer: Rank,
    pub(crate) tag: Tag,
    pub(crate) flags: Arc<ReqFlags>,
    pub(crate) counters: Arc<SchedCounters>,
    pub(crate) direction: Direction,
}

impl RequestState {
    pub(crate) fn new(
        cb: SingleShot,
        buffer: RawBuffer,
        peer: Rank,
        tag: Tag,
        flags: Arc<ReqFlags>,
        counters: Arc<SchedCounters>,
        direction: Direction,
    ) -> Self {
        Self {
            cb,
            buffer,
            peer,
            tag,
            flags,
            counters,
            direction,
        }
    }

    /// Mark ready, settle the counter, fire the callback.
    pub(crate) fn complete(self) {
        self.flags.ready.store(true, Ordering::Release);
        self.counters.dec(self.direction);
        self.cb.invoke(self.buffer, self.peer, self.tag);
    }

    /// Mark canceled and settle the counter; the callback and the buffer
    /// reference are dropped without firing.
    pub(crate) fn complete_canceled(self) {
        self.flags.canceled.store(true, Ordering::Release);
        self.counters.dec(self.direction);
    }

    /// Mark ready and settle the counter now (so nested waits observing
    /// the flags terminate), but hand the callback back for later.
    pub(crate) fn split_deferred(self) -> DeferredCallback {
        self.flags.ready.store(true, Ordering::Release);
        self.counters.dec(self.direction);
        DeferredCallback {
            cb: self.cb,
            buffer: self.buffer,
            peer: self.peer,
            tag: self.tag,
        }
    }
}

/// A completion whose flags/counters are already settled; only the user
/// callback remains to run.
pub(crate) struct DeferredCallback {
    cb: SingleShot,
    buffer: RawBuffer,
    peer: Rank,
    tag: Tag,
}

impl DeferredCallback {
    pub(crate) fn run(self) {
        self.cb.invoke(self.buffer, self.peer, self.tag);
    }
}

/// How a polled operation finished.
pub(crate) enum CompletionKind {
    Completed,
    Canceled,
}

/// One completion record handed from a backend poll to the communicator's
/// dispatch step. Backends never invoke user callbacks themselves.
pub(crate) struct Completion {
    pub(crate) state: RequestState,
    pub(crate) kind: CompletionKind,
}

struct RequestHandle {
    flags: Arc<ReqFlags>,
    comm: Communicator,
}

/// Handle to an outstanding send.
///
/// A default-constructed (or immediately-completed) handle is empty and
/// always ready. Sends cannot be canceled; protocols that need to stop a
/// message exchange must use completion acknowledgement instead (see the
/// tail-drain pattern in the integration tests).
#[derive(Default)]
pub struct SendRequest {
    inner: Option<RequestHandle>,
}

impl SendRequest {
    pub(crate) fn ready() -> Self {
        Self { inner: None }
    }

    pub(crate) fn pending(flags: Arc<ReqFlags>, comm: Communicator) -> Self {
        Self {
            inner: Some(RequestHandle { flags, comm }),
        }
    }

    /// Non-blocking readiness observation.
    pub fn is_ready(&self) -> bool {
        match &self.inner {
            None => true,
            Some(h) => h.flags.done(),
        }
    }

    /// Drive one progress pass, then report readiness.
    pub fn test(&self) -> bool {
        if let Some(h) = &self.inner {
            if !h.flags.done() {
                h.comm.progress();
            }
        }
        self.is_ready()
    }

    /// Spin on progress until the operation completes. Other ready
    /// callbacks on the same communicator fire during the wait.
    pub fn wait(&self) {
        while let Some(h) = &self.inner {
            if h.flags.done() {
                break;
            }
            h.comm.progress();
            std::hint::spin_loop();
        }
    }
}

/// Handle to an outstanding receive.
#[derive(Default)]
pub struct RecvRequest {
    inner: Option<RequestHandle>,
}

impl RecvRequest {
    pub(crate) fn ready() -> Self {
        Self { inner: None }
    }

    pub(crate) fn pending(flags: Arc<ReqFlags>, comm: Communicator) -> Self {
        Self {
            inner: Some(RequestHandle { flags, comm }),
        }
    }

    pub fn is_ready(&self) -> bool {
        match &self.inner {
            None => true,
            Some(h) => h.flags.done(),
        }
    }

    pub fn test(&self) -> bool {
        if let Some(h) = &self.inner {
            if !h.flags.done() {
                h.comm.progress();
            }
        }
        self.is_ready()
    }

    pub fn wait(&self) {
        while let Some(h) = &self.inner {
            if h.flags.done() {
                break;
            }
            h.comm.progress();
            std::hint::spin_loop();
        }
    }

    /// Try to cancel the receive.
    ///
    /// Returns `true` only if the cancellation was confirmed, in which
    /// case the callback never fires. Returns `false` when the operation
    /// already completed (or completes while the cancellation is being
    /// negotiated) — the callback then fires normally, exactly once. Both
    /// outcomes of the race are legitimate.
    pub fn cancel(&mut self) -> bool {
        let Some(h) = &self.inner else {
            return false;
        };
        if h.flags.done() {
            return false;
        }
        h.comm.cancel_recv(&h.flags)
    }
}

/// Handle to a shared receive, observable from any thread.
///
/// Completion is driven by whichever communicator of the owning context
/// progresses first; `wait` additionally drives the context-level shared
/// queue itself so it cannot deadlock when no communicator is polling.
#[derive(Clone)]
pub struct SharedRecvRequest {
    flags: Arc<ReqFlags>,
    ctx: Arc<crate::context::ContextShared>,
}

impl SharedRecvRequest {
    pub(crate) fn new(flags: Arc<ReqFlags>, ctx: Arc<crate::context::ContextShared>) -> Self {
        Self { flags, ctx }
    }

    pub fn is_ready(&self) -> bool {
        self.flags.done()
    }

    pub fn test(&self) -> bool {
        if !self.flags.done() {
            self.ctx.progress_shared();
        }
        self.is_ready()
    }

    pub fn wait(&self) {
        while !self.flags.done() {
            self.ctx.progress_shared();
            std::hint::spin_loop();
        }
    }
}
