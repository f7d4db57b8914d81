//! Communicator: the per-thread handle that issues sends and receives
//! and drives completion.
//!
//! All callback invocation happens synchronously inside `progress()`,
//! `test()`, `wait()`, or inline at post time for immediate completions;
//! there is no background thread. A communicator is single-owner (`!Send`)
//! and clonable within its thread; cross-thread interaction exists only
//! inside the backends where transport resources are genuinely shared.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::callback::SingleShot;
use crate::context::ContextShared;
use crate::message::{MessageBuffer, RawBuffer, Serial};
use crate::request::{
    Completion, CompletionKind, Direction, RecvRequest, ReqFlags, RequestState, SchedCounters,
    SendRequest, SharedRecvRequest,
};
use crate::tag::{tag_in_budget, Rank, Tag, ANY_SOURCE, RESERVED_TAG_BIT};
use crate::transport::{BackendComm, CancelOutcome, PostOutcome};

pub(crate) struct CommInner {
    shared: Arc<ContextShared>,
    backend: RefCell<BackendComm>,
    counters: Arc<SchedCounters>,
    deferred: RefCell<VecDeque<crate::request::DeferredCallback>>,
    depth: Cell<u32>,
}

/// A per-thread communication handle.
#[derive(Clone)]
pub struct Communicator {
    inner: Rc<CommInner>,
}

impl Communicator {
    pub(crate) fn new(shared: Arc<ContextShared>, backend: BackendComm) -> Self {
        Self {
            inner: Rc::new(CommInner {
                shared,
                backend: RefCell::new(backend),
                counters: Arc::new(SchedCounters::new()),
                deferred: RefCell::new(VecDeque::new()),
                depth: Cell::new(0),
            }),
        }
    }

    /// This process's rank.
    pub fn rank(&self) -> Rank {
        self.inner.shared.topology.rank()
    }

    /// Number of ranks in the process group.
    pub fn size(&self) -> Rank {
        self.inner.shared.topology.size()
    }

    /// Exclusive upper bound of the user-visible tag space.
    pub fn tag_limit(&self) -> Tag {
        self.inner.backend.borrow().tag_limit()
    }

    /// Wrap a tag into the communicator's reserved control range, which
    /// user tags can never collide with. Used for barrier sentinels.
    pub fn reserved(&self, tag: Tag) -> Tag {
        assert!(tag >= 0 && tag < self.tag_limit());
        RESERVED_TAG_BIT | tag
    }

    fn check_tag(&self, tag: Tag) {
        assert!(
            tag_in_budget(tag, self.tag_limit()),
            "tag {} outside the addressable tag space",
            tag
        );
    }

    fn check_rank(&self, rank: Rank, any_allowed: bool) {
        if any_allowed && rank == ANY_SOURCE {
            return;
        }
        assert!(rank >= 0 && rank < self.size(), "invalid peer rank {}", rank);
    }

    /// Post a send. The caller keeps the buffer and must not mutate it
    /// until the request completes; the buffer cannot be released early
    /// because the operation holds the backing chunk alive.
    pub fn send<T: Serial>(&self, msg: &MessageBuffer<T>, dst: Rank, tag: Tag) -> SendRequest {
        self.post_send(msg.raw().alias(), dst, tag, SingleShot::noop())
    }

    /// Post a send that hands the buffer back through `cb` on completion.
    /// If the transport completes the send synchronously, `cb` fires on
    /// the calling thread before this returns and the handle is empty.
    pub fn send_cb<T, F>(&self, msg: MessageBuffer<T>, dst: Rank, tag: Tag, cb: F) -> SendRequest
    where
        T: Serial,
        F: FnOnce(MessageBuffer<T>, Rank, Tag) + Send + 'static,
    {
        let (raw, len) = msg.into_raw();
        let cb = SingleShot::new(move |raw, rank, tag| cb(MessageBuffer::from_raw(raw, len), rank, tag));
        self.post_send(raw, dst, tag, cb)
    }

    /// Post a receive. The caller keeps the buffer and must not touch it
    /// until the request completes.
    pub fn recv<T: Serial>(&self, msg: &mut MessageBuffer<T>, src: Rank, tag: Tag) -> RecvRequest {
        self.post_recv(msg.raw().alias(), src, tag, SingleShot::noop())
    }

    /// Post a receive that hands the filled buffer back through `cb`,
    /// together with the actual source rank (relevant for
    /// [`ANY_SOURCE`]).
    pub fn recv_cb<T, F>(&self, msg: MessageBuffer<T>, src: Rank, tag: Tag, cb: F) -> RecvRequest
    where
        T: Serial,
        F: FnOnce(MessageBuffer<T>, Rank, Tag) + Send + 'static,
    {
        let (raw, len) = msg.into_raw();
        let cb = SingleShot::new(move |raw, rank, tag| cb(MessageBuffer::from_raw(raw, len), rank, tag));
        self.post_recv(raw, src, tag, cb)
    }

    /// Fan one logical send out to every rank in `dsts`. The returned
    /// request becomes ready only when all sub-sends complete.
    pub fn send_multi<T: Serial>(&self, msg: &MessageBuffer<T>, dsts: &[Rank], tag: Tag) -> SendRequest {
        self.post_send_multi(msg.raw().alias(), dsts, tag, Box::new(|| {}))
    }

    /// Like [`send_multi`](Self::send_multi), with a callback that fires
    /// once, after the last sub-send completes, returning the buffer and
    /// the destination list.
    pub fn send_multi_cb<T, F>(
        &self,
        msg: MessageBuffer<T>,
        dsts: &[Rank],
        tag: Tag,
        cb: F,
    ) -> SendRequest
    where
        T: Serial,
        F: FnOnce(MessageBuffer<T>, Vec<Rank>, Tag) + Send + 'static,
    {
        let (raw, len) = msg.into_raw();
        let ranks = dsts.to_vec();
        self.post_send_multi(
            raw.alias(),
            dsts,
            tag,
            Box::new(move || cb(MessageBuffer::from_raw(raw, len), ranks, tag)),
        )
    }

    /// Post a receive whose completion may be observed from any thread
    /// and progressed by any communicator of the owning context.
    pub fn shared_recv_cb<T, F>(
        &self,
        msg: MessageBuffer<T>,
        src: Rank,
        tag: Tag,
        cb: F,
    ) -> SharedRecvRequest
    where
        T: Serial,
        F: FnOnce(MessageBuffer<T>, Rank, Tag) + Send + 'static,
    {
        self.check_rank(src, true);
        self.check_tag(tag);
        let (raw, len) = msg.into_raw();
        let cb = SingleShot::new(move |raw, rank, tag| cb(MessageBuffer::from_raw(raw, len), rank, tag));
        let flags = Arc::new(ReqFlags::new());
        let counters = self.inner.shared.shared_counters.clone();
        counters.inc(Direction::Recv);
        let state = RequestState::new(cb, raw, src, tag, flags.clone(), counters, Direction::Recv);
        let outcome = self.inner.backend.borrow_mut().post_shared_recv(state);
        if let PostOutcome::Immediate(state) = outcome {
            state.complete();
        }
        SharedRecvRequest::new(flags, self.inner.shared.clone())
    }

    /// One non-blocking completion pass: poll the backend, fire ready
    /// callbacks, drain deferred callbacks when unwinding to the top
    /// nesting level. Returns the number of callbacks fired.
    pub fn progress(&self) -> usize {
        let inner = &*self.inner;
        let depth = inner.depth.get();
        inner.depth.set(depth + 1);

        let mut completions = Vec::new();
        inner
            .backend
            .borrow_mut()
            .poll(&mut completions, inner.shared.config.poll_batch);

        let mut fired = 0;
        for c in completions {
            fired += self.dispatch(c);
        }
        inner.depth.set(depth);

        if depth == 0 {
            loop {
                let d = inner.deferred.borrow_mut().pop_front();
                match d {
                    Some(cb) => {
                        cb.run();
                        fired += 1;
                    }
                    None => break,
                }
            }
        }
        fired
    }

    fn dispatch(&self, c: Completion) -> usize {
        match c.kind {
            CompletionKind::Canceled => {
                c.state.complete_canceled();
                0
            }
            CompletionKind::Completed => {
                if self.inner.depth.get() > self.inner.shared.config.progress_depth {
                    // Reentrant progress beyond the cutoff: mark ready so
                    // nested waits terminate, run the callback when the
                    // stack unwinds.
                    let d = c.state.split_deferred();
                    self.inner.deferred.borrow_mut().push_back(d);
                    0
                } else {
                    c.state.complete();
                    1
                }
            }
        }
    }

    /// Number of outstanding sends issued on this communicator.
    pub fn scheduled_sends(&self) -> usize {
        self.inner.counters.sends()
    }

    /// Number of outstanding receives issued on this communicator
    /// (shared receives are counted by the context, not here).
    pub fn scheduled_recvs(&self) -> usize {
        self.inner.counters.recvs()
    }

    /// Spin on progress until this communicator is quiescent: both
    /// outstanding counters zero. Deliberately a user-space spin, not a
    /// blocking wait, so it multiplexes with other work on the thread.
    pub fn wait_all(&self) {
        while self.scheduled_sends() != 0 || self.scheduled_recvs() != 0 {
            self.progress();
            std::hint::spin_loop();
        }
    }

    fn post_send(&self, raw: RawBuffer, dst: Rank, tag: Tag, cb: SingleShot) -> SendRequest {
        self.check_rank(dst, false);
        self.check_tag(tag);
        let flags = Arc::new(ReqFlags::new());
        self.inner.counters.inc(Direction::Send);
        let state = RequestState::new(
            cb,
            raw,
            dst,
            tag,
            flags.clone(),
            self.inner.counters.clone(),
            Direction::Send,
        );
        // Bind before matching: the callback must not run while the
        // backend is still borrowed, or it could not post.
        let outcome = self.inner.backend.borrow_mut().post_send(state);
        match outcome {
            PostOutcome::Immediate(state) => {
                state.complete();
                SendRequest::ready()
            }
            PostOutcome::Pending => SendRequest::pending(flags, self.clone()),
        }
    }

    fn post_recv(&self, raw: RawBuffer, src: Rank, tag: Tag, cb: SingleShot) -> RecvRequest {
        self.check_rank(src, true);
        self.check_tag(tag);
        let flags = Arc::new(ReqFlags::new());
        self.inner.counters.inc(Direction::Recv);
        let state = RequestState::new(
            cb,
            raw,
            src,
            tag,
            flags.clone(),
            self.inner.counters.clone(),
            Direction::Recv,
        );
        let outcome = self.inner.backend.borrow_mut().post_recv(state);
        match outcome {
            PostOutcome::Immediate(state) => {
                state.complete();
                RecvRequest::ready()
            }
            PostOutcome::Pending => RecvRequest::pending(flags, self.clone()),
        }
    }

    fn post_send_multi(
        &self,
        raw: RawBuffer,
        dsts: &[Rank],
        tag: Tag,
        finale: Box<dyn FnOnce() + Send>,
    ) -> SendRequest {
        self.check_tag(tag);
        for &d in dsts {
            self.check_rank(d, false);
        }
        let agg_flags = Arc::new(ReqFlags::new());
        if dsts.is_empty() {
            agg_flags.set_ready();
            finale();
            return SendRequest::ready();
        }

        let multi = Arc::new(MultiSendState {
            remaining: AtomicUsize::new(dsts.len()),
            flags: agg_flags.clone(),
            finale: Mutex::new(Some(finale)),
        });

        for &dst in dsts {
            let multi = multi.clone();
            let cb = SingleShot::new(move |_buf, _rank, _tag| {
                if multi.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    multi.flags.set_ready();
                    if let Some(f) = multi.finale.lock().unwrap().take() {
                        f();
                    }
                }
            });
            let sub_flags = Arc::new(ReqFlags::new());
            self.inner.counters.inc(Direction::Send);
            let state = RequestState::new(
                cb,
                raw.alias(),
                dst,
                tag,
                sub_flags,
                self.inner.counters.clone(),
                Direction::Send,
            );
            let outcome = self.inner.backend.borrow_mut().post_send(state);
            if let PostOutcome::Immediate(state) = outcome {
                state.complete();
            }
        }

        if agg_flags.done() {
            SendRequest::ready()
        } else {
            SendRequest::pending(agg_flags, self.clone())
        }
    }

    pub(crate) fn cancel_recv(&self, flags: &Arc<ReqFlags>) -> bool {
        let outcome = self.inner.backend.borrow_mut().cancel_recv(flags);
        match outcome {
            CancelOutcome::Confirmed(state) => {
                state.complete_canceled();
                true
            }
            CancelOutcome::CompletedInstead(state) => {
                state.complete();
                false
            }
            CancelOutcome::NotFound => {
                // The completion is already on its way to dispatch; drive
                // progress until it lands.
                while !flags.done() {
                    self.progress();
                    std::hint::spin_loop();
                }
                false
            }
        }
    }
}

/// Aggregate state of a multi-destination send: the single user callback
/// fires when the last sub-send completes.
struct MultiSendState {
    remaining: AtomicUsize,
    flags: Arc<ReqFlags>,
    finale: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}
