//! In-process transport: one mailbox per rank, shared by all contexts of
//! an [`InprocFabric`].
//!
//! Sends copy the payload into the destination mailbox and complete
//! immediately; a full mailbox parks the send for retry on progress,
//! which is the transport's would-block path. Receives match against the
//! rank's unmatched-message list by 64-bit wire tag and mask; a match at
//! post time completes inline. This backend needs no hardware and is what
//! the integration tests and benches run on.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use slab::Slab;

use crate::request::{Completion, CompletionKind, ReqFlags, RequestState};
use crate::tag::{wire_tag, Rank, Tag, ANY_SOURCE, MATCH_ANY_SOURCE, MATCH_EXACT, RESERVED_TAG_BIT};
use crate::transport::{CancelOutcome, PostOutcome};

struct WireMessage {
    wtag: u64,
    src: Rank,
    data: Box<[u8]>,
}

struct Mailbox {
    unmatched: VecDeque<WireMessage>,
}

/// A process-local fabric connecting `size` ranks.
///
/// Explicitly injectable: every context created over the same fabric
/// handle sees the same rank space, so tests can stand up an N-rank job
/// as N threads.
pub struct InprocFabric {
    size: Rank,
    capacity: usize,
    mailboxes: Vec<Mutex<Mailbox>>,
}

impl InprocFabric {
    /// Fabric with the default mailbox capacity.
    pub fn new(size: usize) -> Arc<Self> {
        Self::with_capacity(size, crate::config::DEFAULT_MAILBOX_CAPACITY)
    }

    /// Fabric with an explicit per-rank mailbox capacity. Small
    /// capacities force the parked-send retry path.
    pub fn with_capacity(size: usize, capacity: usize) -> Arc<Self> {
        assert!(size >= 1, "fabric needs at least one rank");
        assert!(capacity >= 1, "mailbox capacity must be positive");
        Arc::new(Self {
            size: size as Rank,
            capacity,
            mailboxes: (0..size)
                .map(|_| {
                    Mutex::new(Mailbox {
                        unmatched: VecDeque::new(),
                    })
                })
                .collect(),
        })
    }

    /// Number of ranks.
    pub fn size(&self) -> usize {
        self.size as usize
    }

    fn try_deliver(&self, dst: Rank, msg: WireMessage) -> Result<(), WireMessage> {
        let mut mb = self.mailboxes[dst as usize].lock().unwrap();
        if mb.unmatched.len() >= self.capacity {
            return Err(msg);
        }
        mb.unmatched.push_back(msg);
        Ok(())
    }
}

struct SharedPending {
    wtag: u64,
    mask: u64,
    state: RequestState,
}

/// Context-level queue of shared receives, matched by whichever
/// communicator of the context progresses first.
pub(crate) struct InprocShared {
    pending: Mutex<Slab<SharedPending>>,
}

impl InprocShared {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(Slab::new()),
        })
    }
}

struct PendingRecv {
    wtag: u64,
    mask: u64,
    state: RequestState,
}

struct ParkedSend {
    dst: Rank,
    msg: WireMessage,
    state: RequestState,
}

/// Per-communicator backend state.
pub(crate) struct InprocComm {
    fabric: Arc<InprocFabric>,
    shared: Arc<InprocShared>,
    rank: Rank,
    /// Posting order is preserved so equal-tag receives match FIFO.
    pending_recvs: Vec<PendingRecv>,
    parked_sends: VecDeque<ParkedSend>,
}

#[inline]
fn matches(msg_wtag: u64, wtag: u64, mask: u64) -> bool {
    (msg_wtag & mask) == (wtag & mask)
}

fn recv_matcher(tag: Tag, src: Rank) -> (u64, u64) {
    if src == ANY_SOURCE {
        (wire_tag(tag, 0), MATCH_ANY_SOURCE)
    } else {
        (wire_tag(tag, src), MATCH_EXACT)
    }
}

impl InprocComm {
    pub(crate) fn new(fabric: Arc<InprocFabric>, shared: Arc<InprocShared>, rank: Rank) -> Self {
        Self {
            fabric,
            shared,
            rank,
            pending_recvs: Vec::new(),
            parked_sends: VecDeque::new(),
        }
    }

    pub(crate) fn tag_limit(&self) -> Tag {
        RESERVED_TAG_BIT
    }

    pub(crate) fn post_send(&mut self, state: RequestState) -> PostOutcome {
        let msg = WireMessage {
            wtag: wire_tag(state.tag, self.rank),
            src: self.rank,
            data: state.buffer.as_slice().into(),
        };
        let dst = state.peer;
        match self.fabric.try_deliver(dst, msg) {
            Ok(()) => PostOutcome::Immediate(state),
            Err(msg) => {
                self.parked_sends.push_back(ParkedSend { dst, msg, state });
                PostOutcome::Pending
            }
        }
    }

    pub(crate) fn post_recv(&mut self, mut state: RequestState) -> PostOutcome {
        let (wtag, mask) = recv_matcher(state.tag, state.peer);
        {
            let mut mb = self.fabric.mailboxes[self.rank as usize].lock().unwrap();
            if let Some(pos) = mb.unmatched.iter().position(|m| matches(m.wtag, wtag, mask)) {
                let msg = mb.unmatched.remove(pos).unwrap();
                drop(mb);
                state.buffer.copy_from(&msg.data);
                state.peer = msg.src;
                return PostOutcome::Immediate(state);
            }
        }
        state.flags.set_index(self.pending_recvs.len());
        self.pending_recvs.push(PendingRecv { wtag, mask, state });
        PostOutcome::Pending
    }

    pub(crate) fn post_shared_recv(&mut self, mut state: RequestState) -> PostOutcome {
        let (wtag, mask) = recv_matcher(state.tag, state.peer);
        // Lock order everywhere: mailbox, then shared queue.
        let mut mb = self.fabric.mailboxes[self.rank as usize].lock().unwrap();
        if let Some(pos) = mb.unmatched.iter().position(|m| matches(m.wtag, wtag, mask)) {
            let msg = mb.unmatched.remove(pos).unwrap();
            drop(mb);
            state.buffer.copy_from(&msg.data);
            state.peer = msg.src;
            return PostOutcome::Immediate(state);
        }
        let mut pending = self.shared.pending.lock().unwrap();
        let key = pending.insert(SharedPending { wtag, mask, state });
        pending[key].state.flags.set_index(key);
        PostOutcome::Pending
    }

    pub(crate) fn poll(&mut self, out: &mut Vec<Completion>, batch: usize) {
        // Retry parked sends first so freed mailbox space is used in
        // posting order.
        for _ in 0..self.parked_sends.len() {
            let ps = self.parked_sends.pop_front().unwrap();
            match self.fabric.try_deliver(ps.dst, ps.msg) {
                Ok(()) => out.push(Completion {
                    state: ps.state,
                    kind: CompletionKind::Completed,
                }),
                Err(msg) => self.parked_sends.push_back(ParkedSend {
                    dst: ps.dst,
                    msg,
                    state: ps.state,
                }),
            }
        }

        // Drain the rank mailbox, matching local pending receives first,
        // then the context's shared receives. `batch` caps completions per
        // pass, not scan depth: every unmatched message is examined every
        // pass, so a matchable message cannot sit starved behind traffic
        // nothing has asked for yet.
        let fabric = self.fabric.clone();
        let mut mb = fabric.mailboxes[self.rank as usize].lock().unwrap();
        let mut kept = VecDeque::with_capacity(mb.unmatched.len());
        let mut matched = 0;
        while let Some(msg) = mb.unmatched.pop_front() {
            if matched >= batch {
                kept.push_back(msg);
                continue;
            }
            if let Some(i) = self
                .pending_recvs
                .iter()
                .position(|p| matches(msg.wtag, p.wtag, p.mask))
            {
                let mut p = self.remove_pending(i);
                p.state.buffer.copy_from(&msg.data);
                p.state.peer = msg.src;
                out.push(Completion {
                    state: p.state,
                    kind: CompletionKind::Completed,
                });
                matched += 1;
                continue;
            }
            if let Some(c) = match_shared(&self.shared, &msg) {
                out.push(c);
                matched += 1;
                continue;
            }
            kept.push_back(msg);
        }
        mb.unmatched = kept;
    }

    pub(crate) fn cancel_recv(&mut self, flags: &Arc<ReqFlags>) -> CancelOutcome {
        let i = flags.index();
        if i < self.pending_recvs.len() && Arc::ptr_eq(&self.pending_recvs[i].state.flags, flags) {
            let p = self.remove_pending(i);
            return CancelOutcome::Confirmed(p.state);
        }
        CancelOutcome::NotFound
    }

    /// Ordered removal with index fixup for the shifted survivors, so
    /// equal-tag matching stays FIFO and cancellation stays O(1) lookup.
    fn remove_pending(&mut self, i: usize) -> PendingRecv {
        let p = self.pending_recvs.remove(i);
        for (j, q) in self.pending_recvs.iter().enumerate().skip(i) {
            q.state.flags.set_index(j);
        }
        p
    }
}

fn match_shared(shared: &InprocShared, msg: &WireMessage) -> Option<Completion> {
    let mut pending = shared.pending.lock().unwrap();
    let key = pending
        .iter()
        .find(|(_, p)| matches(msg.wtag, p.wtag, p.mask))
        .map(|(k, _)| k)?;
    let mut p = pending.remove(key);
    drop(pending);
    p.state.buffer.copy_from(&msg.data);
    p.state.peer = msg.src;
    Some(Completion {
        state: p.state,
        kind: CompletionKind::Completed,
    })
}

/// Progress pass over only the shared receives of one context, used by
/// [`crate::SharedRecvRequest::wait`] when no communicator is polling.
pub(crate) fn progress_shared(
    fabric: &InprocFabric,
    rank: Rank,
    shared: &InprocShared,
    out: &mut Vec<Completion>,
) {
    let mut mb = fabric.mailboxes[rank as usize].lock().unwrap();
    let mut kept = VecDeque::with_capacity(mb.unmatched.len());
    while let Some(msg) = mb.unmatched.pop_front() {
        match match_shared(shared, &msg) {
            Some(c) => out.push(c),
            None => kept.push_back(msg),
        }
    }
    mb.unmatched = kept;
}
