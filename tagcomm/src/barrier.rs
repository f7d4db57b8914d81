//! Barrier across all ranks and all communicator threads of a job.
//!
//! Two-level: a two-counter in-node barrier synchronizes the threads of
//! one rank, then a single elected thread runs a dissemination barrier
//! across ranks using one-byte sentinel messages on reserved tags. All
//! waiting spins on `progress()`, so outstanding callbacks keep firing
//! while threads sit in the barrier.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::communicator::Communicator;
use crate::context::Context;
use crate::error::fatal;
use crate::message::MessageBuffer;
use crate::tag::{Rank, Tag};

struct BarrierInner {
    ctx: Context,
    n_threads: usize,
    count1: AtomicUsize,
    count2: AtomicUsize,
    /// Invocation parity, folded into the sentinel tags so a rank that
    /// races ahead into the next barrier cannot satisfy this one.
    epoch: AtomicUsize,
}

/// A reusable barrier handle. Clone it into every participating thread;
/// each thread calls [`sync`](Barrier::sync) with its own communicator.
#[derive(Clone)]
pub struct Barrier {
    inner: Arc<BarrierInner>,
}

impl Barrier {
    pub(crate) fn new(ctx: Context, n_threads: usize) -> Self {
        assert!(n_threads >= 1, "barrier needs at least one thread");
        Self {
            inner: Arc::new(BarrierInner {
                ctx,
                n_threads,
                count1: AtomicUsize::new(0),
                count2: AtomicUsize::new(0),
                epoch: AtomicUsize::new(0),
            }),
        }
    }

    /// Block (spinning on progress) until every thread of every rank has
    /// arrived.
    pub fn sync(&self, comm: &Communicator) {
        if self.arrive(&self.inner.count1, comm) {
            self.rank_barrier(comm);
        }
        self.arrive(&self.inner.count2, comm);
    }

    /// Synchronize only the threads of this rank.
    pub fn in_node(&self, comm: &Communicator) {
        self.arrive(&self.inner.count1, comm);
        self.arrive(&self.inner.count2, comm);
    }

    /// Synchronize only across ranks (call from exactly one thread per
    /// rank).
    pub fn rank_barrier(&self, comm: &Communicator) {
        let size = comm.size();
        if size <= 1 {
            return;
        }
        let rank = comm.rank();
        let phase = (self.inner.epoch.fetch_add(1, Ordering::AcqRel) & 1) as Tag;
        let mut dist: Rank = 1;
        let mut round: Tag = 0;
        while dist < size {
            let to = (rank + dist) % size;
            let from = (rank + size - dist) % size;
            let tag = comm.reserved((round << 1) | phase);
            let sbuf = self.sentinel();
            let mut rbuf = self.sentinel();
            let s = comm.send(&sbuf, to, tag);
            let r = comm.recv(&mut rbuf, from, tag);
            s.wait();
            r.wait();
            dist <<= 1;
            round += 1;
        }
    }

    /// One step of the two-counter scheme: the last thread to arrive
    /// resets the counter and is elected; the rest spin on progress until
    /// the reset.
    fn arrive(&self, count: &AtomicUsize, comm: &Communicator) -> bool {
        if count.fetch_add(1, Ordering::AcqRel) + 1 == self.inner.n_threads {
            count.store(0, Ordering::Release);
            true
        } else {
            while count.load(Ordering::Acquire) != 0 {
                comm.progress();
                std::hint::spin_loop();
            }
            false
        }
    }

    fn sentinel(&self) -> MessageBuffer<u8> {
        match self.inner.ctx.make_buffer::<u8>(1) {
            Ok(b) => b,
            Err(e) => fatal(format_args!("barrier sentinel allocation failed: {}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextBuilder;
    use crate::transport::inproc::InprocFabric;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_in_node_threads() {
        let fabric = InprocFabric::new(1);
        let ctx = ContextBuilder::inproc(fabric, 0).build().unwrap();
        let barrier = ctx.barrier(3);
        let arrived = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let ctx = ctx.clone();
                let barrier = barrier.clone();
                let arrived = arrived.clone();
                std::thread::spawn(move || {
                    let comm = ctx.communicator().unwrap();
                    for i in 0..50usize {
                        arrived.fetch_add(1, Ordering::SeqCst);
                        barrier.sync(&comm);
                        assert!(arrived.load(Ordering::SeqCst) >= 3 * (i + 1));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(arrived.load(Ordering::SeqCst), 150);
    }

    #[test]
    fn test_rank_barrier_releases_all_ranks() {
        let fabric = InprocFabric::new(4);
        let arrived = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|rank| {
                let fabric = fabric.clone();
                let arrived = arrived.clone();
                std::thread::spawn(move || {
                    let ctx = ContextBuilder::inproc(fabric, rank).build().unwrap();
                    let comm = ctx.communicator().unwrap();
                    let barrier = ctx.barrier(1);
                    for i in 0..20usize {
                        arrived.fetch_add(1, Ordering::SeqCst);
                        barrier.sync(&comm);
                        assert!(arrived.load(Ordering::SeqCst) >= 4 * (i + 1));
                    }
                    comm.wait_all();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
