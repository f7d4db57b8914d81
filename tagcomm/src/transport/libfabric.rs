//! libfabric transport: tagged RDM endpoint, bootstrapped through MPI for
//! rank discovery and endpoint-address exchange.
//!
//! The provider's tag is only 64 bits with no source addressing we can
//! rely on across providers, so the sender rank is folded into the wire
//! tag: 16 rank bits above 24 tag bits (23 payload bits plus the reserved
//! control bit). Small sends take `fi_tinject`, which completes locally
//! before returning and produces no completion-queue entry; everything
//! else posts with a boxed, `#[repr(C)]` operation context whose leading
//! words are provider-owned scratch (`FI_CONTEXT2`). Completion-queue
//! entries are routed to the owning communicator's lock-free queue, same
//! as the UCX backend; the transmit queue is drained under try-lock so
//! concurrent pollers never serialize on it.

use std::collections::HashMap;
use std::io;
use std::mem;
use std::os::raw::c_void;
use std::ptr;
use std::sync::{Arc, Mutex};

use crossbeam_queue::SegQueue;
use slab::Slab;

use crate::config::Config;
use crate::context::Topology;
use crate::error::{fatal, Error, Result};
use crate::heap::{MemoryRegistry, RegHandle};
use crate::request::{Completion, CompletionKind, Direction, ReqFlags, RequestState};
use crate::tag::{Rank, Tag, ANY_SOURCE, RESERVED_TAG_BIT};
use crate::transport::mpi::MpiShared;
use crate::transport::{CancelOutcome, PostOutcome};

/// Payload tag bits on the wire; bit 23 carries the reserved-range flag.
const LF_RESERVED_WIRE_BIT: u64 = 1 << 23;
const LF_TAG_LIMIT: Tag = 1 << 23;
const LF_RANK_SHIFT: u32 = 24;
const LF_RANK_MASK: u64 = 0xffff;

/// Completion entries consumed per `fi_cq_read` call.
const CQ_CHUNK: usize = 16;

fn lf_tag_bits(tag: Tag) -> u64 {
    let mut t = (tag & (RESERVED_TAG_BIT - 1)) as u64 & (LF_RESERVED_WIRE_BIT - 1);
    if tag & RESERVED_TAG_BIT != 0 {
        t |= LF_RESERVED_WIRE_BIT;
    }
    t
}

fn lf_wire(tag: Tag, rank: Rank) -> u64 {
    ((rank as u64 & LF_RANK_MASK) << LF_RANK_SHIFT) | lf_tag_bits(tag)
}

fn lf_sender(wire: u64) -> Rank {
    ((wire >> LF_RANK_SHIFT) & LF_RANK_MASK) as Rank
}

/// (tag, ignore-mask) pair for a receive.
fn lf_recv_matcher(tag: Tag, src: Rank) -> (u64, u64) {
    if src == ANY_SOURCE {
        (lf_tag_bits(tag), LF_RANK_MASK << LF_RANK_SHIFT)
    } else {
        (lf_wire(tag, src), 0)
    }
}

/// Operation context handed to the provider. The leading scratch words are
/// provider-owned (`FI_CONTEXT2`); the layout therefore must not change.
#[repr(C)]
struct OpContext {
    scratch: [usize; 8],
    state: RequestState,
    queue: Arc<SegQueue<Routed>>,
}

struct Routed {
    state: RequestState,
    kind: CompletionKind,
}

struct Cq(*mut libfabric_sys::fid_cq);

unsafe impl Send for Cq {}

pub(crate) struct LfShared {
    mpi: Arc<MpiShared>,
    info: *mut libfabric_sys::fi_info,
    fabric: *mut libfabric_sys::fid_fabric,
    domain: *mut libfabric_sys::fid_domain,
    av: *mut libfabric_sys::fid_av,
    ep: *mut libfabric_sys::fid_ep,
    txcq: Mutex<Cq>,
    rxcq: Mutex<Cq>,
    addrs: Vec<libfabric_sys::fi_addr_t>,
    inject_limit: usize,
    shared_queue: Arc<SegQueue<Routed>>,
    rank: Rank,
    mrs: Mutex<HashMap<usize, *mut libfabric_sys::fid_mr>>,
}

unsafe impl Send for LfShared {}
unsafe impl Sync for LfShared {}

fn lf_check(what: &'static str, rc: i32) -> Result<()> {
    if rc >= 0 {
        Ok(())
    } else {
        Err(Error::Transport(what, rc))
    }
}

impl LfShared {
    pub(crate) fn init(config: &Config, thread_safe: bool) -> Result<Arc<Self>> {
        let mpi = MpiShared::init(thread_safe)?;
        let topology = mpi.topology();
        unsafe {
            let hints = libfabric_sys::fi_shim_allocinfo();
            (*hints).caps = libfabric_sys::FI_TAGGED;
            (*hints).mode = libfabric_sys::FI_CONTEXT | libfabric_sys::FI_CONTEXT2;
            (*(*hints).ep_attr).type_ = libfabric_sys::fi_ep_type_FI_EP_RDM;
            (*(*hints).domain_attr).threading = libfabric_sys::fi_threading_FI_THREAD_SAFE;

            let mut info: *mut libfabric_sys::fi_info = ptr::null_mut();
            let rc = libfabric_sys::fi_getinfo(
                libfabric_sys::fi_shim_version(),
                ptr::null(),
                ptr::null(),
                0,
                hints,
                &mut info,
            );
            libfabric_sys::fi_freeinfo(hints);
            lf_check("fi_getinfo", rc)?;

            let mut fabric: *mut libfabric_sys::fid_fabric = ptr::null_mut();
            lf_check(
                "fi_fabric",
                libfabric_sys::fi_fabric((*info).fabric_attr, &mut fabric, ptr::null_mut()),
            )?;
            let mut domain: *mut libfabric_sys::fid_domain = ptr::null_mut();
            lf_check(
                "fi_domain",
                libfabric_sys::fi_shim_domain(fabric, info, &mut domain),
            )?;

            let mut av_attr: libfabric_sys::fi_av_attr = mem::zeroed();
            av_attr.type_ = libfabric_sys::fi_av_type_FI_AV_TABLE;
            let mut av: *mut libfabric_sys::fid_av = ptr::null_mut();
            lf_check(
                "fi_av_open",
                libfabric_sys::fi_shim_av_open(domain, &mut av_attr, &mut av),
            )?;

            let mut cq_attr: libfabric_sys::fi_cq_attr = mem::zeroed();
            cq_attr.format = libfabric_sys::fi_cq_format_FI_CQ_FORMAT_TAGGED;
            let mut txcq: *mut libfabric_sys::fid_cq = ptr::null_mut();
            let mut rxcq: *mut libfabric_sys::fid_cq = ptr::null_mut();
            lf_check(
                "fi_cq_open",
                libfabric_sys::fi_shim_cq_open(domain, &mut cq_attr, &mut txcq),
            )?;
            lf_check(
                "fi_cq_open",
                libfabric_sys::fi_shim_cq_open(domain, &mut cq_attr, &mut rxcq),
            )?;

            let mut ep: *mut libfabric_sys::fid_ep = ptr::null_mut();
            lf_check(
                "fi_endpoint",
                libfabric_sys::fi_shim_endpoint(domain, info, &mut ep),
            )?;
            lf_check(
                "fi_ep_bind",
                libfabric_sys::fi_shim_ep_bind(ep, &mut (*av).fid, 0),
            )?;
            lf_check(
                "fi_ep_bind",
                libfabric_sys::fi_shim_ep_bind(ep, &mut (*txcq).fid, libfabric_sys::FI_TRANSMIT),
            )?;
            lf_check(
                "fi_ep_bind",
                libfabric_sys::fi_shim_ep_bind(ep, &mut (*rxcq).fid, libfabric_sys::FI_RECV),
            )?;
            lf_check("fi_enable", libfabric_sys::fi_shim_enable(ep))?;

            // Exchange endpoint names and populate the address vector; with
            // FI_AV_TABLE the inserted index is the fi_addr of that rank.
            let mut name = [0u8; 512];
            let mut name_len = name.len();
            lf_check(
                "fi_getname",
                libfabric_sys::fi_shim_getname(
                    &mut (*ep).fid,
                    name.as_mut_ptr() as *mut c_void,
                    &mut name_len,
                ),
            )?;
            let all = mpi.allgather_bytes(&name[..name_len])?;
            let mut addrs = vec![0 as libfabric_sys::fi_addr_t; all.len()];
            for (i, peer) in all.iter().enumerate() {
                let rc = libfabric_sys::fi_shim_av_insert(
                    av,
                    peer.as_ptr() as *const c_void,
                    1,
                    &mut addrs[i],
                );
                if rc != 1 {
                    return Err(Error::Transport("fi_av_insert", rc));
                }
            }

            let inject_limit = config.inject_size.min((*(*info).tx_attr).inject_size);

            Ok(Arc::new(Self {
                mpi,
                info,
                fabric,
                domain,
                av,
                ep,
                txcq: Mutex::new(Cq(txcq)),
                rxcq: Mutex::new(Cq(rxcq)),
                addrs,
                inject_limit,
                shared_queue: Arc::new(SegQueue::new()),
                rank: topology.rank(),
                mrs: Mutex::new(HashMap::new()),
            }))
        }
    }

    pub(crate) fn topology(&self) -> Topology {
        self.mpi.topology()
    }

    /// Memory registry backed by this domain; the heap registers every
    /// chunk through it.
    pub(crate) fn registry(self: &Arc<Self>) -> Box<dyn MemoryRegistry> {
        Box::new(LfRegistry {
            shared: self.clone(),
        })
    }

    /// Drain up to `batch` entries from one completion queue, routing each
    /// record to its owning queue.
    fn read_cq(&self, cq: &Cq, batch: usize) {
        unsafe {
            let mut entries: [libfabric_sys::fi_cq_tagged_entry; CQ_CHUNK] = mem::zeroed();
            let n = libfabric_sys::fi_shim_cq_read(
                cq.0,
                entries.as_mut_ptr() as *mut c_void,
                batch.min(CQ_CHUNK),
            );
            if n > 0 {
                for e in &entries[..n as usize] {
                    route(e.op_context, e.tag, CompletionKind::Completed);
                }
                return;
            }
            let n = n as i32;
            if n == -libfabric_sys::fi_shim_eagain() {
                return;
            }
            if n == -libfabric_sys::fi_shim_eavail() {
                let mut err: libfabric_sys::fi_cq_err_entry = mem::zeroed();
                let m = libfabric_sys::fi_shim_cq_readerr(cq.0, &mut err, 0);
                if m < 0 {
                    fatal(format_args!("fi_cq_readerr failed: {}", m));
                }
                if err.err as i32 == libfabric_sys::fi_shim_ecanceled() {
                    route(err.op_context, err.tag, CompletionKind::Canceled);
                } else {
                    fatal(format_args!(
                        "completion error: err={} prov_errno={}",
                        err.err, err.prov_errno
                    ));
                }
                return;
            }
            fatal(format_args!("fi_cq_read failed: {}", n));
        }
    }
}

/// Reclaim a posted operation context and hand the completion record to
/// the owning queue.
unsafe fn route(op_context: *mut c_void, wire_tag: u64, kind: CompletionKind) {
    let mut ctx = Box::from_raw(op_context as *mut OpContext);
    if matches!(kind, CompletionKind::Completed) && ctx.state.direction == Direction::Recv {
        ctx.state.peer = lf_sender(wire_tag);
    }
    let queue = ctx.queue.clone();
    queue.push(Routed {
        state: ctx.state,
        kind,
    });
}

impl Drop for LfShared {
    fn drop(&mut self) {
        unsafe {
            libfabric_sys::fi_shim_close(&mut (*self.ep).fid);
            libfabric_sys::fi_shim_close(&mut (*self.txcq.get_mut().unwrap().0).fid);
            libfabric_sys::fi_shim_close(&mut (*self.rxcq.get_mut().unwrap().0).fid);
            libfabric_sys::fi_shim_close(&mut (*self.av).fid);
            libfabric_sys::fi_shim_close(&mut (*self.domain).fid);
            libfabric_sys::fi_shim_close(&mut (*self.fabric).fid);
            libfabric_sys::fi_freeinfo(self.info);
        }
    }
}

struct LfRegistry {
    shared: Arc<LfShared>,
}

unsafe impl Send for LfRegistry {}
unsafe impl Sync for LfRegistry {}

impl MemoryRegistry for LfRegistry {
    fn register(&self, ptr: *mut u8, size: usize) -> io::Result<RegHandle> {
        unsafe {
            let mut mr: *mut libfabric_sys::fid_mr = std::ptr::null_mut();
            let rc = libfabric_sys::fi_shim_mr_reg(
                self.shared.domain,
                ptr as *const c_void,
                size,
                libfabric_sys::FI_SEND | libfabric_sys::FI_RECV,
                &mut mr,
            );
            if rc < 0 {
                return Err(io::Error::from_raw_os_error(-rc));
            }
            self.shared.mrs.lock().unwrap().insert(ptr as usize, mr);
            Ok(RegHandle {
                lkey: libfabric_sys::fi_shim_mr_desc(mr) as u64,
                rkey: libfabric_sys::fi_shim_mr_key(mr),
            })
        }
    }

    fn deregister(&self, ptr: *mut u8, _size: usize, _handle: RegHandle) {
        if let Some(mr) = self.shared.mrs.lock().unwrap().remove(&(ptr as usize)) {
            unsafe { libfabric_sys::fi_shim_close(&mut (*mr).fid) };
        }
    }
}

struct PendingOp {
    flags: Arc<ReqFlags>,
    ctx: *mut OpContext,
}

/// Per-communicator backend state.
pub(crate) struct LibfabricComm {
    shared: Arc<LfShared>,
    queue: Arc<SegQueue<Routed>>,
    pending: Slab<PendingOp>,
    stash: Vec<Completion>,
}

impl LibfabricComm {
    pub(crate) fn new(shared: Arc<LfShared>) -> Result<Self> {
        Ok(Self {
            shared,
            queue: Arc::new(SegQueue::new()),
            pending: Slab::new(),
            stash: Vec::new(),
        })
    }

    pub(crate) fn tag_limit(&self) -> Tag {
        LF_TAG_LIMIT
    }

    pub(crate) fn post_send(&mut self, state: RequestState) -> PostOutcome {
        let wire = lf_wire(state.tag, self.shared.rank);
        let addr = self.shared.addrs[state.peer as usize];
        let buf = state.buffer.ptr();
        let len = state.buffer.size();

        if len <= self.shared.inject_limit {
            // Eager path: the payload is consumed before the call returns
            // and no completion-queue entry is generated.
            loop {
                let rc = unsafe {
                    libfabric_sys::fi_shim_tinject(
                        self.shared.ep,
                        buf as *const c_void,
                        len,
                        addr,
                        wire,
                    )
                };
                if rc == 0 {
                    return PostOutcome::Immediate(state);
                }
                if rc as i32 == -unsafe { libfabric_sys::fi_shim_eagain() } {
                    self.drain_tx();
                    continue;
                }
                fatal(format_args!("fi_tinject failed: {}", rc));
            }
        }

        let desc = state.buffer.reg_handle().lkey as *mut c_void;
        let flags = state.flags.clone();
        let ctx = Box::into_raw(Box::new(OpContext {
            scratch: [0; 8],
            state,
            queue: self.queue.clone(),
        }));
        loop {
            let rc = unsafe {
                libfabric_sys::fi_shim_tsend(
                    self.shared.ep,
                    buf as *const c_void,
                    len,
                    desc,
                    addr,
                    wire,
                    ctx as *mut c_void,
                )
            };
            if rc == 0 {
                let key = self.pending.insert(PendingOp {
                    flags: flags.clone(),
                    ctx,
                });
                flags.set_index(key);
                return PostOutcome::Pending;
            }
            if rc as i32 == -unsafe { libfabric_sys::fi_shim_eagain() } {
                self.drain_tx();
                continue;
            }
            fatal(format_args!("fi_tsend failed: {}", rc));
        }
    }

    pub(crate) fn post_recv(&mut self, state: RequestState) -> PostOutcome {
        self.start_recv(state, false)
    }

    pub(crate) fn post_shared_recv(&mut self, state: RequestState) -> PostOutcome {
        self.start_recv(state, true)
    }

    fn start_recv(&mut self, state: RequestState, shared: bool) -> PostOutcome {
        let (wire, ignore) = lf_recv_matcher(state.tag, state.peer);
        let addr = if state.peer == ANY_SOURCE {
            unsafe { libfabric_sys::fi_shim_addr_unspec() }
        } else {
            self.shared.addrs[state.peer as usize]
        };
        let buf = state.buffer.ptr();
        let len = state.buffer.size();
        let desc = state.buffer.reg_handle().lkey as *mut c_void;
        let flags = state.flags.clone();
        let queue = if shared {
            self.shared.shared_queue.clone()
        } else {
            self.queue.clone()
        };
        let ctx = Box::into_raw(Box::new(OpContext {
            scratch: [0; 8],
            state,
            queue,
        }));
        loop {
            let rc = unsafe {
                libfabric_sys::fi_shim_trecv(
                    self.shared.ep,
                    buf as *mut c_void,
                    len,
                    desc,
                    addr,
                    wire,
                    ignore,
                    ctx as *mut c_void,
                )
            };
            if rc == 0 {
                if !shared {
                    let key = self.pending.insert(PendingOp {
                        flags: flags.clone(),
                        ctx,
                    });
                    flags.set_index(key);
                }
                return PostOutcome::Pending;
            }
            if rc as i32 == -unsafe { libfabric_sys::fi_shim_eagain() } {
                self.drain_rx();
                continue;
            }
            fatal(format_args!("fi_trecv failed: {}", rc));
        }
    }

    fn drain_tx(&self) {
        if let Ok(cq) = self.shared.txcq.try_lock() {
            self.shared.read_cq(&cq, CQ_CHUNK);
        }
    }

    fn drain_rx(&self) {
        let cq = self.shared.rxcq.lock().unwrap();
        self.shared.read_cq(&cq, CQ_CHUNK);
    }

    pub(crate) fn poll(&mut self, out: &mut Vec<Completion>, batch: usize) {
        out.append(&mut self.stash);
        self.drain_tx();
        {
            let cq = self.shared.rxcq.lock().unwrap();
            self.shared.read_cq(&cq, batch);
        }
        while let Some(r) = self.queue.pop() {
            out.push(self.settle(r));
        }
        while let Some(r) = self.shared.shared_queue.pop() {
            out.push(Completion {
                state: r.state,
                kind: r.kind,
            });
        }
    }

    fn settle(&mut self, r: Routed) -> Completion {
        let key = r.state.flags.index();
        if self.pending.contains(key) && Arc::ptr_eq(&self.pending[key].flags, &r.state.flags) {
            self.pending.remove(key);
        }
        Completion {
            state: r.state,
            kind: r.kind,
        }
    }

    pub(crate) fn cancel_recv(&mut self, flags: &Arc<ReqFlags>) -> CancelOutcome {
        let key = flags.index();
        if !self.pending.contains(key) || !Arc::ptr_eq(&self.pending[key].flags, flags) {
            return CancelOutcome::NotFound;
        }
        let ctx = self.pending[key].ctx;
        unsafe {
            libfabric_sys::fi_shim_cancel(&mut (*self.shared.ep).fid, ctx as *mut c_void);
        }
        // The provider reports the outcome on the receive queue: either an
        // FI_ECANCELED error entry or the delivered message.
        loop {
            self.drain_rx();
            while let Some(r) = self.queue.pop() {
                let ours = Arc::ptr_eq(&r.state.flags, flags);
                let c = self.settle(r);
                if ours {
                    return match c.kind {
                        CompletionKind::Canceled => CancelOutcome::Confirmed(c.state),
                        CompletionKind::Completed => CancelOutcome::CompletedInstead(c.state),
                    };
                }
                self.stash.push(c);
            }
            std::hint::spin_loop();
        }
    }
}

/// Progress pass over only the context's shared receives.
pub(crate) fn progress_shared(shared: &LfShared, out: &mut Vec<Completion>) {
    {
        let cq = shared.rxcq.lock().unwrap();
        shared.read_cq(&cq, CQ_CHUNK);
    }
    while let Some(r) = shared.shared_queue.pop() {
        out.push(Completion {
            state: r.state,
            kind: r.kind,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_tag_layout() {
        assert_eq!(lf_wire(5, 3), (3 << 24) | 5);
        assert_eq!(lf_sender(lf_wire(5, 3)), 3);
        // Reserved-range tags land on wire bit 23.
        assert_eq!(lf_tag_bits(RESERVED_TAG_BIT | 7), (1 << 23) | 7);
    }

    #[test]
    fn test_any_source_ignores_rank_bits() {
        let (tag, ignore) = lf_recv_matcher(9, ANY_SOURCE);
        let from_a = lf_wire(9, 1);
        let from_b = lf_wire(9, 14);
        assert_eq!(from_a & !ignore, tag);
        assert_eq!(from_b & !ignore, tag);
        let (exact, ignore) = lf_recv_matcher(9, 1);
        assert_eq!(ignore, 0);
        assert_eq!(exact, from_a);
        assert_ne!(exact, from_b);
    }
}
