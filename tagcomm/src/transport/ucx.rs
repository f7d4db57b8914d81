//! UCX transport: 64-bit wire tags over `ucp_tag_send_nbx` /
//! `ucp_tag_recv_nbx`, bootstrapped through MPI for rank discovery and
//! worker-address exchange.
//!
//! One serialized ucp worker is shared by every communicator of the
//! context, guarded by a mutex. Native completion callbacks run inside
//! `ucp_worker_progress` (so under the worker lock, possibly on another
//! communicator's thread); they do nothing but route the completion record
//! to the owning communicator's lock-free queue. The owning communicator
//! drains its queue on its own progress pass and fires the user callback
//! there, which keeps the exactly-once, owner-thread delivery contract.

use std::mem;
use std::os::raw::c_void;
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam_queue::SegQueue;
use slab::Slab;

use crate::config::Config;
use crate::context::Topology;
use crate::error::{fatal, Error, Result};
use crate::request::{Completion, CompletionKind, ReqFlags, RequestState};
use crate::tag::{wire_tag, Rank, Tag, ANY_SOURCE, MATCH_ANY_SOURCE, MATCH_EXACT, RESERVED_TAG_BIT};
use crate::transport::mpi::MpiShared;
use crate::transport::{CancelOutcome, PostOutcome};

/// Completion record routed from a native callback to the owning
/// communicator (or to the context's shared-receive queue).
struct Routed {
    state: RequestState,
    kind: CompletionKind,
    /// The ucp request to free once drained; null for none.
    req: *mut c_void,
}

// The raw request pointer is only touched under the worker lock.
unsafe impl Send for Routed {}

/// Callback context handed to UCX as `user_data`, one box per operation.
struct CbRecord {
    state: RequestState,
    queue: Arc<SegQueue<Routed>>,
}

struct WorkerState {
    worker: ucx_sys::ucp_worker_h,
    eps: Vec<ucx_sys::ucp_ep_h>,
}

unsafe impl Send for WorkerState {}

pub(crate) struct UcxShared {
    mpi: Arc<MpiShared>,
    context: ucx_sys::ucp_context_h,
    worker: Mutex<WorkerState>,
    shared_queue: Arc<SegQueue<Routed>>,
    rank: Rank,
}

unsafe impl Send for UcxShared {}
unsafe impl Sync for UcxShared {}

fn status_name(status: ucx_sys::ucs_status_t) -> i32 {
    status as i32
}

/// `nbx` calls return error statuses as small negative values cast to a
/// pointer.
fn is_err_ptr(p: *mut c_void) -> bool {
    (p as isize) < 0
}

unsafe extern "C" fn on_send(
    request: *mut c_void,
    status: ucx_sys::ucs_status_t,
    user_data: *mut c_void,
) {
    let rec = Box::from_raw(user_data as *mut CbRecord);
    let kind = match status_name(status) {
        0 => CompletionKind::Completed,
        s if s == ucx_sys::ucs_status_t_UCS_ERR_CANCELED as i32 => CompletionKind::Canceled,
        s => fatal(format_args!("ucp send completed with status {}", s)),
    };
    rec.queue.push(Routed {
        state: rec.state,
        kind,
        req: request,
    });
}

unsafe extern "C" fn on_recv(
    request: *mut c_void,
    status: ucx_sys::ucs_status_t,
    tag_info: *const ucx_sys::ucp_tag_recv_info_t,
    user_data: *mut c_void,
) {
    let mut rec = Box::from_raw(user_data as *mut CbRecord);
    let kind = match status_name(status) {
        0 => {
            rec.state.peer = ((*tag_info).sender_tag & 0xffff_ffff) as Rank;
            CompletionKind::Completed
        }
        s if s == ucx_sys::ucs_status_t_UCS_ERR_CANCELED as i32 => CompletionKind::Canceled,
        s => fatal(format_args!("ucp recv completed with status {}", s)),
    };
    rec.queue.push(Routed {
        state: rec.state,
        kind,
        req: request,
    });
}

impl UcxShared {
    pub(crate) fn init(_config: &Config, thread_safe: bool) -> Result<Arc<Self>> {
        let mpi = MpiShared::init(thread_safe)?;
        let topology = mpi.topology();
        unsafe {
            let mut params: ucx_sys::ucp_params_t = mem::zeroed();
            params.field_mask = ucx_sys::ucp_params_field_UCP_PARAM_FIELD_FEATURES as u64;
            params.features = ucx_sys::ucp_feature_UCP_FEATURE_TAG as u64;
            let mut context: ucx_sys::ucp_context_h = ptr::null_mut();
            let status = ucx_sys::ucp_init_version(
                ucx_sys::UCP_API_MAJOR,
                ucx_sys::UCP_API_MINOR,
                &params,
                ptr::null(),
                &mut context,
            );
            if status_name(status) != 0 {
                return Err(Error::Transport("ucp_init", status_name(status)));
            }

            let mut wparams: ucx_sys::ucp_worker_params_t = mem::zeroed();
            wparams.field_mask =
                ucx_sys::ucp_worker_params_field_UCP_WORKER_PARAM_FIELD_THREAD_MODE as u64;
            // All worker access is behind our own mutex.
            wparams.thread_mode = ucx_sys::ucs_thread_mode_t_UCS_THREAD_MODE_SERIALIZED;
            let mut worker: ucx_sys::ucp_worker_h = ptr::null_mut();
            let status = ucx_sys::ucp_worker_create(context, &wparams, &mut worker);
            if status_name(status) != 0 {
                ucx_sys::ucp_cleanup(context);
                return Err(Error::Transport("ucp_worker_create", status_name(status)));
            }

            // Exchange worker addresses over MPI and connect an endpoint
            // to every rank.
            let mut addr: *mut ucx_sys::ucp_address_t = ptr::null_mut();
            let mut addr_len: usize = 0;
            let status = ucx_sys::ucp_worker_get_address(worker, &mut addr, &mut addr_len);
            if status_name(status) != 0 {
                return Err(Error::Transport(
                    "ucp_worker_get_address",
                    status_name(status),
                ));
            }
            let mine = std::slice::from_raw_parts(addr as *const u8, addr_len).to_vec();
            let all = mpi.allgather_bytes(&mine);
            ucx_sys::ucp_worker_release_address(worker, addr);
            let all = all?;

            let mut eps = Vec::with_capacity(all.len());
            for peer_addr in &all {
                let mut ep_params: ucx_sys::ucp_ep_params_t = mem::zeroed();
                ep_params.field_mask =
                    ucx_sys::ucp_ep_params_field_UCP_EP_PARAM_FIELD_REMOTE_ADDRESS as u64;
                ep_params.address = peer_addr.as_ptr() as *const ucx_sys::ucp_address_t;
                let mut ep: ucx_sys::ucp_ep_h = ptr::null_mut();
                let status = ucx_sys::ucp_ep_create(worker, &ep_params, &mut ep);
                if status_name(status) != 0 {
                    return Err(Error::Transport("ucp_ep_create", status_name(status)));
                }
                eps.push(ep);
            }

            Ok(Arc::new(Self {
                mpi,
                context,
                worker: Mutex::new(WorkerState { worker, eps }),
                shared_queue: Arc::new(SegQueue::new()),
                rank: topology.rank(),
            }))
        }
    }

    pub(crate) fn topology(&self) -> Topology {
        self.mpi.topology()
    }

    fn lock_worker(&self) -> MutexGuard<'_, WorkerState> {
        self.worker.lock().unwrap()
    }
}

impl Drop for UcxShared {
    fn drop(&mut self) {
        unsafe {
            let ws = self.worker.get_mut().unwrap();
            for &ep in &ws.eps {
                ucx_sys::ucp_ep_destroy(ep);
            }
            ucx_sys::ucp_worker_destroy(ws.worker);
            ucx_sys::ucp_cleanup(self.context);
        }
    }
}

struct PendingOp {
    flags: Arc<ReqFlags>,
    req: *mut c_void,
}

/// Per-communicator backend state.
pub(crate) struct UcxComm {
    shared: Arc<UcxShared>,
    queue: Arc<SegQueue<Routed>>,
    /// Outstanding operations by slab key (`ReqFlags::index`), kept so
    /// cancellation can find the native request.
    pending: Slab<PendingOp>,
    /// Completions discovered while draining for a cancellation, replayed
    /// on the next poll.
    stash: Vec<Completion>,
}

impl UcxComm {
    pub(crate) fn new(shared: Arc<UcxShared>) -> Result<Self> {
        Ok(Self {
            shared,
            queue: Arc::new(SegQueue::new()),
            pending: Slab::new(),
            stash: Vec::new(),
        })
    }

    pub(crate) fn tag_limit(&self) -> Tag {
        RESERVED_TAG_BIT
    }

    pub(crate) fn post_send(&mut self, state: RequestState) -> PostOutcome {
        let wtag = wire_tag(state.tag, self.shared.rank);
        let dst = state.peer as usize;
        let buf = state.buffer.ptr();
        let size = state.buffer.size();
        let flags = state.flags.clone();
        let rec = Box::into_raw(Box::new(CbRecord {
            state,
            queue: self.queue.clone(),
        }));
        unsafe {
            let mut param: ucx_sys::ucp_request_param_t = mem::zeroed();
            param.op_attr_mask = (ucx_sys::ucp_op_attr_t_UCP_OP_ATTR_FIELD_CALLBACK
                | ucx_sys::ucp_op_attr_t_UCP_OP_ATTR_FIELD_USER_DATA)
                as u32;
            param.cb.send = Some(on_send);
            param.user_data = rec as *mut c_void;

            let ws = self.shared.lock_worker();
            let req = ucx_sys::ucp_tag_send_nbx(ws.eps[dst], buf as *const c_void, size, wtag, &param);
            drop(ws);
            self.finish_post(req, rec, flags)
        }
    }

    pub(crate) fn post_recv(&mut self, state: RequestState) -> PostOutcome {
        self.start_recv(state, false)
    }

    pub(crate) fn post_shared_recv(&mut self, state: RequestState) -> PostOutcome {
        self.start_recv(state, true)
    }

    fn start_recv(&mut self, state: RequestState, shared: bool) -> PostOutcome {
        let (wtag, mask) = if state.peer == ANY_SOURCE {
            (wire_tag(state.tag, 0), MATCH_ANY_SOURCE)
        } else {
            (wire_tag(state.tag, state.peer), MATCH_EXACT)
        };
        let buf = state.buffer.ptr();
        let size = state.buffer.size();
        let flags = state.flags.clone();
        let queue = if shared {
            self.shared.shared_queue.clone()
        } else {
            self.queue.clone()
        };
        let rec = Box::into_raw(Box::new(CbRecord { state, queue }));
        unsafe {
            let mut info: ucx_sys::ucp_tag_recv_info_t = mem::zeroed();
            let mut param: ucx_sys::ucp_request_param_t = mem::zeroed();
            param.op_attr_mask = (ucx_sys::ucp_op_attr_t_UCP_OP_ATTR_FIELD_CALLBACK
                | ucx_sys::ucp_op_attr_t_UCP_OP_ATTR_FIELD_USER_DATA
                | ucx_sys::ucp_op_attr_t_UCP_OP_ATTR_FIELD_RECV_INFO)
                as u32;
            param.cb.recv = Some(on_recv);
            param.user_data = rec as *mut c_void;
            param.recv_info.tag_info = &mut info;

            let ws = self.shared.lock_worker();
            let req =
                ucx_sys::ucp_tag_recv_nbx(ws.worker, buf as *mut c_void, size, wtag, mask, &param);
            drop(ws);

            if req.is_null() {
                // Completed inline; the callback is not invoked, reclaim
                // the record and fix the source from the recv info.
                let mut rec = Box::from_raw(rec);
                rec.state.peer = (info.sender_tag & 0xffff_ffff) as Rank;
                return PostOutcome::Immediate(rec.state);
            }
            if is_err_ptr(req) {
                fatal(format_args!("ucp_tag_recv_nbx failed: {}", req as isize));
            }
            if !shared {
                let key = self.pending.insert(PendingOp { flags: flags.clone(), req });
                flags.set_index(key);
            }
            PostOutcome::Pending
        }
    }

    unsafe fn finish_post(
        &mut self,
        req: *mut c_void,
        rec: *mut CbRecord,
        flags: Arc<ReqFlags>,
    ) -> PostOutcome {
        if req.is_null() {
            let rec = Box::from_raw(rec);
            return PostOutcome::Immediate(rec.state);
        }
        if is_err_ptr(req) {
            fatal(format_args!("ucp_tag_send_nbx failed: {}", req as isize));
        }
        let key = self.pending.insert(PendingOp { flags: flags.clone(), req });
        flags.set_index(key);
        PostOutcome::Pending
    }

    pub(crate) fn poll(&mut self, out: &mut Vec<Completion>, batch: usize) {
        out.append(&mut self.stash);
        let shared = self.shared.clone();
        let ws = shared.lock_worker();
        for _ in 0..batch {
            if unsafe { ucx_sys::ucp_worker_progress(ws.worker) } == 0 {
                break;
            }
        }
        while let Some(r) = self.queue.pop() {
            out.push(self.settle(r));
        }
        // Shared receives are delivered by whichever communicator
        // progresses first.
        while let Some(r) = self.shared.shared_queue.pop() {
            if !r.req.is_null() {
                unsafe { ucx_sys::ucp_request_free(r.req) };
            }
            out.push(Completion {
                state: r.state,
                kind: r.kind,
            });
        }
        drop(ws);
    }

    /// Free the native request and drop the pending-table entry.
    fn settle(&mut self, r: Routed) -> Completion {
        if !r.req.is_null() {
            unsafe { ucx_sys::ucp_request_free(r.req) };
        }
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
        let req = self.pending[key].req;
        let shared = self.shared.clone();
        let ws = shared.lock_worker();
        unsafe { ucx_sys::ucp_request_cancel(ws.worker, req) };
        // Drive the worker until this operation's record surfaces: it
        // completes either canceled or delivered, never neither.
        loop {
            unsafe { ucx_sys::ucp_worker_progress(ws.worker) };
            while let Some(r) = self.queue.pop() {
                let ours = Arc::ptr_eq(&r.state.flags, flags);
                let c = self.settle(r);
                if ours {
                    drop(ws);
                    return match c.kind {
                        CompletionKind::Canceled => CancelOutcome::Confirmed(c.state),
                        CompletionKind::Completed => CancelOutcome::CompletedInstead(c.state),
                    };
                }
                self.stash.push(c);
            }
        }
    }
}

/// Progress pass over only the context's shared receives.
pub(crate) fn progress_shared(shared: &UcxShared, out: &mut Vec<Completion>) {
    let ws = shared.lock_worker();
    unsafe { ucx_sys::ucp_worker_progress(ws.worker) };
    while let Some(r) = shared.shared_queue.pop() {
        if !r.req.is_null() {
            unsafe { ucx_sys::ucp_request_free(r.req) };
        }
        out.push(Completion {
            state: r.state,
            kind: r.kind,
        });
    }
    drop(ws);
}
