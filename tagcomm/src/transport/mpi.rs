//! MPI transport: native (rank, tag) envelope matching, completion
//! detection via `MPI_Testsome` with swap-from-back compaction of the
//! pending request array.
//!
//! Tags map 1:1 onto MPI tags, so the library's full tag space (including
//! the reserved control range) must fit below `MPI_TAG_UB`; this is
//! checked once at init. Receive cancellation uses `MPI_Cancel`, which MPI
//! defines for receives exactly as the request model needs it: either the
//! cancel wins or the message was already delivered.

use std::mem;
use std::os::raw::{c_int, c_void};
use std::ptr;
use std::sync::{Arc, Mutex};

use crate::context::Topology;
use crate::error::{fatal, Error, Result};
use crate::request::{Completion, CompletionKind, Direction, ReqFlags, RequestState};
use crate::tag::{Rank, ANY_SOURCE, RESERVED_TAG_BIT};
use crate::transport::{CancelOutcome, PostOutcome};

fn check(what: &'static str, rc: c_int) -> Result<()> {
    if rc == mpi_sys::tc_success() {
        Ok(())
    } else {
        Err(Error::Transport(what, rc))
    }
}

fn check_fatal(what: &str, rc: c_int) {
    if rc != mpi_sys::tc_success() {
        fatal(format_args!("{} failed with MPI error {}", what, rc));
    }
}

/// Process-wide MPI state: the duplicated communicator, the topology, and
/// the context-level shared-receive set.
pub(crate) struct MpiShared {
    comm: mpi_sys::MPI_Comm,
    rank: Rank,
    size: Rank,
    local: Vec<Rank>,
    finalize: bool,
    shared_pending: Mutex<PendingSet>,
}

// MPI_Comm is an opaque handle; all uses go through MPI calls, which are
// thread-safe at the level negotiated in `init`.
unsafe impl Send for MpiShared {}
unsafe impl Sync for MpiShared {}

impl MpiShared {
    pub(crate) fn init(thread_safe: bool) -> Result<Arc<Self>> {
        unsafe {
            let mut inited: c_int = 0;
            check("MPI_Initialized", mpi_sys::MPI_Initialized(&mut inited))?;
            let required = if thread_safe {
                mpi_sys::tc_thread_multiple()
            } else {
                mpi_sys::tc_thread_funneled()
            };
            let mut finalize = false;
            if inited == 0 {
                let mut provided: c_int = 0;
                check(
                    "MPI_Init_thread",
                    mpi_sys::MPI_Init_thread(
                        ptr::null_mut(),
                        ptr::null_mut(),
                        required,
                        &mut provided,
                    ),
                )?;
                if provided < required {
                    return Err(Error::ThreadSafetyUnsupported);
                }
                finalize = true;
            } else if thread_safe {
                let mut provided: c_int = 0;
                check("MPI_Query_thread", mpi_sys::MPI_Query_thread(&mut provided))?;
                if provided < mpi_sys::tc_thread_multiple() {
                    return Err(Error::ThreadSafetyUnsupported);
                }
            }

            let mut comm: mpi_sys::MPI_Comm = mem::zeroed();
            check(
                "MPI_Comm_dup",
                mpi_sys::MPI_Comm_dup(mpi_sys::tc_comm_world(), &mut comm),
            )?;

            let mut rank: c_int = 0;
            let mut size: c_int = 0;
            check("MPI_Comm_rank", mpi_sys::MPI_Comm_rank(comm, &mut rank))?;
            check("MPI_Comm_size", mpi_sys::MPI_Comm_size(comm, &mut size))?;

            // The full tag space including the reserved control range must
            // be expressible as a native MPI tag.
            let mut tag_ub_ptr: *mut c_int = ptr::null_mut();
            let mut flag: c_int = 0;
            check(
                "MPI_Comm_get_attr",
                mpi_sys::MPI_Comm_get_attr(
                    comm,
                    mpi_sys::tc_tag_ub_key(),
                    &mut tag_ub_ptr as *mut *mut c_int as *mut c_void,
                    &mut flag,
                ),
            )?;
            let tag_ub = if flag != 0 { *tag_ub_ptr } else { 0 };
            if tag_ub < i32::MAX {
                return Err(Error::Transport("MPI_TAG_UB below required tag range", tag_ub));
            }

            let local = local_ranks(comm, rank)?;

            Ok(Arc::new(Self {
                comm,
                rank,
                size,
                local,
                finalize,
                shared_pending: Mutex::new(PendingSet::new()),
            }))
        }
    }

    pub(crate) fn topology(&self) -> Topology {
        Topology::new(self.rank, self.size, self.local.clone())
    }

    /// The duplicated communicator, for transports that bootstrap over MPI.
    #[cfg(any(feature = "ucx", feature = "libfabric"))]
    pub(crate) fn raw_comm(&self) -> mpi_sys::MPI_Comm {
        self.comm
    }

    /// Allgather one variable-length byte blob per rank, used to exchange
    /// endpoint addresses at transport bootstrap.
    #[cfg(any(feature = "ucx", feature = "libfabric"))]
    pub(crate) fn allgather_bytes(&self, mine: &[u8]) -> Result<Vec<Vec<u8>>> {
        unsafe {
            let n = self.size as usize;
            let len = mine.len() as c_int;
            let mut lens = vec![0 as c_int; n];
            check(
                "MPI_Allgather",
                mpi_sys::MPI_Allgather(
                    &len as *const c_int as *const c_void,
                    1,
                    mpi_sys::tc_int(),
                    lens.as_mut_ptr() as *mut c_void,
                    1,
                    mpi_sys::tc_int(),
                    self.comm,
                ),
            )?;
            let mut displs = vec![0 as c_int; n];
            let mut total = 0 as c_int;
            for i in 0..n {
                displs[i] = total;
                total += lens[i];
            }
            let mut flat = vec![0u8; total as usize];
            check(
                "MPI_Allgatherv",
                mpi_sys::MPI_Allgatherv(
                    mine.as_ptr() as *const c_void,
                    len,
                    mpi_sys::tc_byte(),
                    flat.as_mut_ptr() as *mut c_void,
                    lens.as_ptr(),
                    displs.as_ptr(),
                    mpi_sys::tc_byte(),
                    self.comm,
                ),
            )?;
            Ok((0..n)
                .map(|i| {
                    let start = displs[i] as usize;
                    flat[start..start + lens[i] as usize].to_vec()
                })
                .collect())
        }
    }
}

impl Drop for MpiShared {
    fn drop(&mut self) {
        unsafe {
            mpi_sys::MPI_Comm_free(&mut self.comm);
            if self.finalize {
                mpi_sys::MPI_Finalize();
            }
        }
    }
}

/// World ranks sharing this node, discovered by splitting on shared memory
/// and allgathering world ranks over the node communicator.
unsafe fn local_ranks(comm: mpi_sys::MPI_Comm, rank: c_int) -> Result<Vec<Rank>> {
    let mut node: mpi_sys::MPI_Comm = mem::zeroed();
    check(
        "MPI_Comm_split_type",
        mpi_sys::MPI_Comm_split_type(
            comm,
            mpi_sys::tc_comm_type_shared(),
            rank,
            mpi_sys::tc_info_null(),
            &mut node,
        ),
    )?;
    let mut node_size: c_int = 0;
    check("MPI_Comm_size", mpi_sys::MPI_Comm_size(node, &mut node_size))?;
    let mut local = vec![0 as Rank; node_size as usize];
    let rc = mpi_sys::MPI_Allgather(
        &rank as *const c_int as *const c_void,
        1,
        mpi_sys::tc_int(),
        local.as_mut_ptr() as *mut c_void,
        1,
        mpi_sys::tc_int(),
        node,
    );
    mpi_sys::MPI_Comm_free(&mut node);
    check("MPI_Allgather", rc)?;
    local.sort_unstable();
    Ok(local)
}

/// Parallel arrays of outstanding MPI requests and their states; completed
/// slots found by `MPI_Testsome` are swap-removed from the back.
/// `ReqFlags::index` tracks each operation's current slot.
struct PendingSet {
    reqs: Vec<mpi_sys::MPI_Request>,
    states: Vec<RequestState>,
}

impl PendingSet {
    fn new() -> Self {
        Self {
            reqs: Vec::new(),
            states: Vec::new(),
        }
    }

    fn push(&mut self, req: mpi_sys::MPI_Request, state: RequestState) {
        state.flags.set_index(self.states.len());
        self.reqs.push(req);
        self.states.push(state);
    }

    fn poll(&mut self, out: &mut Vec<Completion>) {
        let n = self.reqs.len();
        if n == 0 {
            return;
        }
        let mut indices = vec![0 as c_int; n];
        let mut statuses: Vec<mpi_sys::MPI_Status> = vec![unsafe { mem::zeroed() }; n];
        let mut outcount: c_int = 0;
        let rc = unsafe {
            mpi_sys::MPI_Testsome(
                n as c_int,
                self.reqs.as_mut_ptr(),
                &mut outcount,
                indices.as_mut_ptr(),
                statuses.as_mut_ptr(),
            )
        };
        check_fatal("MPI_Testsome", rc);
        if outcount <= 0 || outcount == mpi_sys::tc_undefined() {
            return;
        }

        let mut completed: Vec<(usize, c_int)> = (0..outcount as usize)
            .map(|k| (indices[k] as usize, statuses[k].MPI_SOURCE))
            .collect();
        // Highest index first: the slot swapped in from the back is then
        // never itself a completed one, so each survivor moves at most
        // once and the pass costs O(completions), not O(queue).
        completed.sort_unstable_by(|a, b| b.0.cmp(&a.0));
        for (i, source) in completed {
            self.complete_at(i, source, out);
        }
    }

    /// Swap-remove slot `i` as completed, fixing up the index of the
    /// request swapped into its place.
    fn complete_at(&mut self, i: usize, source: c_int, out: &mut Vec<Completion>) {
        self.reqs.swap_remove(i);
        let mut state = self.states.swap_remove(i);
        if i < self.states.len() {
            self.states[i].flags.set_index(i);
        }
        if state.direction == Direction::Recv {
            state.peer = source;
        }
        out.push(Completion {
            state,
            kind: CompletionKind::Completed,
        });
    }

    /// Ordered removal with index fixup for the shifted survivors.
    fn remove(&mut self, i: usize) -> (mpi_sys::MPI_Request, RequestState) {
        let req = self.reqs.remove(i);
        let state = self.states.remove(i);
        for (j, s) in self.states.iter().enumerate().skip(i) {
            s.flags.set_index(j);
        }
        (req, state)
    }
}

/// Per-communicator backend state.
pub(crate) struct MpiComm {
    shared: Arc<MpiShared>,
    pending: PendingSet,
}

impl MpiComm {
    pub(crate) fn new(shared: Arc<MpiShared>) -> Result<Self> {
        Ok(Self {
            shared,
            pending: PendingSet::new(),
        })
    }

    pub(crate) fn tag_limit(&self) -> crate::tag::Tag {
        RESERVED_TAG_BIT
    }

    pub(crate) fn post_send(&mut self, state: RequestState) -> PostOutcome {
        let mut req: mpi_sys::MPI_Request = unsafe { mem::zeroed() };
        let rc = unsafe {
            mpi_sys::MPI_Isend(
                state.buffer.ptr() as *const c_void,
                state.buffer.size() as c_int,
                mpi_sys::tc_byte(),
                state.peer,
                state.tag,
                self.shared.comm,
                &mut req,
            )
        };
        check_fatal("MPI_Isend", rc);
        self.finish_post(req, state)
    }

    pub(crate) fn post_recv(&mut self, state: RequestState) -> PostOutcome {
        let req = self.start_recv(&state);
        self.finish_post(req, state)
    }

    pub(crate) fn post_shared_recv(&mut self, state: RequestState) -> PostOutcome {
        let req = self.start_recv(&state);
        match test_once(req, state) {
            Ok(state) => PostOutcome::Immediate(state),
            Err((req, state)) => {
                self.shared.shared_pending.lock().unwrap().push(req, state);
                PostOutcome::Pending
            }
        }
    }

    fn start_recv(&self, state: &RequestState) -> mpi_sys::MPI_Request {
        let src = if state.peer == ANY_SOURCE {
            mpi_sys::tc_any_source()
        } else {
            state.peer
        };
        let mut req: mpi_sys::MPI_Request = unsafe { mem::zeroed() };
        let rc = unsafe {
            mpi_sys::MPI_Irecv(
                state.buffer.ptr() as *mut c_void,
                state.buffer.size() as c_int,
                mpi_sys::tc_byte(),
                src,
                state.tag,
                self.shared.comm,
                &mut req,
            )
        };
        check_fatal("MPI_Irecv", rc);
        req
    }

    fn finish_post(&mut self, req: mpi_sys::MPI_Request, state: RequestState) -> PostOutcome {
        match test_once(req, state) {
            Ok(state) => PostOutcome::Immediate(state),
            Err((req, state)) => {
                self.pending.push(req, state);
                PostOutcome::Pending
            }
        }
    }

    pub(crate) fn poll(&mut self, out: &mut Vec<Completion>, _batch: usize) {
        self.pending.poll(out);
        // Shared receives are matched by whichever communicator polls
        // first; skip when another thread is already in here.
        if let Ok(mut shared) = self.shared.shared_pending.try_lock() {
            shared.poll(out);
        }
    }

    pub(crate) fn cancel_recv(&mut self, flags: &Arc<ReqFlags>) -> CancelOutcome {
        let i = flags.index();
        if i >= self.pending.states.len() || !Arc::ptr_eq(&self.pending.states[i].flags, flags) {
            return CancelOutcome::NotFound;
        }
        let (mut req, mut state) = self.pending.remove(i);
        unsafe {
            check_fatal("MPI_Cancel", mpi_sys::MPI_Cancel(&mut req));
            let mut status: mpi_sys::MPI_Status = mem::zeroed();
            check_fatal("MPI_Wait", mpi_sys::MPI_Wait(&mut req, &mut status));
            let mut cancelled: c_int = 0;
            check_fatal(
                "MPI_Test_cancelled",
                mpi_sys::MPI_Test_cancelled(&status, &mut cancelled),
            );
            if cancelled != 0 {
                CancelOutcome::Confirmed(state)
            } else {
                state.peer = status.MPI_SOURCE;
                CancelOutcome::CompletedInstead(state)
            }
        }
    }
}

/// Test a freshly posted request once; `Ok` means it completed inline.
fn test_once(
    mut req: mpi_sys::MPI_Request,
    mut state: RequestState,
) -> std::result::Result<RequestState, (mpi_sys::MPI_Request, RequestState)> {
    let mut flag: c_int = 0;
    let mut status: mpi_sys::MPI_Status = unsafe { mem::zeroed() };
    let rc = unsafe { mpi_sys::MPI_Test(&mut req, &mut flag, &mut status) };
    check_fatal("MPI_Test", rc);
    if flag != 0 {
        if state.direction == Direction::Recv {
            state.peer = status.MPI_SOURCE;
        }
        Ok(state)
    } else {
        Err((req, state))
    }
}

/// Progress only the context-level shared receives.
pub(crate) fn progress_shared(shared: &MpiShared, out: &mut Vec<Completion>) {
    shared.shared_pending.lock().unwrap().poll(out);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::SingleShot;
    use crate::message::RawBuffer;
    use crate::request::SchedCounters;

    fn dummy_send(counters: &Arc<SchedCounters>) -> (Arc<ReqFlags>, RequestState) {
        let flags = Arc::new(ReqFlags::new());
        counters.inc(Direction::Send);
        let state = RequestState::new(
            SingleShot::noop(),
            RawBuffer::empty(),
            0,
            0,
            flags.clone(),
            counters.clone(),
            Direction::Send,
        );
        (flags, state)
    }

    #[test]
    fn test_swap_removal_fixes_up_moved_index() {
        let counters = Arc::new(SchedCounters::new());
        let mut set = PendingSet::new();
        let mut flags = Vec::new();
        for _ in 0..3 {
            let (f, state) = dummy_send(&counters);
            set.push(unsafe { mem::zeroed() }, state);
            flags.push(f);
        }
        assert_eq!(flags[0].index(), 0);
        assert_eq!(flags[2].index(), 2);

        let mut out = Vec::new();
        set.complete_at(0, 0, &mut out);
        assert_eq!(out.len(), 1);
        // The back slot moved into the vacated front slot and knows it.
        assert_eq!(flags[2].index(), 0);
        assert_eq!(flags[1].index(), 1);
        assert_eq!(set.states.len(), 2);

        for c in out {
            c.state.complete();
        }
        assert_eq!(counters.sends(), 2);
    }
}
