//! Context construction and process-wide transport state.
//!
//! A [`Context`] owns the transport instance, the registered-memory heap,
//! and the process topology. Communicators are cheap per-thread handles
//! carved out of it. Contexts are `Send + Sync`; everything mutable inside
//! them is either atomic or behind the transport's own locking.

use std::mem;
use std::ptr;
use std::sync::Arc;

use crate::barrier::Barrier;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::heap::{Heap, NullRegistry};
use crate::message::{MessageBuffer, RawBuffer, Serial};
use crate::request::{CompletionKind, SchedCounters};
use crate::tag::Rank;
use crate::transport::inproc::{InprocComm, InprocFabric, InprocShared};
use crate::transport::{inproc, BackendComm};

/// Where this process sits in the job: its rank, the job size, and which
/// ranks share its node.
#[derive(Debug, Clone)]
pub struct Topology {
    rank: Rank,
    size: Rank,
    local: Vec<Rank>,
}

impl Topology {
    pub(crate) fn new(rank: Rank, size: Rank, local: Vec<Rank>) -> Self {
        Self { rank, size, local }
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn size(&self) -> Rank {
        self.size
    }

    /// Whether `rank` lives on the same node as this process.
    pub fn is_local(&self, rank: Rank) -> bool {
        self.local.contains(&rank)
    }

    /// Ranks on this node, in ascending order, including this process.
    pub fn local_ranks(&self) -> &[Rank] {
        &self.local
    }
}

/// Transport state shared by every communicator of one context.
pub(crate) enum TransportShared {
    Inproc {
        fabric: Arc<InprocFabric>,
        queue: Arc<InprocShared>,
    },
    #[cfg(feature = "mpi")]
    Mpi(Arc<crate::transport::mpi::MpiShared>),
    #[cfg(feature = "ucx")]
    Ucx(Arc<crate::transport::ucx::UcxShared>),
    #[cfg(feature = "libfabric")]
    Libfabric(Arc<crate::transport::libfabric::LfShared>),
}

pub(crate) struct ContextShared {
    pub(crate) transport: TransportShared,
    pub(crate) heap: Heap,
    pub(crate) topology: Topology,
    pub(crate) config: Config,
    #[allow(dead_code)]
    pub(crate) thread_safe: bool,
    /// Outstanding-operation counters for shared receives, which belong to
    /// the context rather than to any one communicator.
    pub(crate) shared_counters: Arc<SchedCounters>,
}

impl ContextShared {
    /// Progress only the context-level shared-receive queue. Used by
    /// [`crate::SharedRecvRequest`] so a waiter on a thread without a
    /// polling communicator still makes progress. Returns the number of
    /// callbacks fired.
    pub(crate) fn progress_shared(&self) -> usize {
        let mut out = Vec::new();
        match &self.transport {
            TransportShared::Inproc { fabric, queue } => {
                inproc::progress_shared(fabric, self.topology.rank(), queue, &mut out)
            }
            #[cfg(feature = "mpi")]
            TransportShared::Mpi(shared) => {
                crate::transport::mpi::progress_shared(shared, &mut out)
            }
            #[cfg(feature = "ucx")]
            TransportShared::Ucx(shared) => {
                crate::transport::ucx::progress_shared(shared, &mut out)
            }
            #[cfg(feature = "libfabric")]
            TransportShared::Libfabric(shared) => {
                crate::transport::libfabric::progress_shared(shared, &mut out)
            }
        }
        let n = out.len();
        for c in out {
            match c.kind {
                CompletionKind::Completed => c.state.complete(),
                CompletionKind::Canceled => c.state.complete_canceled(),
            }
        }
        n
    }
}

enum TransportChoice {
    Inproc {
        fabric: Arc<InprocFabric>,
        rank: usize,
    },
    #[cfg(feature = "mpi")]
    Mpi,
    #[cfg(feature = "ucx")]
    Ucx,
    #[cfg(feature = "libfabric")]
    Libfabric,
}

/// Builds a [`Context`] over one of the compiled transports.
pub struct ContextBuilder {
    choice: TransportChoice,
    config: Config,
    thread_safe: bool,
}

impl ContextBuilder {
    /// Context over an in-process fabric, as rank `rank` of the fabric's
    /// rank space. Every rank of the fabric gets its own context,
    /// typically one per thread.
    pub fn inproc(fabric: Arc<InprocFabric>, rank: usize) -> Self {
        Self {
            choice: TransportChoice::Inproc { fabric, rank },
            config: Config::from_env(),
            thread_safe: false,
        }
    }

    /// Context over the job's MPI library.
    #[cfg(feature = "mpi")]
    pub fn mpi() -> Self {
        Self {
            choice: TransportChoice::Mpi,
            config: Config::from_env(),
            thread_safe: false,
        }
    }

    /// Context over UCX, bootstrapped through MPI.
    #[cfg(feature = "ucx")]
    pub fn ucx() -> Self {
        Self {
            choice: TransportChoice::Ucx,
            config: Config::from_env(),
            thread_safe: false,
        }
    }

    /// Context over libfabric, bootstrapped through MPI.
    #[cfg(feature = "libfabric")]
    pub fn libfabric() -> Self {
        Self {
            choice: TransportChoice::Libfabric,
            config: Config::from_env(),
            thread_safe: false,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn inject_size(mut self, bytes: usize) -> Self {
        self.config.inject_size = bytes;
        self
    }

    pub fn poll_batch(mut self, entries: usize) -> Self {
        self.config.poll_batch = entries.max(1);
        self
    }

    pub fn progress_depth(mut self, depth: u32) -> Self {
        self.config.progress_depth = depth;
        self
    }

    /// Request multi-threaded use: communicators of this context will be
    /// driven from several threads. Fails at [`build`](Self::build) time
    /// if the transport cannot provide it.
    pub fn thread_safe(mut self, on: bool) -> Self {
        self.thread_safe = on;
        self
    }

    pub fn build(self) -> Result<Context> {
        let shared = match self.choice {
            TransportChoice::Inproc { fabric, rank } => {
                if rank >= fabric.size() {
                    return Err(Error::InvalidRank(rank as i32));
                }
                let size = fabric.size() as Rank;
                ContextShared {
                    transport: TransportShared::Inproc {
                        fabric,
                        queue: InprocShared::new(),
                    },
                    heap: Heap::new(Box::new(NullRegistry)),
                    topology: Topology::new(rank as Rank, size, (0..size).collect()),
                    config: self.config,
                    thread_safe: self.thread_safe,
                    shared_counters: Arc::new(SchedCounters::new()),
                }
            }
            #[cfg(feature = "mpi")]
            TransportChoice::Mpi => {
                let mpi = crate::transport::mpi::MpiShared::init(self.thread_safe)?;
                let topology = mpi.topology();
                ContextShared {
                    transport: TransportShared::Mpi(mpi),
                    heap: Heap::new(Box::new(NullRegistry)),
                    topology,
                    config: self.config,
                    thread_safe: self.thread_safe,
                    shared_counters: Arc::new(SchedCounters::new()),
                }
            }
            #[cfg(feature = "ucx")]
            TransportChoice::Ucx => {
                let ucx = crate::transport::ucx::UcxShared::init(&self.config, self.thread_safe)?;
                let topology = ucx.topology();
                ContextShared {
                    transport: TransportShared::Ucx(ucx),
                    heap: Heap::new(Box::new(NullRegistry)),
                    topology,
                    config: self.config,
                    thread_safe: self.thread_safe,
                    shared_counters: Arc::new(SchedCounters::new()),
                }
            }
            #[cfg(feature = "libfabric")]
            TransportChoice::Libfabric => {
                let lf =
                    crate::transport::libfabric::LfShared::init(&self.config, self.thread_safe)?;
                let topology = lf.topology();
                let heap = Heap::new(lf.registry());
                ContextShared {
                    transport: TransportShared::Libfabric(lf),
                    heap,
                    topology,
                    config: self.config,
                    thread_safe: self.thread_safe,
                    shared_counters: Arc::new(SchedCounters::new()),
                }
            }
        };
        Ok(Context {
            shared: Arc::new(shared),
        })
    }
}

/// A handle on the transport, shared by this process's communicators.
#[derive(Clone)]
pub struct Context {
    shared: Arc<ContextShared>,
}

impl Context {
    pub fn rank(&self) -> Rank {
        self.shared.topology.rank()
    }

    pub fn size(&self) -> Rank {
        self.shared.topology.size()
    }

    pub fn topology(&self) -> &Topology {
        &self.shared.topology
    }

    /// Create a communicator. One per thread; the handle itself is not
    /// `Send`.
    pub fn communicator(&self) -> Result<crate::Communicator> {
        let backend = match &self.shared.transport {
            TransportShared::Inproc { fabric, queue } => BackendComm::Inproc(InprocComm::new(
                fabric.clone(),
                queue.clone(),
                self.shared.topology.rank(),
            )),
            #[cfg(feature = "mpi")]
            TransportShared::Mpi(shared) => {
                BackendComm::Mpi(crate::transport::mpi::MpiComm::new(shared.clone())?)
            }
            #[cfg(feature = "ucx")]
            TransportShared::Ucx(shared) => {
                BackendComm::Ucx(crate::transport::ucx::UcxComm::new(shared.clone())?)
            }
            #[cfg(feature = "libfabric")]
            TransportShared::Libfabric(shared) => BackendComm::Libfabric(
                crate::transport::libfabric::LibfabricComm::new(shared.clone())?,
            ),
        };
        Ok(crate::Communicator::new(self.shared.clone(), backend))
    }

    /// Allocate a zeroed message buffer of `len` elements from the
    /// registered pool.
    pub fn make_buffer<T: Serial>(&self, len: usize) -> Result<MessageBuffer<T>> {
        let bytes = len * mem::size_of::<T>();
        let chunk = self.shared.heap.allocate(bytes.max(1))?;
        unsafe { ptr::write_bytes(chunk.ptr(), 0, bytes) };
        Ok(MessageBuffer::from_raw(RawBuffer::new(chunk, bytes), len))
    }

    /// Wrap caller-owned memory as a message buffer, registering it with
    /// the transport.
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` elements and must
    /// outlive the returned buffer and every operation posted with it. The
    /// memory is deregistered but not freed on drop.
    pub unsafe fn make_buffer_from<T: Serial>(
        &self,
        ptr: *mut T,
        len: usize,
    ) -> Result<MessageBuffer<T>> {
        let bytes = len * mem::size_of::<T>();
        let chunk = self.shared.heap.adopt(ptr as *mut u8, bytes)?;
        Ok(MessageBuffer::from_raw(RawBuffer::new(chunk, bytes), len))
    }

    /// A barrier across all ranks and `n_threads` communicator threads per
    /// rank. Clone the returned handle into each participating thread.
    pub fn barrier(&self, n_threads: usize) -> Barrier {
        Barrier::new(self.clone(), n_threads)
    }
}
