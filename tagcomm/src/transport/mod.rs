//! Transport adapters.
//!
//! Every backend implements the same posting/polling contract with a
//! different native completion mechanism. Backends never invoke user
//! callbacks while their state is borrowed: posting either reports
//! immediate completion (the communicator fires the callback after
//! releasing the borrow, before the posting call returns) or parks the
//! state, and polling returns completion records for the communicator's
//! dispatch step. This two-phase split is what lets a callback itself
//! post new operations without re-entering the backend.

pub(crate) mod inproc;

#[cfg(feature = "libfabric")]
pub(crate) mod libfabric;
#[cfg(feature = "mpi")]
pub(crate) mod mpi;
#[cfg(feature = "ucx")]
pub(crate) mod ucx;

use std::sync::Arc;

use crate::request::{Completion, ReqFlags, RequestState};
use crate::tag::Tag;

/// Outcome of posting an operation.
pub(crate) enum PostOutcome {
    /// The operation completed synchronously; the caller owns the state
    /// and must fire its callback before returning to the user.
    Immediate(RequestState),
    /// The operation is outstanding; the backend owns the state.
    Pending,
}

/// Outcome of a cancellation attempt on an outstanding receive.
pub(crate) enum CancelOutcome {
    /// The receive was withdrawn; its callback must never fire.
    Confirmed(RequestState),
    /// The receive completed before the cancel took effect; the caller
    /// fires the callback normally.
    CompletedInstead(RequestState),
    /// The operation is no longer in the pending storage (its completion
    /// is already in flight toward dispatch).
    NotFound,
}

/// Closed dispatch over the compiled backends of a communicator.
pub(crate) enum BackendComm {
    Inproc(inproc::InprocComm),
    #[cfg(feature = "mpi")]
    Mpi(mpi::MpiComm),
    #[cfg(feature = "ucx")]
    Ucx(ucx::UcxComm),
    #[cfg(feature = "libfabric")]
    Libfabric(libfabric::LibfabricComm),
}

impl BackendComm {
    pub(crate) fn post_send(&mut self, state: RequestState) -> PostOutcome {
        match self {
            BackendComm::Inproc(b) => b.post_send(state),
            #[cfg(feature = "mpi")]
            BackendComm::Mpi(b) => b.post_send(state),
            #[cfg(feature = "ucx")]
            BackendComm::Ucx(b) => b.post_send(state),
            #[cfg(feature = "libfabric")]
            BackendComm::Libfabric(b) => b.post_send(state),
        }
    }

    pub(crate) fn post_recv(&mut self, state: RequestState) -> PostOutcome {
        match self {
            BackendComm::Inproc(b) => b.post_recv(state),
            #[cfg(feature = "mpi")]
            BackendComm::Mpi(b) => b.post_recv(state),
            #[cfg(feature = "ucx")]
            BackendComm::Ucx(b) => b.post_recv(state),
            #[cfg(feature = "libfabric")]
            BackendComm::Libfabric(b) => b.post_recv(state),
        }
    }

    /// Post a receive whose completion may be observed from any thread.
    pub(crate) fn post_shared_recv(&mut self, state: RequestState) -> PostOutcome {
        match self {
            BackendComm::Inproc(b) => b.post_shared_recv(state),
            #[cfg(feature = "mpi")]
            BackendComm::Mpi(b) => b.post_shared_recv(state),
            #[cfg(feature = "ucx")]
            BackendComm::Ucx(b) => b.post_shared_recv(state),
            #[cfg(feature = "libfabric")]
            BackendComm::Libfabric(b) => b.post_shared_recv(state),
        }
    }

    /// One non-blocking completion-detection pass. Appends completion
    /// records; the caller dispatches them.
    pub(crate) fn poll(&mut self, out: &mut Vec<Completion>, batch: usize) {
        match self {
            BackendComm::Inproc(b) => b.poll(out, batch),
            #[cfg(feature = "mpi")]
            BackendComm::Mpi(b) => b.poll(out, batch),
            #[cfg(feature = "ucx")]
            BackendComm::Ucx(b) => b.poll(out, batch),
            #[cfg(feature = "libfabric")]
            BackendComm::Libfabric(b) => b.poll(out, batch),
        }
    }

    /// Negotiate cancellation of the receive identified by `flags`,
    /// driving the backend synchronously until the outcome is known.
    pub(crate) fn cancel_recv(&mut self, flags: &Arc<ReqFlags>) -> CancelOutcome {
        match self {
            BackendComm::Inproc(b) => b.cancel_recv(flags),
            #[cfg(feature = "mpi")]
            BackendComm::Mpi(b) => b.cancel_recv(flags),
            #[cfg(feature = "ucx")]
            BackendComm::Ucx(b) => b.cancel_recv(flags),
            #[cfg(feature = "libfabric")]
            BackendComm::Libfabric(b) => b.cancel_recv(flags),
        }
    }

    /// Exclusive upper bound of the user-visible tag space.
    pub(crate) fn tag_limit(&self) -> Tag {
        match self {
            BackendComm::Inproc(b) => b.tag_limit(),
            #[cfg(feature = "mpi")]
            BackendComm::Mpi(b) => b.tag_limit(),
            #[cfg(feature = "ucx")]
            BackendComm::Ucx(b) => b.tag_limit(),
            #[cfg(feature = "libfabric")]
            BackendComm::Libfabric(b) => b.tag_limit(),
        }
    }
}
