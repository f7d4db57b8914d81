//! tagcomm - Tagged point-to-point messaging with callback-driven completion
//! over in-process, MPI, UCX, and libfabric transports.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Context                               │
//! │  ┌──────────────┐ ┌──────────┐ ┌───────────────────────────┐ │
//! │  │  Transport   │ │   Heap   │ │  Shared-recv queue        │ │
//! │  │ (one backend)│ │ (pooled, │ │  (context-level, matched  │ │
//! │  │              │ │ registrd)│ │   by any communicator)    │ │
//! │  └──────────────┘ └──────────┘ └───────────────────────────┘ │
//! └──────────────────────────────────────────────────────────────┘
//!                 │
//!       ┌─────────┼──────────┐            one per thread
//!       ▼         ▼          ▼
//! ┌──────────┐ ┌──────────┐ ┌──────────┐
//! │Communictr│ │Communictr│ │Communictr│  send/recv/progress,
//! │          │ │          │ │          │  callbacks fire here
//! └──────────┘ └──────────┘ └──────────┘
//! ```
//!
//! - **Callback-driven**: completion hands the buffer back through a
//!   single-shot callback, fired exactly once on the thread that calls
//!   `progress()` (or inline, for synchronous completions).
//! - **No progress thread**: nothing moves unless some thread progresses,
//!   tests, or waits.
//! - **Zero-copy buffers**: messages live in pooled, transport-registered
//!   memory ([`Context::make_buffer`]); in-flight operations hold the
//!   backing chunk alive.
//!
//! The in-process transport is always available and runs an N-rank job as
//! N threads over an [`InprocFabric`]; the `mpi`, `ucx`, and `libfabric`
//! features add the inter-node backends.

#![allow(unsafe_op_in_unsafe_fn)]

mod barrier;
mod callback;
mod communicator;
mod config;
mod context;
mod error;
mod heap;
mod message;
mod request;
mod tag;
mod transport;

pub use barrier::Barrier;
pub use communicator::Communicator;
pub use config::Config;
pub use context::{Context, ContextBuilder, Topology};
pub use error::{Error, Result};
pub use heap::RegHandle;
pub use message::{MessageBuffer, Serial};
pub use request::{RecvRequest, SendRequest, SharedRecvRequest};
pub use tag::{Rank, Tag, TagRange, TagRangeFactory, WrappedTag, ANY_SOURCE};
pub use transport::inproc::InprocFabric;
