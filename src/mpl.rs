//! Interface to the underlying message-passing library.
//!
//! The layer never talks to the network itself. Everything it needs from the
//! library is captured by the [`Mpl`] trait: the collectives it shadow-calls
//! from inside the intercepted entry points, communicator management and the
//! init/finalize lifecycle. Buffers are untyped bytes plus a `(count,
//! datatype)` pair, matching the library's own calling convention.

use std::{fmt::Debug, hash::Hash};

use thiserror::Error;

/// Element type of a reduction request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Datatype {
    Int32,
    Int64,
    Float32,
    Float64,
}

impl Datatype {
    /// Size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            Datatype::Int32 | Datatype::Float32 => 4,
            Datatype::Int64 | Datatype::Float64 => 8,
        }
    }
}

/// Reduction operator of a reduction request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Sum,
    Prod,
    Max,
}

/// Thread support level requested from or provided by the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ThreadLevel {
    Single,
    Funneled,
    Serialized,
    Multiple,
}

/// A failure reported by the message-passing library. The original error
/// code is preserved and forwarded verbatim to the caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{call} failed with code {code}")]
pub struct MplError {
    /// The library call that failed.
    pub call: &'static str,
    /// The library's own error code.
    pub code: i32,
}

/// An in-flight non-blocking reduction. Dropping the handle without calling
/// [`wait`](Self::wait) abandons the operation.
pub trait PendingReduce {
    /// Block until the reduction completes.
    fn wait(self) -> Result<(), MplError>;
}

/// The subset of the message-passing library the layer builds on. Real
/// deployments implement this over the library's profiling shadow entry
/// points; tests implement it over an in-process cluster.
pub trait Mpl {
    /// Opaque communicator handle. Used only as a lookup key.
    type Comm: Copy + Eq + Hash + Debug;
    /// Handle for a posted non-blocking reduction. Borrows both buffers
    /// until waited.
    type Pending<'a>: PendingReduce
    where
        Self: 'a;

    fn init(&self) -> Result<(), MplError>;
    fn init_thread(&self, required: ThreadLevel) -> Result<ThreadLevel, MplError>;
    fn finalize(&self) -> Result<(), MplError>;

    /// The communicator spanning all participants.
    fn comm_world(&self) -> Self::Comm;
    fn comm_size(&self, comm: Self::Comm) -> Result<usize, MplError>;
    fn comm_rank(&self, comm: Self::Comm) -> Result<usize, MplError>;

    /// Blocking all-reduce. `sendbuf` and `recvbuf` hold `count` elements of
    /// `dtype` each.
    fn allreduce(
        &self,
        sendbuf: &[u8],
        recvbuf: &mut [u8],
        count: usize,
        dtype: Datatype,
        op: ReduceOp,
        comm: Self::Comm,
    ) -> Result<(), MplError>;

    /// Non-blocking all-reduce; completion is observed through the returned
    /// handle.
    fn iallreduce<'a>(
        &'a self,
        sendbuf: &'a [u8],
        recvbuf: &'a mut [u8],
        count: usize,
        dtype: Datatype,
        op: ReduceOp,
        comm: Self::Comm,
    ) -> Result<Self::Pending<'a>, MplError>;

    /// All-gather of one word per rank; `recv[r]` holds rank `r`'s word on
    /// return. The caller's own slot must be filled in before the call.
    fn allgather_word(&self, word: u32, recv: &mut [u32], comm: Self::Comm)
        -> Result<(), MplError>;

    /// Broadcast one word from `root` to every rank of `comm`.
    fn broadcast_word(&self, word: &mut u32, root: usize, comm: Self::Comm)
        -> Result<(), MplError>;

    /// Create a communicator from the listed ranks of `comm` (ranks are
    /// relative to `comm`). Returns `None` on ranks excluded from the new
    /// group.
    fn comm_create(
        &self,
        comm: Self::Comm,
        members: &[usize],
    ) -> Result<Option<Self::Comm>, MplError>;

    /// Split `comm` by `color`, ordering ranks by `key`. A negative color
    /// yields `None` for that rank.
    fn comm_split(
        &self,
        comm: Self::Comm,
        color: i32,
        key: i32,
    ) -> Result<Option<Self::Comm>, MplError>;

    fn comm_dup(&self, comm: Self::Comm) -> Result<Self::Comm, MplError>;

    fn comm_free(&self, comm: Self::Comm) -> Result<(), MplError>;
}
