//! Masking of reduction vectors.
//!
//! The engine turns a plaintext element vector into a masked one using the
//! per-rank shared key, the per-call nonce and the word generator. Masks are
//! built so that they telescope away inside the reduction: all ranks but one
//! apply their own mask, and the designated rank carries the negation (or
//! multiplicative inverse) of everyone else's, which it can compute locally
//! because every rank holds the full shared-key vector.

mod masking;

pub use self::masking::Masker;

use crate::mpl::{Datatype, ReduceOp};

/// The reductions the engine can mask. Everything else is a signal to pass
/// the call through to the library untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceKind {
    /// 32-bit integer sum, additive masks modulo 2^32.
    IntSum,
    /// 32-bit integer product, odd multiplicative masks modulo 2^32.
    IntProd,
    /// 32-bit float sum, small additive float masks.
    FloatSum,
}

impl ReduceKind {
    /// Map a `(datatype, op)` pair onto a masked-reduction kind. `None`
    /// means the pair is not maskable.
    pub fn of(dtype: Datatype, op: ReduceOp) -> Option<Self> {
        match (dtype, op) {
            (Datatype::Int32, ReduceOp::Sum) => Some(Self::IntSum),
            (Datatype::Int32, ReduceOp::Prod) => Some(Self::IntProd),
            (Datatype::Float32, ReduceOp::Sum) => Some(Self::FloatSum),
            _ => None,
        }
    }
}
