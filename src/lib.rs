//! Transparent confidentiality for all-reduce collectives.
//!
//! Every participant of an all-reduce contributes a masked vector instead of
//! its plaintext one. The masks are derived from per-communicator shared
//! secrets and an evolving nonce, and are constructed so that they cancel
//! under the reduction operator itself: the underlying message-passing
//! library reduces ciphertext, yet every rank ends up with the true
//! aggregate. The transport never sees a plaintext element.
//!
//! The entry point is [`Hear`], which wraps an implementation of the [`Mpl`]
//! trait (the shadow-call interface to the real message-passing library) and
//! mirrors the intercepted surface: `allreduce`, the communicator lifecycle
//! hooks and init/finalize.
//!
//! Supported reductions are 32-bit integer sum/product and 32-bit float sum;
//! every other `(datatype, op)` pair is delegated to the library untouched.
//! The threat model is a curious transport, not malicious peers: no
//! authentication is performed.

#[macro_use]
extern crate tracing;

pub mod crypto;
pub mod interposer;
pub mod keystore;
pub mod mask;
pub mod mpl;
pub mod pool;
pub mod settings;

pub use self::{
    interposer::{Hear, HearError},
    mask::ReduceKind,
    mpl::{Datatype, Mpl, MplError, PendingReduce, ReduceOp, ThreadLevel},
    settings::{Settings, SettingsError},
};
