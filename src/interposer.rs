//! The all-reduce wrapper and the communicator lifecycle hooks.
//!
//! [`Hear`] mirrors the intercepted surface of the message-passing library:
//! each entry point delegates to the real implementation through the
//! [`Mpl`] trait and wraps it with the masking protocol and the state
//! bookkeeping it needs. One instance exists per participating process,
//! from init to finalize; mutating entry points take `&mut self`, matching
//! the library's own serialised-calls contract.

use thiserror::Error;

use crate::{
    crypto::Prf,
    keystore::KeyNonceStore,
    mask::{Masker, ReduceKind},
    mpl::{Datatype, Mpl, MplError, PendingReduce, ReduceOp, ThreadLevel},
    pool::{PoolError, Sbuf, SbufPool},
    settings::Settings,
};

/// Failures surfaced by the layer. Unsupported requests are not failures
/// (they fall back to the native reduction), and invariant violations
/// panic instead.
#[derive(Debug, Error)]
pub enum HearError {
    /// Forwarded from the library with its original code.
    #[error(transparent)]
    Transport(#[from] MplError),
    /// The scratch pool could not serve a buffer.
    #[error(transparent)]
    Pool(#[from] PoolError),
}

#[cfg(feature = "profiling")]
macro_rules! timed {
    ($timings:expr, $field:ident, $expr:expr) => {{
        let start = std::time::Instant::now();
        let out = $expr;
        let cell = &$timings.$field;
        cell.set(cell.get() + start.elapsed());
        out
    }};
}

#[cfg(not(feature = "profiling"))]
macro_rules! timed {
    ($timings:expr, $field:ident, $expr:expr) => {
        $expr
    };
}

/// The confidentiality layer around one process's view of the library.
pub struct Hear<M: Mpl> {
    mpl: M,
    settings: Settings,
    prf: Prf,
    store: KeyNonceStore<M::Comm>,
    pool: SbufPool,
    #[cfg(feature = "profiling")]
    timings: profile::Timings,
}

impl<M: Mpl> Hear<M> {
    /// Initialise the library, allocate the layer state and register the
    /// world communicator.
    pub fn init(mpl: M, settings: Settings) -> Result<Self, HearError> {
        mpl.init()?;
        let mut layer = Self::with_parts(mpl, settings);
        info!("library initialised, registering the world communicator");
        let world = layer.mpl.comm_world();
        layer.store.register(&layer.mpl, world)?;
        Ok(layer)
    }

    /// Like [`init`](Self::init), requesting a thread support level. The
    /// layer itself is not thread-safe regardless of the provided level;
    /// callers serialise externally.
    pub fn init_thread(
        mpl: M,
        settings: Settings,
        required: ThreadLevel,
    ) -> Result<(Self, ThreadLevel), HearError> {
        let provided = mpl.init_thread(required)?;
        let mut layer = Self::with_parts(mpl, settings);
        info!(?provided, "library initialised, registering the world communicator");
        let world = layer.mpl.comm_world();
        layer.store.register(&layer.mpl, world)?;
        Ok((layer, provided))
    }

    fn with_parts(mpl: M, settings: Settings) -> Self {
        let prf = Prf::from_settings(&settings);
        let pool = SbufPool::new(&settings);
        Self {
            mpl,
            settings,
            prf,
            store: KeyNonceStore::new(),
            pool,
            #[cfg(feature = "profiling")]
            timings: profile::Timings::default(),
        }
    }

    /// The wrapped library.
    pub fn mpl(&self) -> &M {
        &self.mpl
    }

    /// The world communicator handle.
    pub fn world(&self) -> M::Comm {
        self.mpl.comm_world()
    }

    /// The scratch pool gauges, for diagnostics.
    pub fn pool(&self) -> &SbufPool {
        &self.pool
    }

    /// Whether `comm` currently holds key material.
    pub fn registered(&self, comm: M::Comm) -> bool {
        self.store.contains(comm)
    }

    /// The current nonce of `comm`, for diagnostics. All ranks observe the
    /// same value between reductions.
    pub fn current_nonce(&self, comm: M::Comm) -> u32 {
        self.store.nonce(comm)
    }

    /// The shared-key vector of `comm`, for diagnostics. All ranks observe
    /// the same vector once registration completes.
    pub fn shared_keys(&self, comm: M::Comm) -> &[u32] {
        self.store.shared_keys(comm)
    }

    /// The intercepted all-reduce. `sendbuf` and `recvbuf` hold `count`
    /// elements of `dtype` and must be element-aligned.
    ///
    /// Maskable requests travel encrypted through the library; everything
    /// else is delegated untouched. On failure the receive buffer is left
    /// in an undefined state, matching the library's own convention.
    pub fn allreduce(
        &mut self,
        sendbuf: &[u8],
        recvbuf: &mut [u8],
        count: usize,
        dtype: Datatype,
        op: ReduceOp,
        comm: M::Comm,
    ) -> Result<(), HearError> {
        assert_eq!(
            sendbuf.len(),
            count * dtype.size(),
            "send buffer length does not match count"
        );
        assert_eq!(
            recvbuf.len(),
            count * dtype.size(),
            "receive buffer length does not match count"
        );

        if cfg!(feature = "baseline") {
            return Ok(self
                .mpl
                .allreduce(sendbuf, recvbuf, count, dtype, op, comm)?);
        }

        let kind = match ReduceKind::of(dtype, op) {
            Some(kind) => kind,
            None => {
                debug!(?dtype, ?op, "reduction not maskable, delegating to the library");
                return Ok(self
                    .mpl
                    .allreduce(sendbuf, recvbuf, count, dtype, op, comm)?);
            }
        };

        if count == 0 {
            // Nothing to hide, but still a collective every rank must enter.
            return Ok(self
                .mpl
                .allreduce(sendbuf, recvbuf, count, dtype, op, comm)?);
        }

        debug!(count, ?kind, "intercepted all-reduce");

        #[cfg(feature = "dcheck")]
        let shadow = match kind {
            ReduceKind::IntSum | ReduceKind::IntProd => {
                let mut native = vec![0u8; recvbuf.len()];
                self.mpl
                    .allreduce(sendbuf, &mut native, count, dtype, op, comm)?;
                Some(native)
            }
            // Masked float aggregation rounds differently from the native
            // one, so bit-comparison is only meaningful for integers.
            ReduceKind::FloatSum => None,
        };

        #[cfg(feature = "profiling")]
        self.timings.reductions.set(self.timings.reductions.get() + 1);

        let nonce = self.store.advance_nonce(&self.prf, comm);
        let rank = self.mpl.comm_rank(comm)?;
        let keys = self.store.shared_keys(comm);
        let masker = Masker::new(&self.prf, keys, nonce, rank);

        if self.settings.pipelining {
            self.reduce_pipelined(&masker, kind, sendbuf, recvbuf, dtype, op, comm)?;
        } else {
            self.reduce_plain(&masker, kind, sendbuf, recvbuf, count, dtype, op, comm)?;
        }

        #[cfg(feature = "dcheck")]
        if let Some(native) = shadow {
            assert_eq!(
                native.as_slice(),
                &*recvbuf,
                "masked aggregate diverged from the native result"
            );
        }

        Ok(())
    }

    /// Mask the whole vector, shadow-call the blocking reduction, invert.
    #[allow(clippy::too_many_arguments)]
    fn reduce_plain(
        &self,
        masker: &Masker<'_>,
        kind: ReduceKind,
        sendbuf: &[u8],
        recvbuf: &mut [u8],
        count: usize,
        dtype: Datatype,
        op: ReduceOp,
        comm: M::Comm,
    ) -> Result<(), HearError> {
        let mut sbuf = self.pool.acquire(count * dtype.size())?;
        timed!(self.timings, mask, masker.mask(kind, sendbuf, &mut sbuf, 0));
        timed!(
            self.timings,
            comm,
            self.mpl.allreduce(&sbuf, recvbuf, count, dtype, op, comm)
        )?;
        timed!(self.timings, unmask, masker.unmask(kind, recvbuf, 0));
        Ok(())
    }

    /// Blocked reduction with at most three blocks in flight: post the
    /// non-blocking reduce on block `n`, unmask block `n-1`, mask block
    /// `n+1` into a fresh slab, wait on `n`, rotate. Slab leases release on
    /// every exit path.
    #[allow(clippy::too_many_arguments)]
    fn reduce_pipelined(
        &self,
        masker: &Masker<'_>,
        kind: ReduceKind,
        sendbuf: &[u8],
        recvbuf: &mut [u8],
        dtype: Datatype,
        op: ReduceOp,
        comm: M::Comm,
    ) -> Result<(), HearError> {
        let esize = dtype.size();
        let block_bytes = self.settings.pipelining_block_size * esize;

        let mut send_blocks = sendbuf.chunks(block_bytes);
        let recv_blocks = recvbuf.chunks_mut(block_bytes);

        let first_send = match send_blocks.next() {
            Some(block) => block,
            None => return Ok(()),
        };
        let mut cur_lease = self.pool.acquire(first_send.len())?;
        timed!(
            self.timings,
            mask,
            masker.mask(kind, first_send, &mut cur_lease, 0)
        );

        let mut cur_offset = 0usize;
        let mut prev: Option<(&mut [u8], usize)> = None;

        for cur_recv in recv_blocks {
            let cur_count = cur_recv.len() / esize;

            let pending =
                self.mpl
                    .iallreduce(&cur_lease, &mut *cur_recv, cur_count, dtype, op, comm)?;

            // Unmask the block whose reduction completed last round.
            if let Some((block, at)) = prev.take() {
                timed!(self.timings, unmask, masker.unmask(kind, block, at));
            }

            // Mask the next block while the current one is in flight.
            let mut next: Option<(Sbuf, usize)> = None;
            if let Some(send) = send_blocks.next() {
                let mut lease = match self.pool.acquire(send.len()) {
                    Ok(lease) => lease,
                    Err(pool_err) => {
                        // The posted collective must still be waited; if it
                        // failed as well, the transport error is the one to
                        // forward.
                        if let Err(transport) = pending.wait() {
                            warn!(%pool_err, "pool error superseded by a transport failure");
                            return Err(transport.into());
                        }
                        return Err(pool_err.into());
                    }
                };
                let at = cur_offset + cur_count;
                timed!(self.timings, mask, masker.mask(kind, send, &mut lease, at));
                next = Some((lease, at));
            }

            timed!(self.timings, comm, pending.wait())?;

            prev = Some((cur_recv, cur_offset));
            match next {
                Some((lease, at)) => {
                    // The finished block's slab goes back to the pool here.
                    cur_lease = lease;
                    cur_offset = at;
                }
                None => break,
            }
        }
        drop(cur_lease);

        if let Some((block, at)) = prev.take() {
            timed!(self.timings, unmask, masker.unmask(kind, block, at));
        }
        Ok(())
    }

    /// Intercepted communicator creation: delegate, then distribute key
    /// material over the new communicator. Ranks outside the new group get
    /// `None` and register nothing.
    pub fn comm_create(
        &mut self,
        comm: M::Comm,
        members: &[usize],
    ) -> Result<Option<M::Comm>, HearError> {
        debug!(comm = ?comm, "intercepted communicator create");
        let newcomm = self.mpl.comm_create(comm, members)?;
        if let Some(created) = newcomm {
            self.store.register(&self.mpl, created)?;
        }
        Ok(newcomm)
    }

    /// Intercepted communicator split; see [`comm_create`](Self::comm_create).
    pub fn comm_split(
        &mut self,
        comm: M::Comm,
        color: i32,
        key: i32,
    ) -> Result<Option<M::Comm>, HearError> {
        debug!(comm = ?comm, color, key, "intercepted communicator split");
        let newcomm = self.mpl.comm_split(comm, color, key)?;
        if let Some(created) = newcomm {
            self.store.register(&self.mpl, created)?;
        }
        Ok(newcomm)
    }

    /// Intercepted communicator duplication.
    pub fn comm_dup(&mut self, comm: M::Comm) -> Result<M::Comm, HearError> {
        debug!(comm = ?comm, "intercepted communicator dup");
        let newcomm = self.mpl.comm_dup(comm)?;
        self.store.register(&self.mpl, newcomm)?;
        Ok(newcomm)
    }

    /// Intercepted communicator free: delegate, then drop the key material
    /// so the store does not grow without bound in programs that churn
    /// communicators.
    pub fn comm_free(&mut self, comm: M::Comm) -> Result<(), HearError> {
        debug!(comm = ?comm, "intercepted communicator free");
        self.mpl.comm_free(comm)?;
        self.store.remove(comm);
        Ok(())
    }

    /// Tear down the layer state, then delegate to the library's finalize.
    pub fn finalize(mut self) -> Result<(), HearError> {
        #[cfg(feature = "profiling")]
        self.timings.log_summary();
        info!(
            communicators = self.store.len(),
            "finalizing, dropping key material"
        );
        self.store.clear();
        self.mpl.finalize()?;
        Ok(())
    }
}

#[cfg(feature = "profiling")]
mod profile {
    use std::{cell::Cell, time::Duration};

    /// Wall-clock accumulators for the reduce-path phases.
    #[derive(Debug, Default)]
    pub(super) struct Timings {
        pub(super) comm: Cell<Duration>,
        pub(super) mask: Cell<Duration>,
        pub(super) unmask: Cell<Duration>,
        pub(super) reductions: Cell<u64>,
    }

    impl Timings {
        pub(super) fn log_summary(&self) {
            info!(
                reductions = self.reductions.get(),
                comm_us = self.comm.get().as_micros() as u64,
                mask_us = self.mask.get().as_micros() as u64,
                unmask_us = self.unmask.get().as_micros() as u64,
                "reduction phase timings"
            );
        }
    }
}
