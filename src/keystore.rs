//! Per-communicator key material.
//!
//! Each live communicator owns two things: a shared-key vector holding one
//! secret word per rank (every rank sees the full vector after
//! registration), and a nonce that all ranks advance in lock-step before
//! every reduction. The store keeps the words in contiguous append-only
//! storage and maps opaque communicator handles onto it.

use std::{collections::HashMap, fmt::Debug, hash::Hash};

use crate::{
    crypto::{self, Prf},
    mpl::{Mpl, MplError},
};

/// The rank that seeds the nonce at registration.
pub const ROOT_RANK: usize = 0;

/// Shared keys and nonces of every registered communicator.
///
/// Lookups of unregistered handles and double registrations are invariant
/// violations and panic; transport failures during registration propagate
/// and leave the store unchanged.
#[derive(Debug, Default)]
pub struct KeyNonceStore<C> {
    key_storage: Vec<Vec<u32>>,
    key_index: HashMap<C, usize>,
    nonce_storage: Vec<u32>,
    nonce_index: HashMap<C, usize>,
}

impl<C> KeyNonceStore<C>
where
    C: Copy + Eq + Hash + Debug,
{
    pub fn new() -> Self {
        Self {
            key_storage: Vec::new(),
            key_index: HashMap::new(),
            nonce_storage: Vec::new(),
            nonce_index: HashMap::new(),
        }
    }

    /// Distribute key material for a freshly created communicator: every
    /// rank contributes one fresh word at its own index (all-gather), the
    /// root seeds the nonce (broadcast).
    pub fn register<M: Mpl<Comm = C>>(&mut self, mpl: &M, comm: C) -> Result<(), MplError> {
        assert!(
            !self.key_index.contains_key(&comm),
            "communicator {comm:?} registered twice"
        );

        let size = mpl.comm_size(comm)?;
        let rank = mpl.comm_rank(comm)?;

        let mut keys = vec![0u32; size];
        keys[rank] = crypto::random_word();
        mpl.allgather_word(keys[rank], &mut keys, comm)?;

        let mut nonce = if rank == ROOT_RANK {
            crypto::random_word()
        } else {
            0
        };
        mpl.broadcast_word(&mut nonce, ROOT_RANK, comm)?;

        self.key_index.insert(comm, self.key_storage.len());
        self.key_storage.push(keys);
        self.nonce_index.insert(comm, self.nonce_storage.len());
        self.nonce_storage.push(nonce);
        debug!(comm = ?comm, size, "registered communicator");
        Ok(())
    }

    /// Replace the communicator's nonce with `prf(nonce)` and return the
    /// new value. Called exactly once per reduction, before masking, on
    /// every rank; the chains stay synchronised without communication
    /// because every rank starts from the broadcast seed.
    pub fn advance_nonce(&mut self, prf: &Prf, comm: C) -> u32 {
        let idx = self.nonce_idx(comm);
        let next = prf.word(self.nonce_storage[idx]);
        self.nonce_storage[idx] = next;
        next
    }

    /// The shared-key vector of `comm`, indexed by rank.
    pub fn shared_keys(&self, comm: C) -> &[u32] {
        &self.key_storage[self.key_idx(comm)]
    }

    /// The current nonce of `comm`.
    pub fn nonce(&self, comm: C) -> u32 {
        self.nonce_storage[self.nonce_idx(comm)]
    }

    pub fn contains(&self, comm: C) -> bool {
        self.key_index.contains_key(&comm)
    }

    /// Drop a freed communicator's entries. The storage slot is retired
    /// rather than reused, so indices of live handles stay stable.
    pub fn remove(&mut self, comm: C) {
        if let Some(idx) = self.key_index.remove(&comm) {
            self.key_storage[idx] = Vec::new();
        }
        self.nonce_index.remove(&comm);
    }

    /// Teardown at finalize.
    pub fn clear(&mut self) {
        self.key_storage.clear();
        self.key_index.clear();
        self.nonce_storage.clear();
        self.nonce_index.clear();
    }

    pub fn len(&self) -> usize {
        self.key_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key_index.is_empty()
    }

    fn key_idx(&self, comm: C) -> usize {
        *self
            .key_index
            .get(&comm)
            .unwrap_or_else(|| panic!("no shared keys registered for communicator {comm:?}"))
    }

    fn nonce_idx(&self, comm: C) -> usize {
        *self
            .nonce_index
            .get(&comm)
            .unwrap_or_else(|| panic!("no nonce registered for communicator {comm:?}"))
    }
}
