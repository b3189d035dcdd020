//! Scratch buffers for masked send data.
//!
//! One interface, two interchangeable implementations: a bounded ring of
//! preallocated slabs, and per-call heap allocation for builds or
//! deployments that opt out of the ring. The interposer code is identical in
//! both configurations.
//!
//! Buffers are handed out as [`Sbuf`] leases that return their slab on drop,
//! so every exit path of a reduction, including the failing ones, releases
//! what it acquired.

use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::settings::Settings;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("all {0} scratch buffers are in use")]
    Exhausted(usize),
    #[error("requested {requested} bytes but slabs hold {slab_len}")]
    SlabTooSmall { requested: usize, slab_len: usize },
}

/// Slabs are stored as word vectors so that a lease can be viewed as any
/// supported element type without alignment hazards.
type Slab = Box<[u32]>;

#[derive(Debug, Default)]
struct Inner {
    /// Free slabs; empty and unused in heap mode.
    free: Vec<Slab>,
    in_use: usize,
    peak_in_use: usize,
    low_watermark: usize,
    acquisitions: u64,
}

/// Scratch-buffer pool.
#[derive(Debug)]
pub struct SbufPool {
    inner: Arc<Mutex<Inner>>,
    /// `Some((capacity, slab_len))` for the ring, `None` for heap fallback.
    ring: Option<(usize, usize)>,
}

impl SbufPool {
    /// Build the pool the settings ask for.
    pub fn new(settings: &Settings) -> Self {
        if settings.mpool {
            Self::ring(settings.mpool_size, settings.mpool_sbuf_len)
        } else {
            Self::heap()
        }
    }

    /// A bounded ring of `size` preallocated slabs of `slab_len` bytes.
    pub fn ring(size: usize, slab_len: usize) -> Self {
        let words = slab_len.div_ceil(4);
        let free = (0..size)
            .map(|_| vec![0u32; words].into_boxed_slice())
            .collect();
        debug!(size, slab_len, "preallocated scratch-buffer ring");
        Self {
            inner: Arc::new(Mutex::new(Inner {
                free,
                low_watermark: size,
                ..Inner::default()
            })),
            ring: Some((size, slab_len)),
        }
    }

    /// Per-call heap allocation behind the same interface.
    pub fn heap() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            ring: None,
        }
    }

    /// Lease a buffer of at least `len` bytes.
    pub fn acquire(&self, len: usize) -> Result<Sbuf, PoolError> {
        let mut inner = self.inner.lock().expect("poisoned scratch-pool lock");
        let slab = match self.ring {
            Some((capacity, slab_len)) => {
                if len > slab_len {
                    return Err(PoolError::SlabTooSmall {
                        requested: len,
                        slab_len,
                    });
                }
                let slab = inner.free.pop().ok_or(PoolError::Exhausted(capacity))?;
                inner.low_watermark = inner.low_watermark.min(inner.free.len());
                slab
            }
            None => vec![0u32; len.div_ceil(4)].into_boxed_slice(),
        };
        inner.in_use += 1;
        inner.peak_in_use = inner.peak_in_use.max(inner.in_use);
        inner.acquisitions += 1;
        Ok(Sbuf {
            slab,
            len,
            inner: Arc::clone(&self.inner),
            ring: self.ring.is_some(),
        })
    }

    /// Free slabs currently in the ring; always zero in heap mode.
    pub fn available(&self) -> usize {
        self.inner
            .lock()
            .expect("poisoned scratch-pool lock")
            .free
            .len()
    }

    /// Fewest slabs ever simultaneously free; always zero in heap mode.
    pub fn low_watermark(&self) -> usize {
        self.inner
            .lock()
            .expect("poisoned scratch-pool lock")
            .low_watermark
    }

    /// Leases currently outstanding.
    pub fn in_use(&self) -> usize {
        self.inner.lock().expect("poisoned scratch-pool lock").in_use
    }

    /// Most leases ever outstanding at once.
    pub fn peak_in_use(&self) -> usize {
        self.inner
            .lock()
            .expect("poisoned scratch-pool lock")
            .peak_in_use
    }

    /// Total number of successful acquisitions.
    pub fn acquisitions(&self) -> u64 {
        self.inner
            .lock()
            .expect("poisoned scratch-pool lock")
            .acquisitions
    }

    /// Ring capacity, or `None` in heap mode.
    pub fn capacity(&self) -> Option<usize> {
        self.ring.map(|(capacity, _)| capacity)
    }
}

/// An exclusive lease on one scratch buffer, viewed as `len` bytes. The
/// slab goes back to the ring (or the allocator) when the lease drops.
#[derive(Debug)]
pub struct Sbuf {
    slab: Slab,
    len: usize,
    inner: Arc<Mutex<Inner>>,
    ring: bool,
}

impl std::ops::Deref for Sbuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.slab)[..self.len]
    }
}

impl std::ops::DerefMut for Sbuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.slab)[..self.len]
    }
}

impl Drop for Sbuf {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().expect("poisoned scratch-pool lock");
        inner.in_use -= 1;
        if self.ring {
            inner.free.push(std::mem::take(&mut self.slab));
        }
    }
}
