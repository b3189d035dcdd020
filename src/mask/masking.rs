//! The mask transforms, one per supported reduction kind.

use crate::crypto::Prf;

use super::ReduceKind;

/// Elements processed per pass; bounds the stack scratch so masking never
/// allocates on the hot path.
const CHUNK: usize = 256;

/// Scale of the additive float masks: uniform in `[-0.5, 0.5)`, derived
/// from the top 24 bits of the mask word. Small masks keep the rounding
/// drift of the masked float sum within the tolerance the tests allow;
/// hiding weakens for elements far above this scale.
const FLOAT_MASK_SCALE: f32 = 1.0;

/// Masks the elements of one reduction call (or one pipeline block) for a
/// single rank, and provides the inverse for the reduced aggregate.
///
/// `offset` arguments are absolute element offsets into the full vector, so
/// a blocked traversal masks exactly like a single pass and mask words never
/// repeat within a call.
pub struct Masker<'a> {
    prf: &'a Prf,
    keys: &'a [u32],
    nonce: u32,
    rank: usize,
}

impl<'a> Masker<'a> {
    pub fn new(prf: &'a Prf, keys: &'a [u32], nonce: u32, rank: usize) -> Self {
        debug_assert!(rank < keys.len());
        Self {
            prf,
            keys,
            nonce,
            rank,
        }
    }

    /// Whether this rank carries the negated aggregate of the other ranks'
    /// masks. Statically the last rank: exactly one rank must do it for the
    /// masks to telescope, and deriving the role from the rank avoids a
    /// coordination round.
    fn carries_aggregate(&self) -> bool {
        self.rank + 1 == self.keys.len()
    }

    /// Keys of every rank except the aggregate carrier.
    fn foreign_keys(&self) -> &[u32] {
        &self.keys[..self.keys.len() - 1]
    }

    /// Mask `src` into `dst`. Both buffers hold the same number of
    /// elements; `offset` is the absolute element offset of this block.
    pub fn mask(&self, kind: ReduceKind, src: &[u8], dst: &mut [u8], offset: usize) {
        match kind {
            ReduceKind::IntSum => {
                self.mask_int_sum(bytemuck::cast_slice(src), bytemuck::cast_slice_mut(dst), offset)
            }
            ReduceKind::IntProd => {
                self.mask_int_prod(bytemuck::cast_slice(src), bytemuck::cast_slice_mut(dst), offset)
            }
            ReduceKind::FloatSum => self.mask_float_sum(
                bytemuck::cast_slice(src),
                bytemuck::cast_slice_mut(dst),
                offset,
            ),
        }
    }

    /// Inverse transform over the reduced buffer. The masks are built to
    /// cancel inside the reduction itself, so for every kind the aggregate
    /// is already the plaintext result and nothing is transformed; the call
    /// exists so the reduce paths stay symmetric around the shadow call.
    pub fn unmask(&self, _kind: ReduceKind, _buf: &mut [u8], _offset: usize) {}

    fn mask_int_sum(&self, src: &[u32], dst: &mut [u32], offset: usize) {
        debug_assert_eq!(src.len(), dst.len());
        let mut stream = [0u32; CHUNK];
        if self.carries_aggregate() {
            let mut acc = [0u32; CHUNK];
            for (c, (s, d)) in src.chunks(CHUNK).zip(dst.chunks_mut(CHUNK)).enumerate() {
                let at = offset + c * CHUNK;
                let n = s.len();
                acc[..n].fill(0);
                for &key in self.foreign_keys() {
                    self.prf.mask_stream(key, self.nonce, at, &mut stream[..n]);
                    for (a, &m) in acc[..n].iter_mut().zip(&stream[..n]) {
                        *a = a.wrapping_add(m);
                    }
                }
                for ((d, &x), &a) in d.iter_mut().zip(s).zip(&acc[..n]) {
                    *d = x.wrapping_sub(a);
                }
            }
        } else {
            let key = self.keys[self.rank];
            for (c, (s, d)) in src.chunks(CHUNK).zip(dst.chunks_mut(CHUNK)).enumerate() {
                let at = offset + c * CHUNK;
                let n = s.len();
                self.prf.mask_stream(key, self.nonce, at, &mut stream[..n]);
                for ((d, &x), &m) in d.iter_mut().zip(s).zip(&stream[..n]) {
                    *d = x.wrapping_add(m);
                }
            }
        }
    }

    fn mask_int_prod(&self, src: &[u32], dst: &mut [u32], offset: usize) {
        debug_assert_eq!(src.len(), dst.len());
        let mut stream = [0u32; CHUNK];
        if self.carries_aggregate() {
            let mut acc = [0u32; CHUNK];
            for (c, (s, d)) in src.chunks(CHUNK).zip(dst.chunks_mut(CHUNK)).enumerate() {
                let at = offset + c * CHUNK;
                let n = s.len();
                acc[..n].fill(1);
                for &key in self.foreign_keys() {
                    self.prf.mask_stream(key, self.nonce, at, &mut stream[..n]);
                    for (a, &m) in acc[..n].iter_mut().zip(&stream[..n]) {
                        *a = a.wrapping_mul(m | 1);
                    }
                }
                for ((d, &x), &a) in d.iter_mut().zip(s).zip(&acc[..n]) {
                    *d = x.wrapping_mul(odd_inverse(a));
                }
            }
        } else {
            let key = self.keys[self.rank];
            for (c, (s, d)) in src.chunks(CHUNK).zip(dst.chunks_mut(CHUNK)).enumerate() {
                let at = offset + c * CHUNK;
                let n = s.len();
                self.prf.mask_stream(key, self.nonce, at, &mut stream[..n]);
                for ((d, &x), &m) in d.iter_mut().zip(s).zip(&stream[..n]) {
                    *d = x.wrapping_mul(m | 1);
                }
            }
        }
    }

    fn mask_float_sum(&self, src: &[f32], dst: &mut [f32], offset: usize) {
        debug_assert_eq!(src.len(), dst.len());
        let mut stream = [0u32; CHUNK];
        if self.carries_aggregate() {
            // Accumulate the foreign masks in f64 and round once, so the
            // carrier contributes a single rounding error per element.
            let mut acc = [0f64; CHUNK];
            for (c, (s, d)) in src.chunks(CHUNK).zip(dst.chunks_mut(CHUNK)).enumerate() {
                let at = offset + c * CHUNK;
                let n = s.len();
                acc[..n].fill(0.0);
                for &key in self.foreign_keys() {
                    self.prf.mask_stream(key, self.nonce, at, &mut stream[..n]);
                    for (a, &m) in acc[..n].iter_mut().zip(&stream[..n]) {
                        *a += f64::from(float_mask(m));
                    }
                }
                for ((d, &x), &a) in d.iter_mut().zip(s).zip(&acc[..n]) {
                    *d = (f64::from(x) - a) as f32;
                }
            }
        } else {
            let key = self.keys[self.rank];
            for (c, (s, d)) in src.chunks(CHUNK).zip(dst.chunks_mut(CHUNK)).enumerate() {
                let at = offset + c * CHUNK;
                let n = s.len();
                self.prf.mask_stream(key, self.nonce, at, &mut stream[..n]);
                for ((d, &x), &m) in d.iter_mut().zip(s).zip(&stream[..n]) {
                    *d = x + float_mask(m);
                }
            }
        }
    }
}

/// Uniform float in `[-0.5, 0.5) * FLOAT_MASK_SCALE` from the top 24 bits
/// of a mask word.
#[inline]
fn float_mask(word: u32) -> f32 {
    ((word >> 8) as f32 * (1.0 / (1u32 << 24) as f32) - 0.5) * FLOAT_MASK_SCALE
}

/// Multiplicative inverse of an odd word modulo 2^32, by Newton iteration:
/// the first guess is correct to 5 bits and every step doubles that.
#[inline]
fn odd_inverse(a: u32) -> u32 {
    debug_assert_eq!(a & 1, 1);
    let mut x = a.wrapping_mul(3) ^ 2;
    for _ in 0..3 {
        x = x.wrapping_mul(2u32.wrapping_sub(a.wrapping_mul(x)));
    }
    x
}
