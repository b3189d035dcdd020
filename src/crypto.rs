//! The keyed word generator driving every mask in the layer.
//!
//! Two interchangeable back-ends produce one 32-bit word per seed: a
//! lightweight integer mixer, and an AES-128 variant that amortises one
//! cipher invocation over four output words. The back-end is chosen once at
//! initialisation and held for the process lifetime; all ranks must choose
//! the same one, which is why the selection comes from the environment and
//! not from any negotiated state.

use rand::{rngs::OsRng, RngCore};

use crate::settings::Settings;

/// Words emitted per cipher block by the streaming AES form.
#[cfg(feature = "aesni")]
const WORDS_PER_BLOCK: usize = 4;

/// Fixed 16-byte cipher key loaded at startup for the AES back-end.
#[cfg(feature = "aesni")]
const STARTUP_KEY: [u8; 16] = [
    0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f,
    0x3c,
];

/// Draw one fresh word from the operating system's entropy source.
pub fn random_word() -> u32 {
    OsRng.next_u32()
}

/// Avalanche mixer of the xorshift/multiply class. Fast and uniform, but
/// not cryptographically strong: with enough output an observer can invert
/// it. Acceptable only under the curious-transport threat model.
#[inline]
fn mix32(seed: u32) -> u32 {
    let mut z = seed.wrapping_add(0x9e37_79b9);
    z = (z ^ (z >> 16)).wrapping_mul(0x21f0_aaad);
    z = (z ^ (z >> 15)).wrapping_mul(0x735a_2d97);
    z ^ (z >> 15)
}

/// Keyed pseudo-random word generator.
///
/// `word` is pure: identical seeds yield identical words on every rank and
/// every run, for a given back-end. The mask streams produced by
/// [`mask_stream`](Self::mask_stream) are deterministic functions of
/// `(key, nonce, element index)` alone, so any rank can reproduce any other
/// rank's stream from the shared key vector.
#[derive(Clone)]
pub enum Prf {
    /// Stateless integer mixer (default back-end).
    Lightweight,
    /// AES-128 with the fixed startup key.
    #[cfg(feature = "aesni")]
    Aes128(AesPrf),
}

impl Prf {
    /// Select the back-end for this process.
    pub fn from_settings(settings: &Settings) -> Self {
        if settings.enable_aesni {
            #[cfg(feature = "aesni")]
            {
                debug!("using the aes-128 prf back-end");
                return Prf::Aes128(AesPrf::new(&STARTUP_KEY));
            }
            #[cfg(not(feature = "aesni"))]
            warn!("HEAR_ENABLE_AESNI is set but this build carries no cipher back-end");
        }
        Prf::Lightweight
    }

    /// One word from one seed.
    pub fn word(&self, seed: u32) -> u32 {
        match self {
            Prf::Lightweight => mix32(seed),
            #[cfg(feature = "aesni")]
            Prf::Aes128(aes) => aes.word(seed),
        }
    }

    /// Fill `out` with the mask words of the elements starting at absolute
    /// index `offset`, for the given per-rank key and call nonce.
    ///
    /// The word for element `i` depends only on `(key, nonce, i)`. The AES
    /// form packs four consecutive element seeds into one block, with the
    /// groups aligned to absolute indices so that blocked traversal of a
    /// vector produces the same stream as a single pass.
    pub fn mask_stream(&self, key: u32, nonce: u32, offset: usize, out: &mut [u32]) {
        match self {
            Prf::Lightweight => {
                for (i, w) in out.iter_mut().enumerate() {
                    *w = mix32(element_seed(key, nonce, offset + i));
                }
            }
            #[cfg(feature = "aesni")]
            Prf::Aes128(aes) => {
                let mut filled = 0;
                while filled < out.len() {
                    let at = offset + filled;
                    let lane = at % WORDS_PER_BLOCK;
                    let words = aes.group_words(key, nonce, at - lane);
                    let take = (WORDS_PER_BLOCK - lane).min(out.len() - filled);
                    out[filled..filled + take].copy_from_slice(&words[lane..lane + take]);
                    filled += take;
                }
            }
        }
    }
}

/// Seed for the mask word of one element.
#[inline]
fn element_seed(key: u32, nonce: u32, index: usize) -> u32 {
    key ^ nonce.wrapping_add(index as u32)
}

#[cfg(feature = "aesni")]
pub use self::aesni::AesPrf;

#[cfg(feature = "aesni")]
mod aesni {
    use aes::{
        cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit},
        Aes128,
    };

    use super::{element_seed, WORDS_PER_BLOCK};

    /// AES-128 back-end, keyed once at startup.
    #[derive(Clone)]
    pub struct AesPrf {
        cipher: Aes128,
    }

    impl AesPrf {
        pub(super) fn new(key: &[u8; 16]) -> Self {
            Self {
                cipher: Aes128::new(GenericArray::from_slice(key)),
            }
        }

        /// Encrypt the block `[seed, 0, 0, 0]` and return lane 0.
        pub(super) fn word(&self, seed: u32) -> u32 {
            let mut lanes = [0u32; WORDS_PER_BLOCK];
            lanes[0] = seed;
            self.encrypt_lanes(lanes)[0]
        }

        /// Mask words of the four elements whose first absolute index is
        /// `base` (`base` must be group-aligned).
        pub(super) fn group_words(&self, key: u32, nonce: u32, base: usize) -> [u32; 4] {
            debug_assert_eq!(base % WORDS_PER_BLOCK, 0);
            let mut lanes = [0u32; WORDS_PER_BLOCK];
            for (k, lane) in lanes.iter_mut().enumerate() {
                *lane = element_seed(key, nonce, base + k);
            }
            self.encrypt_lanes(lanes)
        }

        fn encrypt_lanes(&self, lanes: [u32; 4]) -> [u32; 4] {
            let bytes: [u8; 16] = bytemuck::cast(lanes);
            let mut block = GenericArray::from(bytes);
            self.cipher.encrypt_block(&mut block);
            bytemuck::cast(<[u8; 16]>::from(block))
        }
    }
}
