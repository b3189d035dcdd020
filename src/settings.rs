//! Module for loading and validating the layer settings.
//!
//! Runtime values come from `HEAR_*` environment variables; the build
//! features pick the defaults for the pool and pipelining switches.

use config::{Config, ConfigError, Environment};
use serde::Deserialize;
use thiserror::Error;
use validator::{Validate, ValidationError, ValidationErrors};

/// Elements per pipeline block when nothing else is configured.
pub const DEFAULT_PIPELINING_BLOCK_SIZE: usize = 65_536;
/// Slabs in the scratch pool when nothing else is configured.
pub const DEFAULT_MPOOL_SIZE: usize = 4;
/// Slab byte length when nothing else is configured (8 MiB).
pub const DEFAULT_MPOOL_SBUF_LEN: usize = 8 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Clone, Copy, Validate)]
#[validate(schema(function = "validate_pool_geometry"))]
pub struct Settings {
    /// Select the cipher-based word generator instead of the lightweight
    /// mixer. Only effective in builds carrying the `aesni` feature; all
    /// ranks must agree on the selection.
    ///
    /// # Examples
    ///
    /// **Environment variable**
    /// ```text
    /// HEAR_ENABLE_AESNI=1
    /// ```
    pub enable_aesni: bool,

    /// Split each reduction into blocks and overlap masking with the
    /// transfer. Chosen at build time (`pipelining` feature); kept as data
    /// so that one artifact can exercise both paths.
    pub pipelining: bool,

    /// Elements per pipeline block.
    ///
    /// # Examples
    ///
    /// **Environment variable**
    /// ```text
    /// HEAR_PIPELINING_BLOCK_SIZE=65536
    /// ```
    #[validate(range(min = 1))]
    pub pipelining_block_size: usize,

    /// Serve scratch buffers from a preallocated ring instead of the heap.
    /// Chosen at build time (`mpool` feature).
    pub mpool: bool,

    /// Slabs in the scratch pool. At least two are needed once pipelining
    /// is enabled.
    ///
    /// # Examples
    ///
    /// **Environment variable**
    /// ```text
    /// HEAR_MPOOL_SIZE=4
    /// ```
    #[validate(range(min = 1))]
    pub mpool_size: usize,

    /// Byte length of one slab.
    ///
    /// # Examples
    ///
    /// **Environment variable**
    /// ```text
    /// HEAR_MPOOL_SBUF_LEN=8388608
    /// ```
    #[validate(range(min = 1))]
    pub mpool_sbuf_len: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enable_aesni: false,
            pipelining: cfg!(feature = "pipelining"),
            pipelining_block_size: DEFAULT_PIPELINING_BLOCK_SIZE,
            mpool: cfg!(feature = "mpool"),
            mpool_size: DEFAULT_MPOOL_SIZE,
            mpool_sbuf_len: DEFAULT_MPOOL_SBUF_LEN,
        }
    }
}

/// Raw view of the environment before defaults are applied.
#[derive(Debug, Deserialize)]
struct EnvOverrides {
    enable_aesni: Option<String>,
    pipelining_block_size: Option<usize>,
    mpool_size: Option<usize>,
    mpool_sbuf_len: Option<usize>,
}

impl Settings {
    /// Loads and validates the settings from the `HEAR_*` environment
    /// variables. Fails when a variable does not parse or the combination
    /// is invalid.
    pub fn new() -> Result<Self, SettingsError> {
        let overrides: EnvOverrides = Config::builder()
            .add_source(Environment::with_prefix("hear"))
            .build()?
            .try_deserialize()?;

        let mut settings = Self::default();
        settings.enable_aesni = overrides.enable_aesni.is_some();
        if let Some(block_size) = overrides.pipelining_block_size {
            settings.pipelining_block_size = block_size;
        }
        if let Some(size) = overrides.mpool_size {
            settings.mpool_size = size;
        }
        if let Some(len) = overrides.mpool_sbuf_len {
            settings.mpool_sbuf_len = len;
        }
        settings.validate()?;
        Ok(settings)
    }
}

/// The slab geometry must be able to serve the reduce paths: pipelining
/// keeps two blocks in flight, and a slab must hold one full block of the
/// widest maskable element (4 bytes).
fn validate_pool_geometry(settings: &Settings) -> Result<(), ValidationError> {
    if settings.pipelining && settings.mpool {
        if settings.mpool_size < 2 {
            return Err(ValidationError::new("pool_too_small_for_pipelining"));
        }
        if settings.mpool_sbuf_len < settings.pipelining_block_size.saturating_mul(4) {
            return Err(ValidationError::new("slab_smaller_than_pipeline_block"));
        }
    }
    Ok(())
}
