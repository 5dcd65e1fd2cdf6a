//! Configuration for the layer streaming pipeline.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Default buffer alignment; one page, which also satisfies `O_DIRECT`.
pub const DEFAULT_ALIGNMENT: usize = 4096;

/// Configuration for a streaming run.
///
/// Memory cost is `window_size * layer_bytes`, independent of `layer_count`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Number of fixed-size layers stored in the backing file.
    pub layer_count: usize,

    /// Size of every layer in bytes.
    pub layer_bytes: usize,

    /// Look-ahead depth: number of slots, and the max number of layers
    /// resident or in flight at once.
    pub window_size: usize,

    /// Number of concurrent positioned reads used to load one layer.
    pub chunk_count: usize,

    /// Threads in the chunk-read pool. `0` lets rayon pick.
    #[serde(default)]
    pub io_threads: usize,

    /// Alignment of every slot buffer in bytes (power of two).
    #[serde(default = "default_alignment")]
    pub alignment: usize,

    /// Open the backing file with `O_DIRECT` (Linux only).
    #[serde(default)]
    pub direct_io: bool,

    /// Open one independent file handle per chunk instead of sharing one.
    #[serde(default)]
    pub handle_per_chunk: bool,

    /// Extra attempts for a failing chunk read before the run aborts.
    #[serde(default)]
    pub max_read_retries: u32,
}

fn default_alignment() -> usize {
    DEFAULT_ALIGNMENT
}

impl PipelineConfig {
    /// Config for `layer_count` layers of `layer_bytes`, with a window of 8
    /// and 64 chunks per layer.
    pub fn new(layer_count: usize, layer_bytes: usize) -> Self {
        Self {
            layer_count,
            layer_bytes,
            window_size: 8,
            chunk_count: 64,
            io_threads: 0,
            alignment: DEFAULT_ALIGNMENT,
            direct_io: false,
            handle_per_chunk: false,
            max_read_retries: 0,
        }
    }

    /// The reference workload: 34 transformer-sized layers of ~66 MiB each
    /// (one 3072/8192-wide block packed at 4 bits per weight).
    pub fn reference() -> Self {
        let weights = (3072 * 3072 * 2) + (3072 * 256 * 2) + (3072 * 8192 * 2) + (8192 * 8192);
        Self::new(34, weights * 4 / 8)
    }

    pub fn with_window(mut self, window_size: usize) -> Self {
        self.window_size = window_size;
        self
    }

    pub fn with_chunks(mut self, chunk_count: usize) -> Self {
        self.chunk_count = chunk_count;
        self
    }

    pub fn with_io_threads(mut self, io_threads: usize) -> Self {
        self.io_threads = io_threads;
        self
    }

    pub fn with_direct_io(mut self, direct_io: bool) -> Self {
        self.direct_io = direct_io;
        self
    }

    pub fn with_read_retries(mut self, retries: u32) -> Self {
        self.max_read_retries = retries;
        self
    }

    /// Load a config from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::InvalidConfig(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|e| {
            PipelineError::InvalidConfig(format!("failed to parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field for a usable value.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(PipelineError::InvalidConfig(msg));

        if self.layer_count == 0 {
            return invalid("layer_count must be > 0".into());
        }
        if self.layer_bytes == 0 {
            return invalid("layer_bytes must be > 0".into());
        }
        if self.window_size == 0 {
            return invalid("window_size must be > 0".into());
        }
        if self.chunk_count == 0 {
            return invalid("chunk_count must be > 0".into());
        }
        if !self.alignment.is_power_of_two() {
            return invalid(format!("alignment {} is not a power of two", self.alignment));
        }
        if (self.layer_count as u64).checked_mul(self.layer_bytes as u64).is_none() {
            return invalid(format!(
                "{} layers of {} bytes overflow the file offset range",
                self.layer_count, self.layer_bytes
            ));
        }
        if self.direct_io && self.layer_bytes % self.alignment != 0 {
            return invalid(format!(
                "direct I/O needs layer_bytes ({}) to be a multiple of alignment ({})",
                self.layer_bytes, self.alignment
            ));
        }
        Ok(())
    }

    /// Number of slots actually needed: the window never exceeds the layer count.
    pub fn effective_window(&self) -> usize {
        self.window_size.min(self.layer_count)
    }

    /// Bytes held by the slot pool.
    pub fn memory_budget(&self) -> usize {
        self.effective_window().saturating_mul(self.layer_bytes)
    }

    /// Total size of the backing file.
    pub fn file_bytes(&self) -> u64 {
        self.layer_count as u64 * self.layer_bytes as u64
    }
}
