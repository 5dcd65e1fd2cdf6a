//! Chunked loader: reads one layer into a slot buffer with parallel `pread`s.
//!
//! ```text
//! layer bytes   [ chunk 0 | chunk 1 | chunk 2 | chunk 3 + remainder ]
//!                    |         |         |            |
//! io pool         read_at   read_at   read_at      read_at     (concurrent)
//!                    v         v         v            v
//! slot buffer   [ region 0| region 1| region 2| region 3           ]
//! ```
//!
//! Regions are disjoint `&mut` slices of the destination buffer, so chunk
//! reads need no synchronisation between them.

use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rayon::prelude::*;

use crate::error::{PipelineError, Result};
use crate::index::{LayerDescriptor, LayerId};
use crate::source::LayerSource;

/// Outcome of a successful [`ChunkedLoader::load_into`].
#[derive(Debug, Clone)]
pub struct LoadStats {
    pub layer: LayerId,
    pub chunks: usize,
    pub bytes: usize,
    pub elapsed: Duration,
    /// Chunk reads that were re-issued after a failure.
    pub retries: u32,
}

/// Split `len` bytes into at most `chunk_count` contiguous ranges.
///
/// All ranges share the same length except the last, which absorbs the
/// remainder. Interior boundaries are multiples of `granularity`. The chunk
/// count is clamped so no range is empty.
pub fn chunk_ranges(len: usize, chunk_count: usize, granularity: usize) -> Vec<Range<usize>> {
    if len == 0 {
        return Vec::new();
    }
    let granularity = granularity.max(1);
    let units = (len / granularity).max(1);
    let count = chunk_count.clamp(1, units);
    let base = (len / count) / granularity * granularity;
    if base == 0 {
        return vec![0..len];
    }

    let mut ranges: Vec<Range<usize>> = (0..count - 1).map(|i| i * base..(i + 1) * base).collect();
    ranges.push((count - 1) * base..len);
    ranges
}

/// Loads whole layers from a [`LayerSource`] using one read per chunk.
pub struct ChunkedLoader {
    source: Arc<dyn LayerSource>,
    chunk_count: usize,
    granularity: usize,
    max_retries: u32,
    io_pool: rayon::ThreadPool,
}

impl std::fmt::Debug for ChunkedLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedLoader")
            .field("chunk_count", &self.chunk_count)
            .field("granularity", &self.granularity)
            .field("max_retries", &self.max_retries)
            .field("io_threads", &self.io_pool.current_num_threads())
            .finish()
    }
}

impl ChunkedLoader {
    /// Create a loader.
    ///
    /// - `chunk_count`: reads issued per layer
    /// - `io_threads`: size of the read pool, `0` for rayon's default
    /// - `granularity`: chunk boundary alignment (the buffer alignment for direct I/O, else 1)
    /// - `max_retries`: extra attempts per failing chunk
    pub fn new(
        source: Arc<dyn LayerSource>,
        chunk_count: usize,
        io_threads: usize,
        granularity: usize,
        max_retries: u32,
    ) -> Result<Self> {
        if chunk_count == 0 {
            return Err(PipelineError::InvalidConfig("chunk_count must be > 0".into()));
        }
        let io_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(io_threads)
            .thread_name(|i| format!("layerstream-io-{i}"))
            .build()
            .map_err(|e| PipelineError::InvalidConfig(format!("failed to build io pool: {e}")))?;

        Ok(Self {
            source,
            chunk_count,
            granularity: granularity.max(1),
            max_retries,
            io_pool,
        })
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    pub fn source(&self) -> &Arc<dyn LayerSource> {
        &self.source
    }

    /// Fill `buffer[..layer.byte_length]` with the layer's bytes.
    ///
    /// Blocks until every chunk has completed. If any chunk fails, the error
    /// of the lowest-indexed failing chunk is returned and the buffer
    /// contents are unspecified.
    pub fn load_into(&self, buffer: &mut [u8], layer: &LayerDescriptor) -> Result<LoadStats> {
        if buffer.len() < layer.byte_length {
            return Err(PipelineError::SchedulerInvariantViolation(format!(
                "buffer of {} bytes cannot hold layer {} ({} bytes)",
                buffer.len(),
                layer.id,
                layer.byte_length
            )));
        }
        let t_start = Instant::now();
        let ranges = chunk_ranges(layer.byte_length, self.chunk_count, self.granularity);
        let chunks = ranges.len();

        let mut regions = Vec::with_capacity(chunks);
        let mut rest = &mut buffer[..layer.byte_length];
        for (lane, range) in ranges.into_iter().enumerate() {
            let (head, tail) = std::mem::take(&mut rest).split_at_mut(range.len());
            regions.push((lane, range.start, head));
            rest = tail;
        }

        let outcomes: Vec<Result<u32>> = self.io_pool.install(|| {
            regions
                .into_par_iter()
                .with_max_len(1)
                .map(|(lane, rel, dst)| self.read_chunk(layer, lane, rel, dst))
                .collect()
        });

        let mut retries = 0;
        for outcome in outcomes {
            retries += outcome?;
        }

        Ok(LoadStats {
            layer: layer.id,
            chunks,
            bytes: layer.byte_length,
            elapsed: t_start.elapsed(),
            retries,
        })
    }

    /// Read one chunk, retrying up to `max_retries` times. Returns the
    /// number of retries used.
    fn read_chunk(&self, layer: &LayerDescriptor, lane: usize, rel: usize, dst: &mut [u8]) -> Result<u32> {
        let start = layer.byte_offset + rel as u64;
        let range = start..start + dst.len() as u64;
        let mut attempt = 0;

        loop {
            let err = match read_full(self.source.as_ref(), lane, dst, start) {
                Ok(n) if n == dst.len() => {
                    tracing::trace!(layer = layer.id, chunk = lane, offset = start, len = n, "chunk read");
                    return Ok(attempt);
                }
                Ok(n) => PipelineError::IncompleteRead {
                    layer: layer.id,
                    range: range.clone(),
                    read: n,
                    expected: dst.len(),
                },
                Err(source) => PipelineError::Io { layer: layer.id, range: range.clone(), source },
            };

            if attempt >= self.max_retries {
                return Err(err);
            }
            attempt += 1;
            tracing::warn!(layer = layer.id, chunk = lane, attempt, error = %err, "retrying chunk read");
        }
    }
}

/// `pread` until `dst` is full or the source reports end of data.
fn read_full(source: &dyn LayerSource, lane: usize, dst: &mut [u8], offset: u64) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < dst.len() {
        match source.read_at(lane, &mut dst[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
