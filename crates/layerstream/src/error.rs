//! Error taxonomy for the prefetch pipeline.

use std::ops::Range;
use std::path::PathBuf;

use crate::index::LayerId;

/// Errors produced while building or running a [`Pipeline`](crate::Pipeline).
///
/// Every load failure names the layer and the absolute byte range of the
/// chunk that failed, so an aborted run can be traced back to the file.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("layer {layer} out of range (layer count {count})")]
    OutOfRange { layer: LayerId, count: usize },

    #[error("failed to allocate {bytes} bytes (align {align}) for slot {slot}")]
    OutOfMemory { slot: usize, bytes: usize, align: usize },

    #[error("short read on layer {layer}, bytes {}..{}: got {read} of {expected}", range.start, range.end)]
    IncompleteRead {
        layer: LayerId,
        range: Range<u64>,
        read: usize,
        expected: usize,
    },

    #[error("I/O error on layer {layer}, bytes {}..{}: {source}", range.start, range.end)]
    Io {
        layer: LayerId,
        range: Range<u64>,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("scheduler invariant violated: {0}")]
    SchedulerInvariantViolation(String),

    #[error("invalid pipeline config: {0}")]
    InvalidConfig(String),

    #[error("consumer failed on layer {layer}: {source}")]
    Consumer {
        layer: LayerId,
        #[source]
        source: anyhow::Error,
    },

    /// A load or consumer task panicked or was cancelled.
    #[error("background task for layer {layer} failed: {msg}")]
    TaskFailed { layer: LayerId, msg: String },

    #[error("tokio runtime error: {0}")]
    Runtime(String),
}

impl PipelineError {
    /// Layer the error is attributed to, if any.
    pub fn layer(&self) -> Option<LayerId> {
        match self {
            PipelineError::OutOfRange { layer, .. }
            | PipelineError::IncompleteRead { layer, .. }
            | PipelineError::Io { layer, .. }
            | PipelineError::Consumer { layer, .. }
            | PipelineError::TaskFailed { layer, .. } => Some(*layer),
            _ => None,
        }
    }

    /// Absolute file byte range of the failing chunk, for load errors.
    pub fn byte_range(&self) -> Option<Range<u64>> {
        match self {
            PipelineError::IncompleteRead { range, .. } | PipelineError::Io { range, .. } => {
                Some(range.clone())
            }
            _ => None,
        }
    }
}

/// Result alias used throughout the pipeline.
pub type Result<T> = std::result::Result<T, PipelineError>;
