//! # layerstream
//!
//! Streams fixed-size layers from a single file through a bounded window of
//! reusable, aligned buffers, overlapping disk reads with consumption.
//!
//! ```text
//! LayerIndex ──> ChunkedLoader ──> SlotPool ──> Pipeline ──> LayerConsumer
//!                     ^                                           │
//!                     └──────────── slot recycled ────────────────┘
//! ```
//!
//! Memory use is `window_size * layer_bytes` no matter how many layers the
//! file holds, and layers are always delivered in ascending order.
//!
//! # Key components
//!
//! - [`PipelineConfig`]: sizes, window, chunking and I/O options
//! - [`LayerIndex`]: layer id to byte range
//! - [`SlotPool`]: preallocated aligned buffers
//! - [`ChunkedLoader`]: parallel positioned reads of one layer
//! - [`Pipeline`]: the prefetch scheduler
//! - [`RunReport`]: per-layer load/consume timings

pub mod config;
pub mod error;
pub mod index;
pub mod loader;
pub mod pattern;
pub mod pool;
pub mod report;
pub mod scheduler;
pub mod source;

pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use index::{LayerDescriptor, LayerId, LayerIndex};
pub use loader::{ChunkedLoader, LoadStats};
pub use pool::{AlignedBuffer, SlotPool, SlotState};
pub use report::{LayerTiming, RunReport};
pub use scheduler::{LayerConsumer, Pipeline, PipelineCursor};
pub use source::{FileSource, LayerSource, MemorySource, OpenConfig};
