//! Layer index: maps a layer id to its byte range in the backing file.

use std::ops::Range;

use crate::error::{PipelineError, Result};

/// Logical layer identifier, `0..layer_count`.
pub type LayerId = usize;

/// Location of one layer in the backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerDescriptor {
    pub id: LayerId,
    pub byte_offset: u64,
    pub byte_length: usize,
}

impl LayerDescriptor {
    /// Absolute byte range `[offset, offset + length)`.
    pub fn byte_range(&self) -> Range<u64> {
        self.byte_offset..self.byte_offset + self.byte_length as u64
    }
}

/// Lookup table of layer descriptors, built once from a record size and count.
///
/// Records are contiguous with no header: layer `i` starts at `i * layer_bytes`.
#[derive(Debug, Clone)]
pub struct LayerIndex {
    layers: Vec<LayerDescriptor>,
}

impl LayerIndex {
    pub fn new(layer_count: usize, layer_bytes: usize) -> Result<Self> {
        if layer_bytes == 0 {
            return Err(PipelineError::InvalidConfig("layer_bytes must be > 0".into()));
        }
        (layer_count as u64)
            .checked_mul(layer_bytes as u64)
            .ok_or_else(|| {
                PipelineError::InvalidConfig(format!(
                    "{layer_count} layers of {layer_bytes} bytes overflow u64"
                ))
            })?;

        let layers = (0..layer_count)
            .map(|id| LayerDescriptor {
                id,
                byte_offset: id as u64 * layer_bytes as u64,
                byte_length: layer_bytes,
            })
            .collect();
        Ok(Self { layers })
    }

    /// Byte offset of `layer` in the backing file.
    pub fn offset_of(&self, layer: LayerId) -> Result<u64> {
        self.descriptor(layer).map(|d| d.byte_offset)
    }

    pub fn descriptor(&self, layer: LayerId) -> Result<LayerDescriptor> {
        self.layers.get(layer).copied().ok_or(PipelineError::OutOfRange {
            layer,
            count: self.layers.len(),
        })
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LayerDescriptor> {
        self.layers.iter()
    }

    /// Bytes spanned by all layers.
    pub fn total_bytes(&self) -> u64 {
        self.layers.last().map_or(0, |d| d.byte_range().end)
    }
}
