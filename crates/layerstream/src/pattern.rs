//! Deterministic per-layer byte pattern for generating and checking layer files.
//!
//! Byte 0 of layer 0 is zero on purpose: readiness is never inferred from
//! buffer contents.

use std::io::{self, Write};
use std::path::Path;

use crate::index::LayerId;

/// Pattern byte at `pos` within `layer`.
#[inline]
pub fn pattern_byte(layer: LayerId, pos: usize) -> u8 {
    (layer.wrapping_mul(131) ^ pos.wrapping_mul(7) ^ (pos >> 8)) as u8
}

/// Fill `buf` with the pattern of `layer`.
pub fn fill_layer(layer: LayerId, buf: &mut [u8]) {
    for (pos, b) in buf.iter_mut().enumerate() {
        *b = pattern_byte(layer, pos);
    }
}

/// Position of the first byte in `data` that does not match `layer`'s pattern.
pub fn first_mismatch(layer: LayerId, data: &[u8]) -> Option<usize> {
    data.iter()
        .enumerate()
        .position(|(pos, &b)| b != pattern_byte(layer, pos))
}

/// Write `layer_count` patterned layers of `layer_bytes` to `writer`.
pub fn write_layers<W: Write>(mut writer: W, layer_count: usize, layer_bytes: usize) -> io::Result<()> {
    let mut buf = vec![0u8; layer_bytes];
    for layer in 0..layer_count {
        fill_layer(layer, &mut buf);
        writer.write_all(&buf)?;
    }
    writer.flush()
}

/// Create (or truncate) `path` and fill it with patterned layers.
pub fn write_layer_file(path: &Path, layer_count: usize, layer_bytes: usize) -> io::Result<()> {
    let file = std::fs::File::create(path)?;
    write_layers(io::BufWriter::new(file), layer_count, layer_bytes)?;
    tracing::info!(
        "wrote {} layers x {} bytes to {}",
        layer_count,
        layer_bytes,
        path.display()
    );
    Ok(())
}
