//! End-to-end runs of the prefetch pipeline against real files.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use layerstream::pattern;
use layerstream::{
    LayerId, LayerSource, MemorySource, Pipeline, PipelineConfig, PipelineError, RunReport, SlotState,
};
use parking_lot::Mutex;

const LAYER_BYTES: usize = 4096;

/// Write `layers` patterned layers, then `tail` extra bytes of layer `layers`.
fn layer_file(layers: usize, tail: usize) -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().expect("create tempfile");
    pattern::write_layers(&mut f, layers, LAYER_BYTES).expect("write layers");
    if tail > 0 {
        let mut partial = vec![0u8; LAYER_BYTES];
        pattern::fill_layer(layers, &mut partial);
        f.write_all(&partial[..tail]).expect("write tail");
    }
    f.flush().expect("flush");
    f
}

/// Consumer that checks the pattern and records the order it saw.
fn recording_consumer(
    seen: Arc<Mutex<Vec<LayerId>>>,
    delay: Duration,
) -> impl FnMut(LayerId, &[u8]) -> anyhow::Result<()> + Send + 'static {
    move |layer, data| {
        if let Some(pos) = pattern::first_mismatch(layer, data) {
            anyhow::bail!("layer {layer} corrupt at byte {pos}");
        }
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        seen.lock().push(layer);
        Ok(())
    }
}

/// Per slot, a lookahead load never starts before the previous occupant
/// was fully consumed, and each layer is loaded before it is consumed.
fn assert_no_overlap(report: &RunReport) {
    for t in &report.layers {
        assert!(t.load_end <= t.consume_start, "layer {} consumed before loaded", t.layer);
    }
    for slot in 0..report.window {
        let timeline: Vec<_> = report.slot_timeline(slot).collect();
        for pair in timeline.windows(2) {
            let (prev, next) = (pair[0], pair[1]);
            assert_eq!(next.layer, prev.layer + report.window);
            assert!(
                next.load_start >= prev.consume_end,
                "slot {slot}: layer {} load started at {:?} before layer {} consume ended at {:?}",
                next.layer,
                next.load_start,
                prev.layer,
                prev.consume_end,
            );
        }
    }
}

/// Nothing is consumed until every layer of the initial window is loaded.
fn assert_startup_barrier(report: &RunReport) {
    let first = &report.layers[0];
    let ready = report.layers[..report.window]
        .iter()
        .map(|t| t.load_end)
        .max()
        .unwrap();
    assert!(
        first.consume_start >= ready,
        "layer 0 consumed at {:?} before startup window was ready at {:?}",
        first.consume_start,
        ready,
    );
}

#[tokio::test]
async fn test_six_layers_window_two() {
    let file = layer_file(6, 0);
    let config = PipelineConfig::new(6, LAYER_BYTES).with_window(2).with_chunks(2).with_io_threads(2);
    let mut pipeline = Pipeline::open(config, file.path()).unwrap();
    assert_eq!(pipeline.pool().buffers_allocated(), 2);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let report = pipeline
        .run(recording_consumer(seen.clone(), Duration::from_millis(1)))
        .await
        .unwrap();

    assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(report.consumed_order(), vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(report.pool_buffers, 2);

    let slots: Vec<usize> = report.layers.iter().map(|t| t.slot).collect();
    assert_eq!(slots, vec![0, 1, 0, 1, 0, 1]);

    // Layer 2 reuses slot 0 only after layer 0 was consumed.
    assert!(report.layers[2].load_start >= report.layers[0].consume_end);
    assert_startup_barrier(&report);
    assert_no_overlap(&report);
    assert!(pipeline.pool().is_idle());
}

#[tokio::test]
async fn test_window_larger_than_layer_count() {
    let file = layer_file(3, 0);
    let config = PipelineConfig::new(3, LAYER_BYTES).with_window(16).with_chunks(4).with_io_threads(2);
    let mut pipeline = Pipeline::open(config, file.path()).unwrap();
    assert_eq!(pipeline.pool().len(), 3);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let report = pipeline
        .run(recording_consumer(seen.clone(), Duration::ZERO))
        .await
        .unwrap();

    assert_eq!(*seen.lock(), vec![0, 1, 2]);
    assert_eq!(report.window, 3);
    assert_eq!(report.pool_buffers, 3);
}

#[tokio::test]
async fn test_single_slot_window() {
    let file = layer_file(4, 0);
    let config = PipelineConfig::new(4, LAYER_BYTES).with_window(1).with_chunks(3).with_io_threads(2);
    let mut pipeline = Pipeline::open(config, file.path()).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let report = pipeline.run(recording_consumer(seen.clone(), Duration::ZERO)).await.unwrap();

    assert_eq!(*seen.lock(), vec![0, 1, 2, 3]);
    assert!(report.layers.iter().all(|t| t.slot == 0));
    assert_no_overlap(&report);
}

#[tokio::test]
async fn test_many_layers_with_slow_consumer() {
    let file = layer_file(24, 0);
    let mut config = PipelineConfig::new(24, LAYER_BYTES).with_window(3).with_chunks(8).with_io_threads(4);
    config.handle_per_chunk = true;
    let mut pipeline = Pipeline::open(config, file.path()).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let report = pipeline
        .run(recording_consumer(seen.clone(), Duration::from_millis(2)))
        .await
        .unwrap();

    assert_eq!(*seen.lock(), (0..24).collect::<Vec<_>>());
    assert_eq!(report.pool_buffers, 3);
    assert_eq!(report.bytes_loaded, 24 * LAYER_BYTES as u64);
    assert_startup_barrier(&report);
    assert_no_overlap(&report);
}

#[tokio::test]
async fn test_short_read_aborts_run() {
    // Layer 4 is cut off 1000 bytes into its first chunk; layer 5 is missing.
    let file = layer_file(4, 1000);
    let config = PipelineConfig::new(6, LAYER_BYTES).with_window(2).with_chunks(2).with_io_threads(2);
    let mut pipeline = Pipeline::open(config, file.path()).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let err = pipeline
        .run(recording_consumer(seen.clone(), Duration::ZERO))
        .await
        .unwrap_err();

    match err {
        PipelineError::IncompleteRead { layer, range, read, expected } => {
            assert_eq!(layer, 4);
            assert_eq!(range, 16384..18432);
            assert_eq!(read, 1000);
            assert_eq!(expected, 2048);
        }
        other => panic!("expected IncompleteRead, got {other:?}"),
    }

    // Every layer before the truncated one is still delivered.
    assert_eq!(*seen.lock(), vec![0, 1, 2, 3]);
    assert!(pipeline.pool().is_idle());
}

/// Fails every read that starts inside `bad`.
struct FaultySource {
    inner: MemorySource,
    bad: std::ops::Range<u64>,
}

impl FaultySource {
    fn new(layers: usize, bad_layer: usize) -> Self {
        let mut data = Vec::new();
        pattern::write_layers(&mut data, layers, LAYER_BYTES).unwrap();
        let start = (bad_layer * LAYER_BYTES) as u64;
        Self { inner: MemorySource::new(data), bad: start..start + LAYER_BYTES as u64 }
    }
}

impl LayerSource for FaultySource {
    fn read_at(&self, lane: usize, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if self.bad.contains(&offset) {
            return Err(io::Error::new(io::ErrorKind::Other, "device fault"));
        }
        self.inner.read_at(lane, buf, offset)
    }

    fn len(&self) -> io::Result<u64> {
        self.inner.len()
    }
}

#[tokio::test]
async fn test_io_error_names_layer() {
    let source = FaultySource::new(5, 3);
    let bad_start = 3 * LAYER_BYTES as u64;

    let config = PipelineConfig::new(5, LAYER_BYTES).with_window(2).with_chunks(4).with_io_threads(2);
    let mut pipeline = Pipeline::new(config, Arc::new(source)).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let err = pipeline
        .run(recording_consumer(seen.clone(), Duration::ZERO))
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Io { layer: 3, .. }), "got {err:?}");
    assert_eq!(err.byte_range(), Some(bad_start..bad_start + 1024));
    assert_eq!(*seen.lock(), vec![0, 1, 2]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_lookahead_consumes_exact_prefix() {
    // Layer 5 fails long before it reaches the front; layers 0..5 are
    // delivered on every run regardless of load timing.
    let config = PipelineConfig::new(8, LAYER_BYTES).with_window(3).with_chunks(4).with_io_threads(2);
    let mut pipeline = Pipeline::new(config, Arc::new(FaultySource::new(8, 5))).unwrap();

    for _ in 0..10 {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let err = pipeline
            .run(recording_consumer(seen.clone(), Duration::from_millis(2)))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Io { layer: 5, .. }), "got {err:?}");
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
        assert!(pipeline.pool().is_idle());
    }
}

#[tokio::test]
async fn test_failure_in_startup_window_consumes_nothing() {
    let config = PipelineConfig::new(6, LAYER_BYTES).with_window(3).with_chunks(2).with_io_threads(2);
    let mut pipeline = Pipeline::new(config, Arc::new(FaultySource::new(6, 1))).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let err = pipeline
        .run(recording_consumer(seen.clone(), Duration::ZERO))
        .await
        .unwrap_err();
    assert_eq!(err.layer(), Some(1));
    assert!(seen.lock().is_empty());
    assert!(pipeline.pool().is_idle());
}

#[tokio::test]
async fn test_consumer_panic_returns_buffer() {
    let file = layer_file(4, 0);
    let config = PipelineConfig::new(4, LAYER_BYTES).with_window(2).with_chunks(2).with_io_threads(2);
    let mut pipeline = Pipeline::open(config, file.path()).unwrap();

    let err = pipeline
        .run(|layer: LayerId, _: &[u8]| -> anyhow::Result<()> {
            if layer == 1 {
                panic!("kernel crashed on layer {layer}");
            }
            Ok(())
        })
        .await
        .unwrap_err();
    match &err {
        PipelineError::TaskFailed { layer, msg } => {
            assert_eq!(*layer, 1);
            assert!(msg.contains("kernel crashed on layer 1"), "{msg}");
        }
        other => panic!("expected TaskFailed, got {other:?}"),
    }
    assert_eq!(pipeline.slot_states(), vec![SlotState::Empty, SlotState::Empty]);
    assert!(pipeline.pool().is_idle());

    let seen = Arc::new(Mutex::new(Vec::new()));
    pipeline.run(recording_consumer(seen.clone(), Duration::ZERO)).await.unwrap();
    assert_eq!(*seen.lock(), vec![0, 1, 2, 3]);
}

/// Panics on the first read of `layer`, then behaves.
struct PanickingSource {
    inner: MemorySource,
    offset: u64,
    armed: AtomicBool,
}

impl LayerSource for PanickingSource {
    fn read_at(&self, lane: usize, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if offset == self.offset && self.armed.swap(false, Ordering::SeqCst) {
            panic!("driver fault at offset {offset}");
        }
        self.inner.read_at(lane, buf, offset)
    }

    fn len(&self) -> io::Result<u64> {
        self.inner.len()
    }
}

#[tokio::test]
async fn test_load_panic_returns_buffer() {
    let mut data = Vec::new();
    pattern::write_layers(&mut data, 5, LAYER_BYTES).unwrap();
    let source = PanickingSource {
        inner: MemorySource::new(data),
        offset: 3 * LAYER_BYTES as u64,
        armed: AtomicBool::new(true),
    };
    let config = PipelineConfig::new(5, LAYER_BYTES).with_window(2).with_chunks(2).with_io_threads(2);
    let mut pipeline = Pipeline::new(config, Arc::new(source)).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let err = pipeline
        .run(recording_consumer(seen.clone(), Duration::ZERO))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::TaskFailed { layer: 3, .. }), "got {err:?}");
    assert_eq!(*seen.lock(), vec![0, 1, 2]);
    assert!(pipeline.pool().is_idle());

    let report = pipeline.run(recording_consumer(seen.clone(), Duration::ZERO)).await.unwrap();
    assert_eq!(report.consumed_order(), vec![0, 1, 2, 3, 4]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_run_blocking_inside_runtime() {
    let file = layer_file(5, 0);
    let config = PipelineConfig::new(5, LAYER_BYTES).with_window(2).with_chunks(2).with_io_threads(2);
    let mut pipeline = Pipeline::open(config, file.path()).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let report = pipeline
        .run_blocking(recording_consumer(seen.clone(), Duration::ZERO))
        .unwrap();
    assert_eq!(report.consumed_order(), vec![0, 1, 2, 3, 4]);

    // A second run over the same pipeline reuses the same buffers.
    let report = pipeline
        .run_blocking(recording_consumer(seen.clone(), Duration::ZERO))
        .unwrap();
    assert_eq!(report.layers.len(), 5);
    assert_eq!(seen.lock().len(), 10);
}
