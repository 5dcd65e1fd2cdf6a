//! Bounded-window prefetch scheduler.
//!
//! Overlaps disk I/O with consumption by keeping up to `window` layers
//! loading or loaded ahead of the layer currently being consumed:
//!
//! ```text
//! Time →
//! slot 0:  [LOAD 0]──[CONSUME 0]──[LOAD 2]────────[CONSUME 2]──[LOAD 4] ...
//! slot 1:  [LOAD 1]──────────────[CONSUME 1]──[LOAD 3]────────[CONSUME 3] ...
//! ```
//!
//! A slot's buffer is moved by value into whichever blocking task owns it
//! (a load or the consumer) and moved back when that task finishes. The
//! lookahead load for a slot is only issued after the consumer has handed the
//! buffer back, so a prefetch can never write bytes the consumer is reading.
//!
//! A failed load is reported when its layer reaches the front: every layer
//! before it is consumed first. A failure among the first `window` layers
//! aborts at the startup barrier, before anything is consumed.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::task::JoinHandle;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::index::{LayerId, LayerIndex};
use crate::loader::{ChunkedLoader, LoadStats};
use crate::pool::{AlignedBuffer, SlotPool, SlotState};
use crate::report::{LayerTiming, RunReport};
use crate::source::{FileSource, LayerSource, OpenConfig};

/// Receives each layer in order.
///
/// The buffer is borrowed for the duration of the call only; once
/// `consume` returns the slot may be overwritten by the next prefetch.
pub trait LayerConsumer: Send + 'static {
    fn consume(&mut self, layer: LayerId, data: &[u8]) -> anyhow::Result<()>;
}

impl<F> LayerConsumer for F
where
    F: FnMut(LayerId, &[u8]) -> anyhow::Result<()> + Send + 'static,
{
    fn consume(&mut self, layer: LayerId, data: &[u8]) -> anyhow::Result<()> {
        self(layer, data)
    }
}

/// Scheduler-owned progress through the layer sequence.
///
/// Every layer in `[next_to_consume, next_to_prefetch)` is bound to a slot
/// that is `Loading` or `Ready`, and the span never exceeds the window.
#[derive(Debug, Clone, Default)]
pub struct PipelineCursor {
    window: usize,
    next_to_consume: LayerId,
    next_to_prefetch: LayerId,
    slot_for_layer: HashMap<LayerId, usize>,
}

impl PipelineCursor {
    fn new(window: usize) -> Self {
        Self { window, ..Self::default() }
    }

    pub fn next_to_consume(&self) -> LayerId {
        self.next_to_consume
    }

    pub fn next_to_prefetch(&self) -> LayerId {
        self.next_to_prefetch
    }

    pub fn slot_for(&self, layer: LayerId) -> Option<usize> {
        self.slot_for_layer.get(&layer).copied()
    }

    pub fn in_window(&self) -> usize {
        self.next_to_prefetch - self.next_to_consume
    }

    fn bind(&mut self, layer: LayerId, slot: usize) -> Result<()> {
        if layer != self.next_to_prefetch {
            return Err(PipelineError::SchedulerInvariantViolation(format!(
                "prefetch of layer {layer} out of order (expected {})",
                self.next_to_prefetch
            )));
        }
        if layer + 1 - self.next_to_consume > self.window {
            return Err(PipelineError::SchedulerInvariantViolation(format!(
                "prefetch of layer {layer} exceeds window {} (next to consume {})",
                self.window, self.next_to_consume
            )));
        }
        self.slot_for_layer.insert(layer, slot);
        self.next_to_prefetch = layer + 1;
        Ok(())
    }

    fn complete(&mut self, layer: LayerId) -> Result<()> {
        if layer != self.next_to_consume {
            return Err(PipelineError::SchedulerInvariantViolation(format!(
                "consumed layer {layer} out of order (expected {})",
                self.next_to_consume
            )));
        }
        self.slot_for_layer.remove(&layer);
        self.next_to_consume += 1;
        Ok(())
    }
}

/// What a load task hands back: the buffer always, plus the load result.
struct LoadOutcome {
    slot: usize,
    buffer: AlignedBuffer,
    result: Result<LoadStats>,
}

/// Load spans recorded by the load tasks themselves.
#[derive(Default)]
struct ProfileData {
    loads: HashMap<LayerId, (Duration, Duration, u32)>,
}

/// The pipeline context: layer index, slot pool, loader and cursor.
///
/// ```rust,no_run
/// use layerstream::{Pipeline, PipelineConfig};
///
/// # async fn demo() -> layerstream::Result<()> {
/// let config = PipelineConfig::new(34, 4 << 20).with_window(8).with_chunks(16);
/// let mut pipeline = Pipeline::open(config, "weights.bin")?;
/// let report = pipeline
///     .run(|layer: usize, data: &[u8]| -> anyhow::Result<()> {
///         tracing::info!(layer, bytes = data.len(), "computing");
///         Ok(())
///     })
///     .await?;
/// println!("{report}");
/// # Ok(())
/// # }
/// ```
pub struct Pipeline {
    config: PipelineConfig,
    index: LayerIndex,
    pool: SlotPool,
    loader: Arc<ChunkedLoader>,
    cursor: PipelineCursor,
    /// In-flight loads, never more than the window.
    in_flight: HashMap<LayerId, JoinHandle<LoadOutcome>>,
    profile: Arc<Mutex<ProfileData>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .field("loader", &self.loader)
            .field("cursor", &self.cursor)
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

impl Pipeline {
    /// Build a pipeline over an arbitrary source.
    ///
    /// Allocates the whole slot pool up front; fails with `OutOfMemory`
    /// before any I/O if that is not possible.
    pub fn new(config: PipelineConfig, source: Arc<dyn LayerSource>) -> Result<Self> {
        config.validate()?;
        let index = LayerIndex::new(config.layer_count, config.layer_bytes)?;

        match source.len() {
            Ok(len) if len < index.total_bytes() => tracing::warn!(
                "source holds {} bytes but {} layers need {}; trailing layers will fail to load",
                len,
                index.len(),
                index.total_bytes(),
            ),
            Ok(_) => {}
            Err(e) => tracing::warn!("could not determine source size: {e}"),
        }

        let budget = config.memory_budget();
        let available = available_ram_bytes();
        if available > 0 && budget > available {
            tracing::warn!(
                "slot pool needs {:.1} GB but only {:.1} GB RAM is available",
                budget as f64 / 1e9,
                available as f64 / 1e9,
            );
        }

        let window = config.effective_window();
        let pool = SlotPool::allocate(window, config.layer_bytes, config.alignment)?;

        let granularity = if config.direct_io { config.alignment } else { 1 };
        let loader = ChunkedLoader::new(
            source,
            config.chunk_count,
            config.io_threads,
            granularity,
            config.max_read_retries,
        )?;

        tracing::info!(
            "Pipeline: {} layers x {} bytes, window {}, {} chunks/layer, {:.1} MB pinned",
            config.layer_count,
            config.layer_bytes,
            window,
            config.chunk_count,
            pool.memory_bytes() as f64 / 1e6,
        );

        Ok(Self {
            config,
            index,
            pool,
            loader: Arc::new(loader),
            cursor: PipelineCursor::new(window),
            in_flight: HashMap::new(),
            profile: Arc::new(Mutex::new(ProfileData::default())),
        })
    }

    /// Build a pipeline over a file, honouring `direct_io` and `handle_per_chunk`.
    pub fn open(config: PipelineConfig, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let open = OpenConfig {
            direct_io: config.direct_io,
            handles: if config.handle_per_chunk { config.chunk_count } else { 1 },
        };
        let source = FileSource::open_with(path, open)
            .map_err(|source| PipelineError::Open { path: path.to_path_buf(), source })?;
        Self::new(config, Arc::new(source))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn index(&self) -> &LayerIndex {
        &self.index
    }

    pub fn pool(&self) -> &SlotPool {
        &self.pool
    }

    pub fn cursor(&self) -> &PipelineCursor {
        &self.cursor
    }

    pub fn slot_states(&self) -> Vec<SlotState> {
        self.pool.states()
    }

    /// Stream every layer, in order, through `consumer`.
    ///
    /// Any load, consumer or scheduling failure aborts the run. Before the
    /// error is returned all in-flight loads are joined and every buffer is
    /// back in the pool, so the pipeline can be run again.
    pub async fn run<C: LayerConsumer>(&mut self, consumer: C) -> Result<RunReport> {
        if !self.pool.is_idle() || !self.in_flight.is_empty() {
            return Err(PipelineError::SchedulerInvariantViolation(
                "pipeline is not idle; a previous run lost a buffer".into(),
            ));
        }

        let outcome = self.run_inner(consumer).await;
        if let Err(e) = &outcome {
            tracing::error!(layer = ?e.layer(), error = %e, "run aborted");
            self.drain_in_flight().await;
        }
        outcome
    }

    /// Blocking wrapper around [`Self::run`].
    ///
    /// Inside a multi-threaded Tokio runtime this uses `block_in_place`;
    /// otherwise a temporary current-thread runtime drives the run.
    pub fn run_blocking<C: LayerConsumer>(&mut self, consumer: C) -> Result<RunReport> {
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::CurrentThread => {
                Err(PipelineError::Runtime(
                    "run_blocking called from a current-thread runtime; use run().await".into(),
                ))
            }
            Ok(handle) => tokio::task::block_in_place(|| handle.block_on(self.run(consumer))),
            Err(_) => {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(|e| PipelineError::Runtime(format!("failed to create tokio runtime: {e}")))?;
                rt.block_on(self.run(consumer))
            }
        }
    }

    async fn run_inner<C: LayerConsumer>(&mut self, consumer: C) -> Result<RunReport> {
        let runtime = Handle::try_current()
            .map_err(|_| PipelineError::Runtime("no tokio runtime available for pipeline tasks".into()))?;
        let epoch = Instant::now();
        let count = self.index.len();
        let window = self.pool.len();
        self.cursor = PipelineCursor::new(window);
        self.profile.lock().loads.clear();

        // Startup barrier: fill every slot before consuming anything.
        for layer in 0..window {
            self.issue_load(&runtime, layer, layer, epoch)?;
        }
        for layer in 0..window {
            self.await_load(layer).await?;
        }
        tracing::debug!("startup window of {} layers ready after {:?}", window, epoch.elapsed());

        let mut consumer = Some(consumer);
        let mut timings = Vec::with_capacity(count);

        for layer in 0..count {
            let slot = self.cursor.slot_for(layer).ok_or_else(|| {
                PipelineError::SchedulerInvariantViolation(format!("layer {layer} has no slot"))
            })?;

            let t_wait = Instant::now();
            if self.in_flight.contains_key(&layer) {
                self.await_load(layer).await?;
            }
            let wait = t_wait.elapsed();

            let buffer = self.pool.take_buffer(slot, SlotState::Ready, SlotState::Consuming, layer)?;
            let mut c = consumer.take().ok_or_else(|| {
                PipelineError::SchedulerInvariantViolation("consumer lost between layers".into())
            })?;

            let consume_start = epoch.elapsed();
            let (c, buffer, result) = runtime
                .spawn_blocking(move || {
                    let result = panic::catch_unwind(AssertUnwindSafe(|| c.consume(layer, &buffer)))
                        .map_err(|payload| panic_message(&*payload));
                    (c, buffer, result)
                })
                .await
                .map_err(|e| PipelineError::TaskFailed {
                    layer,
                    msg: format!("consumer task was cancelled: {e}"),
                })?;
            let consume_end = epoch.elapsed();
            consumer = Some(c);

            self.pool.restore_buffer(slot, buffer, SlotState::Empty)?;
            self.cursor.complete(layer)?;
            match result {
                Ok(consumed) => consumed.map_err(|source| PipelineError::Consumer { layer, source })?,
                Err(msg) => {
                    return Err(PipelineError::TaskFailed {
                        layer,
                        msg: format!("consumer panicked: {msg}"),
                    })
                }
            }

            let (load_start, load_end, retries) =
                self.profile.lock().loads.remove(&layer).unwrap_or_default();
            let timing = LayerTiming {
                layer,
                slot,
                load_start,
                load_end,
                consume_start,
                consume_end,
                wait,
                retries,
            };
            tracing::debug!(
                layer,
                slot,
                load_ms = timing.load_time().as_secs_f64() * 1000.0,
                consume_ms = timing.consume_time().as_secs_f64() * 1000.0,
                wait_ms = wait.as_secs_f64() * 1000.0,
                "layer consumed"
            );
            timings.push(timing);

            let lookahead = layer + window;
            if lookahead < count {
                self.issue_load(&runtime, slot, lookahead, epoch)?;
            }
        }

        if !self.pool.is_idle() || !self.in_flight.is_empty() {
            return Err(PipelineError::SchedulerInvariantViolation(format!(
                "run finished with slots {:?} and {} loads in flight",
                self.pool.states(),
                self.in_flight.len()
            )));
        }

        let report = RunReport {
            layers: timings,
            total: epoch.elapsed(),
            window,
            chunk_count: self.loader.chunk_count(),
            pool_buffers: self.pool.buffers_allocated(),
            bytes_loaded: self.index.total_bytes(),
        };
        tracing::info!("{}", report);
        Ok(report)
    }

    /// Bind `layer` to `slot` and start loading it in the background.
    fn issue_load(&mut self, runtime: &Handle, slot: usize, layer: LayerId, epoch: Instant) -> Result<()> {
        let desc = self.index.descriptor(layer)?;
        if self.in_flight.len() >= self.pool.len() {
            return Err(PipelineError::SchedulerInvariantViolation(format!(
                "{} loads already in flight (window {})",
                self.in_flight.len(),
                self.pool.len()
            )));
        }

        let mut buffer = self.pool.take_buffer(slot, SlotState::Empty, SlotState::Loading, layer)?;
        self.cursor.bind(layer, slot)?;

        let loader = self.loader.clone();
        let profile = self.profile.clone();
        let handle = runtime.spawn_blocking(move || {
            let started = epoch.elapsed();
            let result = panic::catch_unwind(AssertUnwindSafe(|| loader.load_into(&mut buffer, &desc)))
                .unwrap_or_else(|payload| {
                    Err(PipelineError::TaskFailed {
                        layer,
                        msg: format!("load panicked: {}", panic_message(&*payload)),
                    })
                });
            let finished = epoch.elapsed();
            if let Ok(stats) = &result {
                profile.lock().loads.insert(layer, (started, finished, stats.retries));
            }
            LoadOutcome { slot, buffer, result }
        });
        self.in_flight.insert(layer, handle);

        tracing::trace!(layer, slot, "prefetch issued");
        Ok(())
    }

    /// Join the load of `layer` and move its slot to `Ready`.
    async fn await_load(&mut self, layer: LayerId) -> Result<()> {
        let handle = self.in_flight.remove(&layer).ok_or_else(|| {
            PipelineError::SchedulerInvariantViolation(format!("no load in flight for layer {layer}"))
        })?;
        let outcome = handle.await.map_err(|e| PipelineError::TaskFailed {
            layer,
            msg: format!("load task was cancelled: {e}"),
        })?;
        self.finish_load(layer, outcome)
    }

    fn finish_load(&mut self, layer: LayerId, outcome: LoadOutcome) -> Result<()> {
        let LoadOutcome { slot, buffer, result } = outcome;
        match result {
            Ok(stats) => {
                self.pool.restore_buffer(slot, buffer, SlotState::Ready)?;
                tracing::debug!(
                    layer,
                    slot,
                    chunks = stats.chunks,
                    load_ms = stats.elapsed.as_secs_f64() * 1000.0,
                    "layer loaded"
                );
                Ok(())
            }
            Err(e) => {
                self.pool.restore_buffer(slot, buffer, SlotState::Empty)?;
                Err(e)
            }
        }
    }

    /// Join every outstanding load and return all buffers to `Empty` slots.
    async fn drain_in_flight(&mut self) {
        let pending: Vec<_> = self.in_flight.drain().collect();
        for (layer, handle) in pending {
            match handle.await {
                Ok(outcome) => {
                    if let Err(e) = self.pool.restore_buffer(outcome.slot, outcome.buffer, SlotState::Empty) {
                        tracing::error!(layer, error = %e, "failed to return buffer after abort");
                    }
                }
                Err(e) => tracing::error!(layer, error = %e, "load task lost during abort"),
            }
        }
        self.pool.reset();
        self.cursor = PipelineCursor::new(self.pool.len());
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".into())
}

fn available_ram_bytes() -> usize {
    let sys = sysinfo::System::new_with_specifics(
        sysinfo::RefreshKind::new().with_memory(sysinfo::MemoryRefreshKind::everything()),
    );
    sys.available_memory() as usize
}
