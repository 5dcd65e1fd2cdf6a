//! Per-run timing report.

use std::time::Duration;

use crate::index::LayerId;

/// Timeline of one layer, with instants measured from the start of the run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayerTiming {
    pub layer: LayerId,
    pub slot: usize,
    pub load_start: Duration,
    pub load_end: Duration,
    pub consume_start: Duration,
    pub consume_end: Duration,
    /// Time the scheduler blocked waiting for this layer to become ready.
    pub wait: Duration,
    pub retries: u32,
}

impl LayerTiming {
    pub fn load_time(&self) -> Duration {
        self.load_end.saturating_sub(self.load_start)
    }

    pub fn consume_time(&self) -> Duration {
        self.consume_end.saturating_sub(self.consume_start)
    }
}

/// Summary of a completed run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// One entry per layer, in consumption order.
    pub layers: Vec<LayerTiming>,
    pub total: Duration,
    pub window: usize,
    pub chunk_count: usize,
    /// Buffers owned by the slot pool, fixed when the pipeline is built.
    pub pool_buffers: usize,
    pub bytes_loaded: u64,
}

impl RunReport {
    /// Layer ids in the order they were consumed.
    pub fn consumed_order(&self) -> Vec<LayerId> {
        self.layers.iter().map(|t| t.layer).collect()
    }

    pub fn total_load_time(&self) -> Duration {
        self.layers.iter().map(LayerTiming::load_time).sum()
    }

    pub fn total_consume_time(&self) -> Duration {
        self.layers.iter().map(LayerTiming::consume_time).sum()
    }

    pub fn total_wait_time(&self) -> Duration {
        self.layers.iter().map(|t| t.wait).sum()
    }

    /// Fraction of load time hidden behind consumption (0.0–1.0).
    pub fn overlap_efficiency(&self) -> f64 {
        let load = self.total_load_time().as_secs_f64();
        if load <= 0.0 {
            return 0.0;
        }
        (1.0 - self.total_wait_time().as_secs_f64() / load).clamp(0.0, 1.0)
    }

    /// Load throughput in MiB/s over the whole run.
    pub fn throughput_mib_s(&self) -> f64 {
        let secs = self.total.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.bytes_loaded as f64 / (1024.0 * 1024.0) / secs
    }

    /// Timings of every layer that occupied `slot`, in consumption order.
    pub fn slot_timeline(&self, slot: usize) -> impl Iterator<Item = &LayerTiming> {
        self.layers.iter().filter(move |t| t.slot == slot)
    }
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} layers in {:.3} ms (window {}, {} chunks): load {:.3} ms, compute {:.3} ms, wait {:.3} ms, overlap {:.1}%, {:.1} MiB/s",
            self.layers.len(),
            ms(self.total),
            self.window,
            self.chunk_count,
            ms(self.total_load_time()),
            ms(self.total_consume_time()),
            ms(self.total_wait_time()),
            self.overlap_efficiency() * 100.0,
            self.throughput_mib_s(),
        )
    }
}

fn ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}
