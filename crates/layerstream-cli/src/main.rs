use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use layerstream::{pattern, LayerId, Pipeline, PipelineConfig};

#[derive(Parser)]
#[command(
    name = "layerstream",
    about = "Stream fixed-size layers from disk through a bounded prefetch window",
    version
)]
struct Cli {
    /// Log filter (overridden by RUST_LOG): error, warn, info, debug, trace
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

/// Layer geometry and pipeline tuning shared by `run` and `plan`.
#[derive(clap::Args)]
struct Tuning {
    /// JSON config file; flags below override its fields
    #[arg(long)]
    config: Option<PathBuf>,
    /// Number of layers in the file
    #[arg(long)]
    layers: Option<usize>,
    /// Bytes per layer
    #[arg(long)]
    layer_bytes: Option<usize>,
    /// Prefetch window (resident layers)
    #[arg(long)]
    window: Option<usize>,
    /// Concurrent reads per layer
    #[arg(long)]
    chunks: Option<usize>,
    /// Threads in the chunk read pool
    #[arg(long)]
    io_threads: Option<usize>,
    /// Bypass the page cache (Linux O_DIRECT)
    #[arg(long)]
    direct: bool,
    /// Open one file handle per chunk
    #[arg(long)]
    handle_per_chunk: bool,
    /// Extra attempts per failing chunk read
    #[arg(long)]
    retries: Option<u32>,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Write a layer file filled with the verification pattern
    Generate {
        /// Output path
        path: PathBuf,
        #[arg(long, default_value = "34")]
        layers: usize,
        #[arg(long, default_value = "68943872")]
        layer_bytes: usize,
    },
    /// Stream a layer file through the pipeline with a simulated compute step
    Run {
        /// Layer file
        path: PathBuf,
        #[command(flatten)]
        tuning: Tuning,
        /// Simulated compute per layer, in milliseconds
        #[arg(long, default_value = "2.3")]
        compute_ms: f64,
        /// Check every layer against the generated pattern
        #[arg(long)]
        verify: bool,
    },
    /// Print the resolved config and its memory budget without touching disk
    Plan {
        #[command(flatten)]
        tuning: Tuning,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    match cli.command {
        Commands::Generate { path, layers, layer_bytes } => cmd_generate(&path, layers, layer_bytes),
        Commands::Run { path, tuning, compute_ms, verify } => cmd_run(&path, &tuning, compute_ms, verify).await,
        Commands::Plan { tuning } => cmd_plan(&tuning),
    }
}

/// Logs go to stderr so stdout only carries the report.
fn init_logging(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log level '{level}'"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn resolve_config(tuning: &Tuning) -> anyhow::Result<PipelineConfig> {
    let mut config = match &tuning.config {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => PipelineConfig::reference(),
    };
    if let Some(n) = tuning.layers {
        config.layer_count = n;
    }
    if let Some(n) = tuning.layer_bytes {
        config.layer_bytes = n;
    }
    if let Some(n) = tuning.window {
        config.window_size = n;
    }
    if let Some(n) = tuning.chunks {
        config.chunk_count = n;
    }
    if let Some(n) = tuning.io_threads {
        config.io_threads = n;
    }
    if let Some(n) = tuning.retries {
        config.max_read_retries = n;
    }
    config.direct_io |= tuning.direct;
    config.handle_per_chunk |= tuning.handle_per_chunk;
    config.validate()?;
    Ok(config)
}

fn cmd_generate(path: &Path, layers: usize, layer_bytes: usize) -> anyhow::Result<()> {
    pattern::write_layer_file(path, layers, layer_bytes)
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!(
        "{}: {} layers x {} bytes ({:.1} MB)",
        path.display(),
        layers,
        layer_bytes,
        layers as f64 * layer_bytes as f64 / 1e6
    );
    Ok(())
}

async fn cmd_run(path: &Path, tuning: &Tuning, compute_ms: f64, verify: bool) -> anyhow::Result<()> {
    let config = resolve_config(tuning)?;
    let compute = Duration::from_secs_f64(compute_ms.max(0.0) / 1000.0);
    tracing::info!(
        "streaming {} with window {} and {} chunks, {:.2} ms compute per layer",
        path.display(),
        config.window_size,
        config.chunk_count,
        compute_ms
    );
    let mut pipeline = Pipeline::open(config, path)?;

    let consumer = move |layer: LayerId, data: &[u8]| -> anyhow::Result<()> {
        if verify {
            if let Some(pos) = pattern::first_mismatch(layer, data) {
                anyhow::bail!("layer {layer} differs from pattern at byte {pos}");
            }
        }
        if !compute.is_zero() {
            std::thread::sleep(compute);
        }
        Ok(())
    };

    let report = pipeline
        .run(consumer)
        .await
        .with_context(|| format!("streaming {} failed", path.display()))?;

    println!("{:<6} {:>5} {:>10} {:>10} {:>10} {:>8}", "Layer", "Slot", "Load(ms)", "Wait(ms)", "Compute", "Retries");
    println!("{}", "-".repeat(54));
    for t in &report.layers {
        println!(
            "{:<6} {:>5} {:>10.2} {:>10.2} {:>10.2} {:>8}",
            t.layer,
            t.slot,
            t.load_time().as_secs_f64() * 1000.0,
            t.wait.as_secs_f64() * 1000.0,
            t.consume_time().as_secs_f64() * 1000.0,
            t.retries,
        );
    }
    println!();
    println!("{report}");
    Ok(())
}

fn cmd_plan(tuning: &Tuning) -> anyhow::Result<()> {
    let config = resolve_config(tuning)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    println!();
    println!("  Effective window: {}", config.effective_window());
    println!("  Slot pool:        {:.1} MB", config.memory_budget() as f64 / 1e6);
    println!("  File size:        {:.1} MB", config.file_bytes() as f64 / 1e6);
    println!(
        "  Chunk size:       {} bytes",
        config.layer_bytes / config.chunk_count.min(config.layer_bytes)
    );
    Ok(())
}
