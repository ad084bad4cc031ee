//! Aggregate a parquet table into exemplars and members.
//!
//! Reads one parquet file, runs the aggregation engine over it, and writes
//! two parquet files next to each other: the exemplar rows (input schema
//! plus `members_count`) and the per-row `exemplar_id` mapping.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin aggregate -- --input data.parquet --output-dir out/
//! cargo run --release --bin aggregate -- --input data.parquet --output-dir out/ \
//!     --nd-max-bins 200 --seed 42 --precision 32
//! ```

use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::Arc;

use arrow::array::RecordBatchReader;
use arrow::compute::concat_batches;
use arrow::record_batch::RecordBatch;
use clap::Parser;
use indicatif::{HumanCount, HumanDuration, ProgressBar, ProgressStyle};
use mimalloc::MiMalloc;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use tracing::info;

use oxbow::{Aggregated, Aggregator, AggregatorConfig, ProgressStatus, Real};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(about = "Aggregate a parquet table into exemplar and member tables")]
struct Args {
    /// Input parquet file.
    #[arg(long)]
    input: PathBuf,

    /// Directory for `exemplars.parquet` and `members.parquet`.
    #[arg(long)]
    output_dir: PathBuf,

    /// Below this row count, skip aggregation (every row is an exemplar).
    #[arg(long, default_value_t = 500)]
    min_rows: usize,

    /// Bin count for a single continuous column.
    #[arg(long, default_value_t = 500)]
    n_bins: usize,

    /// Horizontal bin count for the two-column paths.
    #[arg(long, default_value_t = 50)]
    nx_bins: usize,

    /// Vertical bin count for the two-column paths.
    #[arg(long, default_value_t = 50)]
    ny_bins: usize,

    /// Exemplar cap for the general clustering path (and the sampler).
    #[arg(long, default_value_t = 500)]
    nd_max_bins: usize,

    /// Coordinate count above which rows are projected down.
    #[arg(long, default_value_t = 50)]
    max_dimensions: usize,

    /// Run seed; 0 draws one from OS entropy.
    #[arg(long, default_value_t = 0)]
    seed: u32,

    /// Worker threads for the clustering path; 0 uses all cores.
    #[arg(long, default_value_t = 0)]
    nthreads: usize,

    /// Distance arithmetic precision: 32 or 64 bits.
    #[arg(long, default_value_t = 64)]
    precision: u8,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = AggregatorConfig {
        min_rows: args.min_rows,
        n_bins: args.n_bins,
        nx_bins: args.nx_bins,
        ny_bins: args.ny_bins,
        nd_max_bins: args.nd_max_bins,
        max_dimensions: args.max_dimensions,
        seed: args.seed,
        nthreads: args.nthreads,
    };
    info!("Config: {}", serde_json::to_string(&config)?);

    // ── Load ──────────────────────────────────────────────────────────
    let start = std::time::Instant::now();
    let file = File::open(&args.input)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
    let schema = reader.schema().clone();
    let batches: Vec<RecordBatch> = reader.collect::<Result<_, _>>()?;
    let batch = concat_batches(&schema, &batches)?;
    info!(
        "Loaded {} rows x {} columns from {} in {}",
        HumanCount(batch.num_rows() as u64),
        batch.num_columns(),
        args.input.display(),
        HumanDuration(start.elapsed()),
    );

    // ── Aggregate ─────────────────────────────────────────────────────
    let start = std::time::Instant::now();
    let out = match args.precision {
        32 => run::<f32>(config, &batch)?,
        64 => run::<f64>(config, &batch)?,
        other => return Err(format!("unsupported precision: {other}").into()),
    };
    info!(
        "Aggregated into {} exemplars in {}",
        HumanCount(out.n_exemplars() as u64),
        HumanDuration(start.elapsed()),
    );

    // ── Write ─────────────────────────────────────────────────────────
    fs::create_dir_all(&args.output_dir)?;
    write_parquet(&out.exemplars, args.output_dir.join("exemplars.parquet"))?;
    write_parquet(&out.members, args.output_dir.join("members.parquet"))?;
    info!("Output written to {}", args.output_dir.display());

    Ok(())
}

fn run<T: Real>(
    config: AggregatorConfig,
    batch: &RecordBatch,
) -> Result<Aggregated, Box<dyn std::error::Error>> {
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::with_template(
            "  Aggregating {bar:40.cyan/blue} {pos}/{len} [{elapsed_precise}]",
        )?
        .progress_chars("##-"),
    );
    let bar = pb.clone();
    let out = Aggregator::<T>::new(config)
        .with_progress(Arc::new(move |fraction, status| {
            bar.set_position((fraction * 100.0) as u64);
            if status != ProgressStatus::Running {
                bar.finish();
            }
        }))
        .aggregate(batch)?;
    Ok(out)
}

fn write_parquet(batch: &RecordBatch, path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let file = File::create(&path)?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)?;
    writer.write(batch)?;
    writer.close()?;
    Ok(())
}
