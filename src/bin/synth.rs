//! Write synthetic evaluation Parquet files for trying out `inspect`.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin synth -- --rows 500 --accuracy 0.82 --out data/eval.parquet
//! cargo run --release --bin synth -- --files 3 --rows 100 --out data/run.parquet
//! ```

use std::path::{Path, PathBuf};

use clap::Parser;
use lens::fixtures::{SynthConfig, eval_batch, synthesize, to_parquet_bytes};
use tracing::info;

#[derive(Parser, Debug)]
#[command(about = "Write synthetic evaluation Parquet files")]
struct Args {
    /// Rows per file.
    #[arg(long, default_value_t = 100)]
    rows: usize,

    /// Number of classes in `y_pred`.
    #[arg(long, default_value_t = 10)]
    classes: usize,

    /// Fraction of rows predicted correctly, in [0, 1].
    #[arg(long, default_value_t = 0.9)]
    accuracy: f64,

    /// Side length of the square input tensor.
    #[arg(long, default_value_t = 28)]
    side: usize,

    /// RNG seed. File `k` uses `seed + k`.
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Number of files to write; with more than one, `_<k>` is appended to the stem.
    #[arg(long, default_value_t = 1)]
    files: usize,

    /// Output path.
    #[arg(long)]
    out: PathBuf,
}

fn numbered(path: &Path, k: usize) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "eval".to_string());
    path.with_file_name(format!("{stem}_{k}.parquet"))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    if let Some(parent) = args.out.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    for k in 0..args.files.max(1) {
        let config = SynthConfig::default()
            .with_rows(args.rows)
            .with_classes(args.classes)
            .with_accuracy(args.accuracy)
            .with_side(args.side)
            .with_seed(args.seed.wrapping_add(k as u64));
        let rows = synthesize(&config)?;
        let bytes = to_parquet_bytes(&[eval_batch(&rows)?])?;

        let path = if args.files > 1 {
            numbered(&args.out, k)
        } else {
            args.out.clone()
        };
        std::fs::write(&path, &bytes)?;
        info!(
            "Wrote {} ({} rows, {} correct, {} bytes)",
            path.display(),
            rows.len(),
            config.correct_rows(),
            bytes.len()
        );
    }
    Ok(())
}
