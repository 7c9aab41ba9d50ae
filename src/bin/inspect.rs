//! Inspect model evaluation Parquet files: per-file chips, accuracy summary and
//! a paginated table of predictions, with optional ASCII previews and PNG export
//! of the input tensors.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin inspect -- eval_a.parquet eval_b.parquet
//! cargo run --release --bin inspect -- --page 3 --preview 2 --export-dir out/ eval.parquet
//! ```

use std::path::{Path, PathBuf};

use clap::Parser;
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use lens::common::SourceFile;
use lens::controller::{CancelToken, IngestionController};
use lens::engine::DataFusionEngine;
use lens::scorer::NoVerdictPolicy;
use loupe::config::{ConfigError, InspectorConfig};
use loupe::report::{
    JsonReport, Pagination, ascii_preview, export_page, file_chips, render_table, summary_cards,
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(about = "Inspect model evaluation Parquet files")]
struct Args {
    /// Parquet files holding `input`, `y_pred` and `y_test` columns.
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// JSON config file (overridden by LOUPE_* variables and flags).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Results page to show (1-based).
    #[arg(long, default_value_t = 1)]
    page: usize,

    /// Rows per page.
    #[arg(long)]
    page_size: Option<usize>,

    /// How rows without a prediction count: `incorrect` or `exclude`.
    #[arg(long)]
    no_verdict: Option<NoVerdictPolicy>,

    /// Draw the first N rows of the page as ASCII art.
    #[arg(long)]
    preview: Option<usize>,

    /// Write the page's input tensors as PNGs into this directory.
    #[arg(long)]
    export_dir: Option<PathBuf>,

    /// Per-call engine timeout in milliseconds (0 disables).
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Print the page as JSON instead of tables.
    #[arg(long)]
    json: bool,
}

impl Args {
    /// Flags win over the file and environment layers.
    fn apply(&self, mut config: InspectorConfig) -> Result<InspectorConfig, ConfigError> {
        if let Some(n) = self.page_size {
            config.page_size = n;
        }
        if let Some(policy) = self.no_verdict {
            config.no_verdict = policy;
        }
        if let Some(n) = self.preview {
            config.preview = n;
        }
        if let Some(dir) = &self.export_dir {
            config.export_dir = Some(dir.clone());
        }
        if let Some(ms) = self.timeout_ms {
            config.call_timeout_ms = (ms > 0).then_some(ms);
        }
        config.validate()
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn read_files(paths: &[PathBuf]) -> Result<Vec<SourceFile>, Box<dyn std::error::Error>> {
    let pb = ProgressBar::new(paths.len() as u64);
    pb.set_style(
        ProgressStyle::with_template(
            "  Reading    {bar:40.cyan/blue} {pos}/{len} files [{elapsed_precise}] {msg}",
        )?
        .progress_chars("##-"),
    );

    let mut files = Vec::with_capacity(paths.len());
    let mut total_bytes = 0u64;
    for path in paths {
        pb.set_message(display_name(path));
        let bytes = std::fs::read(path).map_err(|e| format!("{}: {e}", path.display()))?;
        total_bytes += bytes.len() as u64;
        files.push(SourceFile::new(display_name(path), bytes));
        pb.inc(1);
    }
    pb.finish_and_clear();
    info!("Read {} file(s), {}", files.len(), HumanBytes(total_bytes));
    Ok(files)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = args.apply(InspectorConfig::load(args.config.as_deref())?)?;
    let files = read_files(&args.files)?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(run(&config, &args, files))
}

async fn run(
    config: &InspectorConfig,
    args: &Args,
    files: Vec<SourceFile>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut controller = IngestionController::<DataFusionEngine>::new(config.engine_config());
    controller.mount(&CancelToken::new()).await?;

    let outcome = match controller.load_files(files).await {
        Ok(()) => present(&controller, config, args),
        Err(e) => Err(e.into()),
    };
    controller.unmount().await;
    outcome
}

fn present(
    controller: &IngestionController<DataFusionEngine>,
    config: &InspectorConfig,
    args: &Args,
) -> Result<(), Box<dyn std::error::Error>> {
    let data = controller.data();
    let summary = controller.summary(config.no_verdict);
    let pagination = Pagination::new(args.page, config.page_size, data.len());

    if args.json {
        let report = JsonReport::new(controller.loaded_files(), summary, data, &pagination);
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{}", file_chips(&controller.loaded_files()));
    println!();
    if controller.show_drop_zone() {
        println!("No rows found. Drop .parquet files with input, y_pred and y_test columns.");
        return Ok(());
    }

    print!("{}", summary_cards(&summary));
    println!();
    print!("{}", render_table(data, &pagination));

    for (i, record) in data
        .iter()
        .enumerate()
        .skip(pagination.range().start)
        .take(pagination.range().len().min(config.preview))
    {
        println!();
        print!("{}", ascii_preview(i + 1, record));
    }

    if let Some(dir) = &config.export_dir {
        let written = export_page(data, &pagination, dir)?;
        println!();
        println!("Wrote {} PNG(s) to {}", written.len(), dir.display());
    }
    Ok(())
}
