//! Terminal rendering of an evaluation: file chips, summary cards, a paginated
//! results table, ASCII previews and PNG export of sample rasters.

use std::fmt::Write as _;
use std::ops::Range;
use std::path::{Path, PathBuf};

use lens::common::SampleRecord;
use lens::scorer::{EvaluationSummary, Verdict, argmax, verdict};
use lens::tensor::{Raster, RenderedCell, render};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("failed to create {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to encode {path}: {source}")]
    Image {
        path: PathBuf,
        source: image::ImageError,
    },

    #[error("raster buffer does not match {width}x{height}")]
    Raster { width: usize, height: usize },
}

pub type Result<T> = std::result::Result<T, ReportError>;

// ============================================================================
// Pagination
// ============================================================================

/// One page over `total` rows. Pages are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
}

impl Pagination {
    /// Out-of-range pages clamp to the nearest valid one.
    pub fn new(page: usize, page_size: usize, total: usize) -> Self {
        let page_size = page_size.max(1);
        let pages = total.div_ceil(page_size).max(1);
        Self {
            page: page.clamp(1, pages),
            page_size,
            total,
        }
    }

    pub fn page_count(&self) -> usize {
        self.total.div_ceil(self.page_size).max(1)
    }

    /// Row indices (0-based) on this page.
    pub fn range(&self) -> Range<usize> {
        let start = ((self.page - 1) * self.page_size).min(self.total);
        let end = (start + self.page_size).min(self.total);
        start..end
    }

    pub fn showing(&self) -> String {
        let range = self.range();
        format!(
            "Showing {} to {} of {} results",
            range.start + 1,
            range.end,
            self.total
        )
    }

    pub fn page_label(&self) -> String {
        format!("Page {} of {}", self.page, self.page_count())
    }
}

// ============================================================================
// Rows
// ============================================================================

/// Display values of one table row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableRow {
    /// 1-based position in the full result.
    pub index: usize,
    /// `WxH` for a decodable tensor, `placeholder` otherwise.
    pub image: String,
    pub predicted_label: Option<usize>,
    pub confidence_percent: Option<String>,
    pub label: Option<i64>,
    pub verdict: Verdict,
}

impl TableRow {
    pub fn new(index: usize, record: &SampleRecord) -> Self {
        let image = match render(&record.input) {
            RenderedCell::Image(r) => format!("{}x{}", r.width, r.height),
            RenderedCell::Placeholder { .. } => "placeholder".to_string(),
        };
        let prediction = argmax(&record.predicted_distribution);
        Self {
            index,
            image,
            predicted_label: prediction.map(|p| p.label),
            confidence_percent: prediction.map(|p| p.confidence_percent()),
            label: record.true_label,
            verdict: verdict(record),
        }
    }

    /// `label (conf%)`, or empty without a prediction.
    pub fn prediction_cell(&self) -> String {
        match (self.predicted_label, &self.confidence_percent) {
            (Some(label), Some(conf)) => format!("{label} ({conf}%)"),
            _ => String::new(),
        }
    }

    pub fn label_cell(&self) -> String {
        self.label.map_or_else(|| "NaN".to_string(), |l| l.to_string())
    }

    pub fn status_cell(&self) -> &'static str {
        match self.verdict {
            Verdict::Correct => "Correct",
            Verdict::Incorrect => "Incorrect",
            Verdict::NoVerdict => "",
        }
    }
}

/// Rows past the end of `records` are skipped.
pub fn page_rows(records: &[SampleRecord], pagination: &Pagination) -> Vec<TableRow> {
    pagination
        .range()
        .filter_map(|i| records.get(i).map(|r| TableRow::new(i + 1, r)))
        .collect()
}

// ============================================================================
// Text Rendering
// ============================================================================

pub fn file_chips(names: &[&str]) -> String {
    names
        .iter()
        .map(|n| format!("[ {n} ]"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Inner width of the summary box.
const CARD_WIDTH: usize = 52;

pub fn summary_cards(summary: &EvaluationSummary) -> String {
    let mut lines = vec![
        format!("  Total Samples  {:>12}", summary.total),
        format!("  Correct        {:>12}", summary.correct),
        format!("  Incorrect      {:>12}", summary.incorrect),
        format!("  Accuracy       {:>11.2}%", summary.accuracy),
    ];
    if summary.no_verdict > 0 {
        lines.push(format!(
            "  No verdict     {:>12}  ({:?})",
            summary.no_verdict, summary.policy
        ));
    }

    let mut out = String::new();
    let _ = writeln!(out, "╔{}╗", "═".repeat(CARD_WIDTH));
    for line in lines {
        let _ = writeln!(out, "║{line:<CARD_WIDTH$}║");
    }
    let _ = writeln!(out, "╚{}╝", "═".repeat(CARD_WIDTH));
    out
}

/// The results table for one page, with its footer.
pub fn render_table(records: &[SampleRecord], pagination: &Pagination) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:>6}  {:<11}  {:<16}  {:>5}  {}",
        "#", "Image", "Prediction", "Label", "Status"
    );
    let _ = writeln!(out, "{}", "─".repeat(56));

    let rows = page_rows(records, pagination);
    if rows.is_empty() {
        let _ = writeln!(out, "No results.");
    }
    for row in &rows {
        let _ = writeln!(
            out,
            "{:>6}  {:<11}  {:<16}  {:>5}  {}",
            row.index,
            row.image,
            row.prediction_cell(),
            row.label_cell(),
            row.status_cell()
        );
    }
    let _ = writeln!(out, "{}", "─".repeat(56));
    let _ = writeln!(out, "{}    {}", pagination.showing(), pagination.page_label());
    out
}

/// ASCII drawing of a record's tensor, headed by its row number.
pub fn ascii_preview(index: usize, record: &SampleRecord) -> String {
    match render(&record.input) {
        RenderedCell::Image(raster) => format!("┌─ #{index}\n{}", raster.to_ascii()),
        RenderedCell::Placeholder { reason } => format!("┌─ #{index}\n[ {reason} ]\n"),
    }
}

// ============================================================================
// PNG Export
// ============================================================================

pub fn export_png(raster: &Raster, path: &Path) -> Result<()> {
    let image = image::RgbaImage::from_raw(
        raster.width as u32,
        raster.height as u32,
        raster.rgba.clone(),
    )
    .ok_or(ReportError::Raster {
        width: raster.width,
        height: raster.height,
    })?;
    image.save(path).map_err(|source| ReportError::Image {
        path: path.to_path_buf(),
        source,
    })
}

/// Write every decodable tensor on the page as `sample_<index>.png` under `dir`.
pub fn export_page(
    records: &[SampleRecord],
    pagination: &Pagination,
    dir: &Path,
) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir).map_err(|source| ReportError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut written = Vec::new();
    for (i, record) in pagination
        .range()
        .filter_map(|i| records.get(i).map(|r| (i, r)))
    {
        match render(&record.input) {
            RenderedCell::Image(raster) => {
                let path = dir.join(format!("sample_{:05}.png", i + 1));
                export_png(&raster, &path)?;
                written.push(path);
            }
            RenderedCell::Placeholder { reason } => {
                debug!("row {} not exported: {reason}", i + 1);
            }
        }
    }
    info!("Exported {} image(s) to {}", written.len(), dir.display());
    Ok(written)
}

/// Machine-readable form of one page.
#[derive(Debug, Serialize)]
pub struct JsonReport<'a> {
    pub files: Vec<&'a str>,
    pub summary: EvaluationSummary,
    pub page: usize,
    pub page_count: usize,
    pub rows: Vec<TableRow>,
}

impl<'a> JsonReport<'a> {
    pub fn new(
        files: Vec<&'a str>,
        summary: EvaluationSummary,
        records: &[SampleRecord],
        pagination: &Pagination,
    ) -> Self {
        Self {
            files,
            summary,
            page: pagination.page,
            page_count: pagination.page_count(),
            rows: page_rows(records, pagination),
        }
    }
}
