//! Evaluation data builders.
//!
//! Produces record batches and Parquet buffers in the evaluation layout
//! (`input` binary tensor, `y_pred` list of float32 scores, `y_test` int64
//! label). Used by the synthetic data generator, the tests and the benches.

use std::sync::Arc;

use arrow::array::{ArrayRef, BinaryBuilder, Float32Builder, Int64Builder, ListBuilder};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::errors::ParquetError;
use rand::prelude::*;
use rand::rngs::SmallRng;
use thiserror::Error;
use tracing::debug;

use crate::common::{INPUT_COLUMN, LABEL_COLUMN, PREDICTION_COLUMN};

#[derive(Error, Debug)]
pub enum FixtureError {
    #[error("arrow error: {0}")]
    Arrow(#[from] ArrowError),

    #[error("parquet error: {0}")]
    Parquet(#[from] ParquetError),

    #[error("invalid fixture configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, FixtureError>;

/// Little-endian float32 encoding, the inverse of [`crate::tensor::decode_f32`].
pub fn encode_f32(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

// ============================================================================
// Rows and Batches
// ============================================================================

/// One evaluation row before encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalRow {
    pub input: Vec<f32>,
    /// `None` writes a null `y_pred` cell.
    pub scores: Option<Vec<f32>>,
    /// `None` writes a null `y_test` cell.
    pub label: Option<i64>,
}

impl EvalRow {
    pub fn new(input: Vec<f32>, scores: Vec<f32>, label: i64) -> Self {
        Self {
            input,
            scores: Some(scores),
            label: Some(label),
        }
    }

    /// A row whose scores put 0.9 on `predicted` and share the rest evenly.
    pub fn one_hot(input: Vec<f32>, predicted: usize, classes: usize, label: i64) -> Self {
        let classes = classes.max(predicted + 1);
        let rest = if classes > 1 {
            0.1 / (classes - 1) as f32
        } else {
            0.0
        };
        let scores = (0..classes)
            .map(|c| if c == predicted { 0.9 } else { rest })
            .collect();
        Self::new(input, scores, label)
    }
}

pub fn eval_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new(INPUT_COLUMN, DataType::Binary, true),
        Field::new(
            PREDICTION_COLUMN,
            DataType::List(Arc::new(Field::new("item", DataType::Float32, true))),
            true,
        ),
        Field::new(LABEL_COLUMN, DataType::Int64, true),
    ]))
}

pub fn eval_batch(rows: &[EvalRow]) -> Result<RecordBatch> {
    let mut inputs = BinaryBuilder::new();
    let mut preds = ListBuilder::new(Float32Builder::new());
    let mut labels = Int64Builder::with_capacity(rows.len());

    for row in rows {
        inputs.append_value(encode_f32(&row.input));
        match &row.scores {
            Some(scores) => {
                preds.values().append_slice(scores);
                preds.append(true);
            }
            None => preds.append(false),
        }
        labels.append_option(row.label);
    }

    let columns: Vec<ArrayRef> = vec![
        Arc::new(inputs.finish()),
        Arc::new(preds.finish()),
        Arc::new(labels.finish()),
    ];
    Ok(RecordBatch::try_new(eval_schema(), columns)?)
}

/// Write batches (which must share a schema) into one in-memory Parquet file.
pub fn to_parquet_bytes(batches: &[RecordBatch]) -> Result<Vec<u8>> {
    let schema = batches
        .first()
        .map(RecordBatch::schema)
        .ok_or_else(|| FixtureError::InvalidConfig("no batches to write".into()))?;
    let mut writer = ArrowWriter::try_new(Vec::new(), schema, None)?;
    for batch in batches {
        writer.write(batch)?;
    }
    Ok(writer.into_inner()?)
}

/// Shorthand for a single-batch evaluation file.
pub fn eval_parquet(rows: &[EvalRow]) -> Result<Vec<u8>> {
    to_parquet_bytes(&[eval_batch(rows)?])
}

// ============================================================================
// Synthetic Data
// ============================================================================

#[derive(Debug, Clone)]
pub struct SynthConfig {
    pub rows: usize,
    pub classes: usize,
    /// Fraction of rows whose top score matches the label. Rounded to a
    /// whole number of rows.
    pub accuracy: f64,
    /// Tensor side length; each input holds `side * side` values.
    pub side: usize,
    pub seed: u64,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            rows: 100,
            classes: 10,
            accuracy: 0.9,
            side: 28,
            seed: 42,
        }
    }
}

impl SynthConfig {
    pub fn with_rows(mut self, rows: usize) -> Self {
        self.rows = rows;
        self
    }

    pub fn with_classes(mut self, classes: usize) -> Self {
        self.classes = classes;
        self
    }

    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = accuracy;
        self
    }

    pub fn with_side(mut self, side: usize) -> Self {
        self.side = side;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.classes == 0 {
            return Err(FixtureError::InvalidConfig("classes must be positive".into()));
        }
        if self.side == 0 {
            return Err(FixtureError::InvalidConfig("side must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.accuracy) {
            return Err(FixtureError::InvalidConfig(format!(
                "accuracy {} is outside [0, 1]",
                self.accuracy
            )));
        }
        if self.classes == 1 && self.accuracy < 1.0 && self.rows > 0 {
            return Err(FixtureError::InvalidConfig(
                "a single class cannot produce wrong predictions".into(),
            ));
        }
        Ok(())
    }

    /// Number of rows that will be predicted correctly.
    pub fn correct_rows(&self) -> usize {
        ((self.rows as f64 * self.accuracy).round() as usize).min(self.rows)
    }
}

/// Generate rows with exactly [`SynthConfig::correct_rows`] correct predictions.
pub fn synthesize(config: &SynthConfig) -> Result<Vec<EvalRow>> {
    config.validate()?;
    let mut rng = SmallRng::seed_from_u64(config.seed);

    let mut correct: Vec<bool> = (0..config.rows).map(|i| i < config.correct_rows()).collect();
    correct.shuffle(&mut rng);

    let rows = correct
        .into_iter()
        .map(|is_correct| {
            let label = rng.random_range(0..config.classes);
            let predicted = if is_correct {
                label
            } else {
                (label + rng.random_range(1..config.classes)) % config.classes
            };
            EvalRow::new(
                glyph(config.side, label, &mut rng),
                scores(config.classes, predicted, &mut rng),
                label as i64,
            )
        })
        .collect::<Vec<_>>();

    debug!(
        "Synthesized {} rows ({} classes, {} correct)",
        rows.len(),
        config.classes,
        config.correct_rows()
    );
    Ok(rows)
}

/// Softmax-like scores whose strict maximum is at `predicted`.
fn scores(classes: usize, predicted: usize, rng: &mut SmallRng) -> Vec<f32> {
    let mut raw: Vec<f32> = (0..classes).map(|_| rng.random_range(0.0..0.5)).collect();
    raw[predicted] = 1.0 + rng.random_range(0.0..2.0);
    let sum: f32 = raw.iter().sum();
    raw.iter().map(|v| v / sum).collect()
}

/// Noisy background with a bright horizontal band whose row depends on `label`.
fn glyph(side: usize, label: usize, rng: &mut SmallRng) -> Vec<f32> {
    let band = (label * 3 + 1) % side;
    (0..side * side)
        .map(|i| {
            let noise = rng.random_range(0.0..0.2);
            if i / side == band { 1.0 - noise } else { noise }
        })
        .collect()
}
