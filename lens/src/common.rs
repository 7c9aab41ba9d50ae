//! Common types and constants used throughout the project.

use bytes::Bytes;
use serde::Serialize;

// ============================================================================
// Schema Contract
// ============================================================================

/// Binary column holding the raw little-endian float32 tensor of a sample.
pub const INPUT_COLUMN: &str = "input";

/// List-of-float column holding the model's per-class scores.
pub const PREDICTION_COLUMN: &str = "y_pred";

/// Integer column holding the ground-truth class index.
pub const LABEL_COLUMN: &str = "y_test";

/// The fixed projection every accepted file must satisfy, in column order.
pub const PROJECTION: [&str; 3] = [INPUT_COLUMN, PREDICTION_COLUMN, LABEL_COLUMN];

/// Only files with this extension are accepted for ingestion.
pub const PARQUET_EXTENSION: &str = ".parquet";

/// Case-insensitive extension check applied to dropped files.
pub fn is_parquet_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.len() > PARQUET_EXTENSION.len() && lower.ends_with(PARQUET_EXTENSION)
}

// ============================================================================
// Source Files
// ============================================================================

/// A user-supplied file: its display name and raw contents.
///
/// The core never reads paths; whoever builds a `SourceFile` is responsible for
/// getting the bytes into memory.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub name: String,
    pub bytes: Bytes,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

// ============================================================================
// Sample Records
// ============================================================================

/// One decoded evaluation row.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SampleRecord {
    /// Serialized float32 tensor. Owned by the record; never mutated after decode.
    ///
    /// **Not serialized.** Reports carry the decoded raster instead of raw bytes.
    #[serde(skip)]
    pub input: Vec<u8>,

    /// Per-class scores, index = class. Empty when the row had no usable prediction.
    pub predicted_distribution: Vec<f64>,

    /// Ground-truth class index. `None` when the label was null or could not be
    /// coerced to an integer.
    pub true_label: Option<i64>,
}

impl SampleRecord {
    pub fn new(input: Vec<u8>, predicted_distribution: Vec<f64>, true_label: Option<i64>) -> Self {
        Self {
            input,
            predicted_distribution,
            true_label,
        }
    }

    /// Whether a prediction is present at all.
    pub fn has_prediction(&self) -> bool {
        !self.predicted_distribution.is_empty()
    }
}
