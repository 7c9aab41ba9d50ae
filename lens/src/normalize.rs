//! Columnar result normalization.
//!
//! Walks the three projected columns of a query result (`input`, `y_pred`,
//! `y_test`) and reassembles them into row-oriented [`SampleRecord`]s.
//!
//! Nothing in here fails: a cell with an unexpected shape degrades to the
//! emptiest safe value (empty buffer, empty distribution, `None` label) so one
//! malformed row never discards the rest of a file.

use arrow::array::*;
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::common::SampleRecord;

// ============================================================================
// Arrow Helpers
// ============================================================================

/// Cast an Arrow array to Int64, handling every integer width, floats
/// (truncated) and numeric strings. Uncastable cells become null.
fn cast_to_i64(array: &dyn Array) -> Option<Int64Array> {
    arrow::compute::cast(array, &DataType::Int64)
        .ok()
        .and_then(|a| a.as_any().downcast_ref::<Int64Array>().cloned())
}

/// Cast an Arrow array to Float64.
fn cast_to_f64(array: &dyn Array) -> Option<Float64Array> {
    arrow::compute::cast(array, &DataType::Float64)
        .ok()
        .and_then(|a| a.as_any().downcast_ref::<Float64Array>().cloned())
}

/// Copy `[offsets[i], offsets[i+1])` straight out of the shared values buffer.
fn slice_by_offsets<O: OffsetSizeTrait>(array: &GenericBinaryArray<O>, i: usize) -> Vec<u8> {
    let offsets = array.value_offsets();
    let (Some(start), Some(end)) = (offsets.get(i), offsets.get(i + 1)) else {
        return Vec::new();
    };
    array
        .values()
        .get(start.as_usize()..end.as_usize())
        .map(<[u8]>::to_vec)
        .unwrap_or_default()
}

// ============================================================================
// Binary Cells
// ============================================================================

/// Access strategy for a binary column, chosen once per batch.
enum BinaryColumn<'a> {
    /// Offset-backed layouts: slice the shared buffer directly.
    Offsets(&'a BinaryArray),
    LargeOffsets(&'a LargeBinaryArray),
    /// Layouts without an offsets buffer: copy through the per-row accessor.
    FixedSize(&'a FixedSizeBinaryArray),
    View(&'a BinaryViewArray),
    /// Anything castable to `Binary` (e.g. strings).
    Cast(BinaryArray),
    Missing,
}

impl<'a> BinaryColumn<'a> {
    fn prepare(array: &'a dyn Array) -> Self {
        let direct = match array.data_type() {
            DataType::Binary => array.as_binary_opt::<i32>().map(Self::Offsets),
            DataType::LargeBinary => array.as_binary_opt::<i64>().map(Self::LargeOffsets),
            DataType::FixedSizeBinary(_) => {
                array.as_fixed_size_binary_opt().map(Self::FixedSize)
            }
            DataType::BinaryView => array.as_binary_view_opt().map(Self::View),
            _ => None,
        };
        if let Some(column) = direct {
            return column;
        }
        match arrow::compute::cast(array, &DataType::Binary) {
            Ok(cast) => cast
                .as_binary_opt::<i32>()
                .cloned()
                .map_or(Self::Missing, Self::Cast),
            Err(e) => {
                warn!(
                    "binary column of type {} cannot be read: {e}",
                    array.data_type()
                );
                Self::Missing
            }
        }
    }

    fn is_null(&self, i: usize) -> bool {
        match self {
            Self::Offsets(a) => a.is_null(i),
            Self::LargeOffsets(a) => a.is_null(i),
            Self::FixedSize(a) => a.is_null(i),
            Self::View(a) => a.is_null(i),
            Self::Cast(a) => a.is_null(i),
            Self::Missing => true,
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Offsets(a) => a.len(),
            Self::LargeOffsets(a) => a.len(),
            Self::FixedSize(a) => a.len(),
            Self::View(a) => a.len(),
            Self::Cast(a) => a.len(),
            Self::Missing => 0,
        }
    }

    /// Owned copy of row `i`; empty for nulls and out-of-range rows.
    fn bytes(&self, i: usize) -> Vec<u8> {
        if i >= self.len() || self.is_null(i) {
            return Vec::new();
        }
        match self {
            Self::Offsets(a) => slice_by_offsets(a, i),
            Self::LargeOffsets(a) => slice_by_offsets(a, i),
            Self::Cast(a) => slice_by_offsets(a, i),
            Self::FixedSize(a) => a.value(i).to_vec(),
            Self::View(a) => a.value(i).to_vec(),
            Self::Missing => Vec::new(),
        }
    }
}

// ============================================================================
// Prediction Cells
// ============================================================================

/// The accepted representations of the `y_pred` column. Anything else is
/// [`PredictionEncoding::Unsupported`] and yields empty distributions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionEncoding {
    /// `List<numeric>`.
    List,
    /// `LargeList<numeric>`.
    LargeList,
    /// `FixedSizeList<numeric>`.
    FixedSizeList,
    /// Binary cell: little-endian `u32` count followed by `count` float32 values.
    PackedF32,
    /// `Map<integer, numeric>`; values are ordered by ascending key.
    IndexMap,
    Unsupported,
}

impl PredictionEncoding {
    pub fn detect(data_type: &DataType) -> Self {
        match data_type {
            DataType::List(_) => Self::List,
            DataType::LargeList(_) => Self::LargeList,
            DataType::FixedSizeList(_, _) => Self::FixedSizeList,
            DataType::Binary | DataType::LargeBinary | DataType::BinaryView => Self::PackedF32,
            DataType::Map(_, _) => Self::IndexMap,
            _ => Self::Unsupported,
        }
    }
}

/// Decode a length-prefixed float32 buffer.
pub fn unpack_f32_prefixed(bytes: &[u8]) -> Option<Vec<f64>> {
    let (head, body) = bytes.split_first_chunk::<4>()?;
    let count = u32::from_le_bytes(*head) as usize;
    if body.len() != count.checked_mul(4)? {
        return None;
    }
    Some(
        body.chunks_exact(4)
            .map(|c| {
                let mut word = [0u8; 4];
                word.copy_from_slice(c);
                f64::from(f32::from_le_bytes(word))
            })
            .collect(),
    )
}

/// Collect `values[start..end]`, rejecting nulls.
fn collect_range(values: &Float64Array, start: usize, end: usize) -> Option<Vec<f64>> {
    if end > values.len() || start > end {
        return None;
    }
    (start..end)
        .map(|j| (!values.is_null(j)).then(|| values.value(j)))
        .collect()
}

fn list_row<O: OffsetSizeTrait>(
    list: &GenericListArray<O>,
    values: &Float64Array,
    i: usize,
) -> Option<Vec<f64>> {
    let offsets = list.value_offsets();
    let start = offsets.get(i)?.as_usize();
    let end = offsets.get(i + 1)?.as_usize();
    collect_range(values, start, end)
}

fn is_present(array: &dyn Array, i: usize) -> bool {
    i < array.len() && !array.is_null(i)
}

/// Per-batch prepared view of the prediction column.
enum PredictionColumn<'a> {
    List(&'a ListArray, Float64Array),
    LargeList(&'a LargeListArray, Float64Array),
    FixedSizeList(&'a FixedSizeListArray, Float64Array),
    PackedF32(BinaryColumn<'a>),
    IndexMap {
        map: &'a MapArray,
        keys: Int64Array,
        values: Float64Array,
    },
    Unsupported,
}

impl<'a> PredictionColumn<'a> {
    fn prepare(array: &'a dyn Array) -> Self {
        let encoding = PredictionEncoding::detect(array.data_type());
        let prepared = match encoding {
            PredictionEncoding::List => array
                .as_list_opt::<i32>()
                .and_then(|l| Some(Self::List(l, cast_to_f64(l.values().as_ref())?))),
            PredictionEncoding::LargeList => array
                .as_list_opt::<i64>()
                .and_then(|l| Some(Self::LargeList(l, cast_to_f64(l.values().as_ref())?))),
            PredictionEncoding::FixedSizeList => array.as_fixed_size_list_opt().and_then(|l| {
                Some(Self::FixedSizeList(l, cast_to_f64(l.values().as_ref())?))
            }),
            PredictionEncoding::PackedF32 => Some(Self::PackedF32(BinaryColumn::prepare(array))),
            PredictionEncoding::IndexMap => array.as_map_opt().and_then(|map| {
                Some(Self::IndexMap {
                    map,
                    keys: cast_to_i64(map.keys().as_ref())?,
                    values: cast_to_f64(map.values().as_ref())?,
                })
            }),
            PredictionEncoding::Unsupported => None,
        };
        prepared.unwrap_or_else(|| {
            warn!(
                "prediction column of type {} is not a supported encoding; distributions will be empty",
                array.data_type()
            );
            Self::Unsupported
        })
    }

    fn row(&self, i: usize) -> Option<Vec<f64>> {
        match self {
            Self::List(list, values) => {
                if !is_present(*list, i) {
                    return None;
                }
                list_row(list, values, i)
            }
            Self::LargeList(list, values) => {
                if !is_present(*list, i) {
                    return None;
                }
                list_row(list, values, i)
            }
            Self::FixedSizeList(list, values) => {
                if !is_present(*list, i) {
                    return None;
                }
                let start = usize::try_from(list.value_offset(i)).ok()?;
                let len = usize::try_from(list.value_length()).ok()?;
                collect_range(values, start, start + len)
            }
            Self::PackedF32(column) => unpack_f32_prefixed(&column.bytes(i)),
            Self::IndexMap { map, keys, values } => {
                if !is_present(*map, i) {
                    return None;
                }
                let offsets = map.value_offsets();
                let start = usize::try_from(*offsets.get(i)?).ok()?;
                let end = usize::try_from(*offsets.get(i + 1)?).ok()?;
                let mut entries = Vec::with_capacity(end.saturating_sub(start));
                for j in start..end {
                    if j >= keys.len() || keys.is_null(j) || values.is_null(j) {
                        return None;
                    }
                    entries.push((keys.value(j), values.value(j)));
                }
                entries.sort_by_key(|&(k, _)| k);
                Some(entries.into_iter().map(|(_, v)| v).collect())
            }
            Self::Unsupported => None,
        }
    }

    /// Row `i` as a finite distribution, or empty.
    fn distribution(&self, i: usize) -> Vec<f64> {
        match self.row(i) {
            Some(scores) if scores.iter().all(|v| v.is_finite()) => scores,
            Some(_) => {
                debug!("row {i}: prediction contains non-finite scores, dropping it");
                Vec::new()
            }
            None => Vec::new(),
        }
    }
}

// ============================================================================
// Normalization
// ============================================================================

/// Convert one query result batch into sample records, preserving row order.
pub fn normalize_batch(batch: &RecordBatch) -> Vec<SampleRecord> {
    let num_rows = batch.num_rows();
    let columns = batch.columns();

    let inputs = columns
        .first()
        .map_or(BinaryColumn::Missing, |c| BinaryColumn::prepare(c.as_ref()));
    let predictions = columns
        .get(1)
        .map_or(PredictionColumn::Unsupported, |c| {
            PredictionColumn::prepare(c.as_ref())
        });
    let labels = columns.get(2).and_then(|c| cast_to_i64(c.as_ref()));
    if columns.len() < 3 {
        warn!(
            "result batch has {} columns, expected 3; missing fields stay empty",
            columns.len()
        );
    }

    let records: Vec<SampleRecord> = (0..num_rows)
        .into_par_iter()
        .map(|i| {
            let true_label = labels
                .as_ref()
                .and_then(|l| (i < l.len() && !l.is_null(i)).then(|| l.value(i)));
            SampleRecord::new(inputs.bytes(i), predictions.distribution(i), true_label)
        })
        .collect();

    debug!("normalized {} rows", records.len());
    records
}

/// Convert a full query result, concatenating batches in order.
pub fn normalize_batches(batches: &[RecordBatch]) -> Vec<SampleRecord> {
    let total: usize = batches.iter().map(RecordBatch::num_rows).sum();
    let mut records = Vec::with_capacity(total);
    for batch in batches {
        records.extend(normalize_batch(batch));
    }
    records
}

// ============================================================================
// Tests
// ============================================================================
