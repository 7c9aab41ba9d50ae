//! Binary tensor decoding.
//!
//! Reinterprets the raw bytes stored in the `input` column as little-endian
//! IEEE-754 float32 values, resolves a 2-D shape for them and renders a
//! grayscale raster with per-tensor min–max normalization.

use thiserror::Error;

// ============================================================================
// Shape Constants
// ============================================================================

/// Side length of the canonical sample image.
pub const SAMPLE_SIDE: usize = 28;

/// Value count of a canonical 28×28 sample.
pub const SAMPLE_VALUES: usize = SAMPLE_SIDE * SAMPLE_SIDE;

/// Value count of the flattened multi-channel layout emitted by one upstream
/// model. Only the leading [`SAMPLE_VALUES`] values are rendered.
pub const WIDE_LAYOUT_VALUES: usize = 50_176;

/// Footprint (in pixels, both axes) of the placeholder shown for undecodable cells.
pub const PLACEHOLDER_SIZE: usize = 56;

const FLOAT_STRIDE: usize = std::mem::size_of::<f32>();

// ============================================================================
// Error Type
// ============================================================================

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("tensor buffer is empty")]
    Empty,

    #[error("tensor buffer length {0} is not a multiple of 4 bytes")]
    Misaligned(usize),

    #[error("no square shape for {0} values")]
    Shape(usize),
}

pub type Result<T> = std::result::Result<T, DecodeError>;

// ============================================================================
// Decoding
// ============================================================================

/// View a byte buffer as little-endian float32 values.
pub fn decode_f32(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    if bytes.len() % FLOAT_STRIDE != 0 {
        return Err(DecodeError::Misaligned(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(FLOAT_STRIDE)
        .map(|c| {
            let mut word = [0u8; FLOAT_STRIDE];
            word.copy_from_slice(c);
            f32::from_le_bytes(word)
        })
        .collect())
}

/// Resolved 2-D shape plus how many leading values it covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorShape {
    pub width: usize,
    pub height: usize,
    /// Number of leading values that make up the rendered slice.
    pub take: usize,
}

impl TensorShape {
    fn square(side: usize) -> Self {
        Self {
            width: side,
            height: side,
            take: side * side,
        }
    }
}

/// Resolve the render shape for `count` float values.
///
/// Known layouts are checked first (the wide upstream layout, then the
/// canonical 28×28 sample); anything else must be a perfect square.
pub fn resolve_shape(count: usize) -> Result<TensorShape> {
    match count {
        0 => Err(DecodeError::Empty),
        WIDE_LAYOUT_VALUES | SAMPLE_VALUES => Ok(TensorShape::square(SAMPLE_SIDE)),
        n => {
            let side = n.isqrt();
            if side * side == n {
                Ok(TensorShape::square(side))
            } else {
                Err(DecodeError::Shape(n))
            }
        }
    }
}

/// Min–max normalize `values` into the 0..=255 intensity range.
///
/// Min and max come from the slice itself. A zero (or NaN) range is floored to
/// 1 so a constant tensor renders black instead of dividing by zero.
pub fn normalize_intensities(values: &[f32]) -> Vec<u8> {
    let Some(&first) = values.first() else {
        return Vec::new();
    };
    let (mut min, mut max) = (first, first);
    for &v in &values[1..] {
        if v < min {
            min = v;
        }
        if v > max {
            max = v;
        }
    }
    let mut range = f64::from(max) - f64::from(min);
    if range == 0.0 || range.is_nan() {
        range = 1.0;
    }
    let min = f64::from(min);
    values
        .iter()
        .map(|&v| {
            let normalized = (f64::from(v) - min) / range;
            // NaN saturates to 0, out-of-range values clamp.
            (normalized * 255.0).round() as u8
        })
        .collect()
}

// ============================================================================
// Rasters
// ============================================================================

/// Grayscale image stored as RGBA8, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Raster {
    pub width: usize,
    pub height: usize,
    /// `width * height * 4` bytes; R = G = B = intensity, A = 255.
    pub rgba: Vec<u8>,
}

impl Raster {
    pub fn from_intensities(width: usize, height: usize, intensities: &[u8]) -> Self {
        debug_assert_eq!(intensities.len(), width * height);
        let mut rgba = Vec::with_capacity(intensities.len() * 4);
        for &i in intensities {
            rgba.extend_from_slice(&[i, i, i, 255]);
        }
        Self {
            width,
            height,
            rgba,
        }
    }

    /// Intensity of the pixel at (`x`, `y`).
    pub fn intensity(&self, x: usize, y: usize) -> u8 {
        self.rgba[(y * self.width + x) * 4]
    }

    /// All intensities, row-major.
    pub fn intensities(&self) -> impl Iterator<Item = u8> + '_ {
        self.rgba.chunks_exact(4).map(|px| px[0])
    }

    /// Coarse terminal preview, one glyph per pixel.
    pub fn to_ascii(&self) -> String {
        const RAMP: &[u8] = b" .:-=+*#%@";
        let mut out = String::with_capacity((self.width + 1) * self.height);
        for y in 0..self.height {
            for x in 0..self.width {
                let level = usize::from(self.intensity(x, y)) * (RAMP.len() - 1) / 255;
                out.push(RAMP[level] as char);
            }
            out.push('\n');
        }
        out
    }
}

/// What the presentation layer draws for one `input` cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderedCell {
    Image(Raster),
    /// Fixed-size stand-in for a tensor that could not be decoded.
    Placeholder { reason: DecodeError },
}

impl RenderedCell {
    pub fn is_placeholder(&self) -> bool {
        matches!(self, RenderedCell::Placeholder { .. })
    }

    /// (width, height) of the drawn cell in pixels.
    pub fn size(&self) -> (usize, usize) {
        match self {
            RenderedCell::Image(r) => (r.width, r.height),
            RenderedCell::Placeholder { .. } => (PLACEHOLDER_SIZE, PLACEHOLDER_SIZE),
        }
    }
}

/// Decode, reshape and normalize one tensor into a raster.
pub fn decode_raster(bytes: &[u8]) -> Result<Raster> {
    let values = decode_f32(bytes)?;
    let shape = resolve_shape(values.len())?;
    let intensities = normalize_intensities(&values[..shape.take]);
    Ok(Raster::from_intensities(
        shape.width,
        shape.height,
        &intensities,
    ))
}

/// Like [`decode_raster`], but never fails: decode errors become a placeholder.
pub fn render(bytes: &[u8]) -> RenderedCell {
    match decode_raster(bytes) {
        Ok(raster) => RenderedCell::Image(raster),
        Err(reason) => {
            tracing::debug!("tensor decode failed ({} bytes): {reason}", bytes.len());
            RenderedCell::Placeholder { reason }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
