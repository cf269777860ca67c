use crate::error::CoreError;
use crate::range::IntensityRange;

/// A decoded scalar image volume.
///
/// Voxels are stored as `f32` in x-fastest order, already rescaled to
/// physical intensity units by the codec that produced them.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    /// Voxel counts along x, y, z.
    pub dims: [u32; 3],

    /// Physical voxel spacing along x, y, z, in millimetres.
    pub spacing: [f64; 3],

    /// Voxel data, `dims[0] * dims[1] * dims[2]` values.
    pub data: Vec<f32>,
}

impl Volume {
    pub fn new(dims: [u32; 3], spacing: [f64; 3], data: Vec<f32>) -> crate::Result<Self> {
        if dims.iter().any(|&d| d == 0) {
            return Err(CoreError::InvalidVolume {
                reason: format!("dimensions must be > 0, got {dims:?}"),
            });
        }
        let expected = dims.iter().map(|&d| d as usize).product::<usize>();
        if data.len() != expected {
            return Err(CoreError::InvalidVolume {
                reason: format!(
                    "voxel count mismatch: dims {dims:?} need {expected} values, got {}",
                    data.len()
                ),
            });
        }
        if spacing.iter().any(|&s| s <= 0.0 || !s.is_finite()) {
            return Err(CoreError::InvalidVolume {
                reason: format!("spacing must be positive and finite, got {spacing:?}"),
            });
        }
        Ok(Self {
            dims,
            spacing,
            data,
        })
    }

    pub fn voxel_count(&self) -> usize {
        self.data.len()
    }

    /// Scan the voxel data for its intensity range. NaN voxels are skipped.
    pub fn value_range(&self) -> IntensityRange {
        let mut range = IntensityRange::EMPTY;
        for &v in &self.data {
            if !v.is_nan() {
                range.widen(f64::from(v));
            }
        }
        range
    }
}
