use serde::{Deserialize, Serialize};

/// A closed voxel-intensity interval.
///
/// Starts as the empty range `[+inf, -inf]` and only ever widens. Folding
/// observed values or other ranges into it is commutative, so the result is
/// independent of the order images finish decoding.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntensityRange {
    pub min: f64,
    pub max: f64,
}

impl IntensityRange {
    /// The identity element for [`union`](Self::union): contains nothing.
    pub const EMPTY: Self = Self {
        min: f64::INFINITY,
        max: f64::NEG_INFINITY,
    };

    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// True while no value has been folded in.
    pub fn is_empty(&self) -> bool {
        self.min > self.max
    }

    /// Widen to include `value`.
    pub fn widen(&mut self, value: f64) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    /// The smallest range containing both `self` and `other`.
    pub fn union(&self, other: &Self) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }
}

impl Default for IntensityRange {
    fn default() -> Self {
        Self::EMPTY
    }
}
