use std::collections::HashMap;

use parking_lot::Mutex;

use scanview_core::{IntensityRange, ScanId};

/// Per-scan cumulative intensity ranges.
///
/// Each scan's range starts empty and is widened once per accepted decode,
/// so it covers every image of the scan decoded so far this session. Widening
/// is commutative; finish order does not matter.
pub struct RangeTable {
    ranges: Mutex<HashMap<ScanId, IntensityRange>>,
}

impl RangeTable {
    pub fn new() -> Self {
        Self {
            ranges: Mutex::new(HashMap::new()),
        }
    }

    /// Fold `observed` into the scan's cumulative range.
    pub fn widen(&self, scan: &ScanId, observed: IntensityRange) {
        let mut ranges = self.ranges.lock();
        let entry = ranges.entry(scan.clone()).or_insert(IntensityRange::EMPTY);
        *entry = entry.union(&observed);
    }

    /// The cumulative range so far; empty if nothing decoded yet.
    pub fn get(&self, scan: &ScanId) -> IntensityRange {
        self.ranges
            .lock()
            .get(scan)
            .copied()
            .unwrap_or(IntensityRange::EMPTY)
    }

    pub fn clear(&self) {
        self.ranges.lock().clear();
    }
}

impl Default for RangeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widen_accumulates_across_images() {
        let table = RangeTable::new();
        let scan = ScanId::from("s1");
        assert!(table.get(&scan).is_empty());

        table.widen(&scan, IntensityRange::new(0.0, 10.0));
        table.widen(&scan, IntensityRange::new(5.0, 20.0));
        table.widen(&scan, IntensityRange::new(-5.0, 8.0));
        assert_eq!(table.get(&scan), IntensityRange::new(-5.0, 20.0));
    }

    #[test]
    fn scans_are_independent() {
        let table = RangeTable::new();
        table.widen(&ScanId::from("a"), IntensityRange::new(0.0, 1.0));
        assert!(table.get(&ScanId::from("b")).is_empty());
    }
}
