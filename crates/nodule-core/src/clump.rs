//! Clumps: regions estimated to hold more than one nodule.

use serde::{Deserialize, Serialize};

use crate::arena::RegionId;
use crate::types::NoduleError;

/// Correction value meaning "leave the clump as it is".
pub const NO_CHANGE: i64 = -1;

/// A region believed to contain several touching nodules.
///
/// Created by the splitting heuristic, mutated by external count
/// correction or by absorption into a mixed region, and destroyed with
/// its backing region.
#[derive(Debug, Clone, PartialEq)]
pub struct Clump {
    region: RegionId,
    nodule_count: u32,
    area_per_nodule: f64,
    has_mixed: bool,
}

/// What [`Clump::correct_count`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CorrectionOutcome {
    /// Count changed, total area preserved.
    Corrected {
        /// Count before the correction.
        previous: u32,
    },
    /// Count set to zero; the clump no longer holds any nodule.
    Emptied {
        /// Count before the correction.
        previous: u32,
    },
    /// The no-change sentinel was supplied.
    Unchanged,
}

impl Clump {
    pub(crate) const fn new(region: RegionId, nodule_count: u32, area_per_nodule: f64) -> Self {
        Self {
            region,
            nodule_count,
            area_per_nodule,
            has_mixed: false,
        }
    }

    /// Handle of the backing region.
    #[must_use]
    pub const fn region(&self) -> RegionId {
        self.region
    }

    /// Estimated number of nodules.
    #[must_use]
    pub const fn nodule_count(&self) -> u32 {
        self.nodule_count
    }

    /// Estimated area of each nodule in pixels.
    #[must_use]
    pub const fn area_per_nodule(&self) -> f64 {
        self.area_per_nodule
    }

    /// `nodule_count × area_per_nodule`.
    #[must_use]
    pub fn total_area(&self) -> f64 {
        f64::from(self.nodule_count) * self.area_per_nodule
    }

    /// Whether a mixed region has already claimed one of this clump's
    /// nodules.
    #[must_use]
    pub const fn has_mixed(&self) -> bool {
        self.has_mixed
    }

    pub(crate) const fn mark_mixed(&mut self) {
        self.has_mixed = true;
    }

    pub(crate) const fn clear_mixed(&mut self) {
        self.has_mixed = false;
    }

    /// Hand one nodule to a separately drawn region. The rest of the
    /// clump now covers `remaining_area` pixels.
    pub(crate) fn release_one(&mut self, remaining_area: f64) {
        self.nodule_count = self.nodule_count.saturating_sub(1);
        self.area_per_nodule = if self.nodule_count == 0 {
            0.0
        } else {
            remaining_area / f64::from(self.nodule_count)
        };
    }

    /// Apply an externally supplied count.
    ///
    /// `0` empties the clump, [`NO_CHANGE`] leaves it alone, and a
    /// positive count redistributes the unchanged total area over the new
    /// number of nodules. The new count is never chosen here.
    ///
    /// # Errors
    ///
    /// Returns [`NoduleError::InvalidCorrection`] for any other value
    /// (negative counts other than the sentinel, or counts that do not
    /// fit in `u32`). The clump is untouched and the caller may ask again.
    pub fn correct_count(&mut self, new_count: i64) -> Result<CorrectionOutcome, NoduleError> {
        let previous = self.nodule_count;
        match new_count {
            0 => {
                self.nodule_count = 0;
                self.area_per_nodule = 0.0;
                Ok(CorrectionOutcome::Emptied { previous })
            }
            NO_CHANGE => Ok(CorrectionOutcome::Unchanged),
            n if n > 0 => {
                let count =
                    u32::try_from(n).map_err(|_| NoduleError::InvalidCorrection(new_count))?;
                self.area_per_nodule = self.total_area() / f64::from(count);
                self.nodule_count = count;
                Ok(CorrectionOutcome::Corrected { previous })
            }
            _ => Err(NoduleError::InvalidCorrection(new_count)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::arena::RegionArena;

    fn clump(count: u32, area: f64) -> Clump {
        let mut arena = RegionArena::new();
        Clump::new(arena.insert(()), count, area)
    }

    #[test]
    fn positive_correction_preserves_total_area() {
        let mut c = clump(3, 400.0);
        let before = c.total_area();
        let outcome = c.correct_count(5).unwrap();
        assert_eq!(outcome, CorrectionOutcome::Corrected { previous: 3 });
        assert_eq!(c.nodule_count(), 5);
        assert!((c.total_area() - before).abs() < 1e-9);
        assert!((c.area_per_nodule() - 240.0).abs() < 1e-9);
    }

    #[test]
    fn zero_empties_the_clump() {
        let mut c = clump(4, 100.0);
        assert_eq!(
            c.correct_count(0).unwrap(),
            CorrectionOutcome::Emptied { previous: 4 }
        );
        assert_eq!(c.nodule_count(), 0);
        assert!(c.area_per_nodule().abs() < f64::EPSILON);
    }

    #[test]
    fn sentinel_leaves_clump_alone() {
        let mut c = clump(2, 350.0);
        assert_eq!(c.correct_count(NO_CHANGE).unwrap(), CorrectionOutcome::Unchanged);
        assert_eq!(c.nodule_count(), 2);
        assert!((c.area_per_nodule() - 350.0).abs() < f64::EPSILON);
    }

    #[test]
    fn other_negative_values_are_invalid() {
        let mut c = clump(2, 350.0);
        assert!(matches!(
            c.correct_count(-7),
            Err(NoduleError::InvalidCorrection(-7))
        ));
        assert_eq!(c.nodule_count(), 2, "failed correction must not mutate");
    }

    #[test]
    fn oversized_counts_are_invalid() {
        let mut c = clump(2, 350.0);
        assert!(c.correct_count(i64::from(u32::MAX) + 1).is_err());
    }

    #[test]
    fn new_clump_is_unclaimed() {
        let mut c = clump(2, 10.0);
        assert!(!c.has_mixed());
        c.mark_mixed();
        assert!(c.has_mixed());
    }
}
