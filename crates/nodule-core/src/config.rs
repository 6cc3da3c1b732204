//! Analysis parameters.
//!
//! Every numeric threshold the engine uses lives here so that the CLI
//! and tests can tune them without touching the algorithms.

use serde::{Deserialize, Serialize};

use crate::types::{Channel, NoduleError};

/// Tunable parameters for a nodule analysis run.
///
/// The defaults reproduce the reference measurement protocol. Call
/// [`validate`](Self::validate) before handing a user-supplied config to
/// the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoduleConfig {
    /// Largest pixel area a red region may have and still be considered
    /// a single nodule by the weak circularity test.
    pub red_single_upper_bound: u32,

    /// Largest pixel area a green region may have and still be considered
    /// a single nodule by the weak circularity test.
    pub green_single_upper_bound: u32,

    /// Regions smaller than this many pixels are removed as noise.
    pub low_area_threshold: u32,

    /// Regions filling less than this percentage of their bounding box
    /// are treated as holes.
    pub hole_fill_percent: f64,

    /// Circularity above which a region below the upper bound is single.
    pub weak_circularity: f64,

    /// Circularity above which any region is single.
    pub strong_circularity: f64,

    /// Mixed regions closer than this are merged into one.
    pub self_merge_distance: f64,

    /// Red or green regions closer than this to a mixed region are
    /// absorbed into it.
    pub absorb_distance: f64,

    /// Whether to widen the foreground mask before partitioning.
    pub improve_segmentation: bool,

    /// How many times a reviewer is asked again after giving an invalid
    /// clump count before the clump is left unchanged.
    pub correction_retries: u32,
}

impl NoduleConfig {
    /// Default for both single-nodule upper bounds.
    pub const DEFAULT_SINGLE_UPPER_BOUND: u32 = 3000;
    /// Default noise cutoff in pixels.
    pub const DEFAULT_LOW_AREA_THRESHOLD: u32 = 300;
    /// Default hole fill-ratio cutoff in percent.
    pub const DEFAULT_HOLE_FILL_PERCENT: f64 = 50.0;
    /// Default weak circularity threshold.
    pub const DEFAULT_WEAK_CIRCULARITY: f64 = 0.45;
    /// Default strong circularity threshold.
    pub const DEFAULT_STRONG_CIRCULARITY: f64 = 0.6;
    /// Default mixed self-merge distance in pixels.
    pub const DEFAULT_SELF_MERGE_DISTANCE: f64 = 3.0;
    /// Default absorption distance in pixels.
    pub const DEFAULT_ABSORB_DISTANCE: f64 = 0.5;
    /// Default reviewer retry limit.
    pub const DEFAULT_CORRECTION_RETRIES: u32 = 3;

    /// Single-nodule upper bound for a channel. Mixed regions are never
    /// split, so they have none.
    #[must_use]
    pub const fn single_upper_bound(&self, channel: Channel) -> Option<u32> {
        match channel {
            Channel::Red => Some(self.red_single_upper_bound),
            Channel::Green => Some(self.green_single_upper_bound),
            Channel::Mixed => None,
        }
    }

    /// Check that every parameter is usable.
    ///
    /// # Errors
    ///
    /// Returns [`NoduleError::InvalidConfig`] if a single-nodule upper
    /// bound is zero, a threshold is negative or not finite, or the weak
    /// circularity threshold exceeds the strong one.
    pub fn validate(&self) -> Result<(), NoduleError> {
        for (name, bound) in [
            ("red_single_upper_bound", self.red_single_upper_bound),
            ("green_single_upper_bound", self.green_single_upper_bound),
        ] {
            if bound == 0 {
                return Err(NoduleError::InvalidConfig(format!(
                    "{name} must be non-zero"
                )));
            }
        }

        for (name, value) in [
            ("hole_fill_percent", self.hole_fill_percent),
            ("weak_circularity", self.weak_circularity),
            ("strong_circularity", self.strong_circularity),
            ("self_merge_distance", self.self_merge_distance),
            ("absorb_distance", self.absorb_distance),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(NoduleError::InvalidConfig(format!(
                    "{name} must be a non-negative number, got {value}"
                )));
            }
        }

        if self.weak_circularity > self.strong_circularity {
            return Err(NoduleError::InvalidConfig(format!(
                "weak_circularity ({}) exceeds strong_circularity ({})",
                self.weak_circularity, self.strong_circularity
            )));
        }

        Ok(())
    }
}

impl Default for NoduleConfig {
    fn default() -> Self {
        Self {
            red_single_upper_bound: Self::DEFAULT_SINGLE_UPPER_BOUND,
            green_single_upper_bound: Self::DEFAULT_SINGLE_UPPER_BOUND,
            low_area_threshold: Self::DEFAULT_LOW_AREA_THRESHOLD,
            hole_fill_percent: Self::DEFAULT_HOLE_FILL_PERCENT,
            weak_circularity: Self::DEFAULT_WEAK_CIRCULARITY,
            strong_circularity: Self::DEFAULT_STRONG_CIRCULARITY,
            self_merge_distance: Self::DEFAULT_SELF_MERGE_DISTANCE,
            absorb_distance: Self::DEFAULT_ABSORB_DISTANCE,
            improve_segmentation: true,
            correction_retries: Self::DEFAULT_CORRECTION_RETRIES,
        }
    }
}
