//! Shared types for the nodule analysis engine.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::arena::RegionId;

/// Re-export `GrayImage` so downstream crates can pass foreground masks
/// without depending on `image` directly.
pub use image::GrayImage;

/// Re-export `RgbImage` so downstream crates can pass source images
/// without depending on `image` directly.
pub use image::RgbImage;

/// Colour class of a nodule region.
///
/// Each class owns one dataset. Logic shared between the three datasets
/// is parameterized over this tag instead of being duplicated per colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Red (nitrogen-fixing) nodules.
    Red,
    /// Green (ineffective) nodules.
    Green,
    /// Nodules whose surface colour sits between the red and green bands.
    Mixed,
}

impl Channel {
    /// All channels in processing order.
    pub const ALL: [Self; 3] = [Self::Red, Self::Green, Self::Mixed];

    /// Colour used when rasterizing this channel's regions.
    #[must_use]
    pub const fn color(self) -> image::Rgb<u8> {
        match self {
            Self::Red => image::Rgb([255, 0, 0]),
            Self::Green => image::Rgb([0, 255, 0]),
            Self::Mixed => image::Rgb([255, 255, 0]),
        }
    }

    /// Prefix of region display names (`"r 3"`, `"g 0"`, `"m 2"`).
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Red => "r",
            Self::Green => "g",
            Self::Mixed => "m",
        }
    }

    /// Human-readable lowercase label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Red => "red",
            Self::Green => "green",
            Self::Mixed => "mixed",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Integer pixel coordinate. Pixel `(x, y)` covers the unit square
/// `[x, x + 1] × [y, y + 1]` in outline coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pixel {
    /// Row (pixels from top edge). Listed first so that ordered sets
    /// iterate in raster-scan order.
    pub y: u32,
    /// Column (pixels from left edge).
    pub x: u32,
}

impl Pixel {
    /// Create a new pixel coordinate.
    #[must_use]
    pub const fn new(x: u32, y: u32) -> Self {
        Self { y, x }
    }

    /// Centre of the pixel in outline coordinates.
    #[must_use]
    pub fn center(self) -> geo::Coord<f64> {
        geo::Coord {
            x: f64::from(self.x) + 0.5,
            y: f64::from(self.y) + 0.5,
        }
    }
}

/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Dimensions {
    /// Whether `(x, y)` lies inside the image.
    #[must_use]
    pub fn contains(self, x: i64, y: i64) -> bool {
        x >= 0 && y >= 0 && x < i64::from(self.width) && y < i64::from(self.height)
    }

    /// Total pixel count.
    #[must_use]
    pub fn area(self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// Errors that can occur while analysing nodule images.
#[derive(Debug, thiserror::Error)]
pub enum NoduleError {
    /// Failed to decode an input image.
    #[error("failed to decode image: {0}")]
    ImageDecode(#[from] image::ImageError),

    /// The input image bytes were empty.
    #[error("input image data is empty")]
    EmptyInput,

    /// The source image and a mask disagree on size.
    #[error("image is {image:?} but mask is {mask:?}")]
    DimensionMismatch {
        /// Size of the source image.
        image: Dimensions,
        /// Size of the mask.
        mask: Dimensions,
    },

    /// Analysis configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A region handle no longer refers to a live region.
    #[error("region {0} not found")]
    NotFound(RegionId),

    /// A positional index is past the end of a dataset.
    #[error("index {index} out of range for dataset of {len} regions")]
    IndexOutOfRange {
        /// Requested position.
        index: usize,
        /// Number of regions in the dataset.
        len: usize,
    },

    /// A clump count correction was neither zero, positive, nor the
    /// no-change sentinel.
    #[error("invalid nodule count correction: {0}")]
    InvalidCorrection(i64),

    /// Regions were read after hole absorption without re-detection.
    #[error("{0} regions are stale after hole absorption; re-detect before measuring")]
    StaleRegions(Channel),

    /// A dataset's internal bookkeeping became inconsistent.
    #[error("{channel} dataset is inconsistent: {detail}")]
    InvariantViolation {
        /// Dataset that failed the check.
        channel: Channel,
        /// Which invariant failed.
        detail: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_prefixes_are_distinct() {
        assert_eq!(Channel::Red.prefix(), "r");
        assert_eq!(Channel::Green.prefix(), "g");
        assert_eq!(Channel::Mixed.prefix(), "m");
    }

    #[test]
    fn pixels_order_in_raster_scan() {
        let mut pixels = vec![Pixel::new(5, 1), Pixel::new(0, 2), Pixel::new(9, 0)];
        pixels.sort();
        assert_eq!(
            pixels,
            vec![Pixel::new(9, 0), Pixel::new(5, 1), Pixel::new(0, 2)],
            "rows must sort before columns"
        );
    }

    #[test]
    fn pixel_center_is_offset_by_half() {
        let c = Pixel::new(3, 4).center();
        assert!((c.x - 3.5).abs() < f64::EPSILON);
        assert!((c.y - 4.5).abs() < f64::EPSILON);
    }

    #[test]
    fn dimensions_contains_rejects_negative_and_edge() {
        let dims = Dimensions {
            width: 4,
            height: 3,
        };
        assert!(dims.contains(0, 0));
        assert!(dims.contains(3, 2));
        assert!(!dims.contains(-1, 0));
        assert!(!dims.contains(4, 0));
        assert!(!dims.contains(0, 3));
    }

    #[test]
    fn stale_error_names_channel() {
        let msg = NoduleError::StaleRegions(Channel::Green).to_string();
        assert!(msg.starts_with("green"), "unexpected message: {msg}");
    }
}
