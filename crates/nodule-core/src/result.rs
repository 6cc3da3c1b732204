//! Final tables handed to exporters.
//!
//! These are plain serde types with positional indices only, so they can
//! be written to CSV or JSON without access to the datasets.

use serde::{Deserialize, Serialize};

use crate::types::{Channel, Dimensions};

/// Clump estimate attached to a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClumpRow {
    /// Estimated nodules in the clump.
    pub nodule_count: u32,
    /// Estimated area of each nodule.
    pub area_per_nodule: f64,
    /// Whether a mixed region claimed one of the nodules.
    pub has_mixed: bool,
}

/// Colour split and linkage of a mixed row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixedSplit {
    /// Pixels (or linked per-nodule area) counted as red.
    pub red_pixels: u32,
    /// Pixels (or linked per-nodule area) counted as green.
    pub green_pixels: u32,
    /// Position of the linked red clump's region, or `-1`.
    pub red_link: i64,
    /// Position of the linked green clump's region, or `-1`.
    pub green_link: i64,
}

impl MixedSplit {
    /// Whether either colour is derived from a clump.
    #[must_use]
    pub const fn is_linked(&self) -> bool {
        self.red_link >= 0 || self.green_link >= 0
    }
}

/// One region's measurements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionRow {
    /// Display name.
    pub name: String,
    /// Nodules counted for this region.
    pub nodule_count: u32,
    /// Measured area in pixels.
    pub pixel_area: u32,
    /// Circularity, when the shape pass ran.
    pub circularity: Option<f64>,
    /// Clump estimate, for red and green regions that were split.
    pub clump: Option<ClumpRow>,
    /// Colour split, for mixed regions.
    pub mixed: Option<MixedSplit>,
}

/// All rows of one dataset in positional order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelTable {
    /// Which dataset.
    pub channel: Channel,
    /// Running nodule total, including nodules lent to mixed regions.
    pub total_nodule_count: u32,
    /// Rows in positional order.
    pub rows: Vec<RegionRow>,
}

impl ChannelTable {
    /// Nodules counted for this colour: the running total less one for
    /// every clump that lent a nodule to a mixed region, which counts it
    /// instead.
    #[must_use]
    pub fn own_nodule_count(&self) -> u32 {
        let lent = self
            .rows
            .iter()
            .filter(|row| row.clump.as_ref().is_some_and(|c| c.has_mixed))
            .count();
        self.total_nodule_count
            .saturating_sub(u32::try_from(lent).unwrap_or(u32::MAX))
    }
}

/// Headline numbers of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoduleSummary {
    /// Red nodules.
    pub red: u32,
    /// Green nodules.
    pub green: u32,
    /// Mixed nodules.
    pub mixed: u32,
}

impl NoduleSummary {
    /// Nodules across all classes.
    #[must_use]
    pub const fn total(&self) -> u32 {
        self.red.saturating_add(self.green).saturating_add(self.mixed)
    }
}

/// Output of a complete analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoduleResult {
    /// Source image size.
    pub dimensions: Dimensions,
    /// Red table.
    pub red: ChannelTable,
    /// Green table.
    pub green: ChannelTable,
    /// Mixed table.
    pub mixed: ChannelTable,
}

impl NoduleResult {
    /// Table for one channel.
    #[must_use]
    pub const fn table(&self, channel: Channel) -> &ChannelTable {
        match channel {
            Channel::Red => &self.red,
            Channel::Green => &self.green,
            Channel::Mixed => &self.mixed,
        }
    }

    /// Per-class nodule totals. A nodule a clump lent to a mixed region
    /// is counted as mixed only.
    #[must_use]
    pub fn summary(&self) -> NoduleSummary {
        NoduleSummary {
            red: self.red.own_nodule_count(),
            green: self.green.own_nodule_count(),
            mixed: self.mixed.own_nodule_count(),
        }
    }
}
