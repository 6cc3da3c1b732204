//! Per-colour region datasets.
//!
//! A [`ChannelDataset`] owns the regions detected for one colour class
//! together with their measurement rows, circularity column, clumps, a
//! running nodule total, and a cache of every foreground pixel. Every
//! structural edit leaves those in agreement before returning.
//!
//! Regions are stored in a [`RegionArena`], so clumps refer to their
//! backing region by handle and positional indices are derived from the
//! arena order on demand. Removing the region at position `i` therefore
//! moves every clump behind it from `j` to `j - 1` without any rewrite.

use std::collections::{BTreeMap, BTreeSet};

use image::{GrayImage, Luma, RgbImage};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::arena::{RegionArena, RegionId};
use crate::clump::{Clump, CorrectionOutcome};
use crate::config::NoduleConfig;
use crate::geometry::overlaps;
use crate::region::{Region, connected_components};
use crate::result::{ChannelTable, ClumpRow, RegionRow};
use crate::review::ReviewerPort;
use crate::types::{Channel, Dimensions, NoduleError, Pixel};

/// Nodule count and pixel area of one region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Measurement {
    /// Nodules attributed to the region.
    pub nodule_count: u32,
    /// Area in pixels.
    pub pixel_area: u32,
}

impl Measurement {
    /// Default row for a freshly added region: one nodule.
    #[must_use]
    pub fn single(region: &Region) -> Self {
        Self {
            nodule_count: 1,
            pixel_area: pixel_area(region),
        }
    }
}

/// Outcome of [`ChannelDataset::split_clumps`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SplitOutcome {
    /// No confidently single region exists (or the channel is never
    /// split); every region stays a single nodule.
    NothingSplit,
    /// Oversized regions were turned into clumps.
    Split {
        /// Mean area of the confidently single regions.
        mean_single_area: f64,
        /// Population standard deviation of the same areas.
        stdev_single_area: f64,
        /// Number of confidently single regions.
        singles: usize,
        /// Number of clumps created.
        clumps: usize,
    },
}

/// Outcome of [`ChannelDataset::absorb_holes`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoleReport {
    /// Regions under the fill threshold.
    pub holes: usize,
    /// Holes whose pixels were merged into the foreground.
    pub filled: usize,
    /// Holes with no containing region; left as they are.
    pub unmatched: usize,
    /// Foreground pixels added.
    pub pixels_added: usize,
}

#[derive(Debug, Clone)]
struct Row {
    region: Region,
    measurement: Measurement,
    circularity: Option<f64>,
}

/// Regions and measurements for one colour class.
#[derive(Debug, Clone)]
pub struct ChannelDataset {
    channel: Channel,
    dimensions: Dimensions,
    rows: RegionArena<Row>,
    clumps: BTreeMap<RegionId, Clump>,
    total_nodule_count: u32,
    pixels: BTreeSet<Pixel>,
    hole_fill: BTreeSet<Pixel>,
    stale: bool,
}

impl ChannelDataset {
    /// Create an empty dataset.
    #[must_use]
    pub fn new(channel: Channel, dimensions: Dimensions) -> Self {
        Self {
            channel,
            dimensions,
            rows: RegionArena::new(),
            clumps: BTreeMap::new(),
            total_nodule_count: 0,
            pixels: BTreeSet::new(),
            hole_fill: BTreeSet::new(),
            stale: false,
        }
    }

    /// Create a dataset from a foreground mask (non-zero = foreground) and
    /// detect its regions.
    #[must_use]
    pub fn from_mask(channel: Channel, mask: &GrayImage) -> Self {
        let mut dataset = Self::new(
            channel,
            Dimensions {
                width: mask.width(),
                height: mask.height(),
            },
        );
        dataset.pixels = mask
            .enumerate_pixels()
            .filter(|(_, _, p)| p.0[0] != 0)
            .map(|(x, y, _)| Pixel::new(x, y))
            .collect();
        dataset.detect_regions();
        dataset
    }

    /// Colour class of this dataset.
    #[must_use]
    pub const fn channel(&self) -> Channel {
        self.channel
    }

    /// Image size the dataset rasterizes into.
    #[must_use]
    pub const fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    /// Number of regions.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns `true` if the dataset holds no regions.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Running nodule total.
    #[must_use]
    pub const fn total_nodule_count(&self) -> u32 {
        self.total_nodule_count
    }

    /// Whether hole absorption has run since the last detection.
    #[must_use]
    pub const fn is_stale(&self) -> bool {
        self.stale
    }

    /// Region handles in positional order.
    #[must_use]
    pub fn ids(&self) -> &[RegionId] {
        self.rows.ids()
    }

    /// Handle at a position.
    #[must_use]
    pub fn id_at(&self, index: usize) -> Option<RegionId> {
        self.rows.id_at(index)
    }

    /// Position of a handle.
    #[must_use]
    pub fn position(&self, id: RegionId) -> Option<usize> {
        self.rows.position(id)
    }

    /// Region behind a handle.
    #[must_use]
    pub fn region(&self, id: RegionId) -> Option<&Region> {
        self.rows.get(id).map(|r| &r.region)
    }

    /// Measurement row behind a handle.
    #[must_use]
    pub fn measurement(&self, id: RegionId) -> Option<Measurement> {
        self.rows.get(id).map(|r| r.measurement)
    }

    /// Circularity behind a handle, once [`measure_shapes`](Self::measure_shapes) ran.
    #[must_use]
    pub fn circularity(&self, id: RegionId) -> Option<f64> {
        self.rows.get(id).and_then(|r| r.circularity)
    }

    /// `(handle, region)` pairs in positional order.
    pub fn regions(&self) -> impl Iterator<Item = (RegionId, &Region)> {
        self.rows.iter().map(|(id, row)| (id, &row.region))
    }

    /// Clump backed by a region, if any.
    #[must_use]
    pub fn clump(&self, id: RegionId) -> Option<&Clump> {
        self.clumps.get(&id)
    }

    pub(crate) fn clump_mut(&mut self, id: RegionId) -> Option<&mut Clump> {
        self.clumps.get_mut(&id)
    }

    /// All clumps, ordered by handle.
    pub fn clumps(&self) -> impl Iterator<Item = &Clump> {
        self.clumps.values()
    }

    /// Positional index of a clump's backing region.
    #[must_use]
    pub fn clump_index(&self, clump: &Clump) -> Option<usize> {
        self.position(clump.region())
    }

    /// Every foreground pixel, including hole fills not yet re-detected.
    #[must_use]
    pub const fn pixel_cache(&self) -> &BTreeSet<Pixel> {
        &self.pixels
    }

    /// First region covering pixel `(x, y)`.
    #[must_use]
    pub fn region_at(&self, x: u32, y: u32) -> Option<RegionId> {
        self.rows
            .iter()
            .find(|(_, row)| row.region.contains_pixel(x, y))
            .map(|(id, _)| id)
    }

    /// Position of the first region geometrically equal to `region`.
    #[must_use]
    pub fn index_of(&self, region: &Region) -> Option<usize> {
        self.rows.iter().position(|(_, row)| &row.region == region)
    }

    // ───────────────────────── Structural edits ─────────────────────────

    /// Append a region with a default `(1, pixel count)` row.
    pub fn add_region(&mut self, region: Region) -> RegionId {
        self.pixels.extend(region.pixels().iter().copied());
        let measurement = Measurement::single(&region);
        let id = self.rows.insert(Row {
            region,
            measurement,
            circularity: None,
        });
        self.total_nodule_count = self.total_nodule_count.saturating_add(1);
        id
    }

    /// Remove a region, its row, and its clump.
    ///
    /// The total drops by the clump's count if the region backs one, or
    /// by one otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`NoduleError::NotFound`] if `id` is not live.
    pub fn remove_region(&mut self, id: RegionId) -> Result<Region, NoduleError> {
        let Some((position, row)) = self.rows.remove(id) else {
            warn!("{}: cannot remove region {id}: not found", self.channel);
            return Err(NoduleError::NotFound(id));
        };
        let decrement = self.clumps.remove(&id).map_or(1, |c| c.nodule_count());
        self.total_nodule_count = self.total_nodule_count.saturating_sub(decrement);
        self.refresh_pixel_cache();
        debug!(
            "{}: removed {} from position {position}",
            self.channel,
            row.region.name()
        );
        Ok(row.region)
    }

    /// Remove the region at a position.
    ///
    /// # Errors
    ///
    /// Returns [`NoduleError::IndexOutOfRange`] if `index` is past the end.
    pub fn remove_at(&mut self, index: usize) -> Result<Region, NoduleError> {
        let id = self.checked_id(index)?;
        self.remove_region(id)
    }

    /// Swap in a new shape for a region, keeping its position, clump, and
    /// nodule count. The pixel area is recomputed from the new shape.
    ///
    /// # Errors
    ///
    /// Returns [`NoduleError::NotFound`] if `id` is not live.
    pub fn replace_region(&mut self, id: RegionId, region: Region) -> Result<Region, NoduleError> {
        let row = self.rows.get_mut(id).ok_or(NoduleError::NotFound(id))?;
        row.measurement.pixel_area = pixel_area(&region);
        if row.circularity.is_some() {
            row.circularity = Some(region.circularity());
        }
        let old = std::mem::replace(&mut row.region, region);
        self.refresh_pixel_cache();
        Ok(old)
    }

    /// Replace the region at a position.
    ///
    /// # Errors
    ///
    /// Returns [`NoduleError::IndexOutOfRange`] if `index` is past the end.
    pub fn replace_at(&mut self, index: usize, region: Region) -> Result<Region, NoduleError> {
        let id = self.checked_id(index)?;
        self.replace_region(id, region)
    }

    pub(crate) fn set_pixel_area(&mut self, id: RegionId, pixel_area: u32) -> Result<(), NoduleError> {
        let row = self.rows.get_mut(id).ok_or(NoduleError::NotFound(id))?;
        row.measurement.pixel_area = pixel_area;
        Ok(())
    }

    /// Paint every region's pixels in the channel colour on black.
    #[must_use]
    pub fn rebuild_mask(&self) -> RgbImage {
        let mut image = RgbImage::new(self.dimensions.width, self.dimensions.height);
        let color = self.channel.color();
        for (_, row) in self.rows.iter() {
            for p in row.region.pixels() {
                if p.x < self.dimensions.width && p.y < self.dimensions.height {
                    image.put_pixel(p.x, p.y, color);
                }
            }
        }
        image
    }

    fn foreground_mask(&self) -> GrayImage {
        let mut mask = GrayImage::new(self.dimensions.width, self.dimensions.height);
        for p in &self.pixels {
            if p.x < self.dimensions.width && p.y < self.dimensions.height {
                mask.put_pixel(p.x, p.y, Luma([255]));
            }
        }
        mask
    }

    fn refresh_pixel_cache(&mut self) {
        let mut pixels: BTreeSet<Pixel> = self.hole_fill.clone();
        for (_, row) in self.rows.iter() {
            pixels.extend(row.region.pixels().iter().copied());
        }
        self.pixels = pixels;
    }

    fn checked_id(&self, index: usize) -> Result<RegionId, NoduleError> {
        self.rows.id_at(index).ok_or(NoduleError::IndexOutOfRange {
            index,
            len: self.rows.len(),
        })
    }

    const fn ensure_fresh(&self) -> Result<(), NoduleError> {
        if self.stale {
            Err(NoduleError::StaleRegions(self.channel))
        } else {
            Ok(())
        }
    }

    // ──────────────────────── Detection & cleanup ───────────────────────

    /// Rebuild all regions from the pixel cache.
    ///
    /// Each 8-connected component becomes a region, in raster-scan order
    /// of its first pixel. Each background pocket enclosed by a component
    /// follows it as a pixel-less region, so that
    /// [`absorb_holes`](Self::absorb_holes) can fill it. Measurements are
    /// reset to `(1, pixel area)`, clumps dropped, the total recounted,
    /// and the stale flag cleared.
    pub fn detect_regions(&mut self) {
        let mask = self.foreground_mask();
        self.rows.clear();
        self.clumps.clear();
        self.hole_fill.clear();
        self.total_nodule_count = 0;
        self.stale = false;

        let prefix = self.channel.prefix();
        let mut holes = 0;
        for component in connected_components(&mask) {
            let region = Region::from_pixels(format!("{prefix} {}", self.rows.len()), component);
            let pockets: Vec<_> = region
                .outline()
                .iter()
                .flat_map(|p| p.interiors().iter().cloned())
                .collect();
            self.add_region(region);
            for ring in pockets {
                self.add_region(Region::hole(format!("{prefix} {}", self.rows.len()), ring));
                holes += 1;
            }
        }
        self.refresh_pixel_cache();
        info!(
            "{}: detected {} regions ({holes} enclosed pockets)",
            self.channel,
            self.rows.len()
        );
    }

    /// Remove every region smaller than `low_area_threshold` pixels, and
    /// every region with no pixels whatever the threshold.
    ///
    /// Positions are collected first and removed from the highest down,
    /// so earlier removals never shift a position still to be removed.
    ///
    /// # Errors
    ///
    /// Returns [`NoduleError::StaleRegions`] if holes were absorbed
    /// without re-detecting.
    pub fn filter_noise(&mut self, low_area_threshold: u32) -> Result<usize, NoduleError> {
        self.ensure_fresh()?;
        let doomed: Vec<usize> = self
            .rows
            .iter()
            .enumerate()
            .filter(|(_, (_, row))| {
                row.region.pixel_count() == 0 || row.measurement.pixel_area < low_area_threshold
            })
            .map(|(i, _)| i)
            .collect();
        for &index in doomed.iter().rev() {
            self.remove_at(index)?;
        }
        debug!(
            "{}: removed {} regions under {low_area_threshold} pixels",
            self.channel,
            doomed.len()
        );
        Ok(doomed.len())
    }

    /// Merge low-fill regions into the foreground of their container.
    ///
    /// A region is a hole when its pixels cover less than
    /// `percent_threshold` percent of its bounding box. Its container is
    /// the first other region whose solid outline shares area with the
    /// hole's. Found containers get every pixel inside the hole's outer
    /// boundary added to the pixel cache; regions themselves are left
    /// alone. Afterwards the dataset is stale: call
    /// [`detect_regions`](Self::detect_regions) before reading
    /// measurements again.
    ///
    /// # Errors
    ///
    /// Returns [`NoduleError::StaleRegions`] if holes were already
    /// absorbed without re-detecting.
    pub fn absorb_holes(&mut self, percent_threshold: f64) -> Result<HoleReport, NoduleError> {
        self.ensure_fresh()?;
        let solids: Vec<(RegionId, geo::MultiPolygon<f64>)> = self
            .rows
            .iter()
            .map(|(id, row)| (id, row.region.solid_outline()))
            .collect();

        let mut report = HoleReport::default();
        let mut fill = BTreeSet::new();
        for ((id, row), (_, hole)) in self.rows.iter().zip(&solids) {
            if row.region.fill_percent() >= percent_threshold {
                continue;
            }
            report.holes += 1;
            let container = solids
                .iter()
                .find(|(other, outline)| *other != id && overlaps(hole, outline));
            match container {
                Some((container, _)) => {
                    debug!(
                        "{}: hole {} absorbed by {container}",
                        self.channel,
                        row.region.name()
                    );
                    fill.extend(row.region.filled_pixels());
                    report.filled += 1;
                }
                None => {
                    warn!(
                        "{}: no container found for hole {}",
                        self.channel,
                        row.region.name()
                    );
                    report.unmatched += 1;
                }
            }
        }

        report.pixels_added = fill.difference(&self.pixels).count();
        if report.filled > 0 {
            self.hole_fill = fill;
            self.stale = true;
            self.refresh_pixel_cache();
        }
        info!(
            "{}: {} holes, {} filled, {} pixels added",
            self.channel, report.holes, report.filled, report.pixels_added
        );
        Ok(report)
    }

    // ───────────────────────── Clump splitting ─────────────────────────

    /// Turn oversized regions into clumps.
    ///
    /// A region is confidently single when its circularity exceeds the
    /// weak threshold and its area is under the channel's upper bound, or
    /// its circularity exceeds the strong threshold. Every other region
    /// larger than the upper bound becomes a clump of
    /// [`round_down`]`(area / mean_single_area - 1)` nodules. Measurement
    /// rows are not touched; call
    /// [`rewrite_measurements`](Self::rewrite_measurements) next.
    ///
    /// # Errors
    ///
    /// Returns [`NoduleError::StaleRegions`] if holes were absorbed
    /// without re-detecting.
    #[allow(clippy::cast_precision_loss)]
    pub fn split_clumps(&mut self, config: &NoduleConfig) -> Result<SplitOutcome, NoduleError> {
        self.ensure_fresh()?;
        self.clumps.clear();
        let Some(upper) = config.single_upper_bound(self.channel) else {
            return Ok(SplitOutcome::NothingSplit);
        };
        let upper = f64::from(upper);

        let stats: Vec<(RegionId, f64, bool)> = self
            .rows
            .iter()
            .map(|(id, row)| {
                let area = f64::from(row.measurement.pixel_area);
                let circularity = row.region.circularity();
                let single = (circularity > config.weak_circularity && area < upper)
                    || circularity > config.strong_circularity;
                (id, area, single)
            })
            .collect();

        let singles: Vec<f64> = stats
            .iter()
            .filter(|(_, _, single)| *single)
            .map(|(_, area, _)| *area)
            .collect();
        if singles.is_empty() {
            info!(
                "{}: no confidently single regions, nothing split",
                self.channel
            );
            return Ok(SplitOutcome::NothingSplit);
        }
        let n = singles.len() as f64;
        let mean = singles.iter().sum::<f64>() / n;
        let variance = singles.iter().map(|a| (a - mean).powi(2)).sum::<f64>() / n;
        let stdev = variance.sqrt();

        for &(id, area, single) in &stats {
            if single || area <= upper {
                continue;
            }
            let count = round_down(area / mean - 1.0);
            self.clumps
                .insert(id, Clump::new(id, count, area / f64::from(count)));
        }

        info!(
            "{}: mean single area {mean:.1} (stdev {stdev:.1}) over {} regions, {} clumps",
            self.channel,
            singles.len(),
            self.clumps.len()
        );
        Ok(SplitOutcome::Split {
            mean_single_area: mean,
            stdev_single_area: stdev,
            singles: singles.len(),
            clumps: self.clumps.len(),
        })
    }

    /// Set clump rows to `(count, count × area per nodule)` and every
    /// other row's count to one, then recount the total.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn rewrite_measurements(&mut self) {
        let ids = self.rows.ids().to_vec();
        let mut total: u32 = 0;
        for id in ids {
            let clump = self.clumps.get(&id);
            if let Some(row) = self.rows.get_mut(id) {
                match clump {
                    Some(c) => {
                        row.measurement = Measurement {
                            nodule_count: c.nodule_count(),
                            pixel_area: c.total_area().round() as u32,
                        };
                    }
                    None => row.measurement.nodule_count = 1,
                }
                total = total.saturating_add(row.measurement.nodule_count);
            }
        }
        self.total_nodule_count = total;
    }

    /// Fill the circularity column from the current shapes.
    pub fn measure_shapes(&mut self) {
        let ids = self.rows.ids().to_vec();
        for id in ids {
            if let Some(row) = self.rows.get_mut(id) {
                row.circularity = Some(row.region.circularity());
            }
        }
    }

    // ───────────────────────── Clump correction ─────────────────────────

    /// Apply an external count to the clump backed by `id`.
    ///
    /// A positive count rewrites the row and moves the total by
    /// `new - old`. Zero removes the region (and the clump with it).
    ///
    /// # Errors
    ///
    /// Returns [`NoduleError::NotFound`] if `id` backs no clump, or
    /// [`NoduleError::InvalidCorrection`] if the value is not acceptable;
    /// in that case nothing changed and the caller may retry.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn correct_clump(
        &mut self,
        id: RegionId,
        new_count: i64,
    ) -> Result<CorrectionOutcome, NoduleError> {
        let clump = self.clumps.get_mut(&id).ok_or(NoduleError::NotFound(id))?;
        let outcome = clump.correct_count(new_count)?;
        match outcome {
            CorrectionOutcome::Corrected { previous } => {
                let measurement = Measurement {
                    nodule_count: clump.nodule_count(),
                    pixel_area: clump.total_area().round() as u32,
                };
                if let Some(row) = self.rows.get_mut(id) {
                    row.measurement = measurement;
                }
                self.total_nodule_count = self
                    .total_nodule_count
                    .saturating_add(measurement.nodule_count)
                    .saturating_sub(previous);
            }
            CorrectionOutcome::Emptied { previous } => {
                self.total_nodule_count = self.total_nodule_count.saturating_sub(previous);
                self.remove_region(id)?;
            }
            CorrectionOutcome::Unchanged => {}
        }
        Ok(outcome)
    }

    /// Ask `reviewer` for the count of one clump and apply it, asking
    /// again up to `retries` times if the answer is invalid. Gives up
    /// with [`CorrectionOutcome::Unchanged`] after that.
    ///
    /// # Errors
    ///
    /// Returns [`NoduleError::NotFound`] if `id` backs no clump.
    pub fn review_clump(
        &mut self,
        id: RegionId,
        reviewer: &mut dyn ReviewerPort,
        retries: u32,
    ) -> Result<CorrectionOutcome, NoduleError> {
        for attempt in 0..=retries {
            let proposed = {
                let clump = self.clumps.get(&id).ok_or(NoduleError::NotFound(id))?;
                let region = self.region(id).ok_or(NoduleError::NotFound(id))?;
                reviewer.correct_count(self.channel, clump, region)
            };
            match self.correct_clump(id, proposed) {
                Err(NoduleError::InvalidCorrection(value)) => {
                    warn!(
                        "{}: rejected count {value} for clump {id} (attempt {})",
                        self.channel,
                        attempt + 1
                    );
                }
                other => return other,
            }
        }
        warn!(
            "{}: leaving clump {id} unchanged after {} invalid counts",
            self.channel,
            retries + 1
        );
        Ok(CorrectionOutcome::Unchanged)
    }

    /// Run [`review_clump`](Self::review_clump) over every clump.
    /// Returns how many clumps changed.
    ///
    /// # Errors
    ///
    /// Propagates [`NoduleError::NotFound`] if a clump vanished mid-pass.
    pub fn review_clumps(
        &mut self,
        reviewer: &mut dyn ReviewerPort,
        retries: u32,
    ) -> Result<usize, NoduleError> {
        let ids: Vec<RegionId> = self.clumps.keys().copied().collect();
        let mut changed = 0;
        for id in ids {
            if self.review_clump(id, reviewer, retries)? != CorrectionOutcome::Unchanged {
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Cut `drawn` out of the clump backed by `id`, taking one nodule
    /// with it. The clump's region shrinks to the pixels left, its row
    /// follows, and the total drops by one. A clump left with no nodules
    /// is removed. Returns the count left in the clump.
    ///
    /// # Errors
    ///
    /// Returns [`NoduleError::NotFound`] if `id` backs no clump.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub(crate) fn carve_clump(&mut self, id: RegionId, drawn: &Region) -> Result<u32, NoduleError> {
        let remaining = self
            .region(id)
            .filter(|_| self.clumps.contains_key(&id))
            .ok_or(NoduleError::NotFound(id))?
            .difference(drawn);
        let area = remaining.pixel_count() as f64;
        let clump = self.clumps.get_mut(&id).ok_or(NoduleError::NotFound(id))?;
        clump.release_one(area);
        let left = clump.nodule_count();
        let measurement = Measurement {
            nodule_count: left,
            pixel_area: clump.total_area().round() as u32,
        };
        self.total_nodule_count = self.total_nodule_count.saturating_sub(1);

        if left == 0 {
            self.remove_region(id)?;
        } else {
            self.replace_region(id, remaining)?;
            if let Some(row) = self.rows.get_mut(id) {
                row.measurement = measurement;
            }
        }
        debug!("{}: carved one nodule out of clump {id}, {left} left", self.channel);
        Ok(left)
    }

    #[cfg(test)]
    pub(crate) fn insert_clump(&mut self, id: RegionId, nodule_count: u32, area_per_nodule: f64) {
        self.clumps
            .insert(id, Clump::new(id, nodule_count, area_per_nodule));
        self.rewrite_measurements();
    }

    // ─────────────────────────── Consistency ───────────────────────────

    /// Verify that rows, order, and clumps agree.
    ///
    /// # Errors
    ///
    /// Returns [`NoduleError::InvariantViolation`] describing the first
    /// inconsistency.
    pub fn check_invariants(&self) -> Result<(), NoduleError> {
        let violation = |detail: String| NoduleError::InvariantViolation {
            channel: self.channel,
            detail,
        };
        self.rows.check().map_err(violation)?;
        for (&id, clump) in &self.clumps {
            if clump.region() != id {
                return Err(violation(format!(
                    "clump keyed by {id} points at {}",
                    clump.region()
                )));
            }
            if !self.rows.contains(id) {
                return Err(violation(format!("clump backed by missing region {id}")));
            }
        }
        Ok(())
    }

    /// Snapshot the dataset as a positional table.
    #[must_use]
    pub fn table(&self) -> ChannelTable {
        let rows = self
            .rows
            .iter()
            .map(|(id, row)| RegionRow {
                name: row.region.name().to_owned(),
                nodule_count: row.measurement.nodule_count,
                pixel_area: row.measurement.pixel_area,
                circularity: row.circularity,
                clump: self.clumps.get(&id).map(|c| ClumpRow {
                    nodule_count: c.nodule_count(),
                    area_per_nodule: c.area_per_nodule(),
                    has_mixed: c.has_mixed(),
                }),
                mixed: None,
            })
            .collect();
        ChannelTable {
            channel: self.channel,
            total_nodule_count: self.total_nodule_count,
            rows,
        }
    }
}

/// Round a raw clump estimate: values below 2 become 2; otherwise the
/// value is truncated unless its tenths digit is 8 or 9, in which case it
/// is rounded to the nearest integer.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn round_down(estimate: f64) -> u32 {
    if estimate.is_nan() || estimate < 2.0 {
        return 2;
    }
    let tenths = (estimate * 10.0).floor() % 10.0;
    let rounded = if tenths < 8.0 {
        estimate.trunc()
    } else {
        estimate.round()
    };
    rounded.min(f64::from(u32::MAX)) as u32
}

fn pixel_area(region: &Region) -> u32 {
    u32::try_from(region.pixel_count()).unwrap_or(u32::MAX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::clump::NO_CHANGE;
    use crate::review::ScriptedReviewer;

    fn dims() -> Dimensions {
        Dimensions {
            width: 200,
            height: 200,
        }
    }

    fn block(name: &str, x0: u32, y0: u32, w: u32, h: u32) -> Region {
        Region::from_pixels(
            name,
            (y0..y0 + h).flat_map(|y| (x0..x0 + w).map(move |x| Pixel::new(x, y))),
        )
    }

    fn assert_aligned(dataset: &ChannelDataset) {
        assert_eq!(dataset.ids().len(), dataset.table().rows.len());
        dataset.check_invariants().unwrap();
    }

    #[test]
    fn round_down_reference_values() {
        assert_eq!(round_down(2.79), 2);
        assert_eq!(round_down(2.81), 3);
        assert_eq!(round_down(1.3), 2);
        assert_eq!(round_down(1.95), 2);
        assert_eq!(round_down(4.0), 4);
        assert_eq!(round_down(f64::NAN), 2);
    }

    #[test]
    fn add_region_appends_default_row() {
        let mut ds = ChannelDataset::new(Channel::Red, dims());
        let id = ds.add_region(block("r 0", 0, 0, 3, 4));
        assert_eq!(
            ds.measurement(id),
            Some(Measurement {
                nodule_count: 1,
                pixel_area: 12
            })
        );
        assert_eq!(ds.total_nodule_count(), 1);
        assert_eq!(ds.pixel_cache().len(), 12);
        assert_aligned(&ds);
    }

    #[test]
    fn remove_missing_region_is_not_found() {
        let mut ds = ChannelDataset::new(Channel::Red, dims());
        let id = ds.add_region(block("r 0", 0, 0, 2, 2));
        ds.remove_region(id).unwrap();
        assert!(matches!(ds.remove_region(id), Err(NoduleError::NotFound(_))));
        assert!(matches!(
            ds.remove_at(0),
            Err(NoduleError::IndexOutOfRange { index: 0, len: 0 })
        ));
    }

    #[test]
    fn removal_shifts_clump_position_down() {
        let mut ds = ChannelDataset::new(Channel::Green, dims());
        let ids: Vec<_> = (0..4)
            .map(|i| ds.add_region(block(&format!("g {i}"), i * 10, 0, 5, 5)))
            .collect();
        ds.clumps.insert(ids[3], Clump::new(ids[3], 3, 10.0));
        let i = 1;
        ds.remove_at(i).unwrap();
        let clump = ds.clump(ids[3]).unwrap();
        assert_eq!(ds.clump_index(clump), Some(i + 1));
        assert_aligned(&ds);
    }

    #[test]
    fn removing_clump_region_drops_clump_count() {
        let mut ds = ChannelDataset::new(Channel::Red, dims());
        let a = ds.add_region(block("r 0", 0, 0, 5, 5));
        let b = ds.add_region(block("r 1", 20, 0, 5, 5));
        ds.clumps.insert(b, Clump::new(b, 3, 8.0));
        ds.rewrite_measurements();
        assert_eq!(ds.total_nodule_count(), 4);
        ds.remove_region(b).unwrap();
        assert_eq!(ds.total_nodule_count(), 1);
        assert!(ds.clump(b).is_none());
        assert!(ds.region(a).is_some());
    }

    #[test]
    fn replace_recomputes_area_and_cache() {
        let mut ds = ChannelDataset::new(Channel::Mixed, dims());
        let id = ds.add_region(block("m 0", 0, 0, 2, 2));
        let old = ds.replace_region(id, block("m 0", 10, 10, 3, 3)).unwrap();
        assert_eq!(old.pixel_count(), 4);
        assert_eq!(ds.measurement(id).unwrap().pixel_area, 9);
        assert!(!ds.pixel_cache().contains(&Pixel::new(0, 0)));
        assert!(ds.pixel_cache().contains(&Pixel::new(11, 11)));
    }

    #[test]
    fn index_of_uses_geometry() {
        let mut ds = ChannelDataset::new(Channel::Red, dims());
        ds.add_region(block("r 0", 0, 0, 2, 2));
        ds.add_region(block("r 1", 10, 0, 2, 2));
        assert_eq!(ds.index_of(&block("renamed", 10, 0, 2, 2)), Some(1));
        assert_eq!(ds.index_of(&block("r 9", 50, 50, 2, 2)), None);
    }

    #[test]
    fn rebuild_mask_paints_channel_colour() {
        let mut ds = ChannelDataset::new(Channel::Mixed, dims());
        ds.add_region(block("m 0", 3, 4, 1, 1));
        let mask = ds.rebuild_mask();
        assert_eq!(*mask.get_pixel(3, 4), Channel::Mixed.color());
        assert_eq!(mask.get_pixel(0, 0).0, [0, 0, 0]);
    }

    #[test]
    fn detection_orders_components_and_emits_pockets() {
        let mut mask = GrayImage::new(40, 40);
        // Ring with a pocket at (5..8, 5..8), then a solid block.
        for y in 4..9 {
            for x in 4..9 {
                if !((5..8).contains(&x) && (5..8).contains(&y)) {
                    mask.put_pixel(x, y, Luma([255]));
                }
            }
        }
        for y in 20..25 {
            for x in 1..4 {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
        let ds = ChannelDataset::from_mask(Channel::Red, &mask);
        assert_eq!(ds.len(), 3);
        let names: Vec<_> = ds.regions().map(|(_, r)| r.name().to_owned()).collect();
        assert_eq!(names, vec!["r 0", "r 1", "r 2"]);
        let pocket = ds.region(ds.id_at(1).unwrap()).unwrap();
        assert_eq!(pocket.pixel_count(), 0, "pocket carries no foreground");
        assert_eq!(ds.total_nodule_count(), 3);
    }

    #[test]
    fn hole_absorption_is_two_phase() {
        let mut mask = GrayImage::new(40, 40);
        for y in 4..24 {
            for x in 4..24 {
                if !((8..20).contains(&x) && (8..20).contains(&y)) {
                    mask.put_pixel(x, y, Luma([255]));
                }
            }
        }
        let mut ds = ChannelDataset::from_mask(Channel::Green, &mask);
        assert_eq!(ds.len(), 2, "ring plus its pocket");

        let report = ds.absorb_holes(50.0).unwrap();
        assert_eq!(report.filled, 1);
        assert_eq!(report.pixels_added, 144);
        assert!(ds.is_stale());
        assert_eq!(ds.len(), 2, "regions untouched until re-detection");
        assert!(matches!(
            ds.filter_noise(300),
            Err(NoduleError::StaleRegions(Channel::Green))
        ));

        ds.detect_regions();
        assert!(!ds.is_stale());
        assert_eq!(ds.len(), 1);
        let id = ds.id_at(0).unwrap();
        assert_eq!(ds.measurement(id).unwrap().pixel_area, 400);
    }

    #[test]
    fn hole_without_container_is_left_alone() {
        let mut ds = ChannelDataset::new(Channel::Red, dims());
        // A sparse diagonal: under 50% of its bounding box, touching nothing.
        ds.add_region(Region::from_pixels(
            "r 0",
            (0..10).map(|i| Pixel::new(i, i)),
        ));
        let report = ds.absorb_holes(50.0).unwrap();
        assert_eq!(report.holes, 1);
        assert_eq!(report.unmatched, 1);
        assert!(!ds.is_stale());
    }

    #[test]
    fn noise_filter_removes_small_regions_from_the_top() {
        let mut ds = ChannelDataset::new(Channel::Red, dims());
        ds.add_region(block("r 0", 0, 0, 2, 2));
        let keep = ds.add_region(block("r 1", 10, 0, 20, 20));
        ds.add_region(block("r 2", 50, 0, 3, 3));
        let removed = ds.filter_noise(300).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(ds.ids(), &[keep]);
        assert_eq!(ds.total_nodule_count(), 1);
        assert_aligned(&ds);
    }

    #[test]
    fn pockets_never_survive_noise_filter() {
        let mut mask = GrayImage::new(20, 20);
        for y in 4..9 {
            for x in 4..9 {
                if !((5..8).contains(&x) && (5..8).contains(&y)) {
                    mask.put_pixel(x, y, Luma([255]));
                }
            }
        }
        let mut ds = ChannelDataset::from_mask(Channel::Red, &mask);
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.filter_noise(0).unwrap(), 1);
        assert_eq!(ds.len(), 1);
        assert_eq!(ds.total_nodule_count(), 1);
        assert_eq!(ds.region(ds.id_at(0).unwrap()).unwrap().pixel_count(), 16);
    }

    fn disc(name: &str, cx: u32, cy: u32, r: u32) -> Region {
        let r_sq = f64::from(r * r);
        Region::from_pixels(
            name,
            (cy - r..=cy + r).flat_map(move |y| {
                (cx - r..=cx + r)
                    .filter(move |&x| {
                        let dx = f64::from(x) - f64::from(cx);
                        let dy = f64::from(y) - f64::from(cy);
                        dx.mul_add(dx, dy * dy) <= r_sq
                    })
                    .map(move |x| Pixel::new(x, y))
            }),
        )
    }

    #[test]
    fn oversized_elongated_region_becomes_clump() {
        let mut ds = ChannelDataset::new(Channel::Red, Dimensions {
            width: 400,
            height: 400,
        });
        let singles = [
            ds.add_region(disc("r 0", 20, 20, 12)),
            ds.add_region(disc("r 1", 60, 20, 12)),
        ];
        // Long bar: poor circularity, far above the upper bound.
        let bar = ds.add_region(block("r 2", 0, 100, 300, 20));
        let config = NoduleConfig {
            red_single_upper_bound: 1000,
            ..NoduleConfig::default()
        };

        let outcome = ds.split_clumps(&config).unwrap();
        let SplitOutcome::Split {
            mean_single_area,
            singles: n_singles,
            clumps,
            ..
        } = outcome
        else {
            panic!("expected a split, got {outcome:?}");
        };
        assert_eq!(n_singles, 2);
        assert_eq!(clumps, 1);

        let clump = ds.clump(bar).unwrap();
        let expected = round_down(6000.0 / mean_single_area - 1.0);
        assert_eq!(clump.nodule_count(), expected);
        assert!(singles.iter().all(|&s| ds.clump(s).is_none()));

        ds.rewrite_measurements();
        let row = ds.measurement(bar).unwrap();
        assert_eq!(row.nodule_count, expected);
        assert_eq!(row.pixel_area, 6000);
        assert_eq!(ds.total_nodule_count(), 2 + expected);
    }

    #[test]
    fn no_single_regions_means_nothing_split() {
        let mut ds = ChannelDataset::new(Channel::Green, dims());
        ds.add_region(block("g 0", 0, 0, 150, 4));
        let config = NoduleConfig {
            green_single_upper_bound: 100,
            ..NoduleConfig::default()
        };
        assert_eq!(
            ds.split_clumps(&config).unwrap(),
            SplitOutcome::NothingSplit
        );
        assert_eq!(ds.clumps().count(), 0);
    }

    #[test]
    fn mixed_channel_is_never_split() {
        let mut ds = ChannelDataset::new(Channel::Mixed, dims());
        ds.add_region(block("m 0", 0, 0, 150, 40));
        assert_eq!(
            ds.split_clumps(&NoduleConfig::default()).unwrap(),
            SplitOutcome::NothingSplit
        );
    }

    fn clumped_dataset() -> (ChannelDataset, RegionId) {
        let mut ds = ChannelDataset::new(Channel::Red, dims());
        ds.add_region(block("r 0", 0, 0, 5, 5));
        let id = ds.add_region(block("r 1", 20, 0, 10, 10));
        ds.clumps.insert(id, Clump::new(id, 4, 25.0));
        ds.rewrite_measurements();
        (ds, id)
    }

    #[test]
    fn correcting_clump_moves_total_by_difference() {
        let (mut ds, id) = clumped_dataset();
        assert_eq!(ds.total_nodule_count(), 5);
        ds.correct_clump(id, 6).unwrap();
        assert_eq!(ds.total_nodule_count(), 7);
        let row = ds.measurement(id).unwrap();
        assert_eq!(row.nodule_count, 6);
        assert_eq!(row.pixel_area, 100, "total area is preserved");
    }

    #[test]
    fn emptying_clump_removes_region() {
        let (mut ds, id) = clumped_dataset();
        let outcome = ds.correct_clump(id, 0).unwrap();
        assert_eq!(outcome, CorrectionOutcome::Emptied { previous: 4 });
        assert!(ds.region(id).is_none());
        assert_eq!(ds.total_nodule_count(), 1);
        assert_aligned(&ds);
    }

    #[test]
    fn carving_moves_one_nodule_out_of_clump() {
        let (mut ds, id) = clumped_dataset();
        let drawn = block("drawn", 20, 0, 5, 10);
        assert_eq!(ds.carve_clump(id, &drawn).unwrap(), 3);
        assert_eq!(ds.total_nodule_count(), 4);
        assert_eq!(ds.region(id).unwrap().pixel_count(), 50);
        assert_eq!(ds.region(id).unwrap().name(), "r 1");
        let row = ds.measurement(id).unwrap();
        assert_eq!((row.nodule_count, row.pixel_area), (3, 50));
        assert_aligned(&ds);
    }

    #[test]
    fn carving_last_nodule_removes_clump_region() {
        let mut ds = ChannelDataset::new(Channel::Red, dims());
        let id = ds.add_region(block("r 0", 0, 0, 10, 10));
        ds.insert_clump(id, 1, 100.0);
        assert_eq!(ds.carve_clump(id, &block("d", 0, 0, 4, 4)).unwrap(), 0);
        assert!(ds.is_empty());
        assert_eq!(ds.total_nodule_count(), 0);
        assert!(matches!(
            ds.carve_clump(id, &block("d", 0, 0, 4, 4)),
            Err(NoduleError::NotFound(_))
        ));
    }

    #[test]
    fn invalid_correction_leaves_dataset_untouched() {
        let (mut ds, id) = clumped_dataset();
        assert!(ds.correct_clump(id, -3).is_err());
        assert_eq!(ds.total_nodule_count(), 5);
        assert_eq!(ds.correct_clump(id, NO_CHANGE).unwrap(), CorrectionOutcome::Unchanged);
    }

    #[test]
    fn review_retries_invalid_answers() {
        let (mut ds, id) = clumped_dataset();
        let mut reviewer = ScriptedReviewer::new().with_counts([-5, -9, 2]);
        let outcome = ds.review_clump(id, &mut reviewer, 3).unwrap();
        assert_eq!(outcome, CorrectionOutcome::Corrected { previous: 4 });
        assert_eq!(reviewer.asked().len(), 3);
        assert_eq!(ds.total_nodule_count(), 3);
    }

    #[test]
    fn review_gives_up_after_retry_limit() {
        let (mut ds, id) = clumped_dataset();
        let mut reviewer = ScriptedReviewer::new().with_counts([-5, -5, -5]);
        let outcome = ds.review_clump(id, &mut reviewer, 1).unwrap();
        assert_eq!(outcome, CorrectionOutcome::Unchanged);
        assert_eq!(reviewer.asked().len(), 2);
        assert_eq!(ds.clump(id).unwrap().nodule_count(), 4);
    }

    #[test]
    fn shapes_pass_fills_circularity() {
        let mut ds = ChannelDataset::new(Channel::Red, dims());
        let id = ds.add_region(block("r 0", 0, 0, 10, 10));
        assert!(ds.circularity(id).is_none());
        ds.measure_shapes();
        assert!(ds.circularity(id).unwrap() > 0.7);
    }
}
