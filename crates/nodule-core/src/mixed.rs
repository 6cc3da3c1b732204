//! The mixed-colour dataset and cross-channel merging.
//!
//! Mixed regions sit between red and green nodules: segmentation often
//! cuts one physical nodule into a mixed core with red or green fringes.
//! The passes here glue those fragments back together:
//!
//! 1. [`self_merge`](MixedDataset::self_merge) joins mixed regions that
//!    nearly touch each other,
//! 2. [`confirm`](MixedDataset::confirm) lets a reviewer drop false
//!    positives,
//! 3. [`absorb`](MixedDataset::absorb) pulls touching green and red
//!    regions into each mixed region, claiming one nodule of a clump
//!    instead of the whole clump,
//! 4. [`recompute_areas`](MixedDataset::recompute_areas) splits each
//!    grown region's area into red and green parts.

use std::collections::{BTreeMap, HashSet};

use geo::{MultiPolygon, Rect};
use image::RgbImage;
use log::{debug, info, warn};
use rstar::primitives::{GeomWithData, Rectangle};
use rstar::{AABB, RTree};
use serde::{Deserialize, Serialize};

use crate::arena::RegionId;
use crate::classify::classify_red_green;
use crate::dataset::ChannelDataset;
use crate::geometry::{closest_distance, envelope_gap};
use crate::region::Region;
use crate::result::{ChannelTable, MixedSplit};
use crate::review::{ReviewerPort, Verdict};
use crate::types::{Channel, NoduleError};

type IndexedEnvelope = GeomWithData<Rectangle<[f64; 2]>, RegionId>;

/// Clumps a mixed region has claimed a nodule from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Linkage {
    /// Backing region of the linked red clump.
    pub red: Option<RegionId>,
    /// Backing region of the linked green clump.
    pub green: Option<RegionId>,
}

impl Linkage {
    /// Link for one colour. Always `None` for [`Channel::Mixed`].
    #[must_use]
    pub const fn get(&self, channel: Channel) -> Option<RegionId> {
        match channel {
            Channel::Red => self.red,
            Channel::Green => self.green,
            Channel::Mixed => None,
        }
    }

    const fn set(&mut self, channel: Channel, id: RegionId) {
        match channel {
            Channel::Red => self.red = Some(id),
            Channel::Green => self.green = Some(id),
            Channel::Mixed => {}
        }
    }

    const fn clear(&mut self, channel: Channel) {
        match channel {
            Channel::Red => self.red = None,
            Channel::Green => self.green = None,
            Channel::Mixed => {}
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct MixedRow {
    red_pixels: u32,
    green_pixels: u32,
    linkage: Linkage,
}

/// Outcome of [`MixedDataset::absorb`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbsorbReport {
    /// Plain regions removed from their colour dataset and merged.
    pub absorbed: usize,
    /// Clumps that lent one nodule to a mixed region.
    pub linked: usize,
    /// Clumps already claimed by another mixed region.
    pub skipped: usize,
}

impl AbsorbReport {
    const fn add(&mut self, other: Self) {
        self.absorbed += other.absorbed;
        self.linked += other.linked;
        self.skipped += other.skipped;
    }
}

/// A [`ChannelDataset`] of mixed regions plus their colour split and
/// clump linkage.
#[derive(Debug, Clone)]
pub struct MixedDataset {
    base: ChannelDataset,
    rows: BTreeMap<RegionId, MixedRow>,
}

impl MixedDataset {
    /// Wrap a detected mixed-channel dataset.
    ///
    /// # Errors
    ///
    /// Returns [`NoduleError::InvariantViolation`] if `base` holds another
    /// channel.
    pub fn new(base: ChannelDataset) -> Result<Self, NoduleError> {
        if base.channel() != Channel::Mixed {
            return Err(NoduleError::InvariantViolation {
                channel: base.channel(),
                detail: "mixed dataset built from another channel".to_owned(),
            });
        }
        let rows = base
            .ids()
            .iter()
            .map(|&id| (id, MixedRow::default()))
            .collect();
        Ok(Self { base, rows })
    }

    /// The underlying region dataset.
    #[must_use]
    pub const fn base(&self) -> &ChannelDataset {
        &self.base
    }

    /// Clump linkage of a region; empty for unknown handles.
    #[must_use]
    pub fn linkage(&self, id: RegionId) -> Linkage {
        self.rows.get(&id).map(|r| r.linkage).unwrap_or_default()
    }

    /// `(red, green)` pixel split of a region, once
    /// [`recompute_areas`](Self::recompute_areas) ran.
    #[must_use]
    pub fn split(&self, id: RegionId) -> (u32, u32) {
        self.rows
            .get(&id)
            .map_or((0, 0), |r| (r.red_pixels, r.green_pixels))
    }

    /// Positional view of a region's linkage: the current index of each
    /// linked clump's backing region, or `-1`.
    #[must_use]
    pub fn linkage_indices(
        &self,
        id: RegionId,
        red: &ChannelDataset,
        green: &ChannelDataset,
    ) -> (i64, i64) {
        let linkage = self.linkage(id);
        let index = |link: Option<RegionId>, dataset: &ChannelDataset| {
            link.and_then(|l| dataset.position(l))
                .and_then(|p| i64::try_from(p).ok())
                .unwrap_or(-1)
        };
        (index(linkage.red, red), index(linkage.green, green))
    }

    /// Remove a mixed region and its split row.
    ///
    /// # Errors
    ///
    /// Returns [`NoduleError::NotFound`] if `id` is not live.
    pub fn remove_region(&mut self, id: RegionId) -> Result<Region, NoduleError> {
        let region = self.base.remove_region(id)?;
        self.rows.remove(&id);
        Ok(region)
    }

    /// Swap in a new shape for a mixed region.
    ///
    /// # Errors
    ///
    /// Returns [`NoduleError::NotFound`] if `id` is not live.
    pub fn replace_region(&mut self, id: RegionId, region: Region) -> Result<Region, NoduleError> {
        self.base.replace_region(id, region)
    }

    /// Append a mixed region with an unlinked, empty split.
    pub fn add_region(&mut self, region: Region) -> RegionId {
        let id = self.base.add_region(region);
        self.rows.insert(id, MixedRow::default());
        id
    }

    /// Mixed regions linked to `id` in `channel`, in positional order.
    #[must_use]
    pub fn linked_to(&self, channel: Channel, id: RegionId) -> Vec<RegionId> {
        self.base
            .ids()
            .iter()
            .copied()
            .filter(|mixed| self.linkage(*mixed).get(channel) == Some(id))
            .collect()
    }

    /// Remove every mixed region linked to `id` in `channel`. Returns
    /// the removed regions.
    pub fn remove_linked_to(&mut self, channel: Channel, id: RegionId) -> Vec<Region> {
        self.linked_to(channel, id)
            .into_iter()
            .filter_map(|mixed| self.remove_region(mixed).ok())
            .collect()
    }

    /// Drop the `channel` link of one mixed region.
    pub fn unlink(&mut self, id: RegionId, channel: Channel) {
        if let Some(row) = self.rows.get_mut(&id) {
            row.linkage.clear(channel);
        }
    }

    /// Count a region's pixels red or green from `image`, as for an
    /// unlinked region, and make that its pixel area.
    ///
    /// # Errors
    ///
    /// Returns [`NoduleError::NotFound`] if `id` is not live.
    pub fn reclassify(&mut self, id: RegionId, image: &RgbImage) -> Result<(), NoduleError> {
        let region = self.base.region(id).ok_or(NoduleError::NotFound(id))?;
        let (red_pixels, green_pixels) = classify_pixels(image, region);
        let row = self.rows.entry(id).or_default();
        row.red_pixels = red_pixels;
        row.green_pixels = green_pixels;
        self.base
            .set_pixel_area(id, red_pixels.saturating_add(green_pixels))
    }

    // ─────────────────────────── Self-merge ───────────────────────────

    /// Merge mixed regions closer than `threshold` to each other.
    ///
    /// Scans ordered pairs in positional order; the first close pair
    /// `(a, b)` becomes `a ∪ b` at `a`'s position and `b` is removed.
    /// The scan restarts after every merge, since a grown region may now
    /// reach a third one. Returns the number of merges.
    pub fn self_merge(&mut self, threshold: f64) -> usize {
        let mut merges = 0;
        while self.base.len() > 1 {
            let Some((a, b)) = self.find_close_pair(threshold) else {
                break;
            };
            let merged = match (self.base.region(a), self.base.region(b)) {
                (Some(ra), Some(rb)) => ra.union(rb),
                _ => break,
            };
            debug!("mixed: merging {b} into {a}");
            if self.replace_region(a, merged).is_err() || self.remove_region(b).is_err() {
                warn!("mixed: merge of {b} into {a} lost a region, stopping");
                break;
            }
            merges += 1;
        }
        info!("mixed: {merges} self-merges, {} regions left", self.base.len());
        merges
    }

    fn find_close_pair(&self, threshold: f64) -> Option<(RegionId, RegionId)> {
        let regions: Vec<(RegionId, &Region)> = self.base.regions().collect();
        regions.iter().find_map(|&(a, ra)| {
            regions
                .iter()
                .find(|&&(b, rb)| {
                    a != b
                        && envelope_gap(ra.outline(), rb.outline()) < threshold
                        && closest_distance(ra.outline(), rb.outline()) < threshold
                })
                .map(|&(b, _)| (a, b))
        })
    }

    // ────────────────────────── Confirmation ──────────────────────────

    /// Present every mixed region to `reviewer` and remove the rejected
    /// ones. Returns how many were removed.
    pub fn confirm(&mut self, reviewer: &mut dyn ReviewerPort) -> usize {
        let ids = self.base.ids().to_vec();
        let mut rejected = 0;
        for id in ids {
            let verdict = match self.base.region(id) {
                Some(region) => reviewer.confirm_region(Channel::Mixed, region),
                None => continue,
            };
            if verdict == Verdict::Reject && self.remove_region(id).is_ok() {
                rejected += 1;
            }
        }
        info!("mixed: reviewer rejected {rejected} regions");
        rejected
    }

    // ─────────────────────────── Absorption ───────────────────────────

    /// Grow every mixed region by the green, then red, regions closer
    /// than `threshold`.
    ///
    /// Candidates are tried in their dataset's positional order against
    /// the growing shape until none is close enough:
    ///
    /// * a clump already claimed by a mixed region is passed over,
    /// * an unclaimed clump is claimed, linked, and its shape merged in,
    ///   but it stays in its own dataset,
    /// * any other region is removed from its dataset and merged in.
    ///
    /// # Errors
    ///
    /// Returns [`NoduleError::NotFound`] if a mixed region vanished
    /// mid-pass.
    pub fn absorb(
        &mut self,
        red: &mut ChannelDataset,
        green: &mut ChannelDataset,
        threshold: f64,
    ) -> Result<AbsorbReport, NoduleError> {
        let mut report = AbsorbReport::default();
        for id in self.base.ids().to_vec() {
            let mut shape = self
                .base
                .region(id)
                .cloned()
                .ok_or(NoduleError::NotFound(id))?;
            let row = self.rows.entry(id).or_default();
            report.add(absorb_from(&mut shape, &mut row.linkage, green, threshold));
            report.add(absorb_from(&mut shape, &mut row.linkage, red, threshold));
            self.base.replace_region(id, shape)?;
        }
        info!(
            "mixed: absorbed {} regions, linked {} clumps, skipped {} claimed clumps",
            report.absorbed, report.linked, report.skipped
        );
        Ok(report)
    }

    // ────────────────────────── Recomputation ─────────────────────────

    /// Split each mixed region's area into red and green.
    ///
    /// Unlinked colours count the region's pixels by the red/green
    /// boundary of the classifier. A linked colour takes the linked
    /// clump's per-nodule area instead, and the clump's backing region is
    /// redrawn as the mixed shape. The row's pixel area becomes the sum
    /// of both parts.
    ///
    /// # Errors
    ///
    /// Returns [`NoduleError::NotFound`] if a region vanished mid-pass.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn recompute_areas(
        &mut self,
        image: &RgbImage,
        red: &mut ChannelDataset,
        green: &mut ChannelDataset,
    ) -> Result<(), NoduleError> {
        for id in self.base.ids().to_vec() {
            let region = self
                .base
                .region(id)
                .cloned()
                .ok_or(NoduleError::NotFound(id))?;
            let (mut red_pixels, mut green_pixels) = classify_pixels(image, &region);
            let linkage = self.linkage(id);

            for (channel, dataset, count) in [
                (Channel::Red, &mut *red, &mut red_pixels),
                (Channel::Green, &mut *green, &mut green_pixels),
            ] {
                let Some(link) = linkage.get(channel) else {
                    continue;
                };
                let Some(clump) = dataset.clump(link) else {
                    debug!("mixed: {id} links to {channel} {link}, which is no longer a clump");
                    continue;
                };
                *count = clump.area_per_nodule() as u32;
                let mut shape = region.clone();
                if let Some(old) = dataset.region(link) {
                    shape.set_name(old.name());
                }
                dataset.replace_region(link, shape)?;
            }

            let row = self.rows.entry(id).or_default();
            row.red_pixels = red_pixels;
            row.green_pixels = green_pixels;
            self.base
                .set_pixel_area(id, red_pixels.saturating_add(green_pixels))?;
        }
        Ok(())
    }

    // ─────────────────────────── Consistency ───────────────────────────

    /// Verify the base dataset and that every split row belongs to a
    /// live region.
    ///
    /// # Errors
    ///
    /// Returns [`NoduleError::InvariantViolation`] on the first mismatch.
    pub fn check_invariants(&self) -> Result<(), NoduleError> {
        self.base.check_invariants()?;
        if let Some(id) = self.rows.keys().find(|&&id| self.base.region(id).is_none()) {
            return Err(NoduleError::InvariantViolation {
                channel: Channel::Mixed,
                detail: format!("split row for missing region {id}"),
            });
        }
        Ok(())
    }

    /// Snapshot as a positional table with colour splits and positional
    /// linkage.
    #[must_use]
    pub fn table(&self, red: &ChannelDataset, green: &ChannelDataset) -> ChannelTable {
        let mut table = self.base.table();
        for (row, &id) in table.rows.iter_mut().zip(self.base.ids()) {
            let (red_pixels, green_pixels) = self.split(id);
            let (red_link, green_link) = self.linkage_indices(id, red, green);
            row.mixed = Some(MixedSplit {
                red_pixels,
                green_pixels,
                red_link,
                green_link,
            });
        }
        table
    }
}

fn absorb_from(
    shape: &mut Region,
    linkage: &mut Linkage,
    source: &mut ChannelDataset,
    threshold: f64,
) -> AbsorbReport {
    let channel = source.channel();
    let tree: RTree<IndexedEnvelope> = RTree::bulk_load(
        source
            .regions()
            .filter_map(|(id, r)| r.bounds().map(|b| GeomWithData::new(rectangle(b), id)))
            .collect(),
    );

    let mut report = AbsorbReport::default();
    let mut pending: Vec<RegionId> = source.ids().to_vec();
    loop {
        let Some(envelope) = query_envelope(shape.outline(), threshold) else {
            break;
        };
        let near: HashSet<RegionId> = tree
            .locate_in_envelope_intersecting(&envelope)
            .map(|entry| entry.data)
            .collect();
        let hit = pending.iter().position(|id| {
            near.contains(id)
                && source
                    .region(*id)
                    .is_some_and(|r| closest_distance(shape.outline(), r.outline()) < threshold)
        });
        let Some(k) = hit else {
            break;
        };
        let id = pending.remove(k);

        match source.clump_mut(id) {
            Some(clump) if clump.has_mixed() => {
                debug!("{channel}: clump {id} already claimed, skipping");
                report.skipped += 1;
            }
            Some(clump) => {
                clump.mark_mixed();
                linkage.set(channel, id);
                if let Some(region) = source.region(id) {
                    *shape = shape.union(region);
                }
                report.linked += 1;
            }
            None => match source.remove_region(id) {
                Ok(region) => {
                    *shape = shape.union(&region);
                    report.absorbed += 1;
                }
                Err(e) => warn!("{channel}: could not absorb {id}: {e}"),
            },
        }
    }
    report
}

fn rectangle(rect: Rect<f64>) -> Rectangle<[f64; 2]> {
    Rectangle::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y])
}

fn query_envelope(outline: &MultiPolygon<f64>, threshold: f64) -> Option<AABB<[f64; 2]>> {
    use geo::BoundingRect;
    let rect = outline.bounding_rect()?;
    Some(AABB::from_corners(
        [rect.min().x - threshold, rect.min().y - threshold],
        [rect.max().x + threshold, rect.max().y + threshold],
    ))
}

fn classify_pixels(image: &RgbImage, region: &Region) -> (u32, u32) {
    let (mut red, mut green) = (0u32, 0u32);
    for p in region.pixels() {
        let Some(px) = image.get_pixel_checked(p.x, p.y) else {
            continue;
        };
        match classify_red_green(px.0[0], px.0[1]) {
            Channel::Green => green += 1,
            _ => red += 1,
        }
    }
    (red, green)
}
