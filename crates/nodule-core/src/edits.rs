//! Manual corrections after the automatic passes.
//!
//! An [`EditSession`] owns the three datasets once the pipeline is done
//! and exposes the operations an interactive front end offers: pick the
//! region under the cursor, delete it, redraw it, recount a clump, or
//! break a clump up into separately drawn nodules.
//! [`EditSession::finish`] checks consistency and produces the result
//! tables.

use image::RgbImage;
use log::{debug, info};

use crate::arena::RegionId;
use crate::clump::CorrectionOutcome;
use crate::dataset::ChannelDataset;
use crate::mixed::MixedDataset;
use crate::region::Region;
use crate::result::NoduleResult;
use crate::review::ReviewerPort;
use crate::types::{Channel, NoduleError};

/// The three datasets, open for manual edits.
#[derive(Debug, Clone)]
pub struct EditSession {
    red: ChannelDataset,
    green: ChannelDataset,
    mixed: MixedDataset,
    image: RgbImage,
    correction_retries: u32,
}

impl EditSession {
    pub(crate) const fn new(
        red: ChannelDataset,
        green: ChannelDataset,
        mixed: MixedDataset,
        image: RgbImage,
        correction_retries: u32,
    ) -> Self {
        Self {
            red,
            green,
            mixed,
            image,
            correction_retries,
        }
    }

    const fn colour_mut(
        &mut self,
        channel: Channel,
        id: RegionId,
    ) -> Result<&mut ChannelDataset, NoduleError> {
        match channel {
            Channel::Red => Ok(&mut self.red),
            Channel::Green => Ok(&mut self.green),
            Channel::Mixed => Err(NoduleError::NotFound(id)),
        }
    }

    /// Dataset of one channel.
    #[must_use]
    pub const fn dataset(&self, channel: Channel) -> &ChannelDataset {
        match channel {
            Channel::Red => &self.red,
            Channel::Green => &self.green,
            Channel::Mixed => self.mixed.base(),
        }
    }

    /// The mixed dataset with its colour splits and linkage.
    #[must_use]
    pub const fn mixed(&self) -> &MixedDataset {
        &self.mixed
    }

    /// Region under pixel `(x, y)`, looking in red, then green, then
    /// mixed.
    #[must_use]
    pub fn region_at(&self, x: u32, y: u32) -> Option<(Channel, RegionId)> {
        Channel::ALL.into_iter().find_map(|channel| {
            self.dataset(channel)
                .region_at(x, y)
                .map(|id| (channel, id))
        })
    }

    /// Delete a region. Deleting a red or green region also deletes
    /// every mixed region that claimed a nodule from it; deleting a mixed
    /// region gives the claimed nodule back to its clump. Returns the
    /// deleted region followed by any cascaded mixed regions.
    ///
    /// # Errors
    ///
    /// Returns [`NoduleError::NotFound`] if `id` is not live in
    /// `channel`.
    pub fn delete_region(
        &mut self,
        channel: Channel,
        id: RegionId,
    ) -> Result<Vec<Region>, NoduleError> {
        if channel == Channel::Mixed {
            let linkage = self.mixed.linkage(id);
            let removed = self.mixed.remove_region(id)?;
            for (dataset, link) in [
                (&mut self.red, linkage.red),
                (&mut self.green, linkage.green),
            ] {
                if let Some(clump) = link.and_then(|l| dataset.clump_mut(l)) {
                    clump.clear_mixed();
                }
            }
            return Ok(vec![removed]);
        }
        let mut removed = vec![self.colour_mut(channel, id)?.remove_region(id)?];
        removed.extend(self.drop_linked_mixed(channel, id));
        Ok(removed)
    }

    fn drop_linked_mixed(&mut self, channel: Channel, id: RegionId) -> Vec<Region> {
        let cascaded = self.mixed.remove_linked_to(channel, id);
        if !cascaded.is_empty() {
            debug!(
                "{channel}: losing {id} also removed {} linked mixed regions",
                cascaded.len()
            );
        }
        cascaded
    }

    /// Ask `reviewer` for a new outline and swap it in, keeping the
    /// region's name, position, and clump. Returns `false` if the
    /// reviewer cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`NoduleError::NotFound`] if `id` is not live in
    /// `channel`.
    pub fn redraw_region(
        &mut self,
        channel: Channel,
        id: RegionId,
        reviewer: &mut dyn ReviewerPort,
    ) -> Result<bool, NoduleError> {
        let old = self
            .dataset(channel)
            .region(id)
            .ok_or(NoduleError::NotFound(id))?;
        let Some(mut redrawn) = reviewer.redraw_region(channel, old) else {
            return Ok(false);
        };
        redrawn.set_name(old.name());
        match channel {
            Channel::Red => self.red.replace_region(id, redrawn)?,
            Channel::Green => self.green.replace_region(id, redrawn)?,
            Channel::Mixed => self.mixed.replace_region(id, redrawn)?,
        };
        Ok(true)
    }

    /// Recount a clump through `reviewer`. Emptying the clump deletes
    /// its region together with any mixed region linked to it.
    ///
    /// # Errors
    ///
    /// Returns [`NoduleError::NotFound`] if `id` backs no clump in
    /// `channel`; mixed regions never back clumps.
    pub fn correct_clump(
        &mut self,
        channel: Channel,
        id: RegionId,
        reviewer: &mut dyn ReviewerPort,
    ) -> Result<CorrectionOutcome, NoduleError> {
        let retries = self.correction_retries;
        let outcome = self
            .colour_mut(channel, id)?
            .review_clump(id, reviewer, retries)?;
        if matches!(outcome, CorrectionOutcome::Emptied { .. }) {
            self.drop_linked_mixed(channel, id);
        }
        Ok(outcome)
    }

    /// Break a clump up by having `reviewer` draw its nodules one at a
    /// time.
    ///
    /// Each drawing becomes a single-nodule region of the same colour,
    /// is cut out of the clump, and takes one nodule from its count.
    /// Drawing stops when the reviewer cancels or when every nodule the
    /// clump still owns has been drawn; a nodule lent to a mixed region
    /// is not drawn here. A clump with nothing left is deleted and its
    /// mixed regions keep their shape but lose the link. Returns the new
    /// regions.
    ///
    /// # Errors
    ///
    /// Returns [`NoduleError::NotFound`] if `id` backs no clump in
    /// `channel`.
    pub fn redraw_clump(
        &mut self,
        channel: Channel,
        id: RegionId,
        reviewer: &mut dyn ReviewerPort,
    ) -> Result<Vec<RegionId>, NoduleError> {
        let dataset = self.colour_mut(channel, id)?;
        let lent = dataset
            .clump(id)
            .map(|c| u32::from(c.has_mixed()))
            .ok_or(NoduleError::NotFound(id))?;

        let mut drawn_ids = Vec::new();
        while dataset.clump(id).is_some_and(|c| c.nodule_count() > lent) {
            let Some(mut drawn) = next_drawing(dataset, channel, id, reviewer) else {
                break;
            };
            drawn.set_name(format!("{} {}", channel.prefix(), dataset.len()));
            dataset.carve_clump(id, &drawn)?;
            drawn_ids.push(dataset.add_region(drawn));
        }

        let exhausted = dataset.clump(id).is_none_or(|c| c.nodule_count() <= lent);
        if exhausted && dataset.region(id).is_some() {
            dataset.remove_region(id)?;
        }
        if dataset.region(id).is_none() {
            for mixed in self.mixed.linked_to(channel, id) {
                self.mixed.unlink(mixed, channel);
            }
        }
        info!(
            "{channel}: drew {} nodules out of clump {id}",
            drawn_ids.len()
        );
        Ok(drawn_ids)
    }

    /// Have `reviewer` draw the mixed nodules hidden in a clump.
    ///
    /// The first drawing replaces the mixed region already linked to the
    /// clump, if any, and ends the link; later drawings add new mixed
    /// regions. Every drawing is cut out of the clump and takes one
    /// nodule from its count, so the overall total is unchanged. Mixed
    /// shapes drawn here are split red/green by their own pixels.
    /// Drawing stops when the reviewer cancels or the clump is used up.
    /// Returns the mixed regions drawn.
    ///
    /// # Errors
    ///
    /// Returns [`NoduleError::NotFound`] if `id` backs no clump in
    /// `channel`.
    pub fn redraw_mixed_from_clump(
        &mut self,
        channel: Channel,
        id: RegionId,
        reviewer: &mut dyn ReviewerPort,
    ) -> Result<Vec<RegionId>, NoduleError> {
        if self.colour_mut(channel, id)?.clump(id).is_none() {
            return Err(NoduleError::NotFound(id));
        }
        let mut linked = self.mixed.linked_to(channel, id).into_iter();

        let mut drawn_ids = Vec::new();
        loop {
            let dataset = self.colour_mut(channel, id)?;
            if dataset.clump(id).is_none() {
                break;
            }
            let Some(mut drawn) = next_drawing(dataset, Channel::Mixed, id, reviewer) else {
                break;
            };
            dataset.carve_clump(id, &drawn)?;
            if let Some(clump) = dataset.clump_mut(id) {
                clump.clear_mixed();
            }

            let mixed_id = match linked.next() {
                Some(existing) => {
                    if let Some(old) = self.mixed.base().region(existing) {
                        drawn.set_name(old.name());
                    }
                    self.mixed.replace_region(existing, drawn)?;
                    self.mixed.unlink(existing, channel);
                    existing
                }
                None => {
                    drawn.set_name(format!(
                        "{} {}",
                        Channel::Mixed.prefix(),
                        self.mixed.base().len()
                    ));
                    self.mixed.add_region(drawn)
                }
            };
            self.mixed.reclassify(mixed_id, &self.image)?;
            drawn_ids.push(mixed_id);
        }
        info!(
            "{channel}: drew {} mixed nodules out of clump {id}",
            drawn_ids.len()
        );
        Ok(drawn_ids)
    }

    /// Check every dataset and build the final tables.
    ///
    /// # Errors
    ///
    /// Returns [`NoduleError::InvariantViolation`] if any dataset is
    /// inconsistent.
    pub fn finish(self) -> Result<NoduleResult, NoduleError> {
        self.red.check_invariants()?;
        self.green.check_invariants()?;
        self.mixed.check_invariants()?;
        let result = NoduleResult {
            dimensions: self.red.dimensions(),
            red: self.red.table(),
            green: self.green.table(),
            mixed: self.mixed.table(&self.red, &self.green),
        };
        let summary = result.summary();
        info!(
            "{} nodules: {} red, {} green, {} mixed",
            summary.total(),
            summary.red,
            summary.green,
            summary.mixed
        );
        Ok(result)
    }
}

/// Ask `reviewer` to draw one nodule inside the clump region `id`.
/// Cancelled and empty drawings both yield `None`.
fn next_drawing(
    dataset: &ChannelDataset,
    channel: Channel,
    id: RegionId,
    reviewer: &mut dyn ReviewerPort,
) -> Option<Region> {
    let region = dataset.region(id)?;
    reviewer
        .redraw_region(channel, region)
        .filter(|drawn| drawn.pixel_count() > 0)
}
