//! Incremental analysis: advance stage-by-stage, inspecting each
//! intermediate result before continuing.
//!
//! ```rust
//! # use nodule_core::{AcceptAll, NoduleConfig, NoduleError, Pipeline};
//! # fn run(image: image::RgbImage, mask: image::GrayImage) -> Result<(), NoduleError> {
//! let mut reviewer = AcceptAll;
//! let result = Pipeline::new(image, mask, NoduleConfig::default())?
//!     .refine()?
//!     .partition()?
//!     .detect()
//!     .absorb_holes()?
//!     .redetect()?
//!     .split_clumps(&mut reviewer)?
//!     .merge_mixed(&mut reviewer)?
//!     .into_result()?;
//! # Ok(())
//! # }
//! ```
//!
//! Each stage method consumes `self` and returns the next state, so
//! stages cannot be skipped or reordered. In particular the only way out
//! of [`HolesAbsorbed`] is [`redetect`](HolesAbsorbed::redetect): regions
//! are never measured between filling holes and tracing them again.

use image::{GrayImage, RgbImage};
use log::info;

use crate::classify::{ChannelMasks, ensure_same_size, partition_foreground};
use crate::config::NoduleConfig;
use crate::dataset::{ChannelDataset, HoleReport, SplitOutcome};
use crate::edits::EditSession;
use crate::mixed::{AbsorbReport, MixedDataset};
use crate::refine::{Widening, improve_segmentation};
use crate::result::NoduleResult;
use crate::review::ReviewerPort;
use crate::types::{Channel, NoduleError};

#[derive(Debug, Clone)]
struct Datasets {
    red: ChannelDataset,
    green: ChannelDataset,
    mixed: ChannelDataset,
}

impl Datasets {
    fn from_masks(masks: &ChannelMasks) -> Self {
        let [red, green, mixed] =
            Channel::ALL.map(|channel| ChannelDataset::from_mask(channel, masks.get(channel)));
        Self { red, green, mixed }
    }

    const fn get(&self, channel: Channel) -> &ChannelDataset {
        match channel {
            Channel::Red => &self.red,
            Channel::Green => &self.green,
            Channel::Mixed => &self.mixed,
        }
    }

    fn each_mut(&mut self) -> [&mut ChannelDataset; 3] {
        [&mut self.red, &mut self.green, &mut self.mixed]
    }
}

// ───────────────────────── Stage 0: Pending ──────────────────────────

/// Inputs validated, nothing computed yet.
#[must_use = "pipeline stages are consumed by advancing — call .refine() to continue"]
pub struct Pending {
    config: NoduleConfig,
    image: RgbImage,
    mask: GrayImage,
}

impl Pending {
    /// The configuration in use.
    #[must_use]
    pub const fn config(&self) -> &NoduleConfig {
        &self.config
    }

    /// Widen the mask around each component, if enabled.
    ///
    /// # Errors
    ///
    /// Returns [`NoduleError::DimensionMismatch`] if image and mask
    /// differ in size.
    pub fn refine(self) -> Result<Refined, NoduleError> {
        let widening = if self.config.improve_segmentation {
            Some(improve_segmentation(&self.image, &self.mask)?)
        } else {
            None
        };
        let mask = widening.as_ref().map_or(self.mask, |w| w.mask.clone());
        Ok(Refined {
            config: self.config,
            image: self.image,
            mask,
            widening,
        })
    }
}

// ───────────────────────── Stage 1: Refined ──────────────────────────

/// Foreground mask after adaptive widening.
#[must_use = "pipeline stages are consumed by advancing — call .partition() to continue"]
pub struct Refined {
    config: NoduleConfig,
    image: RgbImage,
    mask: GrayImage,
    widening: Option<Widening>,
}

impl Refined {
    /// The mask the rest of the pipeline works from.
    #[must_use]
    pub const fn mask(&self) -> &GrayImage {
        &self.mask
    }

    /// Widening details, or `None` when disabled.
    #[must_use]
    pub const fn widening(&self) -> Option<&Widening> {
        self.widening.as_ref()
    }

    /// Split the foreground into red, green, and mixed masks.
    ///
    /// # Errors
    ///
    /// Returns [`NoduleError::DimensionMismatch`] if the mask no longer
    /// matches the image.
    pub fn partition(self) -> Result<Partitioned, NoduleError> {
        let masks = partition_foreground(&self.image, &self.mask)?;
        Ok(Partitioned {
            config: self.config,
            image: self.image,
            masks,
        })
    }
}

// ──────────────────────── Stage 2: Partitioned ───────────────────────

/// One foreground mask per colour class.
#[must_use = "pipeline stages are consumed by advancing — call .detect() to continue"]
pub struct Partitioned {
    config: NoduleConfig,
    image: RgbImage,
    masks: ChannelMasks,
}

impl Partitioned {
    /// Mask of one channel.
    #[must_use]
    pub const fn mask(&self, channel: Channel) -> &GrayImage {
        self.masks.get(channel)
    }

    /// Trace the regions of every channel.
    pub fn detect(self) -> Detected {
        Detected {
            config: self.config,
            image: self.image,
            datasets: Datasets::from_masks(&self.masks),
        }
    }
}

// ───────────────────────── Stage 3: Detected ─────────────────────────

/// Freshly traced regions, holes included.
#[must_use = "pipeline stages are consumed by advancing — call .absorb_holes() to continue"]
pub struct Detected {
    config: NoduleConfig,
    image: RgbImage,
    datasets: Datasets,
}

impl Detected {
    /// Dataset of one channel.
    #[must_use]
    pub const fn dataset(&self, channel: Channel) -> &ChannelDataset {
        self.datasets.get(channel)
    }

    /// Fill enclosed background pockets. Leaves every dataset stale.
    ///
    /// # Errors
    ///
    /// Propagates [`NoduleError::StaleRegions`], which cannot occur on
    /// freshly detected datasets.
    pub fn absorb_holes(mut self) -> Result<HolesAbsorbed, NoduleError> {
        let threshold = self.config.hole_fill_percent;
        let mut reports = [HoleReport::default(); 3];
        for (report, dataset) in reports.iter_mut().zip(self.datasets.each_mut()) {
            *report = dataset.absorb_holes(threshold)?;
        }
        Ok(HolesAbsorbed {
            config: self.config,
            image: self.image,
            datasets: self.datasets,
            reports,
        })
    }
}

// ─────────────────────── Stage 4: HolesAbsorbed ──────────────────────

/// Pixel caches include filled holes; regions are out of date.
#[must_use = "pipeline stages are consumed by advancing — call .redetect() to continue"]
pub struct HolesAbsorbed {
    config: NoduleConfig,
    image: RgbImage,
    datasets: Datasets,
    reports: [HoleReport; 3],
}

impl HolesAbsorbed {
    /// Hole report of one channel.
    #[must_use]
    pub const fn report(&self, channel: Channel) -> &HoleReport {
        &self.reports[channel as usize]
    }

    /// Trace regions again and drop those below the noise threshold.
    ///
    /// # Errors
    ///
    /// Propagates [`NoduleError`] from the noise filter.
    pub fn redetect(mut self) -> Result<Filtered, NoduleError> {
        let threshold = self.config.low_area_threshold;
        let mut removed = [0; 3];
        for (count, dataset) in removed.iter_mut().zip(self.datasets.each_mut()) {
            dataset.detect_regions();
            *count = dataset.filter_noise(threshold)?;
        }
        Ok(Filtered {
            config: self.config,
            image: self.image,
            datasets: self.datasets,
            removed,
        })
    }
}

// ───────────────────────── Stage 5: Filtered ─────────────────────────

/// Final region shapes, one nodule each.
#[must_use = "pipeline stages are consumed by advancing — call .split_clumps() to continue"]
pub struct Filtered {
    config: NoduleConfig,
    image: RgbImage,
    datasets: Datasets,
    removed: [usize; 3],
}

impl Filtered {
    /// Dataset of one channel.
    #[must_use]
    pub const fn dataset(&self, channel: Channel) -> &ChannelDataset {
        self.datasets.get(channel)
    }

    /// Regions dropped as noise in one channel.
    #[must_use]
    pub const fn removed(&self, channel: Channel) -> usize {
        self.removed[channel as usize]
    }

    /// Estimate clumps in red and green, let `reviewer` recount them,
    /// and measure every region's circularity.
    ///
    /// # Errors
    ///
    /// Propagates [`NoduleError`] from splitting or review.
    pub fn split_clumps(mut self, reviewer: &mut dyn ReviewerPort) -> Result<Split, NoduleError> {
        let red = split_channel(&mut self.datasets.red, &self.config, reviewer)?;
        let green = split_channel(&mut self.datasets.green, &self.config, reviewer)?;
        for dataset in self.datasets.each_mut() {
            dataset.measure_shapes();
        }
        Ok(Split {
            config: self.config,
            image: self.image,
            datasets: self.datasets,
            outcomes: (red, green),
        })
    }
}

fn split_channel(
    dataset: &mut ChannelDataset,
    config: &NoduleConfig,
    reviewer: &mut dyn ReviewerPort,
) -> Result<SplitOutcome, NoduleError> {
    let outcome = dataset.split_clumps(config)?;
    dataset.rewrite_measurements();
    let changed = dataset.review_clumps(reviewer, config.correction_retries)?;
    info!("{}: reviewer changed {changed} clumps", dataset.channel());
    Ok(outcome)
}

// ────────────────────────── Stage 6: Split ───────────────────────────

/// Clumps estimated and reviewed.
#[must_use = "pipeline stages are consumed by advancing — call .merge_mixed() to continue"]
pub struct Split {
    config: NoduleConfig,
    image: RgbImage,
    datasets: Datasets,
    outcomes: (SplitOutcome, SplitOutcome),
}

impl Split {
    /// Dataset of one channel.
    #[must_use]
    pub const fn dataset(&self, channel: Channel) -> &ChannelDataset {
        self.datasets.get(channel)
    }

    /// Splitting outcome of red or green; `None` for mixed.
    #[must_use]
    pub const fn outcome(&self, channel: Channel) -> Option<&SplitOutcome> {
        match channel {
            Channel::Red => Some(&self.outcomes.0),
            Channel::Green => Some(&self.outcomes.1),
            Channel::Mixed => None,
        }
    }

    /// Merge mixed regions with each other, let `reviewer` confirm them,
    /// absorb neighbouring red and green regions, and split their areas.
    ///
    /// # Errors
    ///
    /// Propagates [`NoduleError`] from the mixed passes.
    pub fn merge_mixed(self, reviewer: &mut dyn ReviewerPort) -> Result<Merged, NoduleError> {
        let Datasets {
            mut red,
            mut green,
            mixed,
        } = self.datasets;
        let mut mixed = MixedDataset::new(mixed)?;
        let merges = mixed.self_merge(self.config.self_merge_distance);
        let rejected = mixed.confirm(reviewer);
        let absorbed = mixed.absorb(&mut red, &mut green, self.config.absorb_distance)?;
        mixed.recompute_areas(&self.image, &mut red, &mut green)?;
        info!(
            "mixed: {merges} merges, {rejected} rejected, {} regions kept",
            mixed.base().len()
        );
        Ok(Merged {
            config: self.config,
            image: self.image,
            red,
            green,
            mixed,
            merges,
            rejected,
            absorbed,
        })
    }
}

// ────────────────────────── Stage 7: Merged ──────────────────────────

/// All automatic passes done.
#[must_use = "pipeline stages are consumed by advancing — call .into_result() to finish"]
pub struct Merged {
    config: NoduleConfig,
    image: RgbImage,
    red: ChannelDataset,
    green: ChannelDataset,
    mixed: MixedDataset,
    merges: usize,
    rejected: usize,
    absorbed: AbsorbReport,
}

impl Merged {
    /// Dataset of one channel.
    #[must_use]
    pub const fn dataset(&self, channel: Channel) -> &ChannelDataset {
        match channel {
            Channel::Red => &self.red,
            Channel::Green => &self.green,
            Channel::Mixed => self.mixed.base(),
        }
    }

    /// The mixed dataset with its splits and linkage.
    #[must_use]
    pub const fn mixed(&self) -> &MixedDataset {
        &self.mixed
    }

    /// Mixed self-merges performed.
    #[must_use]
    pub const fn merges(&self) -> usize {
        self.merges
    }

    /// Mixed regions the reviewer rejected.
    #[must_use]
    pub const fn rejected(&self) -> usize {
        self.rejected
    }

    /// What absorption pulled in.
    #[must_use]
    pub const fn absorbed(&self) -> &AbsorbReport {
        &self.absorbed
    }

    /// Open the datasets for manual edits.
    pub fn into_session(self) -> EditSession {
        EditSession::new(
            self.red,
            self.green,
            self.mixed,
            self.image,
            self.config.correction_retries,
        )
    }

    /// Check consistency and build the final tables.
    ///
    /// # Errors
    ///
    /// Returns [`NoduleError::InvariantViolation`] if a dataset is
    /// inconsistent.
    pub fn into_result(self) -> Result<NoduleResult, NoduleError> {
        self.into_session().finish()
    }
}

// ───────────────────── Pipeline entry point ──────────────────────────

/// Incremental nodule analysis.
///
/// Created via [`Pipeline::new`], which validates the inputs without
/// processing them. See the [module docs](self) for the full chain.
pub struct Pipeline;

impl Pipeline {
    /// Validate inputs and return the first stage.
    ///
    /// # Errors
    ///
    /// Returns [`NoduleError::InvalidConfig`] if `config` fails
    /// validation, [`NoduleError::EmptyInput`] for a zero-sized image,
    /// or [`NoduleError::DimensionMismatch`] if image and mask differ in
    /// size.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(
        image: RgbImage,
        mask: GrayImage,
        config: NoduleConfig,
    ) -> Result<Pending, NoduleError> {
        config.validate()?;
        if image.width() == 0 || image.height() == 0 {
            return Err(NoduleError::EmptyInput);
        }
        ensure_same_size(&image, &mask)?;
        Ok(Pending {
            config,
            image,
            mask,
        })
    }
}
