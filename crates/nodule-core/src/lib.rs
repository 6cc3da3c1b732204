//! nodule-core: root nodule counting engine (sans-IO).
//!
//! Takes a colour microscope image plus a foreground mask and counts the
//! nodules in it by surface colour:
//! widening -> colour partition -> region detection -> hole filling ->
//! noise filter -> clump splitting -> mixed merging -> result tables.
//!
//! This crate has **no I/O dependencies** -- it operates on in-memory
//! images and returns structured data. Human review is injected through
//! [`ReviewerPort`]; file handling and output formats live in
//! `nodule-export` and `nodule-bench`.

pub mod arena;
pub mod classify;
pub mod clump;
pub mod config;
pub mod dataset;
pub mod decode;
pub mod edits;
pub mod geometry;
pub mod mixed;
pub mod pipeline;
pub mod refine;
pub mod region;
pub mod result;
pub mod review;
pub mod types;

pub use arena::RegionId;
pub use clump::{Clump, CorrectionOutcome, NO_CHANGE};
pub use config::NoduleConfig;
pub use dataset::{ChannelDataset, Measurement};
pub use edits::EditSession;
pub use mixed::MixedDataset;
pub use pipeline::Pipeline;
pub use region::Region;
pub use result::{ChannelTable, NoduleResult, NoduleSummary, RegionRow};
pub use review::{AcceptAll, ReviewerPort, ScriptedReviewer, Verdict};
pub use types::{Channel, Dimensions, GrayImage, NoduleError, Pixel, RgbImage};

/// Run the full analysis.
///
/// Takes a colour image, a foreground mask of the same size (non-zero =
/// foreground), and a configuration, and produces a [`NoduleResult`]
/// with one table per colour class.
///
/// # Pipeline steps
///
/// 1. Adaptive widening of the mask (optional)
/// 2. Partition of foreground pixels into red, green, and mixed
/// 3. Region detection per colour
/// 4. Hole filling, then detection again
/// 5. Noise filter
/// 6. Clump estimation and review (red and green)
/// 7. Mixed self-merge, confirmation, absorption, and area split
///
/// # Errors
///
/// Returns [`NoduleError::InvalidConfig`] if `config` is invalid,
/// [`NoduleError::EmptyInput`] for a zero-sized image, and
/// [`NoduleError::DimensionMismatch`] if image and mask differ in size.
pub fn analyze(
    image: RgbImage,
    mask: GrayImage,
    config: &NoduleConfig,
    reviewer: &mut dyn ReviewerPort,
) -> Result<NoduleResult, NoduleError> {
    Pipeline::new(image, mask, config.clone())?
        .refine()?
        .partition()?
        .detect()
        .absorb_holes()?
        .redetect()?
        .split_clumps(reviewer)?
        .merge_mixed(reviewer)?
        .into_result()
}
