//! Human-in-the-loop decisions.
//!
//! The engine never decides on its own whether a mixed region is real,
//! how many nodules a clump holds, or what a region should look like
//! after a manual redraw. Those calls go through [`ReviewerPort`], a
//! synchronous interface implemented by an interactive front end or, for
//! batch runs and tests, by [`AcceptAll`] or [`ScriptedReviewer`].

use std::collections::VecDeque;

use crate::clump::{Clump, NO_CHANGE};
use crate::region::Region;
use crate::types::Channel;

/// Accept or reject a proposed region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Keep the region.
    Accept,
    /// Delete the region.
    Reject,
}

/// Source of review decisions.
///
/// Every call blocks until an answer is available. Cancelling a dialog
/// maps to [`Verdict::Reject`], [`NO_CHANGE`], or `None` respectively.
pub trait ReviewerPort {
    /// Decide whether a candidate region is a real nodule.
    fn confirm_region(&mut self, channel: Channel, region: &Region) -> Verdict;

    /// Propose a nodule count for a clump: `0` to empty it, [`NO_CHANGE`]
    /// to keep it, or a positive count.
    fn correct_count(&mut self, channel: Channel, clump: &Clump, region: &Region) -> i64;

    /// Provide a replacement outline for a region, or `None` to cancel.
    fn redraw_region(&mut self, channel: Channel, region: &Region) -> Option<Region>;
}

/// Accepts every region and changes nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl ReviewerPort for AcceptAll {
    fn confirm_region(&mut self, _channel: Channel, _region: &Region) -> Verdict {
        Verdict::Accept
    }

    fn correct_count(&mut self, _channel: Channel, _clump: &Clump, _region: &Region) -> i64 {
        NO_CHANGE
    }

    fn redraw_region(&mut self, _channel: Channel, _region: &Region) -> Option<Region> {
        None
    }
}

/// Replays queued answers in order; falls back to [`AcceptAll`]'s
/// answers once a queue runs dry.
#[derive(Debug, Clone, Default)]
pub struct ScriptedReviewer {
    verdicts: VecDeque<Verdict>,
    counts: VecDeque<i64>,
    redraws: VecDeque<Option<Region>>,
    asked: Vec<(Channel, String)>,
}

impl ScriptedReviewer {
    /// Create a reviewer with empty queues.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue verdicts for [`ReviewerPort::confirm_region`].
    #[must_use]
    pub fn with_verdicts(mut self, verdicts: impl IntoIterator<Item = Verdict>) -> Self {
        self.verdicts.extend(verdicts);
        self
    }

    /// Queue answers for [`ReviewerPort::correct_count`].
    #[must_use]
    pub fn with_counts(mut self, counts: impl IntoIterator<Item = i64>) -> Self {
        self.counts.extend(counts);
        self
    }

    /// Queue answers for [`ReviewerPort::redraw_region`].
    #[must_use]
    pub fn with_redraws(mut self, redraws: impl IntoIterator<Item = Option<Region>>) -> Self {
        self.redraws.extend(redraws);
        self
    }

    /// `(channel, region name)` of every question asked so far.
    #[must_use]
    pub fn asked(&self) -> &[(Channel, String)] {
        &self.asked
    }
}

impl ReviewerPort for ScriptedReviewer {
    fn confirm_region(&mut self, channel: Channel, region: &Region) -> Verdict {
        self.asked.push((channel, region.name().to_owned()));
        self.verdicts.pop_front().unwrap_or(Verdict::Accept)
    }

    fn correct_count(&mut self, channel: Channel, _clump: &Clump, region: &Region) -> i64 {
        self.asked.push((channel, region.name().to_owned()));
        self.counts.pop_front().unwrap_or(NO_CHANGE)
    }

    fn redraw_region(&mut self, channel: Channel, region: &Region) -> Option<Region> {
        self.asked.push((channel, region.name().to_owned()));
        self.redraws.pop_front().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Pixel;

    #[test]
    fn scripted_reviewer_replays_then_accepts() {
        let region = Region::from_pixels("m 0", [Pixel::new(0, 0)]);
        let mut reviewer = ScriptedReviewer::new().with_verdicts([Verdict::Reject]);
        assert_eq!(
            reviewer.confirm_region(Channel::Mixed, &region),
            Verdict::Reject
        );
        assert_eq!(
            reviewer.confirm_region(Channel::Mixed, &region),
            Verdict::Accept
        );
        assert_eq!(reviewer.asked().len(), 2);
    }

    #[test]
    fn accept_all_never_redraws() {
        let region = Region::from_pixels("r 0", [Pixel::new(1, 1)]);
        assert!(AcceptAll.redraw_region(Channel::Red, &region).is_none());
    }
}
