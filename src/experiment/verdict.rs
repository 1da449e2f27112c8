//! Pass/fail evaluation of measurer counts.

use std::fmt;

use crate::probe::Counts;

use super::phase::Bound;

/// Outcome of comparing one measurer's deviation against a bound.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    /// Samples taken.
    pub total: u64,
    /// Failed samples.
    pub failed: u64,
    /// `failed / total`.
    pub deviation: f64,
    /// Bound the deviation was compared against.
    pub bound: Bound,
}

impl Verdict {
    /// Returns true when the deviation satisfies the bound.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.bound.admits(self.deviation)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total: {}, failed: {}, deviation: {:.5} (expected {})",
            self.total, self.failed, self.deviation, self.bound
        )
    }
}

/// Evaluates `counts` against `bound`.
///
/// Returns `None` when no sample was taken: an empty window says nothing
/// about availability, whatever the bound.
#[must_use]
pub fn evaluate(counts: Counts, bound: Bound) -> Option<Verdict> {
    let deviation = counts.deviation()?;
    Some(Verdict {
        total: counts.total,
        failed: counts.failed,
        deviation,
        bound,
    })
}
