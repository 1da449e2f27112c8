//! Classification of one canary read and the running tally of samples.
//!
//! Every tick produces exactly one [`SampleOutcome`]:
//!
//! | Read result                   | Outcome                          |
//! |-------------------------------|----------------------------------|
//! | error (transport, timeout)    | [`SampleOutcome::TransportError`] |
//! | zero or several entries       | [`SampleOutcome::WrongCardinality`] |
//! | one entry, other key or value | [`SampleOutcome::ValueMismatch`] |
//! | one entry, the canary itself  | [`SampleOutcome::Success`]       |

use std::fmt;

use crate::cluster::{KeyValue, StoreError};

use super::CanaryRecord;

/// Result of one read of the canary key.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleOutcome {
    /// Exactly one entry carrying the canary key and value.
    Success,

    /// The read itself failed.
    TransportError {
        /// Rendered store error.
        message: String,
    },

    /// The read returned a number of entries other than one.
    WrongCardinality {
        /// Number of entries returned.
        actual: usize,
    },

    /// The single entry differed from the canary in key or value.
    ValueMismatch {
        /// The canary record.
        expected: KeyValue,
        /// Entry the store returned.
        actual: KeyValue,
    },
}

impl SampleOutcome {
    /// Returns true for [`SampleOutcome::Success`].
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for SampleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::TransportError { message } => write!(f, "read failed: {message}"),
            Self::WrongCardinality { actual } => {
                write!(f, "expected exactly one entry, got {actual}")
            }
            Self::ValueMismatch { expected, actual } => write!(
                f,
                "expected {:?}={:?}, got {:?}={:?}",
                expected.key, expected.value, actual.key, actual.value
            ),
        }
    }
}

/// Classifies the result of reading `canary`'s key.
#[must_use]
pub fn classify_sample(
    canary: &CanaryRecord,
    result: &Result<Vec<KeyValue>, StoreError>,
) -> SampleOutcome {
    match result {
        Err(error) => SampleOutcome::TransportError {
            message: error.to_string(),
        },
        Ok(entries) => match entries.as_slice() {
            [entry] if entry.key == canary.key() && entry.value == canary.value() => {
                SampleOutcome::Success
            }
            [entry] => SampleOutcome::ValueMismatch {
                expected: KeyValue::new(canary.key(), canary.value()),
                actual: entry.clone(),
            },
            other => SampleOutcome::WrongCardinality {
                actual: other.len(),
            },
        },
    }
}

/// Sample tally. `failed <= total` always holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    /// Samples taken.
    pub total: u64,
    /// Samples that were not a success.
    pub failed: u64,
}

impl Counts {
    /// Records one outcome.
    pub fn record(&mut self, outcome: &SampleOutcome) {
        self.total += 1;
        if !outcome.is_success() {
            self.failed += 1;
        }
    }

    /// Returns `failed / total`, or `None` before the first sample.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn deviation(&self) -> Option<f64> {
        (self.total > 0).then(|| self.failed as f64 / self.total as f64)
    }
}
