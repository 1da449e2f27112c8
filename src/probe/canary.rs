//! Canary record identity.

use std::fmt;

use rand::Rng;

const KEY_PREFIX: &str = "test-key-";
const VALUE_PREFIX: &str = "test-value-";

/// The key/value pair a measurer writes once and then reads back.
///
/// Key and value share one random id, so a value mismatch always means the
/// store returned something other than what this measurer wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanaryRecord {
    key: String,
    value: String,
}

impl CanaryRecord {
    /// Creates a record with a fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self::with_id(&random_id())
    }

    /// Creates a record for a known id.
    #[must_use]
    pub fn with_id(id: &str) -> Self {
        Self {
            key: format!("{KEY_PREFIX}{id}"),
            value: format!("{VALUE_PREFIX}{id}"),
        }
    }

    /// Canary key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Canary value.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for CanaryRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// Random id rendered in the 8-4-4-4-12 hex layout.
fn random_id() -> String {
    let raw: u128 = rand::thread_rng().r#gen();
    let hex = format!("{raw:032x}");
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}
