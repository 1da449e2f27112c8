//! Error types for the uptime measurer.

use thiserror::Error;

use crate::cluster::StoreError;

/// Errors produced by [`UptimeMeasurer`](super::UptimeMeasurer).
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Writing the canary record failed, so no measurer exists.
    #[error("failed to write canary {key:?} to {endpoints}: {source}")]
    CanaryWrite {
        /// Canary key.
        key: String,
        /// Endpoints the write went to.
        endpoints: String,
        /// Store error.
        #[source]
        source: StoreError,
    },

    /// Deleting the canary record failed.
    #[error("failed to delete canary {key:?} from {endpoints}: {source}")]
    CanaryDelete {
        /// Canary key.
        key: String,
        /// Endpoints the delete went to.
        endpoints: String,
        /// Store error.
        #[source]
        source: StoreError,
    },

    /// `start` was called on a measurer that already started.
    #[error("measurer for {key:?} was already started")]
    AlreadyStarted {
        /// Canary key.
        key: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canary_write_display() {
        let error = ProbeError::CanaryWrite {
            key: "test-key-1".to_string(),
            endpoints: "https://10.0.16.4:2379".to_string(),
            source: StoreError::transport("https://10.0.16.4:2379", "connection refused"),
        };
        let msg = error.to_string();
        assert!(msg.contains("test-key-1"), "Expected key in: {msg}");
        assert!(msg.contains("connection refused"), "Expected cause in: {msg}");
    }

    #[test]
    fn test_already_started_display() {
        let error = ProbeError::AlreadyStarted {
            key: "test-key-2".to_string(),
        };
        assert!(error.to_string().contains("already started"));
    }
}
