//! Uptime and read-consistency sampling.
//!
//! An [`UptimeMeasurer`] owns one [`CanaryRecord`] and a background task
//! that reads it on a fixed period. Every read is classified into a
//! [`SampleOutcome`] and folded into [`Counts`]; read errors never escape the
//! measurer, only the canary write at construction can fail it.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use resilience_probe::cluster::{GatewayStore, DEFAULT_GATEWAY_PREFIX};
//! use resilience_probe::probe::UptimeMeasurer;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let endpoints = vec!["https://10.0.16.4:2379".to_string()];
//! let store = Arc::new(GatewayStore::new(&endpoints, DEFAULT_GATEWAY_PREFIX, None)?);
//!
//! let measurer = UptimeMeasurer::create(store, Duration::from_secs(1)).await?;
//! measurer.start().await?;
//! tokio::time::sleep(Duration::from_secs(60)).await;
//! measurer.stop().await;
//!
//! let counts = measurer.counts();
//! println!("total {} failed {}", counts.total, counts.failed);
//! measurer.cleanup().await?;
//! # Ok(())
//! # }
//! ```

mod canary;
mod error;
mod measurer;
mod sample;

pub use canary::CanaryRecord;
pub use error::ProbeError;
pub use measurer::{DEFAULT_OPERATION_TIMEOUT, UptimeMeasurer};
pub use sample::{Counts, SampleOutcome, classify_sample};
