//! Resilience Probe Library
//!
//! This library measures how available a replicated key-value cluster stays
//! while it is recreated, partitioned and healed. A canary record is read
//! once per tick and every failed read counts against a deviation bound.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`cluster`] - store, director, fault injector and ssh adapters
//! - [`probe`] - canary records and the uptime measurer
//! - [`polling`] - eventually/consistently assertions
//! - [`experiment`] - phase model, scenarios and the orchestrator
//! - [`config`] - JSON configuration file

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cluster;
pub mod config;
pub mod experiment;
pub mod polling;
pub mod probe;

// Re-export commonly used types
pub use cluster::{GatewayStore, StoreClient, StoreError};
pub use config::{ConfigError, FileConfig};
pub use experiment::{
    Experiment, ExperimentError, ExperimentReport, Orchestrator, ScenarioKind, ScenarioSettings,
};
pub use polling::{PollError, consistently_holds, eventually_until};
pub use probe::{CanaryRecord, ProbeError, UptimeMeasurer};
