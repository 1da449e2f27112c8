//! Fault-injection experiments.
//!
//! Experiments are data: a [`ScenarioKind`] builds an [`Experiment`] (an
//! ordered list of [`Phase`]s and a recovery list) and one [`Orchestrator`]
//! interprets any of them. The orchestrator owns every measurer and incident
//! it creates and releases them on every exit path.
//!
//! # Architecture
//!
//! - `phase` - the declarative model: stages, steps, read gates, bounds
//! - `scenarios` - the four phase lists
//! - `orchestrator` - runs phases under timeouts, evaluates verdicts
//! - `node_ops` - iptables and restart commands over ssh
//! - `verdict` - deviation vs. bound

mod error;
mod node_ops;
mod orchestrator;
mod phase;
mod scenarios;
mod verdict;

pub use error::{ExperimentError, NodeError};
pub use node_ops::{DEFAULT_RESTART_WITHIN, NodeOps, NodeTarget, summary_shows_running};
pub use orchestrator::{
    ExperimentReport, Orchestrator, PhaseVerdict, RunSettings, StoreSet,
};
pub use phase::{
    Bound, Expectation, Experiment, GateMode, MeasurerSlot, Phase, ReadExpectation, ReadGate,
    Stage, Step, StoreTarget,
};
pub use scenarios::{ScenarioKind, ScenarioSettings};
pub use verdict::{Verdict, evaluate};
