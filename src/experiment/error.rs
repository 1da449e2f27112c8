//! Error types for experiment runs.

use std::time::Duration;

use thiserror::Error;

use crate::cluster::{ControlPlaneError, FaultError, RemoteError};
use crate::polling::PollError;
use crate::probe::ProbeError;

use super::phase::{Bound, MeasurerSlot};

/// Errors from node-level operations (ssh access, iptables, restarts).
#[derive(Debug, Error)]
pub enum NodeError {
    /// The director call failed.
    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),

    /// The remote command failed.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Ssh setup returned no host for the instance.
    #[error("no ssh host returned for {instance}")]
    NoSshHost {
        /// Instance selector.
        instance: String,
    },

    /// A node never reached the expected state.
    #[error("{what} not reached: {source}")]
    NotConverged {
        /// Description of the awaited state.
        what: String,
        /// Poll failure.
        #[source]
        source: PollError,
    },

    /// The address to keep reachable through firewall blocks is unknown.
    #[error("could not determine client IP: {message}")]
    ClientIp {
        /// What went wrong.
        message: String,
    },
}

/// Errors that end an experiment run.
///
/// Every variant names the phase it happened in.
#[derive(Debug, Error)]
pub enum ExperimentError {
    /// A measurer could not be created or started.
    #[error("phase {phase}: {source}")]
    Probe {
        /// Phase name.
        phase: &'static str,
        /// Probe error.
        #[source]
        source: ProbeError,
    },

    /// A read gate did not converge or stopped holding.
    #[error("phase {phase}: gate \"{gate}\" failed: {source}")]
    Convergence {
        /// Phase name.
        phase: &'static str,
        /// Rendered gate.
        gate: String,
        /// Poll error.
        #[source]
        source: PollError,
    },

    /// The fault injector failed.
    #[error("phase {phase}: fault injection failed: {source}")]
    Fault {
        /// Phase name.
        phase: &'static str,
        /// Fault injector error.
        #[source]
        source: FaultError,
    },

    /// An incident reported task-level errors.
    #[error("phase {phase}: incident {incident} on zone {zone} reported task errors")]
    TaskErrors {
        /// Phase name.
        phase: &'static str,
        /// Incident id.
        incident: String,
        /// Zone the incident targeted.
        zone: String,
    },

    /// The director failed.
    #[error("phase {phase}: control plane failed: {source}")]
    ControlPlane {
        /// Phase name.
        phase: &'static str,
        /// Director error.
        #[source]
        source: ControlPlaneError,
    },

    /// A node operation failed.
    #[error("phase {phase}: node {node}: {source}")]
    Node {
        /// Phase name.
        phase: &'static str,
        /// Node index, when the operation targeted one node.
        node: String,
        /// Node error.
        #[source]
        source: NodeError,
    },

    /// The measured deviation fell outside the bound.
    #[error(
        "phase {phase}: {slot} measurer deviation {deviation:.5} not {bound} (total: {total}, failed: {failed})"
    )]
    ToleranceExceeded {
        /// Phase name.
        phase: &'static str,
        /// Measurer name.
        slot: MeasurerSlot,
        /// Samples taken.
        total: u64,
        /// Failed samples.
        failed: u64,
        /// `failed / total`.
        deviation: f64,
        /// Expected bound.
        bound: Bound,
    },

    /// The measurer took no sample, so no verdict is possible.
    #[error("phase {phase}: {slot} measurer took no samples")]
    NoSamples {
        /// Phase name.
        phase: &'static str,
        /// Measurer name.
        slot: MeasurerSlot,
    },

    /// The phase did not finish within its timeout.
    #[error("phase {phase} did not finish within {timeout:?}")]
    PhaseTimeout {
        /// Phase name.
        phase: &'static str,
        /// Phase timeout.
        timeout: Duration,
    },

    /// A step referred to a measurer that was never created.
    #[error("phase {phase}: no measurer named {slot}")]
    UnknownMeasurer {
        /// Phase name.
        phase: &'static str,
        /// Measurer name.
        slot: MeasurerSlot,
    },

    /// A heal step found no incident for the node.
    #[error("phase {phase}: no active incident for node {node}")]
    UnknownIncident {
        /// Phase name.
        phase: &'static str,
        /// Node index.
        node: usize,
    },

    /// A step referred to a node with no configured zone.
    #[error("phase {phase}: node {node} has no zone")]
    UnknownNode {
        /// Phase name.
        phase: &'static str,
        /// Node index.
        node: usize,
    },
}

impl ExperimentError {
    /// Name of the phase the error happened in.
    #[must_use]
    pub fn phase(&self) -> &'static str {
        match self {
            Self::Probe { phase, .. }
            | Self::Convergence { phase, .. }
            | Self::Fault { phase, .. }
            | Self::TaskErrors { phase, .. }
            | Self::ControlPlane { phase, .. }
            | Self::Node { phase, .. }
            | Self::ToleranceExceeded { phase, .. }
            | Self::NoSamples { phase, .. }
            | Self::PhaseTimeout { phase, .. }
            | Self::UnknownMeasurer { phase, .. }
            | Self::UnknownIncident { phase, .. }
            | Self::UnknownNode { phase, .. } => *phase,
        }
    }

    /// Creates a node error for `node`.
    pub fn node(phase: &'static str, node: impl ToString, source: impl Into<NodeError>) -> Self {
        Self::Node {
            phase,
            node: node.to_string(),
            source: source.into(),
        }
    }
}
