//! Declarative experiment model.
//!
//! An [`Experiment`] is an ordered list of [`Phase`]s plus a recovery step
//! list. Each phase runs its [`Step`]s in order, then checks its
//! [`ReadGate`]s, all under one phase timeout. The orchestrator interprets
//! this model; scenarios only differ in the lists they build.

use std::fmt;
use std::time::Duration;

/// Name of a measurer within one experiment run.
pub type MeasurerSlot = &'static str;

/// Lifecycle stage an experiment is in while a phase runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Measuring a healthy cluster.
    Baseline,
    /// A network fault is in place.
    FaultActive,
    /// Nodes are being restarted under the fault.
    Restarts,
    /// Faults are being lifted.
    Healing,
    /// Reads have recovered; final observation.
    Converged,
    /// All measurers stopped; counts frozen.
    Closed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Baseline => "baseline",
            Self::FaultActive => "fault-active",
            Self::Restarts => "restarts",
            Self::Healing => "healing",
            Self::Converged => "converged",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Which store client a measurer or gate talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreTarget {
    /// All endpoints.
    Cluster,
    /// Only the endpoint of node 0.
    Isolated,
    /// Every endpoint except node 0's.
    Survivors,
}

impl fmt::Display for StoreTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cluster => "cluster",
            Self::Isolated => "isolated",
            Self::Survivors => "survivors",
        };
        f.write_str(name)
    }
}

/// Expected result of a read of the root key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadExpectation {
    /// The read returns an error.
    Failing,
    /// The read succeeds.
    Succeeding,
}

impl ReadExpectation {
    /// Returns true when a read result of `read_ok` meets the expectation.
    #[must_use]
    pub fn is_met(self, read_ok: bool) -> bool {
        match self {
            Self::Failing => !read_ok,
            Self::Succeeding => read_ok,
        }
    }
}

/// How a gate polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateMode {
    /// Wait until the expectation is met once.
    Eventually {
        /// Convergence deadline.
        within: Duration,
    },
    /// Require the expectation to hold for a whole window.
    Consistently {
        /// Observation window.
        window: Duration,
    },
}

/// A polling assertion against the read path, checked after a phase's steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadGate {
    /// Client the reads go through.
    pub target: StoreTarget,
    /// What each read must show.
    pub expect: ReadExpectation,
    /// Polling mode.
    pub mode: GateMode,
}

impl ReadGate {
    /// Waits until reads through `target` meet `expect`.
    #[must_use]
    pub fn eventually(target: StoreTarget, expect: ReadExpectation, within: Duration) -> Self {
        Self {
            target,
            expect,
            mode: GateMode::Eventually { within },
        }
    }

    /// Requires reads through `target` to meet `expect` for `window`.
    #[must_use]
    pub fn consistently(target: StoreTarget, expect: ReadExpectation, window: Duration) -> Self {
        Self {
            target,
            expect,
            mode: GateMode::Consistently { window },
        }
    }
}

impl fmt::Display for ReadGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let expect = match self.expect {
            ReadExpectation::Failing => "failing",
            ReadExpectation::Succeeding => "succeeding",
        };
        match self.mode {
            GateMode::Eventually { within } => {
                write!(f, "{} reads eventually {expect} within {within:?}", self.target)
            }
            GateMode::Consistently { window } => {
                write!(f, "{} reads consistently {expect} for {window:?}", self.target)
            }
        }
    }
}

/// Comparison a verdict applies to the measured deviation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Bound {
    /// Deviation must not exceed the value.
    AtMost(f64),
    /// Deviation must reach at least the value.
    AtLeast(f64),
}

impl Bound {
    /// Returns true when `deviation` satisfies the bound.
    #[must_use]
    pub fn admits(self, deviation: f64) -> bool {
        match self {
            Self::AtMost(limit) => deviation <= limit,
            Self::AtLeast(limit) => deviation >= limit,
        }
    }
}

impl fmt::Display for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AtMost(limit) => write!(f, "<= {limit:.5}"),
            Self::AtLeast(limit) => write!(f, ">= {limit:.5}"),
        }
    }
}

/// What a phase expects from the measured deviation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expectation {
    /// Reads should succeed: deviation at most the read tolerance.
    Available,
    /// Reads should all fail: deviation at least 1.0.
    Unavailable,
}

impl Expectation {
    /// Resolves the expectation against the configured read tolerance.
    #[must_use]
    pub fn bound(self, tolerance: f64) -> Bound {
        match self {
            Self::Available => Bound::AtMost(tolerance),
            Self::Unavailable => Bound::AtLeast(1.0),
        }
    }
}

/// One action inside a phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Write a new canary through `target` and keep the measurer in `slot`.
    CreateMeasurer {
        /// Measurer name.
        slot: MeasurerSlot,
        /// Client the measurer uses.
        target: StoreTarget,
    },
    /// Start the measurer in `slot`.
    StartMeasurer {
        /// Measurer name.
        slot: MeasurerSlot,
    },
    /// Stop the measurer in `slot`, draining its sampling task.
    StopMeasurer {
        /// Measurer name.
        slot: MeasurerSlot,
    },
    /// Check the measurer in `slot` against an expectation.
    AssertDeviation {
        /// Measurer name.
        slot: MeasurerSlot,
        /// Expected availability.
        expect: Expectation,
    },
    /// Let the measurers run.
    Hold(Duration),
    /// Recreate every instance of the deployment.
    Recreate,
    /// Keep the client reachable on `node`, then firewall its zone.
    Isolate {
        /// Node index; its zone is the incident selector.
        node: usize,
    },
    /// Lift the fault on `node`'s zone and remove the client exception.
    Heal {
        /// Node index.
        node: usize,
    },
    /// Restart the store process on `node` and wait until it runs.
    RestartNode {
        /// Node index.
        node: usize,
    },
    /// Remove the first INPUT and OUTPUT iptables rules on `node`.
    CleanupFirewall {
        /// Node index.
        node: usize,
    },
    /// Wait until every VM of the deployment reports running.
    AwaitAllRunning {
        /// Deadline.
        within: Duration,
    },
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateMeasurer { slot, target } => {
                write!(f, "create {slot} measurer against {target}")
            }
            Self::StartMeasurer { slot } => write!(f, "start {slot} measurer"),
            Self::StopMeasurer { slot } => write!(f, "stop {slot} measurer"),
            Self::AssertDeviation { slot, expect } => {
                write!(f, "check {slot} measurer expecting {expect:?}")
            }
            Self::Hold(duration) => write!(f, "hold for {duration:?}"),
            Self::Recreate => f.write_str("recreate deployment"),
            Self::Isolate { node } => write!(f, "isolate node {node}"),
            Self::Heal { node } => write!(f, "heal node {node}"),
            Self::RestartNode { node } => write!(f, "restart node {node}"),
            Self::CleanupFirewall { node } => write!(f, "clean up iptables on node {node}"),
            Self::AwaitAllRunning { within } => {
                write!(f, "wait up to {within:?} for all VMs running")
            }
        }
    }
}

/// One bounded section of an experiment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phase {
    /// Phase name used in logs and errors.
    pub name: &'static str,
    /// Stage the experiment is in during this phase.
    pub stage: Stage,
    /// Upper bound on steps plus gates.
    pub timeout: Duration,
    /// Actions, in order.
    pub steps: Vec<Step>,
    /// Read-path assertions checked after the steps.
    pub gates: Vec<ReadGate>,
}

impl Phase {
    /// Creates an empty phase.
    #[must_use]
    pub fn new(name: &'static str, stage: Stage, timeout: Duration) -> Self {
        Self {
            name,
            stage,
            timeout,
            steps: Vec::new(),
            gates: Vec::new(),
        }
    }

    /// Appends a step.
    #[must_use]
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Appends a gate.
    #[must_use]
    pub fn gate(mut self, gate: ReadGate) -> Self {
        self.gates.push(gate);
        self
    }
}

/// A complete fault-injection scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Experiment {
    /// Short name (`recreate`, `zone-partition`, ...).
    pub name: &'static str,
    /// One-line description for logs.
    pub description: &'static str,
    /// Phases, run strictly in order.
    pub phases: Vec<Phase>,
    /// Best-effort steps run after the phases on every exit path.
    pub recovery: Vec<Step>,
}

impl Experiment {
    /// Returns every measurer slot the experiment creates.
    #[must_use]
    pub fn measurer_slots(&self) -> Vec<MeasurerSlot> {
        let mut slots = Vec::new();
        for step in self.phases.iter().flat_map(|phase| &phase.steps) {
            match step {
                Step::CreateMeasurer { slot, .. } if !slots.contains(slot) => slots.push(*slot),
                _ => {}
            }
        }
        slots
    }
}
