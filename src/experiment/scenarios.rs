//! The four fault-injection scenarios, expressed as phase lists.
//!
//! | scenario             | fault                           | checks                                  |
//! |----------------------|---------------------------------|-----------------------------------------|
//! | `recreate`           | recreate every VM               | deviation within tolerance              |
//! | `zone-partition`     | firewall z1, restart all nodes  | deviation within tolerance              |
//! | `targeted-partition` | firewall z1, restart all nodes  | node 0 unreachable throughout, survivors within tolerance |
//! | `full-partition`     | firewall z1 and z2, heal stepwise | total outage, then recovery per window |

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::phase::{
    Expectation, Experiment, Phase, ReadExpectation, ReadGate, Stage, Step, StoreTarget,
};

/// Extra time allowed on top of the longest wait inside a phase.
const PHASE_SLACK: Duration = Duration::from_secs(5 * 60);

/// Nodes restarted one after another under a partition, with their phase names.
const RESTART_ORDER: [(usize, &str); 3] = [
    (0, "restart-node-0"),
    (1, "restart-node-1"),
    (2, "restart-node-2"),
];

const UPTIME: &str = "uptime";
const BASELINE: &str = "baseline";
const TOTAL_PARTITION: &str = "total-partition";
const PARTIAL_PARTITION: &str = "partial-partition";

/// Timing knobs shared by the scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScenarioSettings {
    /// Length of each full-partition observation window.
    pub hold: Duration,
    /// Window for `eventually` and `consistently` read gates.
    pub convergence: Duration,
    /// Time allowed for a recreate of the whole deployment.
    pub recreate_within: Duration,
    /// Time allowed for one node restart, including ssh setup.
    pub restart_within: Duration,
    /// Time allowed for every VM to report running during recovery.
    pub recovery_within: Duration,
}

impl ScenarioSettings {
    /// Settings derived from the per-operation store timeout.
    ///
    /// Convergence windows are three operation timeouts long.
    #[must_use]
    pub fn from_operation_timeout(operation_timeout: Duration, hold: Duration) -> Self {
        Self {
            hold,
            convergence: operation_timeout * 3,
            recreate_within: Duration::from_secs(60 * 60),
            restart_within: Duration::from_secs(60),
            recovery_within: Duration::from_secs(3 * 60),
        }
    }
}

impl Default for ScenarioSettings {
    fn default() -> Self {
        Self::from_operation_timeout(Duration::from_secs(10), Duration::from_secs(60))
    }
}

/// Selectable scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioKind {
    /// Recreate every VM under a running measurer.
    Recreate,
    /// Isolate z1 and restart every node.
    ZonePartition,
    /// Like `ZonePartition`, with targeted clients and read gates.
    TargetedPartition,
    /// Isolate two zones, then heal one at a time.
    FullPartition,
}

impl ScenarioKind {
    /// Every scenario in default run order.
    pub const ALL: [Self; 4] = [
        Self::Recreate,
        Self::ZonePartition,
        Self::TargetedPartition,
        Self::FullPartition,
    ];

    /// Short name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Recreate => "recreate",
            Self::ZonePartition => "zone-partition",
            Self::TargetedPartition => "targeted-partition",
            Self::FullPartition => "full-partition",
        }
    }

    /// Builds the scenario's experiment.
    #[must_use]
    pub fn build(self, settings: &ScenarioSettings) -> Experiment {
        match self {
            Self::Recreate => recreate(settings),
            Self::ZonePartition => zone_partition(settings),
            Self::TargetedPartition => targeted_partition(settings),
            Self::FullPartition => full_partition(settings),
        }
    }
}

impl fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ScenarioKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| format!("unknown scenario {s:?}"))
    }
}

fn measure(slot: &'static str, target: StoreTarget) -> [Step; 2] {
    [
        Step::CreateMeasurer { slot, target },
        Step::StartMeasurer { slot },
    ]
}

fn close_and_check(slot: &'static str, expect: Expectation) -> [Step; 2] {
    [
        Step::StopMeasurer { slot },
        Step::AssertDeviation { slot, expect },
    ]
}

fn with_steps(mut phase: Phase, steps: impl IntoIterator<Item = Step>) -> Phase {
    phase.steps.extend(steps);
    phase
}

fn restart_phases(settings: &ScenarioSettings, gate: Option<ReadGate>) -> Vec<Phase> {
    let gate_time = gate.map_or(Duration::ZERO, |_| settings.convergence);
    RESTART_ORDER
        .iter()
        .map(|&(node, name)| {
            let phase = Phase::new(
                name,
                Stage::Restarts,
                settings.restart_within + gate_time + PHASE_SLACK,
            )
            .step(Step::RestartNode { node });
            match gate {
                Some(gate) => phase.gate(gate),
                None => phase,
            }
        })
        .collect()
}

/// Cleans up every node's firewall exception and waits for all VMs running.
fn standard_recovery(settings: &ScenarioSettings) -> Vec<Step> {
    RESTART_ORDER
        .iter()
        .map(|&(node, _)| Step::CleanupFirewall { node })
        .chain([Step::AwaitAllRunning {
            within: settings.recovery_within,
        }])
        .collect()
}

fn recreate(settings: &ScenarioSettings) -> Experiment {
    let phase = with_steps(
        Phase::new(
            "recreate",
            Stage::Baseline,
            settings.recreate_within + PHASE_SLACK,
        ),
        measure(UPTIME, StoreTarget::Cluster)
            .into_iter()
            .chain([Step::Recreate])
            .chain(close_and_check(UPTIME, Expectation::Available)),
    );

    Experiment {
        name: ScenarioKind::Recreate.name(),
        description: "maintains uptime through a recreate of every VM",
        phases: vec![phase],
        recovery: standard_recovery(settings),
    }
}

fn zone_partition(settings: &ScenarioSettings) -> Experiment {
    let mut phases = vec![
        with_steps(
            Phase::new("baseline", Stage::Baseline, PHASE_SLACK),
            measure(UPTIME, StoreTarget::Cluster),
        ),
        Phase::new("isolate-z1", Stage::FaultActive, PHASE_SLACK).step(Step::Isolate { node: 0 }),
    ];
    phases.extend(restart_phases(settings, None));
    phases.push(Phase::new("heal-z1", Stage::Healing, PHASE_SLACK).step(Step::Heal { node: 0 }));
    phases.push(with_steps(
        Phase::new("verdict", Stage::Closed, PHASE_SLACK),
        close_and_check(UPTIME, Expectation::Available),
    ));

    let mut recovery = vec![Step::RestartNode { node: 0 }];
    recovery.extend(standard_recovery(settings));

    Experiment {
        name: ScenarioKind::ZonePartition.name(),
        description: "maintains uptime through a zone partition and node restarts",
        phases,
        recovery,
    }
}

fn targeted_partition(settings: &ScenarioSettings) -> Experiment {
    let window = settings.convergence;
    let isolated_failing =
        ReadGate::consistently(StoreTarget::Isolated, ReadExpectation::Failing, window);

    let mut phases = vec![
        with_steps(
            Phase::new("baseline", Stage::Baseline, PHASE_SLACK),
            measure(UPTIME, StoreTarget::Survivors),
        ),
        Phase::new("isolate-z1", Stage::FaultActive, PHASE_SLACK + window * 2)
            .step(Step::Isolate { node: 0 })
            .gate(ReadGate::eventually(
                StoreTarget::Isolated,
                ReadExpectation::Failing,
                window,
            ))
            .gate(isolated_failing),
    ];
    phases.extend(restart_phases(settings, Some(isolated_failing)));
    phases.push(
        Phase::new("heal-z1", Stage::Healing, PHASE_SLACK + window)
            .step(Step::Heal { node: 0 })
            .gate(ReadGate::eventually(
                StoreTarget::Isolated,
                ReadExpectation::Succeeding,
                window,
            )),
    );
    phases.push(with_steps(
        Phase::new("verdict", Stage::Closed, PHASE_SLACK),
        close_and_check(UPTIME, Expectation::Available),
    ));

    Experiment {
        name: ScenarioKind::TargetedPartition.name(),
        description: "isolated node stays unreadable through restarts while survivors serve reads",
        phases,
        recovery: standard_recovery(settings),
    }
}

fn full_partition(settings: &ScenarioSettings) -> Experiment {
    let hold = settings.hold;
    let window = settings.convergence;

    let phases = vec![
        with_steps(
            Phase::new("baseline", Stage::Baseline, hold + PHASE_SLACK),
            measure(BASELINE, StoreTarget::Cluster)
                .into_iter()
                .chain([Step::Hold(hold)])
                .chain(close_and_check(BASELINE, Expectation::Available)),
        ),
        // the canary write needs a healthy cluster, so create before isolating
        Phase::new("partition", Stage::FaultActive, PHASE_SLACK + window)
            .step(Step::CreateMeasurer {
                slot: TOTAL_PARTITION,
                target: StoreTarget::Cluster,
            })
            .step(Step::Isolate { node: 0 })
            .step(Step::Isolate { node: 1 })
            .gate(ReadGate::eventually(
                StoreTarget::Cluster,
                ReadExpectation::Failing,
                window,
            )),
        with_steps(
            Phase::new("total-partition", Stage::FaultActive, hold + PHASE_SLACK),
            [
                Step::StartMeasurer {
                    slot: TOTAL_PARTITION,
                },
                Step::Hold(hold),
            ]
            .into_iter()
            .chain(close_and_check(TOTAL_PARTITION, Expectation::Unavailable)),
        ),
        Phase::new("heal-z2", Stage::Healing, PHASE_SLACK + window)
            .step(Step::Heal { node: 1 })
            .gate(ReadGate::eventually(
                StoreTarget::Cluster,
                ReadExpectation::Succeeding,
                window,
            )),
        with_steps(
            Phase::new("partial-partition", Stage::Healing, hold + PHASE_SLACK),
            measure(PARTIAL_PARTITION, StoreTarget::Cluster)
                .into_iter()
                .chain([
                    Step::Hold(hold),
                    Step::AssertDeviation {
                        slot: PARTIAL_PARTITION,
                        expect: Expectation::Available,
                    },
                ]),
        ),
        Phase::new("heal-z1", Stage::Healing, PHASE_SLACK).step(Step::Heal { node: 0 }),
        with_steps(
            Phase::new("restored", Stage::Converged, hold + PHASE_SLACK),
            [Step::Hold(hold)]
                .into_iter()
                .chain(close_and_check(PARTIAL_PARTITION, Expectation::Available)),
        ),
    ];

    Experiment {
        name: ScenarioKind::FullPartition.name(),
        description: "reads fail under a two-zone partition and recover as zones heal",
        phases,
        recovery: standard_recovery(settings),
    }
}
