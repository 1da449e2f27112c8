//! Interpreter for declarative experiments.
//!
//! [`Orchestrator::run`] executes an [`Experiment`] phase by phase. Each
//! phase runs under its own timeout; steps and gates inside a phase run
//! strictly in order. Whatever happens, the run ends with teardown: every
//! measurer is stopped, leftover incidents are lifted, the recovery steps
//! run and every canary record is deleted.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

use crate::cluster::{
    ControlPlane, FaultInjector, Incident, IncidentRequest, InstanceSelector, StoreClient,
    TaskKind,
};
use crate::polling::{consistently_holds, eventually_until};
use crate::probe::UptimeMeasurer;

use super::error::ExperimentError;
use super::node_ops::NodeOps;
use super::phase::{Experiment, GateMode, MeasurerSlot, Phase, ReadGate, Step, StoreTarget};
use super::verdict::{Verdict, evaluate};

/// Key read by convergence gates.
const ROOT_KEY: &str = "/";

/// Phase name used for errors raised during teardown and recovery.
const RECOVERY_PHASE: &str = "recovery";

/// Store clients the experiments talk to.
#[derive(Clone)]
pub struct StoreSet {
    /// Client over every endpoint.
    pub cluster: Arc<dyn StoreClient>,
    /// Client over node 0's endpoint only.
    pub isolated: Arc<dyn StoreClient>,
    /// Client over every endpoint except node 0's.
    pub survivors: Arc<dyn StoreClient>,
}

impl StoreSet {
    fn get(&self, target: StoreTarget) -> &Arc<dyn StoreClient> {
        match target {
            StoreTarget::Cluster => &self.cluster,
            StoreTarget::Isolated => &self.isolated,
            StoreTarget::Survivors => &self.survivors,
        }
    }
}

impl fmt::Debug for StoreSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreSet")
            .field("cluster", &self.cluster.describe())
            .field("isolated", &self.isolated.describe())
            .field("survivors", &self.survivors.describe())
            .finish()
    }
}

/// Run-wide settings.
#[derive(Debug, Clone)]
pub struct RunSettings {
    /// Deployment under test.
    pub deployment: String,
    /// Zone of node `i` is `zones[i]`.
    pub zones: Vec<String>,
    /// Largest deviation accepted while the cluster should be available.
    pub read_tolerance: f64,
    /// Measurer tick period.
    pub probe_interval: Duration,
    /// Bound on each store call.
    pub operation_timeout: Duration,
    /// Interval between gate reads.
    pub gate_poll_interval: Duration,
    /// Address to keep reachable through firewall blocks, if known.
    pub client_ip: Option<String>,
    /// Deployment whose VM address is the client address.
    pub acceptance_deployment: Option<String>,
    /// `host:port` used to find the local outbound address.
    pub route_probe: String,
}

/// Verdict recorded by one passing deviation check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseVerdict {
    /// Phase the check ran in.
    pub phase: &'static str,
    /// Measurer checked.
    pub slot: MeasurerSlot,
    /// The verdict.
    pub verdict: Verdict,
}

/// Summary of a successful experiment.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentReport {
    /// Experiment name.
    pub name: &'static str,
    /// Every deviation check, in order.
    pub verdicts: Vec<PhaseVerdict>,
    /// Wall time including teardown.
    pub elapsed: Duration,
}

#[derive(Default)]
struct RunState {
    measurers: Vec<(MeasurerSlot, UptimeMeasurer)>,
    incidents: HashMap<usize, Box<dyn Incident>>,
    client_ip: Option<String>,
    verdicts: Vec<PhaseVerdict>,
}

impl RunState {
    fn measurer(
        &self,
        phase: &'static str,
        slot: MeasurerSlot,
    ) -> Result<&UptimeMeasurer, ExperimentError> {
        self.measurers
            .iter()
            .find(|(name, _)| *name == slot)
            .map(|(_, measurer)| measurer)
            .ok_or(ExperimentError::UnknownMeasurer { phase, slot })
    }
}

/// Runs experiments against one cluster.
pub struct Orchestrator {
    stores: StoreSet,
    faults: Arc<dyn FaultInjector>,
    control_plane: Arc<dyn ControlPlane>,
    nodes: NodeOps,
    settings: RunSettings,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("stores", &self.stores)
            .field("nodes", &self.nodes)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator.
    #[must_use]
    pub fn new(
        stores: StoreSet,
        faults: Arc<dyn FaultInjector>,
        control_plane: Arc<dyn ControlPlane>,
        nodes: NodeOps,
        settings: RunSettings,
    ) -> Self {
        Self {
            stores,
            faults,
            control_plane,
            nodes,
            settings,
        }
    }

    /// Runs `experiment` to completion, then tears it down.
    ///
    /// # Errors
    ///
    /// Returns the first [`ExperimentError`] raised by a phase. Teardown
    /// failures are logged, never returned.
    #[instrument(skip(self, experiment), fields(experiment = experiment.name))]
    pub async fn run(&self, experiment: &Experiment) -> Result<ExperimentReport, ExperimentError> {
        info!(
            description = experiment.description,
            measurers = ?experiment.measurer_slots(),
            "starting experiment"
        );
        let started = Instant::now();
        let mut state = RunState::default();

        let outcome = self.run_phases(experiment, &mut state).await;
        self.teardown(experiment, &mut state).await;

        match outcome {
            Ok(()) => {
                let report = ExperimentReport {
                    name: experiment.name,
                    verdicts: state.verdicts,
                    elapsed: started.elapsed(),
                };
                info!(elapsed = ?report.elapsed, checks = report.verdicts.len(), "experiment passed");
                Ok(report)
            }
            Err(err) => {
                error!(phase = err.phase(), error = %err, "experiment failed");
                Err(err)
            }
        }
    }

    async fn run_phases(
        &self,
        experiment: &Experiment,
        state: &mut RunState,
    ) -> Result<(), ExperimentError> {
        for phase in &experiment.phases {
            info!(phase = phase.name, stage = %phase.stage, "entering phase");
            tokio::time::timeout(phase.timeout, self.run_phase(phase, state))
                .await
                .map_err(|_| ExperimentError::PhaseTimeout {
                    phase: phase.name,
                    timeout: phase.timeout,
                })??;
        }
        Ok(())
    }

    async fn run_phase(&self, phase: &Phase, state: &mut RunState) -> Result<(), ExperimentError> {
        for step in &phase.steps {
            info!(phase = phase.name, "{step}");
            self.run_step(phase.name, step, state).await?;
        }
        for gate in &phase.gates {
            info!(phase = phase.name, "waiting for {gate}");
            self.check_gate(phase.name, gate).await?;
        }
        Ok(())
    }

    async fn run_step(
        &self,
        phase: &'static str,
        step: &Step,
        state: &mut RunState,
    ) -> Result<(), ExperimentError> {
        match *step {
            Step::CreateMeasurer { slot, target } => {
                self.create_measurer(phase, slot, target, state).await
            }
            Step::StartMeasurer { slot } => state
                .measurer(phase, slot)?
                .start()
                .await
                .map_err(|source| ExperimentError::Probe { phase, source }),
            Step::StopMeasurer { slot } => {
                state.measurer(phase, slot)?.stop().await;
                Ok(())
            }
            Step::AssertDeviation { slot, expect } => {
                let counts = state.measurer(phase, slot)?.counts();
                let bound = expect.bound(self.settings.read_tolerance);
                let verdict =
                    evaluate(counts, bound).ok_or(ExperimentError::NoSamples { phase, slot })?;
                info!(
                    phase,
                    slot,
                    total = verdict.total,
                    failed = verdict.failed,
                    deviation = verdict.deviation,
                    "Calculating the deviation of failures: {verdict}"
                );
                if !verdict.passed() {
                    return Err(ExperimentError::ToleranceExceeded {
                        phase,
                        slot,
                        total: verdict.total,
                        failed: verdict.failed,
                        deviation: verdict.deviation,
                        bound,
                    });
                }
                state.verdicts.push(PhaseVerdict {
                    phase,
                    slot,
                    verdict,
                });
                Ok(())
            }
            Step::Hold(duration) => {
                tokio::time::sleep(duration).await;
                Ok(())
            }
            Step::Recreate => self.recreate(phase).await,
            Step::Isolate { node } => self.isolate(phase, node, state).await,
            Step::Heal { node } => self.heal(phase, node, state).await,
            Step::RestartNode { node } => self
                .nodes
                .restart_node(node)
                .await
                .map_err(|source| ExperimentError::node(phase, node, source)),
            Step::CleanupFirewall { node } => self
                .nodes
                .cleanup_iptables(node)
                .await
                .map_err(|source| ExperimentError::node(phase, node, source)),
            Step::AwaitAllRunning { within } => self
                .nodes
                .await_all_running(within)
                .await
                .map_err(|source| ExperimentError::node(phase, "*", source)),
        }
    }

    async fn create_measurer(
        &self,
        phase: &'static str,
        slot: MeasurerSlot,
        target: StoreTarget,
        state: &mut RunState,
    ) -> Result<(), ExperimentError> {
        if let Some(position) = state.measurers.iter().position(|(name, _)| *name == slot) {
            let (_, previous) = state.measurers.remove(position);
            retire_measurer(slot, &previous).await;
        }

        let measurer = UptimeMeasurer::with_timeout(
            Arc::clone(self.stores.get(target)),
            self.settings.probe_interval,
            self.settings.operation_timeout,
        )
        .await
        .map_err(|source| ExperimentError::Probe { phase, source })?;

        state.measurers.push((slot, measurer));
        Ok(())
    }

    async fn recreate(&self, phase: &'static str) -> Result<(), ExperimentError> {
        let control_plane_error = |source| ExperimentError::ControlPlane { phase, source };
        let deployment = self
            .control_plane
            .find_deployment(&self.settings.deployment)
            .await
            .map_err(control_plane_error)?;
        deployment
            .recreate(&InstanceSelector::all())
            .await
            .map_err(control_plane_error)
    }

    fn zone(&self, phase: &'static str, node: usize) -> Result<&str, ExperimentError> {
        self.settings
            .zones
            .get(node)
            .map(String::as_str)
            .ok_or(ExperimentError::UnknownNode { phase, node })
    }

    async fn client_ip(
        &self,
        phase: &'static str,
        state: &mut RunState,
    ) -> Result<String, ExperimentError> {
        if let Some(ip) = &state.client_ip {
            return Ok(ip.clone());
        }
        let ip = self
            .nodes
            .resolve_client_ip(
                self.settings.client_ip.as_deref(),
                self.settings.acceptance_deployment.as_deref(),
                &self.settings.route_probe,
            )
            .await
            .map_err(|source| ExperimentError::node(phase, "client", source))?;
        info!(ip = %ip, "client IP resolved");
        state.client_ip = Some(ip.clone());
        Ok(ip)
    }

    async fn isolate(
        &self,
        phase: &'static str,
        node: usize,
        state: &mut RunState,
    ) -> Result<(), ExperimentError> {
        let zone = self.zone(phase, node)?;
        let ip = self.client_ip(phase, state).await?;

        self.nodes
            .unblock_ip(node, &ip)
            .await
            .map_err(|source| ExperimentError::node(phase, node, source))?;

        let request = IncidentRequest::firewall(&self.settings.deployment, zone);
        let incident = self
            .faults
            .create_incident(&request)
            .await
            .map_err(|source| ExperimentError::Fault { phase, source })?;
        info!(phase, node, zone, incident = incident.id(), "zone isolated");

        // recorded before any further await so teardown lifts it even if the
        // phase times out below
        let incident = state.incidents.entry(node).insert_entry(incident).into_mut();

        let has_errors = incident
            .has_task_errors()
            .await
            .map_err(|source| ExperimentError::Fault { phase, source })?;
        if has_errors {
            return Err(ExperimentError::TaskErrors {
                phase,
                incident: incident.id().to_string(),
                zone: zone.to_string(),
            });
        }
        Ok(())
    }

    async fn heal(
        &self,
        phase: &'static str,
        node: usize,
        state: &mut RunState,
    ) -> Result<(), ExperimentError> {
        let zone = self.zone(phase, node)?;
        let incident = state
            .incidents
            .get(&node)
            .ok_or(ExperimentError::UnknownIncident { phase, node })?;

        lift_incident(phase, zone, incident.as_ref()).await?;
        state.incidents.remove(&node);

        self.nodes
            .cleanup_iptables(node)
            .await
            .map_err(|source| ExperimentError::node(phase, node, source))?;
        info!(phase, node, zone, "zone healed");
        Ok(())
    }

    async fn check_gate(&self, phase: &'static str, gate: &ReadGate) -> Result<(), ExperimentError> {
        let store = self.stores.get(gate.target);
        let timeout = self.settings.operation_timeout;
        let expect = gate.expect;
        let interval = self.settings.gate_poll_interval;

        let read_meets_expectation =
            move || async move { expect.is_met(store.get(ROOT_KEY, timeout).await.is_ok()) };

        let result = match gate.mode {
            GateMode::Eventually { within } => {
                eventually_until(read_meets_expectation, within, interval).await
            }
            GateMode::Consistently { window } => {
                consistently_holds(read_meets_expectation, window, interval).await
            }
        };

        let report = result.map_err(|source| ExperimentError::Convergence {
            phase,
            gate: gate.to_string(),
            source,
        })?;
        info!(phase, attempts = report.attempts, elapsed = ?report.elapsed, "gate passed: {gate}");
        Ok(())
    }

    async fn teardown(&self, experiment: &Experiment, state: &mut RunState) {
        for (slot, measurer) in &state.measurers {
            measurer.stop().await;
            info!(slot = *slot, counts = ?measurer.counts(), "measurer closed");
        }

        for (node, incident) in state.incidents.drain() {
            let zone = self.settings.zones.get(node).map_or("?", String::as_str);
            warn!(node, zone, incident = incident.id(), "lifting leftover incident");
            if let Err(err) = lift_incident(RECOVERY_PHASE, zone, incident.as_ref()).await {
                warn!(node, error = %err, "could not lift leftover incident");
            }
        }

        for step in &experiment.recovery {
            info!(phase = RECOVERY_PHASE, "{step}");
            if let Err(err) = self.run_step(RECOVERY_PHASE, step, state).await {
                warn!(error = %err, "recovery step failed");
            }
        }

        for (slot, measurer) in state.measurers.drain(..) {
            if let Err(err) = measurer.cleanup().await {
                warn!(slot, error = %err, "could not delete canary");
            }
        }
        info!(experiment = experiment.name, "experiment closed");
    }
}

/// Stops every firewall task of `incident`, waits for it, and checks task errors.
async fn lift_incident(
    phase: &'static str,
    zone: &str,
    incident: &dyn Incident,
) -> Result<(), ExperimentError> {
    let fault = |source| ExperimentError::Fault { phase, source };

    let tasks = incident
        .tasks_of_type(TaskKind::Firewall)
        .await
        .map_err(fault)?;
    for task in &tasks {
        task.stop().await.map_err(fault)?;
    }
    incident.wait().await.map_err(fault)?;

    if incident.has_task_errors().await.map_err(fault)? {
        return Err(ExperimentError::TaskErrors {
            phase,
            incident: incident.id().to_string(),
            zone: zone.to_string(),
        });
    }
    Ok(())
}

async fn retire_measurer(slot: MeasurerSlot, measurer: &UptimeMeasurer) {
    measurer.stop().await;
    if let Err(err) = measurer.cleanup().await {
        warn!(slot, error = %err, "could not delete replaced canary");
    }
}
