//! Narrow interfaces to the systems surrounding the probe engine.
//!
//! The probe engine never talks to the cluster, the deployment director,
//! the fault injector or a remote shell directly. It consumes the traits
//! defined here, which keeps the measurer and the orchestrator testable
//! against in-memory fakes.
//!
//! # Architecture
//!
//! - [`StoreClient`] - put/get/delete against the key-value store
//! - [`ControlPlane`] / [`Deployment`] - VM enumeration, recreate, ssh access
//! - [`FaultInjector`] / [`Incident`] / [`FaultTask`] - network faults
//! - [`RemoteExecutor`] - run one shell command on a node
//!
//! Concrete adapters live alongside: [`GatewayStore`] (etcd JSON gateway),
//! [`DirectorClient`] (BOSH director), [`TurbulenceClient`] (turbulence API)
//! and [`SshExecutor`] (system `ssh`).
//!
//! # Object Safety
//!
//! All traits use `async_trait` so the orchestrator can hold them as
//! `Arc<dyn ...>`; native async trait methods are not object-safe.

mod director;
mod error;
mod ssh;
mod store;
mod turbulence;

pub use director::{DirectorClient, DirectorConfig};
pub use error::{ControlPlaneError, FaultError, RemoteError, StoreError};
pub use ssh::SshExecutor;
pub use store::{DEFAULT_GATEWAY_PREFIX, GatewayStore, TlsMaterial};
pub use turbulence::{TurbulenceClient, TurbulenceConfig};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

/// One entry returned by a store read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    /// Entry key.
    pub key: String,
    /// Entry value.
    pub value: String,
}

impl KeyValue {
    /// Creates a new entry.
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Client for the key-value store under test.
///
/// Every call carries its own timeout; implementations must return
/// [`StoreError::Timeout`] rather than block past it.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Human-readable description of the endpoints this client talks to.
    fn describe(&self) -> String;

    /// Writes `value` under `key`.
    async fn put(&self, key: &str, value: &str, timeout: Duration) -> Result<(), StoreError>;

    /// Reads every entry stored under exactly `key`.
    async fn get(&self, key: &str, timeout: Duration) -> Result<Vec<KeyValue>, StoreError>;

    /// Deletes `key`.
    async fn delete(&self, key: &str, timeout: Duration) -> Result<(), StoreError>;
}

/// Selects all instances, one instance group, or one instance of a group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceSelector {
    group: Option<String>,
    index: Option<String>,
}

impl InstanceSelector {
    /// Selects every instance of the deployment.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Selects one instance of a group by index.
    #[must_use]
    pub fn instance(group: impl Into<String>, index: usize) -> Self {
        Self {
            group: Some(group.into()),
            index: Some(index.to_string()),
        }
    }

    /// Instance group name, if narrowed to a group.
    #[must_use]
    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    /// Instance index, if narrowed to one instance.
    #[must_use]
    pub fn index(&self) -> Option<&str> {
        self.index.as_deref()
    }
}

impl fmt::Display for InstanceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.group, &self.index) {
            (Some(group), Some(index)) => write!(f, "{group}/{index}"),
            (Some(group), None) => write!(f, "{group}"),
            _ => write!(f, "*"),
        }
    }
}

/// State of one VM as reported by the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmInfo {
    /// Instance group the VM belongs to.
    pub job_name: String,
    /// Instance id.
    pub id: String,
    /// Aggregate process state (`running`, `failing`, ...).
    pub process_state: String,
    /// Addresses assigned to the VM.
    pub ips: Vec<String>,
}

impl VmInfo {
    /// Returns true when every process on the VM reports running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.process_state == "running"
    }
}

/// Ephemeral credentials used to open ssh access to instances.
#[derive(Clone, PartialEq, Eq)]
pub struct SshOpts {
    /// Username created on the instance.
    pub username: String,
    /// Public key installed for `username`.
    pub public_key: String,
    /// Matching private key, kept locally.
    pub private_key: String,
}

impl fmt::Debug for SshOpts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshOpts")
            .field("username", &self.username)
            .field("public_key", &self.public_key)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// One host made reachable by [`Deployment::set_up_ssh`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshHost {
    /// Address to connect to.
    pub host: String,
    /// Instance index the host belongs to, when reported.
    pub index: Option<usize>,
}

/// Client for the deployment director.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Looks up a deployment by name.
    async fn find_deployment(&self, name: &str) -> Result<Arc<dyn Deployment>, ControlPlaneError>;
}

/// One deployment known to the director.
#[async_trait]
pub trait Deployment: Send + Sync {
    /// Deployment name.
    fn name(&self) -> &str;

    /// Enumerates VMs with their process state.
    async fn vm_infos(&self) -> Result<Vec<VmInfo>, ControlPlaneError>;

    /// Recreates the selected instances and waits for completion.
    async fn recreate(&self, selector: &InstanceSelector) -> Result<(), ControlPlaneError>;

    /// Installs `opts` on the selected instances and returns reachable hosts.
    async fn set_up_ssh(
        &self,
        selector: &InstanceSelector,
        opts: &SshOpts,
    ) -> Result<Vec<SshHost>, ControlPlaneError>;

    /// Removes the user created by [`set_up_ssh`](Self::set_up_ssh).
    async fn clean_up_ssh(
        &self,
        selector: &InstanceSelector,
        opts: &SshOpts,
    ) -> Result<(), ControlPlaneError>;
}

/// Kind of fault task carried by an incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Drop all traffic to and from the selected instances.
    Firewall,
}

impl TaskKind {
    /// Wire name of the task type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Firewall => "Firewall",
        }
    }
}

/// Request for a new incident scoped to one availability zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncidentRequest {
    /// Deployment the incident targets.
    pub deployment: String,
    /// Availability zone selector.
    pub zone: String,
    /// Tasks to run on every selected instance.
    pub tasks: Vec<TaskKind>,
}

impl IncidentRequest {
    /// Creates a request that firewalls every instance in `zone`.
    #[must_use]
    pub fn firewall(deployment: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            deployment: deployment.into(),
            zone: zone.into(),
            tasks: vec![TaskKind::Firewall],
        }
    }
}

/// Client for the fault injector.
#[async_trait]
pub trait FaultInjector: Send + Sync {
    /// Creates an incident; the fault is active once this returns.
    async fn create_incident(
        &self,
        request: &IncidentRequest,
    ) -> Result<Box<dyn Incident>, FaultError>;
}

/// A live fault directive.
#[async_trait]
pub trait Incident: Send + Sync {
    /// Incident id.
    fn id(&self) -> &str;

    /// Returns true when any task of the incident reported an error.
    async fn has_task_errors(&self) -> Result<bool, FaultError>;

    /// Returns the incident's tasks of one kind.
    async fn tasks_of_type(&self, kind: TaskKind) -> Result<Vec<Box<dyn FaultTask>>, FaultError>;

    /// Blocks until every task of the incident has finished executing.
    async fn wait(&self) -> Result<(), FaultError>;
}

/// One task of an incident.
#[async_trait]
pub trait FaultTask: Send + Sync {
    /// Task id.
    fn id(&self) -> &str;

    /// Asks the task to stop, lifting its fault.
    async fn stop(&self) -> Result<(), FaultError>;
}

/// Where and as whom a remote command runs.
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    /// Host to connect to.
    pub host: String,
    /// SSH port.
    pub port: u16,
    /// Login user.
    pub username: String,
    /// PEM/OpenSSH private key for `username`.
    pub private_key: String,
}

impl fmt::Debug for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Runs shell commands on cluster nodes.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Runs `command` on `target` and returns its standard output.
    async fn run(&self, target: &RemoteTarget, command: &str) -> Result<String, RemoteError>;
}
