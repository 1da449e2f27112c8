//! Node-level operations composed from the director and a remote shell.
//!
//! Every operation opens ssh access to one instance, runs its commands and
//! removes the access again, also when the commands fail.

use std::net::IpAddr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use tokio::net::UdpSocket;
use tracing::{debug, info, instrument, warn};

use crate::cluster::{
    ControlPlane, Deployment, InstanceSelector, RemoteExecutor, RemoteTarget, SshOpts,
};
use crate::polling::{DEFAULT_POLL_INTERVAL, eventually_until};

use super::error::NodeError;

/// How long a restarted store process may take to report running.
pub const DEFAULT_RESTART_WITHIN: Duration = Duration::from_secs(60);

const MONIT: &str = "sudo /var/vcap/bosh/bin/monit";

/// Matches the store process line of `monit summary` once it runs.
#[allow(clippy::expect_used)]
static PROCESS_RUNNING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"'etcd'\s+running").expect("monit summary regex is valid") // Static pattern, safe to panic
});

/// Returns true when `monit summary` output shows the store process running.
#[must_use]
pub fn summary_shows_running(summary: &str) -> bool {
    PROCESS_RUNNING.is_match(summary)
}

/// Deployment coordinates for node operations.
#[derive(Debug, Clone)]
pub struct NodeTarget {
    /// Deployment holding the store nodes.
    pub deployment: String,
    /// Instance group of the store nodes.
    pub instance_group: String,
    /// SSH port of the nodes.
    pub ssh_port: u16,
}

struct Session {
    deployment: Arc<dyn Deployment>,
    selector: InstanceSelector,
    target: RemoteTarget,
}

/// Runs iptables and process commands on store nodes.
pub struct NodeOps {
    control_plane: Arc<dyn ControlPlane>,
    remote: Arc<dyn RemoteExecutor>,
    target: NodeTarget,
    ssh: SshOpts,
    poll_interval: Duration,
    restart_within: Duration,
}

impl std::fmt::Debug for NodeOps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeOps")
            .field("target", &self.target)
            .field("ssh", &self.ssh)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl NodeOps {
    /// Creates node operations that authenticate with `ssh` on every node.
    #[must_use]
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        remote: Arc<dyn RemoteExecutor>,
        target: NodeTarget,
        ssh: SshOpts,
    ) -> Self {
        Self {
            control_plane,
            remote,
            target,
            ssh,
            poll_interval: DEFAULT_POLL_INTERVAL,
            restart_within: DEFAULT_RESTART_WITHIN,
        }
    }

    /// Overrides the interval used when polling node and VM state.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Overrides how long a restart may take to report running.
    #[must_use]
    pub fn with_restart_within(mut self, within: Duration) -> Self {
        self.restart_within = within;
        self
    }

    async fn deployment(&self) -> Result<Arc<dyn Deployment>, NodeError> {
        Ok(self
            .control_plane
            .find_deployment(&self.target.deployment)
            .await?)
    }

    async fn open_session(&self, node: usize) -> Result<Session, NodeError> {
        let deployment = self.deployment().await?;
        let selector = InstanceSelector::instance(&self.target.instance_group, node);
        let hosts = deployment.set_up_ssh(&selector, &self.ssh).await?;

        let Some(host) = hosts
            .iter()
            .find(|h| h.index == Some(node))
            .or_else(|| hosts.first())
        else {
            let session = Session {
                deployment,
                selector,
                target: self.remote_target(String::new()),
            };
            let missing = NodeError::NoSshHost {
                instance: session.selector.to_string(),
            };
            return self.close_session(session, Err(missing)).await;
        };

        debug!(node, host = %host.host, "ssh session opened");
        Ok(Session {
            target: self.remote_target(host.host.clone()),
            deployment,
            selector,
        })
    }

    fn remote_target(&self, host: String) -> RemoteTarget {
        RemoteTarget {
            host,
            port: self.target.ssh_port,
            username: self.ssh.username.clone(),
            private_key: self.ssh.private_key.clone(),
        }
    }

    async fn close_session<T>(
        &self,
        session: Session,
        result: Result<T, NodeError>,
    ) -> Result<T, NodeError> {
        let cleanup = session
            .deployment
            .clean_up_ssh(&session.selector, &self.ssh)
            .await;

        match (result, cleanup) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(error)) => Err(error.into()),
            (Err(error), Ok(())) => Err(error),
            (Err(error), Err(cleanup_error)) => {
                warn!(
                    selector = %session.selector,
                    error = %cleanup_error,
                    "ssh cleanup failed after node operation error"
                );
                Err(error)
            }
        }
    }

    /// Runs one command on `node` and returns its output.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError`] when ssh access or the command fails.
    pub async fn run_on(&self, node: usize, command: &str) -> Result<String, NodeError> {
        let session = self.open_session(node).await?;
        let result = self
            .remote
            .run(&session.target, command)
            .await
            .map_err(NodeError::from);
        self.close_session(session, result).await
    }

    /// Inserts ACCEPT rules for `ip` at the top of INPUT and OUTPUT on `node`.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError`] when ssh access or iptables fails.
    #[instrument(skip(self))]
    pub async fn unblock_ip(&self, node: usize, ip: &str) -> Result<(), NodeError> {
        let command = format!(
            "sudo iptables -I INPUT 1 -s {ip} -j ACCEPT && sudo iptables -I OUTPUT 1 -s {ip} -j ACCEPT"
        );
        self.run_on(node, &command).await?;
        info!(node, ip, "client IP allowed through firewall");
        Ok(())
    }

    /// Deletes the first INPUT and OUTPUT rules on `node`.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError`] when ssh access or iptables fails.
    #[instrument(skip(self))]
    pub async fn cleanup_iptables(&self, node: usize) -> Result<(), NodeError> {
        self.run_on(node, "sudo iptables -D INPUT 1 && sudo iptables -D OUTPUT 1")
            .await?;
        debug!(node, "iptables exception removed");
        Ok(())
    }

    /// Restarts the store process on `node` and waits until monit reports it running.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::NotConverged`] when the process does not come
    /// back within the restart window.
    #[instrument(skip(self))]
    pub async fn restart_node(&self, node: usize) -> Result<(), NodeError> {
        let session = self.open_session(node).await?;
        let result = self.restart_in(&session, node).await;
        self.close_session(session, result).await
    }

    async fn restart_in(&self, session: &Session, node: usize) -> Result<(), NodeError> {
        self.remote
            .run(&session.target, &format!("{MONIT} restart etcd"))
            .await?;
        info!(node, "store process restart requested");

        let summary = format!("{MONIT} summary");
        let (remote, target, summary) = (&self.remote, &session.target, summary.as_str());
        eventually_until(
            move || async move {
                match remote.run(target, summary).await {
                    Ok(output) => summary_shows_running(&output),
                    Err(error) => {
                        debug!(node, error = %error, "monit summary failed");
                        false
                    }
                }
            },
            self.restart_within,
            self.poll_interval,
        )
        .await
        .map_err(|source| NodeError::NotConverged {
            what: format!("store process running on node {node}"),
            source,
        })?;

        info!(node, "store process running again");
        Ok(())
    }

    /// Waits until every VM of the deployment reports `running`.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::NotConverged`] when some VM is still not running
    /// after `within`.
    #[instrument(skip(self))]
    pub async fn await_all_running(&self, within: Duration) -> Result<(), NodeError> {
        let deployment = self.deployment().await?;
        let deployment = &deployment;
        eventually_until(
            move || async move {
                match deployment.vm_infos().await {
                    Ok(vms) => {
                        let pending: Vec<String> = vms
                            .iter()
                            .filter(|vm| !vm.is_running())
                            .map(|vm| format!("{}/{}", vm.job_name, vm.id))
                            .collect();
                        if !pending.is_empty() {
                            debug!(pending = ?pending, "not all VMs running");
                        }
                        pending.is_empty()
                    }
                    Err(error) => {
                        debug!(error = %error, "listing VMs failed");
                        false
                    }
                }
            },
            within,
            self.poll_interval,
        )
        .await
        .map_err(|source| NodeError::NotConverged {
            what: format!("all VMs of {} running", self.target.deployment),
            source,
        })?;
        Ok(())
    }

    /// Determines the address that must stay reachable through firewall blocks.
    ///
    /// Order: the configured address, the address of the one VM in
    /// `acceptance_deployment`, then the local address used to reach
    /// `route_probe` (`host:port`).
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::ClientIp`] when no source yields an address, or
    /// when `acceptance_deployment` does not have exactly one VM with exactly
    /// one address.
    pub async fn resolve_client_ip(
        &self,
        configured: Option<&str>,
        acceptance_deployment: Option<&str>,
        route_probe: &str,
    ) -> Result<String, NodeError> {
        if let Some(ip) = configured.filter(|ip| !ip.is_empty()) {
            return Ok(ip.to_string());
        }

        if let Some(name) = acceptance_deployment {
            let deployment = self.control_plane.find_deployment(name).await?;
            let vms = deployment.vm_infos().await?;
            return match vms.as_slice() {
                [vm] => match vm.ips.as_slice() {
                    [ip] => Ok(ip.clone()),
                    ips => Err(NodeError::ClientIp {
                        message: format!(
                            "expected one address on the VM of {name}, found {}",
                            ips.len()
                        ),
                    }),
                },
                vms => Err(NodeError::ClientIp {
                    message: format!("expected one VM in {name}, found {}", vms.len()),
                }),
            };
        }

        local_address_towards(route_probe)
            .await
            .map(|ip| ip.to_string())
            .map_err(|e| NodeError::ClientIp {
                message: format!("no local route to {route_probe}: {e}"),
            })
    }
}

/// Local interface address the OS would use to reach `target`.
async fn local_address_towards(target: &str) -> std::io::Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(target).await?;
    Ok(socket.local_addr()?.ip())
}
