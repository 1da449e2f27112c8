//! Turbulence API client implementing [`FaultInjector`].
//!
//! Incidents are created with `POST api/v1/incidents` and observed through
//! `GET api/v1/incidents/{id}`; each agent-side task shows up as an event.
//! Stopping a task (`PUT api/v1/agent_tasks/{id}`) lifts its fault.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Certificate, Client, Method};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use url::Url;

use super::{FaultError, FaultInjector, FaultTask, Incident, IncidentRequest, TaskKind};

/// Interval between incident state polls while waiting.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Connection settings for the turbulence API.
#[derive(Clone)]
pub struct TurbulenceConfig {
    /// API host.
    pub host: String,
    /// API port.
    pub port: u16,
    /// Basic-auth user.
    pub username: String,
    /// Basic-auth password.
    pub password: String,
    /// PEM CA certificate of the API.
    pub ca_cert: Option<String>,
}

impl std::fmt::Debug for TurbulenceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurbulenceConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct Api {
    http: Client,
    base: Url,
    username: String,
    password: String,
    poll_interval: Duration,
}

/// Turbulence API client.
#[derive(Debug, Clone)]
pub struct TurbulenceClient {
    api: Arc<Api>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct WireIncidentRequest<'a> {
    tasks: Vec<WireTaskOptions<'a>>,
    selector: WireSelector<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct WireTaskOptions<'a> {
    #[serde(rename = "Type")]
    kind: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct WireSelector<'a> {
    deployment: WireName<'a>,
    #[serde(rename = "AZ")]
    zone: WireName<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct WireName<'a> {
    name: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireIncident {
    #[serde(rename = "ID")]
    id: String,
    #[serde(default)]
    execution_completed_at: String,
    #[serde(default)]
    events: Vec<WireEvent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireEvent {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "Type", default)]
    kind: String,
    #[serde(default)]
    error: String,
    #[serde(default)]
    execution_completed_at: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct WireStopRequest {
    stopped: bool,
}

impl WireIncident {
    fn is_complete(&self) -> bool {
        !self.execution_completed_at.is_empty()
            && self
                .events
                .iter()
                .all(|event| !event.execution_completed_at.is_empty())
    }

    fn has_task_errors(&self) -> bool {
        self.events.iter().any(|event| !event.error.is_empty())
    }
}

impl TurbulenceClient {
    /// Creates a client for `https://{host}:{port}/`.
    ///
    /// # Errors
    ///
    /// Returns [`FaultError::Setup`] when the base URL or CA is invalid.
    pub fn new(config: &TurbulenceConfig) -> Result<Self, FaultError> {
        Self::with_poll_interval(config, DEFAULT_POLL_INTERVAL)
    }

    /// Creates a client that polls incident state every `poll_interval`.
    ///
    /// # Errors
    ///
    /// Same as [`TurbulenceClient::new`].
    pub fn with_poll_interval(
        config: &TurbulenceConfig,
        poll_interval: Duration,
    ) -> Result<Self, FaultError> {
        let raw = if config.host.contains("://") {
            format!("{}:{}/", config.host.trim_end_matches('/'), config.port)
        } else {
            format!("https://{}:{}/", config.host, config.port)
        };
        let base = Url::parse(&raw).map_err(|e| FaultError::Setup {
            message: format!("invalid base URL {raw:?}: {e}"),
        })?;

        let mut builder = Client::builder();
        if let Some(ca) = config.ca_cert.as_deref().filter(|ca| !ca.trim().is_empty()) {
            let certificate =
                Certificate::from_pem(ca.as_bytes()).map_err(|e| FaultError::Setup {
                    message: format!("invalid CA certificate: {e}"),
                })?;
            builder = builder.add_root_certificate(certificate);
        }
        let http = builder.build().map_err(|e| FaultError::Setup {
            message: e.to_string(),
        })?;

        Ok(Self {
            api: Arc::new(Api {
                http,
                base,
                username: config.username.clone(),
                password: config.password.clone(),
                poll_interval,
            }),
        })
    }
}

impl Api {
    async fn send<B: Serialize + Sync>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<reqwest::Response, FaultError> {
        let url = self
            .base
            .join(path)
            .map_err(|e| FaultError::request(path, e))?;
        let mut request = self
            .http
            .request(method, url)
            .basic_auth(&self.username, Some(&self.password));
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| FaultError::request(path, e))?;
        if !response.status().is_success() {
            return Err(FaultError::Status {
                url: path.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response)
    }

    async fn fetch_incident(&self, id: &str) -> Result<WireIncident, FaultError> {
        let path = format!("api/v1/incidents/{id}");
        self.send::<()>(Method::GET, &path, None)
            .await?
            .json()
            .await
            .map_err(FaultError::decode)
    }
}

#[async_trait]
impl FaultInjector for TurbulenceClient {
    #[instrument(skip(self), fields(deployment = %request.deployment, zone = %request.zone))]
    async fn create_incident(
        &self,
        request: &IncidentRequest,
    ) -> Result<Box<dyn Incident>, FaultError> {
        let body = WireIncidentRequest {
            tasks: request
                .tasks
                .iter()
                .map(|kind| WireTaskOptions {
                    kind: kind.as_str(),
                })
                .collect(),
            selector: WireSelector {
                deployment: WireName {
                    name: &request.deployment,
                },
                zone: WireName {
                    name: &request.zone,
                },
            },
        };

        let incident: WireIncident = self
            .api
            .send(Method::POST, "api/v1/incidents", Some(&body))
            .await?
            .json()
            .await
            .map_err(FaultError::decode)?;

        info!(incident = %incident.id, "incident created");
        Ok(Box::new(TurbulenceIncident {
            api: Arc::clone(&self.api),
            id: incident.id,
        }))
    }
}

/// Live incident handle.
#[derive(Debug)]
struct TurbulenceIncident {
    api: Arc<Api>,
    id: String,
}

#[async_trait]
impl Incident for TurbulenceIncident {
    fn id(&self) -> &str {
        &self.id
    }

    async fn has_task_errors(&self) -> Result<bool, FaultError> {
        let incident = self.api.fetch_incident(&self.id).await?;
        Ok(incident.has_task_errors())
    }

    async fn tasks_of_type(&self, kind: TaskKind) -> Result<Vec<Box<dyn FaultTask>>, FaultError> {
        let incident = self.api.fetch_incident(&self.id).await?;
        Ok(incident
            .events
            .into_iter()
            .filter(|event| event.kind == kind.as_str() && !event.id.is_empty())
            .map(|event| {
                Box::new(TurbulenceTask {
                    api: Arc::clone(&self.api),
                    id: event.id,
                }) as Box<dyn FaultTask>
            })
            .collect())
    }

    #[instrument(skip(self), fields(incident = %self.id))]
    async fn wait(&self) -> Result<(), FaultError> {
        loop {
            let incident = self.api.fetch_incident(&self.id).await?;
            if incident.is_complete() {
                debug!("incident execution completed");
                return Ok(());
            }
            tokio::time::sleep(self.api.poll_interval).await;
        }
    }
}

/// One agent task of an incident.
#[derive(Debug)]
struct TurbulenceTask {
    api: Arc<Api>,
    id: String,
}

#[async_trait]
impl FaultTask for TurbulenceTask {
    fn id(&self) -> &str {
        &self.id
    }

    #[instrument(skip(self), fields(task = %self.id))]
    async fn stop(&self) -> Result<(), FaultError> {
        let path = format!("api/v1/agent_tasks/{}", self.id);
        self.api
            .send(Method::PUT, &path, Some(&WireStopRequest { stopped: true }))
            .await?;
        debug!("fault task stopped");
        Ok(())
    }
}
