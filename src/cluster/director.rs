//! BOSH director client implementing [`ControlPlane`].
//!
//! Authentication uses the UAA client-credentials grant; the access token is
//! cached until shortly before it expires. Long-running director operations
//! (VM listing with process state, recreate, ssh setup) answer with a
//! redirect to `/tasks/{id}`, which is polled until the task finishes and
//! whose `result` output carries the payload.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, LOCATION};
use reqwest::{Certificate, Client, Method, RequestBuilder, StatusCode, redirect};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::{
    ControlPlane, ControlPlaneError, Deployment, InstanceSelector, SshHost, SshOpts, VmInfo,
};

/// Interval between task state polls.
const DEFAULT_TASK_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Tokens are refreshed this long before their reported expiry.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(30);

/// Connection settings for the director and its UAA.
#[derive(Clone)]
pub struct DirectorConfig {
    /// Director base URL, e.g. `https://10.0.0.6:25555`.
    pub director_url: String,
    /// UAA base URL, e.g. `https://10.0.0.6:8443`.
    pub uaa_url: String,
    /// OAuth client id.
    pub client: String,
    /// OAuth client secret.
    pub client_secret: String,
    /// PEM CA certificate trusted for both director and UAA.
    pub ca_cert: Option<String>,
}

impl std::fmt::Debug for DirectorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectorConfig")
            .field("director_url", &self.director_url)
            .field("uaa_url", &self.uaa_url)
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct CachedToken {
    value: String,
    refresh_at: Instant,
}

#[derive(Debug)]
struct Api {
    http: Client,
    base: Url,
    token_url: Url,
    client: String,
    client_secret: String,
    token: Mutex<Option<CachedToken>>,
    task_poll_interval: Duration,
}

/// BOSH director client.
#[derive(Debug, Clone)]
pub struct DirectorClient {
    api: Arc<Api>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

#[derive(Deserialize)]
struct DeploymentSummary {
    name: String,
}

#[derive(Deserialize)]
struct DeploymentManifest {
    #[serde(default)]
    manifest: String,
}

#[derive(Deserialize)]
struct TaskState {
    id: u64,
    state: String,
    #[serde(default)]
    result: Option<String>,
}

#[derive(Deserialize)]
struct WireVmInfo {
    #[serde(default)]
    job_name: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    process_state: String,
    #[serde(default)]
    ips: Vec<String>,
}

#[derive(Deserialize)]
struct WireSshResult {
    #[serde(default)]
    status: String,
    #[serde(default)]
    ip: Option<String>,
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    error: Option<String>,
}

impl DirectorClient {
    /// Creates a director client. No request is made until first use.
    ///
    /// # Errors
    ///
    /// Returns [`ControlPlaneError::Request`] when a URL is malformed or the
    /// CA certificate is rejected.
    pub fn new(config: &DirectorConfig) -> Result<Self, ControlPlaneError> {
        Self::with_task_poll_interval(config, DEFAULT_TASK_POLL_INTERVAL)
    }

    /// Creates a director client that polls tasks every `task_poll_interval`.
    ///
    /// # Errors
    ///
    /// Same as [`DirectorClient::new`].
    pub fn with_task_poll_interval(
        config: &DirectorConfig,
        task_poll_interval: Duration,
    ) -> Result<Self, ControlPlaneError> {
        let base = parse_base(&config.director_url)?;
        let token_url = parse_base(&config.uaa_url)?
            .join("oauth/token")
            .map_err(|e| ControlPlaneError::request(&config.uaa_url, e))?;

        let mut builder = Client::builder().redirect(redirect::Policy::none());
        if let Some(ca) = config.ca_cert.as_deref().filter(|ca| !ca.trim().is_empty()) {
            let certificate = Certificate::from_pem(ca.as_bytes())
                .map_err(|e| ControlPlaneError::request(&config.director_url, e))?;
            builder = builder.add_root_certificate(certificate);
        }
        let http = builder
            .build()
            .map_err(|e| ControlPlaneError::request(&config.director_url, e))?;

        Ok(Self {
            api: Arc::new(Api {
                http,
                base,
                token_url,
                client: config.client.clone(),
                client_secret: config.client_secret.clone(),
                token: Mutex::new(None),
                task_poll_interval,
            }),
        })
    }
}

fn parse_base(raw: &str) -> Result<Url, ControlPlaneError> {
    let normalized = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    };
    Url::parse(&normalized).map_err(|e| ControlPlaneError::request(raw, e))
}

impl Api {
    fn url(&self, path: &str) -> Result<Url, ControlPlaneError> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|e| ControlPlaneError::request(path, e))
    }

    async fn access_token(&self) -> Result<String, ControlPlaneError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| Instant::now() < t.refresh_at) {
            return Ok(token.value.clone());
        }

        debug!(url = %self.token_url, "requesting director access token");
        let auth_error = |message: String| ControlPlaneError::Auth {
            url: self.token_url.to_string(),
            message,
        };
        let response = self
            .http
            .post(self.token_url.clone())
            .basic_auth(&self.client, Some(&self.client_secret))
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body("grant_type=client_credentials")
            .send()
            .await
            .map_err(|e| auth_error(e.to_string()))?;
        if !response.status().is_success() {
            return Err(auth_error(format!("HTTP {}", response.status().as_u16())));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| auth_error(e.to_string()))?;

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_REFRESH_MARGIN);
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }

    async fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, ControlPlaneError> {
        let url = self.url(path)?;
        let token = self.access_token().await?;
        Ok(self.http.request(method, url).bearer_auth(token))
    }

    async fn send(&self, builder: RequestBuilder, path: &str) -> Result<reqwest::Response, ControlPlaneError> {
        builder
            .send()
            .await
            .map_err(|e| ControlPlaneError::request(path, e))
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, ControlPlaneError> {
        let response = self.send(self.request(Method::GET, path).await?, path).await?;
        if !response.status().is_success() {
            return Err(ControlPlaneError::Status {
                url: path.to_string(),
                status: response.status().as_u16(),
            });
        }
        response.json().await.map_err(ControlPlaneError::decode)
    }

    /// Sends a task-starting request and returns the task id.
    async fn start_task(&self, builder: RequestBuilder, path: &str) -> Result<u64, ControlPlaneError> {
        let response = self.send(builder, path).await?;
        let status = response.status();

        if status.is_redirection() {
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .ok_or_else(|| ControlPlaneError::decode("task redirect without Location"))?;
            return task_id_from_location(location);
        }

        if status == StatusCode::OK || status == StatusCode::CREATED {
            let task: TaskState = response.json().await.map_err(ControlPlaneError::decode)?;
            return Ok(task.id);
        }

        Err(ControlPlaneError::Status {
            url: path.to_string(),
            status: status.as_u16(),
        })
    }

    /// Polls a task until it reaches a final state.
    #[instrument(skip(self))]
    async fn wait_task(&self, id: u64) -> Result<(), ControlPlaneError> {
        let path = format!("tasks/{id}");
        loop {
            let task: TaskState = self.get_json(&path).await?;
            match task.state.as_str() {
                "done" => {
                    debug!(task = id, "director task done");
                    return Ok(());
                }
                "error" | "cancelled" | "timeout" => {
                    return Err(ControlPlaneError::Task {
                        id,
                        state: task.state,
                        description: task.result.unwrap_or_default(),
                    });
                }
                _ => tokio::time::sleep(self.task_poll_interval).await,
            }
        }
    }

    async fn task_result(&self, id: u64) -> Result<String, ControlPlaneError> {
        let path = format!("tasks/{id}/output?type=result");
        let response = self.send(self.request(Method::GET, &path).await?, &path).await?;
        if !response.status().is_success() {
            return Err(ControlPlaneError::Status {
                url: path,
                status: response.status().as_u16(),
            });
        }
        response.text().await.map_err(ControlPlaneError::decode)
    }

    async fn run_task(&self, builder: RequestBuilder, path: &str) -> Result<u64, ControlPlaneError> {
        let id = self.start_task(builder, path).await?;
        debug!(task = id, path, "director task started");
        self.wait_task(id).await?;
        Ok(id)
    }
}

fn task_id_from_location(location: &str) -> Result<u64, ControlPlaneError> {
    location
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .and_then(|segment| segment.parse().ok())
        .ok_or_else(|| ControlPlaneError::decode(format!("no task id in Location {location:?}")))
}

fn parse_vm_infos(raw: &str) -> Result<Vec<VmInfo>, ControlPlaneError> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let wire: WireVmInfo = serde_json::from_str(line).map_err(ControlPlaneError::decode)?;
            Ok(VmInfo {
                job_name: wire.job_name.unwrap_or_default(),
                id: wire.id.unwrap_or_default(),
                process_state: wire.process_state,
                ips: wire.ips,
            })
        })
        .collect()
}

fn parse_ssh_hosts(raw: &str, target: &InstanceSelector) -> Result<Vec<SshHost>, ControlPlaneError> {
    let results: Vec<WireSshResult> =
        serde_json::from_str(raw.trim()).map_err(ControlPlaneError::decode)?;

    if let Some(failed) = results.iter().find(|r| r.status != "success") {
        return Err(ControlPlaneError::Ssh {
            target: target.to_string(),
            message: failed
                .error
                .clone()
                .unwrap_or_else(|| format!("status {:?}", failed.status)),
        });
    }

    Ok(results
        .into_iter()
        .filter_map(|r| {
            r.ip.map(|host| SshHost {
                host,
                index: r.index,
            })
        })
        .collect())
}

fn ssh_target(selector: &InstanceSelector) -> serde_json::Value {
    let indexes: Vec<&str> = selector.index().into_iter().collect();
    json!({
        "job": selector.group().unwrap_or_default(),
        "indexes": indexes,
        "ids": [],
    })
}

#[async_trait]
impl ControlPlane for DirectorClient {
    #[instrument(skip(self))]
    async fn find_deployment(&self, name: &str) -> Result<Arc<dyn Deployment>, ControlPlaneError> {
        let deployments: Vec<DeploymentSummary> = self.api.get_json("deployments").await?;
        if !deployments.iter().any(|d| d.name == name) {
            return Err(ControlPlaneError::DeploymentNotFound {
                name: name.to_string(),
            });
        }
        Ok(Arc::new(DirectorDeployment {
            api: Arc::clone(&self.api),
            name: name.to_string(),
        }))
    }
}

/// Deployment handle returned by [`DirectorClient::find_deployment`].
#[derive(Debug)]
struct DirectorDeployment {
    api: Arc<Api>,
    name: String,
}

#[async_trait]
impl Deployment for DirectorDeployment {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(deployment = %self.name))]
    async fn vm_infos(&self) -> Result<Vec<VmInfo>, ControlPlaneError> {
        let path = format!("deployments/{}/vms?format=full", self.name);
        let builder = self.api.request(Method::GET, &path).await?;
        let id = self.api.run_task(builder, &path).await?;
        parse_vm_infos(&self.api.task_result(id).await?)
    }

    #[instrument(skip(self), fields(deployment = %self.name))]
    async fn recreate(&self, selector: &InstanceSelector) -> Result<(), ControlPlaneError> {
        let current: DeploymentManifest = self
            .api
            .get_json(&format!("deployments/{}", self.name))
            .await?;

        let jobs = match (selector.group(), selector.index()) {
            (Some(group), Some(index)) => format!("{group}/{index}"),
            (Some(group), None) => group.to_string(),
            _ => "*".to_string(),
        };
        let path = format!("deployments/{}/jobs/{jobs}?state=recreate", self.name);
        let builder = self
            .api
            .request(Method::PUT, &path)
            .await?
            .header(CONTENT_TYPE, "text/yaml")
            .body(current.manifest);

        info!(selector = %selector, "recreating instances");
        self.api.run_task(builder, &path).await?;
        Ok(())
    }

    #[instrument(skip(self, opts), fields(deployment = %self.name, user = %opts.username))]
    async fn set_up_ssh(
        &self,
        selector: &InstanceSelector,
        opts: &SshOpts,
    ) -> Result<Vec<SshHost>, ControlPlaneError> {
        let path = format!("deployments/{}/ssh", self.name);
        let body = json!({
            "command": "setup",
            "deployment_name": self.name,
            "target": ssh_target(selector),
            "params": {
                "user": opts.username,
                "public_key": opts.public_key,
            },
        });
        let builder = self.api.request(Method::POST, &path).await?.json(&body);
        let id = self.api.run_task(builder, &path).await?;
        parse_ssh_hosts(&self.api.task_result(id).await?, selector)
    }

    #[instrument(skip(self, opts), fields(deployment = %self.name, user = %opts.username))]
    async fn clean_up_ssh(
        &self,
        selector: &InstanceSelector,
        opts: &SshOpts,
    ) -> Result<(), ControlPlaneError> {
        let path = format!("deployments/{}/ssh", self.name);
        let body = json!({
            "command": "cleanup",
            "deployment_name": self.name,
            "target": ssh_target(selector),
            "params": {
                "user_regex": format!("^{}", opts.username),
            },
        });
        let builder = self.api.request(Method::POST, &path).await?.json(&body);
        if let Err(error) = self.api.run_task(builder, &path).await {
            warn!(error = %error, selector = %selector, "ssh cleanup task failed");
            return Err(error);
        }
        Ok(())
    }
}
