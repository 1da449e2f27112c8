//! etcd v3 JSON gateway client.
//!
//! Talks to the gRPC gateway that etcd exposes next to its gRPC port:
//! `POST {prefix}/kv/put`, `{prefix}/kv/range` and `{prefix}/kv/deleterange`,
//! with keys and values carried as base64 strings.
//!
//! Requests go to a pinned endpoint. On a connection-level failure the
//! client moves on to the next endpoint within the same call and re-pins
//! to whichever endpoint answered.

use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::{Certificate, Client, Identity};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::{KeyValue, StoreClient, StoreError};

/// Connect timeout for a single endpoint attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default API prefix of the gateway (etcd 3.4+).
pub const DEFAULT_GATEWAY_PREFIX: &str = "/v3";

/// Client TLS material, read from PEM files.
#[derive(Clone)]
pub struct TlsMaterial {
    ca_pem: Vec<u8>,
    cert_pem: Vec<u8>,
    key_pem: Vec<u8>,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial").finish_non_exhaustive()
    }
}

impl TlsMaterial {
    /// Reads CA, client certificate and client key PEM files.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Tls`] naming the file that could not be read.
    pub fn load(ca_path: &Path, cert_path: &Path, key_path: &Path) -> Result<Self, StoreError> {
        let read = |path: &Path| {
            std::fs::read(path)
                .map_err(|e| StoreError::tls(format!("reading {}: {e}", path.display())))
        };
        Ok(Self {
            ca_pem: read(ca_path)?,
            cert_pem: read(cert_path)?,
            key_pem: read(key_path)?,
        })
    }

    /// Builds material from in-memory PEM blobs.
    #[must_use]
    pub fn from_pem(ca_pem: Vec<u8>, cert_pem: Vec<u8>, key_pem: Vec<u8>) -> Self {
        Self {
            ca_pem,
            cert_pem,
            key_pem,
        }
    }
}

/// Store client over the etcd JSON gateway.
///
/// Cheap to clone; clones share the HTTP connection pool and pinned endpoint.
#[derive(Debug, Clone)]
pub struct GatewayStore {
    client: Client,
    endpoints: Arc<[String]>,
    prefix: String,
    pinned: Arc<AtomicUsize>,
}

#[derive(Serialize)]
struct PutRequest {
    key: String,
    value: String,
}

#[derive(Serialize)]
struct KeyRequest {
    key: String,
}

#[derive(Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<WireKeyValue>,
}

#[derive(Deserialize)]
struct WireKeyValue {
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: String,
}

impl GatewayStore {
    /// Creates a client for `endpoints` (e.g. `https://10.0.16.4:2379`).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NoEndpoints`] for an empty endpoint list and
    /// [`StoreError::Tls`] when the TLS material is rejected.
    pub fn new(
        endpoints: &[String],
        prefix: &str,
        tls: Option<&TlsMaterial>,
    ) -> Result<Self, StoreError> {
        if endpoints.is_empty() {
            return Err(StoreError::NoEndpoints);
        }

        let mut builder = Client::builder().connect_timeout(CONNECT_TIMEOUT);
        if let Some(tls) = tls {
            let ca = Certificate::from_pem(&tls.ca_pem).map_err(StoreError::tls)?;
            let mut identity_pem = tls.cert_pem.clone();
            identity_pem.push(b'\n');
            identity_pem.extend_from_slice(&tls.key_pem);
            let identity = Identity::from_pem(&identity_pem).map_err(StoreError::tls)?;
            builder = builder.add_root_certificate(ca).identity(identity);
        }
        let client = builder.build().map_err(StoreError::tls)?;

        debug!(endpoints = ?endpoints, prefix, "creating gateway store client");

        Ok(Self {
            client,
            endpoints: endpoints
                .iter()
                .map(|e| e.trim_end_matches('/').to_string())
                .collect(),
            prefix: format!("/{}", prefix.trim_matches('/')),
            pinned: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Returns a client restricted to `range` of this client's endpoints.
    ///
    /// Used to build the single-node and surviving-peers clients for
    /// targeted partitions. The HTTP connection pool is shared.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NoEndpoints`] when the range selects nothing.
    pub fn targeted(&self, range: Range<usize>) -> Result<Self, StoreError> {
        let selected = self.endpoints.get(range).unwrap_or_default();
        if selected.is_empty() {
            return Err(StoreError::NoEndpoints);
        }
        Ok(Self {
            client: self.client.clone(),
            endpoints: selected.into(),
            prefix: self.prefix.clone(),
            pinned: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Returns the endpoints this client talks to.
    #[must_use]
    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Sends one gateway call, bounded by `timeout` across all failover attempts.
    async fn call<B: Serialize + Sync>(
        &self,
        operation: &'static str,
        key: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<Vec<u8>, StoreError> {
        tokio::time::timeout(timeout, self.call_with_failover(operation, body))
            .await
            .map_err(|_| StoreError::timeout(operation, key, timeout))?
    }

    async fn call_with_failover<B: Serialize + Sync>(
        &self,
        operation: &'static str,
        body: &B,
    ) -> Result<Vec<u8>, StoreError> {
        let count = self.endpoints.len();
        let start = self.pinned.load(Ordering::SeqCst) % count;
        let mut last_error = StoreError::NoEndpoints;

        for offset in 0..count {
            let index = (start + offset) % count;
            let endpoint = &self.endpoints[index];
            match self.call_endpoint(endpoint, operation, body).await {
                Ok(bytes) => {
                    if index != start {
                        debug!(endpoint = %endpoint, "re-pinning store endpoint");
                        self.pinned.store(index, Ordering::SeqCst);
                    }
                    return Ok(bytes);
                }
                Err(error) if error.is_failover() => {
                    debug!(endpoint = %endpoint, error = %error, "endpoint unreachable, trying next");
                    last_error = error;
                }
                Err(error) => return Err(error),
            }
        }

        Err(last_error)
    }

    async fn call_endpoint<B: Serialize + Sync>(
        &self,
        endpoint: &str,
        operation: &'static str,
        body: &B,
    ) -> Result<Vec<u8>, StoreError> {
        let url = format!("{endpoint}{}/kv/{operation}", self.prefix);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| StoreError::transport(endpoint, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| StoreError::transport(endpoint, e))?;
        Ok(bytes.to_vec())
    }
}

fn encode(raw: &str) -> String {
    STANDARD.encode(raw.as_bytes())
}

fn decode(encoded: &str) -> Result<String, StoreError> {
    let bytes = STANDARD.decode(encoded).map_err(StoreError::decode)?;
    String::from_utf8(bytes).map_err(StoreError::decode)
}

#[async_trait]
impl StoreClient for GatewayStore {
    fn describe(&self) -> String {
        self.endpoints.join(",")
    }

    #[instrument(skip(self, value), fields(endpoints = %self.describe()))]
    async fn put(&self, key: &str, value: &str, timeout: Duration) -> Result<(), StoreError> {
        let body = PutRequest {
            key: encode(key),
            value: encode(value),
        };
        self.call("put", key, &body, timeout).await?;
        Ok(())
    }

    #[instrument(level = "trace", skip(self), fields(endpoints = %self.describe()))]
    async fn get(&self, key: &str, timeout: Duration) -> Result<Vec<KeyValue>, StoreError> {
        let body = KeyRequest { key: encode(key) };
        let bytes = self.call("range", key, &body, timeout).await?;
        let response: RangeResponse = serde_json::from_slice(&bytes).map_err(StoreError::decode)?;

        response
            .kvs
            .iter()
            .map(|kv| Ok(KeyValue::new(decode(&kv.key)?, decode(&kv.value)?)))
            .collect()
    }

    #[instrument(skip(self), fields(endpoints = %self.describe()))]
    async fn delete(&self, key: &str, timeout: Duration) -> Result<(), StoreError> {
        let body = KeyRequest { key: encode(key) };
        self.call("deleterange", key, &body, timeout).await?;
        Ok(())
    }
}
