//! Error types for the collaborator adapters.
//!
//! Each collaborator gets its own enum so the orchestrator can tell
//! infrastructure failures (store transport, director, fault injector,
//! remote shell) apart when it attaches phase context.

use std::time::Duration;

use thiserror::Error;

/// Errors returned by a [`StoreClient`](super::StoreClient).
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The operation did not finish within its per-call timeout.
    #[error("store {operation} of {key:?} timed out after {timeout:?}")]
    Timeout {
        /// Operation name (`put`, `range`, `deleterange`).
        operation: &'static str,
        /// Key the operation targeted.
        key: String,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// Connection-level failure (refused, reset, DNS, TLS handshake).
    #[error("transport error talking to {endpoint}: {message}")]
    Transport {
        /// Endpoint that failed.
        endpoint: String,
        /// Rendered source error.
        message: String,
    },

    /// The endpoint answered with a non-success status.
    #[error("HTTP {status} from {endpoint}")]
    Status {
        /// Endpoint that answered.
        endpoint: String,
        /// HTTP status code.
        status: u16,
    },

    /// The response body could not be decoded.
    #[error("could not decode store response: {message}")]
    Decode {
        /// What went wrong.
        message: String,
    },

    /// Client TLS material could not be loaded or applied.
    #[error("TLS setup failed: {message}")]
    Tls {
        /// What went wrong.
        message: String,
    },

    /// The client was built without any endpoint to talk to.
    #[error("no store endpoints configured")]
    NoEndpoints,
}

impl StoreError {
    /// Creates a timeout error.
    pub fn timeout(operation: &'static str, key: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation,
            key: key.into(),
            timeout,
        }
    }

    /// Creates a transport error.
    pub fn transport(endpoint: impl Into<String>, message: impl ToString) -> Self {
        Self::Transport {
            endpoint: endpoint.into(),
            message: message.to_string(),
        }
    }

    /// Creates a decode error.
    pub fn decode(message: impl ToString) -> Self {
        Self::Decode {
            message: message.to_string(),
        }
    }

    /// Creates a TLS setup error.
    pub fn tls(message: impl ToString) -> Self {
        Self::Tls {
            message: message.to_string(),
        }
    }

    /// Returns true when another endpoint might succeed where this one failed.
    #[must_use]
    pub fn is_failover(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

/// Errors returned by the control plane (deployment director).
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    /// Token exchange with the OAuth server failed.
    #[error("authentication against {url} failed: {message}")]
    Auth {
        /// Token endpoint.
        url: String,
        /// What went wrong.
        message: String,
    },

    /// HTTP-level failure talking to the director.
    #[error("director request {url} failed: {message}")]
    Request {
        /// Request URL.
        url: String,
        /// What went wrong.
        message: String,
    },

    /// Non-success status from the director.
    #[error("director returned HTTP {status} for {url}")]
    Status {
        /// Request URL.
        url: String,
        /// HTTP status code.
        status: u16,
    },

    /// Deployment lookup did not find the named deployment.
    #[error("deployment {name:?} not found")]
    DeploymentNotFound {
        /// Requested deployment name.
        name: String,
    },

    /// A director task finished in a non-success state.
    #[error("director task {id} finished in state {state:?}: {description}")]
    Task {
        /// Task id.
        id: u64,
        /// Final state (`error`, `cancelled`, `timeout`).
        state: String,
        /// Result text reported by the director.
        description: String,
    },

    /// Response payload could not be interpreted.
    #[error("unexpected director response: {message}")]
    Decode {
        /// What went wrong.
        message: String,
    },

    /// SSH setup reported a failure for one or more hosts.
    #[error("ssh setup failed for {target}: {message}")]
    Ssh {
        /// Instance the setup targeted.
        target: String,
        /// What went wrong.
        message: String,
    },
}

impl ControlPlaneError {
    /// Creates a request error.
    pub fn request(url: impl Into<String>, message: impl ToString) -> Self {
        Self::Request {
            url: url.into(),
            message: message.to_string(),
        }
    }

    /// Creates a decode error.
    pub fn decode(message: impl ToString) -> Self {
        Self::Decode {
            message: message.to_string(),
        }
    }
}

/// Errors returned by the fault injector.
#[derive(Debug, Error)]
pub enum FaultError {
    /// HTTP-level failure talking to the fault injector.
    #[error("fault injector request {url} failed: {message}")]
    Request {
        /// Request URL.
        url: String,
        /// What went wrong.
        message: String,
    },

    /// Non-success status from the fault injector.
    #[error("fault injector returned HTTP {status} for {url}")]
    Status {
        /// Request URL.
        url: String,
        /// HTTP status code.
        status: u16,
    },

    /// Response payload could not be interpreted.
    #[error("unexpected fault injector response: {message}")]
    Decode {
        /// What went wrong.
        message: String,
    },

    /// Client setup failed (bad CA, bad base URL).
    #[error("fault injector setup failed: {message}")]
    Setup {
        /// What went wrong.
        message: String,
    },
}

impl FaultError {
    /// Creates a request error.
    pub fn request(url: impl Into<String>, message: impl ToString) -> Self {
        Self::Request {
            url: url.into(),
            message: message.to_string(),
        }
    }

    /// Creates a decode error.
    pub fn decode(message: impl ToString) -> Self {
        Self::Decode {
            message: message.to_string(),
        }
    }
}

/// Errors returned by the remote command executor.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The local ssh tooling could not be started.
    #[error("could not launch {program}: {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Temporary key material could not be written or read.
    #[error("key file {path} unusable: {source}")]
    KeyFile {
        /// Key file path.
        path: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The remote command exited unsuccessfully.
    #[error("command {command:?} on {host} exited with {status}: {stderr}")]
    CommandFailed {
        /// Remote host.
        host: String,
        /// Command that ran.
        command: String,
        /// Rendered exit status.
        status: String,
        /// Captured standard error.
        stderr: String,
    },
}
