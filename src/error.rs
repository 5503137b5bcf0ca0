//! Error types for Hypnos

use thiserror::Error;

/// Main error type for Hypnos operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// I/O error (listener binding, connection handling)
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// No opted-in service is addressable by the requested host
    #[error("no application found for host {0}")]
    UnknownHost(String),

    /// A workload did not produce a ready replica within the activation window
    #[error("timed out waiting for activation of {kind} {namespace}/{name}")]
    ActivationTimeout {
        /// Workload kind (deployment or statefulset)
        kind: &'static str,
        /// Workload namespace
        namespace: String,
        /// Workload name
        name: String,
    },

    /// A connection could not be classified as HTTP or TLS
    #[error("connection not recognized as being used for HTTP or TLS")]
    UnrecognizedProtocol,

    /// Invalid or missing configuration (annotations, scraper config)
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Proxying a connection or request failed
    #[error("proxy error: {0}")]
    Proxy(String),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a proxy error with the given message
    pub fn proxy(msg: impl Into<String>) -> Self {
        Self::Proxy(msg.into())
    }
}
