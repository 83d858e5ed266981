//! # Error Types
//!
//! Typed errors for the operator. The variants mirror how failures are
//! handled: transient upstream problems are requeued with backoff, permanent
//! ones surface in status and wait for a spec change.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("upstream request failed: {0}")]
    UpstreamTransient(String),

    #[error("upstream rejected request: {0}")]
    UpstreamPermanent(String),

    #[error("invalid secrets scope: {0}")]
    InvalidScope(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("template '{key}' failed: {message}")]
    Template { key: String, message: String },

    #[error("operator is namespace scoped: {0}")]
    NamespaceScoped(String),
}

impl Error {
    /// True when retrying without a spec change can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Kube(_) | Error::UpstreamTransient(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::UpstreamTransient(err.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
