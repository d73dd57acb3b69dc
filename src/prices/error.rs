//! Error types for refresh cycles and their collaborators.
//!
//! Collaborator errors ([`UpstreamError`], [`PersistenceError`]) know whether they are
//! transient so the retry policy can decide whether another attempt is worthwhile.
//! [`RefreshError`] is what a failed cycle reports to its caller; none of its variants
//! are fatal, the cache keeps serving the last good snapshot.

use serde::Serialize;
use thiserror::Error;

use super::AssetClass;

/// Failure talking to the upstream price provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    /// The request did not complete within the per-call timeout.
    #[error("Timeout after {secs}s: {provider}")]
    Timeout { provider: String, secs: u64 },

    /// The provider answered with a non-success HTTP status.
    #[error("HTTP {status} from {provider}")]
    Status { provider: String, status: u16 },

    /// Connection-level failure (DNS, refused, reset).
    #[error("Network error from {provider}: {message}")]
    Network { provider: String, message: String },

    /// The response body could not be decoded.
    #[error("Undecodable response from {provider}: {message}")]
    Decode { provider: String, message: String },

    /// The response decoded but carried nothing usable for the class.
    #[error("No data for {class} from {provider}")]
    MissingData { provider: String, class: AssetClass },
}

impl UpstreamError {
    /// Timeouts, 5xx, 429 and network failures are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Network { .. } => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::Decode { .. } | Self::MissingData { .. } => false,
        }
    }
}

/// Failure writing to or reading from the history store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("Storage I/O failed: {0}")]
    Io(String),

    #[error("Storage serialization failed: {0}")]
    Serialization(String),

    #[error("Storage call timed out after {secs}s")]
    Timeout { secs: u64 },
}

impl PersistenceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Timeout { .. })
    }
}

impl From<std::io::Error> for PersistenceError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Stores build their errors with `anyhow` context; the root cause picks the variant.
impl From<anyhow::Error> for PersistenceError {
    fn from(err: anyhow::Error) -> Self {
        let message = format!("{err:#}");
        if err.downcast_ref::<serde_json::Error>().is_some() {
            Self::Serialization(message)
        } else {
            Self::Io(message)
        }
    }
}

/// Why a refresh cycle for one class failed.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RefreshError {
    /// Provider kept failing until the retry budget ran out (or its circuit is open).
    #[error("Upstream unavailable for {class} after {attempts} attempt(s): {message}")]
    UpstreamUnavailable {
        class: AssetClass,
        attempts: u32,
        message: String,
    },

    /// The whole batch was rejected by validation.
    #[error("Malformed upstream data for {class}: {message}")]
    MalformedUpstreamData { class: AssetClass, message: String },

    /// History could not be written; the cache was not advanced.
    #[error("Persistence failure for {class}: {message}")]
    PersistenceFailure { class: AssetClass, message: String },

    /// The cycle exceeded its overall time bound.
    #[error("Refresh of {class} timed out after {timeout_secs}s")]
    RefreshTimeout { class: AssetClass, timeout_secs: u64 },
}

impl RefreshError {
    pub fn class(&self) -> AssetClass {
        match self {
            Self::UpstreamUnavailable { class, .. }
            | Self::MalformedUpstreamData { class, .. }
            | Self::PersistenceFailure { class, .. }
            | Self::RefreshTimeout { class, .. } => *class,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::UpstreamUnavailable { .. } => "upstream_unavailable",
            Self::MalformedUpstreamData { .. } => "malformed_upstream_data",
            Self::PersistenceFailure { .. } => "persistence_failure",
            Self::RefreshTimeout { .. } => "refresh_timeout",
        }
    }

    /// Whether this failure counts against the provider's circuit breaker.
    pub fn is_upstream_fault(&self) -> bool {
        matches!(
            self,
            Self::UpstreamUnavailable { .. } | Self::RefreshTimeout { .. }
        )
    }
}
