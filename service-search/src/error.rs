//! Error types for service search

use std::time::Duration;
use thiserror::Error;

/// Result type alias for search operations
pub type Result<T> = std::result::Result<T, SearchError>;

/// Errors raised by the external collaborators of a search.
///
/// None of these reach subscribers; they only decide which branch of the
/// found/lost pipelines runs.
#[derive(Debug, Error)]
pub enum SearchError {
    /// Network-level failure talking to a service or directory
    #[error("Transport error for '{uri}': {reason}")]
    Transport { uri: String, reason: String },

    /// The operation did not complete in time
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Non-2xx answer
    #[error("Unexpected HTTP status {status} from '{uri}'")]
    HttpStatus { uri: String, status: u16 },

    /// Body did not parse into the expected document
    #[error("Malformed descriptor from '{uri}': {reason}")]
    MalformedDescriptor { uri: String, reason: String },

    /// The service browser could not start or died
    #[error("Browse failed for '{service_type}': {reason}")]
    Browse { service_type: String, reason: String },

    /// An advertised instance could not be resolved
    #[error("Failed to resolve '{instance}': {reason}")]
    Resolve { instance: String, reason: String },

    /// No service with this id turned up
    #[error("Service not found: {0}")]
    NotFound(String),

    /// The search task has gone away
    #[error("Service search is no longer running")]
    Closed,
}

impl SearchError {
    pub(crate) fn from_reqwest(uri: &str, timeout: Duration, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SearchError::Timeout(timeout)
        } else if err.is_decode() {
            SearchError::MalformedDescriptor {
                uri: uri.to_string(),
                reason: err.to_string(),
            }
        } else if let Some(status) = err.status() {
            SearchError::HttpStatus {
                uri: uri.to_string(),
                status: status.as_u16(),
            }
        } else {
            SearchError::Transport {
                uri: uri.to_string(),
                reason: err.to_string(),
            }
        }
    }
}
