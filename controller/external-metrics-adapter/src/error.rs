//! Error types for configuration parsing and metric resolution

use std::time::Duration;
use thiserror::Error;

/// Failure to turn a configuration document into query definitions.
///
/// Always scoped to one configuration object; the refresh loop logs it and
/// moves on to the next object.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration document parsing failed: {message}")]
    ParseFailed { message: String },

    #[error("Invalid query definition '{external_name}': {message}")]
    InvalidQuery {
        external_name: String,
        message: String,
    },
}

/// Broad classification of a [`ProviderError`], used to pick the status code at
/// the adapter boundary and to label recorded failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ClientConstruction,
    Backend,
    DataShape,
    NotImplemented,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ClientConstruction => "client_construction",
            ErrorKind::Backend => "backend",
            ErrorKind::DataShape => "data_shape",
            ErrorKind::NotImplemented => "not_implemented",
        }
    }
}

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Failed to construct backend client: {message}")]
    ClientConstruction { message: String },

    #[error("Backend request failed: {message}")]
    Transport { message: String },

    #[error("Backend returned error status {status}: {body}")]
    BackendStatus { status: u16, body: String },

    #[error("Backend query did not complete within {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Circonus response missing _data field")]
    MissingData,

    #[error("Empty time series returned from Circonus CAQL query")]
    EmptySeries,

    #[error("No datapoints found in time series")]
    NoDatapoints,

    #[error("Timeseries from Circonus has incorrect end time: point at {timestamp} is after {end}")]
    FutureDatapoint { timestamp: f64, end: f64 },

    #[error("Malformed Circonus response: {message}")]
    MalformedResponse { message: String },

    #[error("Operation: {operation:?} is not implemented")]
    NotImplemented { operation: String },
}

impl ProviderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::ClientConstruction { .. } => ErrorKind::ClientConstruction,
            ProviderError::Transport { .. }
            | ProviderError::BackendStatus { .. }
            | ProviderError::Timeout { .. } => ErrorKind::Backend,
            ProviderError::MissingData
            | ProviderError::EmptySeries
            | ProviderError::NoDatapoints
            | ProviderError::FutureDatapoint { .. }
            | ProviderError::MalformedResponse { .. } => ErrorKind::DataShape,
            ProviderError::NotImplemented { .. } => ErrorKind::NotImplemented,
        }
    }

    /// HTTP status code reported to callers of the adapter.
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::NotImplemented => 501,
            _ => 500,
        }
    }

    pub fn not_implemented(operation: impl Into<String>) -> Self {
        ProviderError::NotImplemented {
            operation: operation.into(),
        }
    }
}
