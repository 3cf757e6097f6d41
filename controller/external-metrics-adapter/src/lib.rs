//! External Metrics Adapter - resolves named external metrics into scalar values
//!
//! Query definitions arrive through live configuration documents that are polled
//! from a configuration source. Each definition maps an external metric name to a
//! CAQL statement, the credential used to run it and the time window to fetch.
//! Resolving a metric issues the windowed query against the Circonus API and
//! reduces the returned time series to one value.

pub mod client;
pub mod config;
pub mod definition;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod provider;
pub mod refresh;
pub mod series;
pub mod server;
pub mod source;
pub mod store;

pub use client::{
    BackendFactory, CaqlRequest, CirconusClient, CirconusClientFactory, ClientCache, MetricsBackend,
};
pub use config::Config;
pub use definition::{Aggregate, QueryDefinition};
pub use error::{ConfigError, ErrorKind, ProviderError};
pub use executor::{Clock, MilliQuantity, QueryExecutor, ResolvedMetric, SystemClock};
pub use metrics::Metrics;
pub use provider::{
    ExternalMetricInfo, ExternalMetricValue, ExternalMetricValueList, ExternalMetricsProvider,
    MetricsProvider,
};
pub use refresh::{RefreshHandle, RefreshLoop};
pub use series::TimeSeriesPoint;
pub use source::{
    ConfigObject, ConfigSource, DirectoryConfigSource, ObjectRef, SourceUpdate, StaticConfigSource,
};
pub use store::{ConfigSnapshot, ConfigStore, RefreshSummary};
