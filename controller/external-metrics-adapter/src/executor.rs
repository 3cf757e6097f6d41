//! Resolution of external metric names into single values

use crate::client::{BackendFactory, CaqlRequest, ClientCache, MetricsBackend};
use crate::error::ProviderError;
use crate::metrics::Metrics;
use crate::series::{average_points, decode_series};
use crate::store::{metric_key, ConfigStore};
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Source of "now" for query windows
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Fixed-point value in thousandths of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct MilliQuantity(i64);

impl MilliQuantity {
    /// Scales by 1000 and truncates toward zero. Out-of-range values saturate and
    /// NaN maps to zero.
    pub fn from_f64(value: f64) -> Self {
        MilliQuantity((value * 1000.0) as i64)
    }

    pub fn from_millis(millis: i64) -> Self {
        MilliQuantity(millis)
    }

    pub fn millis(&self) -> i64 {
        self.0
    }

    pub fn as_f64(&self) -> f64 {
        self.0 as f64 / 1000.0
    }
}

/// Renders in Kubernetes quantity notation: `5` for whole units, `5500m` otherwise.
impl fmt::Display for MilliQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % 1000 == 0 {
            write!(f, "{}", self.0 / 1000)
        } else {
            write!(f, "{}m", self.0)
        }
    }
}

impl Serialize for MilliQuantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Value of one external metric as of the latest contributing point
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedMetric {
    pub metric_name: String,
    pub timestamp: DateTime<Utc>,
    pub value: MilliQuantity,
    /// Points that contributed to `value`
    pub points: usize,
}

/// Looks up query definitions and runs them against the backend.
pub struct QueryExecutor<F: BackendFactory> {
    store: ConfigStore,
    clients: Arc<ClientCache<F>>,
    api_url: String,
    query_timeout: Duration,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
}

impl<F: BackendFactory> QueryExecutor<F> {
    pub fn new(
        store: ConfigStore,
        clients: Arc<ClientCache<F>>,
        api_url: impl Into<String>,
        query_timeout: Duration,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            clients,
            api_url: api_url.into(),
            query_timeout,
            clock: Arc::new(SystemClock),
            metrics,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    /// Resolves with the default query timeout.
    pub async fn resolve(
        &self,
        namespace: &str,
        external_name: &str,
    ) -> Result<Vec<ResolvedMetric>, ProviderError> {
        self.resolve_within(namespace, external_name, self.query_timeout)
            .await
    }

    /// Resolves `namespace/external_name`, abandoning the backend query after
    /// `deadline`.
    ///
    /// An unknown metric yields an empty list rather than an error. Backend
    /// failures are returned as-is; nothing is retried here.
    pub async fn resolve_within(
        &self,
        namespace: &str,
        external_name: &str,
        deadline: Duration,
    ) -> Result<Vec<ResolvedMetric>, ProviderError> {
        let key = metric_key(namespace, external_name);
        let result = self.run(namespace, external_name, deadline).await;

        match &result {
            Ok(Some(resolved)) => self.metrics.record_resolution(&key, resolved.points),
            Ok(None) => self.metrics.record_not_found(&key),
            Err(e) => self.metrics.record_resolution_error(e.kind().as_str(), &key),
        }

        result.map(|resolved| resolved.into_iter().collect())
    }

    async fn run(
        &self,
        namespace: &str,
        external_name: &str,
        deadline: Duration,
    ) -> Result<Option<ResolvedMetric>, ProviderError> {
        let Some(definition) = self.store.lookup(namespace, external_name).await else {
            debug!(namespace = %namespace, metric = %external_name, "No query configured for metric");
            return Ok(None);
        };

        let end_time = self.clock.now();
        let end = end_time.timestamp();
        let request = CaqlRequest {
            query: definition.query_text.clone(),
            period: definition.stride.as_secs(),
            start: end.saturating_sub(duration_secs(definition.window)),
            end,
        };

        let client = self
            .clients
            .get_or_create(&definition.credential_id, &self.api_url)
            .await?;

        info!(
            namespace = %namespace,
            metric = %external_name,
            query = %request.query,
            start = request.start,
            end = request.end,
            period = request.period,
            "Running CAQL query"
        );

        let body = tokio::time::timeout(deadline, client.query(&request))
            .await
            .map_err(|_| ProviderError::Timeout { timeout: deadline })??;

        let points = decode_series(&body)?;
        let end_seconds = end_time.timestamp_millis() as f64 / 1000.0;
        // Averaged regardless of the configured aggregate.
        let reduction = average_points(&points, end_seconds)?;

        let timestamp = DateTime::<Utc>::from_timestamp(reduction.timestamp as i64, 0)
            .ok_or_else(|| ProviderError::MalformedResponse {
                message: format!("timestamp {} out of range", reduction.timestamp),
            })?;

        debug!(
            metric = %external_name,
            points = reduction.count,
            value = reduction.value,
            "Reduced time series"
        );

        Ok(Some(ResolvedMetric {
            metric_name: definition.external_name,
            timestamp,
            value: MilliQuantity::from_f64(reduction.value),
            points: reduction.count,
        }))
    }

    /// Keys of every metric currently configured
    pub async fn list_known_metrics(&self) -> Vec<String> {
        self.store.list_names().await
    }
}

fn duration_secs(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}
