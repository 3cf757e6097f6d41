//! Metrics provider facade in the external metrics API shape
//!
//! Only external metrics are served. Object-scoped custom metric lookups are
//! rejected as not implemented.

use crate::client::BackendFactory;
use crate::error::ProviderError;
use crate::executor::{MilliQuantity, QueryExecutor, ResolvedMetric};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

pub const EXTERNAL_METRICS_GROUP_VERSION: &str = "external.metrics.k8s.io/v1beta1";

#[derive(Debug, Clone, Default, Serialize)]
pub struct ListMeta {}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalMetricValue {
    pub metric_name: String,
    pub metric_labels: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
    pub value: MilliQuantity,
}

impl From<ResolvedMetric> for ExternalMetricValue {
    fn from(metric: ResolvedMetric) -> Self {
        Self {
            metric_name: metric.metric_name,
            metric_labels: BTreeMap::new(),
            timestamp: metric.timestamp,
            value: metric.value,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalMetricValueList {
    pub kind: &'static str,
    pub api_version: &'static str,
    pub metadata: ListMeta,
    pub items: Vec<ExternalMetricValue>,
}

impl ExternalMetricValueList {
    pub fn new(items: Vec<ExternalMetricValue>) -> Self {
        Self {
            kind: "ExternalMetricValueList",
            api_version: EXTERNAL_METRICS_GROUP_VERSION,
            metadata: ListMeta::default(),
            items,
        }
    }
}

/// Catalog entry for one configured external metric
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExternalMetricInfo {
    pub metric: String,
}

/// Operations the adapter boundary dispatches to
#[async_trait]
pub trait MetricsProvider: Send + Sync {
    /// Current value of an external metric; an unknown metric yields an empty list.
    async fn get_external_metric(
        &self,
        namespace: &str,
        metric: &str,
    ) -> Result<ExternalMetricValueList, ProviderError>;

    async fn list_all_external_metrics(&self) -> Vec<ExternalMetricInfo>;

    /// Metric of a single named object.
    async fn get_metric_by_name(
        &self,
        namespace: &str,
        resource: &str,
        name: &str,
        metric: &str,
    ) -> Result<ExternalMetricValueList, ProviderError>;

    /// Metric of every object matching a label selector.
    async fn get_metric_by_selector(
        &self,
        namespace: &str,
        resource: &str,
        metric: &str,
    ) -> Result<ExternalMetricValueList, ProviderError>;
}

/// [`MetricsProvider`] backed by a [`QueryExecutor`]
pub struct ExternalMetricsProvider<F: BackendFactory> {
    executor: QueryExecutor<F>,
}

impl<F: BackendFactory> ExternalMetricsProvider<F> {
    pub fn new(executor: QueryExecutor<F>) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &QueryExecutor<F> {
        &self.executor
    }
}

#[async_trait]
impl<F: BackendFactory + 'static> MetricsProvider for ExternalMetricsProvider<F> {
    async fn get_external_metric(
        &self,
        namespace: &str,
        metric: &str,
    ) -> Result<ExternalMetricValueList, ProviderError> {
        let resolved = self.executor.resolve(namespace, metric).await?;
        Ok(ExternalMetricValueList::new(
            resolved.into_iter().map(ExternalMetricValue::from).collect(),
        ))
    }

    async fn list_all_external_metrics(&self) -> Vec<ExternalMetricInfo> {
        self.executor
            .list_known_metrics()
            .await
            .into_iter()
            .map(|metric| ExternalMetricInfo { metric })
            .collect()
    }

    async fn get_metric_by_name(
        &self,
        _namespace: &str,
        _resource: &str,
        _name: &str,
        _metric: &str,
    ) -> Result<ExternalMetricValueList, ProviderError> {
        Err(ProviderError::not_implemented(
            "GetMetricByName not supported at this time",
        ))
    }

    async fn get_metric_by_selector(
        &self,
        _namespace: &str,
        _resource: &str,
        _metric: &str,
    ) -> Result<ExternalMetricValueList, ProviderError> {
        Err(ProviderError::not_implemented(
            "GetMetricBySelector not supported at this time",
        ))
    }
}
