//! Backend clients and the per-credential client cache
//!
//! The executor talks to the time-series backend through [`MetricsBackend`].
//! Clients are built by a [`BackendFactory`] on first use of a credential and kept
//! in a [`ClientCache`] for the lifetime of the process.

use crate::definition::redact_credential;
use crate::error::ProviderError;
use crate::metrics::Metrics;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::Url;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

pub const DEFAULT_APP_NAME: &str = "custom-metrics-circonus-adapter";

const AUTH_TOKEN_HEADER: &str = "x-circonus-auth-token";
const APP_NAME_HEADER: &str = "x-circonus-app-name";
const CAQL_PATH: &str = "caql";

/// Windowed CAQL query parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaqlRequest {
    pub query: String,
    /// Sampling period in seconds.
    pub period: u64,
    /// Window start in epoch seconds.
    pub start: i64,
    /// Window end in epoch seconds.
    pub end: i64,
}

impl CaqlRequest {
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("period", self.period.to_string()),
            ("start", self.start.to_string()),
            ("end", self.end.to_string()),
            ("query", self.query.clone()),
        ]
    }
}

/// A client able to run CAQL queries under one credential
#[async_trait]
pub trait MetricsBackend: Send + Sync {
    /// Runs the query and returns the raw response body of a successful call.
    async fn query(&self, request: &CaqlRequest) -> Result<Vec<u8>, ProviderError>;
}

/// Builds backend clients for a credential
pub trait BackendFactory: Send + Sync {
    type Backend: MetricsBackend + 'static;

    fn build(&self, credential: &str, api_url: &str) -> Result<Self::Backend, ProviderError>;
}

/// HTTP client for the Circonus API
pub struct CirconusClient {
    http: reqwest::Client,
    caql_url: Url,
}

impl CirconusClient {
    pub fn new(
        api_url: &str,
        token: &str,
        app_name: &str,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        if token.trim().is_empty() {
            return Err(ProviderError::ClientConstruction {
                message: "API token must not be empty".to_string(),
            });
        }

        let caql_url = caql_url(api_url)?;

        let mut token_value =
            HeaderValue::from_str(token).map_err(|e| ProviderError::ClientConstruction {
                message: format!("Invalid API token format: {}", e),
            })?;
        token_value.set_sensitive(true);

        let app_value =
            HeaderValue::from_str(app_name).map_err(|e| ProviderError::ClientConstruction {
                message: format!("Invalid application name {:?}: {}", app_name, e),
            })?;

        let mut headers = HeaderMap::new();
        headers.insert(AUTH_TOKEN_HEADER, token_value);
        headers.insert(APP_NAME_HEADER, app_value);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::ClientConstruction {
                message: format!("Failed to build HTTP client: {}", e),
            })?;

        Ok(Self { http, caql_url })
    }

    pub fn caql_url(&self) -> &Url {
        &self.caql_url
    }
}

fn caql_url(api_url: &str) -> Result<Url, ProviderError> {
    let base = Url::parse(&format!("{}/", api_url.trim_end_matches('/'))).map_err(|e| {
        ProviderError::ClientConstruction {
            message: format!("Invalid API URL {}: {}", api_url, e),
        }
    })?;

    if base.scheme() != "http" && base.scheme() != "https" {
        return Err(ProviderError::ClientConstruction {
            message: format!(
                "Invalid API URL {}. Must start with http:// or https://",
                api_url
            ),
        });
    }

    base.join(CAQL_PATH)
        .map_err(|e| ProviderError::ClientConstruction {
            message: format!("Invalid API URL {}: {}", api_url, e),
        })
}

#[async_trait]
impl MetricsBackend for CirconusClient {
    async fn query(&self, request: &CaqlRequest) -> Result<Vec<u8>, ProviderError> {
        debug!(
            url = %self.caql_url,
            period = request.period,
            start = request.start,
            end = request.end,
            "Issuing CAQL query"
        );

        let response = self
            .http
            .get(self.caql_url.clone())
            .query(&request.query_pairs())
            .send()
            .await
            .map_err(|e| ProviderError::Transport {
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unable to read body>".to_string());
            return Err(ProviderError::BackendStatus {
                status: status.as_u16(),
                body,
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| ProviderError::Transport {
                message: format!("Failed to read response body: {}", e),
            })?;
        Ok(body.to_vec())
    }
}

/// Builds [`CirconusClient`]s sharing one application name and request timeout
#[derive(Debug, Clone)]
pub struct CirconusClientFactory {
    app_name: String,
    timeout: Duration,
}

impl CirconusClientFactory {
    pub fn new(app_name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            app_name: app_name.into(),
            timeout,
        }
    }
}

impl BackendFactory for CirconusClientFactory {
    type Backend = CirconusClient;

    fn build(&self, credential: &str, api_url: &str) -> Result<CirconusClient, ProviderError> {
        CirconusClient::new(api_url, credential, &self.app_name, self.timeout)
    }
}

/// Backend clients keyed by credential.
///
/// Entries are never evicted. A failed construction leaves no entry behind, so
/// the next request for the same credential tries again.
pub struct ClientCache<F: BackendFactory> {
    factory: F,
    clients: RwLock<HashMap<String, Arc<F::Backend>>>,
    metrics: Metrics,
}

impl<F: BackendFactory> ClientCache<F> {
    pub fn new(factory: F, metrics: Metrics) -> Self {
        Self {
            factory,
            clients: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// Returns the client for `credential`, building it on first use.
    ///
    /// Hits share a read lock. The write lock is held while building so
    /// concurrent first use of a credential constructs exactly one client.
    pub async fn get_or_create(
        &self,
        credential: &str,
        api_url: &str,
    ) -> Result<Arc<F::Backend>, ProviderError> {
        if let Some(client) = self.clients.read().await.get(credential) {
            return Ok(Arc::clone(client));
        }

        let mut clients = self.clients.write().await;
        if let Some(client) = clients.get(credential) {
            return Ok(Arc::clone(client));
        }

        let client = match self.factory.build(credential, api_url) {
            Ok(client) => Arc::new(client),
            Err(e) => {
                self.metrics
                    .record_client_created(false, &redact_credential(credential));
                return Err(e);
            }
        };

        clients.insert(credential.to_string(), Arc::clone(&client));
        self.metrics
            .record_client_created(true, &redact_credential(credential));
        Ok(client)
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }
}
