//! HTTP boundary serving the external metrics API

use crate::error::ProviderError;
use crate::provider::{MetricsProvider, EXTERNAL_METRICS_GROUP_VERSION};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

type SharedProvider = Arc<dyn MetricsProvider>;

/// Kubernetes-style failure body
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Status {
    kind: &'static str,
    api_version: &'static str,
    status: &'static str,
    message: String,
    reason: &'static str,
    code: u16,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiResource {
    name: String,
    singular_name: String,
    namespaced: bool,
    kind: &'static str,
    verbs: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiResourceList {
    kind: &'static str,
    api_version: &'static str,
    group_version: &'static str,
    resources: Vec<ApiResource>,
}

fn error_response(err: &ProviderError) -> Response {
    let code = err.status_code();
    let reason = match code {
        501 => "BadRequest",
        _ => "InternalError",
    };
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(Status {
            kind: "Status",
            api_version: "v1",
            status: "Failure",
            message: err.to_string(),
            reason,
            code,
        }),
    )
        .into_response()
}

/// Create the adapter router
pub fn create_app(provider: SharedProvider) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route(
            "/apis/external.metrics.k8s.io/v1beta1",
            get(list_external_metrics),
        )
        .route(
            "/apis/external.metrics.k8s.io/v1beta1/namespaces/:namespace/:metric",
            get(get_external_metric),
        )
        .route("/apis/custom.metrics.k8s.io/*path", any(custom_metric))
        .layer(TraceLayer::new_for_http())
        .with_state(provider)
}

async fn health_check() -> &'static str {
    "ok"
}

/// GET /apis/external.metrics.k8s.io/v1beta1
async fn list_external_metrics(State(provider): State<SharedProvider>) -> Response {
    let resources = provider
        .list_all_external_metrics()
        .await
        .into_iter()
        .map(|info| ApiResource {
            name: info.metric,
            singular_name: String::new(),
            namespaced: true,
            kind: "ExternalMetricValueList",
            verbs: vec!["get"],
        })
        .collect();

    Json(ApiResourceList {
        kind: "APIResourceList",
        api_version: "v1",
        group_version: EXTERNAL_METRICS_GROUP_VERSION,
        resources,
    })
    .into_response()
}

/// GET /apis/external.metrics.k8s.io/v1beta1/namespaces/:namespace/:metric
///
/// Label selectors in the query string are ignored.
async fn get_external_metric(
    State(provider): State<SharedProvider>,
    Path((namespace, metric)): Path<(String, String)>,
) -> Response {
    match provider.get_external_metric(&namespace, &metric).await {
        Ok(list) => Json(list).into_response(),
        Err(e) => {
            error!(namespace = %namespace, metric = %metric, error = %e, "Failed to resolve external metric");
            error_response(&e)
        }
    }
}

/// Any custom metrics path: `namespaces/<ns>/<resource>/<name>/<metric>`, where
/// a `*` name selects by label.
async fn custom_metric(
    State(provider): State<SharedProvider>,
    Path(path): Path<String>,
) -> Response {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let (namespace, resource, name, metric) = match segments.as_slice() {
        [_, "namespaces", namespace, resource, name, metric] => {
            (*namespace, *resource, *name, *metric)
        }
        [_, resource, name, metric] => ("", *resource, *name, *metric),
        _ => ("", "", "", ""),
    };

    let result = if name == "*" {
        provider
            .get_metric_by_selector(namespace, resource, metric)
            .await
    } else {
        provider
            .get_metric_by_name(namespace, resource, name, metric)
            .await
    };

    match result {
        Ok(list) => Json(list).into_response(),
        Err(e) => {
            warn!(path = %path, error = %e, "Rejected custom metrics request");
            error_response(&e)
        }
    }
}

/// Serve the adapter until `shutdown` resolves
pub async fn serve<S>(addr: SocketAddr, provider: SharedProvider, shutdown: S) -> anyhow::Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let app = create_app(provider);

    info!("Starting external metrics server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
