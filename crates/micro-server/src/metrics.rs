//! Prometheus metrics for the RPC listener and the `/metrics` route.

use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use routing::{PathParams, Route};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tonic::Status;
use tracing::warn;

/// Path the metrics route is served on.
pub const METRICS_PATH: &str = "/metrics";

/// Labels identifying one RPC method.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RpcLabels {
    pub grpc_service: String,
    pub grpc_method: String,
}

/// Labels for completed RPCs.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RpcResultLabels {
    pub grpc_service: String,
    pub grpc_method: String,
    /// gRPC status code name, e.g. `OK` or `NotFound`
    pub grpc_code: String,
}

/// Counters and histograms recorded by the RPC metrics layer.
///
/// Cheap to clone; all clones record into the same families.
#[derive(Clone)]
pub struct RpcMetrics {
    started_total: Family<RpcLabels, Counter>,
    handled_total: Family<RpcResultLabels, Counter>,
    handling_seconds: Family<RpcLabels, Histogram>,
}

impl RpcMetrics {
    fn register(registry: &mut Registry) -> Self {
        let started_total = Family::<RpcLabels, Counter>::default();
        registry.register(
            "grpc_server_started",
            "Total number of RPCs started on the server",
            started_total.clone(),
        );

        let handled_total = Family::<RpcResultLabels, Counter>::default();
        registry.register(
            "grpc_server_handled",
            "Total number of RPCs completed on the server, regardless of success or failure",
            handled_total.clone(),
        );

        // 1ms to ~16s
        let handling_seconds = Family::<RpcLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.001, 2.0, 15))
        });
        registry.register(
            "grpc_server_handling_seconds",
            "Response latency of RPCs handled by the server",
            handling_seconds.clone(),
        );

        Self {
            started_total,
            handled_total,
            handling_seconds,
        }
    }

    /// Record the start of an RPC.
    pub fn record_started(&self, service: &str, method: &str) {
        self.started_total
            .get_or_create(&RpcLabels {
                grpc_service: service.to_string(),
                grpc_method: method.to_string(),
            })
            .inc();
    }

    /// Record a completed RPC with its status code and latency.
    pub fn record_handled(&self, service: &str, method: &str, code: tonic::Code, elapsed: Duration) {
        self.handled_total
            .get_or_create(&RpcResultLabels {
                grpc_service: service.to_string(),
                grpc_method: method.to_string(),
                grpc_code: format!("{code:?}"),
            })
            .inc();
        self.handling_seconds
            .get_or_create(&RpcLabels {
                grpc_service: service.to_string(),
                grpc_method: method.to_string(),
            })
            .observe(elapsed.as_secs_f64());
    }
}

impl fmt::Debug for RpcMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcMetrics").finish_non_exhaustive()
    }
}

/// Metrics registry exposed on the `/metrics` route.
pub struct MetricsRegistry {
    /// Prometheus registry
    pub registry: Registry,
    rpc: RpcMetrics,
}

impl MetricsRegistry {
    /// Create a registry holding only the RPC metrics.
    pub fn new() -> Self {
        Self::with_registry(Registry::default())
    }

    /// Register the RPC metrics into a caller-supplied registry.
    pub fn with_registry(mut registry: Registry) -> Self {
        let rpc = RpcMetrics::register(&mut registry);
        Self { registry, rpc }
    }

    /// Handle for recording RPC metrics.
    pub fn rpc(&self) -> RpcMetrics {
        self.rpc.clone()
    }

    /// Encode every registered metric in the Prometheus text format.
    pub fn encode(&self) -> Result<String, fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsRegistry").finish_non_exhaustive()
    }
}

/// `GET /metrics` route serving `registry`.
pub fn metrics_route(registry: Arc<MetricsRegistry>) -> Route {
    Route::new(Method::GET, METRICS_PATH, move |_req, _params: PathParams| {
        let registry = Arc::clone(&registry);
        async move { Ok::<_, Status>(render_metrics(&registry)) }
    })
}

fn render_metrics(registry: &MetricsRegistry) -> Response {
    match registry.encode() {
        Ok(buffer) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            buffer,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
                .into_response()
        }
    }
}
