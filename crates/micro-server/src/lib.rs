//! gRPC service host with an HTTP/JSON gateway.
//!
//! A [`Service`] runs two listeners in one process:
//!
//! - a gRPC server (tonic) with panic recovery, request validation, metrics
//!   and user interceptors
//! - an HTTP gateway serving `/metrics`, user routes, an optional API docs
//!   page, reverse-proxy routes registered at start, and a static file
//!   fallback
//!
//! Every gateway request carries an `X-Request-Id` footprint and W3C trace
//! context which are forwarded to the gRPC backends as metadata.
//!
//! # Components
//!
//! - **Builder**: freezes the configuration into a [`Service`]
//! - **Service**: lifecycle, signal handling and ordered graceful shutdown
//! - **Gateway**: route table dispatch with uniform error rendering
//! - **Trace**: request ids and trace context propagation

pub mod config;
pub mod docs;
pub mod error;
pub mod gateway;
mod http_server;
pub mod interceptors;
pub mod metrics;
pub mod options;
pub mod outcome;
mod rpc_server;
pub mod service;
pub mod signals;
pub mod telemetry;
pub mod trace;

pub use config::{ConfigError, Settings};
pub use docs::DocsOptions;
pub use error::{BoxError, Error, Listener, Result};
pub use gateway::{GatewayMux, OutgoingMetadata, default_error_handler, http_status};
pub use metrics::MetricsRegistry;
pub use options::{Builder, DialOptions, RpcServerOptions};
pub use routing::{PathParams, Pattern, Route};
pub use service::{Service, ServiceState};
pub use signals::ShutdownSignal;
pub use telemetry::{TelemetryGuard, init_telemetry};
pub use trace::{TraceContext, TracePropagator, X_REQUEST_ID, footprint_from_metadata};
