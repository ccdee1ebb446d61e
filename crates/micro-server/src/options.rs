//! Service configuration builder.

use crate::config::Settings;
use crate::docs::DocsOptions;
use crate::error::{Error, Result};
use crate::gateway::default_error_handler;
use crate::service::Service;
use crate::signals::{DEFAULT_SIGNALS, ShutdownSignal};
use crate::trace::noop_tracer;
use axum::Router;
use axum::http::request::Parts;
use axum::response::Response;
use opentelemetry::global::BoxedTracer;
use prometheus_client::registry::Registry;
use routing::Route;
use std::convert::Infallible;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tonic::Status;
use tonic::body::BoxBody;
use tonic::metadata::MetadataMap;
use tonic::server::NamedService;
use tonic::service::Routes;
use tonic::transport::{Endpoint, Server};
use tracing::Span;

/// Default bound on the HTTP part of a graceful stop.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Default grace period between "draining" and the listeners stopping.
pub const DEFAULT_PRE_SHUTDOWN_DELAY: Duration = Duration::from_secs(1);

/// RPC interceptor run on every call after the built-in layers.
pub type Interceptor =
    Arc<dyn Fn(tonic::Request<()>) -> std::result::Result<tonic::Request<()>, Status> + Send + Sync>;

/// Derives outgoing RPC metadata from an inbound HTTP request.
pub type Annotator = Arc<dyn Fn(&Parts) -> MetadataMap + Send + Sync>;

/// Renders a gateway error status as an HTTP response.
pub type ErrorHandler = Arc<dyn Fn(&Status) -> Response + Send + Sync>;

/// Wraps the gateway router, e.g. with extra middleware.
pub type HttpWrapper = Arc<dyn Fn(Router) -> Router + Send + Sync>;

/// Invoked once when the service has stopped.
pub type ShutdownCallback = Arc<dyn Fn() + Send + Sync>;

/// Options of the gateway's connection to the RPC listener.
///
/// The connection is always plaintext.
#[derive(Debug, Clone)]
pub struct DialOptions {
    pub connect_timeout: Option<Duration>,
    /// Per-request deadline.
    pub timeout: Option<Duration>,
    pub tcp_keepalive: Option<Duration>,
    pub tcp_nodelay: bool,
    pub http2_keep_alive_interval: Option<Duration>,
    pub concurrency_limit: Option<usize>,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            connect_timeout: None,
            timeout: None,
            tcp_keepalive: None,
            tcp_nodelay: true,
            http2_keep_alive_interval: None,
            concurrency_limit: None,
        }
    }
}

impl DialOptions {
    /// Endpoint for `uri` configured with these options.
    pub fn endpoint(&self, uri: String) -> Result<Endpoint> {
        let mut endpoint = Endpoint::from_shared(uri.clone())
            .map_err(|source| Error::Endpoint { uri, source })?;

        if let Some(timeout) = self.connect_timeout {
            endpoint = endpoint.connect_timeout(timeout);
        }
        if let Some(timeout) = self.timeout {
            endpoint = endpoint.timeout(timeout);
        }
        if let Some(interval) = self.http2_keep_alive_interval {
            endpoint = endpoint.http2_keep_alive_interval(interval);
        }
        if let Some(limit) = self.concurrency_limit {
            endpoint = endpoint.concurrency_limit(limit);
        }
        Ok(endpoint
            .tcp_keepalive(self.tcp_keepalive)
            .tcp_nodelay(self.tcp_nodelay))
    }
}

/// Transport options of the RPC listener.
#[derive(Debug, Clone, Default)]
pub struct RpcServerOptions {
    pub timeout: Option<Duration>,
    pub concurrency_limit_per_connection: Option<usize>,
    pub max_concurrent_streams: Option<u32>,
    pub http2_keepalive_interval: Option<Duration>,
    pub http2_keepalive_timeout: Option<Duration>,
}

impl RpcServerOptions {
    pub(crate) fn apply(&self, mut server: Server) -> Server {
        if let Some(timeout) = self.timeout {
            server = server.timeout(timeout);
        }
        if let Some(limit) = self.concurrency_limit_per_connection {
            server = server.concurrency_limit_per_connection(limit);
        }
        server
            .max_concurrent_streams(self.max_concurrent_streams)
            .http2_keepalive_interval(self.http2_keepalive_interval)
            .http2_keepalive_timeout(self.http2_keepalive_timeout)
    }
}

/// Frozen service descriptor.
pub(crate) struct ServiceConfig {
    pub(crate) routes: Vec<Route>,
    pub(crate) docs: DocsOptions,
    pub(crate) static_dir: Option<PathBuf>,
    pub(crate) interceptors: Vec<Interceptor>,
    pub(crate) annotators: Vec<Annotator>,
    pub(crate) error_handler: Option<ErrorHandler>,
    pub(crate) http_handler: Option<HttpWrapper>,
    pub(crate) on_shutdown: Option<ShutdownCallback>,
    pub(crate) shutdown_timeout: Duration,
    pub(crate) pre_shutdown_delay: Duration,
    pub(crate) signals: Vec<ShutdownSignal>,
    pub(crate) dial_options: DialOptions,
    pub(crate) rpc_server_options: RpcServerOptions,
    pub(crate) rpc_routes: Routes,
    pub(crate) reflection: bool,
    pub(crate) file_descriptor_sets: Vec<&'static [u8]>,
    pub(crate) logger: Span,
    pub(crate) tracer: BoxedTracer,
    pub(crate) metrics_registry: Option<Registry>,
    pub(crate) metrics_route: bool,
    pub(crate) bind_address: IpAddr,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            routes: Vec::new(),
            docs: DocsOptions::default(),
            static_dir: None,
            interceptors: Vec::new(),
            annotators: Vec::new(),
            error_handler: Some(Arc::new(default_error_handler)),
            http_handler: None,
            on_shutdown: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            pre_shutdown_delay: DEFAULT_PRE_SHUTDOWN_DELAY,
            signals: DEFAULT_SIGNALS.to_vec(),
            dial_options: DialOptions::default(),
            rpc_server_options: RpcServerOptions::default(),
            rpc_routes: Routes::default(),
            reflection: true,
            file_descriptor_sets: Vec::new(),
            logger: tracing::info_span!("micro"),
            tracer: noop_tracer(),
            metrics_registry: None,
            metrics_route: true,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("routes", &self.routes)
            .field("docs", &self.docs)
            .field("static_dir", &self.static_dir)
            .field("interceptors", &self.interceptors.len())
            .field("annotators", &self.annotators.len())
            .field("error_handler", &self.error_handler.is_some())
            .field("http_handler", &self.http_handler.is_some())
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("pre_shutdown_delay", &self.pre_shutdown_delay)
            .field("signals", &self.signals)
            .field("dial_options", &self.dial_options)
            .field("rpc_server_options", &self.rpc_server_options)
            .field("reflection", &self.reflection)
            .field("file_descriptor_sets", &self.file_descriptor_sets.len())
            .field("metrics_route", &self.metrics_route)
            .field("bind_address", &self.bind_address)
            .finish_non_exhaustive()
    }
}

/// Builder for a [`Service`].
///
/// Options apply in call order: scalar options keep the last value, list
/// options (routes, interceptors, annotators, signals added with
/// [`Builder::interrupt_signal`]) append.
///
/// # Example
///
/// ```no_run
/// use micro_server::{DocsOptions, Service};
/// use std::time::Duration;
///
/// let service = Service::builder()
///     .docs(DocsOptions::enabled())
///     .shutdown_timeout(Duration::from_secs(10))
///     .pre_shutdown_delay(Duration::ZERO)
///     .build();
/// ```
#[derive(Debug, Default)]
pub struct Builder {
    config: ServiceConfig,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Documentation page options.
    pub fn docs(mut self, docs: DocsOptions) -> Self {
        self.config.docs = docs;
        self
    }

    /// Directory served by the static fallback; defaults to the working directory.
    pub fn static_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.static_dir = Some(dir.into());
        self
    }

    /// Append an RPC interceptor.
    pub fn interceptor<F>(mut self, interceptor: F) -> Self
    where
        F: Fn(tonic::Request<()>) -> std::result::Result<tonic::Request<()>, Status>
            + Send
            + Sync
            + 'static,
    {
        self.config.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Append a gateway metadata annotator.
    pub fn annotator<F>(mut self, annotator: F) -> Self
    where
        F: Fn(&Parts) -> MetadataMap + Send + Sync + 'static,
    {
        self.config.annotators.push(Arc::new(annotator));
        self
    }

    /// Gateway error renderer; `None` renders errors as a bare HTTP status.
    pub fn error_handler(mut self, handler: Option<ErrorHandler>) -> Self {
        self.config.error_handler = handler;
        self
    }

    /// Router wrapper; `None` leaves the router unchanged.
    pub fn http_handler(mut self, wrapper: Option<HttpWrapper>) -> Self {
        self.config.http_handler = wrapper;
        self
    }

    /// Append a route served by the HTTP listener.
    pub fn route(mut self, route: Route) -> Self {
        self.config.routes.push(route);
        self
    }

    /// Append several routes.
    pub fn routes(mut self, routes: impl IntoIterator<Item = Route>) -> Self {
        self.config.routes.extend(routes);
        self
    }

    /// Callback invoked once the service has stopped.
    pub fn on_shutdown<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.config.on_shutdown = Some(Arc::new(callback));
        self
    }

    /// Bound on the HTTP part of a graceful stop.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Grace period after draining starts and before the listeners stop.
    pub fn pre_shutdown_delay(mut self, delay: Duration) -> Self {
        self.config.pre_shutdown_delay = delay;
        self
    }

    /// Add a shutdown signal to the watched set.
    pub fn interrupt_signal(mut self, signal: ShutdownSignal) -> Self {
        if !self.config.signals.contains(&signal) {
            self.config.signals.push(signal);
        }
        self
    }

    /// Replace the watched shutdown signals.
    pub fn signals(mut self, signals: impl IntoIterator<Item = ShutdownSignal>) -> Self {
        self.config.signals = signals.into_iter().collect();
        self
    }

    pub fn dial_options(mut self, options: DialOptions) -> Self {
        self.config.dial_options = options;
        self
    }

    pub fn rpc_server_options(mut self, options: RpcServerOptions) -> Self {
        self.config.rpc_server_options = options;
        self
    }

    /// Serve a tonic service on the RPC listener.
    pub fn rpc_service<S>(mut self, service: S) -> Self
    where
        S: tower::Service<
                axum::http::Request<BoxBody>,
                Response = axum::http::Response<BoxBody>,
                Error = Infallible,
            > + NamedService
            + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
    {
        self.config.rpc_routes = std::mem::take(&mut self.config.rpc_routes).add_service(service);
        self
    }

    /// Whether gRPC server reflection is served; on by default.
    pub fn reflection(mut self, enabled: bool) -> Self {
        self.config.reflection = enabled;
        self
    }

    /// Describe services to reflection clients with an encoded
    /// `FileDescriptorSet`, as produced by `tonic-build`.
    pub fn file_descriptor_set(mut self, encoded: &'static [u8]) -> Self {
        self.config.file_descriptor_sets.push(encoded);
        self
    }

    /// Span every orchestrator task is instrumented with.
    pub fn logger(mut self, span: Span) -> Self {
        self.config.logger = span;
        self
    }

    /// Tracer used for gateway server spans.
    pub fn tracer<T>(mut self, tracer: T) -> Self
    where
        T: opentelemetry::trace::Tracer + Send + Sync + 'static,
        T::Span: Send + Sync + 'static,
    {
        self.config.tracer = BoxedTracer::new(Box::new(tracer));
        self
    }

    /// Registry exposed on `/metrics`; the RPC metrics are added to it.
    pub fn metrics_registry(mut self, registry: Registry) -> Self {
        self.config.metrics_registry = Some(registry);
        self
    }

    /// Whether `/metrics` is served.
    pub fn metrics_route(mut self, enabled: bool) -> Self {
        self.config.metrics_route = enabled;
        self
    }

    /// Address both listeners bind to.
    pub fn bind_address(mut self, address: IpAddr) -> Self {
        self.config.bind_address = address;
        self
    }

    /// Apply a settings file.
    pub fn settings(mut self, settings: &Settings) -> Self {
        self.config.bind_address = settings.server.bind_address;
        self.config.shutdown_timeout = settings.shutdown.timeout;
        self.config.pre_shutdown_delay = settings.shutdown.pre_shutdown_delay;
        if !settings.shutdown.signals.is_empty() {
            self.config.signals = settings.shutdown.signals.clone();
        }
        if let Some(dir) = &settings.http.static_dir {
            self.config.static_dir = Some(dir.clone());
        }
        self.config.metrics_route = settings.http.metrics_route;
        self.config.docs = settings.docs.clone();
        self
    }

    /// Freeze the configuration.
    pub fn build(self) -> Service {
        Service::from_config(self.config)
    }
}
