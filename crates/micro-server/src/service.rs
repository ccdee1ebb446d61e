//! Service orchestrator.
//!
//! A [`Service`] owns two listeners: the gRPC server and the HTTP gateway in
//! front of it. [`Service::start`] runs both until one of them fails, one of
//! the watched signals arrives, or [`Service::interrupt`] is called.
//! [`Service::stop`] drains the service in a fixed order:
//!
//! 1. state becomes [`ServiceState::Draining`] and HTTP keep-alive is turned off
//! 2. the pre-shutdown delay elapses
//! 3. the gRPC listener stops gracefully
//! 4. the HTTP listener stops gracefully, bounded by the shutdown timeout
//! 5. the shutdown callback runs and state becomes [`ServiceState::Stopped`]

use crate::docs::docs_route;
use crate::error::{BoxError, Error, Listener, Result};
use crate::gateway::{Gateway, GatewayMux, static_fallback};
use crate::http_server::{HttpControl, HttpServer, build_router};
use crate::interceptors::{InterceptorChain, panic_message};
use crate::metrics::{MetricsRegistry, metrics_route};
use crate::options::{Builder, ServiceConfig};
use crate::outcome::{FirstOutcome, first_outcome};
use crate::rpc_server::RpcServer;
use crate::signals::{ShutdownSignal, SignalWatcher};
use crate::trace::{TracePropagator, noop_tracer, trace_annotator};
use futures::FutureExt;
use parking_lot::Mutex;
use routing::Route;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{OnceCell, watch};
use tokio_util::sync::CancellationToken;
use tonic::service::Routes;
use tonic::transport::Endpoint;
use tracing::{Instrument, Span, debug, error, info, warn};

/// Lifecycle of a [`Service`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceState {
    Created,
    Configured,
    Starting,
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::Created => "created",
            ServiceState::Configured => "configured",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Draining => "draining",
            ServiceState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerStatus {
    Idle,
    Launching,
    Serving(SocketAddr),
    Finished,
}

impl ListenerStatus {
    fn addr(&self) -> Option<SocketAddr> {
        match self {
            ListenerStatus::Serving(addr) => Some(*addr),
            _ => None,
        }
    }

    fn is_done(&self) -> bool {
        matches!(self, ListenerStatus::Idle | ListenerStatus::Finished)
    }
}

#[derive(Debug)]
enum Trigger {
    Signal(ShutdownSignal),
    Interrupt,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Signal(signal) => write!(f, "{signal}"),
            Trigger::Interrupt => f.write_str("interrupt"),
        }
    }
}

#[derive(Debug)]
enum Outcome {
    Failed(Error),
    Interrupted(Trigger),
    Finished(Listener),
}

/// A gRPC service with an HTTP gateway.
///
/// Cloning is cheap; every clone controls the same service.
#[derive(Clone)]
pub struct Service {
    inner: Arc<Inner>,
}

struct Inner {
    config: ServiceConfig,
    rpc_routes: Mutex<Option<Routes>>,
    extra_routes: Mutex<Vec<Route>>,
    metrics: Arc<MetricsRegistry>,
    propagator: Arc<TracePropagator>,
    state: watch::Sender<ServiceState>,
    rpc: watch::Sender<ListenerStatus>,
    http: watch::Sender<ListenerStatus>,
    rpc_shutdown: CancellationToken,
    http_control: Arc<HttpControl>,
    interrupt: CancellationToken,
    stopped: OnceCell<()>,
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("state", &self.state())
            .field("rpc", &*self.inner.rpc.borrow())
            .field("http", &*self.inner.http.borrow())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Service {
    /// Start configuring a service.
    pub fn builder() -> Builder {
        Builder::new()
    }

    pub(crate) fn from_config(mut config: ServiceConfig) -> Self {
        let metrics = match config.metrics_registry.take() {
            Some(registry) => MetricsRegistry::with_registry(registry),
            None => MetricsRegistry::new(),
        };
        let tracer = std::mem::replace(&mut config.tracer, noop_tracer());
        let rpc_routes = std::mem::take(&mut config.rpc_routes);

        let (state, _) = watch::channel(ServiceState::Created);
        let (rpc, _) = watch::channel(ListenerStatus::Idle);
        let (http, _) = watch::channel(ListenerStatus::Idle);

        let inner = Inner {
            config,
            rpc_routes: Mutex::new(Some(rpc_routes)),
            extra_routes: Mutex::new(Vec::new()),
            metrics: Arc::new(metrics),
            propagator: Arc::new(TracePropagator::new(tracer)),
            state,
            rpc,
            http,
            rpc_shutdown: CancellationToken::new(),
            http_control: Arc::new(HttpControl::new()),
            interrupt: CancellationToken::new(),
            stopped: OnceCell::new(),
        };
        inner.state.send_replace(ServiceState::Configured);

        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn state(&self) -> ServiceState {
        *self.inner.state.borrow()
    }

    /// Bound address of the gRPC listener while it is serving.
    pub fn rpc_addr(&self) -> Option<SocketAddr> {
        self.inner.rpc.borrow().addr()
    }

    /// Bound address of the HTTP listener while it is serving.
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.inner.http.borrow().addr()
    }

    /// Metrics registry served on `/metrics`.
    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.inner.metrics
    }

    pub fn pid(&self) -> u32 {
        std::process::id()
    }

    /// Add HTTP routes before the service starts.
    ///
    /// Returns `false` and leaves the route table untouched once `start` has
    /// been called.
    pub fn add_routes(&self, routes: impl IntoIterator<Item = Route>) -> bool {
        let mut extra = self.inner.extra_routes.lock();
        let state = self.state();
        if state != ServiceState::Configured {
            warn!(%state, "Routes added after start are ignored");
            return false;
        }
        extra.extend(routes);
        true
    }

    /// Ask a running `start` to stop, as if a shutdown signal arrived.
    pub fn interrupt(&self) {
        self.inner.interrupt.cancel();
    }

    /// Wait until both listeners are serving.
    ///
    /// Returns `None` if the service fails or begins draining first.
    pub async fn wait_until_running(&self) -> Option<(SocketAddr, SocketAddr)> {
        let mut state = self.inner.state.subscribe();
        let mut rpc = self.inner.rpc.subscribe();
        let mut http = self.inner.http.subscribe();

        loop {
            match *state.borrow_and_update() {
                ServiceState::Running => {
                    return self.rpc_addr().zip(self.http_addr());
                }
                ServiceState::Draining | ServiceState::Stopped => return None,
                _ => {}
            }
            if *rpc.borrow_and_update() == ListenerStatus::Finished
                || *http.borrow_and_update() == ListenerStatus::Finished
            {
                return None;
            }

            tokio::select! {
                _ = state.changed() => {}
                _ = rpc.changed() => {}
                _ = http.changed() => {}
            }
        }
    }

    /// Run the service until it fails or is asked to stop.
    ///
    /// `registrar` receives the gateway mux and an endpoint for the gRPC
    /// listener; it registers the reverse-proxy routes. Listener failures
    /// are returned as is. A signal, [`interrupt`](Self::interrupt) or an
    /// external [`stop`](Self::stop) drains the service and returns `Ok`.
    pub async fn start<F>(&self, http_port: u16, rpc_port: u16, registrar: F) -> Result<()>
    where
        F: FnOnce(&mut GatewayMux, Endpoint) -> std::result::Result<(), BoxError> + Send + 'static,
    {
        let span = self.inner.config.logger.clone();
        self.run(http_port, rpc_port, registrar).instrument(span).await
    }

    async fn run<F>(&self, http_port: u16, rpc_port: u16, registrar: F) -> Result<()>
    where
        F: FnOnce(&mut GatewayMux, Endpoint) -> std::result::Result<(), BoxError> + Send + 'static,
    {
        let mut watcher = SignalWatcher::register(&self.inner.config.signals)?;
        if !self
            .inner
            .transition(ServiceState::Configured, ServiceState::Starting)
        {
            return Err(Error::AlreadyStarted);
        }
        info!(pid = self.pid(), http_port, rpc_port, "Starting service");

        self.inner.rpc.send_replace(ListenerStatus::Launching);
        self.inner.http.send_replace(ListenerStatus::Launching);

        let (reporter, outcome) = first_outcome();
        let span = Span::current();

        tokio::spawn(
            Arc::clone(&self.inner)
                .run_rpc(rpc_port, reporter.clone())
                .instrument(span.clone()),
        );
        tokio::spawn(
            Arc::clone(&self.inner)
                .run_http(http_port, rpc_port, registrar, reporter.clone())
                .instrument(span.clone()),
        );

        let interrupt = self.inner.interrupt.clone();
        let watcher_task = tokio::spawn(
            async move {
                let trigger = tokio::select! {
                    signal = watcher.recv() => Trigger::Signal(signal),
                    _ = interrupt.cancelled() => Trigger::Interrupt,
                };
                reporter.report(Outcome::Interrupted(trigger));
            }
            .instrument(span),
        );

        let result = match outcome.await {
            Ok(Outcome::Failed(err)) => {
                error!(error = %err, "Service failed");
                Err(err)
            }
            Ok(Outcome::Interrupted(trigger)) => {
                info!(%trigger, "Shutdown requested");
                self.stop().await;
                Ok(())
            }
            Ok(Outcome::Finished(listener)) => {
                info!(%listener, "Listener stopped, finishing shutdown");
                self.stop().await;
                Ok(())
            }
            Err(_) => {
                self.stop().await;
                Ok(())
            }
        };

        watcher_task.abort();
        result
    }

    /// Drain and stop the service.
    ///
    /// Safe to call more than once and from several tasks; every caller
    /// returns after the first stop has completed. Calling it before `start`
    /// leaves the service stopped.
    pub async fn stop(&self) {
        let inner = Arc::clone(&self.inner);
        let span = self.inner.config.logger.clone();
        self.inner
            .stopped
            .get_or_init(|| async move { inner.shutdown().await }.instrument(span))
            .await;
    }
}

impl Inner {
    fn transition(&self, from: ServiceState, to: ServiceState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    fn mark_serving(&self, listener: &watch::Sender<ListenerStatus>, addr: SocketAddr) {
        listener.send_replace(ListenerStatus::Serving(addr));

        let both = self.rpc.borrow().addr().is_some() && self.http.borrow().addr().is_some();
        if both && self.transition(ServiceState::Starting, ServiceState::Running) {
            info!("Service running");
        }
    }

    async fn run_rpc(self: Arc<Self>, port: u16, reporter: FirstOutcome<Outcome>) {
        let result = catch_panic(Listener::Rpc, self.serve_rpc(port)).await;
        self.rpc.send_replace(ListenerStatus::Finished);

        let outcome = match result {
            Ok(()) => {
                info!("gRPC server stopped");
                Outcome::Finished(Listener::Rpc)
            }
            Err(e) => Outcome::Failed(e),
        };
        if !reporter.report(outcome) {
            debug!("gRPC listener outcome superseded");
        }
    }

    async fn serve_rpc(&self, port: u16) -> Result<()> {
        let (listener, addr) =
            bind(Listener::Rpc, SocketAddr::new(self.config.bind_address, port)).await?;
        info!(%addr, "gRPC server listening");
        self.mark_serving(&self.rpc, addr);

        let routes = self.rpc_routes.lock().take().unwrap_or_default();
        RpcServer::new(
            routes,
            self.config.rpc_server_options.clone(),
            self.metrics.rpc(),
            InterceptorChain::new(self.config.interceptors.clone()),
        )
        .reflection(self.config.reflection.then(|| self.config.file_descriptor_sets.clone()))
        .serve(listener, self.rpc_shutdown.clone())
        .await
    }

    async fn run_http<F>(
        self: Arc<Self>,
        http_port: u16,
        rpc_port: u16,
        registrar: F,
        reporter: FirstOutcome<Outcome>,
    ) where
        F: FnOnce(&mut GatewayMux, Endpoint) -> std::result::Result<(), BoxError> + Send + 'static,
    {
        let result = catch_panic(
            Listener::Http,
            self.serve_http(http_port, rpc_port, registrar),
        )
        .await;
        self.http.send_replace(ListenerStatus::Finished);

        let outcome = match result {
            Ok(true) => Outcome::Finished(Listener::Http),
            Ok(false) => return,
            Err(e) => Outcome::Failed(e),
        };
        if !reporter.report(outcome) {
            debug!("HTTP listener outcome superseded");
        }
    }

    /// Returns `Ok(false)` when the gRPC listener went away before the
    /// gateway could learn its port.
    async fn serve_http<F>(&self, http_port: u16, rpc_port: u16, registrar: F) -> Result<bool>
    where
        F: FnOnce(&mut GatewayMux, Endpoint) -> std::result::Result<(), BoxError> + Send + 'static,
    {
        let rpc_port = match rpc_port {
            0 => match self.rpc_serving_addr().await {
                Some(addr) => addr.port(),
                None => return Ok(false),
            },
            port => port,
        };
        let endpoint = self
            .config
            .dial_options
            .endpoint(format!("http://localhost:{rpc_port}"))?;

        let mut mux = GatewayMux::new();
        if self.config.metrics_route {
            mux.add_route(metrics_route(Arc::clone(&self.metrics)));
        }
        for route in &self.config.routes {
            mux.add_route(route.clone());
        }
        let extra = std::mem::take(&mut *self.extra_routes.lock());
        for route in extra {
            mux.add_route(route);
        }
        if self.config.docs.enabled {
            mux.add_route(docs_route(self.config.docs.clone()));
        }
        registrar(&mut mux, endpoint).map_err(Error::ReverseProxy)?;
        debug!(routes = mux.len(), "Gateway routes registered");

        let table = mux.into_table(static_fallback(self.config.static_dir.clone()));
        let mut annotators = vec![trace_annotator()];
        annotators.extend(self.config.annotators.iter().cloned());
        let gateway = Arc::new(Gateway::new(
            table,
            annotators,
            self.config.error_handler.clone(),
        ));
        let router = build_router(
            gateway,
            Arc::clone(&self.propagator),
            self.config.http_handler.as_ref(),
            Arc::clone(&self.http_control),
        );

        let (listener, addr) =
            bind(Listener::Http, SocketAddr::new(self.config.bind_address, http_port)).await?;
        info!(%addr, "HTTP server listening");
        self.mark_serving(&self.http, addr);

        HttpServer::new(router, Arc::clone(&self.http_control))
            .serve(listener)
            .await?;
        Ok(true)
    }

    async fn rpc_serving_addr(&self) -> Option<SocketAddr> {
        let mut rx = self.rpc.subscribe();
        let status = rx
            .wait_for(|s| matches!(s, ListenerStatus::Serving(_) | ListenerStatus::Finished))
            .await
            .ok()?;
        status.addr()
    }

    async fn shutdown(&self) {
        let previous = self.state.send_replace(ServiceState::Draining);
        info!(from = %previous, "Service draining");
        self.http_control.disable_keep_alive();

        if !self.config.pre_shutdown_delay.is_zero() {
            debug!(delay = ?self.config.pre_shutdown_delay, "Waiting before stopping listeners");
            tokio::time::sleep(self.config.pre_shutdown_delay).await;
        }

        self.rpc_shutdown.cancel();
        wait_done(&self.rpc).await;

        self.http_control.begin_graceful();
        let timeout = self.config.shutdown_timeout;
        if tokio::time::timeout(timeout, wait_done(&self.http)).await.is_err() {
            warn!(?timeout, "HTTP shutdown timed out, closing remaining connections");
            self.http_control.force_close();
            wait_done(&self.http).await;
        }

        if let Some(callback) = &self.config.on_shutdown {
            callback();
        }
        self.state.send_replace(ServiceState::Stopped);
        info!("Service stopped");
    }
}

/// Turn a panic of a listener task into that listener's failure.
async fn catch_panic<T>(listener: Listener, task: impl Future<Output = Result<T>>) -> Result<T> {
    match AssertUnwindSafe(task).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(Error::Panic {
            listener,
            message: panic_message(panic.as_ref()),
        }),
    }
}

async fn wait_done(status: &watch::Sender<ListenerStatus>) {
    let mut rx = status.subscribe();
    let _ = rx.wait_for(ListenerStatus::is_done).await;
}

async fn bind(listener: Listener, addr: SocketAddr) -> Result<(TcpListener, SocketAddr)> {
    let socket = TcpListener::bind(addr).await.map_err(|source| Error::Bind {
        listener,
        addr,
        source,
    })?;
    let local = socket.local_addr().map_err(|source| Error::Bind {
        listener,
        addr,
        source,
    })?;
    Ok((socket, local))
}
