//! HTTP listener serving the gateway router.

use crate::error::{Error, Listener, Result};
use crate::gateway::{self, Gateway};
use crate::interceptors::panic_message;
use crate::options::HttpWrapper;
use crate::trace::{self, TracePropagator};
use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, StatusCode, Version, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Shutdown controls shared by the HTTP listener and the orchestrator.
#[derive(Debug)]
pub(crate) struct HttpControl {
    keep_alive: AtomicBool,
    graceful: CancellationToken,
    force: CancellationToken,
}

impl HttpControl {
    pub(crate) fn new() -> Self {
        Self {
            keep_alive: AtomicBool::new(true),
            graceful: CancellationToken::new(),
            force: CancellationToken::new(),
        }
    }

    pub(crate) fn keep_alive_enabled(&self) -> bool {
        self.keep_alive.load(Ordering::Acquire)
    }

    /// New HTTP/1 connections close after one response.
    pub(crate) fn disable_keep_alive(&self) {
        self.keep_alive.store(false, Ordering::Release);
    }

    /// Stop accepting and let open connections finish.
    pub(crate) fn begin_graceful(&self) {
        self.graceful.cancel();
    }

    /// Drop every remaining connection.
    pub(crate) fn force_close(&self) {
        self.force.cancel();
    }
}

/// Assemble the gateway router, outermost first: trace context, request
/// logging, keep-alive control, user wrapper, panic recovery, dispatch.
pub(crate) fn build_router(
    gateway: Arc<Gateway>,
    propagator: Arc<TracePropagator>,
    wrapper: Option<&HttpWrapper>,
    control: Arc<HttpControl>,
) -> Router {
    let router = Router::new()
        .fallback(gateway::dispatch)
        .with_state(gateway)
        .layer(CatchPanicLayer::custom(http_panic_response));
    let router = match wrapper {
        Some(wrap) => wrap(router),
        None => router,
    };
    router
        .layer(middleware::from_fn_with_state(control, connection_close))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn_with_state(propagator, trace::trace_request))
}

fn http_panic_response(panic: Box<dyn Any + Send + 'static>) -> Response<Body> {
    let message = panic_message(panic.as_ref());
    error!(panic = %message, "Recovered from panic in HTTP handler");
    let body = serde_json::json!({
        "code": tonic::Code::Internal as i32,
        "message": "Internal Server Error",
        "details": [],
    });
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Ask HTTP/1 clients to close the connection once draining started.
async fn connection_close(
    State(control): State<Arc<HttpControl>>,
    req: Request,
    next: Next,
) -> Response {
    let version = req.version();
    let mut response = next.run(req).await;
    if !control.keep_alive_enabled() && version <= Version::HTTP_11 {
        response
            .headers_mut()
            .insert(header::CONNECTION, HeaderValue::from_static("close"));
    }
    response
}

/// Accept loop for the gateway router.
pub(crate) struct HttpServer {
    router: Router,
    control: Arc<HttpControl>,
}

impl HttpServer {
    pub(crate) fn new(router: Router, control: Arc<HttpControl>) -> Self {
        Self { router, control }
    }

    /// Serve until graceful shutdown begins and every connection has closed.
    pub(crate) async fn serve(self, listener: TcpListener) -> Result<()> {
        let control = self.control;
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = control.graceful.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let router = self.router.clone();
                        let control = Arc::clone(&control);
                        connections.spawn(serve_connection(stream, peer, router, control));
                    }
                    Err(e) if is_transient(&e) => {
                        warn!(error = %e, "Failed to accept HTTP connection");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                    Err(source) => {
                        return Err(Error::Serve {
                            listener: Listener::Http,
                            source,
                        });
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
        drop(listener);

        info!(open = connections.len(), "HTTP server draining connections");
        let forced = {
            let drained = async { while connections.join_next().await.is_some() {} };
            tokio::select! {
                _ = drained => false,
                _ = control.force.cancelled() => true,
            }
        };
        if forced {
            warn!(open = connections.len(), "Force-closing HTTP connections");
            connections.abort_all();
            while connections.join_next().await.is_some() {}
        }

        info!("HTTP server stopped");
        Ok(())
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;

    matches!(
        e.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
    ) || e.raw_os_error().is_some()
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    peer: std::net::SocketAddr,
    router: Router,
    control: Arc<HttpControl>,
) {
    let service = hyper::service::service_fn(move |mut req: hyper::Request<Incoming>| {
        req.extensions_mut().insert(ConnectInfo(peer));
        router.clone().oneshot(req)
    });

    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder.http1().keep_alive(control.keep_alive_enabled());
    let connection = builder.serve_connection(TokioIo::new(stream), service);
    tokio::pin!(connection);

    tokio::select! {
        result = connection.as_mut() => {
            if let Err(e) = result {
                debug!(%peer, error = %e, "HTTP connection error");
            }
            return;
        }
        _ = control.graceful.cancelled() => {}
    }

    connection.as_mut().graceful_shutdown();
    if let Err(e) = connection.await {
        debug!(%peer, error = %e, "HTTP connection error during shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{default_error_handler, static_fallback, GatewayMux};
    use crate::trace::X_REQUEST_ID;
    use axum::body::to_bytes;
    use axum::http::Method;
    use tonic::Status;

    fn router(mux: GatewayMux, control: Arc<HttpControl>) -> Router {
        let table = mux.into_table(static_fallback(None));
        let gateway = Arc::new(Gateway::new(
            table,
            vec![trace::trace_annotator()],
            Some(Arc::new(default_error_handler)),
        ));
        build_router(gateway, Arc::new(TracePropagator::noop()), None, control)
    }

    #[tokio::test]
    async fn test_every_response_carries_request_id() {
        let mut mux = GatewayMux::new();
        mux.handle_path(Method::GET, "/test", |_req, _params| async {
            Ok::<_, Status>("Hello!")
        });
        let app = router(mux, Arc::new(HttpControl::new()));

        let req = axum::http::Request::builder()
            .uri("/test")
            .header("x-request-id", "abc-123")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(req).await.unwrap();
        assert_eq!(response.headers()[X_REQUEST_ID], "abc-123");

        let req = axum::http::Request::builder()
            .method(Method::PUT)
            .uri("/nowhere")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[X_REQUEST_ID].len(), 36);
    }

    #[tokio::test]
    async fn test_handler_panic_is_500_with_request_id() {
        let mut mux = GatewayMux::new();
        mux.handle_path(Method::GET, "/panic", |_req, _params| async {
            if true {
                panic!("handler exploded");
            }
            Ok::<_, Status>("unreachable")
        });
        let app = router(mux, Arc::new(HttpControl::new()));

        let req = axum::http::Request::builder().uri("/panic").body(Body::empty()).unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.headers().contains_key(X_REQUEST_ID));
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("\"code\":13"));
    }

    #[tokio::test]
    async fn test_connection_close_after_keep_alive_disabled() {
        let mut mux = GatewayMux::new();
        mux.handle_path(Method::GET, "/test", |_req, _params| async {
            Ok::<_, Status>("Hello!")
        });
        let control = Arc::new(HttpControl::new());
        let app = router(mux, Arc::clone(&control));

        let req = axum::http::Request::builder().uri("/test").body(Body::empty()).unwrap();
        let response = app.clone().oneshot(req).await.unwrap();
        assert!(!response.headers().contains_key(header::CONNECTION));

        control.disable_keep_alive();
        let req = axum::http::Request::builder().uri("/test").body(Body::empty()).unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.headers()[header::CONNECTION], "close");
    }

    #[tokio::test]
    async fn test_wrapper_sees_requests() {
        let mut mux = GatewayMux::new();
        mux.handle_path(Method::GET, "/test", |_req, _params| async {
            Ok::<_, Status>("Hello!")
        });
        let table = mux.into_table(static_fallback(None));
        let gateway = Arc::new(Gateway::new(table, Vec::new(), None));
        let wrapper: HttpWrapper = Arc::new(|router: Router| {
            router.layer(middleware::map_response(|mut response: Response| async move {
                response
                    .headers_mut()
                    .insert("x-wrapped", HeaderValue::from_static("yes"));
                response
            }))
        });
        let app = build_router(
            gateway,
            Arc::new(TracePropagator::noop()),
            Some(&wrapper),
            Arc::new(HttpControl::new()),
        );

        let req = axum::http::Request::builder().uri("/test").body(Body::empty()).unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.headers()["x-wrapped"], "yes");
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLogs {
        type Writer = CapturedLogs;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[tokio::test]
    async fn test_requests_are_logged() {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(logs.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let mut mux = GatewayMux::new();
        mux.handle_path(Method::GET, "/test", |_req, _params| async {
            Ok::<_, Status>("Hello!")
        });
        let app = router(mux, Arc::new(HttpControl::new()));

        let req = axum::http::Request::builder().uri("/test").body(Body::empty()).unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let output = String::from_utf8(logs.0.lock().clone()).unwrap();
        assert!(output.contains("finished processing request"), "{output}");
    }

    #[tokio::test]
    async fn test_serve_drains_and_stops() {
        let control = Arc::new(HttpControl::new());
        let app = router(GatewayMux::new(), Arc::clone(&control));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = tokio::spawn(HttpServer::new(app, Arc::clone(&control)).serve(listener));

        control.begin_graceful();
        let result = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
