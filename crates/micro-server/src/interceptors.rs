//! Built-in RPC layers and the user interceptor chain.
//!
//! Every RPC passes, outermost first, through panic recovery, request
//! validation, metrics and then the user interceptors. The same chain serves
//! unary and streaming calls.

use crate::error::BoxError;
use crate::metrics::RpcMetrics;
use crate::options::Interceptor;
use axum::body::{Body, HttpBody};
use axum::http::{HeaderValue, Method, Request, Response, header};
use bytes::Bytes;
use futures::future::BoxFuture;
use std::any::Any;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tonic::{Code, Status};
use tower::{Layer, Service};
use tracing::{error, warn};

/// Converts a panic inside an RPC handler into an `Internal` status.
pub(crate) fn rpc_panic_response(panic: Box<dyn Any + Send + 'static>) -> Response<Body> {
    let message = panic_message(panic.as_ref());
    error!(panic = %message, "Recovered from panic in RPC handler");
    status_response(Status::internal(format!("panic: {message}")))
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Trailers-only gRPC response carrying `status`.
fn status_response(status: Status) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/grpc"),
    );
    if let Err(e) = status.add_header(response.headers_mut()) {
        warn!(error = %e, "Failed to encode gRPC status headers");
    }
    response
}

/// Service and method of an RPC path, `/package.Service/Method`.
pub(crate) fn rpc_method(path: &str) -> Option<(&str, &str)> {
    let (service, method) = path.strip_prefix('/')?.split_once('/')?;
    if service.is_empty() || method.is_empty() || method.contains('/') {
        return None;
    }
    Some((service, method))
}

fn validate_rpc_request<B>(req: &Request<B>) -> Result<(), Status> {
    if req.method() != Method::POST {
        return Err(Status::unimplemented(format!(
            "rpc requests must use POST, got {}",
            req.method()
        )));
    }
    if rpc_method(req.uri().path()).is_none() {
        return Err(Status::unimplemented(format!(
            "malformed rpc path {}",
            req.uri().path()
        )));
    }
    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !content_type.starts_with("application/grpc") {
        return Err(Status::invalid_argument(format!(
            "unsupported content type {content_type:?}"
        )));
    }
    Ok(())
}

/// Rejects requests that are not well-formed gRPC calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestValidationLayer;

impl<S> Layer<S> for RequestValidationLayer {
    type Service = RequestValidation<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestValidation { inner }
    }
}

#[derive(Debug, Clone)]
pub struct RequestValidation<S> {
    inner: S,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for RequestValidation<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ResBody: HttpBody<Data = Bytes> + Send + 'static,
    ResBody::Error: Into<BoxError>,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        if let Err(status) = validate_rpc_request(&req) {
            warn!(path = req.uri().path(), status = %status.message(), "Rejected RPC request");
            return Box::pin(async move { Ok(status_response(status)) });
        }
        let future = self.inner.call(req);
        Box::pin(async move { future.await.map(|response| response.map(Body::new)) })
    }
}

/// Records started, handled and latency metrics per RPC method.
#[derive(Debug, Clone)]
pub struct RpcMetricsLayer {
    metrics: RpcMetrics,
}

impl RpcMetricsLayer {
    pub fn new(metrics: RpcMetrics) -> Self {
        Self { metrics }
    }
}

impl<S> Layer<S> for RpcMetricsLayer {
    type Service = RpcMetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RpcMetricsService {
            inner,
            metrics: self.metrics.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RpcMetricsService<S> {
    inner: S,
    metrics: RpcMetrics,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for RpcMetricsService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let (service, method) = rpc_method(req.uri().path())
            .map(|(service, method)| (service.to_string(), method.to_string()))
            .unwrap_or_default();
        self.metrics.record_started(&service, &method);

        let metrics = self.metrics.clone();
        let started = Instant::now();
        let future = self.inner.call(req);
        Box::pin(async move {
            let result = future.await;
            let code = match &result {
                Ok(response) => response_code(response),
                Err(_) => Code::Unknown,
            };
            metrics.record_handled(&service, &method, code, started.elapsed());
            result
        })
    }
}

/// Status code of a response; streaming successes report `OK` in trailers.
fn response_code<B>(response: &Response<B>) -> Code {
    response
        .headers()
        .get("grpc-status")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<i32>().ok())
        .map(Code::from_i32)
        .unwrap_or(Code::Ok)
}

/// User interceptors run in registration order.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Arc<[Interceptor]>,
}

impl InterceptorChain {
    pub fn new(interceptors: Vec<Interceptor>) -> Self {
        Self {
            interceptors: interceptors.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }
}

impl tonic::service::Interceptor for InterceptorChain {
    fn call(&mut self, mut request: tonic::Request<()>) -> Result<tonic::Request<()>, Status> {
        for interceptor in self.interceptors.iter() {
            request = interceptor(request)?;
        }
        Ok(request)
    }
}

impl std::fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("len", &self.interceptors.len())
            .finish()
    }
}
