//! Trace context propagation between the HTTP gateway and the RPC listener.
//!
//! Every inbound HTTP request gets a server span and a *footprint*, a request
//! id that follows the request across process boundaries. The footprint is
//! resolved in this order:
//!
//! 1. The `footprint` member of inbound W3C baggage
//! 2. The `X-Request-Id` header
//! 3. A freshly generated UUID v4
//!
//! The resolved footprint is written back to the request's `X-Request-Id`
//! header, recorded in the outgoing baggage and echoed on the response.

use crate::options::Annotator;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use opentelemetry::baggage::BaggageExt;
use opentelemetry::global::BoxedTracer;
use opentelemetry::propagation::{
    Extractor, Injector, TextMapCompositePropagator, TextMapPropagator,
};
use opentelemetry::trace::{
    noop::NoopTracer, Span as _, SpanKind, Status as SpanStatus, TraceContextExt, Tracer,
};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tonic::metadata::{Ascii, KeyRef, MetadataKey, MetadataMap, MetadataValue};
use uuid::Uuid;

/// Request id header.
pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Baggage member carrying the footprint.
pub const FOOTPRINT_KEY: &str = "footprint";

struct HeaderExtractor<'a>(&'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(HeaderName::as_str).collect()
    }
}

struct MetadataExtractor<'a>(&'a MetadataMap);

impl Extractor for MetadataExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0
            .keys()
            .map(|key| match key {
                KeyRef::Ascii(key) => key.as_str(),
                KeyRef::Binary(key) => key.as_str(),
            })
            .collect()
    }
}

struct MetadataInjector<'a>(&'a mut MetadataMap);

impl Injector for MetadataInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        let Ok(key) = MetadataKey::<Ascii>::from_bytes(key.as_bytes()) else {
            return;
        };
        if let Ok(value) = MetadataValue::<Ascii>::try_from(value.as_str()) {
            self.0.insert(key, value);
        }
    }
}

fn composite_propagator() -> TextMapCompositePropagator {
    TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ])
}

/// Starts server spans for inbound requests and resolves their footprint.
pub struct TracePropagator {
    tracer: BoxedTracer,
    propagator: Arc<TextMapCompositePropagator>,
}

impl TracePropagator {
    /// Propagator starting spans on `tracer`.
    pub fn new(tracer: BoxedTracer) -> Self {
        Self {
            tracer,
            propagator: Arc::new(composite_propagator()),
        }
    }

    /// Propagator whose spans are never recorded.
    ///
    /// Context and footprints are still propagated.
    pub fn noop() -> Self {
        Self::new(noop_tracer())
    }

    /// Start a server span for `req` and resolve its footprint.
    ///
    /// The request's `X-Request-Id` header is overwritten with the footprint.
    pub fn on_inbound_request(&self, req: &mut Request) -> TraceContext {
        let parent = self.propagator.extract(&HeaderExtractor(req.headers()));

        let name = format!("{} {}", req.method(), req.uri().path());
        let mut span = self
            .tracer
            .span_builder(name)
            .with_kind(SpanKind::Server)
            .start_with_context(&self.tracer, &parent);

        let host = req
            .uri()
            .host()
            .map(str::to_string)
            .or_else(|| {
                req.headers()
                    .get(axum::http::header::HOST)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string)
            })
            .unwrap_or_default();
        span.set_attribute(KeyValue::new("http.url.host", host));
        span.set_attribute(KeyValue::new("http.url", req.uri().to_string()));
        span.set_attribute(KeyValue::new(
            "http.url.query",
            req.uri().query().unwrap_or_default().to_string(),
        ));
        if let Some(ConnectInfo(peer)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
            span.set_attribute(KeyValue::new("peer.address", peer.to_string()));
        }

        let (footprint, header) = resolve_footprint(&parent, req.headers());
        req.headers_mut().insert(X_REQUEST_ID, header.clone());
        span.set_attribute(KeyValue::new(FOOTPRINT_KEY, footprint.clone()));

        let cx = parent
            .with_baggage([KeyValue::new(FOOTPRINT_KEY, footprint.clone())])
            .with_span(span);

        TraceContext {
            cx,
            footprint,
            header,
            propagator: Arc::clone(&self.propagator),
        }
    }

    /// Extract the trace context carried by RPC metadata.
    pub fn extract_metadata(&self, metadata: &MetadataMap) -> Context {
        self.propagator.extract(&MetadataExtractor(metadata))
    }
}

impl Default for TracePropagator {
    fn default() -> Self {
        Self::noop()
    }
}

impl fmt::Debug for TracePropagator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracePropagator").finish_non_exhaustive()
    }
}

/// A tracer that records nothing.
pub fn noop_tracer() -> BoxedTracer {
    BoxedTracer::new(Box::new(NoopTracer::new()))
}

fn resolve_footprint(cx: &Context, headers: &HeaderMap) -> (String, HeaderValue) {
    let from_baggage = cx
        .baggage()
        .get(FOOTPRINT_KEY)
        .map(|value| value.as_str().into_owned());
    let from_header = || {
        headers
            .get(&X_REQUEST_ID)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };

    from_baggage
        .and_then(usable_footprint)
        .or_else(|| from_header().and_then(usable_footprint))
        .unwrap_or_else(|| {
            let id = Uuid::new_v4().to_string();
            let header = HeaderValue::from_str(&id).unwrap_or(HeaderValue::from_static(""));
            (id, header)
        })
}

fn usable_footprint(value: String) -> Option<(String, HeaderValue)> {
    if value.is_empty() {
        return None;
    }
    let header = HeaderValue::from_str(&value).ok()?;
    Some((value, header))
}

/// Trace state of one inbound HTTP request.
///
/// Stored in the request extensions by the gateway's trace middleware.
#[derive(Clone)]
pub struct TraceContext {
    cx: Context,
    footprint: String,
    header: HeaderValue,
    propagator: Arc<TextMapCompositePropagator>,
}

impl TraceContext {
    /// The request's footprint.
    pub fn footprint(&self) -> &str {
        &self.footprint
    }

    /// The OpenTelemetry context holding the server span and baggage.
    pub fn context(&self) -> &Context {
        &self.cx
    }

    /// Hex trace id of the server span, if it is sampled.
    pub fn trace_id(&self) -> Option<String> {
        let span_context = self.cx.span().span_context().clone();
        span_context
            .is_valid()
            .then(|| span_context.trace_id().to_string())
    }

    /// Write `traceparent` and `baggage` into outgoing RPC metadata.
    pub fn inject(&self, metadata: &mut MetadataMap) {
        self.propagator
            .inject_context(&self.cx, &mut MetadataInjector(metadata));
    }

    pub(crate) fn header_value(&self) -> HeaderValue {
        self.header.clone()
    }

    pub(crate) fn end(&self, status: axum::http::StatusCode) {
        let span = self.cx.span();
        span.set_attribute(KeyValue::new(
            "http.status_code",
            i64::from(status.as_u16()),
        ));
        if status.is_server_error() {
            span.set_status(SpanStatus::error(status.to_string()));
        }
        span.end();
    }
}

impl fmt::Debug for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceContext")
            .field("footprint", &self.footprint)
            .field("trace_id", &self.trace_id())
            .finish()
    }
}

/// Footprint carried by RPC metadata, if any.
pub fn footprint_from_metadata(metadata: &MetadataMap) -> Option<String> {
    let cx = BaggagePropagator::new().extract(&MetadataExtractor(metadata));
    cx.baggage()
        .get(FOOTPRINT_KEY)
        .map(|value| value.as_str().into_owned())
}

/// Middleware tracing every gateway request.
pub(crate) async fn trace_request(
    State(propagator): State<Arc<TracePropagator>>,
    mut req: Request,
    next: Next,
) -> Response {
    let trace = propagator.on_inbound_request(&mut req);
    req.extensions_mut().insert(trace.clone());

    let mut response = next.run(req).await;
    response
        .headers_mut()
        .insert(X_REQUEST_ID, trace.header_value());
    trace.end(response.status());
    response
}

/// Built-in annotator forwarding the request's trace context as RPC metadata.
pub fn trace_annotator() -> Annotator {
    Arc::new(|parts: &Parts| {
        let mut metadata = MetadataMap::new();
        if let Some(trace) = parts.extensions.get::<TraceContext>() {
            trace.inject(&mut metadata);
        }
        metadata
    })
}
