//! Routes and request handlers.

use crate::pattern::{PathParams, Pattern};
use axum::extract::Request;
use axum::http::Method;
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tonic::Status;

/// Result of a route handler.
///
/// Errors are gRPC statuses so that locally served routes and gateway routes
/// proxied to RPC are rendered by the same error handler.
pub type HandlerResult = Result<Response, Status>;

/// A request handler bound to a route.
///
/// Implemented for any `Fn(Request, PathParams) -> impl Future<Output =
/// Result<impl IntoResponse, Status>>`.
pub trait Handler: Send + Sync + 'static {
    /// Handle one request.
    fn call(&self, req: Request, params: PathParams) -> BoxFuture<'static, HandlerResult>;
}

impl<F, Fut, R> Handler for F
where
    F: Fn(Request, PathParams) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, Status>> + Send + 'static,
    R: IntoResponse,
{
    fn call(&self, req: Request, params: PathParams) -> BoxFuture<'static, HandlerResult> {
        let fut = (self)(req, params);
        Box::pin(async move { fut.await.map(IntoResponse::into_response) })
    }
}

/// A `(method, pattern, handler)` entry of the route table.
#[derive(Clone)]
pub struct Route {
    method: Method,
    pattern: Pattern,
    handler: Arc<dyn Handler>,
}

impl Route {
    /// Create a route matching `path` exactly.
    ///
    /// # Panics
    ///
    /// Panics if `path` is not a valid literal pattern, see [`Pattern::literal`].
    pub fn new<F, Fut, R>(method: Method, path: &str, handler: F) -> Self
    where
        F: Fn(Request, PathParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, Status>> + Send + 'static,
        R: IntoResponse,
    {
        Self::with_pattern(method, Pattern::literal(path), handler)
    }

    /// Create a route with a precompiled pattern.
    pub fn with_pattern<F, Fut, R>(method: Method, pattern: Pattern, handler: F) -> Self
    where
        F: Fn(Request, PathParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, Status>> + Send + 'static,
        R: IntoResponse,
    {
        Self::from_handler(method, pattern, Arc::new(handler))
    }

    /// Shorthand for a `GET` route on a literal path.
    pub fn get<F, Fut, R>(path: &str, handler: F) -> Self
    where
        F: Fn(Request, PathParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, Status>> + Send + 'static,
        R: IntoResponse,
    {
        Self::new(Method::GET, path, handler)
    }

    /// Create a route from an existing handler object.
    pub fn from_handler(method: Method, pattern: Pattern, handler: Arc<dyn Handler>) -> Self {
        Self {
            method,
            pattern,
            handler,
        }
    }

    /// The HTTP method this route answers.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The path pattern of this route.
    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    /// Structural match on method and path.
    pub fn matches(&self, method: &Method, path: &str) -> Option<PathParams> {
        if &self.method != method {
            return None;
        }
        self.pattern.matches(path)
    }

    /// Invoke the handler.
    pub fn call(&self, req: Request, params: PathParams) -> BoxFuture<'static, HandlerResult> {
        self.handler.call(req, params)
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("pattern", &self.pattern)
            .finish_non_exhaustive()
    }
}
