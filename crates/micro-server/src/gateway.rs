//! HTTP gateway: route dispatch, error rendering and the static fallback.

use crate::options::{Annotator, ErrorHandler};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::request::Parts;
use axum::http::{Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use routing::{PathParams, Pattern, Resolution, Route, RouteTable};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tonic::metadata::MetadataMap;
use tonic::{Code, Status};
use tower::ServiceExt;
use tower_http::services::ServeDir;
use tracing::{debug, warn};

/// Routes served by the HTTP listener.
///
/// Handed to the reverse-proxy registrar, which adds the routes forwarding
/// to the RPC listener. Earlier registrations win over later ones.
#[derive(Debug, Default)]
pub struct GatewayMux {
    table: RouteTable,
}

impl GatewayMux {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `method` on `pattern`.
    pub fn handle<F, Fut, R>(&mut self, method: Method, pattern: Pattern, handler: F) -> &mut Self
    where
        F: Fn(Request, PathParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, Status>> + Send + 'static,
        R: IntoResponse,
    {
        self.add_route(Route::with_pattern(method, pattern, handler))
    }

    /// Register `handler` for `method` on the literal `path`.
    ///
    /// # Panics
    ///
    /// Panics if `path` is not a valid literal pattern.
    pub fn handle_path<F, Fut, R>(&mut self, method: Method, path: &str, handler: F) -> &mut Self
    where
        F: Fn(Request, PathParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, Status>> + Send + 'static,
        R: IntoResponse,
    {
        self.add_route(Route::new(method, path, handler))
    }

    pub fn add_route(&mut self, route: Route) -> &mut Self {
        self.table.register(route);
        self
    }

    /// Number of registered routes.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub(crate) fn into_table(self, fallback: Route) -> RouteTable {
        let mut table = self.table;
        table.set_fallback(fallback);
        table
    }
}

/// Metadata a gateway handler should send with its RPC call.
///
/// Inserted into the request extensions before the handler runs; holds the
/// merged output of every annotator, trace context first.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMetadata(MetadataMap);

impl OutgoingMetadata {
    pub fn metadata(&self) -> &MetadataMap {
        &self.0
    }

    /// Wrap `message` in a request carrying this metadata.
    pub fn request<T>(&self, message: T) -> tonic::Request<T> {
        let mut request = tonic::Request::new(message);
        *request.metadata_mut() = self.0.clone();
        request
    }
}

/// State of the gateway's fallback handler.
pub(crate) struct Gateway {
    table: RouteTable,
    annotators: Vec<Annotator>,
    error_handler: Option<ErrorHandler>,
}

impl Gateway {
    pub(crate) fn new(
        table: RouteTable,
        annotators: Vec<Annotator>,
        error_handler: Option<ErrorHandler>,
    ) -> Self {
        Self {
            table,
            annotators,
            error_handler,
        }
    }

    fn outgoing_metadata(&self, parts: &Parts) -> OutgoingMetadata {
        let mut merged = MetadataMap::new().into_headers();
        for annotator in &self.annotators {
            let metadata = annotator(parts).into_headers();
            for (name, value) in &metadata {
                merged.append(name.clone(), value.clone());
            }
        }
        OutgoingMetadata(MetadataMap::from_headers(merged))
    }

    fn render_error(&self, status: &Status) -> Response {
        match &self.error_handler {
            Some(handler) => handler(status),
            None => http_status(status.code()).into_response(),
        }
    }
}

/// Resolve and run the route for `req`.
pub(crate) async fn dispatch(State(gateway): State<Arc<Gateway>>, req: Request) -> Response {
    let (mut parts, body) = req.into_parts();

    let (route, params) = match gateway.table.resolve(&parts.method, parts.uri.path()) {
        Resolution::Matched { route, params } => (route.clone(), params),
        Resolution::NotFound => {
            debug!(method = %parts.method, path = parts.uri.path(), "No route matched");
            return gateway.render_error(&Status::not_found("Not Found"));
        }
    };

    let metadata = gateway.outgoing_metadata(&parts);
    parts.extensions.insert(metadata);

    match route.call(Request::from_parts(parts, body), params).await {
        Ok(response) => response,
        Err(status) => gateway.render_error(&status),
    }
}

/// HTTP status of a gRPC code, following the grpc-gateway mapping.
pub fn http_status(code: Code) -> StatusCode {
    match code {
        Code::Ok => StatusCode::OK,
        Code::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        Code::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
        Code::InvalidArgument => StatusCode::BAD_REQUEST,
        Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::AlreadyExists => StatusCode::CONFLICT,
        Code::PermissionDenied => StatusCode::FORBIDDEN,
        Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        Code::FailedPrecondition => StatusCode::BAD_REQUEST,
        Code::Aborted => StatusCode::CONFLICT,
        Code::OutOfRange => StatusCode::BAD_REQUEST,
        Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        Code::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        Code::DataLoss => StatusCode::INTERNAL_SERVER_ERROR,
        Code::Unauthenticated => StatusCode::UNAUTHORIZED,
    }
}

/// Render `status` as a JSON error body.
pub fn default_error_handler(status: &Status) -> Response {
    let body = serde_json::json!({
        "code": status.code() as i32,
        "message": status.message(),
        "details": [],
    });
    (
        http_status(status.code()),
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Catch-all route serving files below `dir`.
///
/// `None` serves the process working directory as it is at request time.
pub(crate) fn static_fallback(dir: Option<PathBuf>) -> Route {
    let dir = Arc::new(dir);
    Route::with_pattern(Method::GET, Pattern::wildcard(), move |req, _params| {
        let dir = Arc::clone(&dir);
        async move { Ok::<_, Status>(serve_static(dir.as_deref(), req).await) }
    })
}

async fn serve_static(dir: Option<&Path>, req: Request) -> Response {
    let base = match dir {
        Some(dir) => dir.to_path_buf(),
        None => match std::env::current_dir() {
            Ok(dir) => dir,
            Err(e) => {
                warn!(error = %e, "Cannot resolve working directory");
                return page_not_found();
            }
        },
    };

    // Rejects `..` and directories, decodes the path.
    let files = ServeDir::new(base).append_index_html_on_directories(false);
    match files.oneshot(req).await {
        Ok(response)
            if response.status() == StatusCode::NOT_FOUND
                || response.status().is_server_error() =>
        {
            page_not_found()
        }
        Ok(response) => response.map(Body::new),
        Err(never) => match never {},
    }
}

fn page_not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        "404 page not found\n",
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use tonic::metadata::{Ascii, MetadataValue};

    fn gateway(table: RouteTable, annotators: Vec<Annotator>) -> Arc<Gateway> {
        Arc::new(Gateway::new(
            table,
            annotators,
            Some(Arc::new(default_error_handler)),
        ))
    }

    fn get(path: &str) -> Request {
        axum::http::Request::builder()
            .uri(path)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(http_status(Code::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(http_status(Code::Unauthenticated), StatusCode::UNAUTHORIZED);
        assert_eq!(http_status(Code::Unavailable), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(http_status(Code::Cancelled).as_u16(), 499);
    }

    #[tokio::test]
    async fn test_default_error_handler_body() {
        let response = default_error_handler(&Status::not_found("Not Found"));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(
            body,
            serde_json::json!({"code": 5, "message": "Not Found", "details": []})
        );
    }

    #[tokio::test]
    async fn test_dispatch_runs_first_match() {
        let mut mux = GatewayMux::new();
        mux.handle_path(Method::GET, "/test", |_req, _params| async {
            Ok::<_, Status>("Hello!")
        })
        .handle_path(Method::GET, "/test", |_req, _params| async {
            Ok::<_, Status>("shadowed")
        });
        let table = mux.into_table(static_fallback(None));

        let response = dispatch(State(gateway(table, Vec::new())), get("/test")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "Hello!");
    }

    #[tokio::test]
    async fn test_unmatched_method_renders_not_found() {
        let mut mux = GatewayMux::new();
        mux.handle_path(Method::GET, "/test", |_req, _params| async {
            Ok::<_, Status>("Hello!")
        });
        let table = mux.into_table(static_fallback(None));

        let req = axum::http::Request::builder()
            .method(Method::DELETE)
            .uri("/test")
            .body(Body::empty())
            .unwrap();
        let response = dispatch(State(gateway(table, Vec::new())), req).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(body_string(response).await.contains("\"code\":5"));
    }

    #[tokio::test]
    async fn test_handler_status_goes_through_error_handler() {
        let mut mux = GatewayMux::new();
        mux.handle_path(Method::GET, "/secret", |_req, _params| async {
            Err::<&'static str, _>(Status::permission_denied("nope"))
        });
        let table = mux.into_table(static_fallback(None));

        let response = dispatch(State(gateway(table, Vec::new())), get("/secret")).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(body_string(response).await.contains("\"message\":\"nope\""));
    }

    #[tokio::test]
    async fn test_without_error_handler_status_is_bare() {
        let table = GatewayMux::new().into_table(static_fallback(None));
        let gateway = Arc::new(Gateway::new(table, Vec::new(), None));

        let response = dispatch(State(gateway), get("/nothing/here.txt")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_annotator_metadata_reaches_handler() {
        let mut mux = GatewayMux::new();
        mux.handle_path(Method::GET, "/whoami", |req: Request, _params| async move {
            let outgoing = req.extensions().get::<OutgoingMetadata>().cloned();
            let user = outgoing
                .and_then(|o| o.metadata().get("x-user").cloned())
                .and_then(|v| v.to_str().ok().map(str::to_string))
                .unwrap_or_default();
            Ok::<_, Status>(user)
        });
        let table = mux.into_table(static_fallback(None));
        let annotator: Annotator = Arc::new(|parts: &Parts| {
            let mut metadata = MetadataMap::new();
            if let Some(user) = parts.headers.get("authorization") {
                if let Some(value) = user
                    .to_str()
                    .ok()
                    .and_then(|user| user.parse::<MetadataValue<Ascii>>().ok())
                {
                    metadata.insert("x-user", value);
                }
            }
            metadata
        });

        let req = axum::http::Request::builder()
            .uri("/whoami")
            .header("authorization", "alice")
            .body(Body::empty())
            .unwrap();
        let response = dispatch(State(gateway(table, vec![annotator])), req).await;
        assert_eq!(body_string(response).await, "alice");
    }

    #[test]
    fn test_outgoing_metadata_request() {
        let mut metadata = MetadataMap::new();
        metadata.insert("x-footprint", "abc".parse().unwrap());
        let request = OutgoingMetadata(metadata).request(());
        assert_eq!(request.metadata().get("x-footprint").unwrap(), "abc");
    }

    #[tokio::test]
    async fn test_static_fallback_serves_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), "hi there").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let table = GatewayMux::new().into_table(static_fallback(Some(dir.path().to_path_buf())));
        let gateway = gateway(table, Vec::new());

        let response = dispatch(State(Arc::clone(&gateway)), get("/hello.txt")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "hi there");

        let response = dispatch(State(Arc::clone(&gateway)), get("/missing.txt")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_string(response).await, "404 page not found\n");

        let response = dispatch(State(gateway), get("/sub")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_static_fallback_decodes_and_confines_paths() {
        let root = tempfile::tempdir().unwrap();
        let www = root.path().join("www");
        std::fs::create_dir(&www).unwrap();
        std::fs::write(www.join("my file.txt"), "spaced").unwrap();
        std::fs::write(root.path().join("secret.txt"), "secret").unwrap();
        let table = GatewayMux::new().into_table(static_fallback(Some(www)));
        let gateway = gateway(table, Vec::new());

        let response = dispatch(State(Arc::clone(&gateway)), get("/my%20file.txt")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "spaced");

        let response = dispatch(State(Arc::clone(&gateway)), get("/../secret.txt")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_string(response).await, "404 page not found\n");

        let response = dispatch(State(gateway), get("/%2e%2e/secret.txt")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
