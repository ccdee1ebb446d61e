//! RPC listener.

use crate::error::Result;
use crate::interceptors::{
    InterceptorChain, RequestValidationLayer, RpcMetricsLayer, rpc_panic_response,
};
use crate::metrics::RpcMetrics;
use crate::options::RpcServerOptions;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::service::Routes;
use tonic::transport::Server;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::debug;

/// gRPC server with the built-in layers installed.
pub(crate) struct RpcServer {
    routes: Routes,
    options: RpcServerOptions,
    metrics: RpcMetrics,
    interceptors: InterceptorChain,
    reflection: Option<Vec<&'static [u8]>>,
}

impl RpcServer {
    pub(crate) fn new(
        routes: Routes,
        options: RpcServerOptions,
        metrics: RpcMetrics,
        interceptors: InterceptorChain,
    ) -> Self {
        Self {
            routes,
            options,
            metrics,
            interceptors,
            reflection: None,
        }
    }

    /// Serve gRPC reflection for the given encoded file descriptor sets.
    ///
    /// The reflection service describes itself even when no set is given.
    pub(crate) fn reflection(mut self, descriptor_sets: Option<Vec<&'static [u8]>>) -> Self {
        self.reflection = descriptor_sets;
        self
    }

    /// Serve until `shutdown` is cancelled and in-flight calls complete.
    pub(crate) async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let layers = ServiceBuilder::new()
            .layer(CatchPanicLayer::custom(rpc_panic_response))
            .layer(RequestValidationLayer)
            .layer(RpcMetricsLayer::new(self.metrics))
            .layer(tonic::service::interceptor(self.interceptors));

        debug!(
            options = ?self.options,
            "Serving gRPC"
        );
        let mut routes = self.routes;
        if let Some(descriptor_sets) = self.reflection {
            let mut builder = tonic_reflection::server::Builder::configure();
            for set in descriptor_sets {
                builder = builder.register_encoded_file_descriptor_set(set);
            }
            routes = routes.add_service(builder.build_v1()?);
        }

        let incoming = TcpListenerStream::new(listener);
        self.options
            .apply(Server::builder())
            .layer(layers)
            .add_routes(routes)
            .serve_with_incoming_shutdown(incoming, shutdown.cancelled_owned())
            .await?;

        Ok(())
    }
}
