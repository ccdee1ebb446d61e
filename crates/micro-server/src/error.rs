//! Error types for the service orchestrator.

use std::fmt;
use std::net::SocketAddr;

/// Boxed error returned by caller-supplied collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A specialized Result type for service operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Which of the two listeners an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Listener {
    /// The gRPC listener.
    Rpc,
    /// The HTTP gateway listener.
    Http,
}

impl fmt::Display for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Listener::Rpc => f.write_str("rpc"),
            Listener::Http => f.write_str("http"),
        }
    }
}

/// Errors surfaced by [`Service::start`](crate::Service::start).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to bind {listener} listener on {addr}: {source}")]
    Bind {
        listener: Listener,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("{listener} listener failed: {source}")]
    Serve {
        listener: Listener,
        #[source]
        source: std::io::Error,
    },

    #[error("rpc server error: {0}")]
    Rpc(#[from] tonic::transport::Error),

    #[error("invalid rpc endpoint {uri}: {source}")]
    Endpoint {
        uri: String,
        #[source]
        source: tonic::transport::Error,
    },

    #[error("reverse proxy registration failed: {0}")]
    ReverseProxy(#[source] BoxError),

    #[error("failed to install handler for {signal}: {source}")]
    Signal {
        signal: crate::signals::ShutdownSignal,
        #[source]
        source: std::io::Error,
    },

    #[error("{listener} listener panicked: {message}")]
    Panic { listener: Listener, message: String },

    #[error("failed to build reflection service: {0}")]
    Reflection(#[from] tonic_reflection::server::Error),

    #[error("service has already been started")]
    AlreadyStarted,
}

impl Error {
    /// The listener this error belongs to, if it is listener specific.
    pub fn listener(&self) -> Option<Listener> {
        match self {
            Error::Bind { listener, .. }
            | Error::Serve { listener, .. }
            | Error::Panic { listener, .. } => Some(*listener),
            Error::Rpc(_) | Error::Reflection(_) => Some(Listener::Rpc),
            Error::Endpoint { .. } | Error::ReverseProxy(_) => Some(Listener::Http),
            Error::Signal { .. } | Error::AlreadyStarted => None,
        }
    }

    /// Whether the error is an address-in-use bind failure.
    pub fn is_addr_in_use(&self) -> bool {
        matches!(
            self,
            Error::Bind { source, .. } if source.kind() == std::io::ErrorKind::AddrInUse
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_error_display_and_listener() {
        let err = Error::Bind {
            listener: Listener::Rpc,
            addr: "0.0.0.0:9999".parse().unwrap(),
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };

        assert!(err.to_string().starts_with("failed to bind rpc listener on 0.0.0.0:9999"));
        assert_eq!(err.listener(), Some(Listener::Rpc));
        assert!(err.is_addr_in_use());
    }

    #[test]
    fn test_reverse_proxy_error_belongs_to_http() {
        let err = Error::ReverseProxy("reverse proxy func error".into());
        assert_eq!(
            err.to_string(),
            "reverse proxy registration failed: reverse proxy func error"
        );
        assert_eq!(err.listener(), Some(Listener::Http));
        assert!(!err.is_addr_in_use());
    }
}
