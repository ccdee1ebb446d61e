//! Route matching for the micro HTTP gateway.
//!
//! The gateway deliberately avoids a general purpose router. A route is a
//! method, a [`Pattern`] and a [`Handler`]; the [`RouteTable`] resolves a
//! request by scanning routes in registration order:
//!
//! - Literal patterns match exactly one path
//! - The wildcard pattern matches every path
//! - The first registered match wins, there is no specificity ranking
//! - A fallback route, if set, is consulted only after every registered route
//!
//! # Example
//!
//! ```no_run
//! use axum::http::Method;
//! use routing::{Pattern, Resolution, Route, RouteTable};
//! use tonic::Status;
//!
//! let mut table = RouteTable::new();
//! table.register(Route::new(Method::GET, "/test", |_req, _params| async {
//!     Ok::<_, Status>("Hello!")
//! }));
//! table.set_fallback(Route::with_pattern(
//!     Method::GET,
//!     Pattern::wildcard(),
//!     |_req, _params| async { Err::<&'static str, _>(Status::not_found("Not Found")) },
//! ));
//!
//! assert!(matches!(table.resolve(&Method::GET, "/test"), Resolution::Matched { .. }));
//! ```

pub mod pattern;
pub mod route;
pub mod table;

pub use pattern::{PathParams, Pattern};
pub use route::{Handler, HandlerResult, Route};
pub use table::{Resolution, RouteTable};
