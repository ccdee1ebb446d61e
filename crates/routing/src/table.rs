//! Ordered route table.

use crate::pattern::PathParams;
use crate::route::Route;
use axum::http::Method;

/// Outcome of [`RouteTable::resolve`].
#[derive(Debug)]
pub enum Resolution<'a> {
    /// A route claimed the request.
    Matched {
        route: &'a Route,
        params: PathParams,
    },
    /// Nothing matched, not even the fallback.
    NotFound,
}

impl Resolution<'_> {
    /// Whether a route claimed the request.
    pub fn is_matched(&self) -> bool {
        matches!(self, Resolution::Matched { .. })
    }
}

/// Routes in registration order plus an optional catch-all fallback.
///
/// Resolution is a linear scan: the earliest registered route whose method
/// and pattern match wins. The fallback is only consulted after every
/// registered route has been tried, regardless of when it was set.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
    fallback: Option<Route>,
}

impl RouteTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a route.
    pub fn register(&mut self, route: Route) {
        self.routes.push(route);
    }

    /// Set the catch-all route, returning the previous one.
    pub fn set_fallback(&mut self, route: Route) -> Option<Route> {
        self.fallback.replace(route)
    }

    /// Whether a fallback route is set.
    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    /// Resolve a request to its handler.
    pub fn resolve(&self, method: &Method, path: &str) -> Resolution<'_> {
        self.routes
            .iter()
            .chain(self.fallback.iter())
            .find_map(|route| {
                route
                    .matches(method, path)
                    .map(|params| Resolution::Matched { route, params })
            })
            .unwrap_or(Resolution::NotFound)
    }

    /// Number of registered routes, excluding the fallback.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether no route is registered (the fallback is not counted).
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Registered routes in resolution order, excluding the fallback.
    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter()
    }
}

impl Extend<Route> for RouteTable {
    fn extend<I: IntoIterator<Item = Route>>(&mut self, iter: I) {
        self.routes.extend(iter);
    }
}
