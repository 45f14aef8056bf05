//! Route lookup and dispatch.
//!
//! # Responsibilities
//! - Store compiled routes in registration order
//! - Match (method, path) against them, first registered wins
//! - Extract path parameters into the request context
//! - Produce the terminal handler of a middleware chain
//!
//! # Design Decisions
//! - Immutable once published: rebuilding creates a new router
//! - O(routes × segments) scan, no reordering by specificity
//! - A miss falls through to the fallback or the app's not-found handler

use std::collections::HashMap;
use std::sync::Arc;

use hyper::Method;

use crate::context::Context;
use crate::handler::Handler;
use crate::route::Route;

/// A compiled router for one scope.
#[derive(Debug, Clone, Default)]
pub struct Router {
    /// (position in the route table, route), sorted by position
    entries: Vec<(usize, Arc<Route>)>,
    named: HashMap<String, Vec<usize>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `route` at logical `position` and records the position under
    /// the route's name. Duplicate names are kept side by side.
    pub fn add(&mut self, route: Arc<Route>, position: usize) {
        self.named.entry(route.name.clone()).or_default().push(position);
        let at = self.entries.partition_point(|(existing, _)| *existing <= position);
        self.entries.insert(at, (position, route));
    }

    /// Routes in match order.
    pub fn routes(&self) -> impl Iterator<Item = &Arc<Route>> {
        self.entries.iter().map(|(_, route)| route)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Route name to route table positions.
    pub fn named_routes(&self) -> &HashMap<String, Vec<usize>> {
        &self.named
    }

    /// Finds the first route matching `method` and `path`.
    ///
    /// On a match `values` holds the parameter values, in the order of the
    /// route's `params`.
    pub fn find(&self, method: &Method, path: &str, values: &mut Vec<String>) -> Option<&Arc<Route>> {
        self.routes().find(|route| {
            values.clear();
            route.matches(method, path, values)
        })
    }

    /// Returns the terminal handler for this router.
    ///
    /// It matches the context's request, stores the parameters on the
    /// context and runs the matched route's chain. Without a match it runs
    /// `fallback`, or the app's not-found handler when there is none.
    pub fn handle(self: Arc<Self>, fallback: Option<Handler>) -> Handler {
        Handler::named("weft::router::Router::handle", move |c: &mut Context| {
            let mut values = c.take_param_values();
            let route = self.find(c.method(), c.path(), &mut values).cloned();
            match route {
                Some(route) => {
                    c.set_route(route.clone(), values);
                    route.chain().handle(c)
                }
                None => {
                    c.restore_param_values(values);
                    match &fallback {
                        Some(fallback) => fallback.handle(c),
                        None => c.not_found(),
                    }
                }
            }
        })
    }
}
