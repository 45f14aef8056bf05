//! The route registration API shared by [`App`], [`Group`](crate::Group)
//! and [`Host`](crate::Host).

use std::path::PathBuf;

use hyper::Method;

use crate::app::App;
use crate::context::Context;
use crate::handler::{Handler, IntoHandler, Middleware};
use crate::route::{RouteMethod, METHODS};
use crate::static_files;

/// Route registration.
///
/// Implementors only provide [`add_route`](RouteRegister::add_route); every
/// other method is expressed through it. Handlers go through
/// [`IntoHandler`] once, here, and through the app's handler wrappers.
pub trait RouteRegister {
    /// The app the routes end up in.
    fn app(&self) -> &App;

    /// Registers one route with optional route-level middleware.
    fn add_route(
        &self,
        method: RouteMethod,
        path: &str,
        handler: Handler,
        middleware: &[Middleware],
    ) -> RouteRef;

    /// Registers a route for a method given by name. `*` matches every method.
    ///
    /// An unknown method is logged and nothing is registered.
    fn add(
        &self,
        method: &str,
        path: &str,
        handler: impl IntoHandler,
        middleware: &[Middleware],
    ) -> RouteRef
    where
        Self: Sized,
    {
        match RouteMethod::parse(method) {
            Some(method) => self.add_route(method, path, handler.into_handler(), middleware),
            None => {
                log::error!("invalid method {method:?} for route {path}");
                RouteRef::new(self.app().clone(), Vec::new())
            }
        }
    }

    fn get(&self, path: &str, handler: impl IntoHandler) -> RouteRef
    where
        Self: Sized,
    {
        self.add_route(Method::GET.into(), path, handler.into_handler(), &[])
    }

    fn post(&self, path: &str, handler: impl IntoHandler) -> RouteRef
    where
        Self: Sized,
    {
        self.add_route(Method::POST.into(), path, handler.into_handler(), &[])
    }

    fn put(&self, path: &str, handler: impl IntoHandler) -> RouteRef
    where
        Self: Sized,
    {
        self.add_route(Method::PUT.into(), path, handler.into_handler(), &[])
    }

    fn delete(&self, path: &str, handler: impl IntoHandler) -> RouteRef
    where
        Self: Sized,
    {
        self.add_route(Method::DELETE.into(), path, handler.into_handler(), &[])
    }

    fn patch(&self, path: &str, handler: impl IntoHandler) -> RouteRef
    where
        Self: Sized,
    {
        self.add_route(Method::PATCH.into(), path, handler.into_handler(), &[])
    }

    fn head(&self, path: &str, handler: impl IntoHandler) -> RouteRef
    where
        Self: Sized,
    {
        self.add_route(Method::HEAD.into(), path, handler.into_handler(), &[])
    }

    fn options(&self, path: &str, handler: impl IntoHandler) -> RouteRef
    where
        Self: Sized,
    {
        self.add_route(Method::OPTIONS.into(), path, handler.into_handler(), &[])
    }

    fn connect(&self, path: &str, handler: impl IntoHandler) -> RouteRef
    where
        Self: Sized,
    {
        self.add_route(Method::CONNECT.into(), path, handler.into_handler(), &[])
    }

    fn trace(&self, path: &str, handler: impl IntoHandler) -> RouteRef
    where
        Self: Sized,
    {
        self.add_route(Method::TRACE.into(), path, handler.into_handler(), &[])
    }

    /// Registers one route per listed method, sharing the handler.
    fn match_methods(
        &self,
        methods: &[&str],
        path: &str,
        handler: impl IntoHandler,
        middleware: &[Middleware],
    ) -> RouteRef
    where
        Self: Sized,
    {
        let handler = handler.into_handler();
        let mut routes = RouteRef::new(self.app().clone(), Vec::new());
        for method in methods {
            routes.merge(self.add(method, path, handler.clone(), middleware));
        }
        routes
    }

    /// Like [`match_methods`](RouteRegister::match_methods) with the methods
    /// in one string, e.g. `"GET,POST"` or `"GET POST"`.
    fn route(
        &self,
        methods: &str,
        path: &str,
        handler: impl IntoHandler,
        middleware: &[Middleware],
    ) -> RouteRef
    where
        Self: Sized,
    {
        let methods: Vec<&str> = methods
            .split(|ch: char| !(ch.is_ascii_alphabetic() || ch == '*'))
            .filter(|m| !m.is_empty())
            .collect();
        self.match_methods(&methods, path, handler, middleware)
    }

    /// Registers the handler for every method in [`METHODS`]. The routes
    /// share one name.
    fn any(&self, path: &str, handler: impl IntoHandler, middleware: &[Middleware]) -> RouteRef
    where
        Self: Sized,
    {
        let handler = handler.into_handler();
        let mut routes = RouteRef::new(self.app().clone(), Vec::new());
        for method in METHODS {
            routes.merge(self.add_route(method.into(), path, handler.clone(), middleware));
        }
        routes
    }

    /// Serves files below `root` (default `.`) under `prefix`.
    fn static_files(&self, prefix: &str, root: &str) -> RouteRef
    where
        Self: Sized,
    {
        let root = if root.is_empty() { "." } else { root };
        self.add_route(
            Method::GET.into(),
            &format!("{}/*", prefix.trim_end_matches('/')),
            static_files::handler(PathBuf::from(root)),
            &[],
        )
    }

    /// Serves one file at `path`.
    fn file(&self, path: &str, file: &str) -> RouteRef
    where
        Self: Sized,
    {
        let file = PathBuf::from(file);
        self.add_route(
            Method::GET.into(),
            path,
            Handler::named("weft::static_files::file", move |c: &mut Context| c.file(&file)),
            &[],
        )
    }
}

/// Handle to routes just registered, for naming them or attaching
/// route-level middleware.
///
/// ```
/// use weft::{App, Context, RouteRegister};
///
/// let app = App::new();
/// app.get("/user/:id", |c: &mut Context| c.no_content(204))
///     .name("getUser");
/// assert_eq!(app.uri("getUser", [("id", "42")]), "/user/42");
/// ```
#[derive(Debug, Clone)]
pub struct RouteRef {
    app: App,
    indices: Vec<usize>,
}

impl RouteRef {
    pub(crate) fn new(app: App, indices: Vec<usize>) -> Self {
        Self { app, indices }
    }

    fn merge(&mut self, other: RouteRef) {
        self.indices.extend(other.indices);
    }

    /// Positions of the routes in [`App::routes`].
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Overrides the name used by [`App::uri`].
    pub fn name(self, name: &str) -> Self {
        self.app.update_routes(&self.indices, |route| route.set_name(name.to_owned()));
        self
    }

    /// Appends route-level middleware, run inside group middleware.
    pub fn middleware(self, middleware: Middleware) -> Self {
        let middleware = self.app.wrap_middleware(middleware);
        self.app
            .update_routes(&self.indices, |route| route.push_middleware(middleware.clone()));
        self
    }
}
