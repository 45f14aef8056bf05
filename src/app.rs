//! The application: route registry, middleware, services and dispatch.
//!
//! # Responsibilities
//! - Collect route definitions, groups, hosts and global middleware
//! - Compile them into routers (one default, one per host)
//! - Resolve a request's host to a router and run its middleware chain
//! - Report handler errors through the HTTP error handler
//!
//! # Design Decisions
//! - Registration locks a setup mutex; dispatch never takes it unless routes
//!   changed since the last compile
//! - Compiled state is an immutable snapshot published with one atomic swap,
//!   so a request sees either the old or the new configuration
//! - Chains are built lazily per scope; any middleware change publishes
//!   fresh, empty chain caches
//! - Contexts come from a bounded pool and are returned even on panic

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwap;
use hyper::Method;

use crate::chain::{self, ChainCache};
use crate::config::ServerConfig;
use crate::context::Context;
use crate::error::{status_text, EngineResult, Error};
use crate::group::{is_wildcard, wildcard_matches, Group, GroupState, Host, HostState};
use crate::handler::{Handler, IntoHandler, Meta, MetaHandler, Middleware};
use crate::http::{Request, Response};
use crate::pool::ContextPool;
use crate::register::{RouteRef, RouteRegister};
use crate::render::{self, Binder, DefaultBinder, FormatRenderer, Renderer};
use crate::route::{normalize_path, Route, RouteMethod, RouteTable};
use crate::router::Router;
use crate::server::{ConnectionInfo, Engine, Service};
use crate::session::SessionOptions;

/// Turns an error returned by the middleware chain into a response.
pub type HttpErrorHandler = Arc<dyn Fn(Error, &mut Context) + Send + Sync>;

/// Adapts a handler at registration; the first wrapper returning `Some` wins.
pub type HandlerWrapper = Arc<dyn Fn(Handler) -> Option<Handler> + Send + Sync>;

/// Adapts a middleware at registration; the first wrapper returning `Some` wins.
pub type MiddlewareWrapper = Arc<dyn Fn(Middleware) -> Option<Middleware> + Send + Sync>;

/// Locks a mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        log::error!("recovering poisoned lock");
        poisoned.into_inner()
    })
}

/// Collaborators and settings consulted while handling a request.
#[derive(Clone)]
pub(crate) struct Services {
    pub(crate) debug: bool,
    pub(crate) renderer: Option<Arc<dyn Renderer>>,
    pub(crate) binder: Arc<dyn Binder>,
    pub(crate) http_error_handler: HttpErrorHandler,
    pub(crate) not_found: Option<Handler>,
    pub(crate) accept_formats: HashMap<String, String>,
    pub(crate) format_renderers: HashMap<String, FormatRenderer>,
    pub(crate) parse_header_accept: bool,
    pub(crate) jsonp_var_name: String,
    pub(crate) session_options: SessionOptions,
}

impl Default for Services {
    fn default() -> Self {
        Self {
            debug: false,
            renderer: None,
            binder: Arc::new(DefaultBinder),
            http_error_handler: Arc::new(default_http_error_handler),
            not_found: None,
            accept_formats: render::default_accept_formats(),
            format_renderers: render::default_format_renderers(),
            parse_header_accept: false,
            jsonp_var_name: "callback".to_owned(),
            session_options: SessionOptions::default(),
        }
    }
}

/// The default HTTP error handler.
///
/// An [`HttpError`](crate::HttpError) answers with its code and message,
/// anything else with 500. In debug mode the message is the error's own
/// text. HEAD requests get no body, and nothing is written when the
/// response was already committed.
pub fn default_http_error_handler(err: Error, c: &mut Context) {
    let (code, mut message) = match err.as_http() {
        Some(http) => (http.code, http.message.clone()),
        None => (500, status_text(500).to_owned()),
    };
    if c.services.debug {
        message = err.to_string();
    }
    if !c.response().committed() {
        let written = if *c.method() == Method::HEAD {
            c.no_content(code)
        } else {
            c.string(code, message)
        };
        if let Err(write_err) = written {
            log::error!("writing error response: {write_err}");
        }
    }
    log::debug!("{err}");
}

/// Parameters for [`App::uri`].
///
/// Positional values fill the `:name` and `*` slots in order. Keyed values
/// fill slots by name; keys that name no slot are appended as a query
/// string sorted by key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum UriParams {
    #[default]
    None,
    Positional(Vec<String>),
    Keyed(BTreeMap<String, String>),
    Values(BTreeMap<String, Vec<String>>),
}

impl From<()> for UriParams {
    fn from(_: ()) -> Self {
        UriParams::None
    }
}

impl From<Vec<String>> for UriParams {
    fn from(values: Vec<String>) -> Self {
        UriParams::Positional(values)
    }
}

impl From<Vec<&str>> for UriParams {
    fn from(values: Vec<&str>) -> Self {
        UriParams::Positional(values.into_iter().map(str::to_owned).collect())
    }
}

impl<const N: usize> From<[&str; N]> for UriParams {
    fn from(values: [&str; N]) -> Self {
        UriParams::Positional(values.iter().map(|v| (*v).to_owned()).collect())
    }
}

impl<const N: usize> From<[(&str, &str); N]> for UriParams {
    fn from(pairs: [(&str, &str); N]) -> Self {
        UriParams::Keyed(
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
        )
    }
}

impl From<BTreeMap<String, String>> for UriParams {
    fn from(map: BTreeMap<String, String>) -> Self {
        UriParams::Keyed(map)
    }
}

impl From<HashMap<String, String>> for UriParams {
    fn from(map: HashMap<String, String>) -> Self {
        UriParams::Keyed(map.into_iter().collect())
    }
}

impl From<BTreeMap<String, Vec<String>>> for UriParams {
    fn from(values: BTreeMap<String, Vec<String>>) -> Self {
        UriParams::Values(values)
    }
}

impl From<HashMap<String, Vec<String>>> for UriParams {
    fn from(values: HashMap<String, Vec<String>>) -> Self {
        UriParams::Values(values.into_iter().collect())
    }
}

fn build_uri(route: &Route, params: UriParams) -> String {
    let pattern = route.pattern();
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    let path = match params {
        UriParams::None => pattern.render(|_, _| None),
        UriParams::Positional(values) => pattern.render(|i, _| values.get(i).map(String::as_str)),
        UriParams::Keyed(mut map) => {
            let path = pattern.render(|_, name| map.get(name).map(String::as_str));
            for name in &route.params {
                map.remove(name);
            }
            for (key, value) in &map {
                query.append_pair(key, value);
            }
            path
        }
        UriParams::Values(mut map) => {
            let path = pattern.render(|_, name| {
                map.get(name).and_then(|values| values.first()).map(String::as_str)
            });
            for name in &route.params {
                map.remove(name);
            }
            for (key, values) in &map {
                for value in values {
                    query.append_pair(key, value);
                }
            }
            path
        }
    };
    let query = query.finish();
    if query.is_empty() {
        path
    } else {
        format!("{path}?{query}")
    }
}

/// One routing scope: the default router or a virtual host.
struct Scope {
    host: String,
    router: Arc<Router>,
    chain: ChainCache,
}

impl Scope {
    fn new(host: String, router: Arc<Router>) -> Self {
        Self {
            host,
            router,
            chain: ChainCache::new(),
        }
    }
}

/// The routers of every scope and the global middleware wrapped around them.
struct Scopes {
    middleware: Vec<Middleware>,
    default: Scope,
    hosts: Vec<Scope>,
    exact: HashMap<String, usize>,
    /// Suffix patterns (`.example.com`) first, then prefix patterns (`api.`)
    wildcards: Vec<usize>,
}

impl Scopes {
    fn new(middleware: Vec<Middleware>, default: Arc<Router>, hosts: Vec<(String, Arc<Router>)>) -> Self {
        let mut exact = HashMap::new();
        let mut suffixes = Vec::new();
        let mut prefixes = Vec::new();
        for (i, (name, _)) in hosts.iter().enumerate() {
            if !is_wildcard(name) {
                exact.insert(name.clone(), i);
            } else if name.starts_with('.') {
                suffixes.push(i);
            } else {
                prefixes.push(i);
            }
        }
        suffixes.extend(prefixes);
        Self {
            middleware,
            default: Scope::new(String::new(), default),
            hosts: hosts
                .into_iter()
                .map(|(name, router)| Scope::new(name, router))
                .collect(),
            exact,
            wildcards: suffixes,
        }
    }

    /// The scope serving `host`; the default one when no host matches.
    fn find(&self, host: &str) -> &Scope {
        if let Some(&i) = self.exact.get(host) {
            return &self.hosts[i];
        }
        self.wildcards
            .iter()
            .map(|&i| &self.hosts[i])
            .find(|scope| wildcard_matches(&scope.host, host))
            .unwrap_or(&self.default)
    }

    fn chain(&self, scope: &Scope) -> Handler {
        scope
            .chain
            .get_or_build(|| chain::build(&self.middleware, scope.router.clone().handle(None)))
    }

    fn host_routers(&self) -> Vec<(String, Arc<Router>)> {
        self.hosts
            .iter()
            .map(|scope| (scope.host.clone(), scope.router.clone()))
            .collect()
    }
}

/// Everything dispatch reads, published as one unit.
struct Compiled {
    table: Arc<RouteTable>,
    scopes: Arc<Scopes>,
    services: Arc<Services>,
}

/// Registration state, guarded by the setup mutex.
struct Setup {
    prefix: String,
    middleware: Vec<Middleware>,
    routes: Vec<Route>,
    hosts: HashMap<String, Arc<HostState>>,
    host_order: Vec<String>,
    groups: HashMap<String, Arc<GroupState>>,
    services: Services,
    handler_wrappers: Vec<HandlerWrapper>,
    middleware_wrappers: Vec<MiddlewareWrapper>,
    route_debug: bool,
    middleware_debug: bool,
}

impl Setup {
    fn wrap_handler(&self, handler: Handler) -> Handler {
        self.handler_wrappers
            .iter()
            .find_map(|wrapper| wrapper(handler.clone()))
            .unwrap_or(handler)
    }

    fn wrap_middleware(&self, middleware: Middleware) -> Middleware {
        self.middleware_wrappers
            .iter()
            .find_map(|wrapper| wrapper(middleware.clone()))
            .unwrap_or(middleware)
    }

    fn host_index(&self, host: &str) -> Option<usize> {
        if host.is_empty() {
            return None;
        }
        self.host_order.iter().position(|name| name == host)
    }

    /// Applies `route` and adds it to the router of its host.
    fn compile_route(
        &self,
        route: &Route,
        table: &mut RouteTable,
        default: &mut Router,
        hosts: &mut [Router],
    ) {
        let position = table.len();
        let applied = Arc::new(route.apply(&self.prefix));
        if self.route_debug {
            log::debug!(
                "Route: {:>7} {:<30} -> {}",
                applied.method.to_string(),
                format!("{}{}", applied.host, applied.path),
                applied.name
            );
        }
        let router = match self.host_index(&applied.host) {
            Some(i) => &mut hosts[i],
            None => default,
        };
        router.add(applied.clone(), position);
        table.push(applied);
    }
}

struct Inner {
    setup: Mutex<Setup>,
    published: ArcSwap<Compiled>,
    routes_dirty: AtomicBool,
    pool: ContextPool,
    engine: Mutex<Option<Arc<dyn Engine>>>,
}

/// A web application.
///
/// `App` is a cheap handle: clones share the same routes, middleware and
/// services. Registration may continue while requests are served; routes
/// added late are compiled on the next request.
///
/// ```
/// use weft::{App, Context, Middleware, Handler, RouteRegister};
///
/// let app = App::new();
/// app.use_(Middleware::from_fn(|c: &mut Context, next: &Handler| {
///     c.set("greeting", "hello");
///     next.handle(c)
/// }));
/// app.get("/hello/:name", |c: &mut Context| {
///     let greeting = c.get("greeting").and_then(|v| v.as_str()).unwrap_or("").to_owned();
///     let name = c.param("name").to_owned();
///     c.string(200, format!("{greeting}, {name}"))
/// });
///
/// let mut response = app.serve_http(
///     weft::hyper::Request::builder()
///         .uri("/hello/world")
///         .body(weft::Body::empty())
///         .unwrap(),
/// );
/// assert_eq!(&response.body_mut().read_all().unwrap()[..], b"hello, world");
/// ```
#[derive(Clone)]
pub struct App {
    inner: Arc<Inner>,
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

impl App {
    pub fn new() -> Self {
        Self::with_config(&ServerConfig::default())
    }

    /// Creates an app taking the debug toggles and pool size from `config`.
    pub fn with_config(config: &ServerConfig) -> Self {
        let services = Services {
            debug: config.debug,
            ..Services::default()
        };
        let compiled = Compiled {
            table: Arc::new(RouteTable::default()),
            scopes: Arc::new(Scopes::new(Vec::new(), Arc::new(Router::new()), Vec::new())),
            services: Arc::new(services.clone()),
        };
        let setup = Setup {
            prefix: String::new(),
            middleware: Vec::new(),
            routes: Vec::new(),
            hosts: HashMap::new(),
            host_order: Vec::new(),
            groups: HashMap::new(),
            services,
            handler_wrappers: Vec::new(),
            middleware_wrappers: Vec::new(),
            route_debug: config.route_debug,
            middleware_debug: config.middleware_debug,
        };
        Self {
            inner: Arc::new(Inner {
                setup: Mutex::new(setup),
                published: ArcSwap::from_pointee(compiled),
                routes_dirty: AtomicBool::new(false),
                pool: ContextPool::new(config.max_idle_contexts),
                engine: Mutex::new(None),
            }),
        }
    }

    fn setup(&self) -> MutexGuard<'_, Setup> {
        lock(&self.inner.setup)
    }

    pub(crate) fn mark_routes_dirty(&self) {
        self.inner.routes_dirty.store(true, Ordering::Release);
    }

    // Registration

    pub(crate) fn register(
        &self,
        method: RouteMethod,
        path: &str,
        handler: Handler,
        middleware: &[Middleware],
        group: Option<Arc<GroupState>>,
    ) -> RouteRef {
        let mut setup = self.setup();
        let handler = setup.wrap_handler(handler);
        let mut route = Route::new(method, path, handler, group);
        for m in middleware {
            route.push_middleware(setup.wrap_middleware(m.clone()));
        }
        let index = setup.routes.len();
        setup.routes.push(route);
        self.mark_routes_dirty();
        RouteRef::new(self.clone(), vec![index])
    }

    pub(crate) fn update_routes(&self, indices: &[usize], mut update: impl FnMut(&mut Route)) {
        let mut setup = self.setup();
        for &i in indices {
            if let Some(route) = setup.routes.get_mut(i) {
                update(route);
            }
        }
        self.mark_routes_dirty();
    }

    pub(crate) fn wrap_middleware(&self, middleware: Middleware) -> Middleware {
        self.setup().wrap_middleware(middleware)
    }

    /// Wraps `handler` with a name and metadata.
    pub fn meta_handler(&self, meta: Meta, handler: impl IntoHandler) -> Handler {
        let handler = self.setup().wrap_handler(handler.into_handler());
        MetaHandler::new(meta, handler).into_handler()
    }

    pub fn add_handler_wrapper<F>(&self, wrapper: F) -> &Self
    where
        F: Fn(Handler) -> Option<Handler> + Send + Sync + 'static,
    {
        self.setup().handler_wrappers.push(Arc::new(wrapper));
        self
    }

    pub fn add_middleware_wrapper<F>(&self, wrapper: F) -> &Self
    where
        F: Fn(Middleware) -> Option<Middleware> + Send + Sync + 'static,
    {
        let mut setup = self.setup();
        setup.middleware_wrappers.push(Arc::new(wrapper));
        self.republish(&setup);
        self
    }

    /// Sets a path prefix for every route, e.g. `/v1`.
    pub fn set_prefix(&self, prefix: &str) -> &Self {
        if prefix.is_empty() {
            return self;
        }
        let prefix = normalize_path(prefix);
        self.setup().prefix = if prefix == "/" { String::new() } else { prefix };
        self.mark_routes_dirty();
        self
    }

    pub fn prefix(&self) -> String {
        self.setup().prefix.clone()
    }

    /// Returns the group for `prefix`, creating it on first use. The given
    /// middleware is appended to the group's middleware.
    pub fn group(&self, prefix: &str, middleware: &[Middleware]) -> Group {
        let state = self
            .setup()
            .groups
            .entry(normalize_path(prefix))
            .or_insert_with(|| Arc::new(GroupState::new(prefix, "", None)))
            .clone();
        let group = Group::new(self.clone(), state);
        group.use_all(middleware);
        group
    }

    /// Returns the virtual host `name`, creating it on first use. The given
    /// middleware is appended to the host's middleware. An empty name
    /// matches any host: its routes land on the default router.
    pub fn host(&self, name: &str, middleware: &[Middleware]) -> Host {
        let name = name.trim().to_ascii_lowercase();
        let state = {
            let mut setup = self.setup();
            match setup.hosts.get(&name) {
                Some(state) => state.clone(),
                None => {
                    let state = Arc::new(HostState::new(&name));
                    setup.hosts.insert(name.clone(), state.clone());
                    // The empty host registers on the default router.
                    if !name.is_empty() {
                        setup.host_order.push(name);
                        self.mark_routes_dirty();
                    }
                    state
                }
            }
        };
        let host = Host::new(self.clone(), state);
        host.use_all(middleware);
        host
    }

    /// Every host, in creation order.
    pub fn hosts(&self) -> Vec<Host> {
        let setup = self.setup();
        setup
            .host_order
            .iter()
            .filter_map(|name| setup.hosts.get(name))
            .map(|state| Host::new(self.clone(), state.clone()))
            .collect()
    }

    // Middleware

    /// Appends global middleware; it runs after the middleware added before it.
    pub fn use_(&self, middleware: Middleware) -> &Self {
        let mut setup = self.setup();
        if setup.middleware_debug {
            log::debug!("Middleware[Use]: {}", middleware.name());
        }
        setup.middleware.push(middleware);
        self.republish(&setup);
        self
    }

    /// Prepends global middleware; it runs before everything added so far.
    pub fn pre(&self, middleware: Middleware) -> &Self {
        let mut setup = self.setup();
        if setup.middleware_debug {
            log::debug!("Middleware[Pre]: {}", middleware.name());
        }
        setup.middleware.insert(0, middleware);
        self.republish(&setup);
        self
    }

    /// Alias of [`pre`](App::pre).
    pub fn pre_use(&self, middleware: Middleware) -> &Self {
        self.pre(middleware)
    }

    /// Removes the given global middleware, compared by identity, or all of
    /// it when `middleware` is empty.
    pub fn clear(&self, middleware: &[Middleware]) -> &Self {
        let mut setup = self.setup();
        if middleware.is_empty() {
            setup.middleware.clear();
        } else {
            setup.middleware.retain(|m| !middleware.contains(m));
        }
        self.republish(&setup);
        self
    }

    // Services

    pub fn set_debug(&self, on: bool) -> &Self {
        self.update_services(|services| services.debug = on)
    }

    pub fn debug(&self) -> bool {
        self.setup().services.debug
    }

    pub fn set_route_debug(&self, on: bool) -> &Self {
        self.setup().route_debug = on;
        self
    }

    pub fn set_middleware_debug(&self, on: bool) -> &Self {
        self.setup().middleware_debug = on;
        self
    }

    pub fn set_renderer(&self, renderer: impl Renderer + 'static) -> &Self {
        let renderer: Arc<dyn Renderer> = Arc::new(renderer);
        self.update_services(move |services| services.renderer = Some(renderer))
    }

    pub fn set_binder(&self, binder: impl Binder + 'static) -> &Self {
        let binder: Arc<dyn Binder> = Arc::new(binder);
        self.update_services(move |services| services.binder = binder)
    }

    pub fn set_http_error_handler<F>(&self, handler: F) -> &Self
    where
        F: Fn(Error, &mut Context) + Send + Sync + 'static,
    {
        let handler: HttpErrorHandler = Arc::new(handler);
        self.update_services(move |services| services.http_error_handler = handler)
    }

    /// Sets the handler run when no route matches.
    pub fn set_not_found_handler(&self, handler: impl IntoHandler) -> &Self {
        let handler = handler.into_handler();
        self.update_services(move |services| services.not_found = Some(handler))
    }

    pub fn set_session_options(&self, options: SessionOptions) -> &Self {
        self.update_services(move |services| services.session_options = options)
    }

    /// Enables `Accept` header parsing in format negotiation.
    pub fn parse_header_accept(&self, on: bool) -> &Self {
        self.update_services(|services| services.parse_header_accept = on)
    }

    pub fn set_accept_formats(&self, formats: HashMap<String, String>) -> &Self {
        self.update_services(move |services| services.accept_formats = formats)
    }

    pub fn add_accept_format(&self, mime: &str, format: &str) -> &Self {
        self.update_services(|services| {
            services.accept_formats.insert(mime.to_owned(), format.to_owned());
        })
    }

    pub fn add_format_renderer<F>(&self, format: &str, renderer: F) -> &Self
    where
        F: Fn(&mut Context, u16, &serde_json::Value) -> crate::Result<()> + Send + Sync + 'static,
    {
        let renderer: FormatRenderer = Arc::new(renderer);
        self.update_services(|services| {
            services.format_renderers.insert(format.to_owned(), renderer);
        })
    }

    pub fn remove_format_renderer(&self, formats: &[&str]) -> &Self {
        self.update_services(|services| {
            for format in formats {
                services.format_renderers.remove(*format);
            }
        })
    }

    /// Sets the query parameter naming the JSONP callback.
    pub fn set_jsonp_var_name(&self, name: &str) -> &Self {
        self.update_services(|services| services.jsonp_var_name = name.to_owned())
    }

    fn update_services(&self, update: impl FnOnce(&mut Services)) -> &Self {
        let mut setup = self.setup();
        update(&mut setup.services);
        self.republish(&setup);
        self
    }

    // Compilation

    /// Publishes the current routers with the current middleware and
    /// services. Chain caches start empty.
    fn republish(&self, setup: &Setup) {
        let current = self.inner.published.load_full();
        self.publish(
            setup,
            current.table.clone(),
            current.scopes.default.router.clone(),
            current.scopes.host_routers(),
        );
    }

    fn publish(
        &self,
        setup: &Setup,
        table: Arc<RouteTable>,
        default: Arc<Router>,
        hosts: Vec<(String, Arc<Router>)>,
    ) {
        let middleware = setup
            .middleware
            .iter()
            .map(|m| setup.wrap_middleware(m.clone()))
            .collect();
        self.inner.published.store(Arc::new(Compiled {
            table,
            scopes: Arc::new(Scopes::new(middleware, default, hosts)),
            services: Arc::new(setup.services.clone()),
        }));
    }

    fn rebuild_locked(&self, setup: &Setup) {
        self.inner.routes_dirty.store(false, Ordering::Release);
        let mut table = RouteTable::default();
        let mut default = Router::new();
        let mut hosts = vec![Router::new(); setup.host_order.len()];
        for route in &setup.routes {
            setup.compile_route(route, &mut table, &mut default, &mut hosts);
        }
        let hosts = setup
            .host_order
            .iter()
            .cloned()
            .zip(hosts.into_iter().map(Arc::new))
            .collect();
        self.publish(setup, Arc::new(table), Arc::new(default), hosts);
    }

    /// Compiles every registered route into new routers and publishes them.
    pub fn rebuild_router(&self) -> &Self {
        let setup = self.setup();
        self.rebuild_locked(&setup);
        self
    }

    /// Replaces the registered routes with `routes` and rebuilds.
    pub fn rebuild_router_with(&self, routes: Vec<Route>) -> &Self {
        let mut setup = self.setup();
        setup.routes = routes;
        self.rebuild_locked(&setup);
        self
    }

    /// Compiles `routes` onto the current routers without recompiling the
    /// existing ones.
    pub fn append_router(&self, routes: Vec<Route>) -> &Self {
        let mut setup = self.setup();
        if self.inner.routes_dirty.load(Ordering::Acquire) {
            setup.routes.extend(routes);
            self.rebuild_locked(&setup);
            return self;
        }

        let current = self.inner.published.load_full();
        let mut table = (*current.table).clone();
        let mut default = (*current.scopes.default.router).clone();
        let mut hosts: Vec<Router> = current
            .scopes
            .hosts
            .iter()
            .map(|scope| (*scope.router).clone())
            .collect();
        for route in routes {
            setup.compile_route(&route, &mut table, &mut default, &mut hosts);
            setup.routes.push(route);
        }
        let hosts = current
            .scopes
            .hosts
            .iter()
            .map(|scope| scope.host.clone())
            .zip(hosts.into_iter().map(Arc::new))
            .collect();
        self.publish(&setup, Arc::new(table), Arc::new(default), hosts);
        self
    }

    /// Recompiles if routes changed since the last compile.
    fn refresh(&self) {
        if self.inner.routes_dirty.load(Ordering::Acquire) {
            let setup = self.setup();
            if self.inner.routes_dirty.load(Ordering::Acquire) {
                self.rebuild_locked(&setup);
            }
        }
    }

    fn compiled(&self) -> Arc<Compiled> {
        self.refresh();
        self.inner.published.load_full()
    }

    // Introspection

    /// Compiled routes in registration order.
    pub fn routes(&self) -> Vec<Arc<Route>> {
        self.compiled().table.routes().to_vec()
    }

    /// Route name to positions in [`routes`](App::routes).
    pub fn named_routes(&self) -> HashMap<String, Vec<usize>> {
        self.compiled().table.named().clone()
    }

    /// Builds the path of the first route named `name`, or an empty string.
    pub fn uri(&self, name: &str, params: impl Into<UriParams>) -> String {
        let compiled = self.compiled();
        match compiled.table.first_named(name) {
            Some(route) => build_uri(route, params.into()),
            None => String::new(),
        }
    }

    /// Like [`uri`](App::uri), naming the route by its handler.
    pub fn uri_for(&self, handler: &Handler, params: impl Into<UriParams>) -> String {
        self.uri(handler.name(), params)
    }

    /// Alias of [`uri`](App::uri).
    pub fn url(&self, name: &str, params: impl Into<UriParams>) -> String {
        self.uri(name, params)
    }

    // Dispatch

    /// Handles one request.
    pub fn serve_http(&self, request: Request) -> Response {
        let compiled = self.compiled();
        let mut c = self.inner.pool.acquire(request, compiled.services.clone());

        let scope = compiled.scopes.find(&c.host());
        let chain = compiled.scopes.chain(scope);
        if let Err(err) = chain.handle(&mut c) {
            c.error(err);
        }
        c.take_response()
    }

    // Lifecycle

    /// Compiles the routes and serves the app on `engine` until it stops.
    pub async fn run(&self, engine: Arc<dyn Engine>) -> EngineResult<()> {
        let service: Arc<dyn Service> = Arc::new(self.clone());
        self.run_with(engine, service).await
    }

    /// Like [`run`](App::run) with a custom service in front of the app.
    pub async fn run_with(&self, engine: Arc<dyn Engine>, service: Arc<dyn Service>) -> EngineResult<()> {
        self.rebuild_router();
        *lock(&self.inner.engine) = Some(engine.clone());
        if self.debug() {
            log::debug!("running in debug mode");
        }
        let result = engine.start(service).await;
        if let Err(err) = &result {
            log::error!("{err}");
        }
        result
    }

    /// Stops the engine started by [`run`](App::run), if any.
    pub fn stop(&self) -> EngineResult<()> {
        let engine = lock(&self.inner.engine).clone();
        match engine {
            Some(engine) => engine.stop(),
            None => Ok(()),
        }
    }
}

impl RouteRegister for App {
    fn app(&self) -> &App {
        self
    }

    fn add_route(
        &self,
        method: RouteMethod,
        path: &str,
        handler: Handler,
        middleware: &[Middleware],
    ) -> RouteRef {
        self.register(method, path, handler, middleware, None)
    }
}

impl Service for App {
    fn call(&self, mut request: Request, info: ConnectionInfo) -> Response {
        request.extensions_mut().insert(info);
        self.serve_http(request)
    }
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let setup = self.setup();
        f.debug_struct("App")
            .field("prefix", &setup.prefix)
            .field("routes", &setup.routes.len())
            .field("hosts", &setup.host_order)
            .field("middleware", &setup.middleware)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HttpError;
    use crate::http::Body;
    use crate::session;
    use crate::StatusCode;
    use std::thread;

    fn request(method: Method, host: &str, uri: &str) -> Request {
        hyper::Request::builder()
            .method(method)
            .uri(uri)
            .header("host", host)
            .body(Body::empty())
            .unwrap()
    }

    fn get(app: &App, uri: &str) -> (StatusCode, String) {
        send(app, request(Method::GET, "localhost", uri))
    }

    fn send(app: &App, request: Request) -> (StatusCode, String) {
        let mut response = app.serve_http(request);
        let body = response.body_mut().read_all().unwrap();
        (response.status(), String::from_utf8(body.to_vec()).unwrap())
    }

    fn text(body: &'static str) -> Handler {
        Handler::named(body, move |c: &mut Context| c.string(200, body))
    }

    fn tag(label: &'static str) -> Middleware {
        Middleware::from_fn(move |c: &mut Context, next: &Handler| {
            let trail = c.get("trail").and_then(|v| v.as_str()).unwrap_or("").to_owned();
            c.set("trail", format!("{trail}{label},"));
            next.handle(c)
        })
    }

    fn trail(c: &mut Context) -> crate::Result<()> {
        let trail = c.get("trail").and_then(|v| v.as_str()).unwrap_or("").to_owned();
        c.string(200, trail)
    }

    /// Tests that middleware changes reach already cached chains.
    #[test]
    fn test_use_and_clear_invalidate_chain() {
        let app = App::new();
        app.get("/", trail);
        assert_eq!(get(&app, "/").1, "");

        let mw = tag("a");
        app.use_(mw.clone());
        assert_eq!(get(&app, "/").1, "a,");

        app.use_(tag("b"));
        app.clear(&[mw]);
        assert_eq!(get(&app, "/").1, "b,");

        app.clear(&[]);
        assert_eq!(get(&app, "/").1, "");
    }

    /// Tests use/pre ordering around group and route middleware.
    #[test]
    fn test_middleware_order() {
        let app = App::new();
        app.use_(tag("use1"));
        app.use_(tag("use2"));
        app.pre_use(tag("pre"));

        let admin = app.group("/admin", &[tag("group")]);
        admin.get("/", trail).middleware(tag("route"));
        assert_eq!(get(&app, "/admin").1, "pre,use1,use2,group,route,");
    }

    /// Tests that group middleware added after its routes still applies.
    #[test]
    fn test_late_group_middleware() {
        let app = App::new();
        let api = app.group("/api", &[]);
        api.get("/ping", trail);
        assert_eq!(get(&app, "/api/ping").1, "");

        app.group("api", &[]).use_(tag("late"));
        assert_eq!(get(&app, "/api/ping").1, "late,");
        assert!(api.same(&app.group("/api/", &[])));
    }

    /// Tests nested groups and the app prefix.
    #[test]
    fn test_prefixes() {
        let app = App::new();
        app.set_prefix("v1/");
        let v2 = app.group("/api", &[]).group("/v2", &[]);
        v2.get("/users/:id", |c: &mut Context| {
            let id = c.param("id").to_owned();
            c.string(200, id)
        });
        assert_eq!(app.routes()[0].path, "/v1/api/v2/users/:id");
        assert_eq!(app.routes()[0].prefix, "/api/v2");
        assert_eq!(get(&app, "/v1/api/v2/users/9").1, "9");
    }

    /// Tests that the earlier of two overlapping routes wins.
    #[test]
    fn test_first_registered_wins() {
        let app = App::new();
        app.get("/users/:id", text("param"));
        app.get("/users/me", text("static"));
        assert_eq!(get(&app, "/users/me").1, "param");
    }

    /// Tests the wildcard parameter through a full dispatch.
    #[test]
    fn test_wildcard_param() {
        let app = App::new();
        app.get("/static/*", |c: &mut Context| {
            let rest = c.param("*").to_owned();
            c.string(200, rest)
        });
        assert_eq!(get(&app, "/static/css/a.css").1, "css/a.css");
    }

    /// Tests that host() hands out the same host for a name.
    #[test]
    fn test_host_idempotent() {
        let app = App::new();
        let a = app.host("api.example.com", &[]);
        let b = app.host("API.example.com", &[]);
        assert!(a.same(&b));
        assert_eq!(app.hosts().len(), 1);
        assert!(!a.same(&app.host("www.example.com", &[])));
    }

    /// Tests that the empty host serves on the default router, with or
    /// without a Host header.
    #[test]
    fn test_empty_host() {
        let app = App::new();
        app.get("/", text("default"));
        let any = app.host("", &[]);
        any.get("/any", text("any"));
        assert!(any.same(&app.host("  ", &[])));
        assert!(app.hosts().is_empty());

        let no_host = |uri: &str| {
            send(&app, hyper::Request::builder().uri(uri).body(Body::empty()).unwrap())
        };
        assert_eq!(no_host("/"), (StatusCode::OK, "default".into()));
        assert_eq!(no_host("/any"), (StatusCode::OK, "any".into()));
        assert_eq!(send(&app, request(Method::GET, "example.com", "/any")).1, "any");
    }

    /// Tests exact, suffix and prefix host matching and the default fallback.
    #[test]
    fn test_host_routing() {
        let app = App::new();
        app.get("/", text("default"));
        app.host(".example.com", &[]).get("/", text("suffix"));
        app.host("api.example.com", &[]).get("/", text("exact"));
        app.host("api.", &[]).get("/", text("prefix"));

        let host = |name: &str| send(&app, request(Method::GET, name, "/")).1;
        assert_eq!(host("api.example.com"), "exact");
        assert_eq!(host("API.Example.com:8080"), "exact");
        assert_eq!(host("foo.example.com"), "suffix");
        assert_eq!(host("a.b.example.com"), "suffix");
        assert_eq!(host("example.com"), "default");
        assert_eq!(host("api.internal"), "prefix");
        assert_eq!(host("myapi.internal"), "default");
    }

    /// Tests that global middleware wraps host routers and host middleware
    /// stays on its host.
    #[test]
    fn test_host_middleware() {
        let app = App::new();
        app.use_(tag("global"));
        app.get("/", trail);
        let admin = app.host("admin.local", &[tag("host")]);
        admin.get("/", trail);

        assert_eq!(send(&app, request(Method::GET, "admin.local", "/")).1, "global,host,");
        assert_eq!(get(&app, "/").1, "global,");
    }

    /// Tests reverse routing with keyed, positional and missing values.
    #[test]
    fn test_uri() {
        let app = App::new();
        app.get("/user/:id", text("user")).name("getUser");
        app.get("/files/:bucket/*", text("files")).name("file");

        assert_eq!(app.uri("getUser", [("id", "42")]), "/user/42");
        assert_eq!(
            app.uri("getUser", [("id", "42"), ("b", "x y"), ("a", "1&2")]),
            "/user/42?a=1%262&b=x+y"
        );
        assert_eq!(app.uri("getUser", ["7"]), "/user/7");
        assert_eq!(app.uri("file", vec!["docs", "a/b.txt"]), "/files/docs/a/b.txt");
        assert_eq!(app.url("getUser", ()), "/user/");
        assert_eq!(app.uri("missing", ["1"]), "");

        let mut values = BTreeMap::new();
        values.insert("id".to_owned(), vec!["5".to_owned()]);
        values.insert("tag".to_owned(), vec!["b".to_owned(), "a".to_owned()]);
        assert_eq!(app.uri("getUser", values), "/user/5?tag=b&tag=a");
    }

    /// Tests reverse routing by handler name.
    #[test]
    fn test_uri_for() {
        let app = App::new();
        let handler = text("show");
        app.get("/show/:id", handler.clone());
        assert_eq!(app.uri_for(&handler, ["3"]), "/show/3");
    }

    /// Tests that closures registered side by side keep separate names.
    #[test]
    fn test_uri_for_closures() {
        let app = App::new();
        let a = Handler::from_fn(|c: &mut Context| c.string(200, "a"));
        let b = Handler::from_fn(|c: &mut Context| c.string(200, "b"));
        app.get("/a/:id", a.clone());
        app.get("/b/:id", b.clone());

        assert_eq!(app.named_routes().len(), 2);
        assert_eq!(app.uri_for(&a, ["1"]), "/a/1");
        assert_eq!(app.uri_for(&b, ["2"]), "/b/2");
    }

    /// Tests that routes sharing a name are all indexed and uri uses the first.
    #[test]
    fn test_duplicate_names() {
        let app = App::new();
        app.post("/items", text("a")).name("items");
        app.post("/items", text("b")).name("items");
        assert_eq!(app.named_routes()["items"], vec![0, 1]);
        assert_eq!(app.uri("items", ()), "/items");

        app.any("/any", text("any"), &[]);
        assert_eq!(app.named_routes()["any"].len(), 9);
    }

    /// Tests method matching helpers and the method mismatch fallback.
    #[test]
    fn test_methods() {
        let app = App::new();
        app.route("GET,POST", "/form", text("form"), &[]);
        app.add("*", "/all", text("all"), &[]);
        app.add("BAD METHOD", "/bad", text("bad"), &[]);

        assert_eq!(send(&app, request(Method::POST, "x", "/form")).1, "form");
        assert_eq!(send(&app, request(Method::PUT, "x", "/form")).0, StatusCode::NOT_FOUND);
        assert_eq!(send(&app, request(Method::DELETE, "x", "/all")).1, "all");
        assert_eq!(app.routes().len(), 3);
    }

    /// Tests that routes registered after the first request are served.
    #[test]
    fn test_hot_registration() {
        let app = App::new();
        app.get("/a", text("a"));
        assert_eq!(get(&app, "/a").1, "a");
        assert_eq!(get(&app, "/b").0, StatusCode::NOT_FOUND);

        app.get("/b", text("b"));
        assert_eq!(get(&app, "/b").1, "b");
    }

    /// Tests incremental compilation.
    #[test]
    fn test_append_router() {
        let app = App::new();
        app.get("/a", text("a"));
        app.rebuild_router();

        let extra = Route::new(Method::GET.into(), "/c", text("c"), None);
        app.append_router(vec![extra]);
        assert_eq!(get(&app, "/c").1, "c");
        assert_eq!(app.named_routes()["c"], vec![1]);

        let replaced = app.routes()[1..].iter().map(|r| (**r).clone()).collect();
        app.rebuild_router_with(replaced);
        assert_eq!(app.routes().len(), 1);
        assert_eq!(get(&app, "/a").0, StatusCode::NOT_FOUND);
        assert_eq!(get(&app, "/c").1, "c");
    }

    /// Tests the default error handler for each kind of error.
    #[test]
    fn test_default_error_handler() {
        let app = App::new();
        app.get("/forbidden", |_c: &mut Context| -> crate::Result<()> {
            Err(HttpError::from_code(403).into())
        });
        app.get("/boom", |_c: &mut Context| -> crate::Result<()> { Err(Error::custom("db down")) });
        app.head("/boom", |_c: &mut Context| -> crate::Result<()> { Err(Error::custom("db down")) });
        app.get("/late", |c: &mut Context| -> crate::Result<()> {
            c.string(201, "done")?;
            Err(Error::custom("after commit"))
        });

        assert_eq!(get(&app, "/forbidden"), (StatusCode::FORBIDDEN, "Forbidden".into()));
        assert_eq!(
            get(&app, "/boom"),
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error".into())
        );
        assert_eq!(
            send(&app, request(Method::HEAD, "x", "/boom")),
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        );
        assert_eq!(get(&app, "/late"), (StatusCode::CREATED, "done".into()));
        assert_eq!(get(&app, "/nowhere"), (StatusCode::NOT_FOUND, "Not Found".into()));

        app.set_debug(true);
        assert_eq!(get(&app, "/boom").1, "db down");
    }

    /// Tests the custom not-found and error handlers.
    #[test]
    fn test_custom_handlers() {
        let app = App::new();
        app.set_not_found_handler(|c: &mut Context| c.string(404, "nothing here"));
        assert_eq!(get(&app, "/x"), (StatusCode::NOT_FOUND, "nothing here".into()));

        app.get("/fail", |_c: &mut Context| -> crate::Result<()> { Err(Error::custom("oops")) });
        app.set_http_error_handler(|err: Error, c: &mut Context| {
            let _ = c.json(599, &serde_json::json!({ "error": err.to_string() }));
        });
        let (status, body) = get(&app, "/fail");
        assert_eq!(status.as_u16(), 599);
        assert_eq!(body, r#"{"error":"oops"}"#);
    }

    /// Tests that handler wrappers adapt handlers at registration.
    #[test]
    fn test_handler_wrapper() {
        let app = App::new();
        app.add_handler_wrapper(|handler: Handler| {
            let name = handler.name().to_owned();
            Some(Handler::named(name, move |c: &mut Context| {
                c.set("trail", "wrapped");
                handler.handle(c)
            }))
        });
        app.get("/", trail);
        assert_eq!(get(&app, "/").1, "wrapped");
        assert_eq!(app.routes()[0].name, "weft::app::tests::trail");
    }

    /// Tests meta handlers keep their metadata through registration.
    #[test]
    fn test_meta_handler() {
        let app = App::new();
        let mut meta = Meta::new();
        meta.insert("perm".into(), "admin".into());
        app.get("/admin", app.meta_handler(meta, trail)).name("admin");
        let routes = app.routes();
        assert_eq!(
            routes[0].handler().meta().and_then(|m| m.get("perm")),
            Some(&serde_json::Value::from("admin"))
        );
        assert_eq!(app.uri("admin", ()), "/admin");
    }

    /// Tests format negotiation through render_data.
    #[test]
    fn test_render_data() {
        let app = App::new();
        app.get("/data", |c: &mut Context| {
            c.render_data(200, "data.html", &serde_json::json!({"n": 1}))
        });
        assert_eq!(get(&app, "/data?format=json").1, r#"{"n":1}"#);
        assert_eq!(get(&app, "/data?format=jsonp&callback=f").1, r#"f({"n":1});"#);
        // html without a renderer
        assert_eq!(get(&app, "/data").0, StatusCode::INTERNAL_SERVER_ERROR);
    }

    /// Tests that concurrent dispatches each start from a reset context,
    /// sessions included.
    #[test]
    fn test_concurrent_dispatch() {
        let app = App::new();
        let store = Arc::new(session::MemoryStore::new());
        app.use_(session::sessions(None, store.clone()));
        app.get("/n/:n", |c: &mut Context| {
            if c.get("seen").is_some() || c.response().committed() {
                return Err(Error::custom("context was not reset"));
            }
            c.set("seen", true);
            let n = c.param("n").to_owned();
            match c.session() {
                Some(session) if session.get("n").is_none() => session.set("n", n.clone().into()),
                _ => return Err(Error::custom("session leaked between requests")),
            }
            c.string(200, n)
        });

        thread::scope(|scope| {
            for t in 0..8 {
                let app = &app;
                scope.spawn(move || {
                    for i in 0..200 {
                        let n = format!("{t}-{i}");
                        assert_eq!(get(app, &format!("/n/{n}")), (StatusCode::OK, n));
                    }
                });
            }
        });
        assert!(app.inner.pool.idle() <= 8);
        assert_eq!(store.len(), 8 * 200);
    }

    /// Tests that requests served while middleware and routes change see
    /// either the old or the new configuration, never a mix.
    #[test]
    fn test_reload_during_dispatch() {
        let app = App::new();
        app.get("/stable/:n", |c: &mut Context| {
            let trail = c.get("trail").and_then(|v| v.as_str()).unwrap_or("").to_owned();
            let n = c.param("n").to_owned();
            c.string(200, format!("{trail}{n}"))
        });
        let done = AtomicBool::new(false);

        thread::scope(|scope| {
            for t in 0..4 {
                let app = &app;
                let done = &done;
                scope.spawn(move || {
                    let mut i = 0;
                    while !done.load(Ordering::Acquire) {
                        let n = format!("{t}-{i}");
                        let (status, body) = get(app, &format!("/stable/{n}"));
                        assert_eq!(status, StatusCode::OK);
                        let valid = [n.clone(), format!("a,{n}"), format!("a,b,{n}")];
                        assert!(valid.contains(&body), "{body}");
                        i += 1;
                    }
                });
            }

            for k in 0..50 {
                app.use_(tag("a"));
                app.use_(tag("b"));
                app.clear(&[]);
                app.get(&format!("/extra/{k}"), text("extra"));
                app.rebuild_router();
            }
            done.store(true, Ordering::Release);
        });

        assert_eq!(get(&app, "/extra/49").1, "extra");
        assert_eq!(get(&app, "/stable/x").1, "x");
        assert_eq!(app.routes().len(), 51);
    }

    /// Tests the session middleware registered as global middleware.
    #[test]
    fn test_session_through_app() {
        let app = App::new();
        let store = Arc::new(session::MemoryStore::new());
        app.use_(session::sessions(None, store.clone()));
        app.get("/login", |c: &mut Context| {
            if let Some(session) = c.session() {
                session.set("user", "alice".into());
            }
            c.no_content(204)
        });

        let response = app.serve_http(request(Method::GET, "x", "/login"));
        let cookie = response.headers()["set-cookie"].to_str().unwrap();
        assert!(cookie.starts_with("SID="));
        assert_eq!(store.len(), 1);
    }
}
