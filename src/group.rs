//! Prefix groups and virtual hosts.
//!
//! A [`Group`] and a [`Host`] are cheap handles: the state they point to is
//! owned by the app and shared by every handle returned for the same prefix
//! or host name. Group middleware is read when the router is rebuilt, so
//! middleware added to a group after its routes were registered still
//! applies to them.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use crate::app::{lock, App};
use crate::handler::{Handler, Middleware};
use crate::register::{RouteRef, RouteRegister};
use crate::route::{normalize_path, RouteMethod};

/// Shared state behind a [`Group`] handle.
pub(crate) struct GroupState {
    /// Full prefix, parent prefixes included; empty for a host's root group
    pub(crate) prefix: String,
    /// Virtual host the group belongs to, empty for the default router
    pub(crate) host: String,
    middleware: RwLock<Vec<Middleware>>,
    parent: Option<Arc<GroupState>>,
    children: Mutex<HashMap<String, Arc<GroupState>>>,
}

impl GroupState {
    pub(crate) fn new(prefix: &str, host: &str, parent: Option<Arc<GroupState>>) -> Self {
        let parent_prefix = parent.as_ref().map(|p| p.prefix.as_str()).unwrap_or("");
        let joined = format!("{parent_prefix}/{prefix}");
        let prefix = if joined.trim_matches('/').is_empty() {
            String::new()
        } else {
            normalize_path(&joined)
        };
        Self {
            prefix,
            host: host.to_owned(),
            middleware: RwLock::new(Vec::new()),
            parent,
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Appends the middleware of this group and its ancestors, outermost
    /// ancestor first.
    pub(crate) fn collect_middleware(&self, out: &mut Vec<Middleware>) {
        if let Some(parent) = &self.parent {
            parent.collect_middleware(out);
        }
        let middleware = self.middleware.read().unwrap_or_else(|err| err.into_inner());
        out.extend(middleware.iter().cloned());
    }

    pub(crate) fn push_middleware(&self, middleware: impl IntoIterator<Item = Middleware>) {
        let mut current = self.middleware.write().unwrap_or_else(|err| err.into_inner());
        current.extend(middleware);
    }

    /// Looks up or creates the nested group for `prefix`.
    pub(crate) fn child(self: &Arc<Self>, prefix: &str) -> Arc<GroupState> {
        lock(&self.children)
            .entry(normalize_path(prefix))
            .or_insert_with(|| Arc::new(GroupState::new(prefix, &self.host, Some(self.clone()))))
            .clone()
    }
}

impl fmt::Debug for GroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupState")
            .field("prefix", &self.prefix)
            .field("host", &self.host)
            .finish()
    }
}

/// A set of routes sharing a path prefix and middleware.
///
/// ```
/// use weft::{App, Context, RouteRegister};
///
/// let app = App::new();
/// let api = app.group("/api", &[]);
/// api.get("/users/:id", |c: &mut Context| {
///     let id = c.param("id").to_owned();
///     c.string(200, id)
/// });
/// assert_eq!(app.routes()[0].path, "/api/users/:id");
/// ```
#[derive(Clone)]
pub struct Group {
    app: App,
    state: Arc<GroupState>,
}

impl Group {
    pub(crate) fn new(app: App, state: Arc<GroupState>) -> Self {
        Self { app, state }
    }

    /// The full prefix, including parent groups but not the app prefix.
    pub fn prefix(&self) -> &str {
        &self.state.prefix
    }

    /// The virtual host, empty for groups of the default router.
    pub fn host(&self) -> &str {
        &self.state.host
    }

    /// Appends middleware that runs for every route of this group.
    pub fn use_(&self, middleware: Middleware) -> &Self {
        self.use_all(std::slice::from_ref(&middleware));
        self
    }

    pub(crate) fn use_all(&self, middleware: &[Middleware]) {
        if middleware.is_empty() {
            return;
        }
        let wrapped: Vec<_> = middleware
            .iter()
            .map(|m| self.app.wrap_middleware(m.clone()))
            .collect();
        self.state.push_middleware(wrapped);
        self.app.mark_routes_dirty();
    }

    /// Returns the nested group for `prefix`, creating it on first use.
    pub fn group(&self, prefix: &str, middleware: &[Middleware]) -> Group {
        let group = Group::new(self.app.clone(), self.state.child(prefix));
        group.use_all(middleware);
        group
    }

    /// Whether both handles refer to the same group.
    pub fn same(&self, other: &Group) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl RouteRegister for Group {
    fn app(&self) -> &App {
        &self.app
    }

    fn add_route(
        &self,
        method: RouteMethod,
        path: &str,
        handler: Handler,
        middleware: &[Middleware],
    ) -> RouteRef {
        self.app
            .register(method, path, handler, middleware, Some(self.state.clone()))
    }
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("prefix", &self.state.prefix)
            .field("host", &self.state.host)
            .finish()
    }
}

/// Shared state behind a [`Host`] handle.
pub(crate) struct HostState {
    pub(crate) name: String,
    pub(crate) group: Arc<GroupState>,
}

impl HostState {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            group: Arc::new(GroupState::new("", name, None)),
        }
    }
}

/// A virtual host with its own router.
///
/// Names are matched against the request's host, lowercased and without
/// port. A name starting with `.` matches any longer host ending with it
/// (`.example.com` matches `api.example.com`); a name ending with `.`
/// matches any longer host starting with it (`api.` matches `api.internal`).
#[derive(Clone)]
pub struct Host {
    app: App,
    state: Arc<HostState>,
}

impl Host {
    pub(crate) fn new(app: App, state: Arc<HostState>) -> Self {
        Self { app, state }
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Appends middleware that runs for every route of this host.
    pub fn use_(&self, middleware: Middleware) -> &Self {
        self.root().use_all(std::slice::from_ref(&middleware));
        self
    }

    pub(crate) fn use_all(&self, middleware: &[Middleware]) {
        self.root().use_all(middleware);
    }

    /// Returns the host's group for `prefix`, creating it on first use.
    pub fn group(&self, prefix: &str, middleware: &[Middleware]) -> Group {
        self.root().group(prefix, middleware)
    }

    /// Whether both handles refer to the same host.
    pub fn same(&self, other: &Host) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    fn root(&self) -> Group {
        Group::new(self.app.clone(), self.state.group.clone())
    }
}

impl RouteRegister for Host {
    fn app(&self) -> &App {
        &self.app
    }

    fn add_route(
        &self,
        method: RouteMethod,
        path: &str,
        handler: Handler,
        middleware: &[Middleware],
    ) -> RouteRef {
        self.app
            .register(method, path, handler, middleware, Some(self.state.group.clone()))
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host").field("name", &self.state.name).finish()
    }
}

/// Whether `pattern` is a wildcard host name.
pub(crate) fn is_wildcard(pattern: &str) -> bool {
    pattern.starts_with('.') || pattern.ends_with('.')
}

/// Matches a request host against a wildcard host name.
pub(crate) fn wildcard_matches(pattern: &str, host: &str) -> bool {
    if host.len() <= pattern.len() {
        return false;
    }
    (pattern.starts_with('.') && host.ends_with(pattern))
        || (pattern.ends_with('.') && host.starts_with(pattern))
}

/// Lowercases a host name and strips the port, if any.
pub(crate) fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let without_port = match host.rfind(':') {
        // Bracketed IPv6 literals keep their colons.
        Some(i) if !host[i..].contains(']') => &host[..i],
        _ => host,
    };
    without_port.to_ascii_lowercase()
}
