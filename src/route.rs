//! Route definitions, path patterns and the route table.
//!
//! # Pattern syntax
//! - `/users/list`: static segments, matched literally
//! - `/users/:id`: a named parameter, matching exactly one non-empty segment
//! - `/static/*`: a trailing wildcard, matching the rest of the path
//!   (slashes included, possibly empty); exposed as the parameter `*`

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use hyper::Method;

use crate::chain;
use crate::group::GroupState;
use crate::handler::{Handler, Middleware};

/// Every method registered by `any`.
pub const METHODS: [Method; 9] = [
    Method::CONNECT,
    Method::DELETE,
    Method::GET,
    Method::HEAD,
    Method::OPTIONS,
    Method::PATCH,
    Method::POST,
    Method::PUT,
    Method::TRACE,
];

/// The method a route answers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteMethod {
    /// Matches every request method (`*`)
    Any,
    Only(Method),
}

impl RouteMethod {
    /// Parses a method name; `*` is the wildcard.
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim();
        if name == "*" {
            return Some(RouteMethod::Any);
        }
        Method::from_bytes(name.to_ascii_uppercase().as_bytes())
            .ok()
            .map(RouteMethod::Only)
    }

    pub fn matches(&self, method: &Method) -> bool {
        match self {
            RouteMethod::Any => true,
            RouteMethod::Only(expected) => expected == method,
        }
    }
}

impl From<Method> for RouteMethod {
    fn from(method: Method) -> Self {
        RouteMethod::Only(method)
    }
}

impl fmt::Display for RouteMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteMethod::Any => f.write_str("*"),
            RouteMethod::Only(method) => f.write_str(method.as_str()),
        }
    }
}

/// Normalizes a path: one leading slash, no empty segments, no trailing slash.
/// The root stays `/`.
pub fn normalize_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        out.push('/');
        out.push_str(segment);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Segment {
    Static(String),
    Param(String),
    Wildcard,
}

/// A compiled path pattern.
#[derive(Debug, Clone, Default)]
pub(crate) struct Pattern {
    segments: Vec<Segment>,
}

impl Pattern {
    /// Compiles a normalized path. A `*` anywhere but last is a literal.
    pub(crate) fn parse(path: &str) -> Self {
        let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let last = parts.len().saturating_sub(1);
        let segments = parts
            .iter()
            .enumerate()
            .map(|(i, part)| match part.strip_prefix(':') {
                Some(name) if !name.is_empty() => Segment::Param(name.to_owned()),
                _ if *part == "*" && i == last => Segment::Wildcard,
                _ => Segment::Static((*part).to_owned()),
            })
            .collect();
        Self { segments }
    }

    /// Parameter names in order of appearance.
    pub(crate) fn param_names(&self) -> Vec<String> {
        self.segments
            .iter()
            .filter_map(|segment| match segment {
                Segment::Param(name) => Some(name.clone()),
                Segment::Wildcard => Some("*".to_owned()),
                Segment::Static(_) => None,
            })
            .collect()
    }

    /// Matches a request path, pushing parameter values into `values`.
    ///
    /// `values` is left in an unspecified state when the path does not match.
    pub(crate) fn matches(&self, path: &str, values: &mut Vec<String>) -> bool {
        let mut rest = match path.strip_prefix('/') {
            Some("") => None,
            Some(rest) => Some(rest),
            None => Some(path),
        };

        for segment in &self.segments {
            if let Segment::Wildcard = segment {
                values.push(rest.unwrap_or("").to_owned());
                return true;
            }

            let current = match rest {
                Some(current) => current,
                None => return false,
            };
            let (head, tail) = match current.split_once('/') {
                Some((head, tail)) => (head, Some(tail)),
                None => (current, None),
            };

            match segment {
                Segment::Static(literal) if literal != head => return false,
                Segment::Param(_) if head.is_empty() => return false,
                Segment::Param(_) => values.push(head.to_owned()),
                _ => {}
            }
            rest = tail;
        }

        rest.is_none()
    }

    /// Fills the parameter slots with `lookup`, yielding a literal path.
    pub(crate) fn render<'a>(&self, mut lookup: impl FnMut(usize, &str) -> Option<&'a str>) -> String {
        if self.segments.is_empty() {
            return "/".to_owned();
        }
        let mut out = String::new();
        let mut index = 0;
        for segment in &self.segments {
            out.push('/');
            match segment {
                Segment::Static(literal) => out.push_str(literal),
                Segment::Param(name) => {
                    out.push_str(lookup(index, name).unwrap_or(""));
                    index += 1;
                }
                Segment::Wildcard => {
                    out.push_str(lookup(index, "*").unwrap_or(""));
                    index += 1;
                }
            }
        }
        out
    }
}

/// A route: one (method, host, path pattern) to handler binding.
///
/// Routes returned by [`App::routes`](crate::App::routes) are the applied
/// form: `path` includes the app and group prefixes and `name` is resolved.
#[derive(Clone)]
pub struct Route {
    pub method: RouteMethod,
    /// Virtual host, empty for the default router
    pub host: String,
    /// Full normalized path pattern
    pub path: String,
    /// Prefix of the group the route was registered through
    pub prefix: String,
    /// Parameter names, in order
    pub params: Vec<String>,
    /// Name used for reverse lookups
    pub name: String,
    registered_path: String,
    explicit_name: Option<String>,
    handler: Handler,
    middleware: Vec<Middleware>,
    group: Option<Arc<GroupState>>,
    pattern: Pattern,
    chain: Option<Handler>,
}

impl Route {
    pub(crate) fn new(
        method: RouteMethod,
        path: &str,
        handler: Handler,
        group: Option<Arc<GroupState>>,
    ) -> Self {
        let (host, prefix) = match &group {
            Some(group) => (group.host.clone(), group.prefix.clone()),
            None => (String::new(), String::new()),
        };
        Self {
            method,
            host,
            path: path.to_owned(),
            prefix,
            params: Vec::new(),
            name: handler.name().to_owned(),
            registered_path: path.to_owned(),
            explicit_name: None,
            handler,
            middleware: Vec::new(),
            group,
            pattern: Pattern::default(),
            chain: None,
        }
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    pub fn middleware(&self) -> &[Middleware] {
        &self.middleware
    }

    pub(crate) fn set_name(&mut self, name: String) {
        self.name = name.clone();
        self.explicit_name = Some(name);
    }

    pub(crate) fn push_middleware(&mut self, middleware: Middleware) {
        self.middleware.push(middleware);
    }

    /// Resolves prefixes, name, parameters and the route-level chain.
    ///
    /// Works from the registered path, so applying an applied route again
    /// yields the same result.
    pub(crate) fn apply(&self, app_prefix: &str) -> Route {
        let mut applied = self.clone();
        applied.path = normalize_path(&format!(
            "{}/{}/{}",
            app_prefix, self.prefix, self.registered_path
        ));
        applied.pattern = Pattern::parse(&applied.path);
        applied.params = applied.pattern.param_names();
        applied.name = self
            .explicit_name
            .clone()
            .unwrap_or_else(|| self.handler.name().to_owned());

        let mut middleware = Vec::new();
        if let Some(group) = &self.group {
            group.collect_middleware(&mut middleware);
        }
        middleware.extend(self.middleware.iter().cloned());
        applied.chain = Some(chain::build(&middleware, self.handler.clone()));
        applied
    }

    /// The handler wrapped with its group and route middleware.
    pub(crate) fn chain(&self) -> &Handler {
        self.chain.as_ref().unwrap_or(&self.handler)
    }

    pub(crate) fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    pub(crate) fn matches(&self, method: &Method, path: &str, values: &mut Vec<String>) -> bool {
        self.method.matches(method) && self.pattern.matches(path, values)
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("host", &self.host)
            .field("path", &self.path)
            .field("name", &self.name)
            .finish()
    }
}

/// Every applied route of an app, in registration order, plus the
/// name to indices map used for reverse lookups.
#[derive(Debug, Clone, Default)]
pub(crate) struct RouteTable {
    routes: Vec<Arc<Route>>,
    named: HashMap<String, Vec<usize>>,
}

impl RouteTable {
    /// Appends a route and returns its index.
    pub(crate) fn push(&mut self, route: Arc<Route>) -> usize {
        let index = self.routes.len();
        self.named.entry(route.name.clone()).or_default().push(index);
        self.routes.push(route);
        index
    }

    pub(crate) fn len(&self) -> usize {
        self.routes.len()
    }

    pub(crate) fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    pub(crate) fn named(&self) -> &HashMap<String, Vec<usize>> {
        &self.named
    }

    /// The first route registered under `name`.
    pub(crate) fn first_named(&self, name: &str) -> Option<&Arc<Route>> {
        self.named
            .get(name)
            .and_then(|indices| indices.first())
            .and_then(|&index| self.routes.get(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matched(pattern: &str, path: &str) -> Option<Vec<String>> {
        let mut values = Vec::new();
        Pattern::parse(&normalize_path(pattern))
            .matches(path, &mut values)
            .then_some(values)
    }

    /// Tests leading/trailing/duplicate slash handling.
    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("users/"), "/users");
        assert_eq!(normalize_path("//api//users/:id/"), "/api/users/:id");
    }

    /// Tests static, parameter and wildcard segments.
    #[test]
    fn test_pattern_matching() {
        assert_eq!(matched("/", "/"), Some(vec![]));
        assert_eq!(matched("/", "/a"), None);
        assert_eq!(matched("/users", "/users"), Some(vec![]));
        assert_eq!(matched("/users", "/users/"), None);
        assert_eq!(matched("/user/:id", "/user/42"), Some(vec!["42".into()]));
        assert_eq!(matched("/user/:id", "/user/"), None);
        assert_eq!(matched("/user/:id", "/user/42/posts"), None);
        assert_eq!(
            matched("/a/:x/b/:y", "/a/1/b/2"),
            Some(vec!["1".into(), "2".into()])
        );
    }

    /// Tests that the trailing wildcard swallows the remainder, slashes included.
    #[test]
    fn test_wildcard() {
        assert_eq!(
            matched("/static/*", "/static/css/a.css"),
            Some(vec!["css/a.css".into()])
        );
        assert_eq!(matched("/static/*", "/static/"), Some(vec!["".into()]));
        assert_eq!(matched("/static/*", "/static"), Some(vec!["".into()]));
        assert_eq!(matched("/static/*", "/assets/x"), None);
        assert_eq!(matched("/*", "/anything/at/all"), Some(vec!["anything/at/all".into()]));
    }

    /// Tests that the parameter list includes the wildcard slot.
    #[test]
    fn test_param_names() {
        let pattern = Pattern::parse("/files/:bucket/*");
        assert_eq!(pattern.param_names(), vec!["bucket".to_owned(), "*".to_owned()]);
        assert_eq!(Pattern::parse("/a/*/b").param_names(), Vec::<String>::new());
    }

    /// Tests method parsing, including the wildcard.
    #[test]
    fn test_route_method() {
        assert_eq!(RouteMethod::parse("*"), Some(RouteMethod::Any));
        assert_eq!(RouteMethod::parse("get"), Some(RouteMethod::Only(Method::GET)));
        assert!(RouteMethod::Any.matches(&Method::DELETE));
        assert!(!RouteMethod::from(Method::GET).matches(&Method::POST));
        assert_eq!(RouteMethod::parse("bad method"), None);
    }

    /// Tests positional slot filling.
    #[test]
    fn test_render() {
        let pattern = Pattern::parse("/user/:id/files/*");
        let values = ["7", "a/b.txt"];
        assert_eq!(
            pattern.render(|i, _| values.get(i).copied()),
            "/user/7/files/a/b.txt"
        );
        assert_eq!(Pattern::parse("/").render(|_, _| None), "/");
    }
}
