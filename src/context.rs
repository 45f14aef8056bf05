//! The per-request context handed to handlers and middleware.
//!
//! A context owns the request, a response writer, the matched route with its
//! parameter values, the session handle and a scratch store for data passed
//! between middleware. Contexts are pooled; see [`crate::pool`].

use std::fmt;
use std::mem;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use hyper::header::{self, HeaderName, HeaderValue};
use hyper::{HeaderMap, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::app::Services;
use crate::error::{Error, HttpError, Result};
use crate::group::normalize_host;
use crate::http::{Body, Bytes, Cancellation, Request, Response};
use crate::render;
use crate::route::Route;
use crate::server::ConnectionInfo;
use crate::session::{CookieOptions, SessionOptions, Sessioner};
use crate::static_files;

/// A hook run once, right before the response is committed.
pub type PreResponseHook = Box<dyn FnOnce(&mut Context) -> Result<()> + Send>;

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
const TEXT_HTML: &str = "text/html; charset=utf-8";
const APPLICATION_JSON: &str = "application/json; charset=utf-8";
const APPLICATION_JAVASCRIPT: &str = "application/javascript; charset=utf-8";

enum ResponseBody {
    Buffer(Vec<u8>),
    Stream(Body),
}

/// The response being built for the current request.
///
/// The first write through one of the [`Context`] response helpers commits
/// it: status and headers are final from then on and further writes are
/// dropped with a warning.
pub struct ResponseWriter {
    status: StatusCode,
    headers: HeaderMap,
    body: ResponseBody,
    committed: bool,
    size: usize,
}

impl ResponseWriter {
    fn new() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: ResponseBody::Buffer(Vec::new()),
            committed: false,
            size: 0,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Headers can still be changed until the response is committed.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn committed(&self) -> bool {
        self.committed
    }

    /// Bytes written, 0 for streamed bodies.
    pub fn size(&self) -> usize {
        self.size
    }

    fn reset(&mut self) {
        self.status = StatusCode::OK;
        self.headers.clear();
        match &mut self.body {
            ResponseBody::Buffer(buf) => buf.clear(),
            body => *body = ResponseBody::Buffer(Vec::new()),
        }
        self.committed = false;
        self.size = 0;
    }

    fn take(&mut self) -> Response {
        let body = match mem::replace(&mut self.body, ResponseBody::Buffer(Vec::new())) {
            ResponseBody::Buffer(buf) => Body::new(buf),
            ResponseBody::Stream(body) => body,
        };
        let mut response = Response::new(body);
        *response.status_mut() = self.status;
        *response.headers_mut() = mem::take(&mut self.headers);
        response
    }
}

impl fmt::Debug for ResponseWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseWriter")
            .field("status", &self.status)
            .field("committed", &self.committed)
            .field("size", &self.size)
            .finish()
    }
}

/// Per-request state.
pub struct Context {
    request: Request,
    response: ResponseWriter,
    route: Option<Arc<Route>>,
    param_values: Vec<String>,
    session: Option<Box<dyn Sessioner>>,
    session_options: SessionOptions,
    format: Option<String>,
    store: Map<String, Value>,
    pre_response_hooks: Vec<PreResponseHook>,
    pub(crate) services: Arc<Services>,
}

impl Context {
    /// Creates a standalone context with default services, e.g. for tests.
    pub fn new(request: Request) -> Self {
        Self::with_services(request, Arc::new(Services::default()))
    }

    pub(crate) fn with_services(request: Request, services: Arc<Services>) -> Self {
        Self {
            request,
            response: ResponseWriter::new(),
            route: None,
            param_values: Vec::new(),
            session: None,
            session_options: services.session_options.clone(),
            format: None,
            store: Map::new(),
            pre_response_hooks: Vec::new(),
            services,
        }
    }

    /// Puts the context back into its initial state for a new request.
    ///
    /// Destructures `self` so a new field cannot be added without deciding
    /// how it is reset.
    pub(crate) fn reset(&mut self, request: Request, services: Arc<Services>) {
        let Context {
            request: current_request,
            response,
            route,
            param_values,
            session,
            session_options,
            format,
            store,
            pre_response_hooks,
            services: current_services,
        } = self;

        *current_request = request;
        response.reset();
        *route = None;
        param_values.clear();
        *session = None;
        *session_options = services.session_options.clone();
        *format = None;
        store.clear();
        pre_response_hooks.clear();
        *current_services = services;
    }

    /// Drops everything tied to the finished request.
    pub(crate) fn release(&mut self) {
        let services = self.services.clone();
        self.reset(Request::default(), services);
    }

    // Request

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }

    pub fn method(&self) -> &Method {
        self.request.method()
    }

    pub fn path(&self) -> &str {
        self.request.uri().path()
    }

    /// The request host, lowercased and without port. Read from the `Host`
    /// header, or from the URI for absolute-form requests.
    pub fn host(&self) -> String {
        let host = self
            .request
            .headers()
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .or_else(|| self.request.uri().host())
            .unwrap_or("");
        normalize_host(host)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.request.headers().get(name).and_then(|v| v.to_str().ok())
    }

    /// The first query parameter named `name`, decoded.
    pub fn query(&self, name: &str) -> Option<String> {
        self.query_pairs()
            .into_iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    /// Every query parameter in request order, decoded.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let query = self.request.uri().query().unwrap_or("");
        url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect()
    }

    /// The value of the request cookie `name`.
    pub fn cookie(&self, name: &str) -> Option<String> {
        self.request
            .headers()
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.trim_matches('"').to_owned())
    }

    /// The client address: `X-Forwarded-For`, then `X-Real-IP`, then the
    /// peer address of the connection.
    pub fn real_ip(&self) -> Option<IpAddr> {
        let forwarded = self
            .header("x-forwarded-for")
            .and_then(|value| value.split(',').next())
            .or_else(|| self.header("x-real-ip"))
            .and_then(|value| value.trim().parse().ok());
        forwarded.or_else(|| {
            self.request
                .extensions()
                .get::<ConnectionInfo>()
                .and_then(|info| info.peer_addr)
                .map(|addr| addr.ip())
        })
    }

    /// Whether the client went away before the response was sent.
    pub fn is_cancelled(&self) -> bool {
        self.request
            .extensions()
            .get::<Cancellation>()
            .map_or(false, Cancellation::is_cancelled)
    }

    /// Reads the whole request body.
    pub fn body_bytes(&mut self) -> Result<Bytes> {
        Ok(self.request.body_mut().read_all()?)
    }

    /// Decodes the request through the app's binder.
    pub fn bind<T: DeserializeOwned>(&mut self) -> Result<T> {
        let binder = self.services.binder.clone();
        let value = binder.bind(self)?;
        Ok(serde_json::from_value(value)?)
    }

    // Routing

    /// The matched route, once the router has run.
    pub fn route(&self) -> Option<&Arc<Route>> {
        self.route.as_ref()
    }

    /// The path parameter `name`, or an empty string.
    pub fn param(&self, name: &str) -> &str {
        self.route
            .as_ref()
            .and_then(|route| route.params.iter().position(|p| p == name))
            .and_then(|i| self.param_values.get(i))
            .map_or("", String::as_str)
    }

    /// Parameter names and values of the matched route.
    pub fn params(&self) -> Vec<(&str, &str)> {
        match &self.route {
            Some(route) => route
                .params
                .iter()
                .map(String::as_str)
                .zip(self.param_values.iter().map(String::as_str))
                .collect(),
            None => Vec::new(),
        }
    }

    pub(crate) fn set_route(&mut self, route: Arc<Route>, values: Vec<String>) {
        self.route = Some(route);
        self.param_values = values;
    }

    /// Lends the parameter buffer to the router so matching reuses it.
    pub(crate) fn take_param_values(&mut self) -> Vec<String> {
        let mut values = mem::take(&mut self.param_values);
        values.clear();
        values
    }

    pub(crate) fn restore_param_values(&mut self, mut values: Vec<String>) {
        values.clear();
        self.param_values = values;
    }

    /// Runs the app's not-found handler.
    pub fn not_found(&mut self) -> Result<()> {
        match self.services.not_found.clone() {
            Some(handler) => handler.handle(self),
            None => Err(HttpError::not_found().into()),
        }
    }

    /// Hands `err` to the app's HTTP error handler.
    pub fn error(&mut self, err: Error) {
        let handler = self.services.http_error_handler.clone();
        handler(err, self);
    }

    // Data

    /// Stores a value for later middleware or handlers.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.store.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.store.get(key)
    }

    pub fn store(&self) -> &Map<String, Value> {
        &self.store
    }

    // Session

    pub fn session(&mut self) -> Option<&mut dyn Sessioner> {
        match &mut self.session {
            Some(session) => Some(session.as_mut()),
            None => None,
        }
    }

    pub fn set_sessioner(&mut self, session: Box<dyn Sessioner>) {
        self.session = Some(session);
    }

    /// Saves the attached session, if any.
    pub fn save_session(&mut self) -> Result<()> {
        match self.session.take() {
            Some(mut session) => {
                let result = session.save(self);
                self.session = Some(session);
                result
            }
            None => Ok(()),
        }
    }

    pub fn session_options(&self) -> &SessionOptions {
        &self.session_options
    }

    pub fn set_session_options(&mut self, options: SessionOptions) {
        self.session_options = options;
    }

    pub fn cookie_options(&self) -> &CookieOptions {
        &self.session_options.cookie
    }

    pub fn cookie_options_mut(&mut self) -> &mut CookieOptions {
        &mut self.session_options.cookie
    }

    // Response

    pub fn response(&self) -> &ResponseWriter {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut ResponseWriter {
        &mut self.response
    }

    /// Sets a response header.
    pub fn set_header(&mut self, name: &str, value: &str) -> Result<()> {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(Error::custom)?;
        let value = HeaderValue::from_str(value).map_err(Error::custom)?;
        self.response.headers.insert(name, value);
        Ok(())
    }

    /// Adds a `Set-Cookie` header. Ignored once the response is committed.
    pub fn set_cookie(&mut self, name: &str, value: &str, options: &CookieOptions) -> Result<()> {
        if self.response.committed {
            log::debug!("response committed, cookie {name} not sent");
            return Ok(());
        }
        let cookie = HeaderValue::from_str(&options.format(name, value)).map_err(Error::custom)?;
        self.response.headers.append(header::SET_COOKIE, cookie);
        Ok(())
    }

    /// Registers a hook run once before the response is committed.
    pub fn add_pre_response_hook<F>(&mut self, hook: F)
    where
        F: FnOnce(&mut Context) -> Result<()> + Send + 'static,
    {
        self.pre_response_hooks.push(Box::new(hook));
    }

    pub fn string(&mut self, code: u16, s: impl Into<String>) -> Result<()> {
        self.blob(code, TEXT_PLAIN, s.into().into_bytes())
    }

    pub fn html(&mut self, code: u16, html: impl Into<String>) -> Result<()> {
        self.blob(code, TEXT_HTML, html.into().into_bytes())
    }

    pub fn json<T: Serialize + ?Sized>(&mut self, code: u16, data: &T) -> Result<()> {
        let body = serde_json::to_vec(data)?;
        self.blob(code, APPLICATION_JSON, body)
    }

    /// Sends `data` as JSON wrapped in a call to `callback`.
    pub fn jsonp<T: Serialize + ?Sized>(&mut self, code: u16, callback: &str, data: &T) -> Result<()> {
        let mut body = Vec::with_capacity(callback.len() + 64);
        body.extend_from_slice(callback.as_bytes());
        body.push(b'(');
        serde_json::to_writer(&mut body, data)?;
        body.extend_from_slice(b");");
        self.blob(code, APPLICATION_JAVASCRIPT, body)
    }

    pub fn blob(&mut self, code: u16, content_type: &str, body: impl Into<Vec<u8>>) -> Result<()> {
        self.commit(code, Some(content_type), ResponseBody::Buffer(body.into()))
    }

    /// Streams `body` to the client.
    pub fn stream(&mut self, code: u16, content_type: &str, body: Body) -> Result<()> {
        self.commit(code, Some(content_type), ResponseBody::Stream(body))
    }

    pub fn no_content(&mut self, code: u16) -> Result<()> {
        self.commit(code, None, ResponseBody::Buffer(Vec::new()))
    }

    /// Redirects to `url`; `code` must be a 3xx status.
    pub fn redirect(&mut self, code: u16, url: &str) -> Result<()> {
        if !(300..=308).contains(&code) {
            return Err(HttpError::new(500, format!("invalid redirect status code {code}")).into());
        }
        self.set_header(header::LOCATION.as_str(), url)?;
        self.no_content(code)
    }

    /// Renders the template `name` through the app's renderer as HTML.
    pub fn render(&mut self, code: u16, name: &str, data: &Value) -> Result<()> {
        let renderer = match self.services.renderer.clone() {
            Some(renderer) => renderer,
            None => return Err(Error::Render("renderer not registered".into())),
        };
        let mut buf = Vec::new();
        renderer.render(&mut buf, name, data, self)?;
        self.blob(code, TEXT_HTML, buf)
    }

    /// Responds in the negotiated [`format`](Context::format): through the
    /// format renderer registered for it, or the HTML template `name`.
    pub fn render_data(&mut self, code: u16, name: &str, data: &Value) -> Result<()> {
        let format = self.format();
        match self.services.format_renderers.get(&format).cloned() {
            Some(renderer) if format != "html" => renderer(self, code, data),
            _ => self.render(code, name, data),
        }
    }

    /// Serves a file from disk.
    pub fn file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        static_files::serve_file(self, path.as_ref())
    }

    /// The response format: an explicit override, then `?format=`, then the
    /// `Accept` header when header parsing is enabled, then `html`.
    pub fn format(&self) -> String {
        match &self.format {
            Some(format) => format.clone(),
            None => render::negotiate(self),
        }
    }

    pub fn set_format(&mut self, format: impl Into<String>) {
        self.format = Some(format.into());
    }

    fn commit(&mut self, code: u16, content_type: Option<&str>, body: ResponseBody) -> Result<()> {
        if self.response.committed {
            log::warn!("response already committed");
            return Ok(());
        }

        for hook in mem::take(&mut self.pre_response_hooks) {
            hook(self)?;
        }

        self.response.status = StatusCode::from_u16(code).unwrap_or_else(|_| {
            log::warn!("invalid status code {code}, sending 500");
            StatusCode::INTERNAL_SERVER_ERROR
        });
        if let Some(content_type) = content_type {
            let value = HeaderValue::from_str(content_type).map_err(Error::custom)?;
            self.response.headers.insert(header::CONTENT_TYPE, value);
        }
        if let ResponseBody::Buffer(buf) = &body {
            self.response.size = buf.len();
        }
        self.response.body = body;
        self.response.committed = true;
        Ok(())
    }

    /// Moves the response out, leaving an empty one behind.
    pub fn take_response(&mut self) -> Response {
        self.response.take()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("method", self.method())
            .field("path", &self.path())
            .field("route", &self.route)
            .field("response", &self.response)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Handler;
    use crate::route::RouteMethod;
    use crate::session::{MemoryStore, Session};
    use serde_json::json;

    fn context(method: Method, uri: &str) -> Context {
        let request = hyper::Request::builder()
            .method(method)
            .uri(uri)
            .header("host", "Example.COM:8080")
            .header("cookie", "SID=abc; theme=\"dark\"")
            .body(Body::new("a=1&b=two"))
            .unwrap();
        Context::new(request)
    }

    /// Tests request accessors: host, query and cookies.
    #[test]
    fn test_request_accessors() {
        let c = context(Method::GET, "/search?q=rust+web&page=2&q=again");
        assert_eq!(c.host(), "example.com");
        assert_eq!(c.path(), "/search");
        assert_eq!(c.query("q").as_deref(), Some("rust web"));
        assert_eq!(c.query("missing"), None);
        assert_eq!(c.cookie("SID").as_deref(), Some("abc"));
        assert_eq!(c.cookie("theme").as_deref(), Some("dark"));
        assert!(!c.is_cancelled());
    }

    /// Tests parameter lookup through the matched route.
    #[test]
    fn test_params() {
        let mut c = context(Method::GET, "/user/7/files/a/b");
        let handler = Handler::named("files", |_c: &mut Context| Ok(()));
        let route = Route::new(RouteMethod::Any, "/user/:id/files/*", handler, None).apply("");
        c.set_route(Arc::new(route), vec!["7".into(), "a/b".into()]);

        assert_eq!(c.param("id"), "7");
        assert_eq!(c.param("*"), "a/b");
        assert_eq!(c.param("nope"), "");
        assert_eq!(c.params(), vec![("id", "7"), ("*", "a/b")]);
    }

    /// Tests that the first write commits and later writes are dropped.
    #[test]
    fn test_commit_once() {
        let mut c = context(Method::GET, "/");
        c.json(201, &json!({"ok": true})).unwrap();
        assert!(c.response().committed());
        c.string(500, "ignored").unwrap();

        let mut response = c.take_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/json; charset=utf-8"
        );
        assert_eq!(&response.body_mut().read_all().unwrap()[..], br#"{"ok":true}"#);
    }

    /// Tests that pre-response hooks run once, before the status is set.
    #[test]
    fn test_pre_response_hooks() {
        let mut c = context(Method::GET, "/");
        c.add_pre_response_hook(|c: &mut Context| {
            assert!(!c.response().committed());
            c.set_header("x-hook", "ran")
        });
        c.no_content(204).unwrap();
        assert_eq!(c.response().headers()["x-hook"], "ran");
        assert_eq!(c.response().status(), StatusCode::NO_CONTENT);
    }

    /// Tests that reset clears every piece of request state.
    #[test]
    fn test_reset() {
        let mut c = context(Method::POST, "/x?format=json");
        c.set("user", "alice");
        c.set_format("text");
        c.cookie_options_mut().max_age = 99;
        c.add_pre_response_hook(|_c: &mut Context| Ok(()));
        let session = Session::start(Arc::new(MemoryStore::new()), "SID", &c);
        c.set_sessioner(Box::new(session));
        let handler = Handler::named("x", |_c: &mut Context| Ok(()));
        let route = Route::new(RouteMethod::Any, "/:id", handler, None).apply("");
        c.set_route(Arc::new(route), vec!["42".into()]);
        c.string(200, "body").unwrap();

        c.reset(Request::default(), Arc::new(Services::default()));
        assert!(c.session().is_none());
        assert!(c.param_values.is_empty());
        assert_eq!(c.param("id"), "");
        assert!(c.store().is_empty());
        assert!(c.route().is_none());
        assert!(!c.response().committed());
        assert_eq!(c.response().size(), 0);
        assert_eq!(c.cookie_options().max_age, 0);
        assert_eq!(c.format(), "html");
        assert_eq!(c.method(), Method::GET);
        assert!(c.pre_response_hooks.is_empty());
    }

    /// Tests redirect validation and the Location header.
    #[test]
    fn test_redirect() {
        let mut c = context(Method::GET, "/");
        assert!(c.redirect(200, "/elsewhere").is_err());
        c.redirect(302, "/elsewhere").unwrap();
        assert_eq!(c.response().headers()[header::LOCATION], "/elsewhere");
    }

    /// Tests the JSONP envelope.
    #[test]
    fn test_jsonp() {
        let mut c = context(Method::GET, "/");
        c.jsonp(200, "cb", &json!([1, 2])).unwrap();
        let mut response = c.take_response();
        assert_eq!(&response.body_mut().read_all().unwrap()[..], b"cb([1,2]);");
    }
}
