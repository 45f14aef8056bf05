//! Rendering, binding and response format negotiation.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use hyper::header;
use hyper::Method;
use serde_json::{Map, Value};

use crate::context::Context;
use crate::error::{Error, Result};

/// Renders a named template, typically HTML.
pub trait Renderer: Send + Sync {
    fn render(&self, w: &mut dyn io::Write, name: &str, data: &Value, c: &Context) -> Result<()>;
}

/// Decodes request data into a JSON value, which
/// [`Context::bind`](crate::Context::bind) then deserializes.
pub trait Binder: Send + Sync {
    fn bind(&self, c: &mut Context) -> Result<Value>;
}

/// Responds with `data` in one format, e.g. `json`.
pub type FormatRenderer = Arc<dyn Fn(&mut Context, u16, &Value) -> Result<()> + Send + Sync>;

/// Binds JSON bodies, urlencoded form bodies and, for requests without a
/// body, the query string. Form and query values are strings; repeated keys
/// become arrays.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBinder;

impl Binder for DefaultBinder {
    fn bind(&self, c: &mut Context) -> Result<Value> {
        let content_type = c
            .header(header::CONTENT_TYPE.as_str())
            .map(|value| value.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
            .unwrap_or_default();

        if c.method() == Method::GET || c.method() == Method::HEAD || c.method() == Method::DELETE {
            let query = c.request().uri().query().unwrap_or("").to_owned();
            return Ok(pairs_to_value(query.as_bytes()));
        }

        let body = c.body_bytes()?;
        match content_type.as_str() {
            "application/json" => {
                if body.is_empty() {
                    return Err(Error::Bind("request body is empty".into()));
                }
                serde_json::from_slice(&body).map_err(|err| Error::Bind(err.to_string()))
            }
            "application/x-www-form-urlencoded" => Ok(pairs_to_value(&body)),
            "" if body.is_empty() => Ok(Value::Object(Map::new())),
            other => Err(Error::Bind(format!("unsupported content type {other:?}"))),
        }
    }
}

fn pairs_to_value(input: &[u8]) -> Value {
    let mut map = Map::new();
    for (key, value) in url::form_urlencoded::parse(input).into_owned() {
        match map.get_mut(&key) {
            Some(Value::Array(values)) => values.push(Value::String(value)),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, Value::String(value)]);
            }
            None => {
                map.insert(key, Value::String(value));
            }
        }
    }
    Value::Object(map)
}

/// Mime type to format name. `*` is the fallback.
pub(crate) fn default_accept_formats() -> HashMap<String, String> {
    [
        ("application/json", "json"),
        ("text/javascript", "json"),
        ("application/javascript", "json"),
        ("text/plain", "text"),
        ("*/*", "html"),
        ("application/xhtml", "html"),
        ("text/html", "html"),
        ("*", "html"),
    ]
    .into_iter()
    .map(|(mime, format)| (mime.to_owned(), format.to_owned()))
    .collect()
}

pub(crate) fn default_format_renderers() -> HashMap<String, FormatRenderer> {
    let mut renderers: HashMap<String, FormatRenderer> = HashMap::new();
    renderers.insert(
        "json".into(),
        Arc::new(|c: &mut Context, code: u16, data: &Value| c.json(code, data)),
    );
    renderers.insert(
        "jsonp".into(),
        Arc::new(|c: &mut Context, code: u16, data: &Value| {
            let var = c.services.jsonp_var_name.clone();
            let callback = c.query(&var).unwrap_or_default();
            c.jsonp(code, &callback, data)
        }),
    );
    renderers.insert(
        "text".into(),
        Arc::new(|c: &mut Context, code: u16, data: &Value| match data {
            Value::String(s) => c.string(code, s.as_str()),
            other => c.string(code, other.to_string()),
        }),
    );
    renderers
}

/// Works out the response format of a request.
pub(crate) fn negotiate(c: &Context) -> String {
    if let Some(format) = c.query("format").filter(|f| !f.is_empty()) {
        return format;
    }
    let services = &c.services;
    if !services.parse_header_accept {
        return "html".to_owned();
    }
    let accepted = c
        .header(header::ACCEPT.as_str())
        .unwrap_or("")
        .split(',')
        .map(|part| part.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
        .find_map(|mime| services.accept_formats.get(&mime).cloned());
    accepted
        .or_else(|| services.accept_formats.get("*").cloned())
        .unwrap_or_else(|| "html".to_owned())
}
