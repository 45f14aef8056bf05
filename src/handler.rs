//! Handler and middleware values.
//!
//! Everything accepted by the registration API is turned into one of two
//! closed variants when it is registered:
//!
//! - [`Handler`]: either a bare function ([`Handler::Func`]) or a
//!   [`MetaHandler`] carrying an explicit name and metadata.
//! - [`Middleware`]: either a decorator over the next handler
//!   ([`Middleware::Wrap`]) or an around-style function that receives the
//!   next handler as an argument ([`Middleware::Next`]).
//!
//! Dispatch never inspects the original callable again.

use std::any::{type_name, TypeId};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::context::Context;
use crate::error::Result;

/// Names a callable after its type.
///
/// Every closure in a function shares the type name `path::{{closure}}`, so
/// closures get a suffix hashed from their `TypeId`: stable for one closure,
/// distinct between closures.
fn callable_name<F: 'static>() -> Arc<str> {
    let name = type_name::<F>();
    if !name.contains("{{closure}}") {
        return name.into();
    }
    let mut hasher = DefaultHasher::new();
    TypeId::of::<F>().hash(&mut hasher);
    format!("{name}#{:016x}", hasher.finish()).into()
}

/// Free-form metadata attached to a handler.
pub type Meta = Map<String, Value>;

type HandlerFn = dyn Fn(&mut Context) -> Result<()> + Send + Sync;
type WrapFn = dyn Fn(Handler) -> Handler + Send + Sync;
type NextFn = dyn Fn(&mut Context, &Handler) -> Result<()> + Send + Sync;

/// A resolved request handler.
#[derive(Clone)]
pub enum Handler {
    /// A function or closure. Its name is the Rust type name of the callable,
    /// which for a function item is its full path, e.g. `app::users::show`.
    /// Closures get a suffix telling apart those defined in one function.
    Func {
        name: Arc<str>,
        func: Arc<HandlerFn>,
    },
    /// A handler with an explicit name and metadata.
    Meta(Arc<MetaHandler>),
}

impl Handler {
    /// Wraps a function, naming it after its type.
    pub fn from_fn<F>(func: F) -> Self
    where
        F: Fn(&mut Context) -> Result<()> + Send + Sync + 'static,
    {
        Self::named(callable_name::<F>(), func)
    }

    /// Wraps a function under an explicit name.
    pub fn named<F>(name: impl Into<Arc<str>>, func: F) -> Self
    where
        F: Fn(&mut Context) -> Result<()> + Send + Sync + 'static,
    {
        Handler::Func {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    /// Runs the handler against a request context.
    pub fn handle(&self, c: &mut Context) -> Result<()> {
        match self {
            Handler::Func { func, .. } => func(c),
            Handler::Meta(meta) => meta.handler.handle(c),
        }
    }

    /// The name used for named-route lookups.
    pub fn name(&self) -> &str {
        match self {
            Handler::Func { name, .. } => &**name,
            Handler::Meta(meta) => meta.name.as_str(),
        }
    }

    /// Metadata, if this is a [`MetaHandler`].
    pub fn meta(&self) -> Option<&Meta> {
        match self {
            Handler::Func { .. } => None,
            Handler::Meta(meta) => Some(&meta.meta),
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler").field("name", &self.name()).finish()
    }
}

/// A handler that carries a name and a metadata map, e.g. permission tags
/// read by an authorization middleware.
pub struct MetaHandler {
    name: String,
    meta: Meta,
    handler: Handler,
}

impl MetaHandler {
    /// Attaches metadata to a handler, keeping the handler's name.
    pub fn new(meta: Meta, handler: impl IntoHandler) -> Self {
        let handler = handler.into_handler();
        Self {
            name: handler.name().to_owned(),
            meta,
            handler,
        }
    }

    /// Overrides the name used for named-route lookups.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }
}

/// Conversion into a [`Handler`], performed once at registration.
///
/// Implemented for functions and closures taking `&mut Context`, for
/// [`MetaHandler`] and for [`Handler`] itself. Implement it for your own
/// types to register them directly.
pub trait IntoHandler {
    fn into_handler(self) -> Handler;
}

impl<F> IntoHandler for F
where
    F: Fn(&mut Context) -> Result<()> + Send + Sync + 'static,
{
    fn into_handler(self) -> Handler {
        Handler::from_fn(self)
    }
}

impl IntoHandler for Handler {
    fn into_handler(self) -> Handler {
        self
    }
}

impl IntoHandler for MetaHandler {
    fn into_handler(self) -> Handler {
        Handler::Meta(Arc::new(self))
    }
}

/// A middleware value. Clones share identity, which is what
/// [`App::clear`](crate::App::clear) compares.
#[derive(Clone)]
pub enum Middleware {
    /// Receives the next handler and returns the handler that replaces it.
    Wrap { name: Arc<str>, func: Arc<WrapFn> },
    /// Called per request with the context and the next handler.
    Next { name: Arc<str>, func: Arc<NextFn> },
}

impl Middleware {
    /// Creates a decorator middleware.
    ///
    /// ```
    /// use weft::{Context, Handler, Middleware};
    ///
    /// let timing = Middleware::wrap(|next: Handler| {
    ///     Handler::from_fn(move |c: &mut Context| {
    ///         let started = std::time::Instant::now();
    ///         let result = next.handle(c);
    ///         c.set("elapsed_ms", started.elapsed().as_millis() as u64);
    ///         result
    ///     })
    /// });
    /// # let _ = timing;
    /// ```
    pub fn wrap<F>(func: F) -> Self
    where
        F: Fn(Handler) -> Handler + Send + Sync + 'static,
    {
        Middleware::Wrap {
            name: callable_name::<F>(),
            func: Arc::new(func),
        }
    }

    /// Creates an around-style middleware.
    ///
    /// ```
    /// use weft::{Context, Handler, HttpError, Middleware};
    ///
    /// let auth = Middleware::from_fn(|c: &mut Context, next: &Handler| {
    ///     if c.header("authorization").is_none() {
    ///         return Err(HttpError::from_code(401).into());
    ///     }
    ///     next.handle(c)
    /// });
    /// # let _ = auth;
    /// ```
    pub fn from_fn<F>(func: F) -> Self
    where
        F: Fn(&mut Context, &Handler) -> Result<()> + Send + Sync + 'static,
    {
        Middleware::Next {
            name: callable_name::<F>(),
            func: Arc::new(func),
        }
    }

    /// Wraps `next`, producing the handler one level further out.
    pub fn handle(&self, next: Handler) -> Handler {
        match self {
            Middleware::Wrap { func, .. } => func(next),
            Middleware::Next { name, func } => {
                let func = func.clone();
                Handler::named(name.clone(), move |c: &mut Context| func(c, &next))
            }
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Middleware::Wrap { name, .. } | Middleware::Next { name, .. } => &**name,
        }
    }

    fn identity(&self) -> *const () {
        match self {
            Middleware::Wrap { func, .. } => Arc::as_ptr(func) as *const (),
            Middleware::Next { func, .. } => Arc::as_ptr(func) as *const (),
        }
    }
}

impl PartialEq for Middleware {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl fmt::Debug for Middleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Middleware").field("name", &self.name()).finish()
    }
}
