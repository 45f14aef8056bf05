#![allow(clippy::return_self_not_must_use)]
#![doc = include_str!("../README.md")]

//! ## Architecture
//!
//! - [`App`]: route registry, global middleware, hosts and dispatch
//! - [`Group`] and [`Host`]: prefix and virtual-host scoped registration
//! - [`Router`]: first-match route lookup over compiled routes
//! - [`Context`]: per-request state and response writers, pooled per app
//! - [`Engine`]: the transport seam; [`Server`] is the bundled hyper engine
//!
//! Handlers are synchronous. The engine runs each one on tokio's blocking
//! pool, so a handler may block without stalling the connection loop.
//!
//! ## Configuration
//! [`ServerConfig::new`] reads, lowest priority first:
//! - built-in defaults
//! - an optional `config.toml`
//! - environment variables prefixed with `WEFT_` (a `.env` file is loaded)
//!
//! ## Features
//! - `http2`: Enables HTTP/2 support (enabled by default)

pub use crate::app::{
    default_http_error_handler, App, HandlerWrapper, HttpErrorHandler, MiddlewareWrapper, UriParams,
};
pub use crate::config::ServerConfig;
pub use crate::context::{Context, PreResponseHook, ResponseWriter};
pub use crate::error::{EngineError, EngineResult, Error, HttpError, Result};
pub use crate::group::{Group, Host};
pub use crate::handler::{Handler, IntoHandler, Meta, MetaHandler, Middleware};
pub use crate::http::{
    Body, Bytes, Cancellation, HeaderMap, Method, Request, Response, ResponseBuilder, StatusCode,
};
pub use crate::register::{RouteRef, RouteRegister};
pub use crate::render::{Binder, DefaultBinder, FormatRenderer, Renderer};
pub use crate::route::{Route, RouteMethod, METHODS};
pub use crate::router::Router;
pub use crate::server::{ConnectionInfo, Engine, Server, Service};
pub use crate::session::{
    remember_max_age, sessions, CookieOptions, MemoryStore, PreSaveHook, SameSite, Session,
    SessionOptions, Sessioner, Store, COOKIE_MAX_AGE_KEY,
};

mod app;
mod chain;
mod config;
mod context;
mod error;
mod group;
mod handler;
mod http;
mod pool;
mod register;
mod render;
mod route;
mod router;
mod server;
pub mod session;
mod static_files;

// Re-export common types
pub use hyper;
