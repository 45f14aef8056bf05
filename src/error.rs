use hyper::StatusCode;
use std::io;
use thiserror::Error;

/// An error that carries an HTTP status code and a client-facing message.
///
/// Returning this from a handler lets the default error handler answer with
/// `code` and `message` instead of a generic 500.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HttpError {
    /// HTTP status code sent to the client
    pub code: u16,
    /// Response body sent to the client
    pub message: String,
}

impl HttpError {
    /// Creates an error with an explicit message.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Creates an error whose message is the canonical reason phrase of `code`.
    pub fn from_code(code: u16) -> Self {
        Self::new(code, status_text(code))
    }

    pub fn bad_request() -> Self {
        Self::from_code(400)
    }

    pub fn not_found() -> Self {
        Self::from_code(404)
    }

    pub fn method_not_allowed() -> Self {
        Self::from_code(405)
    }

    pub fn internal() -> Self {
        Self::from_code(500)
    }

    /// The status code as a hyper [`StatusCode`], or 500 if `code` is out of range.
    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

/// Returns the canonical reason phrase for a status code, or an empty string.
pub(crate) fn status_text(code: u16) -> &'static str {
    StatusCode::from_u16(code)
        .ok()
        .and_then(|status| status.canonical_reason())
        .unwrap_or("")
}

/// Represents errors returned by handlers, middleware and the context helpers.
#[derive(Debug, Error)]
pub enum Error {
    /// An error with a status code meant for the client
    #[error(transparent)]
    Http(#[from] HttpError),

    /// Two errors from the same request, e.g. a handler error and a failed session save
    #[error("Multiple errors:\n1. {first}\n2. {second}")]
    Multiple {
        first: Box<Error>,
        second: Box<Error>,
    },

    /// Error loading or persisting a session
    #[error("session error: {0}")]
    Session(String),

    /// Error produced by a template or format renderer
    #[error("render error: {0}")]
    Render(String),

    /// Error decoding request data
    #[error("bind error: {0}")]
    Bind(String),

    /// Wrapper for standard I/O errors
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Wrapper for JSON (de)serialization errors
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Any other error raised by application code
    #[error("{0}")]
    Custom(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wraps an arbitrary error or message.
    pub fn custom(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::Custom(err.into())
    }

    /// Merges two errors into one, keeping both messages in order.
    pub fn combine(first: Error, second: Error) -> Self {
        Error::Multiple {
            first: Box::new(first),
            second: Box::new(second),
        }
    }

    /// Returns the HTTP error if this is one.
    pub fn as_http(&self) -> Option<&HttpError> {
        match self {
            Error::Http(err) => Some(err),
            _ => None,
        }
    }
}

/// Represents errors raised by an [`Engine`](crate::Engine) while serving.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The listen address could not be parsed
    #[error("invalid listen address: {0}")]
    Address(String),

    /// Binding the listener failed
    #[error("bind failed: {0}")]
    Bind(hyper::Error),

    /// The server stopped with an error
    #[error("server error: {0}")]
    Serve(hyper::Error),

    /// `start` was called on an engine that is already serving
    #[error("engine already running")]
    AlreadyRunning,

    /// Error when a mutex lock becomes poisoned due to a panic in another thread
    #[error("mutex lock poisoned")]
    LockPoisoned,

    /// Wrapper for standard I/O errors
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Configuration could not be loaded
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),
}

/// Type alias for Results using Error as the error type
pub type Result<T> = std::result::Result<T, Error>;

/// Type alias for Results using EngineError as the error type
pub type EngineResult<T> = std::result::Result<T, EngineError>;
