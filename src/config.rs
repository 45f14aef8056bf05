use serde::Deserialize;
use std::convert::TryFrom;
use std::time::Duration;

/// Configuration for the HTTP engine and the framework toggles.
///
/// It can be initialized from environment variables with the "WEFT_" prefix
/// or from a config file, see [`ServerConfig::new`].
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Server host address. Defaults to "127.0.0.1".
    #[serde(default = "default_host")]
    pub host: String,
    /// Server port number. Defaults to 3000.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum number of blocking worker threads running handlers. Defaults to CPU count * 15.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Idle seconds before a worker thread exits. Defaults to 6 seconds.
    #[serde(default = "default_keep_alive_secs")]
    pub worker_keep_alive_secs: u64,
    /// TCP keep-alive period set on every accepted connection. Defaults to 3 minutes.
    #[serde(default = "default_tcp_keep_alive_secs")]
    pub tcp_keep_alive_secs: u64,
    #[serde(default = "default_true")]
    pub http1_keep_alive: bool,
    #[serde(default)]
    pub http1_half_close: bool,
    /// Maximum buffer size for HTTP/1.x requests. Defaults to 512kb (524,288 bytes).
    #[serde(default = "default_max_buf_size")]
    pub http1_max_buf_size: usize,
    #[serde(default)]
    pub http1_only: bool,
    #[cfg(feature = "http2")]
    #[serde(default)]
    pub http2_only: bool,
    /// Exposes raw error messages to clients.
    #[serde(default)]
    pub debug: bool,
    /// Logs every compiled route when the router is rebuilt.
    #[serde(default)]
    pub route_debug: bool,
    /// Logs every middleware registration.
    #[serde(default)]
    pub middleware_debug: bool,
    /// Upper bound of idle request contexts kept for reuse. Defaults to 1024.
    #[serde(default = "default_max_idle_contexts")]
    pub max_idle_contexts: usize,
}

/// Implements conversion from the config crate's Config type to ServerConfig.
impl TryFrom<config::Config> for ServerConfig {
    type Error = config::ConfigError;

    fn try_from(config: config::Config) -> Result<Self, Self::Error> {
        config.try_deserialize()
    }
}

impl ServerConfig {
    /// Creates a new ServerConfig instance from environment variables and config file.
    ///
    /// This method will:
    /// 1. Load environment variables from a .env file if present
    /// 2. Load configuration from a "config" file (if it exists)
    /// 3. Override with environment variables prefixed with "WEFT_"
    ///
    /// # Errors
    /// Returns a ConfigError if configuration loading or parsing fails.
    pub fn new() -> Result<Self, config::ConfigError> {
        dotenv::dotenv().ok();

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("WEFT"));

        builder.build()?.try_into()
    }

    /// The `host:port` pair the engine binds to.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Converts the worker_keep_alive_secs value into a Duration.
    pub fn worker_keep_alive(&self) -> Duration {
        Duration::from_secs(self.worker_keep_alive_secs)
    }

    /// Converts the tcp_keep_alive_secs value into a Duration.
    pub fn tcp_keep_alive(&self) -> Duration {
        Duration::from_secs(self.tcp_keep_alive_secs)
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

/// Default value for max_workers. Returns CPU count * 15.
fn default_max_workers() -> usize {
    num_cpus::get() * 15
}

fn default_keep_alive_secs() -> u64 {
    6
}

fn default_tcp_keep_alive_secs() -> u64 {
    180
}

fn default_true() -> bool {
    true
}

/// Default maximum buffer size (512kb).
fn default_max_buf_size() -> usize {
    524_288
}

fn default_max_idle_contexts() -> usize {
    1024
}

/// Provides the same defaults as an empty config source.
impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_workers: default_max_workers(),
            worker_keep_alive_secs: default_keep_alive_secs(),
            tcp_keep_alive_secs: default_tcp_keep_alive_secs(),
            http1_keep_alive: true,
            http1_half_close: false,
            http1_max_buf_size: default_max_buf_size(),
            http1_only: false,
            #[cfg(feature = "http2")]
            http2_only: false,
            debug: false,
            route_debug: false,
            middleware_debug: false,
            max_idle_contexts: default_max_idle_contexts(),
        }
    }
}
