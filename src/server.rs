//! The transport seam and the bundled hyper engine.
//!
//! Handlers are synchronous, so the engine moves every request onto tokio's
//! blocking pool, sized by [`ServerConfig::max_workers`]. The async side
//! only accepts connections and shuttles bodies.

use std::convert::Infallible;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hyper::server::conn::{AddrIncoming, AddrStream};
use hyper::service::{make_service_fn, service_fn};
use tokio::runtime::Runtime;
use tokio::sync::oneshot;

use crate::config::ServerConfig;
use crate::error::{EngineError, EngineResult};
use crate::http::{Body, Cancellation, Request, Response, ResponseBuilder};

/// Per-connection information passed to a [`Service`].
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    /// Address of the remote peer
    pub peer_addr: Option<SocketAddr>,
}

/// A synchronous request handler run by an [`Engine`].
///
/// [`App`](crate::App) implements it; so does any
/// `Fn(Request, ConnectionInfo) -> Response`.
pub trait Service: Send + Sync + 'static {
    fn call(&self, request: Request, info: ConnectionInfo) -> Response;
}

impl<F> Service for F
where
    F: Fn(Request, ConnectionInfo) -> Response + Send + Sync + 'static,
{
    fn call(&self, request: Request, info: ConnectionInfo) -> Response {
        (self)(request, info)
    }
}

/// An HTTP transport.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Serves `service` until [`stop`](Engine::stop) is called or serving fails.
    async fn start(&self, service: Arc<dyn Service>) -> EngineResult<()>;

    /// Begins a graceful shutdown: in-flight requests finish, new
    /// connections are refused.
    fn stop(&self) -> EngineResult<()>;
}

/// The hyper 0.14 engine.
///
/// ```no_run
/// use std::sync::Arc;
/// use weft::{App, Context, RouteRegister, Server};
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let app = App::new();
///     app.get("/", |c: &mut Context| c.string(200, "Hello World!"));
///
///     let server = Arc::new(Server::bind("127.0.0.1:3000"));
///     server.runtime()?.block_on(app.run(server.clone()))?;
///     Ok(())
/// }
/// ```
pub struct Server {
    config: ServerConfig,
    address: String,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl Server {
    /// Creates a server bound to `config.host:config.port`.
    pub fn new(config: ServerConfig) -> Self {
        let address = config.address();
        Self {
            config,
            address,
            shutdown: Mutex::new(None),
        }
    }

    /// Creates a server with the default configuration and the given
    /// address. A `tcp://` scheme is accepted and ignored.
    pub fn bind(address: &str) -> Self {
        Self::new(ServerConfig::default()).with_address(address)
    }

    /// Overrides the listen address.
    pub fn with_address(mut self, address: &str) -> Self {
        self.address = address.trim_start_matches("tcp://").to_owned();
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Builds a tokio runtime whose blocking pool matches the worker settings.
    pub fn runtime(&self) -> std::io::Result<Runtime> {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .max_blocking_threads(self.config.max_workers.max(1))
            .thread_keep_alive(self.config.worker_keep_alive())
            .thread_name("weft-worker")
            .build()
    }

    fn socket_addr(&self) -> EngineResult<SocketAddr> {
        self.address
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| EngineError::Address(self.address.clone()))
    }
}

#[async_trait]
impl Engine for Server {
    async fn start(&self, service: Arc<dyn Service>) -> EngineResult<()> {
        let addr = self.socket_addr()?;
        let mut incoming = AddrIncoming::bind(&addr).map_err(EngineError::Bind)?;
        incoming.set_keepalive(Some(self.config.tcp_keep_alive()));
        incoming.set_nodelay(true);

        let (tx, rx) = oneshot::channel();
        {
            let mut shutdown = self.shutdown.lock().map_err(|_| EngineError::LockPoisoned)?;
            if shutdown.is_some() {
                return Err(EngineError::AlreadyRunning);
            }
            *shutdown = Some(tx);
        }

        let make_service = make_service_fn(move |conn: &AddrStream| {
            let service = service.clone();
            let info = ConnectionInfo {
                peer_addr: Some(conn.remote_addr()),
            };
            async move {
                Ok::<_, Infallible>(service_fn(move |request| {
                    serve(service.clone(), info.clone(), request)
                }))
            }
        });

        let builder = hyper::Server::builder(incoming)
            .http1_keepalive(self.config.http1_keep_alive)
            .http1_half_close(self.config.http1_half_close)
            .http1_max_buf_size(self.config.http1_max_buf_size);

        #[cfg(feature = "http2")]
        let builder = builder
            .http1_only(self.config.http1_only)
            .http2_only(self.config.http2_only);

        log::info!("listening on {addr}");
        let result = builder
            .serve(make_service)
            .with_graceful_shutdown(async {
                rx.await.ok();
            })
            .await;

        self.shutdown
            .lock()
            .map_err(|_| EngineError::LockPoisoned)?
            .take();
        log::info!("server on {addr} stopped");
        result.map_err(EngineError::Serve)
    }

    fn stop(&self) -> EngineResult<()> {
        let sender = self
            .shutdown
            .lock()
            .map_err(|_| EngineError::LockPoisoned)?
            .take();
        if let Some(sender) = sender {
            log::info!("shutting down {}", self.address);
            sender.send(()).ok();
        }
        Ok(())
    }
}

/// Runs one request on the blocking pool.
///
/// The cancellation guard lives in this future: if hyper drops it because
/// the client went away, the handler sees the flag raised.
async fn serve(
    service: Arc<dyn Service>,
    info: ConnectionInfo,
    request: hyper::Request<hyper::Body>,
) -> Result<hyper::Response<hyper::Body>, Infallible> {
    let cancellation = Cancellation::new();
    let _guard = cancellation.on_drop();

    let mut request = request.map(Body);
    request.extensions_mut().insert(cancellation);

    let response = match tokio::task::spawn_blocking(move || service.call(request, info)).await {
        Ok(response) => response,
        Err(err) => {
            log::error!("request handler failed: {err}");
            ResponseBuilder::new()
                .status(500)
                .body(Body::empty())
                .unwrap_or_else(|_| Response::new(Body::empty()))
        }
    };
    Ok(response.map(|body| body.0))
}
