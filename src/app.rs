//! The application orchestrator: a builder over modules, plugins,
//! middleware, and routes; the boot sequence of §4.7; and the HTTP/1.1
//! accept loop that discriminates a WebSocket upgrade from a plain request.
//!
//! Grounded in the teacher's `Server` (raw-buffer read, `TcpListener::accept`
//! + `tokio::spawn` loop, sequential middleware, 404 fallback) but the wire
//! parsing is upgraded from a `\r\n\r\n` split to `httparse`, and middleware
//! is composed once at boot via [`crate::middleware::compose`] instead of
//! walked by hand per request.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

use crate::config::Config;
use crate::container::Container;
use crate::error::{Error, Result};
use crate::handler::HandlerFn;
use crate::middleware::{compose, MiddlewareFn};
use crate::module::{self, Module};
use crate::plugin::{Plugin, PluginContext, PluginRegistry};
use crate::request::{Method, Request, Uri, Version};
use crate::response::Response;
use crate::router::Router;

#[cfg(feature = "websockets")]
use crate::websocket;

/// Opaque, pre-built TLS handle accepted at bind time. The core never
/// constructs one itself — consistent with §1's non-goal of certificate
/// management — it only wraps an accepted stream with it when present.
#[cfg(feature = "tls")]
pub type SecurityContext = tokio_rustls::TlsAcceptor;

/// Uninhabited without the `tls` feature, so nothing can construct one and
/// `App::security_context` is a compile error to call.
#[cfg(not(feature = "tls"))]
pub enum SecurityContext {}

/// Builder: add modules, plugins, middleware, and bare routes, then
/// [`App::build`] to run the boot sequence and get back a [`RunningApp`].
pub struct App {
    container: Container,
    router: Router,
    modules: Vec<Arc<dyn Module>>,
    plugins: PluginRegistry,
    middlewares: Vec<MiddlewareFn>,
    config: Config,
    security_context: Option<SecurityContext>,
}

impl App {
    pub fn new() -> Self {
        Self::with_config(Config::load_default())
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            container: Container::new(),
            router: Router::new(),
            modules: Vec::new(),
            plugins: PluginRegistry::new(),
            middlewares: Vec::new(),
            config,
            security_context: None,
        }
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn module(mut self, module: Arc<dyn Module>) -> Self {
        self.modules.push(module);
        self
    }

    pub fn plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.add(plugin);
        self
    }

    /// Appends a middleware to the declared list. The first one added ends
    /// up outermost once composed (see [`crate::middleware::compose`]).
    pub fn middleware(mut self, mw: MiddlewareFn) -> Self {
        self.middlewares.push(mw);
        self
    }

    pub fn get(mut self, pattern: &str, handler: HandlerFn) -> Self {
        self.router.get(pattern, handler).expect("route registration failed");
        self
    }

    pub fn post(mut self, pattern: &str, handler: HandlerFn) -> Self {
        self.router.post(pattern, handler).expect("route registration failed");
        self
    }

    pub fn put(mut self, pattern: &str, handler: HandlerFn) -> Self {
        self.router.put(pattern, handler).expect("route registration failed");
        self
    }

    pub fn delete(mut self, pattern: &str, handler: HandlerFn) -> Self {
        self.router.delete(pattern, handler).expect("route registration failed");
        self
    }

    pub fn patch(mut self, pattern: &str, handler: HandlerFn) -> Self {
        self.router.patch(pattern, handler).expect("route registration failed");
        self
    }

    #[cfg(feature = "websockets")]
    pub fn websocket(mut self, pattern: &str, handler: crate::websocket::WsHandlerFn) -> Self {
        self.router.websocket(pattern, handler).expect("route registration failed");
        self
    }

    pub fn mount(mut self, prefix: &str, router: Router) -> Self {
        self.router.mount(prefix, router);
        self
    }

    #[cfg(feature = "tls")]
    pub fn security_context(mut self, ctx: SecurityContext) -> Self {
        self.security_context = Some(ctx);
        self
    }

    /// Boot sequence (§4.7): validate + register modules in import order,
    /// register plugins in declaration order, compose middleware around the
    /// router's fallible dispatch. Any failure here is fatal and propagates
    /// to the embedder — nothing has bound a socket yet.
    pub async fn build(mut self) -> Result<RunningApp> {
        let registered_modules =
            module::register_all(&self.modules, &self.container, &mut self.router, &self.config).await?;

        self.plugins.validate()?;
        for plugin in self.plugins.plugins().to_vec() {
            let mut ctx = PluginContext {
                container: &self.container,
                router: &mut self.router,
                config: &self.config,
            };
            plugin.register(&mut ctx).await.map_err(|err| Error::PluginRegistrationFailed {
                plugin: plugin.name().to_string(),
                reason: err.to_string(),
            })?;
        }
        self.plugins.init_all().await?;
        self.plugins.start_all().await?;

        let router = Arc::new(self.router);
        let innermost: HandlerFn = {
            let router = router.clone();
            crate::handler::try_handler(move |req: Request| {
                let router = router.clone();
                async move { router.dispatch_fallible(req).await }
            })
        };
        let handler = compose(&self.middlewares, innermost);

        Ok(RunningApp {
            router,
            handler,
            modules: registered_modules,
            plugins: Arc::new(self.plugins),
            container: self.container,
            config: self.config,
            security_context: self.security_context,
            shutting_down: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
        })
    }
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

/// Bound and ready to serve. Produced by [`App::build`]; `serve` drives the
/// accept loop until [`RunningApp::shutdown`] is called (from this task or
/// another one holding the same `Arc<RunningApp>`).
pub struct RunningApp {
    router: Arc<Router>,
    handler: HandlerFn,
    modules: Vec<Arc<dyn Module>>,
    plugins: Arc<PluginRegistry>,
    container: Container,
    config: Config,
    #[allow(dead_code)]
    security_context: Option<SecurityContext>,
    shutting_down: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
}

impl RunningApp {
    pub fn list_routes(&self) -> Vec<String> {
        self.router.list_routes()
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Binds the configured address and accepts connections until shutdown.
    /// Each accepted connection is a spawned task; per-connection failures
    /// are logged, never propagated to the loop.
    pub async fn serve(&self) -> Result<()> {
        let addr: SocketAddr = self
            .config
            .bind_address()
            .parse()
            .map_err(|err: std::net::AddrParseError| Error::Io(err.to_string()))?;

        let listener = bind_listener(addr, self.config.server.shared)?;
        println!("[APP] listening on {}", addr);

        let max_body = self.config.server.max_body_bytes;
        let idle_timeout = self.config.server.idle_timeout_secs.map(Duration::from_secs);

        loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                break;
            }

            let (stream, remote_addr) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        eprintln!("[APP] accept failed: {}", err);
                        continue;
                    }
                },
                _ = self.shutdown_notify.notified() => break,
            };

            let handler = self.handler.clone();
            let router = self.router.clone();
            let plugins = self.plugins.clone();

            tokio::spawn(async move {
                if let Err(err) =
                    handle_connection(stream, remote_addr, handler, router, plugins, max_body, idle_timeout).await
                {
                    eprintln!("[APP] connection error: {}", err);
                }
            });
        }

        Ok(())
    }

    /// Idempotent: a second call is a no-op. Tears down modules (reverse
    /// registration order), disposes plugins (reverse priority order), then
    /// disposes the container, then wakes the accept loop so it stops.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            self.shutdown_notify.notify_waiters();
            return;
        }
        module::dispose_all(&self.modules).await;
        if let Err(err) = self.plugins.dispose_all().await {
            eprintln!("[APP] plugin disposal failed: {}", err);
        }
        self.container.dispose();
        self.shutdown_notify.notify_waiters();
        println!("[APP] shutdown complete");
    }
}

fn bind_listener(addr: SocketAddr, shared: bool) -> Result<TcpListener> {
    use socket2::{Domain, Socket, Type};

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)
        .map_err(|err| Error::Io(err.to_string()))?;
    socket.set_reuse_address(true).map_err(|err| Error::Io(err.to_string()))?;
    #[cfg(unix)]
    if shared {
        socket.set_reuse_port(true).map_err(|err| Error::Io(err.to_string()))?;
    }
    #[cfg(not(unix))]
    let _ = shared;
    socket.set_nonblocking(true).map_err(|err| Error::Io(err.to_string()))?;
    socket.bind(&addr.into()).map_err(|err| Error::Io(err.to_string()))?;
    socket.listen(1024).map_err(|err| Error::Io(err.to_string()))?;

    TcpListener::from_std(socket.into()).map_err(Error::from)
}

/// Reads and parses one HTTP/1.1 request off `stream` with `httparse`,
/// discriminates a WebSocket upgrade, and either dispatches it through the
/// composed `handler` or hands it to [`crate::websocket`]. Connections are
/// not kept alive across requests in this design; one accept, one exchange.
async fn handle_connection(
    mut stream: TcpStream,
    remote_addr: SocketAddr,
    handler: HandlerFn,
    router: Arc<Router>,
    plugins: Arc<PluginRegistry>,
    max_body: Option<usize>,
    idle_timeout: Option<Duration>,
) -> Result<()> {
    plugins.on_stream_accept(&mut stream).await?;

    let read_fut = read_request(&mut stream, remote_addr, max_body);
    let mut req = match idle_timeout {
        Some(timeout) => match tokio::time::timeout(timeout, read_fut).await {
            Ok(result) => result?,
            Err(_) => return Err(Error::Cancelled),
        },
        None => read_fut.await?,
    };

    plugins.on_request(&mut req).await?;

    #[cfg(feature = "websockets")]
    if websocket::is_websocket_upgrade(&req) {
        return handle_websocket_upgrade(stream, req, router).await;
    }

    let mut response = match handler.call(req.clone()).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    };

    plugins.on_response(&req, &mut response).await?;

    response.write_to(&mut stream).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(feature = "websockets")]
async fn handle_websocket_upgrade(mut stream: TcpStream, req: Request, router: Arc<Router>) -> Result<()> {
    let (params, handler, normalized) = match router.match_websocket(&req.path) {
        Some(found) => found,
        None => {
            let response = Response::not_found(&format!("no WebSocket route for {}", req.path));
            response.write_to(&mut stream).await?;
            return Ok(());
        }
    };

    let upgrade_response = match websocket::websocket_upgrade(&req) {
        Some(response) => response,
        None => {
            let response = websocket::upgrade_error_response();
            response.write_to(&mut stream).await?;
            return Ok(());
        }
    };

    let upgraded_request = req
        .copy_with_params(params)
        .copy_with_path(&normalized, &req.path);

    upgrade_response.write_to(&mut stream).await?;

    let ws_stream = websocket::accept(stream).await;
    let session = crate::websocket::WebSocketSession::new(ws_stream, upgraded_request);
    websocket::run_session(handler, session).await;
    Ok(())
}

/// Parses the request line and headers with `httparse`, then reads exactly
/// `content-length` body bytes (0 if absent), failing `PayloadTooLarge` if a
/// cap is configured and exceeded.
async fn read_request(stream: &mut TcpStream, remote_addr: SocketAddr, max_body: Option<usize>) -> Result<Request> {
    let mut buf = Vec::with_capacity(8 * 1024);
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::Io("connection closed before headers were complete".into()));
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut parsed = httparse::Request::new(&mut headers);
        match parsed.parse(&buf).map_err(|err| Error::MalformedBody(err.to_string()))? {
            httparse::Status::Complete(offset) => break offset,
            httparse::Status::Partial => {
                if buf.len() > 64 * 1024 {
                    return Err(Error::MalformedBody("request head too large".into()));
                }
                continue;
            }
        }
    };

    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Request::new(&mut headers);
    parsed.parse(&buf).map_err(|err| Error::MalformedBody(err.to_string()))?;

    let method = parsed.method.ok_or_else(|| Error::MalformedBody("missing method".into()))?;
    let path = parsed.path.ok_or_else(|| Error::MalformedBody("missing path".into()))?;
    let version = match parsed.version {
        Some(1) => Version::Http11,
        Some(0) => Version::Http10,
        other => Version::Unknown(format!("{:?}", other)),
    };

    // Multiple occurrences of the same header name are joined with ", " at
    // construction time rather than the last one winning.
    let mut header_map = std::collections::HashMap::new();
    for header in parsed.headers.iter() {
        if header.name.is_empty() {
            continue;
        }
        let value = String::from_utf8_lossy(header.value).into_owned();
        header_map
            .entry(header.name.to_string())
            .and_modify(|existing: &mut String| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }

    let content_length: usize = header_map
        .get("Content-Length")
        .or_else(|| header_map.get("content-length"))
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    if let Some(limit) = max_body {
        if content_length > limit {
            return Err(Error::PayloadTooLarge { limit });
        }
    }

    let mut body = buf[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
        if let Some(limit) = max_body {
            if body.len() > limit {
                return Err(Error::PayloadTooLarge { limit });
            }
        }
    }
    body.truncate(content_length);

    Ok(Request::new(
        Method::from_str(method),
        Uri::parse(path),
        version,
        header_map,
        body,
        Some(remote_addr),
    ))
}
