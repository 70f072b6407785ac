use std::fmt;

/// Standard result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// The engine's error taxonomy.
///
/// Configuration-kind variants (DI, module, plugin) are fatal during boot and
/// propagate to the embedder; the rest are request-time failures that the
/// error-trap middleware (or, failing that, the runtime itself) turns into a
/// response.
#[derive(Debug, Clone)]
pub enum Error {
    /// No trie node matched the request path.
    RouteNotFound { method: String, path: String },
    /// A leaf matched but has no handler for the request method.
    MethodNotAllowed { method: String, allowed: Vec<String> },
    /// Router build time: the same (method, pattern) pair was registered
    /// twice, or a WebSocket pattern was registered twice.
    DuplicateRoute { method: String, pattern: String },
    /// Body bytes could not be parsed as the requested shape (e.g. JSON).
    MalformedBody(String),
    /// Buffered body exceeded the configured cap.
    PayloadTooLarge { limit: usize },
    /// DI: no registration exists for the requested type, anywhere in the
    /// parent chain.
    NotRegistered(&'static str),
    /// DI: a second registration was attempted for an already-registered
    /// type without going through `override_singleton`.
    AlreadyRegistered(&'static str),
    /// DI: resolving the named type re-entered itself before returning.
    CircularDependency { chain: Vec<&'static str> },
    /// Module boot: two modules declared the same name.
    DuplicateModuleName(String),
    /// Module boot: `imports` formed a cycle.
    CircularModuleImport { chain: Vec<String> },
    /// Module boot: `register` did not populate a type listed in `exports`.
    ModuleExportMissing {
        module: String,
        type_name: &'static str,
    },
    /// Plugin boot: `register` returned an error, or a declared dependency
    /// was never registered.
    PluginRegistrationFailed { plugin: String, reason: String },
    /// A handler or middleware future resolved to an error instead of a
    /// `Response`.
    HandlerFailed(String),
    /// The WebSocket handshake could not be completed.
    WebSocketUpgradeFailed(String),
    /// The in-flight request observed a cancellation signal.
    Cancelled,
    /// Lower-level I/O failure (socket read/write, listener bind).
    Io(String),
    /// JSON encode/decode failure outside of the request-body path.
    Json(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::RouteNotFound { method, path } => {
                write!(f, "Route not found: {} {}", method, path)
            }
            Error::MethodNotAllowed { method, .. } => {
                write!(f, "Method {} not allowed", method)
            }
            Error::DuplicateRoute { method, pattern } => {
                write!(f, "Route already registered: {} {}", method, pattern)
            }
            Error::MalformedBody(msg) => write!(f, "Malformed body: {}", msg),
            Error::PayloadTooLarge { limit } => {
                write!(f, "Payload too large (limit {} bytes)", limit)
            }
            Error::NotRegistered(ty) => write!(f, "No registration for type {}", ty),
            Error::AlreadyRegistered(ty) => write!(f, "Type {} is already registered", ty),
            Error::CircularDependency { chain } => {
                write!(f, "Circular dependency: {}", chain.join(" -> "))
            }
            Error::DuplicateModuleName(name) => write!(f, "Duplicate module name: {}", name),
            Error::CircularModuleImport { chain } => {
                write!(f, "Circular module import: {}", chain.join(" -> "))
            }
            Error::ModuleExportMissing { module, type_name } => write!(
                f,
                "Module '{}' did not register its exported type {}",
                module, type_name
            ),
            Error::PluginRegistrationFailed { plugin, reason } => {
                write!(f, "Plugin '{}' failed to register: {}", plugin, reason)
            }
            Error::HandlerFailed(msg) => write!(f, "Handler failed: {}", msg),
            Error::WebSocketUpgradeFailed(msg) => {
                write!(f, "WebSocket upgrade failed: {}", msg)
            }
            Error::Cancelled => write!(f, "Request cancelled"),
            Error::Io(msg) => write!(f, "I/O error: {}", msg),
            Error::Json(msg) => write!(f, "JSON error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err.to_string())
    }
}

#[cfg(feature = "websockets")]
impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocketUpgradeFailed(err.to_string())
    }
}

impl Error {
    /// Status code this error maps to when the runtime converts it to a
    /// response directly (no error-trap middleware installed).
    pub fn status_code(&self) -> u16 {
        match self {
            Error::RouteNotFound { .. } => 404,
            Error::MethodNotAllowed { .. } => 405,
            Error::MalformedBody(_) => 400,
            Error::PayloadTooLarge { .. } => 413,
            Error::WebSocketUpgradeFailed(_) => 400,
            _ => 500,
        }
    }

    /// Render this error as the canonical `{"error": <message>}` response,
    /// attaching an `allow` header where the taxonomy calls for one.
    pub fn into_response(self) -> crate::response::Response {
        use crate::response::{Response, StatusCode};

        let status = StatusCode::custom(self.status_code());
        let message = if self.status_code() == 500 {
            "Internal Server Error".to_string()
        } else {
            self.to_string()
        };

        let mut response = Response::json(status, &serde_json::json!({ "error": message }));

        if let Error::MethodNotAllowed { allowed, .. } = &self {
            response = response.with_header("allow", &allowed.join(", "));
        }

        response
    }
}
