use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Patch,
    Unknown(String),
}

impl Method {
    pub fn from_str(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Method::Get,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "HEAD" => Method::Head,
            "OPTIONS" => Method::Options,
            "PATCH" => Method::Patch,
            other => Method::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Patch => "PATCH",
            Method::Unknown(s) => s,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
    Http2,
    Unknown(String),
}

#[derive(Debug, Clone)]
pub struct Uri {
    pub path: String,
    pub raw_query: String,
}

impl Uri {
    pub fn parse(raw: &str) -> Self {
        match raw.split_once('?') {
            Some((path, query)) => Uri {
                path: path.to_string(),
                raw_query: query.to_string(),
            },
            None => Uri {
                path: raw.to_string(),
                raw_query: String::new(),
            },
        }
    }
}

fn parse_query(raw: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    if raw.is_empty() {
        return out;
    }
    for pair in raw.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        out.insert(urldecode(k), urldecode(v));
    }
    out
}

fn urldecode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                if let Ok(byte) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                    out.push(byte);
                    i += 3;
                } else {
                    out.push(bytes[i]);
                    i += 1;
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// A single cookie, in the order it appeared on the wire.
#[derive(Debug, Clone)]
pub struct Cookie {
    pub name: String,
    pub value: String,
}

fn parse_cookies(header: &str) -> Vec<Cookie> {
    header
        .split(';')
        .filter_map(|part| {
            let part = part.trim();
            if part.is_empty() {
                return None;
            }
            let (name, value) = part.split_once('=')?;
            Some(Cookie {
                name: name.trim().to_string(),
                value: value.trim().to_string(),
            })
        })
        .collect()
}

/// Opaque per-request scratch space. Keyed by string, as middleware and
/// handlers refer to well-known slots by name (`"_originalPath"`, `"user"`)
/// rather than by type. Cloning a `Context` clones the map shallowly — the
/// stored values are reference-counted, so clones observe the same
/// underlying object.
#[derive(Clone, Default)]
pub struct Context {
    data: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.data.insert(key.into(), Arc::new(value));
    }

    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<&T> {
        self.data.get(key)?.downcast_ref::<T>()
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get::<String>(key).map(|s| s.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Insert only if the key is absent. Used for `_originalPath`, which the
    /// outermost mount sets once and deeper mounts must not overwrite.
    pub fn insert_if_absent<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        let key = key.into();
        if !self.data.contains_key(&key) {
            self.data.insert(key, Arc::new(value));
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").field("keys", &self.data.keys().collect::<Vec<_>>()).finish()
    }
}

/// An immutable request value. `copy_with_path`/`copy_with_params` are the
/// only ways to produce a modified request (used by mounts and the
/// WebSocket upgrade path); everything else is set once at construction.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub uri: Uri,
    pub path: String,
    pub version: Version,
    pub headers: HashMap<String, String>,
    pub params: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub cookies: Vec<Cookie>,
    pub context: Context,
    pub remote_addr: Option<std::net::SocketAddr>,
    body: Arc<Vec<u8>>,
    json_cache: Arc<OnceLock<Result<serde_json::Value>>>,
}

impl Request {
    pub fn new(
        method: Method,
        uri: Uri,
        version: Version,
        mut headers: HashMap<String, String>,
        body: Vec<u8>,
        remote_addr: Option<std::net::SocketAddr>,
    ) -> Self {
        headers = headers
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), v))
            .collect();

        let query = parse_query(&uri.raw_query);
        let cookies = headers
            .get("cookie")
            .map(|h| parse_cookies(h))
            .unwrap_or_default();
        let path = uri.path.clone();

        Request {
            method,
            uri,
            path,
            version,
            headers,
            params: HashMap::new(),
            query,
            cookies,
            context: Context::new(),
            remote_addr,
            body: Arc::new(body),
            json_cache: Arc::new(OnceLock::new()),
        }
    }

    /// Test-only constructor: a Request with no socket, suitable for
    /// `TestClient` and unit tests exercising handlers directly.
    pub fn test(method: Method, path: &str, body: Vec<u8>) -> Self {
        Request::new(
            method,
            Uri::parse(path),
            Version::Http11,
            HashMap::new(),
            body,
            None,
        )
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(|s| s.as_str())
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(|s| s.as_str())
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(|s| s.as_str())
    }

    /// First cookie with this name; later repeats of the same name are kept
    /// in `cookies` but are not reachable here.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.value.as_str())
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_string(&self) -> Result<String> {
        String::from_utf8(self.body.to_vec())
            .map_err(|e| Error::MalformedBody(e.to_string()))
    }

    /// UTF-8 decode + JSON-parse the body, caching the outcome so repeat
    /// calls (e.g. from multiple middleware) don't reparse.
    pub fn json(&self) -> Result<&serde_json::Value> {
        self.json_cache
            .get_or_init(|| {
                serde_json::from_slice(&self.body).map_err(|e| Error::MalformedBody(e.to_string()))
            })
            .as_ref()
            .map_err(|e| e.clone())
    }

    /// Used by the router when descending into a mount: returns a copy with
    /// `path` replaced by the remainder and the original full path recorded
    /// under `_originalPath` (first mount to strip wins; deeper mounts must
    /// not overwrite it).
    pub fn copy_with_path(&self, new_path: &str, original_path: &str) -> Self {
        let mut copy = self.clone();
        copy.path = new_path.to_string();
        copy.context.insert_if_absent("_originalPath", original_path.to_string());
        copy
    }

    pub fn copy_with_params(&self, params: HashMap<String, String>) -> Self {
        let mut copy = self.clone();
        copy.params = params;
        copy
    }

    pub fn copy_with_context(&self, context: Context) -> Self {
        let mut copy = self.clone();
        copy.context = context;
        copy
    }
}
