use std::collections::{BTreeSet, HashMap};

use crate::error::{Error, Result};
use crate::handler::HandlerFn;
use crate::request::Request;
use crate::response::Response;

#[cfg(feature = "websockets")]
use crate::websocket::WsHandlerFn;

/// Strip a leading `/` requirement, join with `/`, and drop a single
/// trailing slash (unless the whole path is `/`).
pub fn normalize_path(path: &str) -> String {
    let mut path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    if path.len() > 1 && path.ends_with('/') {
        path.pop();
    }
    path
}

fn segments(path: &str) -> Vec<String> {
    path.split('/').filter(|s| !s.is_empty()).map(String::from).collect()
}

#[derive(Default)]
struct Node {
    static_children: HashMap<String, Node>,
    param_child: Option<(String, Box<Node>)>,
    methods: HashMap<String, HandlerFn>,
}

impl Node {
    fn child_mut(&mut self, segment: &str) -> &mut Node {
        if let Some(name) = segment.strip_prefix(':') {
            if self.param_child.is_none() {
                self.param_child = Some((name.to_string(), Box::new(Node::default())));
            }
            &mut self.param_child.as_mut().unwrap().1
        } else {
            self.static_children.entry(segment.to_string()).or_default()
        }
    }

    fn insert(&mut self, segs: &[String], method: &str, handler: HandlerFn, pattern: &str) -> Result<()> {
        if segs.is_empty() {
            if self.methods.contains_key(method) {
                return Err(Error::DuplicateRoute {
                    method: method.to_string(),
                    pattern: pattern.to_string(),
                });
            }
            self.methods.insert(method.to_string(), handler);
            return Ok(());
        }
        self.child_mut(&segs[0]).insert(&segs[1..], method, handler, pattern)
    }

    /// Depth-first, static-before-parameter, with backtracking: descending a
    /// static child that fails to reach a populated leaf falls back to the
    /// parameter child.
    fn descend(&self, segs: &[String], params: &mut HashMap<String, String>) -> Option<&Node> {
        if segs.is_empty() {
            return if self.methods.is_empty() { None } else { Some(self) };
        }
        let (seg, rest) = (&segs[0], &segs[1..]);

        if let Some(child) = self.static_children.get(seg) {
            let mut attempt = params.clone();
            if let Some(found) = child.descend(rest, &mut attempt) {
                *params = attempt;
                return Some(found);
            }
        }

        if let Some((name, child)) = &self.param_child {
            let mut attempt = params.clone();
            attempt.insert(name.clone(), seg.clone());
            if let Some(found) = child.descend(rest, &mut attempt) {
                *params = attempt;
                return Some(found);
            }
        }

        None
    }

    fn list(&self, prefix: &str, out: &mut Vec<String>) {
        if !self.methods.is_empty() {
            let methods = allowed_methods(self);
            for m in &methods {
                if m == "HEAD" && self.methods.contains_key("GET") {
                    continue;
                }
                if m == "OPTIONS" && !self.methods.contains_key("OPTIONS") {
                    continue;
                }
                out.push(format!("{m} {}", if prefix.is_empty() { "/" } else { prefix }));
            }
        }
        for (seg, child) in &self.static_children {
            child.list(&format!("{prefix}/{seg}"), out);
        }
        if let Some((name, child)) = &self.param_child {
            child.list(&format!("{prefix}/:{name}"), out);
        }
    }
}

fn allowed_methods(node: &Node) -> BTreeSet<String> {
    let mut set: BTreeSet<String> = node.methods.keys().cloned().collect();
    if set.remove("*") {
        for m in ["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD"] {
            set.insert(m.to_string());
        }
    }
    if set.contains("GET") {
        set.insert("HEAD".to_string());
    }
    set.insert("OPTIONS".to_string());
    set
}

#[derive(Default)]
struct WsNode {
    static_children: HashMap<String, WsNode>,
    param_child: Option<(String, Box<WsNode>)>,
    #[cfg(feature = "websockets")]
    handler: Option<WsHandlerFn>,
}

#[cfg(feature = "websockets")]
impl WsNode {
    fn child_mut(&mut self, segment: &str) -> &mut WsNode {
        if let Some(name) = segment.strip_prefix(':') {
            if self.param_child.is_none() {
                self.param_child = Some((name.to_string(), Box::new(WsNode::default())));
            }
            &mut self.param_child.as_mut().unwrap().1
        } else {
            self.static_children.entry(segment.to_string()).or_default()
        }
    }

    fn insert(&mut self, segs: &[String], handler: WsHandlerFn, pattern: &str) -> Result<()> {
        if segs.is_empty() {
            if self.handler.is_some() {
                return Err(Error::DuplicateRoute {
                    method: "WS".to_string(),
                    pattern: pattern.to_string(),
                });
            }
            self.handler = Some(handler);
            return Ok(());
        }
        self.child_mut(&segs[0]).insert(&segs[1..], handler, pattern)
    }

    fn descend(&self, segs: &[String], params: &mut HashMap<String, String>) -> Option<&WsNode> {
        if segs.is_empty() {
            return if self.handler.is_some() { Some(self) } else { None };
        }
        let (seg, rest) = (&segs[0], &segs[1..]);

        if let Some(child) = self.static_children.get(seg) {
            let mut attempt = params.clone();
            if let Some(found) = child.descend(rest, &mut attempt) {
                *params = attempt;
                return Some(found);
            }
        }
        if let Some((name, child)) = &self.param_child {
            let mut attempt = params.clone();
            attempt.insert(name.clone(), seg.clone());
            if let Some(found) = child.descend(rest, &mut attempt) {
                *params = attempt;
                return Some(found);
            }
        }
        None
    }
}

struct Mount {
    prefix: String,
    router: Router,
}

/// Segment trie router: static/param HTTP trie, a parallel WebSocket trie,
/// and an ordered list of nested mounts consulted before the local tries.
#[derive(Default)]
pub struct Router {
    root: Node,
    #[cfg(feature = "websockets")]
    ws_root: WsNode,
    mounts: Vec<Mount>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&mut self, method: &str, pattern: &str, handler: HandlerFn) -> Result<()> {
        let normalized = normalize_path(pattern);
        let segs = segments(&normalized);
        self.root.insert(&segs, &method.to_uppercase(), handler, &normalized)
    }

    pub fn get(&mut self, pattern: &str, handler: HandlerFn) -> Result<()> {
        self.route("GET", pattern, handler)
    }

    pub fn post(&mut self, pattern: &str, handler: HandlerFn) -> Result<()> {
        self.route("POST", pattern, handler)
    }

    pub fn put(&mut self, pattern: &str, handler: HandlerFn) -> Result<()> {
        self.route("PUT", pattern, handler)
    }

    pub fn delete(&mut self, pattern: &str, handler: HandlerFn) -> Result<()> {
        self.route("DELETE", pattern, handler)
    }

    pub fn patch(&mut self, pattern: &str, handler: HandlerFn) -> Result<()> {
        self.route("PATCH", pattern, handler)
    }

    #[cfg(feature = "websockets")]
    pub fn websocket(&mut self, pattern: &str, handler: WsHandlerFn) -> Result<()> {
        let normalized = normalize_path(pattern);
        let segs = segments(&normalized);
        self.ws_root.insert(&segs, handler, &normalized)
    }

    /// Normalizes `prefix` and appends to the mount list in insertion order.
    /// Mounts are consulted before the local trie, and only one mount (the
    /// first whose prefix the path starts with) ever runs.
    pub fn mount(&mut self, prefix: &str, router: Router) {
        self.mounts.push(Mount {
            prefix: normalize_path(prefix),
            router,
        });
    }

    fn find_mount(&self, path: &str) -> Option<&Mount> {
        self.mounts.iter().find(|m| path.starts_with(&m.prefix))
    }

    /// Dispatches an HTTP request: mounts first (in insertion order), then
    /// the local trie with HEAD/OPTIONS/405 method resolution. Never falls
    /// through from the trie back to a later mount. Infallible: any handler
    /// failure is converted to a response here directly, which is why this
    /// is what `TestClient` and a router used with no middleware call.
    /// Code composing the router into a middleware pipeline should use
    /// [`Router::dispatch_fallible`] instead, so an outer error-trap
    /// middleware gets first refusal on `HandlerFailed`.
    pub async fn dispatch(&self, req: Request) -> Response {
        match self.dispatch_fallible(req).await {
            Ok(response) => response,
            Err(err) => err.into_response(),
        }
    }

    /// Same dispatch as [`Router::dispatch`], except a handler's own
    /// failure propagates as `Err` instead of being converted here.
    /// `RouteNotFound`/`MethodNotAllowed`/synthesized `OPTIONS` are not
    /// propagated — per the error taxonomy those are normal outcomes, not
    /// failures — so they are always returned as `Ok`.
    pub async fn dispatch_fallible(&self, req: Request) -> Result<Response> {
        let normalized = normalize_path(&req.path);

        if let Some(mount) = self.find_mount(&normalized) {
            let remainder = &normalized[mount.prefix.len()..];
            let new_path = if remainder.is_empty() { "/".to_string() } else { remainder.to_string() };
            let derived = req.copy_with_path(&new_path, &normalized);
            return Box::pin(mount.router.dispatch_fallible(derived)).await;
        }

        self.dispatch_local(req, &normalized).await
    }

    async fn dispatch_local(&self, req: Request, normalized: &str) -> Result<Response> {
        let segs = segments(normalized);
        let mut params = HashMap::new();

        let leaf = match self.root.descend(&segs, &mut params) {
            Some(leaf) => leaf,
            None => {
                return Ok(Error::RouteNotFound {
                    method: req.method.as_str().to_string(),
                    path: normalized.to_string(),
                }
                .into_response())
            }
        };

        let method = req.method.as_str().to_uppercase();

        if let Some(handler) = leaf.methods.get(&method) {
            return handler.call(req.copy_with_params(params)).await;
        }

        if method == "HEAD" {
            if let Some(handler) = leaf.methods.get("GET") {
                let mut resp = handler.call(req.copy_with_params(params)).await?;
                resp.body = crate::response::ResponseBody::Buffered(bytes::Bytes::new());
                return Ok(resp);
            }
        }

        if method != "OPTIONS" {
            if let Some(handler) = leaf.methods.get("*") {
                return handler.call(req.copy_with_params(params)).await;
            }
        }

        if method == "OPTIONS" {
            if let Some(handler) = leaf.methods.get("OPTIONS") {
                return handler.call(req.copy_with_params(params)).await;
            }
            let allowed: Vec<String> = allowed_methods(leaf).into_iter().collect();
            return Ok(Response::empty().with_header("allow", &allowed.join(", ")));
        }

        let allowed: Vec<String> = allowed_methods(leaf).into_iter().collect();
        Ok(Error::MethodNotAllowed { method, allowed }.into_response())
    }

    /// Consults mounts (recursively) then the local WebSocket trie.
    #[cfg(feature = "websockets")]
    pub fn match_websocket(&self, path: &str) -> Option<(HashMap<String, String>, WsHandlerFn, String)> {
        let normalized = normalize_path(path);

        if let Some(mount) = self.find_mount(&normalized) {
            let remainder = &normalized[mount.prefix.len()..];
            let new_path = if remainder.is_empty() { "/".to_string() } else { remainder.to_string() };
            return mount.router.match_websocket(&new_path);
        }

        let segs = segments(&normalized);
        let mut params = HashMap::new();
        let leaf = self.ws_root.descend(&segs, &mut params)?;
        Some((params, leaf.handler.clone().unwrap(), normalized))
    }

    /// Human-readable `METHOD /pattern` lines for diagnostics, including
    /// `WS /pattern` and `MOUNT /prefix -> [nested router]` entries.
    pub fn list_routes(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.root.list("", &mut out);
        #[cfg(feature = "websockets")]
        self.list_ws("", &mut out);
        for mount in &self.mounts {
            out.push(format!("MOUNT {} -> [nested router]", mount.prefix));
        }
        out.sort();
        out
    }

    #[cfg(feature = "websockets")]
    fn list_ws(&self, prefix: &str, out: &mut Vec<String>) {
        fn walk(node: &WsNode, prefix: &str, out: &mut Vec<String>) {
            if node.handler.is_some() {
                out.push(format!("WS {}", if prefix.is_empty() { "/" } else { prefix }));
            }
            for (seg, child) in &node.static_children {
                walk(child, &format!("{prefix}/{seg}"), out);
            }
            if let Some((name, child)) = &node.param_child {
                walk(child, &format!("{prefix}/:{name}"), out);
            }
        }
        walk(&self.ws_root, prefix, out);
    }
}
