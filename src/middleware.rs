//! Onion-model middleware pipeline.
//!
//! A [`Middleware`] wraps a downstream [`HandlerFn`] into a new upstream one.
//! [`compose`] applies a declared list right-to-left so the first entry ends
//! up outermost, matching how a reader expects the list to read top to
//! bottom. Handlers and middleware alike traffic in `Result<Response>` — a
//! middleware that wants to short-circuit just doesn't call downstream; one
//! that wants to report failure returns `Err`, which propagates outward
//! until the error-trap middleware (or the router's own fallback) converts
//! it to a response.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::error::{Error, Result};
use crate::handler::HandlerFn;
use crate::request::Request;
use crate::response::{Response, StatusCode};

pub trait Middleware: Send + Sync {
    fn wrap(&self, next: HandlerFn) -> HandlerFn;
}

impl<F> Middleware for F
where
    F: Fn(HandlerFn) -> HandlerFn + Send + Sync,
{
    fn wrap(&self, next: HandlerFn) -> HandlerFn {
        self(next)
    }
}

pub type MiddlewareFn = Arc<dyn Middleware>;

/// Compose middlewares right-to-left so `list[0]` is outermost.
pub fn compose(middlewares: &[MiddlewareFn], innermost: HandlerFn) -> HandlerFn {
    middlewares.iter().rev().fold(innermost, |next, mw| mw.wrap(next))
}

fn with_handler<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Response>> + Send + 'static,
{
    Arc::new(f)
}

/// Emits method/path/status/elapsed-ms once the downstream handler settles,
/// whether it resolved or failed, then re-raises the failure unchanged.
pub fn logging() -> MiddlewareFn {
    Arc::new(|next: HandlerFn| -> HandlerFn {
        let next = next.clone();
        with_handler(move |req: Request| {
            let next = next.clone();
            async move {
                let method = req.method.as_str().to_string();
                let path = req.path.clone();
                let started = Instant::now();
                let outcome = next.call(req).await;
                let elapsed = started.elapsed();
                match &outcome {
                    Ok(response) => println!(
                        "[HTTP] {} {} -> {} ({}ms)",
                        method,
                        path,
                        response.status.code(),
                        elapsed.as_millis()
                    ),
                    Err(err) => println!(
                        "[HTTP] {} {} -> failed: {} ({}ms)",
                        method,
                        path,
                        err,
                        elapsed.as_millis()
                    ),
                }
                outcome
            }
        })
    })
}

#[derive(Clone)]
pub struct CorsConfig {
    pub allowed_origin: String,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub allow_credentials: bool,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origin: "*".to_string(),
            allowed_methods: vec!["GET", "POST", "PUT", "DELETE", "PATCH", "OPTIONS"]
                .into_iter()
                .map(String::from)
                .collect(),
            allowed_headers: vec!["content-type", "authorization"]
                .into_iter()
                .map(String::from)
                .collect(),
            allow_credentials: false,
        }
    }
}

/// Answers `OPTIONS` directly with 204 and the configured CORS headers;
/// every other response passes through with the same headers attached.
pub fn cors(config: CorsConfig) -> MiddlewareFn {
    Arc::new(move |next: HandlerFn| -> HandlerFn {
        let next = next.clone();
        let config = config.clone();
        with_handler(move |req: Request| {
            let next = next.clone();
            let config = config.clone();
            async move {
                let is_preflight = req.method.as_str() == "OPTIONS";
                let response = if is_preflight {
                    Response::empty()
                } else {
                    next.call(req).await?
                };
                Ok(response
                    .with_header("access-control-allow-origin", &config.allowed_origin)
                    .with_header("access-control-allow-methods", &config.allowed_methods.join(", "))
                    .with_header("access-control-allow-headers", &config.allowed_headers.join(", "))
                    .with_header(
                        "access-control-allow-credentials",
                        if config.allow_credentials { "true" } else { "false" },
                    ))
            }
        })
    })
}

/// Converts `MalformedBody`/`PayloadTooLarge` to 400/413 and any other
/// failure to a generic 500. In `development` mode the failure text is
/// included in the body instead of a fixed generic message.
pub fn error_trap(development: bool) -> MiddlewareFn {
    Arc::new(move |next: HandlerFn| -> HandlerFn {
        let next = next.clone();
        with_handler(move |req: Request| {
            let next = next.clone();
            async move {
                match next.call(req).await {
                    Ok(response) => Ok(response),
                    Err(err) => Ok(render_trapped_error(err, development)),
                }
            }
        })
    })
}

fn render_trapped_error(err: Error, development: bool) -> Response {
    match err {
        Error::MalformedBody(_) | Error::PayloadTooLarge { .. } => err.into_response(),
        other => {
            let message = if development {
                other.to_string()
            } else {
                "Internal Server Error".to_string()
            };
            Response::internal_server_error(&message)
        }
    }
}

pub type AuthValidator = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Extracts a bearer token from `authorization`, invokes `validator`, and on
/// success stashes the validated principal under `context["user"]`.
/// Otherwise responds 401 without calling downstream.
pub fn auth(validator: AuthValidator) -> MiddlewareFn {
    Arc::new(move |next: HandlerFn| -> HandlerFn {
        let next = next.clone();
        let validator = validator.clone();
        with_handler(move |req: Request| {
            let next = next.clone();
            let validator = validator.clone();
            async move {
                let token = req
                    .header("authorization")
                    .and_then(|h| h.strip_prefix("Bearer "))
                    .map(str::to_string);

                let principal = token.as_deref().and_then(|t| validator(t));

                match principal {
                    Some(user) => {
                        let mut context = req.context.clone();
                        context.insert("user", user);
                        next.call(req.copy_with_context(context)).await
                    }
                    None => Ok(Response::unauthorized("Missing or invalid bearer token")),
                }
            }
        })
    })
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Per-client token bucket keyed by a configurable identifier header. Idle
/// buckets are lazily refilled (and effectively evicted once their tokens
/// top back out) rather than swept on a timer.
pub struct RateLimiter {
    header: String,
    capacity: f64,
    refill_per_sec: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(header: &str, capacity: u32, window: Duration) -> Self {
        Self {
            header: header.to_string(),
            capacity: capacity as f64,
            refill_per_sec: capacity as f64 / window.as_secs_f64().max(0.001),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn try_consume(&self, client: &str) -> bool {
        let mut buckets = self.buckets.lock().unwrap();
        let now = Instant::now();
        let bucket = buckets.entry(client.to_string()).or_insert_with(|| Bucket {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

pub fn rate_limit(limiter: Arc<RateLimiter>) -> MiddlewareFn {
    Arc::new(move |next: HandlerFn| -> HandlerFn {
        let next = next.clone();
        let limiter = limiter.clone();
        with_handler(move |req: Request| {
            let next = next.clone();
            let limiter = limiter.clone();
            async move {
                let client = req
                    .header(&limiter.header)
                    .map(str::to_string)
                    .unwrap_or_else(|| "anonymous".to_string());

                if limiter.try_consume(&client) {
                    next.call(req).await
                } else {
                    Ok(Response::json(
                        StatusCode::custom(429),
                        &serde_json::json!({ "error": "rate limit exceeded" }),
                    )
                    .with_header("retry-after", "1"))
                }
            }
        })
    })
}

fn generate_request_id() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.gen();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Copies an incoming `x-request-id` or generates one, stashes it in
/// `context["request_id"]`, and echoes it back on the response.
pub fn request_id() -> MiddlewareFn {
    Arc::new(|next: HandlerFn| -> HandlerFn {
        let next = next.clone();
        with_handler(move |req: Request| {
            let next = next.clone();
            async move {
                let id = req
                    .header("x-request-id")
                    .map(str::to_string)
                    .unwrap_or_else(generate_request_id);

                let mut context = req.context.clone();
                context.insert("request_id", id.clone());
                let response = next.call(req.copy_with_context(context)).await?;
                Ok(response.with_header("x-request-id", &id))
            }
        })
    })
}

/// Sets a fixed battery of defensive response headers.
pub fn security_headers() -> MiddlewareFn {
    Arc::new(|next: HandlerFn| -> HandlerFn {
        let next = next.clone();
        with_handler(move |req: Request| {
            let next = next.clone();
            async move {
                let response = next.call(req).await?;
                Ok(response
                    .with_header("x-frame-options", "DENY")
                    .with_header("x-content-type-options", "nosniff")
                    .with_header("referrer-policy", "no-referrer")
                    .with_header("permissions-policy", "geolocation=(), microphone=(), camera=()")
                    .with_header("x-xss-protection", "1; mode=block"))
            }
        })
    })
}

pub type MetricsSink = Arc<dyn Fn(&str, &str, u16, Duration, Option<usize>) + Send + Sync>;

/// Invokes `sink(method, path, status, duration, body_size)` after each
/// response that resolved successfully.
pub fn metrics(sink: MetricsSink) -> MiddlewareFn {
    Arc::new(move |next: HandlerFn| -> HandlerFn {
        let next = next.clone();
        let sink = sink.clone();
        with_handler(move |req: Request| {
            let next = next.clone();
            let sink = sink.clone();
            async move {
                let method = req.method.as_str().to_string();
                let path = req.path.clone();
                let started = Instant::now();
                let response = next.call(req).await?;
                let elapsed = started.elapsed();
                sink(&method, &path, response.status.code(), elapsed, response.body.len());
                Ok(response)
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler;
    use std::sync::Mutex;

    fn recording(tag: &'static str, log: Arc<Mutex<Vec<&'static str>>>) -> MiddlewareFn {
        Arc::new(move |next: HandlerFn| -> HandlerFn {
            let next = next.clone();
            let log = log.clone();
            with_handler(move |req: Request| {
                let next = next.clone();
                let log = log.clone();
                async move {
                    log.lock().unwrap().push(concat_pre(tag));
                    let result = next.call(req).await;
                    log.lock().unwrap().push(concat_post(tag));
                    result
                }
            })
        })
    }

    fn concat_pre(tag: &'static str) -> &'static str {
        match tag {
            "1" => "1-pre",
            "2" => "2-pre",
            _ => unreachable!(),
        }
    }

    fn concat_post(tag: &'static str) -> &'static str {
        match tag {
            "1" => "1-post",
            "2" => "2-post",
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn onion_composition_runs_pre_in_order_post_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let m1 = recording("1", log.clone());
        let m2 = recording("2", log.clone());

        let innermost = handler(move |_req| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push("handler");
                Response::text(StatusCode::OK, "ok")
            }
        });

        let composed = compose(&[m1, m2], innermost);
        let resp = composed.call(Request::test(crate::request::Method::Get, "/h", Vec::new())).await.unwrap();
        assert_eq!(resp.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn onion_ordering_matches_scenario_c() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let m1 = recording("1", log.clone());
        let m2 = recording("2", log.clone());
        let log_for_handler = log.clone();

        let innermost = handler(move |_req| {
            let log = log_for_handler.clone();
            async move {
                log.lock().unwrap().push("handler");
                Response::text(StatusCode::OK, "ok")
            }
        });

        let composed = compose(&[m1, m2], innermost);
        composed.call(Request::test(crate::request::Method::Get, "/h", Vec::new())).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["1-pre", "2-pre", "handler", "2-post", "1-post"]
        );
    }

    #[tokio::test]
    async fn cors_preflight_answers_204_without_calling_downstream() {
        let called = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let called_clone = called.clone();
        let innermost = handler(move |_req| {
            called_clone.store(true, std::sync::atomic::Ordering::SeqCst);
            async { Response::text(StatusCode::OK, "ok") }
        });

        let wrapped = cors(CorsConfig::default()).wrap(innermost);
        let req = Request::test(crate::request::Method::from_str("OPTIONS"), "/x", Vec::new());
        let resp = wrapped.call(req).await.unwrap();

        assert_eq!(resp.status, StatusCode::NO_CONTENT);
        assert!(!called.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(resp.headers.get("access-control-allow-origin").unwrap(), "*");
    }

    #[tokio::test]
    async fn error_trap_converts_handler_failure_to_500_in_production_mode() {
        use crate::handler::try_handler;

        let innermost = try_handler(|_req| async { Err(Error::HandlerFailed("boom".into())) });
        let wrapped = error_trap(false).wrap(innermost);
        let resp = wrapped.call(Request::test(crate::request::Method::Get, "/x", Vec::new())).await.unwrap();

        assert_eq!(resp.status, StatusCode::INTERNAL_SERVER_ERROR);
        let crate::response::ResponseBody::Buffered(body) = &resp.body else {
            panic!("expected buffered body");
        };
        let value: serde_json::Value = serde_json::from_slice(body).unwrap();
        assert_eq!(value["error"], "Internal Server Error");
    }

    #[tokio::test]
    async fn error_trap_includes_failure_text_in_development_mode() {
        use crate::handler::try_handler;

        let innermost = try_handler(|_req| async { Err(Error::HandlerFailed("boom".into())) });
        let wrapped = error_trap(true).wrap(innermost);
        let resp = wrapped.call(Request::test(crate::request::Method::Get, "/x", Vec::new())).await.unwrap();

        let crate::response::ResponseBody::Buffered(body) = &resp.body else {
            panic!("expected buffered body");
        };
        let value: serde_json::Value = serde_json::from_slice(body).unwrap();
        assert!(value["error"].as_str().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn auth_rejects_missing_bearer_token_with_401() {
        let innermost = handler(|_req| async { Response::text(StatusCode::OK, "ok") });
        let validator: AuthValidator = Arc::new(|_token: &str| None);
        let wrapped = auth(validator).wrap(innermost);

        let resp = wrapped.call(Request::test(crate::request::Method::Get, "/x", Vec::new())).await.unwrap();
        assert_eq!(resp.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn auth_stashes_validated_principal_in_context() {
        let innermost = handler(|req: Request| async move {
            let user = req.context.get_str("user").unwrap_or("").to_string();
            Response::text(StatusCode::OK, user)
        });
        let validator: AuthValidator = Arc::new(|token: &str| {
            if token == "good" {
                Some("alice".to_string())
            } else {
                None
            }
        });
        let wrapped = auth(validator).wrap(innermost);

        let mut req = Request::test(crate::request::Method::Get, "/x", Vec::new());
        req.headers.insert("authorization".to_string(), "Bearer good".to_string());
        let resp = wrapped.call(req).await.unwrap();
        assert!(resp.to_bytes().ends_with(b"alice"));
    }

    #[tokio::test]
    async fn rate_limit_blocks_once_bucket_is_exhausted() {
        let innermost = handler(|_req| async { Response::text(StatusCode::OK, "ok") });
        let limiter = Arc::new(RateLimiter::new("x-client", 1, Duration::from_secs(60)));
        let wrapped = rate_limit(limiter).wrap(innermost);

        let first = wrapped.call(Request::test(crate::request::Method::Get, "/x", Vec::new())).await.unwrap();
        assert_eq!(first.status, StatusCode::OK);

        let second = wrapped.call(Request::test(crate::request::Method::Get, "/x", Vec::new())).await.unwrap();
        assert_eq!(second.status.code(), 429);
        assert_eq!(second.headers.get("retry-after").unwrap(), "1");
    }

    #[tokio::test]
    async fn request_id_generates_and_echoes_header() {
        let innermost = handler(|_req| async { Response::text(StatusCode::OK, "ok") });
        let wrapped = request_id().wrap(innermost);

        let resp = wrapped.call(Request::test(crate::request::Method::Get, "/x", Vec::new())).await.unwrap();
        assert!(resp.headers.contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn security_headers_sets_the_fixed_battery() {
        let innermost = handler(|_req| async { Response::text(StatusCode::OK, "ok") });
        let wrapped = security_headers().wrap(innermost);

        let resp = wrapped.call(Request::test(crate::request::Method::Get, "/x", Vec::new())).await.unwrap();
        assert_eq!(resp.headers.get("x-frame-options").unwrap(), "DENY");
        assert_eq!(resp.headers.get("x-content-type-options").unwrap(), "nosniff");
    }

    #[tokio::test]
    async fn metrics_invokes_sink_with_method_path_and_status() {
        let innermost = handler(|_req| async { Response::text(StatusCode::OK, "ok") });
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = seen.clone();
        let sink: MetricsSink = Arc::new(move |method, path, status, _elapsed, _size| {
            *seen_clone.lock().unwrap() = Some((method.to_string(), path.to_string(), status));
        });
        let wrapped = metrics(sink).wrap(innermost);

        wrapped.call(Request::test(crate::request::Method::Get, "/x", Vec::new())).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(("GET".to_string(), "/x".to_string(), 200)));
    }
}
