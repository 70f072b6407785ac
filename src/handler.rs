use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::Result;
use crate::request::Request;
use crate::response::Response;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A route handler: takes an owned `Request`, produces a `Result<Response>`.
/// Implemented for any `Fn(Request) -> impl Future<Output = Result<Response>>`,
/// so plain fallible async closures can be registered directly. Use
/// [`handler`] to lift an infallible `Fn(Request) -> impl Future<Output = Response>`.
pub trait Handler: Send + Sync {
    fn call(&self, req: Request) -> BoxFuture<'static, Result<Response>>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    fn call(&self, req: Request) -> BoxFuture<'static, Result<Response>> {
        Box::pin(self(req))
    }
}

pub type HandlerFn = Arc<dyn Handler>;

/// Lift an infallible handler (one that always produces a `Response`) into
/// a `HandlerFn`.
pub fn handler<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    Arc::new(move |req: Request| {
        let fut = f(req);
        async move { Ok(fut.await) }
    })
}

/// Register a handler that may itself fail; the failure propagates up
/// through the middleware chain as an `Err`, to be turned into a response
/// by the error-trap middleware or, failing that, the router's own fallback.
pub fn try_handler<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    Arc::new(f)
}
