//! A small modular application: a `users` module that owns its own DI
//! registration and sub-router, a request-counting plugin, and the usual
//! logging/CORS/request-id/error-trap middleware stack, wired together
//! through `App`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use embers::prelude::*;

#[derive(Clone)]
struct UserStore {
    users: Vec<&'static str>,
}

struct UsersModule;

#[async_trait]
impl Module for UsersModule {
    fn name(&self) -> &'static str {
        "users"
    }

    fn exports(&self) -> Vec<&'static str> {
        vec![std::any::type_name::<UserStore>()]
    }

    async fn register(&self, ctx: &mut ModuleContext<'_>) -> Result<()> {
        ctx.container.register_singleton(UserStore { users: vec!["alice", "bob"] })?;

        ctx.router.get(
            "/",
            handler(|_req| async {
                Response::json(StatusCode::OK, &serde_json::json!({ "users": ["alice", "bob"] }))
            }),
        )?;

        ctx.router.get(
            "/:id",
            handler(|req: Request| async move {
                let id = req.param("id").unwrap_or("unknown").to_string();
                Response::json(StatusCode::OK, &serde_json::json!({ "userId": id }))
            }),
        )?;

        Ok(())
    }
}

struct RequestCounterPlugin {
    count: AtomicUsize,
}

#[async_trait]
impl Plugin for RequestCounterPlugin {
    fn name(&self) -> &'static str {
        "request-counter"
    }

    async fn register(&self, _ctx: &mut PluginContext<'_>) -> Result<()> {
        Ok(())
    }

    async fn on_request(&self, _req: &mut Request) -> Result<()> {
        let seen = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        println!("[request-counter] requests seen: {seen}");
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let app = App::new()
        .module(Arc::new(UsersModule))
        .plugin(Arc::new(RequestCounterPlugin { count: AtomicUsize::new(0) }))
        .middleware(middleware::logging())
        .middleware(middleware::request_id())
        .middleware(middleware::cors(middleware::CorsConfig::default()))
        .middleware(middleware::error_trap(false))
        .get("/health", handler(|_req| async { Response::text(StatusCode::OK, "ok") }));

    let running = app.build().await?;
    for route in running.list_routes() {
        println!("[ROUTE] {route}");
    }

    running.serve().await
}
