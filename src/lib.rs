//! Embers: an embeddable HTTP/WebSocket service runtime.
//!
//! The core is a trie router with nested mounts and WebSocket upgrade
//! support, an onion-model middleware pipeline, a type-keyed DI container,
//! and a module/plugin subsystem for dependency-ordered feature
//! registration — wired together by [`App`].

pub mod app;
pub mod config;
pub mod container;
pub mod error;
pub mod handler;
pub mod middleware;
pub mod module;
pub mod plugin;
pub mod request;
pub mod response;
pub mod router;

#[cfg(feature = "websockets")]
pub mod websocket;


pub use app::{App, RunningApp, SecurityContext};
pub use config::{config, get_config, init_config, Config, ServerConfig};
pub use container::Container;
pub use error::{Error, Result};
pub use handler::{handler, try_handler, Handler, HandlerFn};
pub use middleware::{Middleware, MiddlewareFn};
pub use module::{Module, ModuleContext};
pub use plugin::{Plugin, PluginContext, PluginRegistry};
pub use request::{Context, Cookie, Method, Request, Uri, Version};
pub use response::{Response, ResponseBody, StatusCode};
pub use router::Router;

#[cfg(feature = "websockets")]
pub use websocket::{
    is_websocket_upgrade, websocket_upgrade, ws_handler, Message as WebSocketMessage,
    WebSocketHandler, WebSocketRoom, WebSocketSession, WsHandlerFn,
};

#[cfg(any(test, feature = "testing"))]
pub use test::{TestClient, TestRequest, TestResponse};

/// Single-import convenience for embedders: `use embers::prelude::*;`.
pub mod prelude {
    pub use crate::{
        handler, try_handler, App, Config, Container, Error, Handler, HandlerFn, Method,
        Middleware, MiddlewareFn, Module, ModuleContext, Plugin, PluginContext, PluginRegistry,
        Request, Response, ResponseBody, Result, Router, RunningApp, ServerConfig, StatusCode, Uri,
        Version,
    };
    pub use crate::middleware;

    #[cfg(feature = "websockets")]
    pub use crate::{
        is_websocket_upgrade, websocket_upgrade, ws_handler, WebSocketHandler, WebSocketMessage,
        WebSocketRoom, WebSocketSession, WsHandlerFn,
    };

    #[cfg(any(test, feature = "testing"))]
    pub use crate::{TestClient, TestRequest, TestResponse};
}
