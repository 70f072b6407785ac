//! Plugins: boot-time units that get `register(ctx)` access to the shared
//! container and root router, plus optional `onInit`/`onDispose` lifecycle
//! hooks.
//!
//! Beyond that two-hook contract, a plugin may also declare a `priority`
//! (breaking ties among `onInit`/`onDispose` order), `depends_on` (validated
//! the same way module imports are), and `on_request`/`on_response` hooks run
//! around every exchange in priority order — a coarser second middleware
//! tier plugins get without being threaded through the router by hand.

use std::any::Any;
use std::collections::HashSet;
use std::sync::Arc;

use crate::config::Config;
use crate::container::Container;
use crate::error::{Error, Result};
use crate::request::Request;
use crate::response::Response;
use crate::router::Router;

/// Handed to `Plugin::register`. Plugins add to `container` and `router`
/// exactly as a module's `register` does.
pub struct PluginContext<'a> {
    pub container: &'a Container,
    pub router: &'a mut Router,
    pub config: &'a Config,
}

#[async_trait::async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Higher runs its `on_init`/`on_start` earlier; `on_dispose` then
    /// unwinds in the opposite order, so the last plugin started is the
    /// first disposed. Ties keep declaration order (and reverse declaration
    /// order on dispose).
    fn priority(&self) -> i32 {
        0
    }

    /// Other plugin names this one requires to also be registered. Checked
    /// at `validate`, the same way a module's `imports` are.
    fn depends_on(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Add routes, DI registrations, whatever the plugin provides. Runs for
    /// every plugin in declaration order; the first failure aborts boot.
    async fn register(&self, ctx: &mut PluginContext<'_>) -> Result<()>;

    async fn on_init(&self) -> Result<()> {
        Ok(())
    }

    async fn on_start(&self) -> Result<()> {
        Ok(())
    }

    async fn on_dispose(&self) -> Result<()> {
        Ok(())
    }

    async fn on_reload(&self) -> Result<()> {
        Ok(())
    }

    /// Runs before the router dispatches, in priority order, ahead of the
    /// middleware chain.
    async fn on_request(&self, _req: &mut Request) -> Result<()> {
        Ok(())
    }

    /// Runs after a response is produced, in priority order.
    async fn on_response(&self, _req: &Request, _res: &mut Response) -> Result<()> {
        Ok(())
    }

    /// Runs once per accepted TCP connection, before any bytes are parsed.
    async fn on_stream_accept(&self, _stream: &mut tokio::net::TcpStream) -> Result<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any;
}

/// Holds registered plugins in both their declaration order (for `register`
/// and boot-time diagnostics) and their priority order (for the lifecycle
/// and request/response hooks).
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn Plugin>>,
    priority_order: Vec<usize>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            plugins: Vec::new(),
            priority_order: Vec::new(),
        }
    }

    /// Add a plugin in declaration order. Does not validate or sort; call
    /// [`PluginRegistry::validate`] once every plugin has been added.
    pub fn add(&mut self, plugin: Arc<dyn Plugin>) {
        println!("[PLUGIN] registered: {}", plugin.name());
        self.plugins.push(plugin);
    }

    /// Checks for duplicate names and unmet `depends_on`, then fixes the
    /// priority order used by the lifecycle and request/response hooks.
    pub fn validate(&mut self) -> Result<()> {
        let mut seen = HashSet::new();
        for plugin in &self.plugins {
            if !seen.insert(plugin.name()) {
                return Err(Error::PluginRegistrationFailed {
                    plugin: plugin.name().to_string(),
                    reason: "duplicate plugin name".to_string(),
                });
            }
        }

        let names: HashSet<&str> = self.plugins.iter().map(|p| p.name()).collect();
        for plugin in &self.plugins {
            for dep in plugin.depends_on() {
                if !names.contains(dep) {
                    return Err(Error::PluginRegistrationFailed {
                        plugin: plugin.name().to_string(),
                        reason: format!("depends on unregistered plugin '{}'", dep),
                    });
                }
            }
        }

        let mut order: Vec<usize> = (0..self.plugins.len()).collect();
        order.sort_by_key(|&i| std::cmp::Reverse(self.plugins[i].priority()));
        self.priority_order = order;
        Ok(())
    }

    /// Plugins in the order they were added, for driving `register`.
    pub fn plugins(&self) -> &[Arc<dyn Plugin>] {
        &self.plugins
    }

    fn in_priority_order(&self) -> impl Iterator<Item = &Arc<dyn Plugin>> {
        self.priority_order.iter().map(move |&i| &self.plugins[i])
    }

    pub async fn init_all(&self) -> Result<()> {
        for plugin in self.in_priority_order() {
            println!("[PLUGIN] initializing: {}", plugin.name());
            plugin.on_init().await?;
        }
        Ok(())
    }

    pub async fn start_all(&self) -> Result<()> {
        for plugin in self.in_priority_order() {
            plugin.on_start().await?;
        }
        Ok(())
    }

    /// Reverse of `init_all`/`start_all`'s priority order: the last plugin to
    /// start is the first to dispose.
    pub async fn dispose_all(&self) -> Result<()> {
        for &i in self.priority_order.iter().rev() {
            let plugin = &self.plugins[i];
            println!("[PLUGIN] disposing: {}", plugin.name());
            if let Err(err) = plugin.on_dispose().await {
                eprintln!("[PLUGIN] {} failed to dispose: {}", plugin.name(), err);
            }
        }
        Ok(())
    }

    pub async fn reload_all(&self) -> Result<()> {
        for plugin in self.in_priority_order() {
            plugin.on_reload().await?;
        }
        Ok(())
    }

    pub async fn on_request(&self, req: &mut Request) -> Result<()> {
        for plugin in self.in_priority_order() {
            plugin.on_request(req).await?;
        }
        Ok(())
    }

    pub async fn on_response(&self, req: &Request, res: &mut Response) -> Result<()> {
        for plugin in self.in_priority_order() {
            plugin.on_response(req, res).await?;
        }
        Ok(())
    }

    pub async fn on_stream_accept(&self, stream: &mut tokio::net::TcpStream) -> Result<()> {
        for plugin in self.in_priority_order() {
            plugin.on_stream_accept(stream).await?;
        }
        Ok(())
    }

    pub fn get<T: Plugin + 'static>(&self) -> Option<&T> {
        self.plugins.iter().find_map(|p| p.as_any().downcast_ref::<T>())
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        name: &'static str,
        priority: i32,
        order: Arc<std::sync::Mutex<Vec<&'static str>>>,
    }

    #[async_trait::async_trait]
    impl Plugin for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        async fn register(&self, _ctx: &mut PluginContext<'_>) -> Result<()> {
            Ok(())
        }

        async fn on_init(&self) -> Result<()> {
            self.order.lock().unwrap().push(self.name);
            Ok(())
        }

        async fn on_dispose(&self) -> Result<()> {
            self.order.lock().unwrap().push(self.name);
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[tokio::test]
    async fn init_runs_in_priority_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut registry = PluginRegistry::new();
        registry.add(Arc::new(Recorder { name: "low", priority: 0, order: order.clone() }));
        registry.add(Arc::new(Recorder { name: "high", priority: 10, order: order.clone() }));
        registry.validate().unwrap();
        registry.init_all().await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["high", "low"]);
    }

    #[tokio::test]
    async fn dispose_runs_in_reverse_priority_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut registry = PluginRegistry::new();
        registry.add(Arc::new(Recorder { name: "low", priority: 0, order: order.clone() }));
        registry.add(Arc::new(Recorder { name: "high", priority: 10, order: order.clone() }));
        registry.validate().unwrap();
        registry.dispose_all().await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["low", "high"]);
    }

    #[test]
    fn duplicate_name_rejected() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut registry = PluginRegistry::new();
        registry.add(Arc::new(Recorder { name: "dup", priority: 0, order: order.clone() }));
        registry.add(Arc::new(Recorder { name: "dup", priority: 0, order: order.clone() }));
        assert!(registry.validate().is_err());
    }

    #[test]
    fn missing_dependency_rejected() {
        struct Needs(Arc<AtomicUsize>);

        #[async_trait::async_trait]
        impl Plugin for Needs {
            fn name(&self) -> &'static str {
                "needs"
            }
            fn depends_on(&self) -> Vec<&'static str> {
                vec!["absent"]
            }
            async fn register(&self, _ctx: &mut PluginContext<'_>) -> Result<()> {
                Ok(())
            }
            fn as_any(&self) -> &dyn Any {
                self
            }
        }

        let mut registry = PluginRegistry::new();
        registry.add(Arc::new(Needs(Arc::new(AtomicUsize::new(0)))));
        assert!(registry.validate().is_err());
    }
}
