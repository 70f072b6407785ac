//! Module subsystem: self-contained feature units that own their own DI
//! registrations and a private sub-router, mounted onto the root router at
//! `/<name>` once `register` has run.
//!
//! Modules form a DAG over `imports`; [`register_all`] validates the graph,
//! then walks it depth-first so a module is only registered after every
//! module it imports.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Config;
use crate::container::Container;
use crate::error::{Error, Result};
use crate::router::Router;

/// Handed to `Module::register`. `router` is a fresh, empty sub-router that
/// the engine mounts at `/<module.name>` once `register` returns
/// successfully.
pub struct ModuleContext<'a> {
    pub container: &'a Container,
    pub router: &'a mut Router,
    pub config: &'a Config,
}

#[async_trait]
pub trait Module: Send + Sync {
    /// Unique across the application; also the mount prefix.
    fn name(&self) -> &'static str;

    /// Other module names that must finish registering before this one.
    fn imports(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// `std::any::type_name` tags this module promises to have registered
    /// in the container by the time `register` returns. Checked right
    /// after `register` via [`Container::contains_named`].
    fn exports(&self) -> Vec<&'static str> {
        Vec::new()
    }

    async fn on_init(&self) -> Result<()> {
        Ok(())
    }

    async fn register(&self, ctx: &mut ModuleContext<'_>) -> Result<()>;

    /// Runs after `register` succeeds and exports have been asserted, and
    /// after the sub-router has been mounted.
    async fn on_ready(&self) -> Result<()> {
        Ok(())
    }

    async fn on_destroy(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    White,
    Grey,
    Black,
}

/// Fail if two modules share a name, or if `imports` forms a cycle.
fn validate(modules: &[Arc<dyn Module>]) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for module in modules {
        if !seen.insert(module.name()) {
            return Err(Error::DuplicateModuleName(module.name().to_string()));
        }
    }

    let by_name: HashMap<&str, &Arc<dyn Module>> = modules.iter().map(|m| (m.name(), m)).collect();
    let mut marks: HashMap<&str, Mark> = modules.iter().map(|m| (m.name(), Mark::White)).collect();

    fn visit<'a>(
        name: &'a str,
        by_name: &HashMap<&'a str, &'a Arc<dyn Module>>,
        marks: &mut HashMap<&'a str, Mark>,
        chain: &mut Vec<String>,
    ) -> Result<()> {
        match marks.get(name) {
            Some(Mark::Black) => return Ok(()),
            Some(Mark::Grey) => {
                chain.push(name.to_string());
                return Err(Error::CircularModuleImport { chain: chain.clone() });
            }
            _ => {}
        }

        marks.insert(name, Mark::Grey);
        chain.push(name.to_string());

        if let Some(module) = by_name.get(name) {
            for import in module.imports() {
                visit(import, by_name, marks, chain)?;
            }
        }

        chain.pop();
        marks.insert(name, Mark::Black);
        Ok(())
    }

    for module in modules {
        let mut chain = Vec::new();
        visit(module.name(), &by_name, &mut marks, &mut chain)?;
    }

    Ok(())
}

/// Validates the module set, then registers each module in post-order over
/// its `imports`, mounting its private router at `/<name>` on success.
/// Returns the names in the order they finished registering, so shutdown
/// can tear them down in reverse.
pub async fn register_all(
    modules: &[Arc<dyn Module>],
    container: &Container,
    root: &mut Router,
    config: &Config,
) -> Result<Vec<Arc<dyn Module>>> {
    validate(modules)?;

    let by_name: HashMap<&str, Arc<dyn Module>> =
        modules.iter().map(|m| (m.name(), m.clone())).collect();

    let mut registered = std::collections::HashSet::new();
    let mut order = Vec::new();

    async fn register_one<'a>(
        name: &'a str,
        by_name: &HashMap<&'a str, Arc<dyn Module>>,
        registered: &mut std::collections::HashSet<&'a str>,
        order: &mut Vec<Arc<dyn Module>>,
        container: &Container,
        root: &mut Router,
        config: &Config,
    ) -> Result<()> {
        if registered.contains(name) {
            return Ok(());
        }

        let module = by_name
            .get(name)
            .cloned()
            .expect("validated import graph references only known modules");

        for import in module.imports() {
            Box::pin(register_one(import, by_name, registered, order, container, root, config)).await?;
        }

        println!("[MODULE] initializing: {}", module.name());
        module.on_init().await?;

        let mut sub_router = Router::new();
        {
            let mut ctx = ModuleContext { container, router: &mut sub_router, config };
            module.register(&mut ctx).await?;
        }

        for tag in module.exports() {
            if !container.contains_named(tag) {
                return Err(Error::ModuleExportMissing {
                    module: module.name().to_string(),
                    type_name: tag,
                });
            }
        }

        root.mount(&format!("/{}", module.name()), sub_router);

        module.on_ready().await?;

        registered.insert(name);
        order.push(module);
        Ok(())
    }

    for module in modules {
        register_one(module.name(), &by_name, &mut registered, &mut order, container, root, config)
            .await?;
    }

    Ok(order)
}

/// Tears down modules in reverse-registration order. Best-effort: a
/// module's `on_destroy` failure is logged, not propagated, so the rest
/// still get a chance to clean up.
pub async fn dispose_all(modules: &[Arc<dyn Module>]) {
    for module in modules.iter().rev() {
        println!("[MODULE] destroying: {}", module.name());
        if let Err(err) = module.on_destroy().await {
            eprintln!("[MODULE] {} failed to destroy: {}", module.name(), err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Simple {
        name: &'static str,
        imports: Vec<&'static str>,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Module for Simple {
        fn name(&self) -> &'static str {
            self.name
        }

        fn imports(&self) -> Vec<&'static str> {
            self.imports.clone()
        }

        async fn register(&self, _ctx: &mut ModuleContext<'_>) -> Result<()> {
            self.log.lock().unwrap().push(self.name);
            Ok(())
        }
    }

    #[tokio::test]
    async fn registers_imports_before_dependents() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let modules: Vec<Arc<dyn Module>> = vec![
            Arc::new(Simple { name: "b", imports: vec!["a"], log: log.clone() }),
            Arc::new(Simple { name: "a", imports: vec![], log: log.clone() }),
        ];

        let container = Container::new();
        let config = Config::default();
        let mut root = Router::new();

        register_all(&modules, &container, &mut root, &config).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn duplicate_name_fails_validation() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let modules: Vec<Arc<dyn Module>> = vec![
            Arc::new(Simple { name: "dup", imports: vec![], log: log.clone() }),
            Arc::new(Simple { name: "dup", imports: vec![], log: log.clone() }),
        ];
        assert!(matches!(validate(&modules), Err(Error::DuplicateModuleName(_))));
    }

    #[tokio::test]
    async fn missing_export_fails_registration() {
        struct Promiser;

        #[async_trait]
        impl Module for Promiser {
            fn name(&self) -> &'static str {
                "promiser"
            }
            fn exports(&self) -> Vec<&'static str> {
                vec![std::any::type_name::<u32>()]
            }
            async fn register(&self, _ctx: &mut ModuleContext<'_>) -> Result<()> {
                Ok(())
            }
        }

        let modules: Vec<Arc<dyn Module>> = vec![Arc::new(Promiser)];
        let container = Container::new();
        let config = Config::default();
        let mut root = Router::new();

        let err = register_all(&modules, &container, &mut root, &config).await.unwrap_err();
        assert!(matches!(err, Error::ModuleExportMissing { .. }));
    }

    #[test]
    fn cyclic_imports_fail_validation() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let modules: Vec<Arc<dyn Module>> = vec![
            Arc::new(Simple { name: "x", imports: vec!["y"], log: log.clone() }),
            Arc::new(Simple { name: "y", imports: vec!["x"], log: log.clone() }),
        ];
        assert!(matches!(validate(&modules), Err(Error::CircularModuleImport { .. })));
    }
}
