use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{Error, Result};

type AnyArc = Arc<dyn Any + Send + Sync>;
type Disposer = Box<dyn Fn(&AnyArc) + Send + Sync>;
type FactoryFn = Arc<dyn Fn(&Container) -> Result<AnyArc> + Send + Sync>;

enum Entry {
    Eager {
        instance: AnyArc,
        disposer: Option<Disposer>,
    },
    Lazy {
        factory: FactoryFn,
        cache: Arc<Mutex<Option<AnyArc>>>,
        disposer: Option<Disposer>,
    },
    Factory {
        factory: FactoryFn,
    },
}

struct Registration {
    type_name: &'static str,
    entry: Entry,
    seq: usize,
}

fn dispose_registration(reg: &Registration) {
    let (instance, disposer) = match &reg.entry {
        Entry::Eager { instance, disposer } => (Some(instance.clone()), disposer.as_ref()),
        Entry::Lazy { cache, disposer, .. } => {
            let cached = cache.lock().unwrap().clone();
            (cached, disposer.as_ref())
        }
        Entry::Factory { .. } => (None, None),
    };
    if let (Some(instance), Some(disposer)) = (instance, disposer) {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| disposer(&instance)));
    }
}

fn wrap_disposer<T, D>(dispose: D) -> Disposer
where
    T: Any + Send + Sync,
    D: Fn(&T) + Send + Sync + 'static,
{
    Box::new(move |any: &AnyArc| {
        if let Some(value) = any.downcast_ref::<T>() {
            dispose(value);
        }
    })
}

static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    // Per-container resolution stacks, keyed by container id. Thread-local so
    // concurrent resolutions on the same container never share a stack.
    static STACKS: RefCell<HashMap<usize, Vec<(&'static str, TypeId)>>> = RefCell::new(HashMap::new());
}

struct Inner {
    id: usize,
    registrations: RwLock<HashMap<TypeId, Registration>>,
    parent: Option<Container>,
    next_seq: AtomicUsize,
}

/// Type-tag keyed registry of services, with optional parent for child
/// scopes. Cheap to clone: internally an `Arc`.
#[derive(Clone)]
pub struct Container {
    inner: Arc<Inner>,
}

impl Container {
    pub fn new() -> Self {
        Container {
            inner: Arc::new(Inner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                registrations: RwLock::new(HashMap::new()),
                parent: None,
                next_seq: AtomicUsize::new(0),
            }),
        }
    }

    /// A fresh, empty container whose unresolved lookups fall through to
    /// `self`. Local registrations in the child shadow the parent; the
    /// parent is never mutated by a child.
    pub fn create_child(&self) -> Container {
        Container {
            inner: Arc::new(Inner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                registrations: RwLock::new(HashMap::new()),
                parent: Some(self.clone()),
                next_seq: AtomicUsize::new(0),
            }),
        }
    }

    fn insert(&self, type_id: TypeId, type_name: &'static str, entry: Entry, allow_override: bool) -> Result<()> {
        let mut regs = self.inner.registrations.write().unwrap();
        if !allow_override && regs.contains_key(&type_id) {
            return Err(Error::AlreadyRegistered(type_name));
        }
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let previous = regs.insert(type_id, Registration { type_name, entry, seq });
        drop(regs);
        if let Some(previous) = previous {
            dispose_registration(&previous);
        }
        Ok(())
    }

    pub fn register_singleton<T: Any + Send + Sync>(&self, value: T) -> Result<()> {
        self.register_singleton_with::<T, fn(&T)>(value, None)
    }

    pub fn register_singleton_with<T, D>(&self, value: T, dispose: Option<D>) -> Result<()>
    where
        T: Any + Send + Sync,
        D: Fn(&T) + Send + Sync + 'static,
    {
        self.insert(
            TypeId::of::<T>(),
            std::any::type_name::<T>(),
            Entry::Eager {
                instance: Arc::new(value),
                disposer: dispose.map(wrap_disposer::<T, D>),
            },
            false,
        )
    }

    pub fn register_lazy_singleton<T, F>(&self, factory: F) -> Result<()>
    where
        T: Any + Send + Sync,
        F: Fn(&Container) -> Result<T> + Send + Sync + 'static,
    {
        self.register_lazy_singleton_with::<T, F, fn(&T)>(factory, None)
    }

    pub fn register_lazy_singleton_with<T, F, D>(&self, factory: F, dispose: Option<D>) -> Result<()>
    where
        T: Any + Send + Sync,
        F: Fn(&Container) -> Result<T> + Send + Sync + 'static,
        D: Fn(&T) + Send + Sync + 'static,
    {
        let wrapped: FactoryFn = Arc::new(move |c: &Container| -> Result<AnyArc> {
            Ok(Arc::new(factory(c)?) as AnyArc)
        });
        self.insert(
            TypeId::of::<T>(),
            std::any::type_name::<T>(),
            Entry::Lazy {
                factory: wrapped,
                cache: Arc::new(Mutex::new(None)),
                disposer: dispose.map(wrap_disposer::<T, D>),
            },
            false,
        )
    }

    pub fn register_factory<T, F>(&self, factory: F) -> Result<()>
    where
        T: Any + Send + Sync,
        F: Fn(&Container) -> Result<T> + Send + Sync + 'static,
    {
        let wrapped: FactoryFn = Arc::new(move |c: &Container| -> Result<AnyArc> {
            Ok(Arc::new(factory(c)?) as AnyArc)
        });
        self.insert(
            TypeId::of::<T>(),
            std::any::type_name::<T>(),
            Entry::Factory { factory: wrapped },
            false,
        )
    }

    /// The only sanctioned re-registration. Operates uniformly over whatever
    /// was previously registered for `T` — eager, lazy, or factory —
    /// replacing it with a new eager singleton and disposing any cached
    /// instance that existed.
    pub fn override_singleton<T: Any + Send + Sync>(&self, value: T) -> Result<()> {
        self.insert(
            TypeId::of::<T>(),
            std::any::type_name::<T>(),
            Entry::Eager {
                instance: Arc::new(value),
                disposer: None,
            },
            true,
        )
    }

    pub fn unregister<T: Any + Send + Sync>(&self) -> Result<()> {
        let type_id = TypeId::of::<T>();
        let removed = {
            let mut regs = self.inner.registrations.write().unwrap();
            regs.remove(&type_id)
        };
        match removed {
            Some(reg) => {
                dispose_registration(&reg);
                Ok(())
            }
            None => Err(Error::NotRegistered(std::any::type_name::<T>())),
        }
    }

    /// Removes and disposes every local registration. Does not touch the
    /// parent.
    pub fn clear(&self) {
        let mut drained: Vec<Registration> = {
            let mut regs = self.inner.registrations.write().unwrap();
            regs.drain().map(|(_, reg)| reg).collect()
        };
        drained.sort_by_key(|reg| std::cmp::Reverse(reg.seq));
        for reg in &drained {
            dispose_registration(reg);
        }
    }

    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        let type_id = TypeId::of::<T>();
        if self.inner.registrations.read().unwrap().contains_key(&type_id) {
            return true;
        }
        match &self.inner.parent {
            Some(parent) => parent.contains::<T>(),
            None => false,
        }
    }

    /// Same as [`Container::contains`] but keyed by `std::any::type_name`
    /// instead of a concrete `T`. Used by the module subsystem to check a
    /// declared `exports` tag against what actually got registered, without
    /// needing the type itself in scope.
    pub fn contains_named(&self, type_name: &str) -> bool {
        let found_locally = self
            .inner
            .registrations
            .read()
            .unwrap()
            .values()
            .any(|reg| reg.type_name == type_name);
        if found_locally {
            return true;
        }
        match &self.inner.parent {
            Some(parent) => parent.contains_named(type_name),
            None => false,
        }
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Result<Arc<T>> {
        let type_id = TypeId::of::<T>();
        let type_name = std::any::type_name::<T>();

        let has_local = self.inner.registrations.read().unwrap().contains_key(&type_id);
        if !has_local {
            return match &self.inner.parent {
                Some(parent) => parent.get::<T>(),
                None => Err(Error::NotRegistered(type_name)),
            };
        }

        self.push_stack(type_name, type_id)?;
        let result = self.resolve_local::<T>(type_id);
        self.pop_stack();
        result
    }

    fn resolve_local<T: Any + Send + Sync>(&self, type_id: TypeId) -> Result<Arc<T>> {
        enum Action {
            Ready(AnyArc),
            Produce(FactoryFn),
            ProduceAndCache(FactoryFn, Arc<Mutex<Option<AnyArc>>>),
        }

        let action = {
            let regs = self.inner.registrations.read().unwrap();
            let reg = regs.get(&type_id).expect("presence checked by caller");
            match &reg.entry {
                Entry::Eager { instance, .. } => Action::Ready(instance.clone()),
                Entry::Lazy { factory, cache, .. } => {
                    let cached = cache.lock().unwrap().clone();
                    match cached {
                        Some(instance) => Action::Ready(instance),
                        None => Action::ProduceAndCache(factory.clone(), cache.clone()),
                    }
                }
                Entry::Factory { factory } => Action::Produce(factory.clone()),
            }
        };

        let any = match action {
            Action::Ready(instance) => instance,
            Action::Produce(factory) => factory(self)?,
            Action::ProduceAndCache(factory, cache) => {
                let produced = factory(self)?;
                let mut guard = cache.lock().unwrap();
                if guard.is_none() {
                    *guard = Some(produced.clone());
                }
                guard.clone().unwrap()
            }
        };

        any.downcast::<T>()
            .map_err(|_| Error::NotRegistered(std::any::type_name::<T>()))
    }

    fn push_stack(&self, type_name: &'static str, type_id: TypeId) -> Result<()> {
        STACKS.with(|stacks| {
            let mut stacks = stacks.borrow_mut();
            let stack = stacks.entry(self.inner.id).or_default();
            if let Some(pos) = stack.iter().position(|(_, id)| *id == type_id) {
                let mut chain: Vec<&'static str> = stack[pos..].iter().map(|(n, _)| *n).collect();
                chain.push(type_name);
                return Err(Error::CircularDependency { chain });
            }
            stack.push((type_name, type_id));
            Ok(())
        })
    }

    fn pop_stack(&self) {
        STACKS.with(|stacks| {
            if let Some(stack) = stacks.borrow_mut().get_mut(&self.inner.id) {
                stack.pop();
            }
        });
    }

    /// Invokes each cached singleton's disposer at most once, in reverse
    /// registration order. The spec leaves disposal order unspecified but
    /// recommends this as a deterministic default; disposer panics are
    /// caught so one failure does not stop the rest from running.
    pub fn dispose(&self) {
        let regs = self.inner.registrations.read().unwrap();
        let mut ordered: Vec<&Registration> = regs.values().collect();
        ordered.sort_by_key(|reg| std::cmp::Reverse(reg.seq));
        for reg in ordered {
            dispose_registration(reg);
        }
    }
}

impl Default for Container {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.inner.id)
            .field("registered", &self.inner.registrations.read().unwrap().len())
            .field("has_parent", &self.inner.parent.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct Thing(u32);

    #[test]
    fn eager_roundtrip() {
        let c = Container::new();
        c.register_singleton(Thing(7)).unwrap();
        assert_eq!(c.get::<Thing>().unwrap().0, 7);
    }

    #[test]
    fn duplicate_registration_rejected() {
        let c = Container::new();
        c.register_singleton(Thing(1)).unwrap();
        let err = c.register_singleton(Thing(2)).unwrap_err();
        assert!(matches!(err, Error::AlreadyRegistered(_)));
    }

    #[test]
    fn override_replaces_any_prior_kind() {
        let c = Container::new();
        c.register_lazy_singleton::<Thing, _>(|_| Ok(Thing(1))).unwrap();
        c.override_singleton(Thing(99)).unwrap();
        assert_eq!(c.get::<Thing>().unwrap().0, 99);
    }

    #[test]
    fn lazy_runs_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static CALLS: AtomicUsize = AtomicUsize::new(0);

        let c = Container::new();
        c.register_lazy_singleton::<Thing, _>(|_| {
            CALLS.fetch_add(1, Ordering::SeqCst);
            Ok(Thing(5))
        })
        .unwrap();

        let _ = c.get::<Thing>().unwrap();
        let _ = c.get::<Thing>().unwrap();
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn factory_runs_every_time() {
        use std::sync::atomic::{AtomicU32, Ordering};
        static COUNTER: AtomicU32 = AtomicU32::new(0);

        let c = Container::new();
        c.register_factory::<Thing, _>(|_| Ok(Thing(COUNTER.fetch_add(1, Ordering::SeqCst))))
            .unwrap();

        let a = c.get::<Thing>().unwrap();
        let b = c.get::<Thing>().unwrap();
        assert_ne!(a.0, b.0);
    }

    #[test]
    fn child_reads_through_to_parent() {
        let parent = Container::new();
        parent.register_singleton(Thing(1)).unwrap();
        let child = parent.create_child();
        assert!(child.contains::<Thing>());
        assert_eq!(child.get::<Thing>().unwrap().0, 1);
    }

    #[test]
    fn child_registration_does_not_leak_to_parent() {
        #[derive(Clone)]
        struct Other;
        let parent = Container::new();
        let child = parent.create_child();
        child.register_singleton(Other).unwrap();
        assert!(!parent.contains::<Other>());
    }

    #[test]
    fn circular_dependency_detected() {
        let c = Container::new();
        c.register_lazy_singleton::<Thing, _>(|container| {
            // `?` propagates the inner `CircularDependency` out through this
            // factory, so the top-level `get` that started the resolution
            // fails instead of silently swallowing the cycle.
            container.get::<Thing>()?;
            Ok(Thing(0))
        })
        .unwrap();

        let err = c.get::<Thing>().unwrap_err();
        assert!(matches!(err, Error::CircularDependency { .. }));
    }

    #[test]
    fn contains_named_matches_by_type_name() {
        let c = Container::new();
        c.register_singleton(Thing(1)).unwrap();
        assert!(c.contains_named(std::any::type_name::<Thing>()));
        assert!(!c.contains_named("nonexistent::Type"));
    }

    #[test]
    fn not_registered_anywhere() {
        let c = Container::new();
        assert!(matches!(c.get::<Thing>().unwrap_err(), Error::NotRegistered(_)));
    }

    #[test]
    fn disposer_runs_on_clear() {
        use std::sync::atomic::{AtomicBool, Ordering};
        static DISPOSED: AtomicBool = AtomicBool::new(false);

        let c = Container::new();
        c.register_singleton_with(Thing(1), Some(|_: &Thing| DISPOSED.store(true, Ordering::SeqCst)))
            .unwrap();
        c.clear();
        assert!(DISPOSED.load(Ordering::SeqCst));
    }
}
