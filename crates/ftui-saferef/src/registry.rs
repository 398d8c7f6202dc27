#![forbid(unsafe_code)]

//! Interning registry for bound-method references.
//!
//! # Design
//!
//! [`MethodRegistry`] maps a [`MethodKey`] to a weak pointer to the wrapper
//! interned for it. The registry never keeps a wrapper alive: the wrapper's
//! holders do. Entries are removed when the pairing is released or when the
//! last holder drops the wrapper, whichever happens first.
//!
//! Wrappers of every instance/function type share one map; entries are
//! stored type-erased and recovered by downcast. A key names a unique pair
//! of objects, so it always recovers the type it was inserted with.
//!
//! # Locking
//!
//! One mutex guards the map. Lock order is registry, then wrapper state.
//! No user callback and no wrapper destructor runs while the registry lock
//! is held.
//!
//! # Failure Modes
//!
//! | Failure | Cause | Behavior |
//! |---------|-------|----------|
//! | Dangling `on_delete` | Weak callback already released | `InvalidCallback`, registry untouched |
//! | Poisoned lock | A panic while the map was locked | Lock recovered, map used as-is |
//! | Bad env override | Unparseable `FTUI_SAFEREF_CAPACITY` | Default kept, warning logged |

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::callback::Callback;
use crate::error::{Result, SafeRefError};
use crate::method::{BoundMethod, MethodKey, MethodRef, MethodRefInner};
use crate::reference::Reference;

/// Env var overriding the global registry's initial capacity.
pub const ENV_CAPACITY: &str = "FTUI_SAFEREF_CAPACITY";

/// Env var overriding the global registry's name in logs.
pub const ENV_NAME: &str = "FTUI_SAFEREF_NAME";

/// Configuration for a [`MethodRegistry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Number of entries to reserve up front.
    pub initial_capacity: usize,
    /// Name reported in tracing spans and events.
    pub name: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 64,
            name: "saferef".to_owned(),
        }
    }
}

impl RegistryConfig {
    /// Create the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initial capacity.
    #[must_use]
    pub fn with_initial_capacity(mut self, initial_capacity: usize) -> Self {
        self.initial_capacity = initial_capacity;
        self
    }

    /// Set the registry name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Defaults overridden by the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Defaults overridden through `get_env`.
    #[must_use]
    pub fn from_env_with<G>(get_env: G) -> Self
    where
        G: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(raw) = get_env(ENV_CAPACITY) {
            match raw.trim().parse::<usize>() {
                Ok(capacity) => config.initial_capacity = capacity,
                Err(_) => warn!(value = %raw, "ignoring invalid {}", ENV_CAPACITY),
            }
        }
        if let Some(name) = get_env(ENV_NAME) {
            let name = name.trim();
            if !name.is_empty() {
                config.name = name.to_owned();
            }
        }
        config
    }
}

type Entry = Weak<dyn Any + Send + Sync>;

struct Shared {
    name: String,
    entries: Mutex<FxHashMap<MethodKey, Entry>>,
}

/// Weakly-held map from pairing identity to its interned wrapper.
///
/// Cloning a `MethodRegistry` shares the same map.
#[derive(Clone)]
pub struct MethodRegistry {
    shared: Arc<Shared>,
}

impl MethodRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(config: RegistryConfig) -> Self {
        let mut entries = FxHashMap::default();
        entries.reserve(config.initial_capacity);
        Self {
            shared: Arc::new(Shared {
                name: config.name,
                entries: Mutex::new(entries),
            }),
        }
    }

    /// The process-wide registry, configured from the environment on first
    /// use.
    #[must_use]
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<MethodRegistry> = OnceLock::new();
        GLOBAL.get_or_init(|| Self::new(RegistryConfig::from_env()))
    }

    /// Name used in logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    fn lock_entries(&self) -> MutexGuard<'_, FxHashMap<MethodKey, Entry>> {
        self.shared
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of live interned wrappers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_entries()
            .values()
            .filter(|entry| entry.strong_count() > 0)
            .count()
    }

    /// Whether no live wrapper is interned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a live wrapper is interned under `key`.
    #[must_use]
    pub fn contains(&self, key: MethodKey) -> bool {
        self.lock_entries()
            .get(&key)
            .is_some_and(|entry| entry.strong_count() > 0)
    }

    /// The wrapper interned under `key`, if live and of the given types.
    #[must_use]
    pub fn get<T, F>(&self, key: MethodKey) -> Option<MethodRef<T, F>>
    where
        T: ?Sized + Send + Sync + 'static,
        F: ?Sized + Send + Sync + 'static,
    {
        let entry = self.lock_entries().get(&key).and_then(Weak::upgrade)?;
        entry
            .downcast::<MethodRefInner<T, F>>()
            .ok()
            .map(MethodRef::from_inner)
    }

    /// Return the wrapper for `target`'s pairing, creating it if needed.
    ///
    /// An existing live wrapper is returned as-is with `on_delete` appended
    /// to its cleanup callbacks. Otherwise a new wrapper is built, seeded
    /// with `on_delete`, and registered.
    ///
    /// # Errors
    ///
    /// [`SafeRefError::InvalidCallback`] if `on_delete` is not invocable.
    /// The registry is not touched in that case.
    pub fn intern<T, F>(
        &self,
        target: &BoundMethod<T, F>,
        mut on_delete: Option<Callback<Reference<T, F>>>,
    ) -> Result<MethodRef<T, F>>
    where
        T: ?Sized + Send + Sync + 'static,
        F: ?Sized + Send + Sync + 'static,
    {
        if on_delete.as_ref().is_some_and(|cb| !cb.is_invocable()) {
            return Err(SafeRefError::InvalidCallback {
                target: target.describe(),
            });
        }

        let key = target.key();
        // Strong pointers upgraded under the lock but not handed out; they
        // are released after unlocking.
        let mut stale: Option<Arc<dyn Any + Send + Sync>> = None;
        let mut entries = self.lock_entries();

        if let Some(existing) = entries.get(&key).and_then(Weak::upgrade) {
            match existing.downcast::<MethodRefInner<T, F>>() {
                Ok(inner) => {
                    if inner.adopt(&mut on_delete) {
                        drop(entries);
                        trace!(%key, registry = self.name(), "reusing interned bound method");
                        return Ok(MethodRef::from_inner(inner));
                    }
                    stale = Some(inner as Arc<dyn Any + Send + Sync>);
                }
                Err(other) => stale = Some(other),
            }
        }

        let inner = MethodRefInner::new(target, on_delete, self);
        let weak = Arc::downgrade(&inner);
        let entry: Entry = weak;
        entries.insert(key, entry);
        drop(entries);
        drop(stale);

        debug!(%key, registry = self.name(), target = %target.describe(), "interned bound method");
        Ok(MethodRef::from_inner(inner))
    }

    /// Remove `key` if it still points at `addr`, then run `kill` before
    /// releasing the lock.
    pub(crate) fn retire<R>(&self, key: MethodKey, addr: *const (), kill: impl FnOnce() -> R) -> R {
        let mut entries = self.lock_entries();
        if entries
            .get(&key)
            .is_some_and(|entry| std::ptr::addr_eq(entry.as_ptr(), addr))
        {
            entries.remove(&key);
        }
        kill()
    }

    /// Remove `key` if it still points at `addr`.
    pub(crate) fn forget(&self, key: MethodKey, addr: *const ()) {
        let mut entries = self.lock_entries();
        if entries
            .get(&key)
            .is_some_and(|entry| std::ptr::addr_eq(entry.as_ptr(), addr))
        {
            entries.remove(&key);
            trace!(%key, registry = %self.shared.name, "dropped wrapper deregistered");
        }
    }
}

impl fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("name", &self.shared.name)
            .field("entries", &self.lock_entries().len())
            .finish()
    }
}
