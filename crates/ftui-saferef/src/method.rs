#![forbid(unsafe_code)]

//! Bound methods and their interned weak wrappers.
//!
//! # Design
//!
//! A [`BoundMethod`] pairs a tracked instance with a tracked function. It is
//! transient: callers build a fresh one each time they want to hand a
//! receiver to a signal. [`MethodRef`] is the weak counterpart: it keeps a
//! [`WeakTracked`] to each half and rebinds them on demand.
//!
//! Wrappers are interned by [`MethodKey`] in a [`MethodRegistry`], so every
//! reference to the same (instance, function) pairing shares one wrapper
//! and one list of cleanup callbacks.
//!
//! # Invariants
//!
//! 1. At most one live wrapper exists per key in a registry.
//! 2. A wrapper is registered iff both halves are alive. Releasing either
//!    half removes the entry before any callback runs.
//! 3. Every callback attached to a wrapper runs exactly once, after the
//!    wrapper is dead, in the order it was attached.
//!
//! # State Machine
//!
//! ```text
//! INTERNED ──(instance or function released)──▶ DEAD
//! ```
//!
//! `DEAD` is terminal. The transition and the registry removal happen under
//! the registry lock, so an `intern` for the same key either sees the live
//! wrapper or builds a new one; it is never handed a dying wrapper.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, debug_span, trace};

use crate::callback::Callback;
use crate::reference::Reference;
use crate::registry::MethodRegistry;
use crate::tracked::{HookId, MethodFn, ObjectId, Tracked, WeakTracked};

/// The transient pairing of an instance and one of its functions.
pub struct BoundMethod<T: ?Sized, F: ?Sized> {
    instance: Tracked<T>,
    function: Tracked<F>,
}

impl<T: ?Sized, F: ?Sized> Clone for BoundMethod<T, F> {
    fn clone(&self) -> Self {
        Self {
            instance: self.instance.clone(),
            function: self.function.clone(),
        }
    }
}

impl<T: ?Sized, F: ?Sized> BoundMethod<T, F> {
    /// Bind `function` to `instance`.
    #[must_use]
    pub fn bind(instance: Tracked<T>, function: Tracked<F>) -> Self {
        Self { instance, function }
    }

    /// The owning instance.
    #[must_use]
    pub fn instance(&self) -> &Tracked<T> {
        &self.instance
    }

    /// The underlying function.
    #[must_use]
    pub fn function(&self) -> &Tracked<F> {
        &self.function
    }

    /// Interning key of this pairing.
    #[must_use]
    pub fn key(&self) -> MethodKey {
        MethodKey::of(self.instance.id(), self.function.id())
    }

    /// `"{instance}.{function}"` from the halves' labels.
    #[must_use]
    pub fn describe(&self) -> String {
        format!("{}.{}", self.instance.label(), self.function.label())
    }

    /// Split into the two strong halves.
    #[must_use]
    pub fn into_parts(self) -> (Tracked<T>, Tracked<F>) {
        (self.instance, self.function)
    }
}

impl<T: ?Sized + 'static, E: 'static, R: 'static> BoundMethod<T, MethodFn<T, E, R>> {
    /// Invoke the function with the bound instance.
    pub fn call(&self, event: &E) -> R {
        (*self.function)(&*self.instance, event)
    }
}

impl<T: ?Sized, F: ?Sized> fmt::Debug for BoundMethod<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundMethod")
            .field("instance", &self.instance.label())
            .field("function", &self.function.label())
            .finish()
    }
}

/// Identity of an (instance, function) pairing.
///
/// Derived only from the halves' [`ObjectId`]s, which are never reused, so
/// a key cannot be claimed by an unrelated pairing after its objects are
/// released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MethodKey {
    instance: ObjectId,
    function: ObjectId,
}

impl MethodKey {
    /// Key for the given instance and function identities.
    #[must_use]
    pub const fn of(instance: ObjectId, function: ObjectId) -> Self {
        Self { instance, function }
    }

    /// Identity of the instance half.
    #[must_use]
    pub const fn instance(self) -> ObjectId {
        self.instance
    }

    /// Identity of the function half.
    #[must_use]
    pub const fn function(self) -> ObjectId {
        self.function
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.instance, self.function)
    }
}

enum MethodState<T: ?Sized + 'static, F: ?Sized + 'static> {
    Interned(Vec<Callback<Reference<T, F>>>),
    Dead,
}

pub(crate) struct MethodRefInner<T: ?Sized + 'static, F: ?Sized + 'static> {
    key: MethodKey,
    instance: WeakTracked<T>,
    function: WeakTracked<F>,
    /// Release hooks on the instance and function, in that order.
    hooks: [HookId; 2],
    state: Mutex<MethodState<T, F>>,
    registry: MethodRegistry,
}

impl<T: ?Sized + 'static, F: ?Sized + 'static> MethodRefInner<T, F> {
    fn lock_state(&self) -> MutexGuard<'_, MethodState<T, F>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a callback if still interned. Leaves `on_delete` untouched
    /// when the wrapper is already dead.
    pub(crate) fn adopt(&self, on_delete: &mut Option<Callback<Reference<T, F>>>) -> bool {
        match &mut *self.lock_state() {
            MethodState::Interned(callbacks) => {
                callbacks.extend(on_delete.take());
                true
            }
            MethodState::Dead => false,
        }
    }

    fn kill(&self) -> Option<Vec<Callback<Reference<T, F>>>> {
        match std::mem::replace(&mut *self.lock_state(), MethodState::Dead) {
            MethodState::Interned(callbacks) => Some(callbacks),
            MethodState::Dead => None,
        }
    }
}

impl<T, F> MethodRefInner<T, F>
where
    T: ?Sized + Send + Sync + 'static,
    F: ?Sized + Send + Sync + 'static,
{
    /// Build a wrapper with both release hooks installed. The caller
    /// inserts it into `registry` under `key`.
    pub(crate) fn new(
        target: &BoundMethod<T, F>,
        on_delete: Option<Callback<Reference<T, F>>>,
        registry: &MethodRegistry,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let hooks = [
                target.instance.on_release(Self::release_hook(Weak::clone(weak))),
                target.function.on_release(Self::release_hook(Weak::clone(weak))),
            ];
            Self {
                key: target.key(),
                instance: target.instance.downgrade(),
                function: target.function.downgrade(),
                hooks,
                state: Mutex::new(MethodState::Interned(on_delete.into_iter().collect())),
                registry: registry.clone(),
            }
        })
    }

    fn release_hook(weak: Weak<Self>) -> impl FnOnce() + Send + 'static {
        move || {
            if let Some(inner) = weak.upgrade() {
                inner.expire();
            }
        }
    }

    /// Collection handler shared by both halves.
    fn expire(self: Arc<Self>) {
        let _span = debug_span!(
            "method_ref_expire",
            key = %self.key,
            registry = self.registry.name()
        )
        .entered();

        let addr = Arc::as_ptr(&self).cast::<()>();
        let Some(callbacks) = self.registry.retire(self.key, addr, || self.kill()) else {
            trace!("bound method already released");
            return;
        };
        debug!(callbacks = callbacks.len(), "bound method released");

        let handle = Reference::Method(MethodRef { inner: self });
        for callback in &callbacks {
            if !callback.invoke(&handle) {
                trace!("cleanup callback target already released");
            }
        }
    }
}

impl<T: ?Sized + 'static, F: ?Sized + 'static> Drop for MethodRefInner<T, F> {
    fn drop(&mut self) {
        // Last holder gone while the pairing may still be alive.
        self.instance.cancel_hook(self.hooks[0]);
        self.function.cancel_hook(self.hooks[1]);
        self.registry
            .forget(self.key, std::ptr::from_ref::<Self>(self).cast::<()>());
    }
}

/// Weak, interned reference to a bound method.
///
/// Cloning a `MethodRef` shares the same wrapper. Equality and hashing
/// follow the [`MethodKey`].
pub struct MethodRef<T: ?Sized + 'static, F: ?Sized + 'static> {
    inner: Arc<MethodRefInner<T, F>>,
}

// Manual Clone: shares the same Arc.
impl<T: ?Sized + 'static, F: ?Sized + 'static> Clone for MethodRef<T, F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: ?Sized + 'static, F: ?Sized + 'static> MethodRef<T, F> {
    pub(crate) fn from_inner(inner: Arc<MethodRefInner<T, F>>) -> Self {
        Self { inner }
    }

    /// Interning key of the pairing.
    #[must_use]
    pub fn key(&self) -> MethodKey {
        self.inner.key
    }

    /// Rebind the live halves, or `None` if either is gone.
    ///
    /// May return `None` before the cleanup callbacks have run. Calling it
    /// repeatedly has no side effects.
    #[must_use]
    pub fn resolve(&self) -> Option<BoundMethod<T, F>> {
        let instance = self.inner.instance.upgrade()?;
        let function = self.inner.function.upgrade()?;
        Some(BoundMethod::bind(instance, function))
    }

    /// Whether both halves still have strong holders.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.inner.instance.is_alive() && self.inner.function.is_alive()
    }

    /// Whether the collection handler has run.
    #[must_use]
    pub fn is_dead(&self) -> bool {
        matches!(*self.inner.lock_state(), MethodState::Dead)
    }

    /// Number of cleanup callbacks waiting to fire. Zero once dead.
    #[must_use]
    pub fn callback_count(&self) -> usize {
        match &*self.inner.lock_state() {
            MethodState::Interned(callbacks) => callbacks.len(),
            MethodState::Dead => 0,
        }
    }

    /// `"{instance}.{function}"`, using labels captured at construction.
    #[must_use]
    pub fn describe(&self) -> String {
        format!(
            "{}.{}",
            self.inner.instance.label(),
            self.inner.function.label()
        )
    }

    /// Whether two handles share the same wrapper.
    #[must_use]
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.inner, &other.inner)
    }
}

impl<T: ?Sized + 'static, F: ?Sized + 'static> PartialEq for MethodRef<T, F> {
    fn eq(&self, other: &Self) -> bool {
        self.inner.key == other.inner.key
    }
}

impl<T: ?Sized + 'static, F: ?Sized + 'static> Eq for MethodRef<T, F> {}

impl<T: ?Sized + 'static, F: ?Sized + 'static> Hash for MethodRef<T, F> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.key.hash(state);
    }
}

impl<T: ?Sized + 'static, F: ?Sized + 'static> fmt::Display for MethodRef<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl<T: ?Sized + 'static, F: ?Sized + 'static> fmt::Debug for MethodRef<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MethodRef({})", self.describe())
    }
}
