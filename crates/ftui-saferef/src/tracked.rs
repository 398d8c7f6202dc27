#![forbid(unsafe_code)]

//! Reference-counted objects with identity and release hooks.
//!
//! # Design
//!
//! [`Tracked<T>`] wraps a value in shared, atomically reference-counted
//! storage (`Arc<Slot<T>>`). Each slot carries a process-unique
//! [`ObjectId`] and a diagnostic label. When the last `Tracked` clone is
//! dropped, every pending release hook runs exactly once, in registration
//! order. By the time a hook runs the object can no longer be upgraded to,
//! so a [`WeakTracked`] resolved from inside a hook observes absence.
//!
//! # Invariants
//!
//! 1. `ObjectId`s are never reused within a process, even after the slot's
//!    memory is reclaimed.
//! 2. A hook runs at most once. A cancelled hook never runs.
//! 3. Hooks run without any slot lock held.
//!
//! # Failure Modes
//!
//! | Failure | Cause | Behavior |
//! |---------|-------|----------|
//! | Hook panics | User code | Remaining hooks of that slot are skipped |
//! | Cancel after release | Slot already gone | `cancel_hook` returns `false` |

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Signature of a tracked method: receives the instance and an event.
pub type MethodFn<T, E, R = ()> = dyn Fn(&T, &E) -> R + Send + Sync;

/// Signature of a tracked cleanup callback.
pub type CallbackFn<H> = dyn Fn(&H) + Send + Sync;

type ReleaseHook = Box<dyn FnOnce() + Send>;

/// Process-unique identity of a tracked object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(u64);

impl ObjectId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle to a pending release hook, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

#[derive(Default)]
struct Hooks {
    next: u64,
    pending: Vec<(HookId, ReleaseHook)>,
}

/// Shared storage behind [`Tracked<T>`]. The value is the last field so
/// that `Arc<Slot<C>>` coerces to `Arc<Slot<dyn Fn..>>`.
struct Slot<T: ?Sized> {
    id: ObjectId,
    label: String,
    hooks: Mutex<Hooks>,
    value: T,
}

impl<T> Slot<T> {
    fn new(id: ObjectId, label: String, value: T) -> Self {
        Self {
            id,
            label,
            hooks: Mutex::new(Hooks::default()),
            value,
        }
    }
}

impl<T: ?Sized> Slot<T> {
    fn lock_hooks(&self) -> MutexGuard<'_, Hooks> {
        self.hooks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: ?Sized> Drop for Slot<T> {
    fn drop(&mut self) {
        let hooks = self.hooks.get_mut().unwrap_or_else(PoisonError::into_inner);
        let pending = std::mem::take(&mut hooks.pending);
        if pending.is_empty() {
            return;
        }
        tracing::trace!(
            object = %self.id,
            label = %self.label,
            hooks = pending.len(),
            "tracked object released"
        );
        for (_, hook) in pending {
            hook();
        }
    }
}

/// A shared, identity-carrying value that announces its release.
///
/// Cloning a `Tracked` creates a new strong handle to the **same** object.
/// Dropping the last strong handle is the object's release: every hook
/// registered through [`Tracked::on_release`] runs once.
pub struct Tracked<T: ?Sized> {
    slot: Arc<Slot<T>>,
}

// Manual Clone: shares the same Arc.
impl<T: ?Sized> Clone for Tracked<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> Tracked<T> {
    /// Track a value, labelled with its type name and id.
    #[must_use]
    pub fn new(value: T) -> Self {
        let id = ObjectId::next();
        let label = format!("{}{id}", std::any::type_name::<T>());
        Self {
            slot: Arc::new(Slot::new(id, label, value)),
        }
    }

    /// Track a value under an explicit diagnostic label.
    #[must_use]
    pub fn labeled(label: impl Into<String>, value: T) -> Self {
        Self {
            slot: Arc::new(Slot::new(ObjectId::next(), label.into(), value)),
        }
    }
}

impl<T: 'static, E: 'static, R: 'static> Tracked<MethodFn<T, E, R>> {
    /// Track a function usable as the function half of a bound method.
    #[must_use]
    pub fn method(
        label: impl Into<String>,
        f: impl Fn(&T, &E) -> R + Send + Sync + 'static,
    ) -> Self {
        let slot: Arc<Slot<MethodFn<T, E, R>>> =
            Arc::new(Slot::new(ObjectId::next(), label.into(), f));
        Self { slot }
    }
}

impl<H: 'static> Tracked<CallbackFn<H>> {
    /// Track a cleanup callback so it can be registered weakly.
    #[must_use]
    pub fn callback(label: impl Into<String>, f: impl Fn(&H) + Send + Sync + 'static) -> Self {
        let slot: Arc<Slot<CallbackFn<H>>> =
            Arc::new(Slot::new(ObjectId::next(), label.into(), f));
        Self { slot }
    }
}

impl<T: ?Sized> Tracked<T> {
    /// Identity of this object.
    #[must_use]
    pub fn id(&self) -> ObjectId {
        self.slot.id
    }

    /// Diagnostic label captured at construction.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.slot.label
    }

    /// Create a non-owning handle to this object.
    #[must_use]
    pub fn downgrade(&self) -> WeakTracked<T> {
        WeakTracked {
            id: self.slot.id,
            label: self.slot.label.clone(),
            slot: Arc::downgrade(&self.slot),
        }
    }

    /// Register a hook that runs once when the last strong handle drops.
    pub fn on_release(&self, hook: impl FnOnce() + Send + 'static) -> HookId {
        let mut hooks = self.slot.lock_hooks();
        let id = HookId(hooks.next);
        hooks.next += 1;
        hooks.pending.push((id, Box::new(hook)));
        id
    }

    /// Number of release hooks still pending.
    #[must_use]
    pub fn pending_hooks(&self) -> usize {
        self.slot.lock_hooks().pending.len()
    }

    /// Number of strong handles (including this one).
    #[must_use]
    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.slot)
    }

    /// Whether two handles refer to the same object.
    #[must_use]
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.slot, &other.slot)
    }
}

impl<T: ?Sized> Deref for Tracked<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.slot.value
    }
}

impl<T: ?Sized> fmt::Debug for Tracked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracked")
            .field("id", &self.slot.id)
            .field("label", &self.slot.label)
            .field("strong", &Arc::strong_count(&self.slot))
            .finish()
    }
}

/// Non-owning handle to a [`Tracked<T>`].
///
/// The id and label stay readable after the object is gone.
pub struct WeakTracked<T: ?Sized> {
    id: ObjectId,
    label: String,
    slot: Weak<Slot<T>>,
}

impl<T: ?Sized> Clone for WeakTracked<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            label: self.label.clone(),
            slot: Weak::clone(&self.slot),
        }
    }
}

impl<T: ?Sized> WeakTracked<T> {
    /// Resolve to a strong handle, or `None` once the object is released.
    #[must_use]
    pub fn upgrade(&self) -> Option<Tracked<T>> {
        self.slot.upgrade().map(|slot| Tracked { slot })
    }

    /// Identity of the referenced object.
    #[must_use]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Label of the referenced object.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether the referenced object still has strong handles.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.slot.strong_count() > 0
    }

    /// Cancel a pending release hook.
    ///
    /// Returns `false` if the object is gone or the hook already ran.
    pub fn cancel_hook(&self, hook: HookId) -> bool {
        let Some(slot) = self.slot.upgrade() else {
            return false;
        };
        // The removed hook may own arbitrary user state; drop it unlocked.
        let removed = {
            let mut hooks = slot.lock_hooks();
            hooks
                .pending
                .iter()
                .position(|(id, _)| *id == hook)
                .map(|index| hooks.pending.remove(index))
        };
        removed.is_some()
    }
}

impl<T: ?Sized> fmt::Debug for WeakTracked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakTracked")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn ids_are_unique() {
        let a = Tracked::new(1);
        let b = Tracked::new(1);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id(), a.clone().id());
    }

    #[test]
    fn default_label_names_type_and_id() {
        let a = Tracked::new(7u8);
        assert!(a.label().starts_with("u8#"));
        assert!(a.label().ends_with(&a.id().raw().to_string()));
    }

    #[test]
    fn weak_upgrade_until_release() {
        let strong = Tracked::labeled("value", 42);
        let weak = strong.downgrade();
        assert_eq!(weak.upgrade().map(|t| *t), Some(42));
        assert!(weak.is_alive());

        drop(strong);
        assert!(weak.upgrade().is_none());
        assert!(!weak.is_alive());
        assert_eq!(weak.label(), "value");
    }

    #[test]
    fn hooks_fire_once_on_last_drop_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let strong = Tracked::new(());
        for tag in ['A', 'B', 'C'] {
            let log = Arc::clone(&log);
            strong.on_release(move || log.lock().unwrap().push(tag));
        }

        let clone = strong.clone();
        drop(strong);
        assert!(log.lock().unwrap().is_empty());

        drop(clone);
        assert_eq!(*log.lock().unwrap(), vec!['A', 'B', 'C']);
    }

    #[test]
    fn hook_observes_absence() {
        let strong = Tracked::new(5);
        let weak = strong.downgrade();
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = Arc::clone(&seen);
        strong.on_release(move || {
            *seen_clone.lock().unwrap() = Some(weak.upgrade().is_none());
        });
        drop(strong);
        assert_eq!(*seen.lock().unwrap(), Some(true));
    }

    #[test]
    fn cancelled_hook_never_runs() {
        let fired = Arc::new(AtomicUsize::new(0));
        let strong = Tracked::new(());
        let weak = strong.downgrade();

        let fired_clone = Arc::clone(&fired);
        let hook = strong.on_release(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(strong.pending_hooks(), 1);
        assert!(weak.cancel_hook(hook));
        assert!(!weak.cancel_hook(hook));
        assert_eq!(strong.pending_hooks(), 0);

        drop(strong);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!weak.cancel_hook(hook));
    }

    #[test]
    fn tracked_method_is_callable() {
        let f: Tracked<MethodFn<i32, i32, i32>> = Tracked::method("add", |a, b| a + b);
        assert_eq!((*f)(&2, &3), 5);
        assert_eq!(f.label(), "add");
    }

    #[test]
    fn strong_count_and_ptr_eq() {
        let a = Tracked::new("x");
        let b = a.clone();
        let c = Tracked::new("x");
        assert_eq!(a.strong_count(), 2);
        assert!(Tracked::ptr_eq(&a, &b));
        assert!(!Tracked::ptr_eq(&a, &c));
    }

    #[test]
    fn debug_format() {
        let a = Tracked::labeled("thing", 1);
        let dbg = format!("{a:?}");
        assert!(dbg.contains("Tracked"));
        assert!(dbg.contains("thing"));
        let weak = format!("{:?}", a.downgrade());
        assert!(weak.contains("alive: true"));
    }
}
