#![forbid(unsafe_code)]

//! Reference factory: uniform weak handles over objects and bound methods.
//!
//! [`make_reference`] inspects the target through the [`Referent`] facets.
//! Bound methods are interned through the [`MethodRegistry`]; anything else
//! gets a direct [`ObjectRef`]. Either way the result is a [`Reference`]
//! that never keeps its target alive and resolves to `None` once the
//! target is released.
//!
//! # Invariants
//!
//! 1. A handle never extends its target's lifetime.
//! 2. A release callback fires at most once, receiving the dying handle.
//! 3. Construction errors leave the registry and the target untouched.

use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use tracing::trace;

use crate::callback::Callback;
use crate::error::{Result, SafeRefError};
use crate::method::{BoundMethod, MethodKey, MethodRef};
use crate::registry::MethodRegistry;
use crate::tracked::{HookId, ObjectId, Tracked, WeakTracked};

/// The facets a reference target exposes.
///
/// A bound method exposes an instance and a function. A plain object
/// exposes itself. A target exposing an instance without a function is
/// malformed.
pub trait Referent<T: ?Sized, F: ?Sized> {
    /// The target as a plain object.
    fn object(&self) -> Option<Tracked<T>>;

    /// The owning instance, if the target is bound.
    fn bound_instance(&self) -> Option<Tracked<T>> {
        None
    }

    /// The function paired with the instance.
    fn bound_function(&self) -> Option<Tracked<F>> {
        None
    }

    /// Label used in error messages.
    fn describe(&self) -> String;
}

impl<T: ?Sized, F: ?Sized> Referent<T, F> for Tracked<T> {
    fn object(&self) -> Option<Tracked<T>> {
        Some(self.clone())
    }

    fn describe(&self) -> String {
        self.label().to_owned()
    }
}

impl<T: ?Sized, F: ?Sized> Referent<T, F> for BoundMethod<T, F> {
    fn object(&self) -> Option<Tracked<T>> {
        None
    }

    fn bound_instance(&self) -> Option<Tracked<T>> {
        Some(self.instance().clone())
    }

    fn bound_function(&self) -> Option<Tracked<F>> {
        Some(self.function().clone())
    }

    fn describe(&self) -> String {
        BoundMethod::describe(self)
    }
}

/// A resolved reference: the live object or the rebound method.
pub enum Target<T: ?Sized, F: ?Sized> {
    /// A plain tracked object.
    Object(Tracked<T>),
    /// A bound method rebuilt from its live halves.
    Method(BoundMethod<T, F>),
}

impl<T: ?Sized, F: ?Sized> Clone for Target<T, F> {
    fn clone(&self) -> Self {
        match self {
            Self::Object(object) => Self::Object(object.clone()),
            Self::Method(method) => Self::Method(method.clone()),
        }
    }
}

impl<T: ?Sized, F: ?Sized> Target<T, F> {
    /// The plain object, if this is one.
    #[must_use]
    pub fn as_object(&self) -> Option<&Tracked<T>> {
        match self {
            Self::Object(object) => Some(object),
            Self::Method(_) => None,
        }
    }

    /// The bound method, if this is one.
    #[must_use]
    pub fn as_method(&self) -> Option<&BoundMethod<T, F>> {
        match self {
            Self::Object(_) => None,
            Self::Method(method) => Some(method),
        }
    }

    /// Convert into the plain object.
    #[must_use]
    pub fn into_object(self) -> Option<Tracked<T>> {
        match self {
            Self::Object(object) => Some(object),
            Self::Method(_) => None,
        }
    }

    /// Convert into the bound method.
    #[must_use]
    pub fn into_method(self) -> Option<BoundMethod<T, F>> {
        match self {
            Self::Object(_) => None,
            Self::Method(method) => Some(method),
        }
    }
}

impl<T: ?Sized, F: ?Sized> Referent<T, F> for Target<T, F> {
    fn object(&self) -> Option<Tracked<T>> {
        self.as_object().cloned()
    }

    fn bound_instance(&self) -> Option<Tracked<T>> {
        self.as_method().map(|method| method.instance().clone())
    }

    fn bound_function(&self) -> Option<Tracked<F>> {
        self.as_method().map(|method| method.function().clone())
    }

    fn describe(&self) -> String {
        match self {
            Self::Object(object) => object.label().to_owned(),
            Self::Method(method) => method.describe(),
        }
    }
}

impl<T: ?Sized, F: ?Sized> fmt::Debug for Target<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Object(object) => f.debug_tuple("Object").field(object).finish(),
            Self::Method(method) => f.debug_tuple("Method").field(method).finish(),
        }
    }
}

struct ObjectRefInner<T: ?Sized + 'static, F: ?Sized + 'static> {
    target: WeakTracked<T>,
    hook: Option<HookId>,
    _function: PhantomData<fn() -> Box<F>>,
}

impl<T: ?Sized + 'static, F: ?Sized + 'static> Drop for ObjectRefInner<T, F> {
    fn drop(&mut self) {
        if let Some(hook) = self.hook {
            self.target.cancel_hook(hook);
        }
    }
}

/// Direct weak handle to a plain tracked object.
///
/// `F` is carried only so the release callback receives the same
/// [`Reference`] type as bound-method handles.
pub struct ObjectRef<T: ?Sized + 'static, F: ?Sized + 'static> {
    inner: Arc<ObjectRefInner<T, F>>,
}

// Manual Clone: shares the same Arc.
impl<T: ?Sized + 'static, F: ?Sized + 'static> Clone for ObjectRef<T, F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, F> ObjectRef<T, F>
where
    T: ?Sized + Send + Sync + 'static,
    F: ?Sized + Send + Sync + 'static,
{
    fn new(object: &Tracked<T>, on_delete: Option<Callback<Reference<T, F>>>) -> Result<Self> {
        if on_delete.as_ref().is_some_and(|cb| !cb.is_invocable()) {
            return Err(SafeRefError::InvalidCallback {
                target: object.label().to_owned(),
            });
        }

        let inner = Arc::new_cyclic(|weak: &Weak<ObjectRefInner<T, F>>| {
            let hook = on_delete.map(|callback| {
                let weak = Weak::clone(weak);
                object.on_release(move || {
                    if let Some(inner) = weak.upgrade() {
                        callback.invoke(&Reference::Object(ObjectRef { inner }));
                    }
                })
            });
            ObjectRefInner {
                target: object.downgrade(),
                hook,
                _function: PhantomData,
            }
        });
        trace!(
            object = %object.id(),
            notify = inner.hook.is_some(),
            "object reference created"
        );
        Ok(Self { inner })
    }
}

impl<T: ?Sized + 'static, F: ?Sized + 'static> ObjectRef<T, F> {
    /// The live object, or `None` once released.
    #[must_use]
    pub fn resolve(&self) -> Option<Tracked<T>> {
        self.inner.target.upgrade()
    }

    /// Identity of the referenced object.
    #[must_use]
    pub fn id(&self) -> ObjectId {
        self.inner.target.id()
    }

    /// Whether the referenced object is still alive.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.inner.target.is_alive()
    }

    /// Label of the referenced object, valid after release.
    #[must_use]
    pub fn describe(&self) -> String {
        self.inner.target.label().to_owned()
    }

    /// Whether two handles are the same handle.
    #[must_use]
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.inner, &other.inner)
    }
}

impl<T: ?Sized + 'static, F: ?Sized + 'static> fmt::Debug for ObjectRef<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({})", self.inner.target.label())
    }
}

/// Uniform weak handle returned by [`make_reference`].
pub enum Reference<T: ?Sized + 'static, F: ?Sized + 'static> {
    /// Direct handle to a plain object.
    Object(ObjectRef<T, F>),
    /// Interned handle to a bound method.
    Method(MethodRef<T, F>),
}

impl<T: ?Sized + 'static, F: ?Sized + 'static> Clone for Reference<T, F> {
    fn clone(&self) -> Self {
        match self {
            Self::Object(r) => Self::Object(r.clone()),
            Self::Method(r) => Self::Method(r.clone()),
        }
    }
}

impl<T: ?Sized + 'static, F: ?Sized + 'static> Reference<T, F> {
    /// The live target, or `None` once released. Repeatable.
    #[must_use]
    pub fn resolve(&self) -> Option<Target<T, F>> {
        match self {
            Self::Object(r) => r.resolve().map(Target::Object),
            Self::Method(r) => r.resolve().map(Target::Method),
        }
    }

    /// Whether the target can currently be resolved.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        match self {
            Self::Object(r) => r.is_alive(),
            Self::Method(r) => r.is_alive(),
        }
    }

    /// Whether two references are the same handle.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Object(a), Self::Object(b)) => ObjectRef::ptr_eq(a, b),
            (Self::Method(a), Self::Method(b)) => MethodRef::ptr_eq(a, b),
            _ => false,
        }
    }

    /// The direct object handle, if any.
    #[must_use]
    pub fn as_object(&self) -> Option<&ObjectRef<T, F>> {
        match self {
            Self::Object(r) => Some(r),
            Self::Method(_) => None,
        }
    }

    /// The interned method wrapper, if any.
    #[must_use]
    pub fn as_method(&self) -> Option<&MethodRef<T, F>> {
        match self {
            Self::Object(_) => None,
            Self::Method(r) => Some(r),
        }
    }

    /// Interning key, for bound-method references.
    #[must_use]
    pub fn key(&self) -> Option<MethodKey> {
        self.as_method().map(MethodRef::key)
    }

    /// Diagnostic text, valid before and after release.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Object(r) => r.describe(),
            Self::Method(r) => r.describe(),
        }
    }
}

impl<T: ?Sized + 'static, F: ?Sized + 'static> fmt::Display for Reference<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl<T: ?Sized + 'static, F: ?Sized + 'static> fmt::Debug for Reference<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Object(r) => fmt::Debug::fmt(r, f),
            Self::Method(r) => fmt::Debug::fmt(r, f),
        }
    }
}

/// Build a weak reference to `target` using the global registry.
///
/// See [`make_reference_in`].
///
/// # Errors
///
/// [`SafeRefError::MalformedTarget`] or [`SafeRefError::InvalidCallback`].
pub fn make_reference<T, F, R>(
    target: &R,
    on_delete: Option<Callback<Reference<T, F>>>,
) -> Result<Reference<T, F>>
where
    T: ?Sized + Send + Sync + 'static,
    F: ?Sized + Send + Sync + 'static,
    R: Referent<T, F> + ?Sized,
{
    make_reference_in(MethodRegistry::global(), target, on_delete)
}

/// Build a weak reference to `target`, interning bound methods in
/// `registry`.
///
/// Bound methods resolve to the wrapper already interned for their
/// pairing when there is one, with `on_delete` appended to its callbacks.
/// Plain objects get a fresh [`ObjectRef`] whose `on_delete` fires once
/// when the object is released.
///
/// # Errors
///
/// - [`SafeRefError::MalformedTarget`] if the target exposes an instance
///   without a function, or no facet at all.
/// - [`SafeRefError::InvalidCallback`] if `on_delete` cannot be invoked.
pub fn make_reference_in<T, F, R>(
    registry: &MethodRegistry,
    target: &R,
    on_delete: Option<Callback<Reference<T, F>>>,
) -> Result<Reference<T, F>>
where
    T: ?Sized + Send + Sync + 'static,
    F: ?Sized + Send + Sync + 'static,
    R: Referent<T, F> + ?Sized,
{
    if let Some(instance) = target.bound_instance() {
        let Some(function) = target.bound_function() else {
            return Err(SafeRefError::MalformedTarget {
                target: target.describe(),
            });
        };
        let method = BoundMethod::bind(instance, function);
        return registry.intern(&method, on_delete).map(Reference::Method);
    }

    let Some(object) = target.object() else {
        return Err(SafeRefError::MalformedTarget {
            target: target.describe(),
        });
    };
    ObjectRef::new(&object, on_delete).map(Reference::Object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryConfig;
    use crate::tracked::{CallbackFn, MethodFn};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Doc {
        title: &'static str,
    }

    type TitleFn = MethodFn<Doc, (), &'static str>;
    type Handle = Reference<Doc, TitleFn>;

    fn registry() -> MethodRegistry {
        MethodRegistry::new(RegistryConfig::default())
    }

    #[test]
    fn plain_object_resolves_until_release() {
        let doc = Tracked::labeled("doc", Doc { title: "readme" });
        let handle: Handle = make_reference_in(&registry(), &doc, None).unwrap();

        let resolved = handle.resolve().and_then(Target::into_object).unwrap();
        assert!(Tracked::ptr_eq(&resolved, &doc));
        assert_eq!(resolved.title, "readme");
        drop(resolved);

        drop(doc);
        assert!(handle.resolve().is_none());
        assert!(!handle.is_alive());
        assert_eq!(handle.describe(), "doc");
    }

    #[test]
    fn plain_object_callback_receives_handle_once() {
        let doc = Tracked::labeled("doc", Doc { title: "readme" });
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let cb = Callback::new(move |h: &Handle| {
            seen_clone
                .lock()
                .unwrap()
                .push((h.describe(), h.resolve().is_none()));
        });

        let handle = make_reference_in(&registry(), &doc, Some(cb)).unwrap();
        let clone = doc.clone();
        drop(doc);
        assert!(seen.lock().unwrap().is_empty());
        drop(clone);

        assert_eq!(*seen.lock().unwrap(), vec![("doc".to_owned(), true)]);
        assert!(handle.as_object().is_some());
    }

    #[test]
    fn plain_object_references_are_distinct() {
        let doc = Tracked::new(Doc { title: "a" });
        let reg = registry();
        let a: Handle = make_reference_in(&reg, &doc, None).unwrap();
        let b: Handle = make_reference_in(&reg, &doc, None).unwrap();
        assert!(!a.ptr_eq(&b));
        assert!(a.ptr_eq(&a.clone()));
        assert!(a.key().is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn dropped_handle_cancels_callback() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let doc = Tracked::new(Doc { title: "a" });
        let handle: Handle = make_reference_in(
            &registry(),
            &doc,
            Some(Callback::new(move |_| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
        assert_eq!(doc.pending_hooks(), 1);

        drop(handle);
        assert_eq!(doc.pending_hooks(), 0);
        drop(doc);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn bound_method_dispatches_to_registry() {
        let reg = registry();
        let doc = Tracked::labeled("doc", Doc { title: "guide" });
        let title: Tracked<TitleFn> = Tracked::method("title", |d: &Doc, (): &()| d.title);

        let handle = make_reference_in(&reg, &BoundMethod::bind(doc.clone(), title.clone()), None)
            .unwrap();
        assert!(handle.as_method().is_some());
        assert_eq!(handle.key(), Some(MethodKey::of(doc.id(), title.id())));
        assert!(reg.contains(MethodKey::of(doc.id(), title.id())));

        let method = handle.resolve().and_then(Target::into_method).unwrap();
        assert_eq!(method.call(&()), "guide");
        assert_eq!(format!("{handle}"), "doc.title");
    }

    #[test]
    fn resolved_target_is_referent() {
        let reg = registry();
        let doc = Tracked::labeled("doc", Doc { title: "x" });
        let title: Tracked<TitleFn> = Tracked::method("title", |d: &Doc, (): &()| d.title);
        let first = make_reference_in(&reg, &BoundMethod::bind(doc.clone(), title.clone()), None)
            .unwrap();

        let target = first.resolve().unwrap();
        let again = make_reference_in(&reg, &target, None).unwrap();
        assert!(first.ptr_eq(&again));
    }

    struct Impostor {
        instance: Tracked<Doc>,
    }

    impl Referent<Doc, TitleFn> for Impostor {
        fn object(&self) -> Option<Tracked<Doc>> {
            None
        }

        fn bound_instance(&self) -> Option<Tracked<Doc>> {
            Some(self.instance.clone())
        }

        fn describe(&self) -> String {
            format!("impostor({})", self.instance.label())
        }
    }

    #[test]
    fn instance_without_function_is_malformed() {
        let reg = registry();
        let impostor = Impostor {
            instance: Tracked::labeled("doc", Doc { title: "x" }),
        };
        let err = make_reference_in(&reg, &impostor, None).unwrap_err();
        assert_eq!(
            err,
            SafeRefError::MalformedTarget {
                target: "impostor(doc)".into()
            }
        );
        assert!(reg.is_empty());
        assert_eq!(impostor.instance.pending_hooks(), 0);
    }

    struct Faceless;

    impl Referent<Doc, TitleFn> for Faceless {
        fn object(&self) -> Option<Tracked<Doc>> {
            None
        }

        fn describe(&self) -> String {
            "faceless".into()
        }
    }

    #[test]
    fn target_without_facets_is_malformed() {
        let err = make_reference_in(&registry(), &Faceless, None).unwrap_err();
        assert!(matches!(err, SafeRefError::MalformedTarget { .. }));
    }

    #[test]
    fn dangling_callback_is_invalid_for_objects() {
        let doc = Tracked::labeled("doc", Doc { title: "x" });
        let cb_target: Tracked<CallbackFn<Handle>> = Tracked::callback("cb", |_| {});
        let cb = Callback::weak(&cb_target);
        drop(cb_target);

        let err = make_reference_in(&registry(), &doc, Some(cb)).unwrap_err();
        assert_eq!(
            err,
            SafeRefError::InvalidCallback {
                target: "doc".into()
            }
        );
        assert_eq!(doc.pending_hooks(), 0);
    }
}
