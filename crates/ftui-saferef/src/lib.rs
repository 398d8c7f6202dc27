#![forbid(unsafe_code)]

//! Weak references to objects and bound methods for FrankenTUI signals.
//!
//! A signal dispatcher holds its receivers through [`Reference`]s so that
//! connecting a receiver never keeps it alive. Plain objects are referenced
//! directly. Bound methods, which are transient pairings of an instance and
//! a function, are interned per pairing in a [`MethodRegistry`] and rebound
//! on demand.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use ftui_saferef::{
//!     make_reference, BoundMethod, Callback, MethodFn, Reference, Target, Tracked,
//! };
//!
//! struct Counter {
//!     hits: AtomicUsize,
//! }
//!
//! type Bump = MethodFn<Counter, usize, usize>;
//! type Handle = Reference<Counter, Bump>;
//!
//! let counter = Tracked::labeled("counter", Counter { hits: AtomicUsize::new(0) });
//! let bump: Tracked<Bump> = Tracked::method("bump", |c: &Counter, n: &usize| {
//!     c.hits.fetch_add(*n, Ordering::SeqCst) + n
//! });
//!
//! let released = Arc::new(AtomicUsize::new(0));
//! let seen = Arc::clone(&released);
//! let on_delete = Callback::new(move |_: &Handle| {
//!     seen.fetch_add(1, Ordering::SeqCst);
//! });
//!
//! let bound = BoundMethod::bind(counter.clone(), bump.clone());
//! let first = make_reference(&bound, Some(on_delete))?;
//! let second = make_reference(&bound, None)?;
//! assert!(first.ptr_eq(&second));
//! drop(bound);
//!
//! let method = first.resolve().and_then(Target::into_method).unwrap();
//! assert_eq!(method.call(&2), 2);
//! drop(method);
//!
//! drop(counter);
//! assert_eq!(released.load(Ordering::SeqCst), 1);
//! assert!(first.resolve().is_none());
//! # Ok::<(), ftui_saferef::SafeRefError>(())
//! ```

pub mod callback;
pub mod error;
pub mod method;
pub mod reference;
pub mod registry;
pub mod tracked;

pub use callback::Callback;
pub use error::{Result, SafeRefError};
pub use method::{BoundMethod, MethodKey, MethodRef};
pub use reference::{ObjectRef, Reference, Referent, Target, make_reference, make_reference_in};
pub use registry::{ENV_CAPACITY, ENV_NAME, MethodRegistry, RegistryConfig};
pub use tracked::{CallbackFn, HookId, MethodFn, ObjectId, Tracked, WeakTracked};
