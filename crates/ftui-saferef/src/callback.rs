#![forbid(unsafe_code)]

//! Cleanup callbacks handed to reference constructors.
//!
//! A [`Callback`] is either held strongly (a plain closure, always
//! invocable) or weakly through a [`WeakTracked`], in which case
//! registering it does not keep the callback's owner alive. A weak
//! callback whose target is already gone is *not invocable*; reference
//! constructors reject it with [`SafeRefError::InvalidCallback`].
//!
//! [`SafeRefError::InvalidCallback`]: crate::SafeRefError::InvalidCallback

use std::fmt;
use std::sync::Arc;

use crate::tracked::{CallbackFn, Tracked, WeakTracked};

enum Held<H: 'static> {
    Strong(Arc<CallbackFn<H>>),
    Weak(WeakTracked<CallbackFn<H>>),
}

/// A cleanup callback receiving the dying handle.
pub struct Callback<H: 'static> {
    held: Held<H>,
}

impl<H: 'static> Clone for Callback<H> {
    fn clone(&self) -> Self {
        let held = match &self.held {
            Held::Strong(f) => Held::Strong(Arc::clone(f)),
            Held::Weak(weak) => Held::Weak(weak.clone()),
        };
        Self { held }
    }
}

impl<H: 'static> Callback<H> {
    /// Wrap a closure. The callback owns it.
    #[must_use]
    pub fn new(f: impl Fn(&H) + Send + Sync + 'static) -> Self {
        Self {
            held: Held::Strong(Arc::new(f)),
        }
    }

    /// Refer to a tracked callback without keeping it alive.
    #[must_use]
    pub fn weak(target: &Tracked<CallbackFn<H>>) -> Self {
        Self {
            held: Held::Weak(target.downgrade()),
        }
    }

    /// Whether invoking this callback would run anything.
    #[must_use]
    pub fn is_invocable(&self) -> bool {
        match &self.held {
            Held::Strong(_) => true,
            Held::Weak(weak) => weak.is_alive(),
        }
    }

    /// Run the callback. Returns `false` if a weak target was gone.
    pub fn invoke(&self, handle: &H) -> bool {
        match &self.held {
            Held::Strong(f) => {
                (**f)(handle);
                true
            }
            Held::Weak(weak) => match weak.upgrade() {
                Some(f) => {
                    (*f)(handle);
                    true
                }
                None => false,
            },
        }
    }
}

impl<H: 'static> fmt::Debug for Callback<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.held {
            Held::Strong(_) => f.debug_struct("Callback").field("held", &"strong").finish(),
            Held::Weak(weak) => f
                .debug_struct("Callback")
                .field("held", &"weak")
                .field("target", &weak.label())
                .field("alive", &weak.is_alive())
                .finish(),
        }
    }
}
