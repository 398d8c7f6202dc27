#![forbid(unsafe_code)]

//! Errors raised while constructing references.
//!
//! Both kinds are synchronous caller defects detected before any registry
//! mutation. Resolving a released reference is not an error; it yields
//! `None`.

/// Errors from reference construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafeRefError {
    /// The target exposes an owning instance but no paired function, or
    /// exposes neither an object nor an instance.
    MalformedTarget {
        /// Diagnostic label of the offending target.
        target: String,
    },
    /// An `on_delete` callback was supplied but cannot be invoked.
    InvalidCallback {
        /// Diagnostic label of the target being referenced.
        target: String,
    },
}

impl std::fmt::Display for SafeRefError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedTarget { target } => {
                write!(f, "target {target} is bound but not a method")
            }
            Self::InvalidCallback { target } => {
                write!(f, "on_delete callback for {target} is not invocable")
            }
        }
    }
}

impl std::error::Error for SafeRefError {}

/// Result alias for reference construction.
pub type Result<T> = std::result::Result<T, SafeRefError>;
