//! Error primitives shared across the entity crates.
//!
//! Typed errors live next to the code that produces them, as `snafu` enums. Anywhere an error only needs to be
//! reported, or crosses a boundary where the concrete type is not interesting to the caller, it is erased into a
//! [`GenericError`].
#![deny(warnings)]
#![deny(missing_docs)]

use std::{error::Error as StdError, fmt::Display};

/// A type-erased error.
pub type GenericError = anyhow::Error;

/// Constructs a [`GenericError`].
///
/// Accepts a string literal, a format string followed by its arguments (as with `std::format!`), or a single value
/// that implements `Debug` and `Display`. When that value is itself an `std::error::Error`, its source chain is kept.
#[macro_export]
macro_rules! generic_error {
    // Forwards to `anyhow::anyhow`. Kept as our own macro so call sites never name `anyhow` directly.
    ($msg:literal $(,)?) => { $crate::_anyhow!($msg) };
    ($err:expr $(,)?) => { $crate::_anyhow!($err) };
    ($fmt:expr, $($arg:tt)*) => { $crate::_anyhow!($fmt, $($arg)*) };
}

#[doc(hidden)]
pub use anyhow::anyhow as _anyhow;

mod private {
    pub trait Sealed {}

    impl<T, E> Sealed for Result<T, E> {}
    impl Sealed for super::GenericError {}
}

/// Attaches context to a fallible result.
///
/// This wraps `anyhow::Context` so that it does not collide with `snafu::ResultExt` when both are in scope.
pub trait ErrorContext<T, E>: private::Sealed {
    /// Wraps the error value with the given context.
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static;

    /// Wraps the error value with context that is only computed if an error occurred.
    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> ErrorContext<T, E> for Result<T, E>
where
    Result<T, E>: anyhow::Context<T, E>,
{
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
    {
        <Self as anyhow::Context<T, E>>::context(self, context)
    }

    fn with_error_context<C, F>(self, context: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        <Self as anyhow::Context<T, E>>::with_context(self, context)
    }
}

/// Inspection helpers for [`GenericError`].
pub trait ErrorChainExt: private::Sealed {
    /// Finds the first error of type `E` in the chain, starting from the outermost error.
    ///
    /// Context layers added through [`ErrorContext`] are skipped over, so a typed error wrapped in any amount of
    /// context can still be recovered.
    fn find_cause<E>(&self) -> Option<&E>
    where
        E: StdError + 'static;
}

impl ErrorChainExt for GenericError {
    fn find_cause<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        self.chain().find_map(|cause| cause.downcast_ref::<E>())
    }
}
