//! Kernel log statements.
//!
//! Four levels: [`debug!`] for scheduling detail, [`info!`] for object
//! lifetimes, [`warn!`] for API misuse the kernel rejects and [`error!`] for
//! conditions that stop the kernel. With the `defmt` feature the statements
//! are encoded by [`defmt`]; without it they compile to nothing but still
//! type-check their arguments.

#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]
#![deny(clippy::pedantic)]

#[cfg(feature = "defmt")]
#[doc(hidden)]
pub mod __private {
    // defmt's macros resolve `defmt::` at the call site.
    pub use defmt;
}

/// Emits one statement at `$level`. Not part of the public API.
#[cfg(feature = "defmt")]
#[doc(hidden)]
#[macro_export]
macro_rules! __emit {
    ($level:ident, $($arg:tt)*) => {{
        use $crate::__private::defmt;
        defmt::$level!($($arg)*);
    }};
}

/// Emits one statement at `$level`. Not part of the public API.
#[cfg(not(feature = "defmt"))]
#[doc(hidden)]
#[macro_export]
macro_rules! __emit {
    ($level:ident, $($arg:tt)*) => {{
        let _ = ($($arg)*);
    }};
}

/// Scheduler decisions: switches, wakeups, reclaimed slots.
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::__emit!(debug, $($arg)*)
    };
}

/// Kernel objects created and deleted.
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::__emit!(info, $($arg)*)
    };
}

/// A request the kernel refused, such as a stale handle.
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::__emit!(warn, $($arg)*)
    };
}

/// The kernel cannot continue.
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::__emit!(error, $($arg)*)
    };
}
