//! Build-time configuration helpers shared by the kestrel crates.

#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]

#[doc(hidden)]
pub mod env;
