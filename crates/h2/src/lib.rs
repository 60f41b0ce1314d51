#![forbid(unsafe_code)]
//! hammer2-rs public API facade.
//!
//! Re-exports the read-only mount path from `h2-core`. This is the crate
//! the CLI and other downstream consumers depend on.

pub use h2_core::*;
