//! Zero-cost abstractions over `std` for HeronStack projects.
//!
//! # Quick Start
//!
//! | Concern | Trait(s) | Production | Test |
//! |---------|----------|------------|------|
//! | Env vars | [`ReadEnv`] | [`SystemEnv`] | [`InMemoryEnv`]* |
//!
//! *Available with `#[cfg(test)]` or the `"test-support"` feature.
//!
//! # Thread Safety
//!
//! [`SystemEnv`] is zero-sized and trivially `Send + Sync`.
//! [`InMemoryEnv`] is backed by `RefCell<HashMap>` and is **not**
//! `Send + Sync`; it is intended for single-threaded test bodies.

pub mod env;

pub use env::{ReadEnv, SystemEnv};

#[cfg(any(test, feature = "test-support"))]
pub use env::InMemoryEnv;
