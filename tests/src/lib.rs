//! Shared harness for the digest writer integration tests.

pub mod containers;
pub mod mocks;
pub mod setup;
