//! Test utilities and fixtures shared across the test suites

pub mod async_helpers;
pub mod fixtures;

pub use async_helpers::*;
pub use fixtures::*;
