//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Engine config and captured row fixtures
//! - A fault-injecting store wrapper

#![allow(dead_code)]

pub mod faulty_store;
pub mod fixtures;

pub use faulty_store::*;
pub use fixtures::*;
