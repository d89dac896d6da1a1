//! Integration tests for workflow-cache
//!
//! These tests drive the public API end to end: persistence across
//! instances, semantic lookups and the workflow adapter.

// Test utilities and common setup
mod common;

mod hybrid_tests;
mod persistence_tests;
mod workflow_tests;

// Re-export common utilities for use by test modules
pub use common::*;
