//! Test utilities for rain benchmarks.
//!
//! This crate provides a scripted workload and logging setup for exercising the harness without a
//! system under test. See the modules for all available utilities.

pub mod tracing;
pub mod workload;
