//! Test utilities and fixtures for samwatch
//!
//! This crate provides shared test helpers for the integration tests
//! (tests/ directory) of the workspace crates.

pub mod fixtures;
pub mod mocks;
