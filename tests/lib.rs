//! Shared fixtures for the DDD integration tests.

pub mod fixtures;
