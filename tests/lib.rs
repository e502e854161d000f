//! Shared fixtures for the Lantern integration tests

pub mod fixtures;
