//! Testing utilities for promotion pipelines.
//!
//! This module provides:
//! - A scripted deployment target that records call order
//! - An in-memory registry that counts writes
//! - Fixtures for a dev/test/prod configuration

pub mod fixtures;
mod mocks;

pub use mocks::{DeployCall, InMemoryRegistry, ScriptedDeploymentTarget};
