//! Deployment Target Adapter interface.

mod target;

pub use target::{DeploymentResult, DeploymentTarget};
