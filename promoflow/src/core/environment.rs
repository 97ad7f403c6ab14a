//! Environment descriptors: the static identity of a deployment target.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one deployment target.
///
/// Descriptors are resolved once at startup and shared read-only by every
/// run afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvironmentDescriptor {
    /// Human-readable environment name (e.g. "dev").
    pub name: String,
    /// Cloud account identifier.
    pub account: String,
    /// Cloud region identifier.
    pub region: String,
}

impl EnvironmentDescriptor {
    /// Creates a new descriptor.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        account: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            account: account.into(),
            region: region.into(),
        }
    }

    /// Returns true if both descriptors live in the same account and region.
    #[must_use]
    pub fn same_location(&self, other: &Self) -> bool {
        self.account == other.account && self.region == other.region
    }

    /// Returns the container registry host for this account and region.
    #[must_use]
    pub fn registry_host(&self) -> String {
        format!("{}.dkr.ecr.{}.amazonaws.com", self.account, self.region)
    }
}

impl fmt::Display for EnvironmentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}/{})", self.name, self.account, self.region)
    }
}
