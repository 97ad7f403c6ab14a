//! Artifact references for the image being promoted.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A locally built container image: the single input of a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalImage {
    /// Local image name or asset URI.
    pub name: String,
    /// Tag assigned by the build (usually a content hash).
    pub tag: String,
    /// Content digest, `sha256:<hex>`.
    pub digest: String,
}

impl LocalImage {
    /// Creates a local image with a known digest.
    #[must_use]
    pub fn new(name: impl Into<String>, tag: impl Into<String>, digest: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: tag.into(),
            digest: digest.into(),
        }
    }

    /// Creates a local image whose digest is computed from its content.
    #[must_use]
    pub fn from_content(name: impl Into<String>, tag: impl Into<String>, content: &[u8]) -> Self {
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(content)));
        Self::new(name, tag, digest)
    }
}

/// How a reference came to exist in its registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ReferenceKind {
    /// The canonical location the build was published to.
    Source,
    /// An extra tag on the canonical repository.
    Retag {
        /// URI of the source reference.
        from: String,
    },
    /// A copy into another account's or region's registry.
    Copy {
        /// URI of the source reference.
        from: String,
    },
}

/// An opaque, resolvable locator for a published image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactReference {
    /// Registry host.
    pub registry: String,
    /// Repository name within the registry.
    pub repository: String,
    /// Image tag.
    pub tag: String,
    /// Account owning the registry.
    pub account: String,
    /// Region of the registry.
    pub region: String,
    /// Content digest the tag resolves to.
    pub digest: String,
    /// Provenance of this reference.
    pub kind: ReferenceKind,
}

impl ArtifactReference {
    /// Returns the pullable image URI.
    #[must_use]
    pub fn uri(&self) -> String {
        format!("{}/{}:{}", self.registry, self.repository, self.tag)
    }

    /// Returns the ARN of the repository holding this reference.
    #[must_use]
    pub fn repository_arn(&self) -> String {
        format!(
            "arn:aws:ecr:{}:{}:repository/{}",
            self.region, self.account, self.repository
        )
    }

    /// Returns true for the canonical (source) reference.
    #[must_use]
    pub fn is_source(&self) -> bool {
        matches!(self.kind, ReferenceKind::Source)
    }
}

impl fmt::Display for ArtifactReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference() -> ArtifactReference {
        ArtifactReference {
            registry: "111111111111.dkr.ecr.us-east-1.amazonaws.com".to_string(),
            repository: "helloecs".to_string(),
            tag: "abc123".to_string(),
            account: "111111111111".to_string(),
            region: "us-east-1".to_string(),
            digest: "sha256:00".to_string(),
            kind: ReferenceKind::Source,
        }
    }

    #[test]
    fn test_uri_and_arn() {
        let r = reference();
        assert_eq!(r.uri(), "111111111111.dkr.ecr.us-east-1.amazonaws.com/helloecs:abc123");
        assert_eq!(
            r.repository_arn(),
            "arn:aws:ecr:us-east-1:111111111111:repository/helloecs"
        );
        assert!(r.is_source());
    }

    #[test]
    fn test_local_image_digest_is_stable() {
        let a = LocalImage::from_content("app", "v1", b"layer-bytes");
        let b = LocalImage::from_content("app", "v1", b"layer-bytes");
        let c = LocalImage::from_content("app", "v1", b"other-bytes");

        assert_eq!(a.digest, b.digest);
        assert_ne!(a.digest, c.digest);
        assert!(a.digest.starts_with("sha256:"));
    }

    #[test]
    fn test_reference_kind_serialization() {
        let kind = ReferenceKind::Copy {
            from: "src".to_string(),
        };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json, serde_json::json!({"mode": "copy", "from": "src"}));
    }
}
