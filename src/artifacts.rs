//! Files artifacts: archives a test declares by URL and services mount by ID

use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::collections::HashMap;
use std::fmt;

/// Test-author-chosen name for a files artifact, as declared in the test configuration
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilesArtifactId(String);

impl FilesArtifactId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for FilesArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FilesArtifactId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Stable, content-derived identifier the orchestrator uses to cache and dedupe downloads
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(String);

impl ArtifactId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives an [`ArtifactId`] from an artifact URL
pub trait ArtifactIdProvider: Send + Sync {
    fn artifact_id(&self, artifact_url: &str) -> ArtifactId;
}

/// Hex-encoded SHA3-256 of the artifact URL
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha3ArtifactIdProvider;

impl ArtifactIdProvider for Sha3ArtifactIdProvider {
    fn artifact_id(&self, artifact_url: &str) -> ArtifactId {
        let digest = Sha3_256::digest(artifact_url.as_bytes());
        ArtifactId(hex::encode(digest))
    }
}

/// The set of artifacts one test declared, resolved to their content IDs
#[derive(Debug, Clone, Default)]
pub struct ArtifactResolver {
    urls: HashMap<FilesArtifactId, String>,
    ids: HashMap<FilesArtifactId, ArtifactId>,
}

impl ArtifactResolver {
    pub fn new(urls: HashMap<FilesArtifactId, String>, provider: &dyn ArtifactIdProvider) -> Self {
        let ids = urls
            .iter()
            .map(|(id, url)| (id.clone(), provider.artifact_id(url)))
            .collect();
        Self { urls, ids }
    }

    /// URL the test declared for `id`
    pub fn url(&self, id: &FilesArtifactId) -> Option<&str> {
        self.urls.get(id).map(String::as_str)
    }

    /// Content ID for `id`, if the test declared it
    pub fn resolve(&self, id: &FilesArtifactId) -> Option<&ArtifactId> {
        self.ids.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha3_provider_is_stable_and_hex() {
        let provider = Sha3ArtifactIdProvider;
        let a = provider.artifact_id("https://example.com/a.tgz");
        let b = provider.artifact_id("https://example.com/a.tgz");
        let c = provider.artifact_id("https://example.com/b.tgz");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 64);
        assert!(a.as_str().chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn test_sha3_of_empty_url() {
        let id = Sha3ArtifactIdProvider.artifact_id("");
        assert_eq!(
            id.as_str(),
            "a7ffc6f8bf1ed76651c14756a061d662f580ff4de43b49fa82d80a4b80f8434a"
        );
    }

    #[test]
    fn test_resolver_only_knows_declared_artifacts() {
        let urls = HashMap::from([(
            FilesArtifactId::from("static-files"),
            "https://example.com/static.tgz".to_string(),
        )]);
        let resolver = ArtifactResolver::new(urls, &Sha3ArtifactIdProvider);

        let declared = FilesArtifactId::from("static-files");
        assert_eq!(resolver.url(&declared), Some("https://example.com/static.tgz"));
        assert_eq!(
            resolver.resolve(&declared),
            Some(&Sha3ArtifactIdProvider.artifact_id("https://example.com/static.tgz"))
        );
        assert!(resolver.resolve(&FilesArtifactId::from("missing")).is_none());
    }
}
