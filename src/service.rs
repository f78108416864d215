use crate::artifacts::FilesArtifactId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::File;

/// Token that stands in for a service's IP address in its start command and environment.
///
/// The orchestrator replaces every occurrence with the container's real IP at start time.
pub const IP_PLACEHOLDER: &str = "SERVICEIP";

/// Identifier of a service, unique within one network
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(String);

impl ServiceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServiceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ServiceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A running service in the test network
///
/// Implementors carry whatever capability surface the test needs (an HTTP client,
/// a datastore client, ...) on top of the liveness probe.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Single liveness probe. May perform network I/O.
    async fn is_available(&self) -> bool;
}

/// Instructions for launching one service container and wrapping it in a typed handle
///
/// Anything the service depends on (handles of services started earlier, config values)
/// lives on the implementing value and is available to every method here.
pub trait ServiceInitSpec<S: Service>: Send + Sync {
    /// Container image to launch
    fn image(&self) -> String;

    /// Ports the container listens on, in Docker syntax ("80" or "80/udp")
    fn used_ports(&self) -> HashSet<String>;

    /// Keys of files that must exist before the service starts; one file is created per key
    fn files_to_generate(&self) -> HashSet<String> {
        HashSet::new()
    }

    /// Fill in the files requested by `files_to_generate`, keyed the same way
    fn initialize_generated_files(&self, _files: &mut HashMap<String, File>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Path inside the container where the shared test volume is mounted
    fn test_volume_mountpoint(&self) -> String;

    /// Files artifacts to mount, keyed by the artifact ID the test declared
    fn files_artifact_mountpoints(&self) -> HashMap<FilesArtifactId, String> {
        HashMap::new()
    }

    /// Extra environment variables; values may contain [`IP_PLACEHOLDER`]
    fn environment(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    /// Command the container starts with, or `None` to run the image's entrypoint.
    ///
    /// `mounted_file_paths` maps each generated file key to its path inside the container.
    fn start_command(
        &self,
        mounted_file_paths: &HashMap<String, String>,
        ip_placeholder: &str,
    ) -> anyhow::Result<Option<Vec<String>>>;

    /// Build the service handle once the container has an IP
    fn service_from_ip(&self, ip_addr: &str) -> S;
}
