//! The shared test volume: one directory per service, holding the files that
//! service asked to have generated before it starts

use crate::{Error, Result, ServiceId};
use chrono::Utc;
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// The test volume as seen from this process
#[derive(Debug, Clone)]
pub struct TestVolume {
    host_dirpath: PathBuf,
}

impl TestVolume {
    /// Use an existing (or to-be-created) directory as the volume
    pub fn new(host_dirpath: impl Into<PathBuf>) -> Result<Self> {
        let host_dirpath = host_dirpath.into();
        fs::create_dir_all(&host_dirpath)?;
        Ok(Self { host_dirpath })
    }

    /// Allocate a fresh timestamped directory under `base_dir` for one test run
    pub fn for_run(base_dir: &Path, test_name: &str) -> Result<Self> {
        fs::create_dir_all(base_dir)?;
        let timestamp = Utc::now().format("%Y%m%d-%H%M%S").to_string();
        for attempt in 0..100 {
            let candidate = if attempt == 0 {
                base_dir.join(format!("{}-{}", test_name, timestamp))
            } else {
                base_dir.join(format!("{}-{}-{}", test_name, timestamp, attempt))
            };
            if !candidate.exists() {
                fs::create_dir_all(&candidate)?;
                return Ok(Self {
                    host_dirpath: candidate,
                });
            }
        }

        Err(Error::Other(anyhow::anyhow!(
            "Unable to allocate a test volume directory under {}",
            base_dir.display()
        )))
    }

    pub fn host_dirpath(&self) -> &Path {
        &self.host_dirpath
    }

    /// Create the directory that will hold `service_id`'s files
    pub fn create_service_dir(&self, service_id: &ServiceId) -> Result<ServiceDir> {
        let dirname = format!("{}-{}", service_id, uuid::Uuid::new_v4());
        let host_path = self.host_dirpath.join(&dirname);
        fs::create_dir(&host_path)?;
        tracing::trace!("Created service directory {}", host_path.display());
        Ok(ServiceDir { dirname, host_path })
    }
}

/// A service's directory on the test volume
#[derive(Debug, Clone)]
pub struct ServiceDir {
    dirname: String,
    host_path: PathBuf,
}

impl ServiceDir {
    pub fn host_path(&self) -> &Path {
        &self.host_path
    }

    /// Create one empty file per key.
    ///
    /// Returns the open handles and, for each key, the file's path inside a container
    /// that mounts the test volume at `container_mountpoint`.
    pub fn generate_files<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a String>,
        container_mountpoint: &str,
    ) -> Result<(HashMap<String, File>, HashMap<String, String>)> {
        let mut handles = HashMap::new();
        let mut container_paths = HashMap::new();
        let container_dir = Path::new(container_mountpoint).join(&self.dirname);

        for key in keys {
            let filename = format!("{}-{}", key, uuid::Uuid::new_v4());
            let file = File::create(self.host_path.join(&filename))?;
            handles.insert(key.clone(), file);
            container_paths.insert(
                key.clone(),
                container_dir.join(&filename).to_string_lossy().into_owned(),
            );
        }

        Ok((handles, container_paths))
    }
}
