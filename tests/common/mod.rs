//! Service doubles shared by the scenario tests
//!
//! A datastore and an API server that talks to it. Their "network traffic" goes
//! through the in-memory orchestrator's connectivity model, so partitions behave
//! like they would between real containers.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use testnet_harness::{InMemoryOrchestrator, Service, ServiceId, ServiceInitSpec, TestVolume};

pub const DATASTORE_PORT: u16 = 1323;
pub const API_PORT: u16 = 2434;

pub struct Datastore {
    pub id: ServiceId,
    pub ip: String,
    probes_until_ready: AtomicU32,
    books_read: Mutex<HashMap<u32, u32>>,
}

impl Datastore {
    pub fn books_read(&self, person_id: u32) -> Option<u32> {
        self.books_read
            .lock()
            .unwrap()
            .get(&person_id)
            .copied()
    }
}

pub struct Api {
    pub id: ServiceId,
    pub ip: String,
    datastore: Arc<Node>,
    engine: Arc<InMemoryOrchestrator>,
}

impl Api {
    fn datastore(&self) -> anyhow::Result<&Datastore> {
        let datastore = self
            .datastore
            .as_datastore()
            .ok_or_else(|| anyhow::anyhow!("API was wired to a non-datastore service"))?;
        if !self.engine.can_communicate(&self.id, &datastore.id) {
            anyhow::bail!(
                "request from {} to datastore at {}:{} timed out",
                self.ip,
                datastore.ip,
                DATASTORE_PORT
            );
        }
        Ok(datastore)
    }

    pub fn add_person(&self, person_id: u32) -> anyhow::Result<()> {
        let datastore = self.datastore()?;
        let mut books = datastore.books_read.lock().unwrap();
        if books.contains_key(&person_id) {
            anyhow::bail!("person {} already exists", person_id);
        }
        books.insert(person_id, 0);
        Ok(())
    }

    pub fn increment_books_read(&self, person_id: u32) -> anyhow::Result<()> {
        let datastore = self.datastore()?;
        let mut books = datastore.books_read.lock().unwrap();
        let count = books
            .get_mut(&person_id)
            .ok_or_else(|| anyhow::anyhow!("no person with ID {}", person_id))?;
        *count += 1;
        Ok(())
    }
}

/// Handle type of every service in the scenario networks
pub enum Node {
    Datastore(Datastore),
    Api(Api),
}

impl Node {
    pub fn ip(&self) -> &str {
        match self {
            Node::Datastore(d) => &d.ip,
            Node::Api(a) => &a.ip,
        }
    }

    pub fn as_datastore(&self) -> Option<&Datastore> {
        match self {
            Node::Datastore(d) => Some(d),
            Node::Api(_) => None,
        }
    }

    pub fn as_api(&self) -> Option<&Api> {
        match self {
            Node::Api(a) => Some(a),
            Node::Datastore(_) => None,
        }
    }
}

#[async_trait]
impl Service for Node {
    async fn is_available(&self) -> bool {
        match self {
            Node::Datastore(d) => {
                let remaining = d.probes_until_ready.load(Ordering::SeqCst);
                if remaining == 0 {
                    return true;
                }
                d.probes_until_ready.store(remaining - 1, Ordering::SeqCst);
                false
            }
            Node::Api(a) => a.datastore().is_ok(),
        }
    }
}

pub struct DatastoreSpec {
    pub id: ServiceId,
    /// Failed probes before the datastore reports itself available
    pub startup_probes: u32,
}

impl DatastoreSpec {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.into(),
            startup_probes: 0,
        }
    }
}

impl ServiceInitSpec<Node> for DatastoreSpec {
    fn image(&self) -> String {
        "example/datastore-server:latest".into()
    }

    fn used_ports(&self) -> HashSet<String> {
        [DATASTORE_PORT.to_string()].into()
    }

    fn test_volume_mountpoint(&self) -> String {
        "/test-volume".into()
    }

    fn start_command(
        &self,
        _mounted_file_paths: &HashMap<String, String>,
        _ip_placeholder: &str,
    ) -> anyhow::Result<Option<Vec<String>>> {
        Ok(None)
    }

    fn service_from_ip(&self, ip_addr: &str) -> Node {
        Node::Datastore(Datastore {
            id: self.id.clone(),
            ip: ip_addr.to_string(),
            probes_until_ready: AtomicU32::new(self.startup_probes),
            books_read: Mutex::new(HashMap::new()),
        })
    }
}

/// The API server, configured through a generated file that points at its datastore
pub struct ApiSpec {
    pub id: ServiceId,
    pub datastore: Arc<Node>,
    pub engine: Arc<InMemoryOrchestrator>,
}

const CONFIG_FILE_KEY: &str = "api-config";

impl ServiceInitSpec<Node> for ApiSpec {
    fn image(&self) -> String {
        "example/api-server:latest".into()
    }

    fn used_ports(&self) -> HashSet<String> {
        [API_PORT.to_string()].into()
    }

    fn files_to_generate(&self) -> HashSet<String> {
        [CONFIG_FILE_KEY.to_string()].into()
    }

    fn initialize_generated_files(&self, files: &mut HashMap<String, File>) -> anyhow::Result<()> {
        let file = files
            .get_mut(CONFIG_FILE_KEY)
            .ok_or_else(|| anyhow::anyhow!("missing {} file", CONFIG_FILE_KEY))?;
        let config = serde_json::json!({
            "datastoreIp": self.datastore.ip(),
            "datastorePort": DATASTORE_PORT,
        });
        file.write_all(config.to_string().as_bytes())?;
        Ok(())
    }

    fn test_volume_mountpoint(&self) -> String {
        "/test-volume".into()
    }

    fn start_command(
        &self,
        mounted_file_paths: &HashMap<String, String>,
        _ip_placeholder: &str,
    ) -> anyhow::Result<Option<Vec<String>>> {
        let config_path = mounted_file_paths
            .get(CONFIG_FILE_KEY)
            .ok_or_else(|| anyhow::anyhow!("no mounted path for {}", CONFIG_FILE_KEY))?;
        Ok(Some(vec!["./api.bin".to_string(), format!("--config={}", config_path)]))
    }

    fn service_from_ip(&self, ip_addr: &str) -> Node {
        Node::Api(Api {
            id: self.id.clone(),
            ip: ip_addr.to_string(),
            datastore: Arc::clone(&self.datastore),
            engine: Arc::clone(&self.engine),
        })
    }
}

/// A temporary test volume that lives as long as the returned guard
pub fn temp_volume() -> (tempfile::TempDir, TestVolume) {
    let dir = tempfile::tempdir().unwrap();
    let volume = TestVolume::new(dir.path()).unwrap();
    (dir, volume)
}
