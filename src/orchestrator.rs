//! Boundary with the remote orchestration engine that owns the containers
//!
//! Argument types mirror the engine's JSON wire format. Only test-execution
//! registration is retried: the engine may not be reachable yet when the test
//! process starts, while replaying a mutating call could duplicate its effect.

use crate::partition::{ConnectionState, PartitionTopology};
use crate::ArtifactId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Errors reported by an orchestrator implementation
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// The engine could not be reached; safe to retry for idempotent calls
    #[error("orchestrator unreachable: {0}")]
    Unreachable(String),

    /// The engine received the call and refused it
    #[error("orchestrator rejected the call: {0}")]
    Rejected(String),

    #[error("operation not supported by this orchestrator: {0}")]
    Unsupported(&'static str),

    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),
}

impl OrchestratorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddServiceArgs {
    pub service_id: String,
    pub partition_id: String,
    pub image_name: String,
    /// Docker port specifications, e.g. "80" or "80/udp"
    pub used_ports: Vec<String>,
    pub ip_placeholder: String,
    /// `None` runs the image's own entrypoint
    pub start_command: Option<Vec<String>>,
    pub docker_environment_vars: HashMap<String, String>,
    pub test_volume_mount_dirpath: String,
    /// Content artifact ID -> mount dirpath inside the container
    pub files_artifact_mount_dirpaths: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddServiceResponse {
    pub ip_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveServiceArgs {
    pub service_id: String,
    pub container_stop_timeout_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializablePartitionConnection {
    pub is_blocked: bool,
}

impl From<ConnectionState> for SerializablePartitionConnection {
    fn from(state: ConnectionState) -> Self {
        Self {
            is_blocked: state.is_blocked(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepartitionArgs {
    /// Partition ID -> set of service IDs
    pub partition_services: HashMap<String, HashSet<String>>,
    /// Partition A -> partition B -> connection, each unordered pair appearing once
    pub partition_connections: HashMap<String, HashMap<String, SerializablePartitionConnection>>,
    pub default_connection: SerializablePartitionConnection,
}

impl From<&PartitionTopology> for RepartitionArgs {
    fn from(topology: &PartitionTopology) -> Self {
        let partition_services = topology
            .services()
            .iter()
            .map(|(partition, members)| {
                (
                    partition.to_string(),
                    members.iter().map(ToString::to_string).collect(),
                )
            })
            .collect();

        let mut partition_connections: HashMap<String, HashMap<String, SerializablePartitionConnection>> =
            HashMap::new();
        for (pair, state) in topology.connections() {
            partition_connections
                .entry(pair.first().to_string())
                .or_default()
                .insert(pair.second().to_string(), (*state).into());
        }

        Self {
            partition_services,
            partition_connections,
            default_connection: topology.default_connection().into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterTestExecutionArgs {
    pub test_timeout_seconds: u64,
}

/// Operations the remote orchestration engine exposes to a test
#[async_trait]
pub trait OrchestratorClient: Send + Sync {
    /// Create and start a container, returning its IP address
    async fn add_service(&self, args: AddServiceArgs) -> Result<AddServiceResponse, OrchestratorError>;

    /// Stop a container, waiting up to the given timeout before killing it
    async fn remove_service(&self, args: RemoveServiceArgs) -> Result<(), OrchestratorError>;

    /// Atomically replace the network's partition topology
    async fn repartition(&self, args: RepartitionArgs) -> Result<(), OrchestratorError>;

    /// Arm the external hard timeout for the current test execution
    async fn register_test_execution(&self, args: RegisterTestExecutionArgs) -> Result<(), OrchestratorError>;
}

/// Constant-backoff retry settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            backoff: Duration::from_secs(1),
        }
    }
}

/// Whole seconds covering `duration`, rounding any fraction up
pub(crate) fn ceil_seconds(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

/// Register a test execution, retrying transient failures with constant backoff
pub(crate) async fn register_test_execution_with_retry(
    client: &dyn OrchestratorClient,
    hard_timeout: Duration,
    policy: RetryPolicy,
) -> Result<(), OrchestratorError> {
    let args = RegisterTestExecutionArgs {
        test_timeout_seconds: ceil_seconds(hard_timeout),
    };

    tracing::debug!(
        "Registering test execution with a hard timeout of {}s...",
        args.test_timeout_seconds
    );

    let mut retries = 0;
    loop {
        match client.register_test_execution(args).await {
            Ok(()) => {
                tracing::debug!(
                    "Registered test execution with a hard timeout of {}s",
                    args.test_timeout_seconds
                );
                return Ok(());
            }
            Err(e) if e.is_transient() && retries < policy.max_retries => {
                retries += 1;
                tracing::debug!(
                    "Registering test execution failed ({}); retry {}/{} in {:?}",
                    e,
                    retries,
                    policy.max_retries,
                    policy.backoff
                );
                tokio::time::sleep(policy.backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Map of content artifact ID to mount dirpath, in wire form
pub(crate) fn artifact_mounts_to_wire(mounts: HashMap<ArtifactId, String>) -> HashMap<String, String> {
    mounts
        .into_iter()
        .map(|(id, dirpath)| (id.to_string(), dirpath))
        .collect()
}
