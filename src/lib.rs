//! Declarative container test networks for distributed-systems integration tests
//!
//! This crate lets a test build a network of services running in isolated containers,
//! split that network into partitions while the test runs, and execute the test body
//! under a hard timeout with panic-safe failure reporting.

mod artifacts;
mod availability;
mod config;
pub mod docker;
mod harness;
mod logging;
pub mod memory;
mod network;
mod orchestrator;
mod partition;
mod registry;
mod service;
mod suite;
mod volume;

pub use artifacts::{ArtifactId, ArtifactIdProvider, ArtifactResolver, FilesArtifactId, Sha3ArtifactIdProvider};
pub use availability::AvailabilityChecker;
pub use config::HarnessConfig;
pub use docker::{DockerConfig, DockerOrchestrator};
pub use harness::{
    ExecutionPhase, Test, TestConfiguration, TestContext, TestExecutionConfig, TestExecutor,
    TestOutcome, TestReport,
};
pub use logging::{LogFormat, LoggingConfig};
pub use memory::InMemoryOrchestrator;
pub use network::NetworkContext;
pub use orchestrator::{
    AddServiceArgs, AddServiceResponse, OrchestratorClient, OrchestratorError, RegisterTestExecutionArgs,
    RemoveServiceArgs, RepartitionArgs, RetryPolicy, SerializablePartitionConnection,
};
pub use partition::{ConnectionState, PartitionId, PartitionPair, PartitionTopology, RepartitionerBuilder};
pub use registry::ServiceRegistry;
pub use service::{Service, ServiceId, ServiceInitSpec, IP_PLACEHOLDER};
pub use suite::{SuiteTest, TestMetadata, TestSuite, TestSuiteExecutor, TestSuiteMetadata};
pub use volume::{ServiceDir, TestVolume};

use std::time::Duration;

/// Result type used throughout this crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building, mutating, or testing against a network
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Service ID '{0}' already exists in the network")]
    DuplicateServiceId(ServiceId),

    #[error("Service ID '{0}' was removed earlier and cannot be reused in this network")]
    RetiredServiceId(ServiceId),

    #[error("No service with ID '{0}' exists in the network")]
    ServiceNotFound(ServiceId),

    #[error("Service '{service_id}' requested files artifact '{artifact}', which the test did not declare")]
    UnknownArtifact {
        service_id: ServiceId,
        artifact: FilesArtifactId,
    },

    #[error("Failed to add service '{service_id}': {reason}")]
    AddServiceFailed { service_id: ServiceId, reason: String },

    #[error("Failed to stop service '{service_id}': {reason}")]
    RemoveServiceFailed { service_id: ServiceId, reason: String },

    #[error("Failed to repartition the network: {0}")]
    RepartitionFailed(String),

    #[error("Partitioning is not enabled for this test")]
    PartitioningDisabled,

    #[error("Repartitioner action #{action_index}: partition '{partition}' already declared")]
    DuplicatePartition {
        action_index: usize,
        partition: PartitionId,
    },

    #[error("Repartitioner action #{action_index}: connection '{partition_a}' <-> '{partition_b}' already declared")]
    DuplicateConnection {
        action_index: usize,
        partition_a: PartitionId,
        partition_b: PartitionId,
    },

    #[error("Repartitioner action #{action_index}: service '{service_id}' already belongs to partition '{partition}'")]
    DuplicatePartitionMember {
        action_index: usize,
        service_id: ServiceId,
        partition: PartitionId,
    },

    #[error("Service '{service_id}' did not become available after {attempts} attempts spaced {interval:?} apart")]
    AvailabilityTimeout {
        service_id: ServiceId,
        attempts: u32,
        interval: Duration,
    },

    #[error("Failed to register test execution with the orchestrator: {0}")]
    RegistrationFailed(String),

    #[error("Test setup failed: {0}")]
    SetupFailed(String),

    #[error("Test body failed: {0}")]
    TestBodyFailed(String),

    #[error("Timed out after {0:?} waiting for the test body to complete")]
    ExecutionTimedOut(Duration),

    #[error("No test named '{0}' exists in the suite")]
    UnknownTest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}
