//! Test execution: registration, setup, and the timed run of the test body
//!
//! The body runs as its own task raced against the execution timeout. A body that
//! loses the race is abandoned, not cancelled; the hard timeout registered with the
//! orchestrator is what eventually tears its containers down.

use crate::orchestrator::register_test_execution_with_retry;
use crate::{
    ArtifactIdProvider, ArtifactResolver, Error, FilesArtifactId, NetworkContext, OrchestratorClient,
    Result, RetryPolicy, Service, Sha3ArtifactIdProvider, TestVolume,
};
use async_trait::async_trait;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinError;

/// Per-test settings the harness needs before setup
#[derive(Debug, Clone, Default)]
pub struct TestConfiguration {
    pub is_partitioning_enabled: bool,
    /// Files artifacts the test's services may mount, keyed by the ID services refer to
    pub files_artifact_urls: HashMap<FilesArtifactId, String>,
}

impl TestConfiguration {
    pub fn with_partitioning(mut self, enabled: bool) -> Self {
        self.is_partitioning_enabled = enabled;
        self
    }

    pub fn with_files_artifact(mut self, id: impl Into<FilesArtifactId>, url: impl Into<String>) -> Self {
        self.files_artifact_urls.insert(id.into(), url.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestExecutionConfig {
    /// Time the test body gets before it is abandoned
    pub execution_timeout: Duration,
    /// Extra time covering setup and teardown
    pub setup_teardown_buffer: Duration,
}

impl TestExecutionConfig {
    /// Total time registered with the orchestrator as the external backstop
    pub fn hard_timeout(&self) -> Duration {
        self.execution_timeout + self.setup_teardown_buffer
    }
}

/// An integration test run against a network of services
#[async_trait]
pub trait Test: Send + Sync + 'static {
    /// Handle type of the services this test's network holds
    type Service: Service;
    /// What setup hands to the body; often the network context itself
    type Network: Send + 'static;

    fn configuration(&self) -> TestConfiguration {
        TestConfiguration::default()
    }

    fn execution_timeout(&self) -> Duration;

    fn setup_teardown_buffer(&self) -> Duration;

    fn execution_config(&self) -> TestExecutionConfig {
        TestExecutionConfig {
            execution_timeout: self.execution_timeout(),
            setup_teardown_buffer: self.setup_teardown_buffer(),
        }
    }

    /// Build the network the body runs against
    async fn setup(&self, network: Arc<NetworkContext<Self::Service>>) -> anyhow::Result<Self::Network>;

    /// The test body. Returning an error or panicking fails the test.
    async fn run(&self, network: Self::Network, ctx: TestContext) -> anyhow::Result<()>;
}

/// Where an execution is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPhase {
    Idle,
    Registering,
    SettingUp,
    Running,
    Completed,
    TimedOut,
    Failed,
}

impl ExecutionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::TimedOut | Self::Failed)
    }
}

impl fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Registering => "registering",
            Self::SettingUp => "setting up",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::TimedOut => "timed out",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub enum TestOutcome {
    Completed,
    Failed(Error),
    /// The body was still running when the execution timeout elapsed
    TimedOut(Duration),
}

impl TestOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn phase(&self) -> ExecutionPhase {
        match self {
            Self::Completed => ExecutionPhase::Completed,
            Self::Failed(_) => ExecutionPhase::Failed,
            Self::TimedOut(_) => ExecutionPhase::TimedOut,
        }
    }

    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Completed => Ok(()),
            Self::Failed(e) => Err(e),
            Self::TimedOut(timeout) => Err(Error::ExecutionTimedOut(timeout)),
        }
    }
}

/// Result of one test execution
#[derive(Debug)]
pub struct TestReport {
    pub name: String,
    pub outcome: TestOutcome,
    /// Last phase entered before the outcome was decided
    pub last_phase: ExecutionPhase,
    pub elapsed: Duration,
}

/// Assertion helpers handed to the test body.
///
/// Failures panic; the executor reports them as [`Error::TestBodyFailed`].
#[derive(Debug, Clone)]
pub struct TestContext {
    test_name: String,
}

impl TestContext {
    pub(crate) fn new(test_name: &str) -> Self {
        Self {
            test_name: test_name.to_string(),
        }
    }

    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    /// Fail the test immediately
    pub fn fatal(&self, err: impl fmt::Display) -> ! {
        panic!("{}", err)
    }

    pub fn assert_true(&self, condition: bool, message: impl fmt::Display) {
        if !condition {
            self.fatal(format!("Assertion failed: {}", message));
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "test body panicked with a non-string payload".to_string()
    }
}

fn join_error_message(err: JoinError) -> String {
    if err.is_panic() {
        panic_message(err.into_panic())
    } else {
        err.to_string()
    }
}

/// Runs tests against one orchestrator
pub struct TestExecutor {
    orchestrator: Arc<dyn OrchestratorClient>,
    volume: TestVolume,
    artifact_ids: Arc<dyn ArtifactIdProvider>,
    registration_retry: RetryPolicy,
    container_stop_timeout: Duration,
    teardown: bool,
}

impl TestExecutor {
    pub fn new(orchestrator: Arc<dyn OrchestratorClient>, volume: TestVolume) -> Self {
        Self {
            orchestrator,
            volume,
            artifact_ids: Arc::new(Sha3ArtifactIdProvider),
            registration_retry: RetryPolicy::default(),
            container_stop_timeout: Duration::from_secs(10),
            teardown: true,
        }
    }

    pub fn with_artifact_id_provider(mut self, provider: Arc<dyn ArtifactIdProvider>) -> Self {
        self.artifact_ids = provider;
        self
    }

    pub fn with_registration_retry(mut self, policy: RetryPolicy) -> Self {
        self.registration_retry = policy;
        self
    }

    pub fn with_container_stop_timeout(mut self, timeout: Duration) -> Self {
        self.container_stop_timeout = timeout;
        self
    }

    pub fn with_teardown(mut self, teardown: bool) -> Self {
        self.teardown = teardown;
        self
    }

    /// Run one test to a terminal outcome. Never panics because of the test body.
    pub async fn execute<T: Test>(&self, name: &str, test: Arc<T>) -> TestReport {
        let start = Instant::now();
        let exec_config = test.execution_config();
        tracing::info!(
            "Running test '{}' (execution timeout {:?}, hard timeout {:?})",
            name,
            exec_config.execution_timeout,
            exec_config.hard_timeout()
        );

        let mut phase = ExecutionPhase::Idle;
        let outcome = self.execute_phases(name, test, exec_config, &mut phase).await;

        match &outcome {
            TestOutcome::Completed => tracing::info!("Test '{}' completed", name),
            TestOutcome::Failed(e) => tracing::info!("Test '{}' failed while {}: {}", name, phase, e),
            TestOutcome::TimedOut(timeout) => {
                tracing::info!("Test '{}' timed out after {:?}", name, timeout)
            }
        }

        TestReport {
            name: name.to_string(),
            outcome,
            last_phase: phase,
            elapsed: start.elapsed(),
        }
    }

    async fn execute_phases<T: Test>(
        &self,
        name: &str,
        test: Arc<T>,
        exec_config: TestExecutionConfig,
        phase: &mut ExecutionPhase,
    ) -> TestOutcome {
        enter(name, phase, ExecutionPhase::Registering);
        if let Err(e) = register_test_execution_with_retry(
            self.orchestrator.as_ref(),
            exec_config.hard_timeout(),
            self.registration_retry,
        )
        .await
        {
            return TestOutcome::Failed(Error::RegistrationFailed(e.to_string()));
        }

        enter(name, phase, ExecutionPhase::SettingUp);
        let config = test.configuration();
        let network = Arc::new(NetworkContext::new(
            Arc::clone(&self.orchestrator),
            self.volume.clone(),
            ArtifactResolver::new(config.files_artifact_urls, self.artifact_ids.as_ref()),
            config.is_partitioning_enabled,
        ));

        // Setup runs as its own task so a panic there fails this test, not the suite
        let setup = {
            let test = Arc::clone(&test);
            let network = Arc::clone(&network);
            tokio::spawn(async move { test.setup(network).await })
        };
        let outcome = match setup.await {
            Ok(Ok(test_network)) => {
                enter(name, phase, ExecutionPhase::Running);
                run_body(name, test, test_network, exec_config.execution_timeout).await
            }
            Ok(Err(e)) => TestOutcome::Failed(Error::SetupFailed(format!("{:#}", e))),
            Err(e) => TestOutcome::Failed(Error::SetupFailed(join_error_message(e))),
        };

        if self.teardown {
            network.remove_all(self.container_stop_timeout).await;
        }
        outcome
    }
}

fn enter(name: &str, phase: &mut ExecutionPhase, next: ExecutionPhase) {
    tracing::debug!("Test '{}': {} -> {}", name, phase, next);
    *phase = next;
}

async fn run_body<T: Test>(name: &str, test: Arc<T>, network: T::Network, timeout: Duration) -> TestOutcome {
    let ctx = TestContext::new(name);
    let body = tokio::spawn(async move { test.run(network, ctx).await });

    // Dropping the handle when the timer wins detaches the task without aborting it
    tokio::select! {
        joined = body => match joined {
            Ok(Ok(())) => TestOutcome::Completed,
            Ok(Err(e)) => TestOutcome::Failed(Error::TestBodyFailed(format!("{:#}", e))),
            Err(e) => TestOutcome::Failed(Error::TestBodyFailed(join_error_message(e))),
        },
        _ = tokio::time::sleep(timeout) => {
            tracing::warn!(
                "Test '{}' did not finish within {:?}; abandoning its body",
                name,
                timeout
            );
            TestOutcome::TimedOut(timeout)
        }
    }
}
