//! Named collections of tests and the executor that runs them
//!
//! Suites are also described up front as metadata (partitioning needs and artifact
//! URLs per test) so an orchestrator can prepare before any test executes.

use crate::{
    ArtifactIdProvider, Error, HarnessConfig, OrchestratorClient, Result, Sha3ArtifactIdProvider, Test,
    TestConfiguration, TestExecutor, TestReport, TestVolume,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// A test as a suite stores it, independent of its service and network types
#[async_trait]
pub trait SuiteTest: Send + Sync {
    fn configuration(&self) -> TestConfiguration;

    async fn execute(&self, name: &str, executor: &TestExecutor) -> TestReport;
}

#[async_trait]
impl<T: Test> SuiteTest for Arc<T> {
    fn configuration(&self) -> TestConfiguration {
        Test::configuration(&**self)
    }

    async fn execute(&self, name: &str, executor: &TestExecutor) -> TestReport {
        executor.execute(name, Arc::clone(self)).await
    }
}

/// A set of named tests
pub trait TestSuite: Send + Sync {
    fn tests(&self) -> BTreeMap<String, Box<dyn SuiteTest>>;

    /// Log2 of the number of IPs each test's network gets
    fn network_width_bits(&self) -> u32 {
        8
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestMetadata {
    pub is_partitioning_enabled: bool,
    /// Artifact content ID -> URL, one entry per distinct URL
    pub used_artifact_urls: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSuiteMetadata {
    pub test_metadata: BTreeMap<String, TestMetadata>,
    pub network_width_bits: u32,
}

/// Entry point for running a suite's tests
pub struct TestSuiteExecutor<T> {
    suite: T,
    executor: TestExecutor,
    artifact_ids: Arc<dyn ArtifactIdProvider>,
}

impl<T: TestSuite> TestSuiteExecutor<T> {
    /// Install logging from `config` and prepare the shared test volume
    pub fn new(suite: T, config: HarnessConfig, orchestrator: Arc<dyn OrchestratorClient>) -> Result<Self> {
        if config.logging.init() {
            tracing::debug!("Installed log subscriber with filter '{}'", config.logging.filter);
        }

        let volume = TestVolume::new(&config.volume_dirpath)?;
        let artifact_ids: Arc<dyn ArtifactIdProvider> = Arc::new(Sha3ArtifactIdProvider);
        let executor = TestExecutor::new(orchestrator, volume)
            .with_artifact_id_provider(Arc::clone(&artifact_ids))
            .with_registration_retry(config.registration_retry)
            .with_container_stop_timeout(config.container_stop_timeout)
            .with_teardown(config.teardown);

        Ok(Self {
            suite,
            executor,
            artifact_ids,
        })
    }

    pub fn suite(&self) -> &T {
        &self.suite
    }

    pub fn metadata(&self) -> TestSuiteMetadata {
        let test_metadata = self
            .suite
            .tests()
            .into_iter()
            .map(|(name, test)| {
                let config = test.configuration();
                let used_artifact_urls = config
                    .files_artifact_urls
                    .into_values()
                    .map(|url| (self.artifact_ids.artifact_id(&url).to_string(), url))
                    .collect();
                (
                    name,
                    TestMetadata {
                        is_partitioning_enabled: config.is_partitioning_enabled,
                        used_artifact_urls,
                    },
                )
            })
            .collect();

        TestSuiteMetadata {
            test_metadata,
            network_width_bits: self.suite.network_width_bits(),
        }
    }

    pub fn serialize_metadata(&self) -> Result<String> {
        serde_json::to_string(&self.metadata())
            .map_err(|e| Error::Other(anyhow::anyhow!("Failed to serialize suite metadata: {}", e)))
    }

    pub fn write_metadata(&self, path: &Path) -> Result<()> {
        tracing::debug!("Writing suite metadata to {}", path.display());
        std::fs::write(path, self.serialize_metadata()?)?;
        Ok(())
    }

    /// Run the test registered under `name`
    pub async fn run_test(&self, name: &str) -> Result<TestReport> {
        let tests = self.suite.tests();
        let test = tests
            .get(name)
            .ok_or_else(|| Error::UnknownTest(name.to_string()))?;
        Ok(test.execute(name, &self.executor).await)
    }

    /// Run every test in name order; failures do not stop later tests
    pub async fn run_all(&self) -> Vec<TestReport> {
        let mut reports = Vec::new();
        for (name, test) in self.suite.tests() {
            reports.push(test.execute(&name, &self.executor).await);
        }

        let passed = reports.iter().filter(|r| r.outcome.is_success()).count();
        tracing::info!("{}/{} test(s) passed", passed, reports.len());
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryOrchestrator, LoggingConfig, NetworkContext, Service, TestContext};
    use std::time::Duration;

    struct Noop;

    #[async_trait]
    impl Service for Noop {
        async fn is_available(&self) -> bool {
            true
        }
    }

    struct ConfiguredTest(TestConfiguration);

    #[async_trait]
    impl Test for ConfiguredTest {
        type Service = Noop;
        type Network = ();

        fn configuration(&self) -> TestConfiguration {
            self.0.clone()
        }

        fn execution_timeout(&self) -> Duration {
            Duration::from_secs(1)
        }

        fn setup_teardown_buffer(&self) -> Duration {
            Duration::from_secs(1)
        }

        async fn setup(&self, _network: Arc<NetworkContext<Noop>>) -> anyhow::Result<()> {
            Ok(())
        }

        async fn run(&self, _network: (), _ctx: TestContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct ExampleSuite;

    impl TestSuite for ExampleSuite {
        fn tests(&self) -> BTreeMap<String, Box<dyn SuiteTest>> {
            let plain = TestConfiguration::default();
            let with_artifacts = TestConfiguration::default()
                .with_partitioning(true)
                .with_files_artifact("site", "https://example.com/site.tgz")
                .with_files_artifact("site-copy", "https://example.com/site.tgz");

            BTreeMap::from([
                (
                    "plain".to_string(),
                    Box::new(Arc::new(ConfiguredTest(plain))) as Box<dyn SuiteTest>,
                ),
                (
                    "artifacts".to_string(),
                    Box::new(Arc::new(ConfiguredTest(with_artifacts))) as Box<dyn SuiteTest>,
                ),
            ])
        }

        fn network_width_bits(&self) -> u32 {
            4
        }
    }

    fn suite_executor(temp: &tempfile::TempDir) -> TestSuiteExecutor<ExampleSuite> {
        let config = HarnessConfig::default()
            .with_logging(LoggingConfig::new("warn"))
            .with_volume_dirpath(temp.path());
        TestSuiteExecutor::new(ExampleSuite, config, Arc::new(InMemoryOrchestrator::new())).unwrap()
    }

    #[test]
    fn test_metadata_dedupes_artifact_urls() {
        let temp = tempfile::tempdir().unwrap();
        let metadata = suite_executor(&temp).metadata();

        assert_eq!(metadata.network_width_bits, 4);
        assert!(!metadata.test_metadata["plain"].is_partitioning_enabled);

        let artifacts = &metadata.test_metadata["artifacts"];
        assert!(artifacts.is_partitioning_enabled);
        assert_eq!(artifacts.used_artifact_urls.len(), 1);
        let id = Sha3ArtifactIdProvider.artifact_id("https://example.com/site.tgz");
        assert_eq!(
            artifacts.used_artifact_urls[id.as_str()],
            "https://example.com/site.tgz"
        );
    }

    #[test]
    fn test_metadata_json_field_names() {
        let temp = tempfile::tempdir().unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&suite_executor(&temp).serialize_metadata().unwrap()).unwrap();

        assert_eq!(json["networkWidthBits"], 4);
        assert_eq!(json["testMetadata"]["artifacts"]["isPartitioningEnabled"], true);
        assert!(json["testMetadata"]["plain"]["usedArtifactUrls"]
            .as_object()
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_run_unknown_test_fails() {
        let temp = tempfile::tempdir().unwrap();
        let err = suite_executor(&temp).run_test("missing").await.unwrap_err();
        assert!(matches!(err, Error::UnknownTest(name) if name == "missing"));
    }

    #[tokio::test]
    async fn test_run_all_reports_every_test() {
        let temp = tempfile::tempdir().unwrap();
        let reports = suite_executor(&temp).run_all().await;

        let names: Vec<&str> = reports.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["artifacts", "plain"]);
        assert!(reports.iter().all(|r| r.outcome.is_success()));
    }
}
