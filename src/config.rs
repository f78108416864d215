use crate::{LoggingConfig, RetryPolicy};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Host directory used as the shared test volume unless configured otherwise
pub(crate) fn default_volume_dirpath() -> PathBuf {
    std::env::var_os("TESTNET_VOLUME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("testnet-harness"))
}

fn env_or<T: FromStr>(name: &str, fallback: T) -> T {
    match std::env::var(name) {
        Ok(value) => value.parse().unwrap_or_else(|_| {
            eprintln!("Ignoring invalid value '{}' for {}", value, name);
            fallback
        }),
        Err(_) => fallback,
    }
}

/// Settings shared by every test a [`TestSuiteExecutor`](crate::TestSuiteExecutor) runs
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub logging: LoggingConfig,
    /// Retry settings for registering a test execution with the orchestrator
    pub registration_retry: RetryPolicy,
    /// Host directory backing the shared test volume
    pub volume_dirpath: PathBuf,
    /// Grace period given to containers removed during teardown
    pub container_stop_timeout: Duration,
    /// Remove every service once a test finishes or is abandoned
    pub teardown: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        let defaults = RetryPolicy::default();
        let registration_retry = RetryPolicy {
            max_retries: env_or("TESTNET_REGISTRATION_RETRIES", defaults.max_retries),
            backoff: Duration::from_millis(env_or(
                "TESTNET_REGISTRATION_BACKOFF_MS",
                defaults.backoff.as_millis() as u64,
            )),
        };

        Self {
            logging: LoggingConfig::default(),
            registration_retry,
            volume_dirpath: default_volume_dirpath(),
            container_stop_timeout: Duration::from_secs(10),
            teardown: true,
        }
    }
}

impl HarnessConfig {
    pub fn with_logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = logging;
        self
    }

    pub fn with_registration_retry(mut self, policy: RetryPolicy) -> Self {
        self.registration_retry = policy;
        self
    }

    pub fn with_volume_dirpath(mut self, dirpath: impl Into<PathBuf>) -> Self {
        self.volume_dirpath = dirpath.into();
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
}
