use std::str::FromStr;
use tracing_subscriber::EnvFilter;

/// Output style of the installed subscriber
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Full,
    Compact,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "compact" => Ok(Self::Compact),
            other => Err(anyhow::anyhow!(
                "Unknown log format '{}', expected 'full' or 'compact'",
                other
            )),
        }
    }
}

/// Tracing setup for a test process.
///
/// Installed once by [`TestSuiteExecutor::new`](crate::TestSuiteExecutor::new); later
/// installations, including ones made by the test author, are left in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, e.g. `info` or `testnet_harness=debug`
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let filter = std::env::var("TESTNET_LOG").unwrap_or_else(|_| "info".to_string());
        let format = match std::env::var("TESTNET_LOG_FORMAT") {
            Ok(value) => value.parse().unwrap_or_else(|e| {
                eprintln!("Ignoring TESTNET_LOG_FORMAT: {}", e);
                LogFormat::default()
            }),
            Err(_) => LogFormat::default(),
        };
        Self { filter, format }
    }
}

impl LoggingConfig {
    pub fn new(filter: impl Into<String>) -> Self {
        Self {
            filter: filter.into(),
            format: LogFormat::default(),
        }
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Install the global subscriber. Returns false if one was already installed.
    pub fn init(&self) -> bool {
        let filter = EnvFilter::try_new(&self.filter).unwrap_or_else(|e| {
            eprintln!("Invalid log filter '{}' ({}), falling back to 'info'", self.filter, e);
            EnvFilter::new("info")
        });

        let builder = tracing_subscriber::fmt().with_env_filter(filter);
        let installed = match self.format {
            LogFormat::Full => builder.try_init(),
            LogFormat::Compact => builder.compact().try_init(),
        };
        installed.is_ok()
    }
}
