use std::sync::Arc;

use tracing::info;

use crate::config::DriverConfig;
use crate::error::DriverResult;
use crate::report::Reporter;
use crate::scheduler::{RunSummary, TestScheduler};
use crate::script::TestScript;
use crate::transport::TcpConnectionFactory;

/// Runs a script file against a live peer over the reference transport.
pub struct TckDriver {
    config: DriverConfig,
    reporter: Option<Arc<dyn Reporter>>,
}

impl TckDriver {
    /// Driver reporting to the console.
    pub fn new(config: DriverConfig) -> Self {
        Self {
            config,
            reporter: None,
        }
    }

    /// Send per-test lines to `reporter` instead of the console.
    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Configuration the driver was built with.
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Load the script and run every selected test. Only setup failures are returned as
    /// errors; failing tests are reported in the summary.
    pub fn run(&self) -> DriverResult<RunSummary> {
        let script = TestScript::load(&self.config.script_path)?;
        info!(
            script = %self.config.script_path.display(),
            endpoint = %self.config.endpoint,
            tests = script.len(),
            "running script"
        );

        let factory = TcpConnectionFactory::new(self.config.endpoint.clone())
            .with_connect_timeout(self.config.connect_timeout)
            .with_wire_logging(self.config.debug);
        let mut scheduler =
            TestScheduler::new(Arc::new(factory)).with_allow_list(self.config.tests.clone());
        if let Some(reporter) = &self.reporter {
            scheduler = scheduler.with_reporter(reporter.clone());
        }
        Ok(scheduler.run(script))
    }
}
