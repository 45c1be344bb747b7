use std::any::Any;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use crate::connection::ConnectionFactory;
use crate::dispatcher::{Dispatcher, Verdict};
use crate::report::{ConsoleReporter, Reporter};
use crate::script::{TestCase, TestScript};

/// Reported result of one executed test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Consumers met the test's pass/fail expectation.
    Passed,
    Failed,
    Channel { passed: bool },
    /// The test thread returned an error or panicked.
    Errored(String),
}

impl Outcome {
    /// Passed tests and passing channel runs.
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Passed | Outcome::Channel { passed: true })
    }
}

impl From<Verdict> for Outcome {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Pass => Outcome::Passed,
            Verdict::Fail => Outcome::Failed,
            Verdict::Channel { passed } => Outcome::Channel { passed },
        }
    }
}

#[derive(Debug, Clone)]
/// Name, outcome and wall-clock time of one test.
pub struct TestReport {
    pub name: String,
    pub outcome: Outcome,
    pub elapsed: Duration,
}

/// Reports of every test that was not filtered out, in script order.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    reports: Vec<TestReport>,
}

impl RunSummary {
    /// Reports in script order.
    pub fn reports(&self) -> &[TestReport] {
        &self.reports
    }

    /// Tests whose outcome counts as success.
    pub fn passed(&self) -> usize {
        self.reports
            .iter()
            .filter(|report| report.outcome.is_success())
            .count()
    }

    /// Tests that failed or errored.
    pub fn failed(&self) -> usize {
        self.reports.len() - self.passed()
    }

    /// True when nothing failed.
    pub fn all_passed(&self) -> bool {
        self.failed() == 0
    }

    /// Outcome of the first test named `name`.
    pub fn outcome_of(&self, name: &str) -> Option<&Outcome> {
        self.reports
            .iter()
            .find(|report| report.name == name)
            .map(|report| &report.outcome)
    }
}

/// Runs the tests of a script one after another, each on its own thread.
pub struct TestScheduler {
    factory: Arc<dyn ConnectionFactory>,
    allow_list: Vec<String>,
    reporter: Arc<dyn Reporter>,
}

impl TestScheduler {
    /// Scheduler running every test through `factory`, reporting to the console.
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            factory,
            allow_list: Vec::new(),
            reporter: Arc::new(ConsoleReporter),
        }
    }

    /// Only run tests whose names appear in `names`. An empty list runs everything.
    pub fn with_allow_list<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allow_list = names.into_iter().map(Into::into).collect();
        self
    }

    /// Send per-test lines to `reporter`.
    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Run each selected test to completion before starting the next.
    pub fn run(&self, script: TestScript) -> RunSummary {
        let mut summary = RunSummary::default();
        for test in script {
            if let Some(report) = self.run_test(test) {
                summary.reports.push(report);
            }
        }
        info!(
            passed = summary.passed(),
            failed = summary.failed(),
            "test run finished"
        );
        summary
    }

    /// Run a single test to completion. Returns `None` when the allow-list filters it.
    pub fn run_test(&self, test: TestCase) -> Option<TestReport> {
        let name = test.name().to_string();
        if !self.should_run(&name) {
            debug!(test = %name, "skipping test not in allow-list");
            return None;
        }

        self.reporter.test_started(&name);
        let start = Instant::now();
        let factory = self.factory.clone();
        let spawned = thread::Builder::new()
            .name(format!("tck-{name}"))
            .spawn(move || {
                let commands = test.commands();
                Dispatcher::new(test.name(), factory).run(commands)
            });

        let outcome = match spawned {
            Ok(handle) => match handle.join() {
                Ok(Ok(verdict)) => Outcome::from(verdict),
                Ok(Err(err)) => {
                    error!(test = %name, error = %err, "test aborted");
                    Outcome::Errored(err.to_string())
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(test = %name, %message, "test thread panicked");
                    Outcome::Errored(message)
                }
            },
            Err(err) => {
                error!(test = %name, error = %err, "failed to spawn test thread");
                Outcome::Errored(err.to_string())
            }
        };

        let report = TestReport {
            name,
            outcome,
            elapsed: start.elapsed(),
        };
        self.reporter.test_finished(&report);
        Some(report)
    }

    fn should_run(&self, name: &str) -> bool {
        self.allow_list.is_empty() || self.allow_list.iter().any(|allowed| allowed == name)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "test thread panicked".to_string()
    }
}
