use crate::scheduler::{Outcome, RunSummary, TestReport};

/// Sink for per-test progress lines.
pub trait Reporter: Send + Sync {
    fn test_started(&self, name: &str);
    fn test_finished(&self, report: &TestReport);
}

/// Prints human-readable result lines to stdout.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleReporter;

impl Reporter for ConsoleReporter {
    fn test_started(&self, name: &str) {
        println!("TEST STARTED: {name}");
    }

    fn test_finished(&self, report: &TestReport) {
        println!("{}", outcome_line(report));
        println!(
            "TIME: {:.3} MILLISECONDS",
            report.elapsed.as_secs_f64() * 1000.0
        );
    }
}

/// Result line for one test, e.g. `PASSED: streamTest`.
pub fn outcome_line(report: &TestReport) -> String {
    let label = match &report.outcome {
        Outcome::Passed => "PASSED",
        Outcome::Failed | Outcome::Errored(_) => "FAILED",
        Outcome::Channel { passed: true } => "CHANNEL PASSED",
        Outcome::Channel { passed: false } => "CHANNEL FAILED",
    };
    format!("{label}: {}", report.name)
}

/// Closing line summarising a whole run.
pub fn summary_line(summary: &RunSummary) -> String {
    format!(
        "{} of {} tests passed",
        summary.passed(),
        summary.reports().len()
    )
}
