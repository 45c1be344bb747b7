//! Conformance test driver for reactive request/stream/channel protocols.
//!
//! A script of named tests is parsed into commands, and each test runs on its own thread
//! against connections produced by a [`ConnectionFactory`]. Consumers record every
//! delivery and terminal signal so assertions can be evaluated at any point; channel
//! blocks run on a second thread once the outbound side has been subscribed.
//!
//! Typical usage:
//! ```no_run
//! use reactive_tck_driver::{DriverConfig, Endpoint, TckDriver};
//!
//! let config = DriverConfig::new("tests.txt", Endpoint::new("localhost", 4567))
//!     .with_test("streamTest")
//!     .with_debug(true);
//!
//! let summary = TckDriver::new(config).run().expect("script should load");
//! for report in summary.reports() {
//!     println!("{}: {:?}", report.name, report.outcome);
//! }
//! ```

mod channel;
mod config;
mod connection;
mod dispatcher;
mod driver;
mod error;
mod marble;
mod reactive;
mod report;
mod scheduler;
mod script;
mod subscriber;
pub mod transport;

pub use channel::{ChannelDriver, HandshakeGate};
pub use config::{DriverConfig, Endpoint};
pub use connection::{ConnectionFactory, ReactiveConnection};
pub use dispatcher::{Consumer, Dispatcher, Verdict, CHANNEL_INITIAL_DEMAND};
pub use driver::TckDriver;
pub use error::{DriverError, DriverResult};
pub use marble::{Marble, MarbleEvent};
pub use reactive::{BoxPublisher, Payload, Publisher, StreamError, Subscriber, Subscription};
pub use report::{outcome_line, summary_line, ConsoleReporter, Reporter};
pub use scheduler::{Outcome, RunSummary, TestReport, TestScheduler};
pub use script::{Check, Command, InteractionKind, TestCase, TestScript, Wait};
pub use subscriber::{Forward, Terminal, TestSubscriber};
