use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{DriverError, DriverResult};

/// Host and port of the peer under test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host name or address; resolved on every connect.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Endpoint {
    /// Endpoint for `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a `tcp://host:port[/path]` uri. The path is ignored.
    pub fn parse_uri(uri: &str) -> DriverResult<Self> {
        let rest = uri
            .strip_prefix("tcp://")
            .ok_or_else(|| DriverError::unsupported_uri(uri))?;
        let authority = rest.split('/').next().unwrap_or_default();
        let (host, port) = authority
            .rsplit_once(':')
            .ok_or_else(|| DriverError::unsupported_uri(uri))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(DriverError::unsupported_uri(uri));
        }
        let port = port
            .parse()
            .map_err(|_| DriverError::unsupported_uri(uri))?;
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp://{}:{}", self.host, self.port)
    }
}

/// Everything needed to run a script against a live peer.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Script to run.
    pub script_path: PathBuf,
    /// Peer to connect every interaction to.
    pub endpoint: Endpoint,
    /// Names of the tests to run; empty runs every test.
    pub tests: Vec<String>,
    /// Enables wire logging of every frame sent and received.
    pub debug: bool,
    /// Upper bound on establishing each connection.
    pub connect_timeout: Duration,
}

impl DriverConfig {
    /// Run every test in `script_path` against `endpoint`, with a five second connect timeout.
    pub fn new(script_path: impl Into<PathBuf>, endpoint: Endpoint) -> Self {
        Self {
            script_path: script_path.into(),
            endpoint,
            tests: Vec::new(),
            debug: false,
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// Restrict the run to a named test. May be called repeatedly.
    pub fn with_test(mut self, name: impl Into<String>) -> Self {
        self.tests.push(name.into());
        self
    }

    /// Restrict the run to each of `names`, in addition to any already selected.
    pub fn with_tests<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tests.extend(names.into_iter().map(Into::into));
        self
    }

    /// Turn wire logging on or off.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Bound each connection attempt by `timeout`.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}
