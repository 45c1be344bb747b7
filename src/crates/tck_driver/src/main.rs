//! Command-line entry point for running a TCK script against a live peer.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use reactive_tck_driver::{summary_line, DriverConfig, DriverResult, Endpoint, TckDriver};

#[derive(Parser, Debug)]
#[command(name = "tck-driver")]
#[command(about = "Runs scripted reactive protocol interactions against a server", long_about = None)]
struct Cli {
    /// Script of tests to run
    #[arg(short, long, value_name = "FILE")]
    file: PathBuf,

    #[arg(long, default_value = "localhost", conflicts_with = "uri")]
    host: String,

    #[arg(long, default_value_t = 4567, conflicts_with = "uri")]
    port: u16,

    /// Peer address as `tcp://host:port`
    #[arg(long)]
    uri: Option<String>,

    /// Only run the named tests (comma separated, repeatable)
    #[arg(long, value_delimiter = ',')]
    tests: Vec<String>,

    /// Debug logging including every frame on the wire
    #[arg(long)]
    debug: bool,

    #[arg(long, value_name = "MS", default_value_t = 5000)]
    connect_timeout_ms: u64,
}

impl Cli {
    fn into_config(self) -> DriverResult<DriverConfig> {
        let endpoint = match &self.uri {
            Some(uri) => Endpoint::parse_uri(uri)?,
            None => Endpoint::new(self.host, self.port),
        };
        Ok(DriverConfig::new(self.file, endpoint)
            .with_tests(self.tests)
            .with_debug(self.debug)
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms)))
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Result lines go to stdout, logs to stderr.
    let default_level = if cli.debug { "debug" } else { "info" };
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .try_init();

    let result = cli
        .into_config()
        .and_then(|config| TckDriver::new(config).run());
    match result {
        Ok(summary) => {
            println!("{}", summary_line(&summary));
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
