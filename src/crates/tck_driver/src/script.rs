//! Test script format.
//!
//! ```text
//! !
//! name%%streamTest
//! subscribe%%rs%%s1%%a%%b
//! request%%3%%s1
//! await%%atLeast%%s1%%3
//! assert%%received%%s1%%a,b&&a,b&&a,b
//! !
//! name%%channelTest
//! channel%%a%%b
//! {
//!     respond%%-c-d|
//!     await%%atLeast%%ch%%1
//! }
//! ```
//!
//! Tests are separated by `!` lines and the text before the first separator is ignored.
//! The first line of every test carries its name; the remaining lines are commands whose
//! tokens are separated by `%%`.

use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{DriverError, DriverResult};
use crate::marble::Marble;
use crate::reactive::Payload;

/// Line separating tests.
pub const TEST_SEPARATOR: &str = "!";
/// Separates the tokens of a command line.
pub const TOKEN_DELIMITER: &str = "%%";
/// Opens a channel block.
pub const BLOCK_OPEN: &str = "{";
/// Closes a channel block.
pub const BLOCK_CLOSE: &str = "}";
/// Separates expected pairs in `assert received`.
pub const VALUE_DELIMITER: &str = "&&";
/// Separates data from metadata in an expected pair.
pub const PAIR_DELIMITER: char = ',';

/// Interaction model selected by a `subscribe` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InteractionKind {
    RequestResponse,
    RequestStream,
    RequestSubscription,
    FireAndForget,
}

impl InteractionKind {
    /// Kind named by a `subscribe` token: `rr`, `rs`, `sub` or `fnf`.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "rr" => Some(Self::RequestResponse),
            "rs" => Some(Self::RequestStream),
            "sub" => Some(Self::RequestSubscription),
            "fnf" => Some(Self::FireAndForget),
            _ => None,
        }
    }

    /// Human-readable name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestResponse => "request-response",
            Self::RequestStream => "request-stream",
            Self::RequestSubscription => "request-subscription",
            Self::FireAndForget => "fire-and-forget",
        }
    }
}

impl fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Blocking condition of an `await` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Wait {
    Terminal,
    AtLeast(u64),
    NoEvents(Duration),
}

/// Predicate of an `assert` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Check {
    NoError,
    Error,
    Completed,
    NoCompleted,
    Canceled,
    Received(Vec<Payload>),
    ReceivedN(u64),
    ReceivedAtLeast(u64),
}

/// One parsed script line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Subscribe {
        kind: InteractionKind,
        id: String,
        payload: Payload,
    },
    Channel {
        initial: Payload,
        script: Vec<Command>,
    },
    EchoChannel {
        initial: Payload,
    },
    Await {
        id: String,
        wait: Wait,
    },
    Assert {
        id: String,
        check: Check,
    },
    Take {
        n: u64,
        id: String,
    },
    Request {
        n: u64,
        id: String,
    },
    Cancel {
        id: String,
    },
    Respond {
        marble: Marble,
    },
    Eof,
    Pass,
    Fail,
    Unknown(String),
    Malformed {
        line: String,
        reason: String,
    },
}

impl Command {
    fn malformed(line: &str, reason: impl Into<String>) -> Self {
        Command::Malformed {
            line: line.to_string(),
            reason: reason.into(),
        }
    }
}

/// Ordered collection of tests read from one script.
#[derive(Debug, Clone, Default)]
pub struct TestScript {
    tests: Vec<TestCase>,
}

impl TestScript {
    /// Read and split a script file.
    pub fn load(path: impl AsRef<Path>) -> DriverResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| DriverError::ScriptRead {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::parse(&text))
    }

    /// Split script text into tests. Segments without any non-blank line are dropped.
    pub fn parse(text: &str) -> Self {
        let mut segments: Vec<Vec<String>> = vec![Vec::new()];
        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            if line.trim() == TEST_SEPARATOR {
                segments.push(Vec::new());
            } else if let Some(current) = segments.last_mut() {
                current.push(line.to_string());
            }
        }

        let tests = segments
            .into_iter()
            .skip(1)
            .filter(|lines| lines.iter().any(|line| !line.trim().is_empty()))
            .map(TestCase::new)
            .collect();
        Self { tests }
    }

    /// Tests in script order.
    pub fn tests(&self) -> &[TestCase] {
        &self.tests
    }

    /// Number of tests.
    pub fn len(&self) -> usize {
        self.tests.len()
    }

    /// True for a script without tests.
    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }
}

impl IntoIterator for TestScript {
    type Item = TestCase;
    type IntoIter = std::vec::IntoIter<TestCase>;

    fn into_iter(self) -> Self::IntoIter {
        self.tests.into_iter()
    }
}

/// A single test: its name line followed by command lines, unparsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    name: String,
    lines: Vec<String>,
}

impl TestCase {
    /// Test from the lines of one segment; the name comes from the first non-blank line.
    pub fn new(lines: Vec<String>) -> Self {
        let lines: Vec<String> = lines
            .into_iter()
            .skip_while(|line| line.trim().is_empty())
            .collect();
        let name = lines
            .first()
            .and_then(|line| line.trim().split(TOKEN_DELIMITER).nth(1))
            .unwrap_or_default()
            .to_string();
        Self { name, lines }
    }

    /// Second token of the name line, or empty.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw lines, name line first.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Parse every line after the name line.
    pub fn commands(&self) -> Vec<Command> {
        let mut lines = self.lines.iter().skip(1).map(String::as_str);
        let (commands, _) = parse_block(&mut lines, false);
        commands
    }
}

/// Parse lines until the input ends or, inside a channel block, until `}`. The flag
/// reports whether a closing marker was seen.
fn parse_block<'a, I>(lines: &mut I, nested: bool) -> (Vec<Command>, bool)
where
    I: Iterator<Item = &'a str>,
{
    let mut commands = Vec::new();
    while let Some(raw) = lines.next() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if line == BLOCK_CLOSE {
            if nested {
                return (commands, true);
            }
            commands.push(Command::malformed(line, "closing marker outside a channel block"));
            continue;
        }
        if line == BLOCK_OPEN && nested {
            continue;
        }

        let tokens: Vec<&str> = line.split(TOKEN_DELIMITER).collect();
        if tokens[0] == "channel" {
            if nested {
                commands.push(Command::malformed(line, "channel blocks cannot be nested"));
                continue;
            }
            let (script, closed) = parse_block(lines, true);
            let command = if !closed {
                Command::malformed(line, "channel block is missing its closing marker")
            } else {
                match payload_at(&tokens, 1) {
                    Ok(initial) => Command::Channel { initial, script },
                    Err(reason) => Command::malformed(line, reason),
                }
            };
            commands.push(command);
            continue;
        }

        commands.push(parse_command(line, &tokens));
    }
    (commands, false)
}

fn parse_command(line: &str, tokens: &[&str]) -> Command {
    let parsed = match tokens[0] {
        "subscribe" => parse_subscribe(tokens),
        "echochannel" => payload_at(tokens, 1).map(|initial| Command::EchoChannel { initial }),
        "await" => match tokens.get(1).copied() {
            Some("terminal") => arg(tokens, 2, "id").map(|id| Command::Await {
                id: id.to_string(),
                wait: Wait::Terminal,
            }),
            Some("atLeast") => id_and_number(tokens).map(|(id, n)| Command::Await {
                id,
                wait: Wait::AtLeast(n),
            }),
            Some("no_events") => id_and_number(tokens).map(|(id, ms)| Command::Await {
                id,
                wait: Wait::NoEvents(Duration::from_millis(ms)),
            }),
            _ => Ok(Command::Unknown(line.to_string())),
        },
        "assert" => parse_assert(line, tokens),
        "take" => count_and_id(tokens).map(|(n, id)| Command::Take { n, id }),
        "request" => count_and_id(tokens).map(|(n, id)| Command::Request { n, id }),
        "cancel" => arg(tokens, 1, "id").map(|id| Command::Cancel { id: id.to_string() }),
        "respond" => arg(tokens, 1, "marble").and_then(|text| {
            Marble::parse(text)
                .map(|marble| Command::Respond { marble })
                .map_err(|err| err.to_string())
        }),
        "EOF" => Ok(Command::Eof),
        "pass" => Ok(Command::Pass),
        "fail" => Ok(Command::Fail),
        _ => Ok(Command::Unknown(line.to_string())),
    };
    parsed.unwrap_or_else(|reason| Command::malformed(line, reason))
}

fn parse_subscribe(tokens: &[&str]) -> Result<Command, String> {
    let kind_token = arg(tokens, 1, "interaction kind")?;
    let kind = InteractionKind::from_token(kind_token)
        .ok_or_else(|| format!("unknown interaction kind {kind_token:?}"))?;
    let id = arg(tokens, 2, "id")?.to_string();
    let payload = payload_at(tokens, 3)?;
    Ok(Command::Subscribe { kind, id, payload })
}

fn parse_assert(line: &str, tokens: &[&str]) -> Result<Command, String> {
    let check = match tokens.get(1).copied() {
        Some("no_error") => Check::NoError,
        Some("error") => Check::Error,
        Some("completed") => Check::Completed,
        Some("no_completed") => Check::NoCompleted,
        Some("canceled") => Check::Canceled,
        Some("received") => Check::Received(parse_values(arg(tokens, 3, "values")?)?),
        Some("received_n") => Check::ReceivedN(number(tokens, 3, "count")?),
        Some("received_at_least") => Check::ReceivedAtLeast(number(tokens, 3, "count")?),
        _ => return Ok(Command::Unknown(line.to_string())),
    };
    let id = arg(tokens, 2, "id")?.to_string();
    Ok(Command::Assert { id, check })
}

/// Parse `d1,m1&&d2,m2` into payloads.
fn parse_values(text: &str) -> Result<Vec<Payload>, String> {
    text.split(VALUE_DELIMITER)
        .map(|pair| {
            pair.split_once(PAIR_DELIMITER)
                .map(|(data, metadata)| Payload::new(data, metadata))
                .ok_or_else(|| format!("value {pair:?} is not a data,metadata pair"))
        })
        .collect()
}

fn arg<'a>(tokens: &[&'a str], index: usize, what: &str) -> Result<&'a str, String> {
    tokens
        .get(index)
        .copied()
        .ok_or_else(|| format!("missing {what} (argument {index})"))
}

fn number(tokens: &[&str], index: usize, what: &str) -> Result<u64, String> {
    let text = arg(tokens, index, what)?;
    text.parse()
        .map_err(|_| format!("{what} {text:?} is not a non-negative integer"))
}

fn payload_at(tokens: &[&str], index: usize) -> Result<Payload, String> {
    let data = arg(tokens, index, "data")?;
    let metadata = arg(tokens, index + 1, "metadata")?;
    Ok(Payload::new(data, metadata))
}

fn id_and_number(tokens: &[&str]) -> Result<(String, u64), String> {
    let id = arg(tokens, 2, "id")?.to_string();
    Ok((id, number(tokens, 3, "count")?))
}

fn count_and_id(tokens: &[&str]) -> Result<(u64, String), String> {
    let n = number(tokens, 1, "count")?;
    Ok((n, arg(tokens, 2, "id")?.to_string()))
}
