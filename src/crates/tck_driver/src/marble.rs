//! Marble notation for the outbound side of a channel.
//!
//! `-a-b-c|` emits `a`, `b`, `c` and completes; `#` emits an error. An optional value
//! map follows `&&` as JSON, e.g. `-a-b|&&{"a":{"hello":"goodbye"}}`, mapping a marble
//! character to a single `data: metadata` pair. Characters without an entry emit a
//! payload whose data and metadata are the character itself.

use std::collections::{BTreeMap, HashMap};

use crate::error::{DriverError, DriverResult};
use crate::reactive::Payload;

const TICK: char = '-';
const COMPLETE: char = '|';
const ERROR: char = '#';
const VALUE_MAP_DELIMITER: &str = "&&";

/// One step of a marble sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarbleEvent {
    Next(Payload),
    Complete,
    Error(String),
}

/// Parsed marble sequence, ready to be played by a channel driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marble {
    events: Vec<MarbleEvent>,
}

impl Marble {
    /// Parse `text`, including an optional value map after `&&`.
    pub fn parse(text: &str) -> DriverResult<Self> {
        let (sequence, values) = match text.split_once(VALUE_MAP_DELIMITER) {
            Some((sequence, map)) => {
                let values: HashMap<String, BTreeMap<String, String>> =
                    serde_json::from_str(map).map_err(|source| DriverError::MarbleValueMap {
                        map: map.to_string(),
                        source,
                    })?;
                (sequence, values)
            }
            None => (text, HashMap::new()),
        };

        let mut events = Vec::new();
        for symbol in sequence.chars() {
            match symbol {
                TICK => {}
                COMPLETE => events.push(MarbleEvent::Complete),
                ERROR => events.push(MarbleEvent::Error(format!("marble error in {sequence}"))),
                symbol if symbol.is_whitespace() => {}
                symbol => {
                    let key = symbol.to_string();
                    let payload = values
                        .get(&key)
                        .and_then(|pair| pair.iter().next())
                        .map(|(data, metadata)| Payload::new(data.as_str(), metadata.as_str()))
                        .unwrap_or_else(|| Payload::new(key.as_str(), key.as_str()));
                    events.push(MarbleEvent::Next(payload));
                }
            }
        }

        Ok(Self { events })
    }

    /// Events in emission order.
    pub fn events(&self) -> &[MarbleEvent] {
        &self.events
    }
}
