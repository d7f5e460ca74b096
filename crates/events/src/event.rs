use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::EventError;

/// The kind of change an event carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "ADD")]
    Add,
    #[serde(rename = "MODIFY")]
    Modify,
    #[serde(rename = "DELETE")]
    Delete,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(match self {
            EventType::Add => "ADD",
            EventType::Modify => "MODIFY",
            EventType::Delete => "DELETE",
        })
    }
}

/// The metadata half of an event. `event_id` is strictly monotonic per
/// source table; the sequence flags mark full-load replacement streams.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMeta {
    pub event_type: EventType,
    pub event_id: i64,
    pub dataset_id: String,
    pub table_id: String,
    #[serde(default)]
    pub full_load_sequence: bool,
    #[serde(default)]
    pub first_of_sequence: bool,
    #[serde(default)]
    pub last_of_sequence: bool,
}

/// One event: metadata plus the object's fields, possibly with nested
/// sub-objects.
#[derive(Debug, Clone)]
pub struct Event {
    pub meta: EventMeta,
    pub data: Map<String, Value>,
}

impl Event {
    /// Parse one line of the file-replay format:
    /// `<event_id>|<meta_json>|<data_json>`.
    pub fn parse_line(line: &str) -> Result<Event, EventError> {
        let mut parts = line.splitn(3, '|');
        let (Some(_event_id), Some(meta), Some(data)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(EventError::MalformedLine(line.to_string()));
        };
        let meta: EventMeta = serde_json::from_str(meta)?;
        let data: Value = serde_json::from_str(data)?;
        let Value::Object(data) = data else {
            return Err(EventError::MalformedLine(line.to_string()));
        };
        Ok(Event { meta, data })
    }
}

/// Read a whole event file, skipping blank lines.
pub fn read_events_file(path: &Path) -> Result<Vec<Event>, EventError> {
    let file = std::fs::File::open(path)?;
    let mut events = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        events.push(Event::parse_line(&line)?);
    }
    Ok(events)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_line() {
        let line = r#"1127|{"event_type": "ADD", "event_id": 1127, "dataset_id": "gebieden", "table_id": "bouwblokken"}|{"identificatie": "03630012096976", "code": "AA01"}"#;
        let event = Event::parse_line(line).unwrap();
        assert_eq!(event.meta.event_type, EventType::Add);
        assert_eq!(event.meta.event_id, 1127);
        assert!(!event.meta.full_load_sequence);
        assert_eq!(event.data["code"], "AA01");
    }

    #[test]
    fn test_parse_line_with_sequence_flags() {
        let line = r#"2|{"event_type": "ADD", "event_id": 2, "dataset_id": "gebieden", "table_id": "bouwblokken", "full_load_sequence": true, "first_of_sequence": true, "last_of_sequence": false}|{}"#;
        let event = Event::parse_line(line).unwrap();
        assert!(event.meta.full_load_sequence);
        assert!(event.meta.first_of_sequence);
        assert!(!event.meta.last_of_sequence);
    }

    #[test]
    fn test_malformed_line() {
        assert!(Event::parse_line("geen pipes hier").is_err());
    }
}
