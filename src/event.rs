//! The normalized event model and the raw-entry-to-event mapping.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

/// Journal field holding the container id, when the entry came from a container.
pub const CONTAINER_ID_FIELD: &str = "CONTAINER_ID";
/// Journal field holding the container tag.
pub const CONTAINER_TAG_FIELD: &str = "CONTAINER_TAG";
/// Syslog identifier tag of host process entries.
pub const TAG_FIELD: &str = "SYSLOG_IDENTIFIER";
/// Originating process id.
pub const PROCESS_FIELD: &str = "_PID";
pub const HOST_NAME_FIELD: &str = "_HOST_NAME";
pub const MESSAGE_FIELD: &str = "MESSAGE";
pub const PRIORITY_FIELD: &str = "PRIORITY";
/// Timestamp recorded by the origin of the entry, microseconds since epoch.
pub const TIMESTAMP_FIELD: &str = "_SOURCE_REALTIME_TIMESTAMP";
/// Journal field matched by unit filters.
pub const SYSTEMD_UNIT_FIELD: &str = "_SYSTEMD_UNIT";

/// Fields carried on every event; these stay top-level even when the
/// metadata move is configured.
const COMMON_FIELDS: [&str; 3] = [HOST_NAME_FIELD, MESSAGE_FIELD, PRIORITY_FIELD];

/// A record read from the journal source: an opaque cursor, the arrival
/// timestamp in microseconds since epoch, and the entry's fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawEntry {
    pub cursor: String,
    pub realtime_usec: u64,
    pub fields: BTreeMap<String, String>,
}

/// A normalized event: a JSON object published verbatim to the sinks.
pub type Event = Map<String, Value>;

/// Options applied by [`normalize`].
#[derive(Debug, Clone, Default)]
pub struct NormalizeOptions {
    pub clean_field_names: bool,
    pub convert_to_numbers: bool,
    /// Dot-separated sub-path for non-common fields; empty disables the move.
    pub move_metadata_location: String,
    /// Value of the `input_type` key.
    pub default_type: String,
}

/// Map a raw journal entry onto the event schema.
///
/// Never fails: missing fields produce absent keys. Container entries (those
/// with a `CONTAINER_ID` field) carry the container tag and id and get
/// `type: "container"`; host process entries carry the syslog identifier and
/// pid and get the identifier as their `type`. `logBufferingType` is the
/// reassembly grouping key: container id if present, else the pid.
pub fn normalize(entry: &RawEntry, opts: &NormalizeOptions) -> Event {
    let is_container = entry.fields.contains_key(CONTAINER_ID_FIELD);
    let selected: [&str; 5] = if is_container {
        [
            HOST_NAME_FIELD,
            MESSAGE_FIELD,
            PRIORITY_FIELD,
            CONTAINER_TAG_FIELD,
            CONTAINER_ID_FIELD,
        ]
    } else {
        [
            HOST_NAME_FIELD,
            MESSAGE_FIELD,
            PRIORITY_FIELD,
            TAG_FIELD,
            PROCESS_FIELD,
        ]
    };

    let mut event = Event::new();
    for field in selected {
        let Some(value) = entry.fields.get(field) else {
            continue;
        };
        let key = output_key(field, opts.clean_field_names);
        let value = if opts.convert_to_numbers {
            convert_number(value)
        } else {
            Value::String(value.clone())
        };

        if !opts.move_metadata_location.is_empty() && !COMMON_FIELDS.contains(&field) {
            insert_at_path(&mut event, &opts.move_metadata_location, key, value);
        } else {
            event.insert(key, value);
        }
    }

    let (event_type, buffering_type) = if is_container {
        (
            "container".to_string(),
            entry
                .fields
                .get(CONTAINER_ID_FIELD)
                .cloned()
                .unwrap_or_default(),
        )
    } else {
        (
            entry.fields.get(TAG_FIELD).cloned().unwrap_or_default(),
            entry.fields.get(PROCESS_FIELD).cloned().unwrap_or_default(),
        )
    };
    event.insert("type".to_string(), Value::String(event_type));
    event.insert(
        "logBufferingType".to_string(),
        Value::String(buffering_type),
    );
    event.insert("input_type".to_string(), Value::String(opts.default_type.clone()));
    event.insert("cursor".to_string(), Value::String(entry.cursor.clone()));

    let utc_timestamp = entry
        .fields
        .get(TIMESTAMP_FIELD)
        .and_then(|value| value.parse::<i64>().ok())
        .unwrap_or(entry.realtime_usec as i64);
    event.insert("utcTimestamp".to_string(), Value::from(utc_timestamp));

    event
}

/// The `message` value of an event, empty when absent or non-string.
pub fn message(event: &Event) -> &str {
    event
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
}

/// The `logBufferingType` value of an event, empty when absent.
pub fn buffering_type(event: &Event) -> &str {
    event
        .get("logBufferingType")
        .and_then(Value::as_str)
        .unwrap_or_default()
}

/// The `cursor` value of an event, empty when absent.
pub fn cursor(event: &Event) -> &str {
    event
        .get("cursor")
        .and_then(Value::as_str)
        .unwrap_or_default()
}

/// The `utcTimestamp` value of an event, in microseconds since epoch.
pub fn utc_timestamp(event: &Event) -> i64 {
    event
        .get("utcTimestamp")
        .and_then(Value::as_i64)
        .unwrap_or_default()
}

/// The output key for a selected journal field.
///
/// Cleaning replaces characters outside `[A-Za-z0-9_]` with `_` and strips
/// leading underscores. Names are then lowercased; without cleaning,
/// leading-underscore names (`_HOST_NAME`, `_PID`) are carried verbatim.
fn output_key(field: &str, clean: bool) -> String {
    if clean {
        clean_field_name(field).to_ascii_lowercase()
    } else if field.starts_with('_') {
        field.to_string()
    } else {
        field.to_ascii_lowercase()
    }
}

fn clean_field_name(field: &str) -> String {
    let replaced: String = field
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    replaced.trim_start_matches('_').to_string()
}

/// All-digit values become JSON integers; anything else stays a string.
fn convert_number(value: &str) -> Value {
    if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(n) = value.parse::<u64>() {
            return Value::from(n);
        }
    }
    Value::String(value.to_string())
}

/// Insert `key: value` under the dot-separated `path`, creating nested
/// objects as needed. A non-object value on the path is replaced.
fn insert_at_path(event: &mut Event, path: &str, key: String, value: Value) {
    let mut node = event;
    for segment in path.split('.') {
        let slot = node
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        node = slot.as_object_mut().expect("slot was just made an object");
    }
    node.insert(key, value);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container_entry() -> RawEntry {
        RawEntry {
            cursor: "s=abc;i=1".to_string(),
            realtime_usec: 1_700_000_000_000_000,
            fields: BTreeMap::from([
                (CONTAINER_ID_FIELD.to_string(), "deadbeef".to_string()),
                (CONTAINER_TAG_FIELD.to_string(), "docker-abc".to_string()),
                (MESSAGE_FIELD.to_string(), "hello".to_string()),
                (PRIORITY_FIELD.to_string(), "6".to_string()),
                (HOST_NAME_FIELD.to_string(), "node-1".to_string()),
            ]),
        }
    }

    fn process_entry() -> RawEntry {
        RawEntry {
            cursor: "s=def;i=2".to_string(),
            realtime_usec: 1_700_000_000_000_001,
            fields: BTreeMap::from([
                (TAG_FIELD.to_string(), "sshd".to_string()),
                (PROCESS_FIELD.to_string(), "4242".to_string()),
                (MESSAGE_FIELD.to_string(), "accepted".to_string()),
                (PRIORITY_FIELD.to_string(), "5".to_string()),
                (HOST_NAME_FIELD.to_string(), "node-1".to_string()),
                (
                    TIMESTAMP_FIELD.to_string(),
                    "1700000000123456".to_string(),
                ),
            ]),
        }
    }

    #[test]
    fn container_entry_schema() {
        let event = normalize(&container_entry(), &NormalizeOptions {
            default_type: "journal".to_string(),
            ..NormalizeOptions::default()
        });

        assert_eq!(event["type"], "container");
        assert_eq!(event["logBufferingType"], "deadbeef");
        assert_eq!(event["cursor"], "s=abc;i=1");
        assert_eq!(event["input_type"], "journal");
        assert_eq!(event["message"], "hello");
        assert_eq!(event["priority"], "6");
        assert_eq!(event["_HOST_NAME"], "node-1");
        assert_eq!(event["container_tag"], "docker-abc");
        assert_eq!(event["container_id"], "deadbeef");
        // No source timestamp: the arrival realtime is used.
        assert_eq!(utc_timestamp(&event), 1_700_000_000_000_000);
    }

    #[test]
    fn process_entry_schema() {
        let event = normalize(&process_entry(), &NormalizeOptions::default());

        assert_eq!(event["type"], "sshd");
        assert_eq!(event["logBufferingType"], "4242");
        assert_eq!(event["syslog_identifier"], "sshd");
        assert_eq!(event["_PID"], "4242");
        // Source timestamp is parseable and wins over the arrival realtime.
        assert_eq!(utc_timestamp(&event), 1_700_000_000_123_456);
    }

    #[test]
    fn unparseable_source_timestamp_falls_back() {
        let mut entry = process_entry();
        entry
            .fields
            .insert(TIMESTAMP_FIELD.to_string(), "not-a-number".to_string());
        let event = normalize(&entry, &NormalizeOptions::default());
        assert_eq!(utc_timestamp(&event), 1_700_000_000_000_001);
    }

    #[test]
    fn missing_fields_produce_absent_keys() {
        let entry = RawEntry {
            cursor: "s=ghi".to_string(),
            realtime_usec: 42,
            fields: BTreeMap::new(),
        };
        let event = normalize(&entry, &NormalizeOptions::default());
        assert!(!event.contains_key("message"));
        assert!(!event.contains_key("priority"));
        assert_eq!(event["type"], "");
        assert_eq!(event["logBufferingType"], "");
        assert_eq!(event["cursor"], "s=ghi");
        assert_eq!(utc_timestamp(&event), 42);
    }

    #[test]
    fn clean_field_names_strips_underscores() {
        let event = normalize(&process_entry(), &NormalizeOptions {
            clean_field_names: true,
            ..NormalizeOptions::default()
        });
        assert_eq!(event["host_name"], "node-1");
        assert_eq!(event["pid"], "4242");
        assert!(!event.contains_key("_HOST_NAME"));
        assert!(!event.contains_key("_PID"));
    }

    #[test]
    fn convert_to_numbers() {
        let event = normalize(&process_entry(), &NormalizeOptions {
            convert_to_numbers: true,
            ..NormalizeOptions::default()
        });
        assert_eq!(event["priority"], 5);
        assert_eq!(event["_PID"], 4242);
        assert_eq!(event["message"], "accepted");
    }

    #[test]
    fn metadata_move_keeps_common_fields_top_level() {
        let event = normalize(&container_entry(), &NormalizeOptions {
            move_metadata_location: "journal.meta".to_string(),
            ..NormalizeOptions::default()
        });

        assert_eq!(event["message"], "hello");
        assert_eq!(event["priority"], "6");
        assert_eq!(event["_HOST_NAME"], "node-1");
        assert!(!event.contains_key("container_tag"));
        assert_eq!(event["journal"]["meta"]["container_tag"], "docker-abc");
        assert_eq!(event["journal"]["meta"]["container_id"], "deadbeef");
        // The reserved keys never move.
        assert_eq!(event["type"], "container");
        assert_eq!(event["cursor"], "s=abc;i=1");
    }
}
