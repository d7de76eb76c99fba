//! The decoded event value.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::error::{EventError, Result};
use crate::params;
use crate::types::EventType;

/// One decoded switch event: a typed event type, the per-source sequence
/// number, and the raw attribute set for everything else.
///
/// Attribute values arrive as strings or numbers depending on the publisher;
/// the typed accessors accept either.
#[derive(Debug, Clone)]
pub struct Event {
    event_type: EventType,
    sequence: u64,
    details: HashMap<String, Value>,
}

impl Event {
    /// Build an event from a decoded attribute map.
    ///
    /// Fails if the event-type attribute is missing or names an unknown type;
    /// a missing sequence defaults to 0.
    pub fn new(details: HashMap<String, Value>) -> Result<Self> {
        let name = details
            .get(params::EVENT_NAME)
            .and_then(Value::as_str)
            .ok_or(EventError::MissingType)?;
        let event_type: EventType = name.parse()?;
        let sequence = int_value(details.get(params::EVENT_SEQUENCE)).unwrap_or(0);
        Ok(Self {
            event_type,
            sequence,
            details,
        })
    }

    /// Decode an event from a raw transport payload (JSON attribute map).
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let details: HashMap<String, Value> = serde_json::from_slice(payload)
            .map_err(|e| EventError::Malformed(e.to_string()))?;
        Self::new(details)
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    /// Monotonically increasing per-source sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn details(&self) -> &HashMap<String, Value> {
        &self.details
    }

    // ----- typed accessors -----

    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.details.get(key).and_then(Value::as_str)
    }

    pub fn int_param(&self, key: &str) -> Option<i64> {
        match self.details.get(key)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn int_param_or(&self, key: &str, default: i64) -> i64 {
        self.int_param(key).unwrap_or(default)
    }

    pub fn f64_param(&self, key: &str) -> Option<f64> {
        match self.details.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn f64_param_or(&self, key: &str, default: f64) -> f64 {
        self.f64_param(key).unwrap_or(default)
    }

    /// A parameter that must be present for the event to make sense.
    pub fn required_param(&self, key: &'static str) -> Result<&str> {
        self.str_param(key).ok_or(EventError::MissingParam(key))
    }

    // ----- switch identity -----

    /// Identifier of the switch node that emitted the event.
    pub fn switch_node_id(&self) -> Option<&str> {
        self.str_param(params::CORE_UUID)
    }

    pub fn switch_hostname(&self) -> Option<&str> {
        self.str_param(params::SWITCH_HOSTNAME)
    }

    pub fn switch_ip(&self) -> Option<&str> {
        self.str_param(params::SWITCH_IPV4)
    }

    /// Event timestamp. The switch reports epoch microseconds.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        let micros = self.int_param(params::EVENT_DATE_TIMESTAMP)?;
        Utc.timestamp_micros(micros).single()
    }

    /// Channel variables reported with this event, stripped of their prefix.
    pub fn channel_variables(&self) -> impl Iterator<Item = (&str, &str)> {
        self.details.iter().filter_map(|(k, v)| {
            let name = k.strip_prefix(params::VARIABLE_PREFIX)?;
            Some((name, v.as_str()?))
        })
    }
}

fn int_value(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(event_name: &str, sequence: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "Event-Name": event_name,
            "Event-Sequence": sequence,
            "Core-UUID": "node-1",
            "FreeSWITCH-Hostname": "sw01",
            "Unique-ID": "ch-1",
            "Session-Count": 12,
            "Idle-CPU": "97.5",
            "Event-Date-Timestamp": "1742890687234535",
        }))
        .unwrap()
    }

    #[test]
    fn decodes_type_and_sequence() {
        let ev = Event::from_payload(&payload("CHANNEL_ANSWER", "42")).unwrap();
        assert_eq!(ev.event_type(), EventType::ChannelAnswer);
        assert_eq!(ev.sequence(), 42);
        assert_eq!(ev.switch_node_id(), Some("node-1"));
    }

    #[test]
    fn numeric_params_accept_strings_and_numbers() {
        let ev = Event::from_payload(&payload("HEARTBEAT", "7")).unwrap();
        assert_eq!(ev.int_param(crate::params::SESSION_COUNT), Some(12));
        assert_eq!(ev.f64_param(crate::params::IDLE_CPU), Some(97.5));
        assert_eq!(ev.int_param_or("No-Such", 3), 3);
    }

    #[test]
    fn timestamp_parses_epoch_micros() {
        let ev = Event::from_payload(&payload("HEARTBEAT", "7")).unwrap();
        let ts = ev.timestamp().unwrap();
        assert_eq!(ts.timestamp(), 1_742_890_687);
    }

    #[test]
    fn missing_type_is_terminal() {
        let bad = serde_json::to_vec(&json!({"Event-Sequence": "1"})).unwrap();
        assert!(matches!(
            Event::from_payload(&bad),
            Err(EventError::MissingType)
        ));
    }

    #[test]
    fn unknown_type_is_terminal() {
        let bad = serde_json::to_vec(&json!({"Event-Name": "MYSTERY"})).unwrap();
        assert!(matches!(
            Event::from_payload(&bad),
            Err(EventError::UnknownType(_))
        ));
    }

    #[test]
    fn garbage_payload_is_malformed() {
        assert!(matches!(
            Event::from_payload(b"not json"),
            Err(EventError::Malformed(_))
        ));
    }

    #[test]
    fn channel_variables_are_stripped() {
        let raw = serde_json::to_vec(&json!({
            "Event-Name": "CHANNEL_CREATE",
            "variable_direction": "outbound",
            "variable_correlation_id": "abc",
            "Unique-ID": "ch-1",
        }))
        .unwrap();
        let ev = Event::from_payload(&raw).unwrap();
        let vars: HashMap<_, _> = ev.channel_variables().collect();
        assert_eq!(vars.get("direction"), Some(&"outbound"));
        assert_eq!(vars.get("correlation_id"), Some(&"abc"));
        assert!(!vars.contains_key("Unique-ID"));
    }

    #[test]
    fn missing_required_param_reports_name() {
        let ev = Event::from_payload(&payload("DTMF", "9")).unwrap();
        assert!(matches!(
            ev.required_param(crate::params::DTMF_DIGIT),
            Err(EventError::MissingParam("DTMF-Digit"))
        ));
    }
}
