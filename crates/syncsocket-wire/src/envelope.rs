//! Envelope - the unit of message exchange
//!
//! Envelopes are transient: built, sent or consumed, then dropped.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use syncsocket_core::{ChannelId, ChannelState, RemoteTime, SyncSocketError, SyncSocketResult};

use crate::{service_topic, user_topic, Route, ServiceOp};

/// Header carrying the remote absolute fire time of a `schedule` envelope
pub const TIMETICKET_HEADER: &str = "x-cct-timeticket";

/// Envelope headers
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(BTreeMap<String, Value>);

impl Headers {
    pub fn new() -> Self {
        Headers(BTreeMap::new())
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.0.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Remote fire time, if present and integral.
    /// Integer-valued strings are accepted as well as numbers.
    pub fn timeticket(&self) -> Option<RemoteTime> {
        let millis = match self.get(TIMETICKET_HEADER)? {
            Value::Number(n) => n.as_i64()?,
            Value::String(s) => s.trim().parse::<i64>().ok()?,
            _ => return None,
        };
        Some(RemoteTime::from_millis(millis))
    }

    pub fn set_timeticket(&mut self, ticket: RemoteTime) {
        self.insert(TIMETICKET_HEADER, Value::from(ticket.as_millis()));
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Message exchanged with the server
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub channel_id: ChannelId,
    pub topic: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,
}

impl Envelope {
    pub fn new(channel_id: ChannelId, topic: impl Into<String>, data: Value) -> Self {
        Envelope {
            channel_id,
            topic: topic.into(),
            data,
            headers: None,
        }
    }

    /// Outbound application message `user.<topic>`
    pub fn user(channel_id: ChannelId, topic: &str, data: Value) -> Self {
        Envelope::new(channel_id, user_topic(topic), data)
    }

    /// Service message `service.<op>`
    pub fn service(channel_id: ChannelId, op: ServiceOp<'_>, data: Value) -> Self {
        Envelope::new(channel_id, service_topic(op), data)
    }

    /// `service.reportstate` carrying `{toState}`
    pub fn report_state(channel_id: ChannelId, state: ChannelState) -> Self {
        Envelope::service(
            channel_id,
            ServiceOp::ReportState,
            json!({ "toState": state.as_str() }),
        )
    }

    pub fn with_header(mut self, name: impl Into<String>, value: Value) -> Self {
        self.headers.get_or_insert_with(Headers::new).insert(name, value);
        self
    }

    pub fn with_timeticket(mut self, ticket: RemoteTime) -> Self {
        self.headers
            .get_or_insert_with(Headers::new)
            .set_timeticket(ticket);
        self
    }

    pub fn timeticket(&self) -> Option<RemoteTime> {
        self.headers.as_ref()?.timeticket()
    }

    /// Classify this envelope's topic
    pub fn route(&self) -> Route<'_> {
        Route::parse(&self.topic)
    }

    /// State carried by a `service.reportstate` envelope
    pub fn reported_state(&self) -> Option<ChannelState> {
        match self.route() {
            Route::Service(ServiceOp::ReportState) => {
                self.data.get("toState")?.as_str()?.parse().ok()
            }
            _ => None,
        }
    }

    pub fn to_json(&self) -> SyncSocketResult<String> {
        serde_json::to_string(self).map_err(|e| SyncSocketError::InvalidEnvelope(e.to_string()))
    }

    pub fn from_json(text: &str) -> SyncSocketResult<Self> {
        serde_json::from_str(text).map_err(|e| SyncSocketError::InvalidEnvelope(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Phase;

    #[test]
    fn test_wire_field_names() {
        let envelope = Envelope::user(ChannelId::new("lobby"), "hey", json!({"go": true}));
        let value: Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();

        assert_eq!(value["channelId"], "lobby");
        assert_eq!(value["topic"], "user.hey");
        assert_eq!(value["data"]["go"], true);
        assert!(value.get("headers").is_none());
    }

    #[test]
    fn test_parse_inbound_schedule() {
        let text = r#"{
            "channelId": "lobby",
            "topic": "user.hey.schedule",
            "data": {"n": 1},
            "headers": {"x-cct-timeticket": 1700000000123}
        }"#;
        let envelope = Envelope::from_json(text).unwrap();

        assert_eq!(
            envelope.route(),
            Route::Control {
                topic: "hey",
                phase: Phase::Schedule
            }
        );
        assert_eq!(
            envelope.timeticket(),
            Some(RemoteTime::from_millis(1_700_000_000_123))
        );
    }

    #[test]
    fn test_missing_data_defaults_to_null() {
        let envelope =
            Envelope::from_json(r#"{"channelId":"c","topic":"service.synchronize"}"#).unwrap();
        assert_eq!(envelope.data, Value::Null);
    }

    #[test]
    fn test_timeticket_forms() {
        let base = Envelope::new(ChannelId::new("c"), "user.t.schedule", Value::Null);

        assert_eq!(base.timeticket(), None);
        assert_eq!(
            base.clone().with_header(TIMETICKET_HEADER, json!("42")).timeticket(),
            Some(RemoteTime::from_millis(42))
        );
        assert_eq!(
            base.clone().with_header(TIMETICKET_HEADER, json!(4.5)).timeticket(),
            None
        );
        assert_eq!(
            base.clone().with_header(TIMETICKET_HEADER, json!("soon")).timeticket(),
            None
        );
        assert_eq!(
            base.with_timeticket(RemoteTime::from_millis(-7)).timeticket(),
            Some(RemoteTime::from_millis(-7))
        );
    }

    #[test]
    fn test_report_state() {
        let envelope = Envelope::report_state(ChannelId::new("c"), ChannelState::Scheduled);

        assert_eq!(envelope.topic, "service.reportstate");
        assert_eq!(envelope.data, json!({"toState": "scheduled"}));
        assert_eq!(envelope.reported_state(), Some(ChannelState::Scheduled));
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            Envelope::from_json("{\"topic\": 3}"),
            Err(SyncSocketError::InvalidEnvelope(_))
        ));
    }
}
