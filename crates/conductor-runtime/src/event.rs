//! FSM states and the events the dispatcher publishes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::intent::Intent;

pub const KIND_INTENT_ACCEPTED: &str = "intent.accepted";
pub const KIND_TRANSITION: &str = "fsm.transition";

/// Dispatch lifecycle of one intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Accepted,
    Planned,
    Running,
    Done,
    Failed,
}

impl State {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Planned => "planned",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the dispatch trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: String,
    pub intent_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<State>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<State>,
    pub path: String,
    pub method: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub schedule: String,
    #[serde(default)]
    pub command: String,
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
}

impl Event {
    fn base(kind: &str, intent: &Intent) -> Self {
        Self {
            kind: kind.to_string(),
            intent_id: intent.id,
            from: None,
            to: None,
            path: intent.path.clone(),
            method: intent.method.clone(),
            message: String::new(),
            schedule: intent.job_schedule(),
            command: intent.job_command(),
            time: Utc::now(),
            meta: BTreeMap::new(),
        }
    }

    pub fn accepted(intent: &Intent) -> Self {
        Self::base(KIND_INTENT_ACCEPTED, intent)
    }

    pub fn transition(intent: &Intent, from: State, to: State, message: &str) -> Self {
        let mut event = Self::base(KIND_TRANSITION, intent);
        event.from = Some(from);
        event.to = Some(to);
        event.message = message.to_string();
        event
    }

    pub fn with_meta(mut self, key: &str, value: impl ToString) -> Self {
        self.meta.insert(key.to_string(), value.to_string());
        self
    }

    pub fn is_transition(&self, from: State, to: State) -> bool {
        self.from == Some(from) && self.to == Some(to)
    }

    /// Flat map for external sinks. `from`/`to` are empty strings on
    /// non-transition events; `timestamp` is unix nanoseconds as a string.
    pub fn to_map(&self) -> Map<String, Value> {
        let state = |s: Option<State>| s.map(State::as_str).unwrap_or_default();
        let nanos = self
            .time
            .timestamp_nanos_opt()
            .unwrap_or_else(|| self.time.timestamp_micros().saturating_mul(1_000));

        let mut map = Map::new();
        map.insert("kind".into(), self.kind.clone().into());
        map.insert("intent_id".into(), self.intent_id.to_string().into());
        map.insert("from".into(), state(self.from).into());
        map.insert("to".into(), state(self.to).into());
        map.insert("path".into(), self.path.clone().into());
        map.insert("method".into(), self.method.clone().into());
        map.insert("message".into(), self.message.clone().into());
        map.insert("schedule".into(), self.schedule.clone().into());
        map.insert("command".into(), self.command.clone().into());
        map.insert("time".into(), self.time.to_rfc3339().into());
        map.insert("timestamp".into(), nanos.to_string().into());
        map.insert(
            "meta".into(),
            Value::Object(
                self.meta
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect(),
            ),
        );
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_event() {
        let intent = Intent::new("POST", "/api/jobs")
            .with_body(serde_json::json!({"schedule": "0 * * * *", "command": "ls"}));
        let event = Event::transition(&intent, State::Running, State::Done, "ok")
            .with_meta("job_id", "abc");

        assert_eq!(event.kind, KIND_TRANSITION);
        assert!(event.is_transition(State::Running, State::Done));
        assert!(!event.is_transition(State::Planned, State::Running));
        assert_eq!(event.schedule, "0 * * * *");
        assert_eq!(event.command, "ls");
        assert_eq!(event.meta["job_id"], "abc");
    }

    #[test]
    fn test_to_map_shape() {
        let intent = Intent::new("GET", "/api/tasks");
        let event = Event::accepted(&intent);
        let map = event.to_map();

        for key in [
            "kind", "intent_id", "from", "to", "path", "method", "message", "schedule",
            "command", "time", "timestamp", "meta",
        ] {
            assert!(map.contains_key(key), "missing {key}");
        }
        assert_eq!(map["kind"], KIND_INTENT_ACCEPTED);
        assert_eq!(map["from"], "");
        assert_eq!(map["intent_id"], intent.id.to_string());

        let time = map["time"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(time).is_ok());
        let nanos: i64 = map["timestamp"].as_str().unwrap().parse().unwrap();
        assert_eq!(nanos, event.time.timestamp_nanos_opt().unwrap());
    }

    #[test]
    fn test_state_serde() {
        assert_eq!(serde_json::to_string(&State::Planned).unwrap(), "\"planned\"");
        assert_eq!(State::Failed.to_string(), "failed");
    }
}
