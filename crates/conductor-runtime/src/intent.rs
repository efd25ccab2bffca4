//! Intent — an inbound request normalized for dispatch.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Header carrying a schedule hint.
pub const SCHEDULE_HEADER: &str = "x-schedule";
/// Header carrying a command hint.
pub const COMMAND_HEADER: &str = "x-command";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub id: Uuid,
    pub method: String,
    pub path: String,
    /// First value per header, keys lowercased.
    pub headers: HashMap<String, String>,
    /// JSON object body; empty when the body was missing or not an object.
    pub body: Map<String, Value>,
    pub caller: String,
    pub timestamp: DateTime<Utc>,
    /// `X-Schedule` hint.
    #[serde(default)]
    pub schedule: String,
    /// `X-Command` hint.
    #[serde(default)]
    pub command: String,
}

impl Intent {
    /// Bare intent with a fresh id and no headers or body.
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            method: method.to_string(),
            path: path.to_string(),
            headers: HashMap::new(),
            body: Map::new(),
            caller: String::new(),
            timestamp: Utc::now(),
            schedule: String::new(),
            command: String::new(),
        }
    }

    /// Build an intent from request parts. A malformed body is ignored.
    pub fn from_parts<'a, I>(method: &str, path: &str, headers: I, body: &[u8], caller: &str) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut intent = Self::new(method, path);
        intent.caller = caller.to_string();
        for (key, value) in headers {
            intent
                .headers
                .entry(key.to_ascii_lowercase())
                .or_insert_with(|| value.to_string());
        }
        intent.schedule = intent.headers.get(SCHEDULE_HEADER).cloned().unwrap_or_default();
        intent.command = intent.headers.get(COMMAND_HEADER).cloned().unwrap_or_default();

        if !body.is_empty() {
            match serde_json::from_slice::<Value>(body) {
                Ok(Value::Object(map)) => intent.body = map,
                Ok(_) => tracing::debug!("Intent {} body is not a JSON object", intent.id),
                Err(e) => tracing::debug!("Intent {} body is not valid JSON: {e}", intent.id),
            }
        }
        intent
    }

    /// Replace the body. Non-object values leave it empty.
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = match body {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self
    }

    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        let key = key.to_ascii_lowercase();
        match key.as_str() {
            SCHEDULE_HEADER => self.schedule = value.to_string(),
            COMMAND_HEADER => self.command = value.to_string(),
            _ => {}
        }
        self.headers.insert(key, value.to_string());
        self
    }

    pub fn body_str(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }

    /// Schedule for the derived job: body first, then the header hint.
    pub fn job_schedule(&self) -> String {
        self.body_str("schedule")
            .map(str::to_string)
            .unwrap_or_else(|| self.schedule.clone())
    }

    /// Command for the derived job: body first, then the header hint.
    pub fn job_command(&self) -> String {
        self.body_str("command")
            .map(str::to_string)
            .unwrap_or_else(|| self.command.clone())
    }

    /// `body["user_id"]` when it is a valid UUID.
    pub fn user_id(&self) -> Option<Uuid> {
        self.body_str("user_id").and_then(|s| Uuid::parse_str(s).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_parts() {
        let headers = [
            ("Content-Type", "application/json"),
            ("X-Schedule", "*/5 * * * *"),
            ("x-schedule", "ignored"),
        ];
        let body = br#"{"command":"backup.sh","retries":2}"#;
        let intent = Intent::from_parts("POST", "/api/tasks", headers, body, "10.0.0.1:5000");

        assert_eq!(intent.method, "POST");
        assert_eq!(intent.caller, "10.0.0.1:5000");
        assert_eq!(intent.headers["content-type"], "application/json");
        assert_eq!(intent.schedule, "*/5 * * * *");
        assert_eq!(intent.body_str("command"), Some("backup.sh"));
        assert_eq!(intent.body["retries"], 2);
    }

    #[test]
    fn test_malformed_body_is_empty() {
        let intent = Intent::from_parts("POST", "/api/jobs", [], b"{not json", "");
        assert!(intent.body.is_empty());
        let intent = Intent::from_parts("POST", "/api/jobs", [], b"[1,2,3]", "");
        assert!(intent.body.is_empty());
    }

    #[test]
    fn test_unique_ids() {
        let a = Intent::new("GET", "/");
        let b = Intent::new("GET", "/");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_body_wins_over_header_hints() {
        let intent = Intent::new("POST", "/api/jobs")
            .with_header("X-Command", "from-header")
            .with_header("X-Schedule", "0 * * * *")
            .with_body(serde_json::json!({"command": "from-body"}));
        assert_eq!(intent.job_command(), "from-body");
        assert_eq!(intent.job_schedule(), "0 * * * *");
    }

    #[test]
    fn test_missing_fields_are_empty() {
        let intent = Intent::new("POST", "/api/jobs");
        assert_eq!(intent.job_command(), "");
        assert_eq!(intent.job_schedule(), "");
        assert!(intent.user_id().is_none());
    }
}
