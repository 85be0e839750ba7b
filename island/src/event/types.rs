//
// Copyright 2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Event types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A publishable event: a routing key and its arguments.
pub trait Event: Send + Sync {
    /// Routing key of the event.
    fn key(&self) -> &str;

    /// Arguments, serialized as the message body.
    fn args(&self) -> Value;

    /// Publish time in milliseconds since the Unix epoch; now when `None`.
    fn published_at(&self) -> Option<u64> {
        None
    }
}

/// An event with a fixed routing key and typed arguments.
///
/// # Examples
///
/// ```rust
/// use island::event::{Event, KeyedEvent, SystemNodeStarted};
///
/// let event = SystemNodeStarted {
///     name: "event.accounts.node.1".to_string(),
///     island: "accounts".to_string(),
/// };
/// assert_eq!(event.key(), "system.node.started");
/// assert_eq!(event.args()["island"], "accounts");
/// assert_eq!(SystemNodeStarted::KEY, "system.node.started");
/// ```
pub trait KeyedEvent: Serialize + Send + Sync {
    /// Routing key shared by every event of this type.
    const KEY: &'static str;
}

impl<T: KeyedEvent> Event for T {
    fn key(&self) -> &str {
        T::KEY
    }

    fn args(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// An event with an arbitrary routing key.
#[derive(Debug, Clone, PartialEq)]
pub struct BaseEvent {
    key: String,
    args: Value,
    published_at: Option<u64>,
}

impl BaseEvent {
    /// Creates an event.
    pub fn new(key: impl Into<String>, args: Value) -> Self {
        Self {
            key: key.into(),
            args,
            published_at: None,
        }
    }

    /// Sets the publish time.
    #[must_use]
    pub fn with_published_at(mut self, published_at: u64) -> Self {
        self.published_at = Some(published_at);
        self
    }
}

impl Event for BaseEvent {
    fn key(&self) -> &str {
        &self.key
    }

    fn args(&self) -> Value {
        self.args.clone()
    }

    fn published_at(&self) -> Option<u64> {
        self.published_at
    }
}

/// An event as delivered to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedEvent {
    /// Routing key the event arrived with.
    pub key: String,
    /// Decoded arguments, after the event hooks ran.
    pub args: Value,
    /// Publish time carried by the message.
    pub published_at: Option<u64>,
}

impl ReceivedEvent {
    /// Decodes the arguments into a typed event.
    ///
    /// # Errors
    ///
    /// Returns the decoding error when the arguments do not fit `T`.
    pub fn decode<T>(&self) -> Result<T, serde_json::Error>
    where
        T: for<'de> Deserialize<'de>,
    {
        serde_json::from_value(self.args.clone())
    }
}

/// Asks every node to change a log level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggerLevelChanged {
    /// Logger category.
    pub category: String,
    /// New level.
    pub level: String,
}

impl KeyedEvent for LoggerLevelChanged {
    const KEY: &'static str = "logger.level.changed";
}

/// Asks every node to change the log format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggerTypeChanged {
    /// New format (`short`, `long`, `json`).
    #[serde(rename = "type")]
    pub kind: String,
}

impl KeyedEvent for LoggerTypeChanged {
    const KEY: &'static str = "logger.type.changed";
}

/// Announces a node that started consuming events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemNodeStarted {
    /// Fanout queue of the node.
    pub name: String,
    /// Service name of the node.
    pub island: String,
}

impl KeyedEvent for SystemNodeStarted {
    const KEY: &'static str = "system.node.started";
}

/// Asks a node for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemDiagnosis {
    /// Command and its arguments; `ping` or `status`.
    pub args: Vec<String>,
    /// File the answer is appended to.
    pub file_name: String,
}

impl KeyedEvent for SystemDiagnosis {
    const KEY: &'static str = "system.diagnosis";
}

/// Asks services to report their health.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemHealthCheck {}

impl KeyedEvent for SystemHealthCheck {
    const KEY: &'static str = "system.health.check";
}

/// Carries an exported status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusExportEvent(pub Value);

impl StatusExportEvent {
    /// Wraps an exported document.
    #[must_use]
    pub fn new(document: Value) -> Self {
        Self(document)
    }
}

impl KeyedEvent for StatusExportEvent {
    const KEY: &'static str = "island.status.export";
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keyed_event_wire_names() {
        let event = SystemDiagnosis {
            args: vec!["ping".to_string()],
            file_name: "/tmp/diag".to_string(),
        };
        assert_eq!(event.args(), json!({"args": ["ping"], "fileName": "/tmp/diag"}));
        let logger = LoggerTypeChanged {
            kind: "json".to_string(),
        };
        assert_eq!(logger.args(), json!({"type": "json"}));
        assert_eq!(StatusExportEvent::new(json!({"a": 1})).args(), json!({"a": 1}));
    }

    #[test]
    fn test_received_event_decodes() {
        let received = ReceivedEvent {
            key: LoggerLevelChanged::KEY.to_string(),
            args: json!({"category": "app", "level": "debug"}),
            published_at: None,
        };
        let event: LoggerLevelChanged = received.decode().unwrap();
        assert_eq!(event.level, "debug");
        assert!(received.decode::<SystemNodeStarted>().is_err());
    }

    #[test]
    fn test_base_event() {
        let event = BaseEvent::new("user.created", json!({"id": 1})).with_published_at(42);
        assert_eq!(event.key(), "user.created");
        assert_eq!(event.published_at(), Some(42));
    }
}
