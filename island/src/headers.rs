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

//! Message headers carried by RPC requests, responses and events.
//!
//! On the wire the headers are a field table:
//!
//! ```json
//! {
//!   "tattoo": "trace id",
//!   "from": { "node": "host", "context": "rpc name", "island": "service", "type": "rpc" },
//!   "extra": { "sessionType": "...", "routeLogs": [], "flow": true, "parent": "root rpc" }
//! }
//! ```
//!
//! Decoding is lenient: unknown keys are ignored and malformed sections fall
//! back to their defaults, since headers are diagnostic and must never make a
//! message undeliverable.

use crate::broker::FieldTable;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Where a message came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Origin {
    /// Host name of the sender.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    /// RPC or event the sender was serving.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Service name of the sender.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub island: Option<String>,
    /// Kind of work the sender was doing (`rpc`, `endpoint`, `event`).
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// Direction of a route log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteType {
    /// A request was sent.
    Req,
    /// A response was sent.
    Res,
}

/// Protocol of a route log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RouteProtocol {
    /// Request/response call.
    Rpc,
    /// Published event.
    Event,
}

/// One hop of a request's route through the services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteLog {
    /// Host that recorded the hop.
    pub node: String,
    /// Service that recorded the hop.
    pub sender: String,
    /// RPC or event name.
    #[serde(default)]
    pub context: String,
    /// Request or response.
    #[serde(rename = "type")]
    pub kind: RouteType,
    /// RPC or event.
    pub protocol: RouteProtocol,
    /// Correlation id of the message.
    #[serde(default)]
    pub correlation_id: String,
}

/// Route logs shared by every step of one request chain inside a process.
///
/// Cloning shares the underlying list, so logs appended by a nested call are
/// visible to the handler that made it.
#[derive(Debug, Clone, Default)]
pub struct RouteLogs(Arc<Mutex<Vec<RouteLog>>>);

impl RouteLogs {
    /// Creates a list seeded with received logs.
    #[must_use]
    pub fn from_logs(logs: Vec<RouteLog>) -> Self {
        Self(Arc::new(Mutex::new(logs)))
    }

    /// Appends a hop.
    pub fn push(&self, log: RouteLog) {
        self.0.lock().push(log);
    }

    /// Replaces the list with the logs returned by a callee.
    pub fn replace(&self, logs: Vec<RouteLog>) {
        *self.0.lock() = logs;
    }

    /// Returns a copy of the current list.
    #[must_use]
    pub fn snapshot(&self) -> Vec<RouteLog> {
        self.0.lock().clone()
    }
}

impl PartialEq for RouteLogs {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.snapshot() == other.snapshot()
    }
}

/// The `extra` section of the headers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HeaderExtra {
    /// Session type of the end user, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_type: Option<String>,
    /// Route taken so far.
    pub route_logs: Vec<RouteLog>,
    /// Set on responses when the request waited too long in its queue.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub flow: bool,
    /// Name of the RPC at the root of the call chain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

/// Headers of a request, response or event.
///
/// # Examples
///
/// ```rust
/// use island::headers::{MessageHeaders, Origin};
///
/// let mut headers = MessageHeaders::default();
/// headers.tattoo = Some("trace-1".to_string());
/// headers.from = Origin { island: Some("accounts".to_string()), ..Default::default() };
/// headers.extra.flow = true;
///
/// let decoded = MessageHeaders::from_table(&headers.to_table());
/// assert_eq!(decoded, headers);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageHeaders {
    /// Trace id shared by every message of one request chain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tattoo: Option<String>,
    /// Sender description.
    pub from: Origin,
    /// Chain context.
    pub extra: HeaderExtra,
}

impl MessageHeaders {
    /// Encodes the headers as a field table.
    #[must_use]
    pub fn to_table(&self) -> FieldTable {
        match serde_json::to_value(self) {
            Ok(Value::Object(table)) => table,
            _ => FieldTable::new(),
        }
    }

    /// Decodes headers from a field table, tolerating missing or malformed parts.
    #[must_use]
    pub fn from_table(table: &FieldTable) -> Self {
        let section = |key: &str| table.get(key).cloned().unwrap_or(Value::Null);
        Self {
            tattoo: table.get("tattoo").and_then(Value::as_str).map(str::to_string),
            from: serde_json::from_value(section("from")).unwrap_or_default(),
            extra: serde_json::from_value(section("extra")).unwrap_or_default(),
        }
    }
}
