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

//! Message and topology types shared by every broker implementation.

use serde_json::{Map, Value};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

/// Header table carried by a message.
pub type FieldTable = Map<String, Value>;

/// Milliseconds since the Unix epoch, as carried in message timestamps.
#[must_use]
pub fn timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Unique identifier for a broker channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Creates a channel id from a raw value.
    #[must_use]
    pub const fn from_u64(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Channel({})", self.0)
    }
}

/// Exchange routing discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Routes on exact routing key equality.
    Direct,
    /// Routes on `.`-separated wildcard patterns.
    Topic,
    /// Routes to every bound queue.
    Fanout,
}

/// Options for declaring an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExchangeOptions {
    /// Survives broker restarts.
    pub durable: bool,
    /// Removed once its last binding goes away.
    pub auto_delete: bool,
}

/// Options for declaring a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueOptions {
    /// Survives broker restarts.
    pub durable: bool,
    /// Owned by the declaring connection and removed with it.
    pub exclusive: bool,
    /// Removed once its last consumer goes away.
    pub auto_delete: bool,
    /// Removed after being unused for this long.
    pub expires: Option<Duration>,
}

/// Options for starting a consumer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConsumeOptions {
    /// Consumer tag; generated by the broker when `None`.
    pub consumer_tag: Option<String>,
    /// Deliveries are considered acknowledged as soon as they are sent.
    pub no_ack: bool,
}

/// Message properties.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Properties {
    /// Correlates a reply with its request.
    pub correlation_id: Option<String>,
    /// Queue the reply should be sent to.
    pub reply_to: Option<String>,
    /// Per-message time to live.
    pub expiration: Option<Duration>,
    /// Publish time in milliseconds since the Unix epoch.
    pub timestamp: Option<u64>,
    /// Application headers.
    pub headers: FieldTable,
}

/// A message delivered to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Tag used to acknowledge this delivery on its channel.
    pub delivery_tag: u64,
    /// Exchange the message was published to; empty for direct queue sends.
    pub exchange: String,
    /// Routing key the message was published with.
    pub routing_key: String,
    /// Whether this message was delivered before.
    pub redelivered: bool,
    /// Message body.
    pub content: Vec<u8>,
    /// Message properties.
    pub properties: Properties,
}

/// A stream of deliveries for one consumer.
///
/// [`recv`](Consumer::recv) yields `None` once the consumer is cancelled,
/// either by the client or by the broker.
#[derive(Debug)]
pub struct Consumer {
    tag: String,
    queue: String,
    receiver: mpsc::UnboundedReceiver<Delivery>,
}

impl Consumer {
    /// Creates a consumer over a delivery receiver.
    #[must_use]
    pub fn new(
        tag: impl Into<String>,
        queue: impl Into<String>,
        receiver: mpsc::UnboundedReceiver<Delivery>,
    ) -> Self {
        Self {
            tag: tag.into(),
            queue: queue.into(),
            receiver,
        }
    }

    /// Returns the consumer tag.
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Returns the consumed queue.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Waits for the next delivery.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }
}
