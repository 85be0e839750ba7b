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

//! Broker layer error types.
//!
//! Broker errors are the lowest level of the runtime's error hierarchy. They
//! describe failures of the message broker seam: connections, channels,
//! topology and deliveries.
//!
//! # Error Categories
//!
//! - **Connection errors**: the broker could not be reached or went away
//! - **Channel errors**: the multiplexed channel was closed
//! - **Topology errors**: an exchange, queue or consumer does not exist
//! - **Delivery errors**: a publish was rejected or an ack was invalid

use thiserror::Error;

/// Errors that can occur talking to the message broker.
///
/// # Examples
///
/// ```rust
/// use island::broker::BrokerError;
///
/// let error = BrokerError::ConnectionFailed {
///     url: "amqp://rabbitmq:5672".to_string(),
///     reason: "connection refused".to_string(),
/// };
/// assert!(error.is_recoverable());
/// assert!(!BrokerError::ChannelClosed.is_recoverable());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// Failed to establish a connection to the broker.
    #[error("failed to connect to {url}: {reason}")]
    ConnectionFailed {
        /// The broker url
        url: String,
        /// Why the connection failed
        reason: String,
    },

    /// The connection was closed.
    #[error("connection is closed")]
    ConnectionClosed,

    /// The channel was closed, by the broker or explicitly.
    #[error("channel is closed")]
    ChannelClosed,

    /// The named exchange does not exist.
    #[error("no exchange '{exchange}'")]
    ExchangeNotFound {
        /// The exchange name
        exchange: String,
    },

    /// The named queue does not exist.
    #[error("no queue '{queue}'")]
    QueueNotFound {
        /// The queue name
        queue: String,
    },

    /// An existing entity was redeclared with different properties.
    #[error("precondition failed for '{name}': {reason}")]
    PreconditionFailed {
        /// The exchange or queue name
        name: String,
        /// What did not match
        reason: String,
    },

    /// An exclusive queue is owned by another connection.
    #[error("queue '{queue}' is locked by another connection")]
    ResourceLocked {
        /// The queue name
        queue: String,
    },

    /// No consumer with the given tag exists on the channel.
    #[error("no consumer '{consumer_tag}'")]
    ConsumerNotFound {
        /// The consumer tag
        consumer_tag: String,
    },

    /// The delivery tag is not outstanding on the channel.
    #[error("unknown delivery tag {delivery_tag}")]
    UnknownDeliveryTag {
        /// The delivery tag
        delivery_tag: u64,
    },

    /// The broker refused a publish.
    #[error("publish to '{exchange}' rejected: {reason}")]
    PublishRejected {
        /// The exchange the message was published to
        exchange: String,
        /// Why it was rejected
        reason: String,
    },
}

impl BrokerError {
    /// Returns `true` if retrying on a fresh channel or connection may succeed.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BrokerError::ConnectionFailed { .. }
                | BrokerError::ConnectionClosed
                | BrokerError::PublishRejected { .. }
        )
    }

    /// Returns `true` if this error means the channel is no longer usable.
    #[must_use]
    pub fn closes_channel(&self) -> bool {
        matches!(
            self,
            BrokerError::ChannelClosed
                | BrokerError::ConnectionClosed
                | BrokerError::PreconditionFailed { .. }
                | BrokerError::UnknownDeliveryTag { .. }
        )
    }
}
