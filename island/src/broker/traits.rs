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

use crate::broker::{
    BrokerError, ChannelId, ConsumeOptions, Consumer, ExchangeKind, ExchangeOptions, Properties,
    QueueOptions,
};
use async_trait::async_trait;
use std::sync::Arc;

/// A broker channel shared between its holder and the pool that tracks it.
pub type SharedChannel = Arc<dyn BrokerChannel>;

/// Entry point to a message broker.
///
/// The runtime never speaks a broker wire protocol itself. It talks to the
/// broker through this trait and the [`Connection`] and [`BrokerChannel`]
/// traits it hands out, which model exchanges, queues, routing-key based
/// delivery, acknowledgement and per-connection channel multiplexing.
///
/// # Implementations
///
/// - [`MemoryBroker`](crate::broker::MemoryBroker): in-process broker for tests
///   and single-process deployments
///
/// # Examples
///
/// ```rust
/// use island::broker::{Broker, MemoryBroker, QueueOptions};
///
/// # async fn example() -> Result<(), island::broker::BrokerError> {
/// let broker = MemoryBroker::new();
/// let connection = broker.connect("memory://local").await?;
/// let channel = connection.create_channel().await?;
/// channel.assert_queue("jobs", QueueOptions::default()).await?;
/// channel.send_to_queue("jobs", b"hello".to_vec(), Default::default()).await?;
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Opens a connection to the broker at `url`.
    async fn connect(&self, url: &str) -> Result<Arc<dyn Connection>, BrokerError>;
}

/// A connection to the broker, multiplexing many channels.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Opens a new channel on this connection.
    async fn create_channel(&self) -> Result<SharedChannel, BrokerError>;

    /// Closes the connection and every channel on it.
    async fn close(&self) -> Result<(), BrokerError>;

    /// Returns `true` while the connection is usable.
    fn is_open(&self) -> bool;
}

/// A multiplexed channel on a broker connection.
///
/// Publishes on one channel are ordered; there is no ordering guarantee
/// across channels.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Returns the channel id.
    fn id(&self) -> ChannelId;

    /// Returns `true` while the channel is usable.
    fn is_open(&self) -> bool;

    /// Resolves once the channel is closed, by the broker or explicitly.
    async fn closed(&self);

    /// Declares an exchange, creating it when missing.
    async fn assert_exchange(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<(), BrokerError>;

    /// Declares a queue, creating it when missing.
    async fn assert_queue(&self, queue: &str, options: QueueOptions) -> Result<(), BrokerError>;

    /// Binds a queue to an exchange with a routing key or pattern.
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Deletes a queue, cancelling its consumers.
    async fn delete_queue(&self, queue: &str) -> Result<(), BrokerError>;

    /// Publishes a message to an exchange.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content: Vec<u8>,
        properties: Properties,
    ) -> Result<(), BrokerError>;

    /// Sends a message directly to a queue.
    async fn send_to_queue(
        &self,
        queue: &str,
        content: Vec<u8>,
        properties: Properties,
    ) -> Result<(), BrokerError>;

    /// Limits unacknowledged deliveries per consumer on this channel.
    ///
    /// A count of zero means unlimited.
    async fn prefetch(&self, count: u16) -> Result<(), BrokerError>;

    /// Starts consuming a queue.
    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<Consumer, BrokerError>;

    /// Cancels a consumer. Its [`Consumer`] stream ends after pending deliveries.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    /// Acknowledges a delivery.
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Rejects a delivery, optionally requeueing it for redelivery.
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    /// Closes the channel. Unacknowledged deliveries are requeued.
    async fn close(&self) -> Result<(), BrokerError>;
}
