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

//! Message broker abstractions.
//!
//! The runtime is built on a message broker with exchanges, queues,
//! routing-key based delivery, acknowledgement and per-connection channel
//! multiplexing. This module defines that seam as the [`Broker`],
//! [`Connection`] and [`BrokerChannel`] traits, together with the topology and
//! message types they exchange, and ships one implementation:
//!
//! - [`MemoryBroker`]: an in-process broker for testing and single-process use
//!
//! # Architecture
//!
//! - **Exchanges** route published messages to bound queues. Direct exchanges
//!   compare routing keys for equality, topic exchanges match them against a
//!   [`TopicPattern`], fanout exchanges copy to every bound queue.
//! - **Queues** hold messages until a consumer takes them. Consumers of one
//!   queue share its messages round robin.
//! - **Channels** carry every operation. A channel's prefetch count bounds how
//!   many deliveries may be unacknowledged at once.
//!
//! # Examples
//!
//! ```rust
//! use island::broker::{Broker, ConsumeOptions, MemoryBroker, QueueOptions};
//!
//! # async fn example() -> Result<(), island::broker::BrokerError> {
//! let broker = MemoryBroker::new();
//! let connection = broker.connect("memory://local").await?;
//! let channel = connection.create_channel().await?;
//!
//! channel.assert_queue("jobs", QueueOptions::default()).await?;
//! let mut consumer = channel.consume("jobs", ConsumeOptions::default()).await?;
//! channel.send_to_queue("jobs", b"work".to_vec(), Default::default()).await?;
//!
//! let delivery = consumer.recv().await.unwrap();
//! assert_eq!(delivery.content, b"work".to_vec());
//! channel.ack(delivery.delivery_tag).await?;
//! # Ok(())
//! # }
//! ```

mod error;
mod memory;
mod pattern;
mod traits;
mod types;

pub use error::BrokerError;
pub use memory::{MemoryBroker, MemoryChannel, MemoryConnection};
pub use pattern::TopicPattern;
pub use traits::{Broker, BrokerChannel, Connection, SharedChannel};
pub use types::{
    ChannelId, ConsumeOptions, Consumer, Delivery, ExchangeKind, ExchangeOptions, FieldTable,
    Properties, QueueOptions, timestamp_millis,
};
