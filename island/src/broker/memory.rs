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

//! In-memory broker implementation.
//!
//! This module provides a broker that lives entirely inside the process. It is
//! primarily useful for testing the runtime without a real message broker, and
//! for single-process deployments.
//!
//! It implements the broker semantics the runtime depends on:
//!
//! - Direct, topic and fanout exchanges, plus the default exchange that routes
//!   to the queue named by the routing key
//! - Round-robin delivery across the consumers of one queue, bounded by the
//!   channel prefetch count
//! - Unacknowledged delivery tracking, with requeue on nack and channel close
//! - Exclusive queues owned by a connection, auto-delete queues removed with
//!   their last consumer, per-message time to live
//! - Consumer streams that end when the consumer is cancelled or its queue is
//!   deleted
//!
//! It also offers fault injection (refused connections, rejected publishes,
//! broker-initiated channel close and consumer cancellation) for tests.

use crate::broker::{
    Broker, BrokerChannel, BrokerError, ChannelId, Connection, ConsumeOptions, Consumer, Delivery,
    ExchangeKind, ExchangeOptions, Properties, QueueOptions, SharedChannel, TopicPattern,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

/// In-process message broker.
///
/// Cloning a `MemoryBroker` yields another handle to the same broker.
///
/// # Examples
///
/// ```rust
/// use island::broker::{
///     Broker, ConsumeOptions, ExchangeKind, ExchangeOptions, MemoryBroker, QueueOptions,
/// };
///
/// # async fn example() -> Result<(), island::broker::BrokerError> {
/// let broker = MemoryBroker::new();
/// let connection = broker.connect("memory://local").await?;
/// let channel = connection.create_channel().await?;
///
/// channel.assert_exchange("events", ExchangeKind::Topic, ExchangeOptions::default()).await?;
/// channel.assert_queue("audit", QueueOptions::default()).await?;
/// channel.bind_queue("audit", "events", "user.#").await?;
///
/// let mut consumer = channel.consume("audit", ConsumeOptions::default()).await?;
/// channel.publish("events", "user.created", b"{}".to_vec(), Default::default()).await?;
///
/// let delivery = consumer.recv().await.unwrap();
/// assert_eq!(delivery.routing_key, "user.created");
/// channel.ack(delivery.delivery_tag).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Debug, Default)]
struct BrokerState {
    next_connection: u64,
    next_channel: u64,
    next_delivery_tag: u64,
    next_consumer: u64,
    connections: HashMap<u64, ConnectionState>,
    channels: HashMap<u64, ChannelState>,
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    unacked: HashMap<u64, Unacked>,
    refuse_connections: bool,
    failing_publishes: usize,
}

#[derive(Debug)]
struct ConnectionState {
    open: bool,
    channels: HashSet<u64>,
}

#[derive(Debug)]
struct ChannelState {
    connection: u64,
    open: bool,
    prefetch: u16,
    closed: watch::Sender<bool>,
}

#[derive(Debug)]
struct ExchangeState {
    kind: ExchangeKind,
    options: ExchangeOptions,
    bindings: Vec<Binding>,
}

#[derive(Debug)]
struct Binding {
    queue: String,
    pattern: TopicPattern,
}

#[derive(Debug)]
struct QueueState {
    options: QueueOptions,
    owner: Option<u64>,
    ready: VecDeque<Message>,
    consumers: Vec<ConsumerState>,
    cursor: usize,
}

#[derive(Debug, Clone)]
struct Message {
    exchange: String,
    routing_key: String,
    content: Vec<u8>,
    properties: Properties,
    redelivered: bool,
    expires_at: Option<Instant>,
}

#[derive(Debug)]
struct ConsumerState {
    tag: String,
    channel: u64,
    no_ack: bool,
    in_flight: usize,
    sender: mpsc::UnboundedSender<Delivery>,
}

#[derive(Debug)]
struct Unacked {
    channel: u64,
    queue: String,
    consumer_tag: String,
    message: Message,
}

impl MemoryBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent connection attempts fail (or succeed again).
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse_connections = refuse;
    }

    /// Makes the next `count` publishes fail with [`BrokerError::PublishRejected`].
    pub fn fail_next_publishes(&self, count: usize) {
        self.state.lock().failing_publishes = count;
    }

    /// Closes a channel from the broker side.
    pub fn close_channel(&self, id: ChannelId) {
        self.state.lock().close_channel(id.as_u64());
    }

    /// Cancels every consumer of a queue from the broker side, keeping the queue.
    pub fn cancel_consumers(&self, queue: &str) {
        let mut state = self.state.lock();
        if let Some(q) = state.queues.get_mut(queue) {
            let cancelled = q.consumers.len();
            q.consumers.clear();
            debug!(queue = %queue, cancelled, "Broker cancelled consumers");
        }
    }

    /// Returns `true` if the queue exists.
    #[must_use]
    pub fn has_queue(&self, queue: &str) -> bool {
        self.state.lock().queues.contains_key(queue)
    }

    /// Returns `true` if the exchange exists.
    #[must_use]
    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.state.lock().exchanges.contains_key(exchange)
    }

    /// Returns the names of all queues, sorted.
    #[must_use]
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns the number of messages waiting in a queue.
    #[must_use]
    pub fn message_count(&self, queue: &str) -> usize {
        self.state.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Returns the number of consumers of a queue.
    #[must_use]
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state.lock().queues.get(queue).map_or(0, |q| q.consumers.len())
    }

    /// Returns the `(queue, routing pattern)` bindings of an exchange.
    #[must_use]
    pub fn bindings(&self, exchange: &str) -> Vec<(String, String)> {
        self.state.lock().exchanges.get(exchange).map_or_else(Vec::new, |e| {
            e.bindings
                .iter()
                .map(|b| (b.queue.clone(), b.pattern.as_str().to_string()))
                .collect()
        })
    }

    /// Returns the number of deliveries awaiting acknowledgement.
    #[must_use]
    pub fn unacked_count(&self) -> usize {
        self.state.lock().unacked.len()
    }

    /// Returns the number of open channels across all connections.
    #[must_use]
    pub fn open_channel_count(&self) -> usize {
        self.state.lock().channels.values().filter(|c| c.open).count()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Connection>, BrokerError> {
        let mut state = self.state.lock();
        if state.refuse_connections {
            return Err(BrokerError::ConnectionFailed {
                url: url.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        state.next_connection += 1;
        let id = state.next_connection;
        state.connections.insert(
            id,
            ConnectionState {
                open: true,
                channels: HashSet::new(),
            },
        );
        debug!(connection = id, url = %url, "Memory broker connection opened");
        Ok(Arc::new(MemoryConnection {
            id,
            state: Arc::clone(&self.state),
        }))
    }
}

/// A connection to a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn create_channel(&self) -> Result<SharedChannel, BrokerError> {
        let mut state = self.state.lock();
        match state.connections.get(&self.id) {
            Some(c) if c.open => {}
            _ => return Err(BrokerError::ConnectionClosed),
        }
        state.next_channel += 1;
        let id = state.next_channel;
        let (closed, closed_rx) = watch::channel(false);
        state.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                open: true,
                prefetch: 0,
                closed,
            },
        );
        if let Some(connection) = state.connections.get_mut(&self.id) {
            connection.channels.insert(id);
        }
        trace!(connection = self.id, channel = id, "Memory broker channel opened");
        Ok(Arc::new(MemoryChannel {
            id,
            connection: self.id,
            state: Arc::clone(&self.state),
            closed_rx,
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.state.lock().close_connection(self.id);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state
            .lock()
            .connections
            .get(&self.id)
            .is_some_and(|c| c.open)
    }
}

/// A channel on a [`MemoryConnection`].
#[derive(Debug)]
pub struct MemoryChannel {
    id: u64,
    connection: u64,
    state: Arc<Mutex<BrokerState>>,
    closed_rx: watch::Receiver<bool>,
}

impl MemoryChannel {
    fn open_state(&self) -> Result<parking_lot::MutexGuard<'_, BrokerState>, BrokerError> {
        let state = self.state.lock();
        if state.channels.get(&self.id).is_some_and(|c| c.open) {
            Ok(state)
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn id(&self) -> ChannelId {
        ChannelId::from_u64(self.id)
    }

    fn is_open(&self) -> bool {
        self.state.lock().channels.get(&self.id).is_some_and(|c| c.open)
    }

    async fn closed(&self) {
        let mut closed = self.closed_rx.clone();
        while !*closed.borrow_and_update() {
            if closed.changed().await.is_err() {
                return;
            }
        }
    }

    async fn assert_exchange(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<(), BrokerError> {
        let mut state = self.open_state()?;
        match state.exchanges.get(exchange) {
            Some(existing) if existing.kind != kind => Err(BrokerError::PreconditionFailed {
                name: exchange.to_string(),
                reason: format!("exchange type {:?} does not match {:?}", kind, existing.kind),
            }),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    exchange.to_string(),
                    ExchangeState {
                        kind,
                        options,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn assert_queue(&self, queue: &str, options: QueueOptions) -> Result<(), BrokerError> {
        let mut state = self.open_state()?;
        if let Some(existing) = state.queues.get(queue) {
            return match existing.owner {
                Some(owner) if owner != self.connection => Err(BrokerError::ResourceLocked {
                    queue: queue.to_string(),
                }),
                _ => Ok(()),
            };
        }
        let owner = options.exclusive.then_some(self.connection);
        state.queues.insert(
            queue.to_string(),
            QueueState {
                options,
                owner,
                ready: VecDeque::new(),
                consumers: Vec::new(),
                cursor: 0,
            },
        );
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.open_state()?;
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::QueueNotFound {
                queue: queue.to_string(),
            });
        }
        let Some(target) = state.exchanges.get_mut(exchange) else {
            return Err(BrokerError::ExchangeNotFound {
                exchange: exchange.to_string(),
            });
        };
        let exists = target
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.pattern.as_str() == routing_key);
        if !exists {
            target.bindings.push(Binding {
                queue: queue.to_string(),
                pattern: TopicPattern::new(routing_key),
            });
        }
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let mut state = self.open_state()?;
        state.delete_queue(queue);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content: Vec<u8>,
        properties: Properties,
    ) -> Result<(), BrokerError> {
        let mut state = self.open_state()?;
        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Err(BrokerError::PublishRejected {
                exchange: exchange.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        let targets = state.route(exchange, routing_key)?;
        let expires_at = properties.expiration.map(|ttl| Instant::now() + ttl);
        let message = Message {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            content,
            properties,
            redelivered: false,
            expires_at,
        };
        for queue in targets {
            if let Some(q) = state.queues.get_mut(&queue) {
                q.ready.push_back(message.clone());
            }
            state.dispatch(&queue);
        }
        Ok(())
    }

    async fn send_to_queue(
        &self,
        queue: &str,
        content: Vec<u8>,
        properties: Properties,
    ) -> Result<(), BrokerError> {
        self.publish("", queue, content, properties).await
    }

    async fn prefetch(&self, count: u16) -> Result<(), BrokerError> {
        let mut state = self.open_state()?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = count;
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<Consumer, BrokerError> {
        let mut state = self.open_state()?;
        let tag = match options.consumer_tag {
            Some(tag) => tag,
            None => {
                state.next_consumer += 1;
                format!("amq.ctag-{}", state.next_consumer)
            }
        };
        let Some(q) = state.queues.get_mut(queue) else {
            return Err(BrokerError::QueueNotFound {
                queue: queue.to_string(),
            });
        };
        if q.owner.is_some_and(|owner| owner != self.connection) {
            return Err(BrokerError::ResourceLocked {
                queue: queue.to_string(),
            });
        }
        if q.consumers.iter().any(|c| c.tag == tag) {
            return Err(BrokerError::PreconditionFailed {
                name: queue.to_string(),
                reason: format!("consumer tag '{}' is already in use", tag),
            });
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        q.consumers.push(ConsumerState {
            tag: tag.clone(),
            channel: self.id,
            no_ack: options.no_ack,
            in_flight: 0,
            sender,
        });
        state.dispatch(queue);
        debug!(queue = %queue, consumer_tag = %tag, "Consumer started");
        Ok(Consumer::new(tag, queue, receiver))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        let mut state = self.open_state()?;
        let found = state.queues.iter_mut().find_map(|(name, q)| {
            let index = q
                .consumers
                .iter()
                .position(|c| c.tag == consumer_tag && c.channel == self.id)?;
            q.consumers.remove(index);
            Some((name.clone(), q.options.auto_delete && q.consumers.is_empty()))
        });
        match found {
            Some((queue, remove)) => {
                if remove {
                    state.delete_queue(&queue);
                }
                debug!(queue = %queue, consumer_tag = %consumer_tag, "Consumer cancelled");
                Ok(())
            }
            None => Err(BrokerError::ConsumerNotFound {
                consumer_tag: consumer_tag.to_string(),
            }),
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let mut state = self.open_state()?;
        let unacked = state.take_unacked(self.id, delivery_tag)?;
        state.dispatch(&unacked.queue);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let mut state = self.open_state()?;
        let unacked = state.take_unacked(self.id, delivery_tag)?;
        let queue = unacked.queue.clone();
        if requeue {
            state.requeue(unacked);
        }
        state.dispatch(&queue);
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.state.lock().close_channel(self.id);
        Ok(())
    }
}

impl BrokerState {
    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, BrokerError> {
        if exchange.is_empty() {
            return Ok(if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            });
        }
        let Some(target) = self.exchanges.get(exchange) else {
            return Err(BrokerError::ExchangeNotFound {
                exchange: exchange.to_string(),
            });
        };
        let mut queues: Vec<String> = Vec::new();
        for binding in &target.bindings {
            let matched = match target.kind {
                ExchangeKind::Direct => binding.pattern.as_str() == routing_key,
                ExchangeKind::Topic => binding.pattern.matches(routing_key),
                ExchangeKind::Fanout => true,
            };
            if matched && !queues.contains(&binding.queue) {
                queues.push(binding.queue.clone());
            }
        }
        Ok(queues)
    }

    /// Pushes ready messages of a queue to consumers with spare capacity.
    fn dispatch(&mut self, queue_name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            let now = Instant::now();
            while queue
                .ready
                .front()
                .is_some_and(|m| m.expires_at.is_some_and(|at| at <= now))
            {
                queue.ready.pop_front();
            }
            if queue.ready.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let count = queue.consumers.len();
            let chosen = (0..count)
                .map(|offset| (queue.cursor + offset) % count)
                .find(|&index| {
                    let consumer = &queue.consumers[index];
                    let prefetch = self
                        .channels
                        .get(&consumer.channel)
                        .map_or(0, |c| c.prefetch as usize);
                    consumer.no_ack || prefetch == 0 || consumer.in_flight < prefetch
                });
            let Some(index) = chosen else {
                return;
            };
            let Some(message) = queue.ready.pop_front() else {
                return;
            };
            queue.cursor = (index + 1) % count;

            self.next_delivery_tag += 1;
            let delivery_tag = self.next_delivery_tag;
            let consumer = &mut queue.consumers[index];
            let delivery = Delivery {
                delivery_tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                content: message.content.clone(),
                properties: message.properties.clone(),
            };
            if consumer.sender.send(delivery).is_err() {
                // The consumer stream was dropped without cancelling.
                queue.consumers.remove(index);
                queue.cursor = 0;
                queue.ready.push_front(message);
                continue;
            }
            if !consumer.no_ack {
                consumer.in_flight += 1;
                let unacked = Unacked {
                    channel: consumer.channel,
                    queue: queue_name.to_string(),
                    consumer_tag: consumer.tag.clone(),
                    message,
                };
                self.unacked.insert(delivery_tag, unacked);
            }
        }
    }

    fn take_unacked(&mut self, channel: u64, delivery_tag: u64) -> Result<Unacked, BrokerError> {
        match self.unacked.get(&delivery_tag) {
            Some(u) if u.channel == channel => {}
            _ => return Err(BrokerError::UnknownDeliveryTag { delivery_tag }),
        }
        let Some(unacked) = self.unacked.remove(&delivery_tag) else {
            return Err(BrokerError::UnknownDeliveryTag { delivery_tag });
        };
        if let Some(queue) = self.queues.get_mut(&unacked.queue) {
            if let Some(consumer) = queue
                .consumers
                .iter_mut()
                .find(|c| c.tag == unacked.consumer_tag && c.channel == channel)
            {
                consumer.in_flight = consumer.in_flight.saturating_sub(1);
            }
        }
        Ok(unacked)
    }

    fn requeue(&mut self, unacked: Unacked) {
        if let Some(queue) = self.queues.get_mut(&unacked.queue) {
            let mut message = unacked.message;
            message.redelivered = true;
            queue.ready.push_front(message);
        }
    }

    fn delete_queue(&mut self, queue: &str) {
        if self.queues.remove(queue).is_none() {
            return;
        }
        self.unacked.retain(|_, u| u.queue != queue);
        let mut emptied = Vec::new();
        for (name, exchange) in &mut self.exchanges {
            let before = exchange.bindings.len();
            exchange.bindings.retain(|b| b.queue != queue);
            if exchange.options.auto_delete && before > 0 && exchange.bindings.is_empty() {
                emptied.push(name.clone());
            }
        }
        for name in emptied {
            self.exchanges.remove(&name);
        }
        debug!(queue = %queue, "Queue deleted");
    }

    fn close_channel(&mut self, id: u64) {
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        if !channel.open {
            return;
        }
        channel.open = false;
        let _ = channel.closed.send(true);

        let mut auto_deleted = Vec::new();
        for (name, queue) in &mut self.queues {
            let before = queue.consumers.len();
            queue.consumers.retain(|c| c.channel != id);
            if queue.options.auto_delete && before > 0 && queue.consumers.is_empty() {
                auto_deleted.push(name.clone());
            }
        }

        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.channel == id)
            .map(|(tag, _)| *tag)
            .collect();
        let mut touched = HashSet::new();
        for tag in tags {
            if let Some(unacked) = self.unacked.remove(&tag) {
                touched.insert(unacked.queue.clone());
                self.requeue(unacked);
            }
        }
        for queue in auto_deleted {
            touched.remove(&queue);
            self.delete_queue(&queue);
        }
        for queue in touched {
            self.dispatch(&queue);
        }
        trace!(channel = id, "Memory broker channel closed");
    }

    fn close_connection(&mut self, id: u64) {
        let Some(connection) = self.connections.get_mut(&id) else {
            return;
        };
        connection.open = false;
        let channels: Vec<u64> = connection.channels.drain().collect();
        for channel in channels {
            self.close_channel(channel);
        }
        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(id))
            .map(|(name, _)| name.clone())
            .collect();
        for queue in exclusive {
            self.delete_queue(&queue);
        }
        debug!(connection = id, "Memory broker connection closed");
    }
}
