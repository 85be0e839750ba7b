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
    ConsumeOptions, Consumer, Delivery, ExchangeKind, ExchangeOptions, Properties, QueueOptions,
    SharedChannel, TopicPattern, timestamp_millis,
};
use crate::config::IslandConfig;
use crate::context::RequestContext;
use crate::diag::{DiagnosisAnswer, ProcFile, ProcStatus};
use crate::error::{ErrorCode, ErrorKind, IslandError};
use crate::event::{
    BaseEvent, Event, EventHandler, KeyedEvent, LoggerLevelChanged, LoggerTypeChanged,
    ReceivedEvent, Subscriber, Subscription, SubscriptionOptions, SystemDiagnosis,
    SystemNodeStarted,
};
use crate::headers::MessageHeaders;
use crate::hooks::{ErrorHook, HookRegistry, ValueHook};
use crate::pool::ChannelPool;
use crate::shutdown::Shutdown;
use crate::status::{RequestTicket, StatusCollector};
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Topic exchange every event is published to.
pub const EVENT_EXCHANGE: &str = "MESSAGE_BROKER_EXCHANGE";

/// Routing key of the event published when a subscriber fails.
pub const ERROR_LOG_KEY: &str = "log.error";

/// Stats type of event handling.
const EVENT_STATS: &str = "event";

struct ConsumerInfo {
    channel: SharedChannel,
    tag: String,
    queue: String,
}

struct Inner {
    config: Arc<IslandConfig>,
    pool: ChannelPool,
    consumer_pool: ChannelPool,
    collector: Arc<StatusCollector>,
    shutdown: Shutdown,
    round_robin_queue: String,
    fanout_queue: String,
    proc_file: ProcFile,
    subscribers: Mutex<Vec<Subscriber>>,
    hooks: HookRegistry<(), dyn ValueHook>,
    error_hooks: HookRegistry<(), dyn ErrorHook>,
    consumers: Mutex<Vec<ConsumerInfo>>,
    consume_loops: Mutex<Vec<JoinHandle<()>>>,
    stopping: AtomicBool,
}

/// Topic publish/subscribe over the broker.
///
/// # Queues
///
/// - `event.<service>`: the round-robin queue, shared by every instance of
///   the service; each event is handled by one instance
/// - `event.<service>.node.<uuid>`: the fanout queue of this instance; every
///   instance receives its own copy
///
/// A subscription binds one of the two queues to [`EVENT_EXCHANGE`] with an
/// exact routing key or a topic pattern. Several subscribers share one queue
/// and its consumer; each delivery goes to the subscribers of that queue whose
/// key or pattern matches.
///
/// # Failures
///
/// Subscribers run isolated from each other. A failing subscriber does not
/// stop the others, and the delivery is acknowledged regardless. Failures that
/// are not Expected are published as `log.error` events.
///
/// # Examples
///
/// ```rust
/// use island::broker::MemoryBroker;
/// use island::config::IslandConfig;
/// use island::context::RequestContext;
/// use island::error::IslandError;
/// use island::event::{BaseEvent, EventService, ReceivedEvent, SubscriptionOptions};
/// use island::pool::ChannelPool;
/// use island::shutdown::Shutdown;
/// use island::status::StatusCollector;
/// use serde_json::json;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), IslandError> {
/// let pool = ChannelPool::new(Arc::new(MemoryBroker::new()));
/// pool.initialize("memory://local", 10).await?;
/// let events = EventService::new(
///     Arc::new(IslandConfig::new("accounts")),
///     pool,
///     Arc::new(StatusCollector::default()),
///     Shutdown::new(),
/// );
/// events.initialize().await?;
/// events
///     .subscribe_pattern(
///         "user.*",
///         Arc::new(|event: ReceivedEvent, _ctx: RequestContext| async move {
///             println!("{} {}", event.key, event.args);
///             Ok::<_, IslandError>(())
///         }),
///         SubscriptionOptions::default(),
///     )
///     .await?;
/// events.start_consume().await?;
/// events.publish_event(&BaseEvent::new("user.created", json!({"id": 1}))).await?;
/// events.purge().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct EventService {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EventService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventService")
            .field("round_robin_queue", &self.inner.round_robin_queue)
            .field("fanout_queue", &self.inner.fanout_queue)
            .field("subscribers", &self.inner.subscribers.lock().len())
            .finish()
    }
}

impl EventService {
    /// Creates a service publishing and consuming through `pool`.
    pub fn new(
        config: Arc<IslandConfig>,
        pool: ChannelPool,
        collector: Arc<StatusCollector>,
        shutdown: Shutdown,
    ) -> Self {
        let consumer_pool = pool.clone();
        Self::with_consumer_pool(config, pool, consumer_pool, collector, shutdown)
    }

    /// Creates a service that consumes through a separate pool.
    pub fn with_consumer_pool(
        config: Arc<IslandConfig>,
        pool: ChannelPool,
        consumer_pool: ChannelPool,
        collector: Arc<StatusCollector>,
        shutdown: Shutdown,
    ) -> Self {
        let round_robin_queue = format!("event.{}", config.service_name);
        let fanout_queue = format!("event.{}.node.{}", config.service_name, uuid::Uuid::new_v4());
        let proc_file = ProcFile::new(&config.proc_dir, "event.proc");
        Self {
            inner: Arc::new(Inner {
                config,
                pool,
                consumer_pool,
                collector,
                shutdown,
                round_robin_queue,
                fanout_queue,
                proc_file,
                subscribers: Mutex::new(Vec::new()),
                hooks: HookRegistry::new(),
                error_hooks: HookRegistry::new(),
                consumers: Mutex::new(Vec::new()),
                consume_loops: Mutex::new(Vec::new()),
                stopping: AtomicBool::new(false),
            }),
        }
    }

    /// Returns the round-robin queue name.
    #[must_use]
    pub fn round_robin_queue(&self) -> &str {
        &self.inner.round_robin_queue
    }

    /// Returns this instance's fanout queue name.
    #[must_use]
    pub fn fanout_queue(&self) -> &str {
        &self.inner.fanout_queue
    }

    /// Returns the number of subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    /// Declares the exchange and both queues and installs the built-in
    /// subscriptions.
    ///
    /// # Errors
    ///
    /// Returns the broker or pool error that prevented the setup.
    pub async fn initialize(&self) -> Result<(), IslandError> {
        let inner = &self.inner;
        inner.stopping.store(false, Ordering::SeqCst);
        inner
            .proc_file
            .write(ProcStatus::Initializing, &inner.fanout_queue)
            .await;

        let round_robin = inner.round_robin_queue.clone();
        let fanout = inner.fanout_queue.clone();
        inner
            .consumer_pool
            .using_channel(|channel| async move {
                channel
                    .assert_exchange(
                        EVENT_EXCHANGE,
                        ExchangeKind::Topic,
                        ExchangeOptions {
                            durable: true,
                            auto_delete: false,
                        },
                    )
                    .await?;
                channel
                    .assert_queue(
                        &round_robin,
                        QueueOptions {
                            durable: true,
                            ..QueueOptions::default()
                        },
                    )
                    .await?;
                channel
                    .assert_queue(
                        &fanout,
                        QueueOptions {
                            exclusive: true,
                            auto_delete: true,
                            ..QueueOptions::default()
                        },
                    )
                    .await?;
                Ok::<_, IslandError>(())
            })
            .await?;

        self.subscribe_defaults().await?;
        inner
            .proc_file
            .write(ProcStatus::Initialized, &inner.fanout_queue)
            .await;
        Ok(())
    }

    /// Subscribes to one routing key.
    ///
    /// # Errors
    ///
    /// Returns the error that prevented binding the queue.
    pub async fn subscribe_event(
        &self,
        key: &str,
        handler: Arc<dyn EventHandler>,
        options: SubscriptionOptions,
    ) -> Result<(), IslandError> {
        self.subscribe(Subscription::Exact(key.to_string()), handler, options)
            .await
    }

    /// Subscribes to every routing key matching a topic pattern.
    ///
    /// # Errors
    ///
    /// Returns the error that prevented binding the queue.
    pub async fn subscribe_pattern(
        &self,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
        options: SubscriptionOptions,
    ) -> Result<(), IslandError> {
        self.subscribe(Subscription::Pattern(TopicPattern::new(pattern)), handler, options)
            .await
    }

    async fn subscribe(
        &self,
        subscription: Subscription,
        handler: Arc<dyn EventHandler>,
        options: SubscriptionOptions,
    ) -> Result<(), IslandError> {
        let queue = if options.every_node_listen {
            self.inner.fanout_queue.clone()
        } else {
            self.inner.round_robin_queue.clone()
        };
        let bound_queue = queue.clone();
        let pattern = subscription.routing_pattern().to_string();
        self.inner
            .consumer_pool
            .using_channel(|channel| async move {
                channel
                    .bind_queue(&bound_queue, EVENT_EXCHANGE, &pattern)
                    .await
                    .map_err(IslandError::from)
            })
            .await?;
        debug!(
            queue = %queue,
            pattern = %subscription.routing_pattern(),
            "event subscribed"
        );
        self.inner
            .subscribers
            .lock()
            .push(Subscriber::new(subscription, queue, handler));
        Ok(())
    }

    /// Adds a hook run on every decoded event before dispatch.
    pub fn register_hook(&self, hook: Arc<dyn ValueHook>) {
        self.inner.hooks.register((), hook);
    }

    /// Adds a hook run on every subscriber failure.
    pub fn register_error_hook(&self, hook: Arc<dyn ErrorHook>) {
        self.inner.error_hooks.register((), hook);
    }

    /// Starts consuming both queues and announces this node.
    ///
    /// # Errors
    ///
    /// Returns the error that prevented consuming.
    pub async fn start_consume(&self) -> Result<(), IslandError> {
        let inner = &self.inner;
        let config = &inner.config;
        let channel = inner
            .consumer_pool
            .get_prefetch_channel(config.event_prefetch)
            .await?;
        for queue in [&inner.round_robin_queue, &inner.fanout_queue] {
            let tag = format!("{}.{}.{}", config.service_name, config.host_name, queue);
            let consumer = channel
                .consume(
                    queue,
                    ConsumeOptions {
                        consumer_tag: Some(tag.clone()),
                        no_ack: false,
                    },
                )
                .await?;
            inner.consumers.lock().push(ConsumerInfo {
                channel: Arc::clone(&channel),
                tag,
                queue: queue.clone(),
            });
            let service = self.clone();
            let consumer_channel = Arc::clone(&channel);
            let handle =
                tokio::spawn(async move { service.consume_loop(consumer_channel, consumer).await });
            inner.consume_loops.lock().push(handle);
        }

        let started = SystemNodeStarted {
            name: inner.fanout_queue.clone(),
            island: config.service_name.clone(),
        };
        self.publish_event(&started).await?;
        inner
            .proc_file
            .write(ProcStatus::Started, &inner.fanout_queue)
            .await;
        Ok(())
    }

    /// Publishes an event outside of any request chain.
    ///
    /// # Errors
    ///
    /// Returns the error that prevented publishing.
    pub async fn publish_event<E>(&self, event: &E) -> Result<(), IslandError>
    where
        E: Event + ?Sized,
    {
        self.publish_event_with(&RequestContext::new(), event).await
    }

    /// Publishes an event on behalf of `ctx`.
    ///
    /// # Errors
    ///
    /// Returns the error that prevented publishing.
    pub async fn publish_event_with<E>(&self, ctx: &RequestContext, event: &E) -> Result<(), IslandError>
    where
        E: Event + ?Sized,
    {
        let config = &self.inner.config;
        let mut headers = ctx.outgoing_headers(&config.service_name, &config.host_name);
        headers.extra.route_logs.clear();
        let properties = Properties {
            timestamp: Some(event.published_at().unwrap_or_else(timestamp_millis)),
            headers: headers.to_table(),
            ..Properties::default()
        };
        let key = event.key().to_string();
        let content = serde_json::to_vec(&event.args())?;
        debug!(key = %key, tattoo = ?headers.tattoo, "publish event");
        self.inner
            .pool
            .using_channel(|channel| async move {
                channel
                    .publish(EVENT_EXCHANGE, &key, content, properties)
                    .await
                    .map_err(IslandError::from)
            })
            .await
    }

    /// Publishes ad-hoc arguments under a routing key.
    ///
    /// # Errors
    ///
    /// Returns the error that prevented publishing.
    pub async fn publish_to(&self, key: &str, args: Value) -> Result<(), IslandError> {
        self.publish_event(&BaseEvent::new(key, args)).await
    }

    /// Stops the service.
    ///
    /// Consumers are cancelled first, then the call waits for the events being
    /// handled before the consumer channel goes away.
    pub async fn purge(&self) {
        let inner = &self.inner;
        inner
            .proc_file
            .write(ProcStatus::Stopped, &inner.fanout_queue)
            .await;
        inner.stopping.store(true, Ordering::SeqCst);

        let consumers: Vec<ConsumerInfo> = inner.consumers.lock().drain(..).collect();
        for info in &consumers {
            info!(queue = %info.queue, "stop consuming");
            if let Err(e) = info.channel.cancel(&info.tag).await {
                debug!(consumer_tag = %info.tag, error = %e, "cancel failed");
            }
        }
        let loops: Vec<JoinHandle<()>> = inner.consume_loops.lock().drain(..).collect();
        for handle in loops {
            let _ = handle.await;
        }
        inner.collector.wait_for_drain(EVENT_STATS).await;
        inner.subscribers.lock().clear();
        inner.hooks.clear();
        inner.error_hooks.clear();

        for info in consumers {
            let _ = info.channel.close().await;
        }
    }

    /// Logs the events currently being handled.
    pub fn sig_info(&self) {
        self.inner.collector.sig_info(EVENT_STATS);
    }

    async fn subscribe_defaults(&self) -> Result<(), IslandError> {
        let every_node = SubscriptionOptions::every_node();
        self.subscribe_event(
            LoggerLevelChanged::KEY,
            Arc::new(|event: ReceivedEvent, _ctx: RequestContext| async move {
                let changed: LoggerLevelChanged = event.decode()?;
                info!(category = %changed.category, level = %changed.level, "logger level changed");
                Ok::<_, IslandError>(())
            }),
            every_node,
        )
        .await?;
        self.subscribe_event(
            LoggerTypeChanged::KEY,
            Arc::new(|event: ReceivedEvent, _ctx: RequestContext| async move {
                let changed: LoggerTypeChanged = event.decode()?;
                info!(kind = %changed.kind, "logger type changed");
                Ok::<_, IslandError>(())
            }),
            every_node,
        )
        .await?;

        let collector = Arc::clone(&self.inner.collector);
        self.subscribe_event(
            SystemDiagnosis::KEY,
            Arc::new(move |event: ReceivedEvent, _ctx: RequestContext| {
                let collector = Arc::clone(&collector);
                async move {
                    let diagnosis: SystemDiagnosis = event.decode()?;
                    let path = Path::new(&diagnosis.file_name);
                    match diagnosis.args.first().map(String::as_str) {
                        Some("ping") => DiagnosisAnswer::message(json!("pong")).append_to(path).await,
                        Some("status") => {
                            let status = serde_json::to_value(collector.snapshot())?;
                            DiagnosisAnswer::message(status).append_to(path).await;
                        }
                        _ => {}
                    }
                    Ok::<_, IslandError>(())
                }
            }),
            every_node,
        )
        .await
    }

    async fn consume_loop(self, channel: SharedChannel, mut consumer: Consumer) {
        let queue = consumer.queue().to_string();
        while let Some(delivery) = consumer.recv().await {
            let routing_key = if delivery.routing_key == self.inner.fanout_queue {
                SystemDiagnosis::KEY.to_string()
            } else {
                delivery.routing_key.clone()
            };
            let ticket = self.inner.collector.collect_request(
                EVENT_STATS,
                stats_key(&routing_key),
                delivery.properties.timestamp,
            );
            let service = self.clone();
            let channel = Arc::clone(&channel);
            let queue = queue.clone();
            tokio::spawn(async move {
                service
                    .on_delivery(channel, &queue, &routing_key, delivery, ticket)
                    .await;
            });
        }

        if self.inner.stopping.load(Ordering::SeqCst) {
            debug!(queue = %queue, "event consumer stopped");
            return;
        }
        error!(queue = %queue, "The event queue is canceled unexpectedly");
        let error = IslandError::runtime(
            ErrorKind::Fatal,
            self.inner.config.island_code,
            ErrorCode::ConsumerIsCanceled,
            format!("event consumer of {queue} is canceled"),
        );
        self.inner.shutdown.trigger("event", error);
    }

    async fn on_delivery(
        &self,
        channel: SharedChannel,
        queue: &str,
        routing_key: &str,
        delivery: Delivery,
        ticket: RequestTicket,
    ) {
        let result = self.handle_message(queue, routing_key, &delivery).await;
        let failed = result.is_err();
        if let Err(error) = result {
            self.send_error_log(error, routing_key, &delivery.content).await;
        }

        if let Err(e) = channel.ack(delivery.delivery_tag).await {
            debug!(error = %e, "event ack failed");
        }
        self.inner.collector.collect_executed(ticket, failed);
    }

    async fn handle_message(
        &self,
        queue: &str,
        routing_key: &str,
        delivery: &Delivery,
    ) -> Result<(), IslandError> {
        let args: Value = serde_json::from_slice(&delivery.content)?;
        let args = self.inner.hooks.run(&(), args).await?;
        let headers = MessageHeaders::from_table(&delivery.properties.headers);
        let subscribers: Vec<Subscriber> = self
            .inner
            .subscribers
            .lock()
            .iter()
            .filter(|s| s.accepts(queue, routing_key))
            .cloned()
            .collect();

        let event = ReceivedEvent {
            key: routing_key.to_string(),
            args,
            published_at: delivery.properties.timestamp,
        };
        let ctx = RequestContext::serving(&headers, routing_key, EVENT_STATS, None);
        debug!(key = %routing_key, subscribers = subscribers.len(), "subscribe event");

        let outcomes = join_all(subscribers.iter().map(|subscriber| {
            let event = event.clone();
            let ctx = ctx.clone();
            async move {
                match subscriber.handler().handle(event.clone(), ctx).await {
                    Ok(()) => Ok(()),
                    Err(error) => {
                        let error = error
                            .with_default_extra("args", event.args)
                            .with_default_extra("event", event.key)
                            .with_default_extra("island", self.inner.config.service_name.as_str());
                        Err(self.inner.error_hooks.run(&(), error).await)
                    }
                }
            }
        }))
        .await;
        outcomes.into_iter().collect()
    }

    async fn send_error_log(&self, error: IslandError, routing_key: &str, content: &[u8]) {
        if error.is_expected() {
            debug!(key = %routing_key, error = %error, "expected error on handling event");
            return;
        }
        error!(key = %routing_key, error = %error, "error on handling event");
        if routing_key == ERROR_LOG_KEY {
            return;
        }
        let params = serde_json::from_slice::<Value>(content)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(content).into_owned()));
        let mut log = match error.to_wire() {
            Value::Object(log) => log,
            _ => serde_json::Map::new(),
        };
        log.insert("message".to_string(), Value::String(error.to_string()));
        log.insert("params".to_string(), params);
        if let Err(e) = self.publish_to(ERROR_LOG_KEY, Value::Object(log)).await {
            debug!(error = %e, "failed to publish error log");
        }
    }
}

/// Key under which an event is counted.
///
/// Cron events carry their schedule as trailing numeric segments, which would
/// give every tick a key of its own.
fn stats_key(routing_key: &str) -> &str {
    if routing_key.starts_with("cron") {
        routing_key.trim_end_matches(|c: char| c == '.' || c.is_ascii_digit())
    } else {
        routing_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_key_trims_cron_schedule() {
        assert_eq!(stats_key("cron.daily.0.30"), "cron.daily");
        assert_eq!(stats_key("cron.s.10"), "cron.s");
        assert_eq!(stats_key("user.created.1"), "user.created.1");
    }
}
