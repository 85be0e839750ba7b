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
    SharedChannel, timestamp_millis,
};
use crate::codec::RpcResponse;
use crate::config::IslandConfig;
use crate::context::RequestContext;
use crate::diag::{ProcFile, ProcStatus};
use crate::error::{ErrorCode, ErrorKind, IslandError};
use crate::headers::{MessageHeaders, RouteLog, RouteProtocol, RouteType};
use crate::hooks::{ErrorHook, HookRegistry, ValueHook};
use crate::pool::ChannelPool;
use crate::rpc::diagnosis::{self, DIAGNOSIS_CORRELATION_ID};
use crate::rpc::routing::is_flow_mode;
use crate::rpc::{
    Completion, PendingRequests, RpcEntity, RpcHandler, RpcOptions, RpcType, ShardRouter,
};
use crate::shutdown::Shutdown;
use crate::status::{RequestTicket, StatusCollector};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Delay before a request failed with status 503 is handed back to the broker.
pub const REDELIVERY_DELAY: Duration = Duration::from_secs(1);

/// Hooks run on the values of a served request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcHookType {
    /// Before an endpoint handler, on the request.
    PreEndpoint,
    /// After an endpoint handler, on the result.
    PostEndpoint,
    /// Before an rpc handler, on the request.
    PreRpc,
    /// After an rpc handler, on the result.
    PostRpc,
}

/// Hooks run on the error of a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcErrorHookType {
    /// Before the error of an endpoint is replied.
    PreEndpointError,
    /// After the error of an endpoint was replied.
    PostEndpointError,
    /// Before the error of an rpc is replied.
    PreRpcError,
    /// After the error of an rpc was replied.
    PostRpcError,
}

/// Per-call options of [`RpcService::invoke_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvokeOptions {
    /// Wait timeout; the configured default when `None`.
    pub timeout: Option<Duration>,
}

impl InvokeOptions {
    /// Creates options with a wait timeout.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

/// A decoded response together with the bytes it was decoded from.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    /// Decoded result.
    pub body: Value,
    /// Response body as received.
    pub raw: Vec<u8>,
}

struct ConsumerInfo {
    channel: SharedChannel,
    queue: String,
    tag: String,
    shard: usize,
}

/// A request that will be served, already counted as ongoing.
struct Admitted {
    entity: RpcEntity,
    reply_to: String,
    ticket: RequestTicket,
}

struct Inner {
    config: Arc<IslandConfig>,
    pool: ChannelPool,
    consumer_pool: ChannelPool,
    collector: Arc<StatusCollector>,
    shutdown: Shutdown,
    response_queue: String,
    proc_file: ProcFile,
    pending: PendingRequests<Delivery>,
    router: ShardRouter,
    entities: Mutex<BTreeMap<String, RpcEntity>>,
    hooks: HookRegistry<RpcHookType, dyn ValueHook>,
    error_hooks: HookRegistry<RpcErrorHookType, dyn ErrorHook>,
    request_consumers: Mutex<Vec<ConsumerInfo>>,
    request_loops: Mutex<Vec<JoinHandle<()>>>,
    retired_channels: Mutex<Vec<SharedChannel>>,
    response_consumer: Mutex<Option<ConsumerInfo>>,
    stopping: AtomicBool,
}

/// Request/response messaging over the broker.
///
/// # Topology
///
/// - `rpc.req.<service>.<shard>`: `N` request queues shared by every
///   instance of the service
/// - one direct exchange per registered rpc name, binding every request queue
///   with the shard number as routing key
/// - `rpc.res.<service>.<host>.<uuid>`: the exclusive response queue of this
///   instance
///
/// A caller picks a shard, publishes the request to the exchange named after
/// the rpc and waits on the response queue for the reply carrying the same
/// correlation id. Any instance consuming that shard serves the request.
///
/// # Deadlines
///
/// A request carries the caller's wait timeout as its expiration. The serving
/// handler gets that timeout minus the reply margin, capped by the execution
/// timeout, and nested calls made from it wait at most for what is left. A
/// nested call left with no more than the reply margin fails at once, so the
/// hop that ran out of budget is the one reported in the timeout error.
///
/// # Examples
///
/// ```rust
/// use island::broker::MemoryBroker;
/// use island::config::IslandConfig;
/// use island::context::RequestContext;
/// use island::error::IslandError;
/// use island::pool::ChannelPool;
/// use island::rpc::{RpcOptions, RpcService, RpcType};
/// use island::shutdown::Shutdown;
/// use island::status::StatusCollector;
/// use serde_json::{json, Value};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), IslandError> {
/// let config = Arc::new(IslandConfig::new("accounts").with_rpc_distrib_size(2));
/// let pool = ChannelPool::new(Arc::new(MemoryBroker::new()));
/// pool.initialize("memory://local", 10).await?;
///
/// let rpc = RpcService::new(config, pool, Arc::new(StatusCollector::default()), Shutdown::new());
/// rpc.initialize().await?;
/// rpc.register(
///     "greet",
///     Arc::new(|req: Value, _ctx: RequestContext| async move {
///         Ok::<_, IslandError>(json!(format!("hello {}", req.as_str().unwrap_or("?"))))
///     }),
///     RpcType::Rpc,
///     RpcOptions::default(),
/// );
/// rpc.listen().await?;
///
/// assert_eq!(rpc.invoke("greet", json!("world")).await?, json!("hello world"));
/// rpc.purge().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RpcService {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RpcService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcService")
            .field("service", &self.inner.config.service_name)
            .field("response_queue", &self.inner.response_queue)
            .field("pending", &self.inner.pending.len())
            .finish()
    }
}

impl RpcService {
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

    /// Creates a service that consumes through a separate pool, so consumers
    /// and publishers do not share a connection.
    pub fn with_consumer_pool(
        config: Arc<IslandConfig>,
        pool: ChannelPool,
        consumer_pool: ChannelPool,
        collector: Arc<StatusCollector>,
        shutdown: Shutdown,
    ) -> Self {
        let response_queue = format!(
            "rpc.res.{}.{}.{}",
            config.service_name,
            config.host_name,
            uuid::Uuid::new_v4()
        );
        let proc_file = ProcFile::new(&config.proc_dir, "rpc.proc");
        let router = ShardRouter::new(config.rpc_distrib_size);
        Self {
            inner: Arc::new(Inner {
                config,
                pool,
                consumer_pool,
                collector,
                shutdown,
                response_queue,
                proc_file,
                pending: PendingRequests::new(),
                router,
                entities: Mutex::new(BTreeMap::new()),
                hooks: HookRegistry::new(),
                error_hooks: HookRegistry::new(),
                request_consumers: Mutex::new(Vec::new()),
                request_loops: Mutex::new(Vec::new()),
                retired_channels: Mutex::new(Vec::new()),
                response_consumer: Mutex::new(None),
                stopping: AtomicBool::new(false),
            }),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &IslandConfig {
        &self.inner.config
    }

    /// Returns the name of this instance's response queue.
    #[must_use]
    pub fn response_queue(&self) -> &str {
        &self.inner.response_queue
    }

    /// Returns the number of calls waiting for a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Returns the shard router.
    #[must_use]
    pub fn router(&self) -> &ShardRouter {
        &self.inner.router
    }

    /// Declares the response queue and starts consuming responses.
    ///
    /// # Errors
    ///
    /// Returns the broker or pool error that prevented the setup.
    pub async fn initialize(&self) -> Result<(), IslandError> {
        let inner = &self.inner;
        inner.stopping.store(false, Ordering::SeqCst);
        inner
            .proc_file
            .write(ProcStatus::Initializing, &inner.response_queue)
            .await;
        info!(queue = %inner.response_queue, "consuming responses");

        let queue = inner.response_queue.clone();
        let options = QueueOptions {
            durable: false,
            exclusive: true,
            auto_delete: false,
            expires: Some(inner.config.rpc_wait_timeout + inner.config.service_load_time),
        };
        inner
            .consumer_pool
            .using_channel(|channel| async move {
                channel
                    .assert_queue(&queue, options)
                    .await
                    .map_err(IslandError::from)
            })
            .await?;

        self.consume_responses().await?;
        inner
            .proc_file
            .write(ProcStatus::Initialized, &inner.response_queue)
            .await;
        Ok(())
    }

    /// Registers a handler. Takes effect on the next [`listen`](Self::listen).
    pub fn register(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn RpcHandler>,
        rpc_type: RpcType,
        options: RpcOptions,
    ) {
        let name = name.into();
        debug!(rpc_name = %name, rpc_type = %rpc_type, "rpc registered");
        self.inner.entities.lock().insert(
            name.clone(),
            RpcEntity {
                name,
                rpc_type,
                handler,
                options,
            },
        );
    }

    /// Returns `true` if an rpc of that name is registered.
    #[must_use]
    pub fn has_rpc(&self, name: &str) -> bool {
        self.inner.entities.lock().contains_key(name)
    }

    /// Returns the registered rpc names with their types.
    #[must_use]
    pub fn rpc_list(&self) -> Vec<(String, RpcType)> {
        self.inner
            .entities
            .lock()
            .values()
            .map(|e| (e.name.clone(), e.rpc_type))
            .collect()
    }

    /// Adds a hook to the chain of `kind`.
    pub fn register_hook(&self, kind: RpcHookType, hook: Arc<dyn ValueHook>) {
        self.inner.hooks.register(kind, hook);
    }

    /// Adds an error hook to the chain of `kind`.
    pub fn register_error_hook(&self, kind: RpcErrorHookType, hook: Arc<dyn ErrorHook>) {
        self.inner.error_hooks.register(kind, hook);
    }

    /// Declares the request topology for every registered rpc and starts
    /// serving requests.
    ///
    /// # Errors
    ///
    /// Returns the broker or pool error that prevented the setup.
    pub async fn listen(&self) -> Result<(), IslandError> {
        let inner = &self.inner;
        let config = &inner.config;
        let queues: Vec<String> = (0..config.rpc_distrib_size)
            .map(|shard| format!("rpc.req.{}.{}", config.service_name, shard))
            .collect();
        let names: Vec<String> = inner.entities.lock().keys().cloned().collect();
        let expires = config.rpc_wait_timeout + config.service_load_time;

        let setup_queues = queues.clone();
        inner
            .consumer_pool
            .using_channel(|channel| async move {
                for queue in &setup_queues {
                    let options = QueueOptions {
                        expires: Some(expires),
                        ..QueueOptions::default()
                    };
                    channel.assert_queue(queue, options).await?;
                }
                let options = ExchangeOptions {
                    durable: false,
                    auto_delete: true,
                };
                for name in &names {
                    channel
                        .assert_exchange(name, ExchangeKind::Direct, options)
                        .await?;
                    for (shard, queue) in setup_queues.iter().enumerate() {
                        channel.bind_queue(queue, name, &shard.to_string()).await?;
                    }
                }
                Ok::<_, IslandError>(())
            })
            .await?;

        for (shard, queue) in queues.into_iter().enumerate() {
            let channel = inner
                .consumer_pool
                .get_prefetch_channel(config.rpc_prefetch)
                .await?;
            let info = ConsumerInfo {
                tag: format!("{}.{}.{}", config.service_name, config.host_name, queue),
                channel,
                queue,
                shard,
            };
            self.consume_requests(&info).await?;
            inner.request_consumers.lock().push(info);
        }

        inner
            .proc_file
            .write(ProcStatus::Started, &inner.response_queue)
            .await;
        info!(service = %config.service_name, shards = config.rpc_distrib_size, "rpc listening");
        Ok(())
    }

    /// Stops consuming requests without forgetting the consumers.
    pub async fn pause_all(&self) {
        for (channel, tag) in self.consumer_handles() {
            if let Err(e) = channel.cancel(&tag).await {
                debug!(consumer_tag = %tag, error = %e, "pause failed");
            }
        }
    }

    /// Resumes the consumers stopped by [`pause_all`](Self::pause_all).
    ///
    /// # Errors
    ///
    /// Returns the first broker error raised while consuming again.
    pub async fn resume_all(&self) -> Result<(), IslandError> {
        let infos: Vec<ConsumerInfo> = self
            .inner
            .request_consumers
            .lock()
            .iter()
            .map(|c| ConsumerInfo {
                channel: Arc::clone(&c.channel),
                queue: c.queue.clone(),
                tag: c.tag.clone(),
                shard: c.shard,
            })
            .collect();
        for info in &infos {
            self.consume_requests(info).await?;
        }
        Ok(())
    }

    /// Cancels every request consumer and forgets every registered rpc.
    ///
    /// Cancellation errors are ignored, since the channel may already be gone.
    pub async fn unregister_all(&self) {
        self.cancel_request_consumers().await;
        self.inner.entities.lock().clear();
    }

    async fn cancel_request_consumers(&self) {
        let consumers: Vec<ConsumerInfo> = self.inner.request_consumers.lock().drain(..).collect();
        for info in consumers {
            if let Err(e) = info.channel.cancel(&info.tag).await {
                debug!(consumer_tag = %info.tag, error = %e, "cancel failed");
            }
            self.inner.retired_channels.lock().push(info.channel);
        }
    }

    /// Stops the service.
    ///
    /// Request consumers are cancelled first, then the call waits for the
    /// requests being served to finish before the response consumer and the
    /// consumer channels go away. Responses already delivered to this
    /// instance still reach their callers.
    pub async fn purge(&self) {
        let inner = &self.inner;
        inner
            .proc_file
            .write(ProcStatus::Stopped, &inner.response_queue)
            .await;
        info!("stop serving");
        self.cancel_request_consumers().await;

        // Every delivery a loop takes is admitted before it is handed off, so
        // once the loops end the ongoing counts cover all of them.
        let loops: Vec<JoinHandle<()>> = inner.request_loops.lock().drain(..).collect();
        for handle in loops {
            let _ = handle.await;
        }
        inner.entities.lock().clear();
        inner.collector.wait_for_drain(RpcType::Rpc.as_str()).await;
        inner.collector.wait_for_drain(RpcType::Endpoint.as_str()).await;

        inner.stopping.store(true, Ordering::SeqCst);
        let response = inner.response_consumer.lock().take();
        if let Some(info) = response {
            let _ = info.channel.cancel(&info.tag).await;
            let _ = info.channel.close().await;
        }
        let retired: Vec<SharedChannel> = inner.retired_channels.lock().drain(..).collect();
        for channel in retired {
            let _ = channel.close().await;
        }

        inner.hooks.clear();
        inner.error_hooks.clear();
        inner.pending.forget_timed_out();
        inner.router.reset();
    }

    /// Logs the requests currently being served.
    pub fn sig_info(&self) {
        self.inner.collector.sig_info(RpcType::Rpc.as_str());
        self.inner.collector.sig_info(RpcType::Endpoint.as_str());
    }

    /// Calls an rpc outside of any request chain.
    ///
    /// # Errors
    ///
    /// Returns the error replied by the handler, a Fatal timeout error when
    /// no reply arrives in time, or the error that prevented publishing.
    pub async fn invoke(&self, name: &str, payload: Value) -> Result<Value, IslandError> {
        self.invoke_with(&RequestContext::new(), name, payload, InvokeOptions::default())
            .await
    }

    /// Calls an rpc on behalf of `ctx`.
    ///
    /// The wait is bounded by `ctx`'s deadline.
    ///
    /// # Errors
    ///
    /// See [`invoke`](Self::invoke).
    pub async fn invoke_with(
        &self,
        ctx: &RequestContext,
        name: &str,
        payload: Value,
        options: InvokeOptions,
    ) -> Result<Value, IslandError> {
        self.invoke_raw(ctx, name, payload, options)
            .await
            .map(|response| response.body)
    }

    /// Calls an rpc and returns the response bytes along with the result.
    ///
    /// # Errors
    ///
    /// See [`invoke`](Self::invoke).
    pub async fn invoke_raw(
        &self,
        ctx: &RequestContext,
        name: &str,
        payload: Value,
        options: InvokeOptions,
    ) -> Result<RawResponse, IslandError> {
        let inner = &self.inner;
        let config = &inner.config;
        let name = name.trim();

        let requested = options.timeout.unwrap_or(config.rpc_wait_timeout);
        let wait = ctx.remaining().map_or(requested, |left| left.min(requested));
        if wait <= config.rpc_reply_margin {
            return Err(self.timeout_error("invoke", name, ctx.root(), wait));
        }

        let content = serde_json::to_vec(&payload)?;
        let shard = inner.router.select();
        let correlation_id = uuid::Uuid::new_v4().to_string();
        ctx.log_route(RouteLog {
            node: config.host_name.clone(),
            sender: config.service_name.clone(),
            context: name.to_string(),
            kind: RouteType::Req,
            protocol: RouteProtocol::Rpc,
            correlation_id: correlation_id.clone(),
        });
        let headers = ctx.outgoing_headers(&config.service_name, &config.host_name);
        let properties = Properties {
            correlation_id: Some(correlation_id.clone()),
            reply_to: Some(inner.response_queue.clone()),
            expiration: Some(wait),
            timestamp: Some(timestamp_millis()),
            headers: headers.to_table(),
        };

        let mut receiver = inner.pending.register(&correlation_id, name);
        let _waiting = inner.pending.guard(&correlation_id);
        let exchange = name.to_string();
        let routing_key = shard.to_string();
        let published = inner
            .pool
            .using_channel(|channel| async move {
                channel
                    .publish(&exchange, &routing_key, content, properties)
                    .await
                    .map_err(IslandError::from)
            })
            .await;
        if let Err(e) = published {
            inner.pending.cancel(&correlation_id);
            return Err(e);
        }
        debug!(rpc_name = %name, correlation_id = %correlation_id, shard, "rpc invoked");

        let delivery = match tokio::time::timeout(wait, &mut receiver).await {
            Ok(Ok(delivery)) => delivery,
            Ok(Err(_)) => return Err(self.discarded_error(name)),
            Err(_) => match inner.pending.time_out(&correlation_id) {
                Some(_) => return Err(self.timeout_error("invoke", name, ctx.root(), wait)),
                None => receiver.try_recv().map_err(|_| self.discarded_error(name))?,
            },
        };

        let headers = MessageHeaders::from_table(&delivery.properties.headers);
        ctx.route_logs().replace(headers.extra.route_logs);
        if headers.extra.flow {
            info!(rpc_name = %name, shard, "response reports flow mode");
            inner.router.quarantine(shard, config.flow_mode_delay);
        }
        let body = RpcResponse::decode(&delivery.content).into_result()?;
        Ok(RawResponse {
            body,
            raw: delivery.content,
        })
    }

    fn timeout_error(
        &self,
        location: &str,
        rpc_name: &str,
        parent: Option<&str>,
        budget: Duration,
    ) -> IslandError {
        IslandError::runtime(
            ErrorKind::Fatal,
            self.inner.config.island_code,
            ErrorCode::RpcTimeout,
            format!("RPC({rpc_name}) does not return in {} ms", budget.as_millis()),
        )
        .with_status_code(504)
        .with_extra("location", location)
        .with_extra("rpcName", rpc_name)
        .with_extra("parent", parent.unwrap_or(rpc_name))
        .with_extra("island", self.inner.config.service_name.as_str())
    }

    fn discarded_error(&self, rpc_name: &str) -> IslandError {
        IslandError::runtime(
            ErrorKind::Etc,
            self.inner.config.island_code,
            ErrorCode::HandleMessageError,
            format!("RPC({rpc_name}) was discarded before a response arrived"),
        )
    }

    fn consumer_handles(&self) -> Vec<(SharedChannel, String)> {
        self.inner
            .request_consumers
            .lock()
            .iter()
            .map(|c| (Arc::clone(&c.channel), c.tag.clone()))
            .collect()
    }

    async fn consume_responses(&self) -> Result<(), IslandError> {
        let inner = &self.inner;
        let config = &inner.config;
        let channel = inner
            .consumer_pool
            .get_prefetch_channel(config.rpc_prefetch)
            .await?;
        let tag = format!(
            "{}.{}.{}",
            config.service_name, config.host_name, inner.response_queue
        );
        let consumer = channel
            .consume(
                &inner.response_queue,
                ConsumeOptions {
                    consumer_tag: Some(tag.clone()),
                    no_ack: config.rpc_res_noack,
                },
            )
            .await?;
        *inner.response_consumer.lock() = Some(ConsumerInfo {
            channel: Arc::clone(&channel),
            queue: inner.response_queue.clone(),
            tag,
            shard: 0,
        });

        let service = self.clone();
        tokio::spawn(async move { service.response_loop(channel, consumer).await });
        Ok(())
    }

    async fn response_loop(self, channel: SharedChannel, mut consumer: Consumer) {
        let no_ack = self.inner.config.rpc_res_noack;
        while let Some(delivery) = consumer.recv().await {
            let delivery_tag = delivery.delivery_tag;
            self.on_response(delivery);
            if !no_ack {
                if let Err(e) = channel.ack(delivery_tag).await {
                    debug!(error = %e, "response ack failed");
                }
            }
        }

        if self.inner.stopping.load(Ordering::SeqCst) {
            debug!(queue = %consumer.queue(), "response consumer stopped");
            return;
        }
        error!(
            queue = %consumer.queue(),
            "The consumer is canceled, will lose following responses"
        );
        let error = IslandError::runtime(
            ErrorKind::Fatal,
            self.inner.config.island_code,
            ErrorCode::ConsumerIsCanceled,
            "response consumer is canceled",
        );
        self.inner.shutdown.trigger("rpc", error);
    }

    fn on_response(&self, delivery: Delivery) {
        let Some(correlation_id) = delivery.properties.correlation_id.clone() else {
            info!("Got a response with no correlationId");
            return;
        };
        if correlation_id == DIAGNOSIS_CORRELATION_ID {
            let service = self.clone();
            tokio::spawn(async move { diagnosis::answer(&service, &delivery.content).await });
            return;
        }
        match self.inner.pending.complete(&correlation_id, delivery) {
            Completion::Resolved => {}
            Completion::LateArrival(name) => {
                warn!(rpc_name = %name, correlation_id = %correlation_id, "Got a response after timed out");
            }
            Completion::Unknown => {
                info!(correlation_id = %correlation_id, "Got an unknown response");
            }
        }
    }

    async fn consume_requests(&self, info: &ConsumerInfo) -> Result<(), IslandError> {
        let consumer = info
            .channel
            .consume(
                &info.queue,
                ConsumeOptions {
                    consumer_tag: Some(info.tag.clone()),
                    no_ack: false,
                },
            )
            .await?;
        let service = self.clone();
        let channel = Arc::clone(&info.channel);
        let shard = info.shard;
        let handle =
            tokio::spawn(async move { service.request_loop(channel, shard, consumer).await });
        let mut loops = self.inner.request_loops.lock();
        loops.retain(|handle| !handle.is_finished());
        loops.push(handle);
        Ok(())
    }

    async fn request_loop(self, channel: SharedChannel, shard: usize, mut consumer: Consumer) {
        while let Some(delivery) = consumer.recv().await {
            let admitted = self.admit(&delivery);
            let service = self.clone();
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { service.on_request(channel, shard, delivery, admitted).await });
        }
        debug!(queue = %consumer.queue(), "request consumer ended");
    }

    /// Looks up the handler of a request and counts the request as ongoing.
    ///
    /// Returns `None` for requests that will be dropped unanswered.
    fn admit(&self, delivery: &Delivery) -> Option<Admitted> {
        let reply_to = delivery.properties.reply_to.clone()?;
        let entity = self.inner.entities.lock().get(&delivery.exchange).cloned()?;
        let ticket = self.inner.collector.collect_request(
            entity.rpc_type.as_str(),
            &entity.name,
            delivery.properties.timestamp,
        );
        Some(Admitted {
            entity,
            reply_to,
            ticket,
        })
    }

    async fn on_request(
        &self,
        channel: SharedChannel,
        shard: usize,
        delivery: Delivery,
        admitted: Option<Admitted>,
    ) {
        let delivery_tag = delivery.delivery_tag;
        let rpc_name = delivery.exchange.clone();
        let Some(Admitted {
            entity,
            reply_to,
            ticket,
        }) = admitted
        else {
            if self.inner.entities.lock().contains_key(&rpc_name) {
                let error = IslandError::runtime(
                    ErrorKind::Fatal,
                    self.inner.config.island_code,
                    ErrorCode::MissingReplyToInRpc,
                    format!("RPC({rpc_name}) request has no replyTo"),
                );
                warn!(rpc_name = %rpc_name, error = %error, "dropping request");
            } else {
                warn!(rpc_name = %rpc_name, "no such RPC found");
            }
            ack(&channel, delivery_tag).await;
            return;
        };
        let config = &self.inner.config;
        let mut headers = MessageHeaders::from_table(&delivery.properties.headers);
        let published_at = delivery.properties.timestamp;
        if is_flow_mode(published_at, timestamp_millis()) {
            info!(shard, rpc_name = %rpc_name, "RPC queue behinds by flow control");
            headers.extra.flow = true;
        }

        let budget = delivery
            .properties
            .expiration
            .map_or(config.rpc_exec_timeout, |expiration| {
                config
                    .rpc_exec_timeout
                    .min(expiration.saturating_sub(config.rpc_reply_margin))
            });
        let ctx = RequestContext::serving(
            &headers,
            &rpc_name,
            entity.rpc_type.as_str(),
            Some(Instant::now() + budget),
        );
        let parsed = serde_json::from_slice::<Value>(&delivery.content);
        let request = parsed.as_ref().cloned().unwrap_or(Value::Null);
        let outcome = match parsed {
            Ok(request) => {
                match tokio::time::timeout(budget, self.serve(&entity, request, ctx.clone())).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(self.timeout_error("consume", &rpc_name, ctx.root(), budget)),
                }
            }
            Err(e) => Err(IslandError::from(e)),
        };

        let reply_properties = |ctx: &RequestContext, headers: &MessageHeaders| {
            ctx.log_route(RouteLog {
                node: config.host_name.clone(),
                sender: config.service_name.clone(),
                context: rpc_name.clone(),
                kind: RouteType::Res,
                protocol: RouteProtocol::Rpc,
                correlation_id: delivery.properties.correlation_id.clone().unwrap_or_default(),
            });
            let mut headers = headers.clone();
            headers.extra.route_logs = ctx.route_logs().snapshot();
            Properties {
                correlation_id: delivery.properties.correlation_id.clone(),
                headers: headers.to_table(),
                ..Properties::default()
            }
        };

        match outcome {
            Ok(result) => {
                debug!(rpc_name = %rpc_name, "[RPC][RESP]");
                let properties = reply_properties(&ctx, &headers);
                self.reply(&reply_to, RpcResponse::success(result), properties)
                    .await;
                ack(&channel, delivery_tag).await;
                self.inner.collector.collect_executed(ticket, false);
            }
            Err(error) if error.needs_redelivery() => {
                self.inner.collector.collect_executed(ticket, true);
                debug!(rpc_name = %rpc_name, "requeueing request after 503");
                tokio::spawn(async move {
                    tokio::time::sleep(REDELIVERY_DELAY).await;
                    if let Err(e) = channel.nack(delivery_tag, true).await {
                        debug!(error = %e, "delayed nack failed");
                    }
                });
            }
            Err(error) => {
                let (pre, post) = match entity.rpc_type {
                    RpcType::Rpc => (RpcErrorHookType::PreRpcError, RpcErrorHookType::PostRpcError),
                    RpcType::Endpoint => (
                        RpcErrorHookType::PreEndpointError,
                        RpcErrorHookType::PostEndpointError,
                    ),
                };
                let error = self.inner.error_hooks.run(&pre, error).await;
                let error = error
                    .with_default_extra("island", config.service_name.as_str())
                    .with_default_extra("rpcName", rpc_name.as_str())
                    .with_default_extra("req", request)
                    .ensure_uuid();
                let properties = reply_properties(&ctx, &headers);
                self.reply(&reply_to, RpcResponse::failure(&error), properties)
                    .await;
                let error = self.inner.error_hooks.run(&post, error).await;
                if !error.is_expected() {
                    let extra = Value::Object(error.extra().clone());
                    warn!(
                        island = %config.service_name,
                        rpc_name = %rpc_name,
                        error = %error,
                        extra = %extra,
                        "Got an error during rpc"
                    );
                }
                if error.is_critical() {
                    self.inner.collector.collect_executed(ticket, true);
                    self.inner.shutdown.trigger("rpc", error);
                    return;
                }
                ack(&channel, delivery_tag).await;
                self.inner.collector.collect_executed(ticket, true);
            }
        }
    }

    async fn serve(
        &self,
        entity: &RpcEntity,
        request: Value,
        ctx: RequestContext,
    ) -> Result<Value, IslandError> {
        let (pre, post) = match entity.rpc_type {
            RpcType::Rpc => (RpcHookType::PreRpc, RpcHookType::PostRpc),
            RpcType::Endpoint => (RpcHookType::PreEndpoint, RpcHookType::PostEndpoint),
        };
        let island_code = self.inner.config.island_code;

        let request = match &entity.options.query {
            Some(schema) => {
                let request = schema.sanitize(request);
                schema.validate(&request).map_err(|reason| {
                    IslandError::runtime(
                        ErrorKind::Logic,
                        island_code,
                        ErrorCode::WrongParameterSchema,
                        "Wrong parameter schema",
                    )
                    .with_extra("schema", reason)
                })?;
                request
            }
            None => request,
        };
        debug!(rpc_name = %entity.name, request = %request, "[RPC][REQ]");

        let request = self.inner.hooks.run(&pre, request).await?;
        let result = entity.handler.handle(request, ctx).await?;
        let result = self.inner.hooks.run(&post, result).await?;

        match &entity.options.result {
            Some(schema) => {
                let result = schema.sanitize(result);
                schema.validate(&result).map_err(|reason| {
                    IslandError::runtime(
                        ErrorKind::Fatal,
                        island_code,
                        ErrorCode::HandleMessageError,
                        "Wrong result schema",
                    )
                    .with_extra("schema", reason)
                })?;
                Ok(result)
            }
            None => Ok(result),
        }
    }

    async fn reply(&self, reply_to: &str, response: RpcResponse, properties: Properties) {
        let queue = reply_to.to_string();
        let content = response.encode();
        let sent = self
            .inner
            .pool
            .using_channel(|channel| async move {
                channel
                    .send_to_queue(&queue, content, properties)
                    .await
                    .map_err(IslandError::from)
            })
            .await;
        if let Err(e) = sent {
            warn!(reply_to = %reply_to, error = %e, "failed to send rpc reply");
        }
    }
}

async fn ack(channel: &SharedChannel, delivery_tag: u64) {
    if let Err(e) = channel.ack(delivery_tag).await {
        debug!(delivery_tag, error = %e, "ack failed");
    }
}

/// Builds the payload listing registered rpcs, keyed by name.
pub(crate) fn rpc_listing(service: &RpcService) -> Value {
    let listing: serde_json::Map<String, Value> = service
        .rpc_list()
        .into_iter()
        .map(|(name, rpc_type)| (name, json!({ "type": rpc_type.as_str() })))
        .collect();
    Value::Object(listing)
}
