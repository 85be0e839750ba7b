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


//! Shared setup for the integration tests.

#![allow(dead_code)]

use island::broker::{Broker, MemoryBroker};
use island::config::IslandConfig;
use island::context::RequestContext;
use island::error::IslandError;
use island::event::{EventHandler, EventService, ReceivedEvent};
use island::pool::ChannelPool;
use island::rpc::{RpcHandler, RpcService};
use island::shutdown::Shutdown;
use island::status::StatusCollector;
use serde_json::Value;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Configuration with short timeouts and a 100 ms reply margin.
pub fn test_config(service: &str, proc_dir: &Path) -> IslandConfig {
    IslandConfig::new(service)
        .with_host_name("test-host")
        .with_rpc_distrib_size(2)
        .with_rpc_wait_timeout(Duration::from_secs(3))
        .with_rpc_reply_margin(Duration::from_millis(100))
        .with_proc_dir(proc_dir)
}

/// Wraps a closure as an rpc handler.
pub fn handler<F, Fut>(f: F) -> Arc<dyn RpcHandler>
where
    F: Fn(Value, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, IslandError>> + Send + 'static,
{
    Arc::new(f)
}

/// Wraps a closure as an event handler.
pub fn event_handler<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(ReceivedEvent, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), IslandError>> + Send + 'static,
{
    Arc::new(f)
}

/// Polls `condition` every 10 ms for up to two seconds.
pub async fn eventually<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// One service instance on a shared broker.
pub struct TestIsland {
    pub config: Arc<IslandConfig>,
    pub pool: ChannelPool,
    pub collector: Arc<StatusCollector>,
    pub shutdown: Shutdown,
    pub rpc: RpcService,
    pub events: EventService,
}

impl TestIsland {
    /// Initializes the rpc and event services. Nothing is consumed yet.
    pub async fn start(broker: &Arc<MemoryBroker>, config: IslandConfig) -> Self {
        init_tracing();
        let config = Arc::new(config);
        let shared: Arc<dyn Broker> = broker.clone();
        let pool = ChannelPool::new(shared);
        pool.initialize("memory://test", 10).await.unwrap();
        let collector = Arc::new(StatusCollector::from_config(&config));
        let shutdown = Shutdown::new();
        let rpc = RpcService::new(
            Arc::clone(&config),
            pool.clone(),
            Arc::clone(&collector),
            shutdown.clone(),
        );
        rpc.initialize().await.unwrap();
        let events = EventService::new(
            Arc::clone(&config),
            pool.clone(),
            Arc::clone(&collector),
            shutdown.clone(),
        );
        events.initialize().await.unwrap();
        Self {
            config,
            pool,
            collector,
            shutdown,
            rpc,
            events,
        }
    }

    pub async fn stop(&self) {
        self.rpc.purge().await;
        self.events.purge().await;
        self.pool.purge().await;
    }
}
