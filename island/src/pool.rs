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

//! Pooled broker channels.
//!
//! The [`ChannelPool`] owns the single broker connection of a service and a
//! bounded set of channels multiplexed over it. Channels are checked out
//! exclusively: [`ChannelPool::acquire`] hands a channel to one holder, and
//! [`ChannelPool::release`] either parks it on the idle list for the next
//! holder or closes it.
//!
//! Upper layers should prefer [`ChannelPool::using_channel`], which releases
//! the channel on every exit path of the scoped task and only reuses it when
//! the task succeeded.
//!
//! # Channel Lifecycle
//!
//! ```text
//! acquire ──► open (held) ──► release(reusable) ──► idle ──► acquire ...
//!                  │                  │
//!                  │                  └─ !reusable or idle full ──► closed
//!                  └─ broker closes it ─────────────────────────────► closed
//! ```
//!
//! A channel that the broker closes is evicted from the open and idle lists as
//! soon as its close notification fires, so it is never handed out again.
//!
//! # Example
//!
//! ```rust
//! use island::broker::{MemoryBroker, QueueOptions};
//! use island::pool::{ChannelPool, PoolError};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), PoolError> {
//! let pool = ChannelPool::new(Arc::new(MemoryBroker::new()));
//! pool.initialize("memory://local", 10).await?;
//!
//! pool.using_channel(|channel| async move {
//!     channel.assert_queue("jobs", QueueOptions::default()).await?;
//!     Ok::<_, PoolError>(())
//! })
//! .await?;
//!
//! assert_eq!(pool.idle_count(), 1);
//! pool.purge().await;
//! # Ok(())
//! # }
//! ```

use crate::broker::{Broker, BrokerError, ChannelId, Connection, SharedChannel};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Errors raised by the channel pool.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// The pool has no connection; call [`ChannelPool::initialize`] first.
    #[error("channel pool is not initialized")]
    NotInitialized,

    /// Connecting to the broker failed.
    #[error("failed to connect to {url}")]
    ConnectionFailed {
        /// The broker url
        url: String,
        /// The underlying broker error
        #[source]
        source: BrokerError,
    },

    /// A broker operation failed.
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

#[derive(Default)]
struct PoolState {
    connection: Option<Arc<dyn Connection>>,
    pool_size: usize,
    open: HashMap<ChannelId, SharedChannel>,
    idle: Vec<SharedChannel>,
}

/// A bounded pool of channels over one broker connection.
///
/// Cloning a pool yields another handle to the same connection and channels.
#[derive(Clone)]
pub struct ChannelPool {
    broker: Arc<dyn Broker>,
    state: Arc<Mutex<PoolState>>,
}

impl std::fmt::Debug for ChannelPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ChannelPool")
            .field("initialized", &state.connection.is_some())
            .field("pool_size", &state.pool_size)
            .field("open", &state.open.len())
            .field("idle", &state.idle.len())
            .finish()
    }
}

impl ChannelPool {
    /// Creates an uninitialized pool over a broker.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            state: Arc::new(Mutex::new(PoolState::default())),
        }
    }

    /// Connects to the broker.
    ///
    /// Calling this on an initialized pool reconnects: the previous connection
    /// and all of its channels are closed.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::ConnectionFailed`] if the broker cannot be reached.
    /// There is no retry.
    pub async fn initialize(&self, url: &str, pool_size: usize) -> Result<(), PoolError> {
        let connection =
            self.broker
                .connect(url)
                .await
                .map_err(|source| PoolError::ConnectionFailed {
                    url: url.to_string(),
                    source,
                })?;
        let previous = {
            let mut state = self.state.lock();
            let previous = state.connection.replace(connection);
            state.pool_size = pool_size;
            state.open.clear();
            state.idle.clear();
            previous
        };
        if let Some(previous) = previous {
            debug!("Channel pool reconnected, closing previous connection");
            let _ = previous.close().await;
        }
        debug!(url = %url, pool_size, "Channel pool initialized");
        Ok(())
    }

    /// Returns `true` once [`initialize`](Self::initialize) succeeded and until
    /// [`purge`](Self::purge).
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.state.lock().connection.is_some()
    }

    /// Returns the configured number of reusable channels.
    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.state.lock().pool_size
    }

    /// Returns the number of tracked channels, held or idle.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.state.lock().open.len()
    }

    /// Returns the number of idle channels.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    /// Checks out a channel for exclusive use.
    ///
    /// An idle channel is reused when one is available, otherwise a new channel
    /// is opened and tracked.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::NotInitialized`] before initialization or after a
    /// purge, and [`PoolError::Broker`] if a channel cannot be opened.
    pub async fn acquire(&self) -> Result<SharedChannel, PoolError> {
        let connection = {
            let mut state = self.state.lock();
            let Some(connection) = state.connection.clone() else {
                return Err(PoolError::NotInitialized);
            };
            while let Some(channel) = state.idle.pop() {
                if channel.is_open() {
                    return Ok(channel);
                }
                state.open.remove(&channel.id());
            }
            connection
        };

        let channel = connection.create_channel().await?;
        self.state.lock().open.insert(channel.id(), Arc::clone(&channel));
        self.watch_close(&channel);
        trace!(channel = %channel.id(), "Channel opened");
        Ok(channel)
    }

    /// Returns a channel to the pool.
    ///
    /// A reusable, still open channel is parked on the idle list while there is
    /// room for it; any other channel is untracked and closed. Channels the
    /// pool does not track, such as prefetch channels, are left alone.
    pub async fn release(&self, channel: SharedChannel, reusable: bool) {
        let id = channel.id();
        {
            let mut state = self.state.lock();
            if !state.open.contains_key(&id) {
                trace!(channel = %id, "Released channel is not pooled");
                return;
            }
            if reusable && channel.is_open() && state.idle.len() < state.pool_size {
                state.idle.push(channel);
                return;
            }
            state.open.remove(&id);
        }
        if let Err(e) = channel.close().await {
            debug!(channel = %id, error = %e, "Closing released channel failed");
        }
    }

    /// Runs a task with a checked out channel.
    ///
    /// The channel is released when the task completes, and reused only when
    /// the task succeeded.
    ///
    /// # Errors
    ///
    /// Returns the task's error, or the acquisition error converted into `E`.
    pub async fn using_channel<F, Fut, T, E>(&self, task: F) -> Result<T, E>
    where
        F: FnOnce(SharedChannel) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<PoolError>,
    {
        let channel = self.acquire().await?;
        let result = task(Arc::clone(&channel)).await;
        self.release(channel, result.is_ok()).await;
        result
    }

    /// Opens a dedicated channel for a long-lived consumer.
    ///
    /// The channel is not tracked by the pool; its holder closes it.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::NotInitialized`] before initialization, and
    /// [`PoolError::Broker`] if the channel cannot be opened or configured.
    pub async fn get_prefetch_channel(&self, prefetch: u16) -> Result<SharedChannel, PoolError> {
        let connection = self
            .state
            .lock()
            .connection
            .clone()
            .ok_or(PoolError::NotInitialized)?;
        let channel = connection.create_channel().await?;
        channel.prefetch(prefetch).await?;
        trace!(channel = %channel.id(), prefetch, "Prefetch channel opened");
        Ok(channel)
    }

    /// Closes every channel and the connection.
    ///
    /// The pool can be initialized again afterwards.
    pub async fn purge(&self) {
        let (connection, channels) = {
            let mut state = self.state.lock();
            state.idle.clear();
            let channels: Vec<SharedChannel> = state.open.drain().map(|(_, c)| c).collect();
            (state.connection.take(), channels)
        };
        for channel in channels {
            let _ = channel.close().await;
        }
        if let Some(connection) = connection {
            if let Err(e) = connection.close().await {
                warn!(error = %e, "Closing broker connection failed");
            }
        }
        debug!("Channel pool purged");
    }

    fn watch_close(&self, channel: &SharedChannel) {
        let state: Weak<Mutex<PoolState>> = Arc::downgrade(&self.state);
        let watched = Arc::clone(channel);
        tokio::spawn(async move {
            watched.closed().await;
            let id = watched.id();
            drop(watched);
            let Some(state) = state.upgrade() else {
                return;
            };
            let mut state = state.lock();
            if state.open.remove(&id).is_some() {
                state.idle.retain(|c| c.id() != id);
                warn!(channel = %id, "Channel closed by broker, evicted from pool");
            }
        });
    }
}
