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

//! Per-request statistics and circuit-break decisions.

use crate::broker::timestamp_millis;
use crate::config::{CircuitBreakConfig, IslandConfig};
use crate::status::{Bucket, SlidingWindow};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::info;

/// Counters of one `type@name` key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestStatistics {
    /// Requests currently being handled.
    pub ongoing: u64,
    /// Requests received since the last rotation.
    pub request_count: u64,
    /// Requests that completed successfully since the last rotation.
    pub executed_count: u64,
    /// Requests that failed since the last rotation.
    pub error_count: u64,
    /// Accumulated queueing delay in milliseconds.
    pub total_received_ms: u64,
    /// Accumulated execution time of successful requests in milliseconds.
    pub total_execution_ms: u64,
    /// Accumulated execution time of failed requests in milliseconds.
    pub total_error_ms: u64,
    /// Buckets of previous intervals.
    pub window: SlidingWindow,
}

/// Handle of one request being measured.
///
/// Returned by [`StatusCollector::collect_request`] and handed back to
/// [`StatusCollector::collect_executed`] once the request completes.
#[derive(Debug)]
#[must_use = "a ticket must be handed back to collect_executed"]
pub struct RequestTicket {
    key: String,
    started: Instant,
}

impl RequestTicket {
    /// Returns the `type@name` key the ticket counts against.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the time since the request was collected.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Rates of one `type@name` key over the last interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Measurement {
    /// The `type@name` key.
    #[serde(rename = "type")]
    pub kind: String,
    /// Requests received per second.
    pub request_per_seconds: f64,
    /// Requests completed per second.
    pub executed_per_seconds: f64,
    /// Average queueing delay in milliseconds.
    #[serde(rename = "avgReceiveMessageTimeByMQ")]
    pub avg_receive_message_time_by_mq: f64,
    /// Average execution time in milliseconds.
    pub avg_execution_time: f64,
}

/// Exported view of the collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    /// Start of the process, in milliseconds since the Unix epoch.
    pub process_uptime: u64,
    /// One entry per `type@name` key.
    pub measurements: Vec<Measurement>,
}

#[derive(Debug)]
struct CollectorState {
    stats: BTreeMap<String, RequestStatistics>,
    interval_started: Instant,
}

/// Aggregates request statistics keyed by `type@name`.
///
/// Services call [`collect_request`](Self::collect_request) when a message
/// arrives and [`collect_executed`](Self::collect_executed) when it is done.
/// The collector keeps the number of requests in flight, so shutdown can wait
/// for them with [`wait_for_drain`](Self::wait_for_drain).
///
/// # Examples
///
/// ```rust
/// use island::status::StatusCollector;
///
/// let collector = StatusCollector::default();
/// let ticket = collector.collect_request("rpc", "lookup", None);
/// assert_eq!(collector.ongoing_count("rpc"), 1);
///
/// collector.collect_executed(ticket, false);
/// assert_eq!(collector.ongoing_count("rpc"), 0);
/// ```
#[derive(Debug)]
pub struct StatusCollector {
    circuit_break: CircuitBreakConfig,
    window_len: usize,
    process_started: u64,
    state: Mutex<CollectorState>,
    drained: Notify,
}

impl Default for StatusCollector {
    fn default() -> Self {
        let config = IslandConfig::default();
        Self::new(config.circuit_break, config.status_export_interval)
    }
}

impl StatusCollector {
    /// Creates a collector whose window covers `circuit_break.window` in
    /// buckets of `export_interval`.
    #[must_use]
    pub fn new(circuit_break: CircuitBreakConfig, export_interval: Duration) -> Self {
        let interval = export_interval.as_millis().max(1);
        let window_len = circuit_break.window.as_millis().div_ceil(interval).max(1) as usize;
        Self {
            circuit_break,
            window_len,
            process_started: timestamp_millis(),
            state: Mutex::new(CollectorState {
                stats: BTreeMap::new(),
                interval_started: Instant::now(),
            }),
            drained: Notify::new(),
        }
    }

    /// Creates a collector from the service configuration.
    #[must_use]
    pub fn from_config(config: &IslandConfig) -> Self {
        Self::new(config.circuit_break.clone(), config.status_export_interval)
    }

    /// Returns the number of buckets in each sliding window.
    #[must_use]
    pub fn window_len(&self) -> usize {
        self.window_len
    }

    /// Records an incoming request.
    ///
    /// `published_at` is the publish time carried by the message, in
    /// milliseconds since the Unix epoch. When present, the delay until now is
    /// accumulated as the time the message spent in the broker.
    pub fn collect_request(&self, kind: &str, name: &str, published_at: Option<u64>) -> RequestTicket {
        let key = format!("{kind}@{name}");
        let mut state = self.state.lock();
        let window_len = self.window_len;
        let stat = state
            .stats
            .entry(key.clone())
            .or_insert_with(|| RequestStatistics {
                window: SlidingWindow::new(window_len),
                ..RequestStatistics::default()
            });
        stat.ongoing += 1;
        stat.request_count += 1;
        if let Some(published_at) = published_at {
            stat.total_received_ms += timestamp_millis().saturating_sub(published_at);
        }
        RequestTicket {
            key,
            started: Instant::now(),
        }
    }

    /// Records the completion of a request.
    pub fn collect_executed(&self, ticket: RequestTicket, failed: bool) {
        let elapsed = ticket.started.elapsed().as_millis() as u64;
        {
            let mut state = self.state.lock();
            if let Some(stat) = state.stats.get_mut(&ticket.key) {
                stat.ongoing = stat.ongoing.saturating_sub(1);
                if failed {
                    stat.error_count += 1;
                    stat.total_error_ms += elapsed;
                } else {
                    stat.executed_count += 1;
                    stat.total_execution_ms += elapsed;
                }
            }
        }
        self.drained.notify_waiters();
    }

    /// Returns the number of requests of `kind` currently being handled.
    #[must_use]
    pub fn ongoing_count(&self, kind: &str) -> u64 {
        let prefix = format!("{kind}@");
        self.state
            .lock()
            .stats
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(_, stat)| stat.ongoing)
            .sum()
    }

    /// Waits until no request of `kind` is being handled.
    pub async fn wait_for_drain(&self, kind: &str) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.ongoing_count(kind) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Returns a copy of the statistics of one key.
    #[must_use]
    pub fn statistics(&self, kind: &str, name: &str) -> Option<RequestStatistics> {
        self.state.lock().stats.get(&format!("{kind}@{name}")).cloned()
    }

    /// Logs the ongoing count of every key of `kind`.
    pub fn sig_info(&self, kind: &str) {
        let prefix = format!("{kind}@");
        let state = self.state.lock();
        for (key, stat) in state.stats.iter().filter(|(key, _)| key.starts_with(&prefix)) {
            info!(key = %key, ongoing = stat.ongoing, requests = stat.request_count, "status");
        }
    }

    /// Decides whether calls to `name` should be suppressed.
    ///
    /// Always `false` while circuit breaking is disabled or while the window
    /// holds fewer requests than the configured minimum. The current interval
    /// counts together with the rotated buckets.
    #[must_use]
    pub fn need_circuit_break(&self, kind: &str, name: &str) -> bool {
        if !self.circuit_break.enabled {
            return false;
        }
        let state = self.state.lock();
        let Some(stat) = state.stats.get(&format!("{kind}@{name}")) else {
            return false;
        };
        let total = stat.window.total();
        let requests = total.requests + stat.request_count;
        let errors = total.errors + stat.error_count;
        if requests == 0 || requests < self.circuit_break.request_threshold {
            return false;
        }
        errors as f64 / requests as f64 >= self.circuit_break.fail_rate_threshold
    }

    /// Computes the rates of the current interval without resetting it.
    #[must_use]
    pub fn snapshot(&self) -> StatusSnapshot {
        let state = self.state.lock();
        self.measure(&state)
    }

    /// Computes the rates of the current interval, then rotates every key's
    /// counters into its sliding window.
    ///
    /// Both happen under one lock, so a request collected concurrently counts
    /// in exactly one interval.
    pub fn export(&self) -> StatusSnapshot {
        let mut state = self.state.lock();
        let snapshot = self.measure(&state);
        for stat in state.stats.values_mut() {
            stat.window.push(Bucket {
                requests: stat.request_count,
                errors: stat.error_count,
            });
            *stat = RequestStatistics {
                ongoing: stat.ongoing,
                window: std::mem::take(&mut stat.window),
                ..RequestStatistics::default()
            };
        }
        state.interval_started = Instant::now();
        snapshot
    }

    /// Drops every statistic.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.stats.clear();
        state.interval_started = Instant::now();
        drop(state);
        self.drained.notify_waiters();
    }

    fn measure(&self, state: &CollectorState) -> StatusSnapshot {
        let seconds = state.interval_started.elapsed().as_secs_f64();
        let measurements = state
            .stats
            .iter()
            .map(|(key, stat)| Measurement {
                kind: key.clone(),
                request_per_seconds: round2(ratio(stat.request_count as f64, seconds)),
                executed_per_seconds: round2(ratio(stat.executed_count as f64, seconds)),
                avg_receive_message_time_by_mq: round2(ratio(
                    stat.total_received_ms as f64,
                    stat.request_count as f64,
                )),
                avg_execution_time: round2(ratio(
                    stat.total_execution_ms as f64,
                    stat.executed_count as f64,
                )),
            })
            .collect();
        StatusSnapshot {
            process_uptime: self.process_started,
            measurements,
        }
    }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
