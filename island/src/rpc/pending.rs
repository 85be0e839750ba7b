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

//! Outstanding request bookkeeping.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tokio::sync::oneshot;
use tracing::debug;

/// Number of timed out correlation ids remembered for late arrival detection.
pub const TIMED_OUT_CAPACITY: usize = 20;

/// Outcome of delivering a response to the pending map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// A waiting caller received the value.
    Resolved,
    /// The request had already timed out; carries its rpc name.
    LateArrival(String),
    /// Nothing is known about the correlation id.
    Unknown,
}

struct Waiting<T> {
    name: String,
    sender: oneshot::Sender<T>,
}

struct Inner<T> {
    waiting: HashMap<String, Waiting<T>>,
    timed_out: VecDeque<(String, String)>,
}

/// Maps correlation ids to the callers waiting for them.
///
/// The waiting map and the record of timed out ids live under one lock, so a
/// response racing with its timeout is either delivered or recorded as late,
/// never both.
///
/// # Examples
///
/// ```rust
/// use island::rpc::{Completion, PendingRequests};
///
/// # async fn example() {
/// let pending = PendingRequests::new();
/// let rx = pending.register("c-1", "lookup");
/// assert_eq!(pending.complete("c-1", 42), Completion::Resolved);
/// assert_eq!(rx.await.unwrap(), 42);
///
/// let _rx = pending.register("c-2", "lookup");
/// pending.time_out("c-2");
/// assert_eq!(pending.complete("c-2", 7), Completion::LateArrival("lookup".to_string()));
/// # }
/// ```
pub struct PendingRequests<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> std::fmt::Debug for PendingRequests<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PendingRequests")
            .field("waiting", &inner.waiting.len())
            .field("timed_out", &inner.timed_out.len())
            .finish()
    }
}

impl<T> Default for PendingRequests<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PendingRequests<T> {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                waiting: HashMap::new(),
                timed_out: VecDeque::with_capacity(TIMED_OUT_CAPACITY),
            }),
        }
    }

    /// Registers a request and returns the receiver of its response.
    pub fn register(&self, correlation_id: &str, name: &str) -> oneshot::Receiver<T> {
        let (sender, receiver) = oneshot::channel();
        self.inner.lock().waiting.insert(
            correlation_id.to_string(),
            Waiting {
                name: name.to_string(),
                sender,
            },
        );
        receiver
    }

    /// Delivers a response.
    pub fn complete(&self, correlation_id: &str, value: T) -> Completion {
        let mut inner = self.inner.lock();
        if let Some(waiting) = inner.waiting.remove(correlation_id) {
            // A dropped receiver means the caller gave up; nothing else to do.
            let _ = waiting.sender.send(value);
            return Completion::Resolved;
        }
        let position = inner.timed_out.iter().position(|(id, _)| id == correlation_id);
        match position.and_then(|index| inner.timed_out.remove(index)) {
            Some((_, name)) => Completion::LateArrival(name),
            None => Completion::Unknown,
        }
    }

    /// Marks a request as timed out.
    ///
    /// Returns the rpc name when the request was still waiting. `None` means a
    /// response was delivered first and is ready in the receiver.
    pub fn time_out(&self, correlation_id: &str) -> Option<String> {
        let mut inner = self.inner.lock();
        let waiting = inner.waiting.remove(correlation_id)?;
        if inner.timed_out.len() == TIMED_OUT_CAPACITY {
            inner.timed_out.pop_front();
        }
        inner
            .timed_out
            .push_back((correlation_id.to_string(), waiting.name.clone()));
        Some(waiting.name)
    }

    /// Returns a guard that gives up on the request when dropped.
    ///
    /// A caller holds the guard for as long as it waits. If the caller stops
    /// waiting before a response or its own timeout, for example because its
    /// future was dropped, the id moves to the timed out record so a response
    /// arriving later is reported as late. Dropping the guard after the
    /// request completed does nothing.
    pub fn guard(&self, correlation_id: &str) -> PendingGuard<'_, T> {
        PendingGuard {
            pending: self,
            correlation_id: correlation_id.to_string(),
        }
    }

    /// Forgets a request without recording it as timed out.
    pub fn cancel(&self, correlation_id: &str) -> bool {
        self.inner.lock().waiting.remove(correlation_id).is_some()
    }

    /// Returns `true` while the correlation id is waiting.
    #[must_use]
    pub fn contains(&self, correlation_id: &str) -> bool {
        self.inner.lock().waiting.contains_key(correlation_id)
    }

    /// Returns the number of waiting requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().waiting.len()
    }

    /// Returns `true` when no request is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forgets the record of timed out ids, keeping the waiting callers.
    pub fn forget_timed_out(&self) {
        self.inner.lock().timed_out.clear();
    }

    /// Drops every waiting request and the timed out record.
    ///
    /// Waiting callers observe a closed channel.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.waiting.clear();
        inner.timed_out.clear();
    }
}

/// Gives up on a pending request when dropped.
///
/// Created by [`PendingRequests::guard`].
#[must_use = "the request is abandoned as soon as the guard is dropped"]
pub struct PendingGuard<'a, T> {
    pending: &'a PendingRequests<T>,
    correlation_id: String,
}

impl<T> std::fmt::Debug for PendingGuard<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingGuard")
            .field("correlation_id", &self.correlation_id)
            .finish()
    }
}

impl<T> Drop for PendingGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(name) = self.pending.time_out(&self.correlation_id) {
            debug!(rpc_name = %name, correlation_id = %self.correlation_id, "caller stopped waiting");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exactly_once() {
        let pending = PendingRequests::new();
        let rx = pending.register("c", "a");
        assert_eq!(pending.complete("c", 1), Completion::Resolved);
        assert_eq!(pending.complete("c", 2), Completion::Unknown);
        assert_eq!(rx.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_response_before_timeout_wins() {
        let pending = PendingRequests::new();
        let mut rx = pending.register("c", "a");
        pending.complete("c", 5);
        assert_eq!(pending.time_out("c"), None);
        assert_eq!(rx.try_recv().unwrap(), 5);
    }

    #[test]
    fn test_late_arrival() {
        let pending = PendingRequests::new();
        let _rx = pending.register("c", "lookup");
        assert_eq!(pending.time_out("c").as_deref(), Some("lookup"));
        assert!(pending.is_empty());
        assert_eq!(
            pending.complete("c", 1),
            Completion::LateArrival("lookup".to_string())
        );
        assert_eq!(pending.complete("c", 1), Completion::Unknown);
    }

    #[test]
    fn test_timed_out_record_is_bounded() {
        let pending = PendingRequests::<u8>::new();
        for i in 0..=TIMED_OUT_CAPACITY {
            let id = format!("c{i}");
            let _rx = pending.register(&id, "a");
            pending.time_out(&id);
        }
        assert_eq!(pending.complete("c0", 0), Completion::Unknown);
        assert!(matches!(pending.complete("c1", 0), Completion::LateArrival(_)));
    }

    #[tokio::test]
    async fn test_cancel_and_clear() {
        let pending = PendingRequests::<u8>::new();
        let _a = pending.register("a", "x");
        let b = pending.register("b", "x");
        assert!(pending.cancel("a"));
        assert!(!pending.cancel("a"));
        assert!(!pending.contains("a"));
        assert_eq!(pending.len(), 1);
        pending.forget_timed_out();
        assert_eq!(pending.len(), 1);
        pending.clear();
        assert!(pending.is_empty());
        assert!(b.await.is_err());
    }

    #[test]
    fn test_dropped_guard_abandons_waiting_request() {
        let pending = PendingRequests::<u8>::new();
        let _rx = pending.register("c", "lookup");
        let guard = pending.guard("c");
        assert_eq!(pending.len(), 1);
        drop(guard);
        assert!(pending.is_empty());
        assert_eq!(
            pending.complete("c", 1),
            Completion::LateArrival("lookup".to_string())
        );
    }

    #[tokio::test]
    async fn test_guard_after_completion_does_nothing() {
        let pending = PendingRequests::new();
        let rx = pending.register("c", "lookup");
        let guard = pending.guard("c");
        assert_eq!(pending.complete("c", 3), Completion::Resolved);
        drop(guard);
        assert_eq!(rx.await.unwrap(), 3);
        assert_eq!(pending.complete("c", 4), Completion::Unknown);
    }
}
