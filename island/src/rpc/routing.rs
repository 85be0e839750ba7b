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

//! Shard selection with flow control.
//!
//! Requests are spread over `N` shard queues. A shard whose responses report
//! flow mode (the request sat in its queue too long) is quarantined for a
//! while. Selection samples uniformly among shards that are not quarantined.
//! When too few shards are available the router stops honouring quarantine
//! and samples all of them, since refusing to send would be worse than
//! sending to a slow shard.

use parking_lot::Mutex;
use rand::Rng;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Queueing delay above which a response reports flow mode.
pub const FLOW_MODE_THRESHOLD: Duration = Duration::from_millis(300);

const DEGRADED_RATIO: f64 = 0.4;
const WARNING_RATIO: f64 = 0.7;

/// Picks the shard each request is routed to.
#[derive(Debug)]
pub struct ShardRouter {
    available_since: Mutex<Vec<Instant>>,
}

impl ShardRouter {
    /// Creates a router over `shards` shards, all available.
    #[must_use]
    pub fn new(shards: usize) -> Self {
        let now = Instant::now();
        Self {
            available_since: Mutex::new(vec![now; shards.max(1)]),
        }
    }

    /// Returns the number of shards.
    #[must_use]
    pub fn shards(&self) -> usize {
        self.available_since.lock().len()
    }

    /// Returns the shards that are not quarantined.
    #[must_use]
    pub fn available(&self) -> Vec<usize> {
        let now = Instant::now();
        self.available_since
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, since)| **since <= now)
            .map(|(shard, _)| shard)
            .collect()
    }

    /// Picks a shard for the next request.
    #[must_use]
    pub fn select(&self) -> usize {
        let shards = self.shards();
        let available = self.available();
        let degraded = (shards as f64 * DEGRADED_RATIO).floor() as usize;
        let warning = (shards as f64 * WARNING_RATIO).floor() as usize;

        let mut rng = rand::thread_rng();
        if available.len() < degraded || available.is_empty() {
            warn!(
                available = available.len(),
                shards, "Availability of RPC queues are under 40%"
            );
            return rng.gen_range(0..shards);
        }
        if available.len() < warning {
            info!(
                available = available.len(),
                shards, "Availability of RPC queues are under 70%"
            );
        }
        available[rng.gen_range(0..available.len())]
    }

    /// Avoids `shard` for `delay`.
    pub fn quarantine(&self, shard: usize, delay: Duration) {
        if let Some(since) = self.available_since.lock().get_mut(shard) {
            *since = Instant::now() + delay;
        }
    }

    /// Makes every shard available again.
    pub fn reset(&self) {
        let now = Instant::now();
        self.available_since.lock().iter_mut().for_each(|s| *s = now);
    }
}

/// Returns `true` when a message published at `published_at` (milliseconds
/// since the Unix epoch) waited long enough to report flow mode.
#[must_use]
pub fn is_flow_mode(published_at: Option<u64>, now_millis: u64) -> bool {
    published_at.is_some_and(|published| {
        now_millis.saturating_sub(published) > FLOW_MODE_THRESHOLD.as_millis() as u64
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const LONG: Duration = Duration::from_secs(60);

    #[test]
    fn test_selects_only_available_shards() {
        let router = ShardRouter::new(10);
        for shard in 0..3 {
            router.quarantine(shard, LONG);
        }
        assert_eq!(router.available().len(), 7);
        for _ in 0..200 {
            assert!(router.select() >= 3);
        }
    }

    #[test]
    fn test_degraded_mode_samples_every_shard() {
        let router = ShardRouter::new(10);
        for shard in 0..7 {
            router.quarantine(shard, LONG);
        }
        let picked: HashSet<usize> = (0..1000).map(|_| router.select()).collect();
        assert!(picked.iter().any(|shard| *shard < 7));
    }

    #[test]
    fn test_quarantine_expires() {
        let router = ShardRouter::new(2);
        router.quarantine(0, Duration::ZERO);
        assert_eq!(router.available(), vec![0, 1]);
        router.quarantine(1, LONG);
        router.quarantine(5, LONG);
        assert_eq!(router.available(), vec![0]);
        router.reset();
        assert_eq!(router.available(), vec![0, 1]);
    }

    #[test]
    fn test_flow_mode_threshold() {
        assert!(!is_flow_mode(None, 10_000));
        assert!(!is_flow_mode(Some(9_800), 10_000));
        assert!(is_flow_mode(Some(9_600), 10_000));
        assert!(!is_flow_mode(Some(20_000), 10_000));
    }
}
