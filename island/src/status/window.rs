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

//! Sliding failure-rate window.

use std::collections::VecDeque;

/// Request and error counts of one export interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Bucket {
    /// Requests received during the interval.
    pub requests: u64,
    /// Requests that failed during the interval.
    pub errors: u64,
}

/// A fixed-length ring of per-interval buckets.
///
/// The window covers the last `capacity` export intervals. Pushing a bucket
/// into a full window evicts the oldest one.
///
/// # Examples
///
/// ```
/// use island::status::{Bucket, SlidingWindow};
///
/// let mut window = SlidingWindow::new(2);
/// window.push(Bucket { requests: 10, errors: 1 });
/// window.push(Bucket { requests: 10, errors: 3 });
/// window.push(Bucket { requests: 10, errors: 5 });
///
/// assert_eq!(window.total(), Bucket { requests: 20, errors: 8 });
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlidingWindow {
    buckets: VecDeque<Bucket>,
    capacity: usize,
}

impl Default for SlidingWindow {
    fn default() -> Self {
        Self::new(1)
    }
}

impl SlidingWindow {
    /// Creates an empty window of `capacity` buckets (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buckets: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns the number of buckets the window keeps.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of buckets currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Returns `true` if no bucket was pushed yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Appends the bucket of a finished interval.
    pub fn push(&mut self, bucket: Bucket) {
        if self.buckets.len() == self.capacity {
            self.buckets.pop_front();
        }
        self.buckets.push_back(bucket);
    }

    /// Sums every bucket in the window.
    #[must_use]
    pub fn total(&self) -> Bucket {
        self.buckets.iter().fold(Bucket::default(), |acc, b| Bucket {
            requests: acc.requests + b.requests,
            errors: acc.errors + b.errors,
        })
    }
}
