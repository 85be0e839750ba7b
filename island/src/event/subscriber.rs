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

//! Event subscribers.

use crate::broker::TopicPattern;
use crate::context::RequestContext;
use crate::error::IslandError;
use crate::event::ReceivedEvent;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Handles subscribed events.
///
/// Any `Fn(ReceivedEvent, RequestContext) -> impl Future<Output = Result<(),
/// IslandError>>` closure is a handler.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handles one event.
    async fn handle(&self, event: ReceivedEvent, ctx: RequestContext) -> Result<(), IslandError>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(ReceivedEvent, RequestContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), IslandError>> + Send,
{
    async fn handle(&self, event: ReceivedEvent, ctx: RequestContext) -> Result<(), IslandError> {
        (self)(event, ctx).await
    }
}

/// Options of a subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionOptions {
    /// Deliver to every instance of the service instead of one of them.
    pub every_node_listen: bool,
}

impl SubscriptionOptions {
    /// Options delivering to every instance.
    #[must_use]
    pub fn every_node() -> Self {
        Self {
            every_node_listen: true,
        }
    }
}

/// What a subscriber listens to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscription {
    /// One routing key.
    Exact(String),
    /// Routing keys matching a topic pattern.
    Pattern(TopicPattern),
}

impl Subscription {
    /// Returns the key or pattern bound on the broker.
    #[must_use]
    pub fn routing_pattern(&self) -> &str {
        match self {
            Self::Exact(key) => key,
            Self::Pattern(pattern) => pattern.as_str(),
        }
    }

    /// Tests a routing key. Agrees with the broker-side binding.
    #[must_use]
    pub fn matches(&self, routing_key: &str) -> bool {
        match self {
            Self::Exact(key) => key == routing_key,
            Self::Pattern(pattern) => pattern.matches(routing_key),
        }
    }
}

/// A handler bound to a subscription and the queue it is delivered on.
#[derive(Clone)]
pub struct Subscriber {
    subscription: Subscription,
    queue: String,
    handler: Arc<dyn EventHandler>,
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("subscription", &self.subscription)
            .field("queue", &self.queue)
            .finish()
    }
}

impl Subscriber {
    /// Creates a subscriber.
    pub fn new(subscription: Subscription, queue: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        Self {
            subscription,
            queue: queue.into(),
            handler,
        }
    }

    /// Returns the subscription.
    #[must_use]
    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    /// Returns the queue the subscriber is bound to.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Returns `true` if a delivery from `queue` with `routing_key` is for
    /// this subscriber.
    #[must_use]
    pub fn accepts(&self, queue: &str, routing_key: &str) -> bool {
        self.queue == queue && self.subscription.matches(routing_key)
    }

    /// Returns the handler.
    #[must_use]
    pub fn handler(&self) -> &Arc<dyn EventHandler> {
        &self.handler
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscriber(subscription: Subscription, queue: &str) -> Subscriber {
        Subscriber::new(
            subscription,
            queue,
            Arc::new(|_e: ReceivedEvent, _c: RequestContext| async { Ok::<_, IslandError>(()) }),
        )
    }

    #[test]
    fn test_exact_subscription() {
        let s = subscriber(Subscription::Exact("user.created".to_string()), "event.svc");
        assert!(s.accepts("event.svc", "user.created"));
        assert!(!s.accepts("event.svc", "user.created.v2"));
        assert!(!s.accepts("event.svc.node.1", "user.created"));
        assert_eq!(s.subscription().routing_pattern(), "user.created");
    }

    #[test]
    fn test_pattern_subscription() {
        let s = subscriber(Subscription::Pattern(TopicPattern::new("a.*.c")), "q");
        assert!(s.accepts("q", "a.b.c"));
        assert!(!s.accepts("q", "a.b.b.c"));
        let all = subscriber(Subscription::Pattern(TopicPattern::new("a.#")), "q");
        assert!(all.accepts("q", "a.b.c"));
        assert!(all.accepts("q", "a"));
    }
}
