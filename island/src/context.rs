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

//! Request-scoped context.
//!
//! A [`RequestContext`] travels explicitly with every unit of work: the runtime
//! hands one to each RPC handler and event subscriber, and handlers pass it on
//! to nested [`invoke_with`](crate::rpc::RpcService::invoke_with) calls. It
//! carries the trace id (`tattoo`), the name of the RPC at the root of the call
//! chain, the absolute deadline of the request being served and the shared
//! route logs.
//!
//! # Deadlines
//!
//! The deadline bounds every nested call. A nested call waits at most for the
//! time left until the deadline, so a chain of calls runs out of budget at the
//! hop that actually exceeded it instead of at the outermost caller.

use crate::headers::{HeaderExtra, MessageHeaders, Origin, RouteLog, RouteLogs};
use std::time::{Duration, Instant};

/// Context of the work currently being done.
///
/// # Examples
///
/// ```rust
/// use island::context::RequestContext;
/// use std::time::Duration;
///
/// let ctx = RequestContext::new();
/// assert!(ctx.tattoo().is_some());
/// assert!(ctx.remaining().is_none());
///
/// let bounded = ctx.with_timeout(Duration::from_secs(1));
/// assert!(bounded.remaining().unwrap() <= Duration::from_secs(1));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestContext {
    tattoo: Option<String>,
    root: Option<String>,
    rpc_name: Option<String>,
    kind: Option<String>,
    deadline: Option<Instant>,
    session_type: Option<String>,
    route_logs: RouteLogs,
}

impl RequestContext {
    /// Creates the context of a new request chain with a fresh trace id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tattoo: Some(uuid::Uuid::new_v4().to_string()),
            ..Self::default()
        }
    }

    /// Creates the context for serving a received message.
    ///
    /// The root of the chain is taken from the message headers; a message
    /// without one starts a chain rooted at `name`.
    #[must_use]
    pub fn serving(
        headers: &MessageHeaders,
        name: &str,
        kind: &str,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            tattoo: headers.tattoo.clone(),
            root: Some(
                headers
                    .extra
                    .parent
                    .clone()
                    .unwrap_or_else(|| name.to_string()),
            ),
            rpc_name: Some(name.to_string()),
            kind: Some(kind.to_string()),
            deadline,
            session_type: headers.extra.session_type.clone(),
            route_logs: RouteLogs::from_logs(headers.extra.route_logs.clone()),
        }
    }

    /// Returns a copy whose deadline is at most `timeout` from now.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        let mut ctx = self.clone();
        ctx.deadline = Some(self.deadline.map_or(deadline, |d| d.min(deadline)));
        ctx
    }

    /// Returns a copy with a session type.
    #[must_use]
    pub fn with_session_type(&self, session_type: impl Into<String>) -> Self {
        let mut ctx = self.clone();
        ctx.session_type = Some(session_type.into());
        ctx
    }

    /// Returns the trace id.
    #[must_use]
    pub fn tattoo(&self) -> Option<&str> {
        self.tattoo.as_deref()
    }

    /// Returns the RPC at the root of the call chain.
    #[must_use]
    pub fn root(&self) -> Option<&str> {
        self.root.as_deref()
    }

    /// Returns the RPC or event being served.
    #[must_use]
    pub fn rpc_name(&self) -> Option<&str> {
        self.rpc_name.as_deref()
    }

    /// Returns the kind of work being served.
    #[must_use]
    pub fn kind(&self) -> Option<&str> {
        self.kind.as_deref()
    }

    /// Returns the session type of the end user.
    #[must_use]
    pub fn session_type(&self) -> Option<&str> {
        self.session_type.as_deref()
    }

    /// Returns the absolute deadline.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the time left until the deadline, or `None` without a deadline.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Returns the shared route logs.
    #[must_use]
    pub fn route_logs(&self) -> &RouteLogs {
        &self.route_logs
    }

    /// Records a hop in the route logs.
    pub fn log_route(&self, log: RouteLog) {
        self.route_logs.push(log);
    }

    /// Builds the headers of a message sent on behalf of this context.
    #[must_use]
    pub fn outgoing_headers(&self, island: &str, node: &str) -> MessageHeaders {
        MessageHeaders {
            tattoo: self.tattoo.clone(),
            from: Origin {
                node: Some(node.to_string()),
                context: self.rpc_name.clone(),
                island: Some(island.to_string()),
                kind: self.kind.clone(),
            },
            extra: HeaderExtra {
                session_type: self.session_type.clone(),
                route_logs: self.route_logs.snapshot(),
                flow: false,
                parent: self.root.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serving_starts_chain_without_parent() {
        let headers = MessageHeaders::default();
        let ctx = RequestContext::serving(&headers, "lookup", "rpc", None);
        assert_eq!(ctx.root(), Some("lookup"));
        assert_eq!(ctx.rpc_name(), Some("lookup"));
        assert_eq!(ctx.kind(), Some("rpc"));
    }

    #[test]
    fn test_root_is_propagated() {
        let top = RequestContext::serving(&MessageHeaders::default(), "test", "rpc", None);
        let headers = top.outgoing_headers("svc", "host");
        assert_eq!(headers.extra.parent.as_deref(), Some("test"));
        assert_eq!(headers.from.context.as_deref(), Some("test"));

        let nested = RequestContext::serving(&headers, "depth0", "rpc", None);
        assert_eq!(nested.root(), Some("test"));
        assert_eq!(nested.tattoo(), top.tattoo());
    }

    #[test]
    fn test_with_timeout_never_extends_deadline() {
        let ctx = RequestContext::new().with_timeout(Duration::from_millis(100));
        let longer = ctx.with_timeout(Duration::from_secs(10));
        assert!(longer.remaining().unwrap() <= Duration::from_millis(100));
        let shorter = ctx.with_timeout(Duration::from_millis(10));
        assert!(shorter.remaining().unwrap() <= Duration::from_millis(10));
    }

    #[test]
    fn test_top_level_context_has_no_root() {
        let ctx = RequestContext::new();
        assert!(ctx.root().is_none());
        assert!(ctx.outgoing_headers("svc", "host").extra.parent.is_none());
    }
}
