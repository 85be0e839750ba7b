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

//! Process shutdown signalling.
//!
//! Some failures leave a service unable to work correctly, the loss of the
//! RPC response consumer being the main one. Library code never exits the
//! process. It fires a [`Shutdown`] signal carrying the reason, and the
//! supervisor that owns the process decides how to wind down.
//!
//! # Example
//!
//! ```rust
//! use island::error::{ErrorCode, ErrorKind, IslandCode, IslandError};
//! use island::shutdown::Shutdown;
//!
//! # async fn example() {
//! let shutdown = Shutdown::new();
//! let supervisor = shutdown.clone();
//!
//! let error = IslandError::runtime(
//!     ErrorKind::Fatal,
//!     IslandCode::UNKNOWN,
//!     ErrorCode::ConsumerIsCanceled,
//!     "consumer is canceled",
//! );
//! shutdown.trigger("rpc", error);
//!
//! let reason = supervisor.wait().await;
//! assert_eq!(reason.component(), "rpc");
//! # }
//! ```

use crate::error::{ErrorCode, ErrorKind, IslandCode, IslandError};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::error;

/// Why a shutdown was requested.
#[derive(Debug, Clone, PartialEq)]
pub struct ShutdownReason {
    component: String,
    error: IslandError,
}

impl ShutdownReason {
    /// Returns the component that requested the shutdown.
    #[must_use]
    pub fn component(&self) -> &str {
        &self.component
    }

    /// Returns the error that caused it.
    #[must_use]
    pub fn error(&self) -> &IslandError {
        &self.error
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.component, self.error)
    }
}

/// A cloneable, fire-once shutdown signal.
///
/// The first trigger wins; later triggers are ignored.
#[derive(Clone)]
pub struct Shutdown {
    sender: Arc<watch::Sender<Option<ShutdownReason>>>,
}

impl fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shutdown")
            .field("reason", &*self.sender.borrow())
            .finish()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    /// Creates an untriggered signal.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Requests a shutdown.
    ///
    /// Returns `true` if this call triggered the signal.
    pub fn trigger(&self, component: impl Into<String>, error: IslandError) -> bool {
        let reason = ShutdownReason {
            component: component.into(),
            error,
        };
        let triggered = self.sender.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason.clone());
            true
        });
        if triggered {
            error!(component = %reason.component, error = %reason.error, "Shutdown requested");
        }
        triggered
    }

    /// Returns `true` once the signal fired.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.sender.borrow().is_some()
    }

    /// Returns the reason, if the signal fired.
    #[must_use]
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.sender.borrow().clone()
    }

    /// Waits until the signal fires.
    pub async fn wait(&self) -> ShutdownReason {
        let mut receiver = self.sender.subscribe();
        match receiver.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or_else(closed_reason),
            Err(_) => closed_reason(),
        }
    }
}

fn closed_reason() -> ShutdownReason {
    ShutdownReason {
        component: "shutdown".to_string(),
        error: IslandError::runtime(
            ErrorKind::Fatal,
            IslandCode::UNKNOWN,
            ErrorCode::NotInitialized,
            "shutdown signal dropped",
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fatal(reason: &str) -> IslandError {
        IslandError::runtime(
            ErrorKind::Fatal,
            IslandCode::UNKNOWN,
            ErrorCode::ConsumerIsCanceled,
            reason,
        )
    }

    #[tokio::test]
    async fn test_first_trigger_wins() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_triggered());
        assert!(shutdown.trigger("rpc", fatal("first")));
        assert!(!shutdown.trigger("event", fatal("second")));

        let reason = shutdown.reason().unwrap();
        assert_eq!(reason.component(), "rpc");
        assert_eq!(reason.error().reason(), "first");
    }

    #[tokio::test]
    async fn test_wait_wakes_on_trigger() {
        let shutdown = Shutdown::new();
        let waiter = shutdown.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown.trigger("event", fatal("gone"));

        let reason = handle.await.unwrap();
        assert_eq!(reason.component(), "event");
    }

    #[tokio::test]
    async fn test_wait_after_trigger_returns_immediately() {
        let shutdown = Shutdown::new();
        shutdown.trigger("rpc", fatal("gone"));
        assert_eq!(shutdown.wait().await.error().reason(), "gone");
    }
}
