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

//! Structured, wire-portable errors.
//!
//! [`IslandError`] is the error type that crosses service boundaries. It has a
//! variant tag ([`ErrorKind`]) that downstream code uses to decide log severity
//! and retry policy, a numeric code (see [`code`](self::merge_code)), a
//! human-readable reason and an `extra` bag of diagnostic context.
//!
//! # Error Kinds
//!
//! - [`ErrorKind::Expected`]: user-facing errors that are never logged as errors
//! - [`ErrorKind::Logic`]: the caller's fault (bad schema, bad request)
//! - [`ErrorKind::Fatal`]: a system invariant was violated
//! - [`ErrorKind::Etc`]: uncaught or third-party errors
//!
//! # Tracing Across Hops
//!
//! Every error carries an `extra.uuid`. It is generated once, when the error is
//! first created, and survives serialization and re-raising across nested RPC
//! hops, so one failure can be followed through the logs of every service it
//! passed through.
//!
//! # Examples
//!
//! ```rust
//! use island::error::{ErrorCode, ErrorKind, IslandCode, IslandError};
//!
//! let error = IslandError::runtime(
//!     ErrorKind::Fatal,
//!     IslandCode::UNKNOWN,
//!     ErrorCode::RpcTimeout,
//!     "RPC(lookup) does not return in 1000 ms",
//! )
//! .with_status_code(504);
//!
//! assert_eq!(error.code(), 10010023);
//! assert_eq!(error.name(), "FatalError");
//! assert!(error.is_timeout());
//! assert!(error.uuid().is_some());
//! ```

mod code;

pub use code::{
    ErrorCode, IslandCode, IslandLevel, MAX_ERROR_CODE, SplitCode, merge_code, split_code,
};

use crate::broker::BrokerError;
use crate::config::ConfigError;
use crate::pool::PoolError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Free-form diagnostic context attached to an error.
pub type Extra = Map<String, Value>;

/// Key of the uuid every error carries in its extra bag.
pub const UUID_KEY: &str = "uuid";

/// Variant tag of an [`IslandError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// User-facing error, never logged as an error.
    Expected,
    /// The caller's fault.
    Logic,
    /// A system invariant was violated.
    Fatal,
    /// Uncaught or third-party error.
    Etc,
}

impl ErrorKind {
    /// Returns the variant name carried on the wire.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Expected => "ExpectedError",
            Self::Logic => "LogicError",
            Self::Fatal => "FatalError",
            Self::Etc => "EtcError",
        }
    }

    /// Resolves a wire name back into a kind.
    ///
    /// Names that do not belong to a known variant (for example the original
    /// type name of a wrapped third-party error) resolve to `None`.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ExpectedError" => Some(Self::Expected),
            "LogicError" => Some(Self::Logic),
            "FatalError" => Some(Self::Fatal),
            "EtcError" => Some(Self::Etc),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A structured error that can cross service boundaries.
#[derive(Debug, Clone, PartialEq)]
pub struct IslandError {
    kind: ErrorKind,
    code: u32,
    reason: String,
    name: String,
    extra: Extra,
    status_code: Option<u16>,
}

impl IslandError {
    /// Creates an error from a fully merged code.
    pub fn new(kind: ErrorKind, code: u32, reason: impl Into<String>) -> Self {
        let mut extra = Extra::new();
        extra.insert(UUID_KEY.to_string(), Value::String(uuid::Uuid::new_v4().to_string()));
        Self {
            kind,
            code,
            reason: reason.into(),
            name: kind.name().to_string(),
            extra,
            status_code: None,
        }
    }

    /// Creates an [`ErrorKind::Expected`] error.
    pub fn expected(code: u32, reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Expected, code, reason)
    }

    /// Creates an [`ErrorKind::Logic`] error.
    pub fn logic(code: u32, reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Logic, code, reason)
    }

    /// Creates an [`ErrorKind::Fatal`] error.
    pub fn fatal(code: u32, reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, code, reason)
    }

    /// Creates an [`ErrorKind::Etc`] error.
    pub fn etc(code: u32, reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Etc, code, reason)
    }

    /// Creates an error raised by the runtime itself.
    pub fn runtime(
        kind: ErrorKind,
        island: IslandCode,
        code: ErrorCode,
        reason: impl Into<String>,
    ) -> Self {
        Self::new(kind, island.merge(IslandLevel::Runtime, code), reason)
    }

    /// Wraps an error the runtime could not categorize.
    ///
    /// The original type name is kept as the error name and its message as the
    /// reason; the variant is [`ErrorKind::Etc`].
    ///
    /// # Examples
    ///
    /// ```rust
    /// use island::error::{ErrorKind, IslandCode, IslandError};
    ///
    /// let error = IslandError::uncategorized(IslandCode::UNKNOWN, "TypeError", "boom");
    /// assert_eq!(error.kind(), ErrorKind::Etc);
    /// assert_eq!(error.code(), 10020001);
    /// assert_eq!(error.name(), "TypeError");
    /// assert_eq!(error.reason(), "boom");
    /// ```
    pub fn uncategorized(
        island: IslandCode,
        name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(
            ErrorKind::Etc,
            island.merge(IslandLevel::Unknown, ErrorCode::Uncategorized),
            reason,
        );
        error.name = name.into();
        error
    }

    /// Wraps any standard error as an uncategorized error.
    pub fn wrap<E>(island: IslandCode, error: &E) -> Self
    where
        E: std::error::Error,
    {
        Self::uncategorized(island, short_type_name::<E>(), error.to_string())
    }

    /// Adds or replaces an extra value.
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Adds an extra value only when the key is not present yet.
    #[must_use]
    pub fn with_default_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.entry(key.into()).or_insert_with(|| value.into());
        self
    }

    /// Sets the HTTP-equivalent status code.
    #[must_use]
    pub fn with_status_code(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    /// Ensures the extra bag carries a uuid, keeping an existing one.
    #[must_use]
    pub fn ensure_uuid(mut self) -> Self {
        let has_uuid = matches!(self.extra.get(UUID_KEY), Some(Value::String(s)) if !s.is_empty());
        if !has_uuid {
            self.extra
                .insert(UUID_KEY.to_string(), Value::String(uuid::Uuid::new_v4().to_string()));
        }
        self
    }

    /// Returns the variant tag.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the merged numeric code.
    #[must_use]
    pub fn code(&self) -> u32 {
        self.code
    }

    /// Returns the decomposed code.
    #[must_use]
    pub fn split(&self) -> SplitCode {
        split_code(self.code)
    }

    /// Returns the reason.
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Returns the error name.
    ///
    /// For categorized errors this is the variant name; wrapped third-party
    /// errors keep their original type name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the extra bag.
    #[must_use]
    pub fn extra(&self) -> &Extra {
        &self.extra
    }

    /// Returns an extra value as a string slice.
    #[must_use]
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }

    /// Returns the uuid identifying this failure across hops.
    #[must_use]
    pub fn uuid(&self) -> Option<&str> {
        self.extra_str(UUID_KEY)
    }

    /// Returns the HTTP-equivalent status code, if any.
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        self.status_code
    }

    /// Returns the message, formatted as `<code>-<reason>`.
    #[must_use]
    pub fn message(&self) -> String {
        format!("{}-{}", self.code, self.reason)
    }

    /// Returns true for user-facing errors that must not be logged as errors.
    #[must_use]
    pub fn is_expected(&self) -> bool {
        self.kind == ErrorKind::Expected
    }

    /// Returns true for RPC timeouts.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        let split = self.split();
        self.kind == ErrorKind::Fatal
            && split.level() == Some(IslandLevel::Runtime)
            && split.error_code == ErrorCode::RpcTimeout.get()
    }

    /// Returns true when the request that produced this error should be
    /// redelivered instead of answered.
    #[must_use]
    pub fn needs_redelivery(&self) -> bool {
        self.status_code == Some(503)
    }

    /// Returns true for fatal conditions that require shutting the process down.
    #[must_use]
    pub fn is_critical(&self) -> bool {
        let split = self.split();
        self.kind == ErrorKind::Fatal
            && split.level() == Some(IslandLevel::Runtime)
            && split.error_code == ErrorCode::ConsumerIsCanceled.get()
    }

    /// Serializes this error into its wire representation.
    #[must_use]
    pub fn to_wire(&self) -> Value {
        let wire = WireError {
            name: self.name.clone(),
            code: self.code,
            reason: self.reason.clone(),
            message: Some(self.message()),
            extra: self.extra.clone(),
            status_code: self.status_code,
        };
        serde_json::to_value(wire).unwrap_or(Value::Null)
    }

    /// Restores an error from its wire representation.
    ///
    /// The variant is recovered from the error name; names that are not a
    /// known variant restore as [`ErrorKind::Etc`]. Returns `None` when the
    /// value does not look like an error at all.
    #[must_use]
    pub fn from_wire(value: &Value) -> Option<Self> {
        let wire: WireError = serde_json::from_value(value.clone()).ok()?;
        let kind = ErrorKind::from_name(&wire.name).unwrap_or(ErrorKind::Etc);
        let error = Self {
            kind,
            code: wire.code,
            reason: wire.reason,
            name: wire.name,
            extra: wire.extra,
            status_code: wire.status_code,
        };
        Some(error.ensure_uuid())
    }
}

impl fmt::Display for IslandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.code, self.reason)
    }
}

impl std::error::Error for IslandError {}

impl From<BrokerError> for IslandError {
    fn from(error: BrokerError) -> Self {
        Self::wrap(IslandCode::UNKNOWN, &error)
    }
}

impl From<PoolError> for IslandError {
    fn from(error: PoolError) -> Self {
        match error {
            PoolError::NotInitialized => Self::runtime(
                ErrorKind::Fatal,
                IslandCode::UNKNOWN,
                ErrorCode::ChannelPoolRequired,
                "channel pool is not initialized",
            ),
            PoolError::ConnectionFailed { source, .. } => source.into(),
            PoolError::Broker(error) => error.into(),
        }
    }
}

impl From<ConfigError> for IslandError {
    fn from(error: ConfigError) -> Self {
        Self::wrap(IslandCode::UNKNOWN, &error)
    }
}

impl From<serde_json::Error> for IslandError {
    fn from(error: serde_json::Error) -> Self {
        Self::wrap(IslandCode::UNKNOWN, &error)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireError {
    name: String,
    code: u32,
    #[serde(default)]
    reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(default)]
    extra: Extra,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status_code: Option<u16>,
}

fn short_type_name<E>() -> &'static str {
    let full = std::any::type_name::<E>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_error_has_uuid() {
        let error = IslandError::logic(10010031, "bad schema");
        assert_eq!(error.kind(), ErrorKind::Logic);
        assert_eq!(error.name(), "LogicError");
        assert!(error.uuid().is_some());
        assert_eq!(error.to_string(), "10010031-bad schema");
    }

    #[test]
    fn test_distinct_errors_have_distinct_uuids() {
        let a = IslandError::fatal(1, "a");
        let b = IslandError::fatal(1, "a");
        assert_ne!(a.uuid(), b.uuid());
    }

    #[test]
    fn test_ensure_uuid_keeps_existing() {
        let error = IslandError::fatal(1, "x").with_extra(UUID_KEY, "keep-me");
        let error = error.ensure_uuid();
        assert_eq!(error.uuid(), Some("keep-me"));
    }

    #[test]
    fn test_default_extra_does_not_overwrite() {
        let error = IslandError::fatal(1, "x")
            .with_extra("rpcName", "depth2")
            .with_default_extra("rpcName", "depth1")
            .with_default_extra("island", "haha");
        assert_eq!(error.extra_str("rpcName"), Some("depth2"));
        assert_eq!(error.extra_str("island"), Some("haha"));
    }

    #[test]
    fn test_wire_preserves_identity() {
        let original = IslandError::runtime(
            ErrorKind::Fatal,
            IslandCode::new(101).unwrap(),
            ErrorCode::NotInitialized,
            "not ready",
        )
        .with_status_code(500);
        let restored = IslandError::from_wire(&original.to_wire()).unwrap();
        assert_eq!(restored.kind(), ErrorKind::Fatal);
        assert_eq!(restored.code(), original.code());
        assert_eq!(restored.name(), "FatalError");
        assert_eq!(restored.uuid(), original.uuid());
        assert_eq!(restored.status_code(), Some(500));
    }

    #[test]
    fn test_unknown_name_restores_as_etc() {
        let original = IslandError::uncategorized(IslandCode::UNKNOWN, "TypeError", "oops");
        let restored = IslandError::from_wire(&original.to_wire()).unwrap();
        assert_eq!(restored.kind(), ErrorKind::Etc);
        assert_eq!(restored.name(), "TypeError");
        assert_eq!(restored.reason(), "oops");
        assert_eq!(restored.code(), 10020001);
    }

    #[test]
    fn test_from_wire_rejects_non_errors() {
        assert!(IslandError::from_wire(&serde_json::json!("hello")).is_none());
        assert!(IslandError::from_wire(&serde_json::json!({"foo": 1})).is_none());
    }

    #[test]
    fn test_from_wire_adds_missing_uuid() {
        let value = serde_json::json!({"name": "LogicError", "code": 10010031, "reason": "r"});
        let restored = IslandError::from_wire(&value).unwrap();
        assert!(restored.uuid().is_some());
    }

    #[test]
    fn test_predicates() {
        let timeout = IslandError::runtime(
            ErrorKind::Fatal,
            IslandCode::UNKNOWN,
            ErrorCode::RpcTimeout,
            "t",
        );
        assert!(timeout.is_timeout());
        assert!(!timeout.is_critical());

        let cancelled = IslandError::runtime(
            ErrorKind::Fatal,
            IslandCode::UNKNOWN,
            ErrorCode::ConsumerIsCanceled,
            "c",
        );
        assert!(cancelled.is_critical());

        let busy = IslandError::etc(1, "busy").with_status_code(503);
        assert!(busy.needs_redelivery());
        assert!(IslandError::expected(1, "e").is_expected());
    }

    #[test]
    fn test_wrap_uses_type_name() {
        let io = std::io::Error::other("disk full");
        let error = IslandError::wrap(IslandCode::UNKNOWN, &io);
        assert_eq!(error.name(), "Error");
        assert_eq!(error.reason(), "disk full");
        assert_eq!(error.kind(), ErrorKind::Etc);
    }
}
