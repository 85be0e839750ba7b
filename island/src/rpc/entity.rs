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

//! Registered RPC handlers.

use crate::context::RequestContext;
use crate::error::IslandError;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Serves one RPC.
///
/// Any `Fn(Value, RequestContext) -> impl Future<Output = Result<Value,
/// IslandError>>` closure is a handler.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    /// Handles a request and returns the result sent back to the caller.
    async fn handle(&self, request: Value, ctx: RequestContext) -> Result<Value, IslandError>;
}

#[async_trait]
impl<F, Fut> RpcHandler for F
where
    F: Fn(Value, RequestContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, IslandError>> + Send,
{
    async fn handle(&self, request: Value, ctx: RequestContext) -> Result<Value, IslandError> {
        (self)(request, ctx).await
    }
}

/// A value validator.
///
/// Validation rules themselves are supplied by the application.
pub trait Schema: Send + Sync {
    /// Normalizes a value before validation. Returns it unchanged by default.
    fn sanitize(&self, value: Value) -> Value {
        value
    }

    /// Checks a sanitized value, returning the reason it is invalid.
    fn validate(&self, value: &Value) -> Result<(), String>;
}

/// Kind of registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RpcType {
    /// Service to service call.
    #[default]
    Rpc,
    /// Call forwarded from an external gateway.
    Endpoint,
}

impl RpcType {
    /// Returns the lowercase name used in headers and listings.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rpc => "rpc",
            Self::Endpoint => "endpoint",
        }
    }
}

impl fmt::Display for RpcType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Schemas of a registered handler.
#[derive(Clone, Default)]
pub struct RpcOptions {
    /// Validates the request.
    pub query: Option<Arc<dyn Schema>>,
    /// Validates the result.
    pub result: Option<Arc<dyn Schema>>,
}

impl RpcOptions {
    /// Sets the request schema.
    #[must_use]
    pub fn with_query(mut self, schema: Arc<dyn Schema>) -> Self {
        self.query = Some(schema);
        self
    }

    /// Sets the result schema.
    #[must_use]
    pub fn with_result(mut self, schema: Arc<dyn Schema>) -> Self {
        self.result = Some(schema);
        self
    }
}

impl fmt::Debug for RpcOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcOptions")
            .field("query", &self.query.is_some())
            .field("result", &self.result.is_some())
            .finish()
    }
}

/// A registered handler.
#[derive(Clone)]
pub struct RpcEntity {
    /// RPC name; also the name of its exchange.
    pub name: String,
    /// Handler kind.
    pub rpc_type: RpcType,
    /// The handler.
    pub handler: Arc<dyn RpcHandler>,
    /// Schemas.
    pub options: RpcOptions,
}

impl fmt::Debug for RpcEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcEntity")
            .field("name", &self.name)
            .field("rpc_type", &self.rpc_type)
            .field("options", &self.options)
            .finish()
    }
}
