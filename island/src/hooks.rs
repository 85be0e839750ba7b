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

//! Hook chains.
//!
//! Hooks let an application observe and rewrite the values flowing through the
//! runtime: RPC requests and results, event payloads, and errors. Hooks of one
//! type run in registration order and each receives the previous hook's
//! output.
//!
//! Any `Fn(Value) -> impl Future<Output = Result<Value, IslandError>>` closure
//! is a [`ValueHook`], and any `Fn(IslandError) -> impl Future<Output =
//! IslandError>` closure is an [`ErrorHook`].
//!
//! # Example
//!
//! ```rust
//! use island::error::IslandError;
//! use island::hooks::{HookRegistry, ValueHook};
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), IslandError> {
//! let hooks: HookRegistry<&'static str, dyn ValueHook> = HookRegistry::new();
//! hooks.register(
//!     "pre",
//!     Arc::new(|v: Value| async move { Ok::<_, IslandError>(json!({ "wrapped": v })) }),
//! );
//!
//! let out = hooks.run(&"pre", json!(1)).await?;
//! assert_eq!(out, json!({ "wrapped": 1 }));
//! # Ok(())
//! # }
//! ```

use crate::error::IslandError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

/// A hook that rewrites a value.
#[async_trait]
pub trait ValueHook: Send + Sync {
    /// Transforms the value, or fails the pipeline.
    async fn call(&self, value: Value) -> Result<Value, IslandError>;
}

#[async_trait]
impl<F, Fut> ValueHook for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, IslandError>> + Send,
{
    async fn call(&self, value: Value) -> Result<Value, IslandError> {
        (self)(value).await
    }
}

/// A hook that rewrites an error.
#[async_trait]
pub trait ErrorHook: Send + Sync {
    /// Transforms the error.
    async fn call(&self, error: IslandError) -> IslandError;
}

#[async_trait]
impl<F, Fut> ErrorHook for F
where
    F: Fn(IslandError) -> Fut + Send + Sync,
    Fut: Future<Output = IslandError> + Send,
{
    async fn call(&self, error: IslandError) -> IslandError {
        (self)(error).await
    }
}

/// Hooks of one trait, grouped by hook type.
pub struct HookRegistry<K, H: ?Sized> {
    hooks: Mutex<HashMap<K, Vec<Arc<H>>>>,
}

impl<K, H: ?Sized> std::fmt::Debug for HookRegistry<K, H>
where
    K: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hooks = self.hooks.lock();
        let mut map = f.debug_map();
        for (key, chain) in hooks.iter() {
            map.entry(key, &chain.len());
        }
        map.finish()
    }
}

impl<K, H: ?Sized> Default for HookRegistry<K, H> {
    fn default() -> Self {
        Self {
            hooks: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, H> HookRegistry<K, H>
where
    K: Eq + Hash,
    H: ?Sized,
{
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a hook to the chain of a hook type.
    pub fn register(&self, kind: K, hook: Arc<H>) {
        self.hooks.lock().entry(kind).or_default().push(hook);
    }

    /// Returns the chain of a hook type.
    #[must_use]
    pub fn chain(&self, kind: &K) -> Vec<Arc<H>> {
        self.hooks.lock().get(kind).cloned().unwrap_or_default()
    }

    /// Returns the number of hooks registered for a type.
    #[must_use]
    pub fn len(&self, kind: &K) -> usize {
        self.hooks.lock().get(kind).map_or(0, Vec::len)
    }

    /// Removes every hook.
    pub fn clear(&self) {
        self.hooks.lock().clear();
    }
}

impl<K> HookRegistry<K, dyn ValueHook>
where
    K: Eq + Hash,
{
    /// Runs the chain of a hook type over a value.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by a hook; later hooks do not run.
    pub async fn run(&self, kind: &K, mut value: Value) -> Result<Value, IslandError> {
        for hook in self.chain(kind) {
            value = hook.call(value).await?;
        }
        Ok(value)
    }
}

impl<K> HookRegistry<K, dyn ErrorHook>
where
    K: Eq + Hash,
{
    /// Runs the chain of a hook type over an error.
    pub async fn run(&self, kind: &K, mut error: IslandError) -> IslandError {
        for hook in self.chain(kind) {
            error = hook.call(error).await;
        }
        error
    }
}
