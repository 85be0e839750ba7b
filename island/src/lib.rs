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


#![doc = include_str!("../../README.md")]
#![allow(clippy::module_inception)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod broker;
pub mod codec;
pub mod config;
pub mod context;
pub mod diag;
pub mod error;
pub mod event;
pub mod headers;
pub mod hooks;
pub mod pool;
pub mod rpc;
pub mod shutdown;
pub mod status;

pub use broker::{Broker, BrokerChannel, BrokerError, MemoryBroker};
pub use codec::RpcResponse;
pub use config::{CircuitBreakConfig, IslandConfig};
pub use context::RequestContext;
pub use error::{ErrorCode, ErrorKind, IslandCode, IslandError};
pub use event::{EventHandler, EventService, SubscriptionOptions};
pub use hooks::{ErrorHook, ValueHook};
pub use pool::{ChannelPool, PoolError};
pub use rpc::{InvokeOptions, RpcHandler, RpcOptions, RpcService, RpcType};
pub use shutdown::{Shutdown, ShutdownReason};
pub use status::StatusCollector;
