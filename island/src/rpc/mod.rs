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

//! Remote procedure calls over the broker.
//!
//! [`RpcService`] both serves registered handlers and calls remote ones. The
//! pieces it is built from are usable on their own:
//!
//! - [`PendingRequests`]: correlation of responses with waiting callers
//! - [`ShardRouter`]: shard selection with flow-mode quarantine
//! - [`RpcEntity`]: a registered handler with its schemas

mod diagnosis;
mod entity;
mod pending;
mod routing;
mod service;

pub use diagnosis::{DIAGNOSIS_CORRELATION_ID, DiagnosisArgs, DiagnosisOptions, DiagnosisRequest};
pub use entity::{RpcEntity, RpcHandler, RpcOptions, RpcType, Schema};
pub use pending::{Completion, PendingGuard, PendingRequests, TIMED_OUT_CAPACITY};
pub use routing::{FLOW_MODE_THRESHOLD, ShardRouter, is_flow_mode};
pub use service::{
    InvokeOptions, REDELIVERY_DELAY, RawResponse, RpcErrorHookType, RpcHookType, RpcService,
};
