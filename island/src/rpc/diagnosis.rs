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

//! Answers to diagnosis requests sent to the response queue.
//!
//! A diagnosis request is a message on an instance's response queue whose
//! correlation id is [`DIAGNOSIS_CORRELATION_ID`]. Its body names a command of
//! the form `<target>:<sub>` and the file the answer is appended to.

use crate::diag::DiagnosisAnswer;
use crate::rpc::RpcService;
use crate::rpc::service::rpc_listing;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Correlation id that marks a diagnosis request.
pub const DIAGNOSIS_CORRELATION_ID: &str = "system.diagnosis";

/// Flags of a diagnosis rpc call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosisOptions {
    /// Call the rpc even when this instance does not serve it.
    pub remote: bool,
    /// Include error details in the answer.
    pub stack: bool,
}

/// Arguments of a diagnosis command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosisArgs {
    /// Rpc to call.
    pub name: Option<String>,
    /// Request sent to the rpc.
    pub query: Option<Value>,
    /// Flags.
    pub opts: DiagnosisOptions,
}

/// A diagnosis request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosisRequest {
    /// Command, `<target>:<sub>`.
    pub cmd: String,
    /// Arguments.
    #[serde(default)]
    pub args: DiagnosisArgs,
    /// File the answer is appended to.
    pub file_name: PathBuf,
}

impl DiagnosisRequest {
    /// Returns the sub-command, if any.
    #[must_use]
    pub fn sub_command(&self) -> Option<&str> {
        self.cmd.split(':').nth(1).filter(|sub| !sub.is_empty())
    }
}

pub(crate) async fn answer(service: &RpcService, content: &[u8]) {
    let request: DiagnosisRequest = match serde_json::from_slice(content) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "malformed diagnosis request");
            return;
        }
    };
    debug!(cmd = %request.cmd, "diagnosis requested");
    let answer = dispatch(service, &request).await;
    answer.append_to(&request.file_name).await;
}

async fn dispatch(service: &RpcService, request: &DiagnosisRequest) -> DiagnosisAnswer {
    match request.sub_command() {
        None => call(service, &request.args).await,
        Some("list") => DiagnosisAnswer::message(rpc_listing(service)),
        Some(_) => DiagnosisAnswer::message(json!("")),
    }
}

async fn call(service: &RpcService, args: &DiagnosisArgs) -> DiagnosisAnswer {
    let name = args.name.clone().unwrap_or_default();
    if !service.has_rpc(&name) && !args.opts.remote {
        return DiagnosisAnswer::error(json!({ "message": format!("no such RPC - {name}") }));
    }
    let query = args.query.clone().unwrap_or_else(|| Value::Object(Map::new()));
    match service.invoke(&name, query).await {
        Ok(message) => DiagnosisAnswer::message(message),
        Err(error) => {
            let mut detail = Map::new();
            detail.insert("message".to_string(), Value::String(error.to_string()));
            if args.opts.stack {
                detail.insert("stack".to_string(), error.to_wire());
            }
            DiagnosisAnswer::error(Value::Object(detail))
        }
    }
}
