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

//! Diagnostic side channel.
//!
//! Each service writes a small proc file (`rpc.proc`, `event.proc`) holding its
//! lifecycle status and the queue it consumes, so external tooling can find a
//! running instance. Diagnosis requests sent to an instance are answered by
//! appending one JSON line to a file named in the request.

use crate::broker::timestamp_millis;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Lifecycle status written to a proc file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcStatus {
    /// The service is declaring its broker topology.
    Initializing,
    /// The topology is declared.
    Initialized,
    /// The service is consuming.
    Started,
    /// The service was purged.
    Stopped,
}

/// Contents of a proc file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcState {
    /// Lifecycle status.
    pub status: ProcStatus,
    /// Queue the service consumes.
    pub queue: String,
}

/// A proc file.
#[derive(Debug, Clone)]
pub struct ProcFile {
    path: PathBuf,
}

impl ProcFile {
    /// Creates the handle of `<dir>/<name>`.
    pub fn new(dir: impl AsRef<Path>, name: &str) -> Self {
        Self {
            path: dir.as_ref().join(name),
        }
    }

    /// Returns the file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the status. Failures are logged and otherwise ignored.
    pub async fn write(&self, status: ProcStatus, queue: &str) {
        let state = ProcState {
            status,
            queue: queue.to_string(),
        };
        let result = match serde_json::to_vec(&state) {
            Ok(bytes) => tokio::fs::write(&self.path, bytes).await,
            Err(e) => Err(e.into()),
        };
        match result {
            Ok(()) => debug!(path = %self.path.display(), ?status, "proc file written"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to write proc file"),
        }
    }

    /// Reads the status back.
    pub async fn read(&self) -> Option<ProcState> {
        let bytes = tokio::fs::read(&self.path).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

/// Answer to a diagnosis request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisAnswer {
    /// Time of the answer in milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Answer payload.
    pub message: Value,
    /// Error payload, when the request failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl DiagnosisAnswer {
    /// Creates a successful answer stamped now.
    #[must_use]
    pub fn message(message: Value) -> Self {
        Self {
            timestamp: timestamp_millis(),
            message,
            error: None,
        }
    }

    /// Creates a failed answer stamped now.
    #[must_use]
    pub fn error(error: Value) -> Self {
        Self {
            timestamp: timestamp_millis(),
            message: Value::Null,
            error: Some(error),
        }
    }

    /// Appends the answer as one JSON line to `path`.
    pub async fn append_to(&self, path: &Path) {
        let mut line = match serde_json::to_vec(self) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to encode diagnosis answer");
                return;
            }
        };
        line.push(b'\n');
        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            file.write_all(&line).await?;
            file.flush().await
        }
        .await;
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "failed to write diagnosis answer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_proc_file_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let proc = ProcFile::new(dir.path(), "rpc.proc");
        proc.write(ProcStatus::Initializing, "rpc.res.svc.host.1").await;
        proc.write(ProcStatus::Started, "rpc.res.svc.host.1").await;

        let raw: Value = serde_json::from_slice(&std::fs::read(proc.path()).unwrap()).unwrap();
        assert_eq!(raw, json!({"status": "started", "queue": "rpc.res.svc.host.1"}));
        assert_eq!(proc.read().await.unwrap().status, ProcStatus::Started);
    }

    #[tokio::test]
    async fn test_proc_file_failure_is_ignored() {
        let proc = ProcFile::new("/nonexistent/island/dir", "event.proc");
        proc.write(ProcStatus::Stopped, "q").await;
        assert!(proc.read().await.is_none());
    }

    #[tokio::test]
    async fn test_answers_append_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diag.log");
        DiagnosisAnswer::message(json!("pong")).append_to(&path).await;
        DiagnosisAnswer::error(json!({"message": "boom"})).append_to(&path).await;

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["message"], "pong");
        assert!(lines[0].get("error").is_none());
        assert_eq!(lines[1]["error"]["message"], "boom");
    }
}
