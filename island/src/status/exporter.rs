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

//! Periodic status export.

use crate::config::{IslandConfig, StatusExportType};
use crate::error::{IslandCode, IslandError};
use crate::event::{EventService, StatusExportEvent};
use crate::shutdown::Shutdown;
use crate::status::{StatusCollector, StatusSnapshot};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Destination of status snapshots.
#[async_trait]
pub trait StatusExporter: Send + Sync {
    /// Exports one snapshot.
    async fn export(&self, snapshot: &StatusSnapshot) -> Result<(), IslandError>;
}

/// Builds the exported document: the snapshot tagged with its origin.
fn document(snapshot: &StatusSnapshot, host_name: &str, service_name: &str) -> Value {
    let mut document = json!({
        "hostname": host_name,
        "servicename": service_name,
    });
    if let (Value::Object(target), Ok(Value::Object(source))) =
        (&mut document, serde_json::to_value(snapshot))
    {
        target.extend(source);
    }
    document
}

/// Writes every snapshot to a file, replacing the previous one.
#[derive(Debug, Clone)]
pub struct FileStatusExporter {
    path: PathBuf,
    host_name: String,
    service_name: String,
}

impl FileStatusExporter {
    /// Creates an exporter writing to `path`.
    pub fn new(
        path: impl Into<PathBuf>,
        host_name: impl Into<String>,
        service_name: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            host_name: host_name.into(),
            service_name: service_name.into(),
        }
    }

    /// Returns the file the exporter writes.
    #[must_use]
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl StatusExporter for FileStatusExporter {
    async fn export(&self, snapshot: &StatusSnapshot) -> Result<(), IslandError> {
        let document = document(snapshot, &self.host_name, &self.service_name);
        let bytes = serde_json::to_vec(&document)?;
        tokio::fs::write(&self.path, bytes)
            .await
            .map_err(|e| IslandError::wrap(IslandCode::UNKNOWN, &e))
    }
}

/// Publishes every snapshot as an `island.status.export` event.
#[derive(Debug, Clone)]
pub struct EventStatusExporter {
    events: Arc<EventService>,
    host_name: String,
    service_name: String,
}

impl EventStatusExporter {
    /// Creates an exporter publishing through `events`.
    pub fn new(
        events: Arc<EventService>,
        host_name: impl Into<String>,
        service_name: impl Into<String>,
    ) -> Self {
        Self {
            events,
            host_name: host_name.into(),
            service_name: service_name.into(),
        }
    }
}

#[async_trait]
impl StatusExporter for EventStatusExporter {
    async fn export(&self, snapshot: &StatusSnapshot) -> Result<(), IslandError> {
        let event = StatusExportEvent::new(document(snapshot, &self.host_name, &self.service_name));
        self.events.publish_event(&event).await
    }
}

/// Builds the exporter selected by the configuration.
///
/// Returns `None` while status export is disabled.
#[must_use]
pub fn exporter_from_config(
    config: &IslandConfig,
    events: Arc<EventService>,
) -> Option<Arc<dyn StatusExporter>> {
    if !config.status_export {
        return None;
    }
    let host = config.host_name.as_str();
    let service = config.service_name.as_str();
    Some(match config.status_export_type {
        StatusExportType::File => Arc::new(FileStatusExporter::new(
            config.status_file_name.clone(),
            host,
            service,
        )),
        StatusExportType::Event => Arc::new(EventStatusExporter::new(events, host, service)),
    })
}

/// Spawns the export loop.
///
/// Every `interval` the collector is exported, which also rotates its
/// circuit-break windows. Without an exporter the loop only rotates. The loop
/// ends when `shutdown` fires.
pub fn spawn_export_loop(
    collector: Arc<StatusCollector>,
    exporter: Option<Arc<dyn StatusExporter>>,
    interval: Duration,
    shutdown: Shutdown,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    debug!("status export loop stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let snapshot = collector.export();
                    if let Some(exporter) = &exporter {
                        if let Err(error) = exporter.export(&snapshot).await {
                            warn!(error = %error, "status export failed");
                        }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recording(Mutex<Vec<StatusSnapshot>>);

    #[async_trait]
    impl StatusExporter for Recording {
        async fn export(&self, snapshot: &StatusSnapshot) -> Result<(), IslandError> {
            self.0.lock().push(snapshot.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_file_exporter_tags_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let collector = StatusCollector::default();
        let ticket = collector.collect_request("rpc", "lookup", None);
        collector.collect_executed(ticket, false);

        let exporter = FileStatusExporter::new(&path, "host-1", "accounts");
        exporter.export(&collector.export()).await.unwrap();

        let written: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written["hostname"], "host-1");
        assert_eq!(written["servicename"], "accounts");
        assert_eq!(written["measurements"][0]["type"], "rpc@lookup");
    }

    #[tokio::test]
    async fn test_export_loop_runs_until_shutdown() {
        let collector = Arc::new(StatusCollector::default());
        let recording = Arc::new(Recording::default());
        let shutdown = Shutdown::new();
        let handle = spawn_export_loop(
            collector.clone(),
            Some(recording.clone()),
            Duration::from_millis(20),
            shutdown.clone(),
        );

        let ticket = collector.collect_request("event", "tick", None);
        collector.collect_executed(ticket, false);
        tokio::time::sleep(Duration::from_millis(90)).await;
        shutdown.trigger("test", IslandError::etc(1, "stop"));
        handle.await.unwrap();

        let exported = recording.0.lock();
        assert!(exported.len() >= 2);
        assert!(exported.iter().any(|s| !s.measurements.is_empty()));
    }

    #[test]
    fn test_exporter_follows_config() {
        let pool = crate::pool::ChannelPool::new(Arc::new(crate::broker::MemoryBroker::new()));
        let events = Arc::new(EventService::new(
            Arc::new(IslandConfig::new("accounts")),
            pool,
            Arc::new(StatusCollector::default()),
            Shutdown::new(),
        ));
        let mut config = IslandConfig::new("accounts");
        assert!(exporter_from_config(&config, Arc::clone(&events)).is_none());

        config.status_export = true;
        assert!(exporter_from_config(&config, Arc::clone(&events)).is_some());
        config.status_export_type = StatusExportType::Event;
        assert!(exporter_from_config(&config, events).is_some());
    }
}
