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

//! Request statistics, circuit breaking and status export.
//!
//! The [`StatusCollector`] is shared by the RPC and event services. It counts
//! every request per `type@name` key, tracks how many are in flight and keeps
//! a [`SlidingWindow`] of per-interval request and error counts from which
//! circuit-break decisions are computed. An export loop periodically snapshots
//! the rates, hands them to a [`StatusExporter`] and rotates the counters.

mod collector;
mod exporter;
mod window;

pub use collector::{Measurement, RequestStatistics, RequestTicket, StatusCollector, StatusSnapshot};
pub use exporter::{
    EventStatusExporter, FileStatusExporter, StatusExporter, exporter_from_config,
    spawn_export_loop,
};
pub use window::{Bucket, SlidingWindow};
