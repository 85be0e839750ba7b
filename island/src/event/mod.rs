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

//! Topic publish/subscribe over the broker.

mod service;
mod subscriber;
mod types;

pub use service::{ERROR_LOG_KEY, EVENT_EXCHANGE, EventService};
pub use subscriber::{EventHandler, Subscriber, Subscription, SubscriptionOptions};
pub use types::{
    BaseEvent, Event, KeyedEvent, LoggerLevelChanged, LoggerTypeChanged, ReceivedEvent,
    StatusExportEvent, SystemDiagnosis, SystemHealthCheck, SystemNodeStarted,
};
