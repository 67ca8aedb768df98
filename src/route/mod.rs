// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Routing
//!
//! Addressed commands, the endpoints they are delivered to, the route bus that owns the
//! registry of endpoints, and the relay queue that sits in front of slow consumers.

pub use command::{
    Command, CommandKind, Destination, LogicalId, KIND_OFFLINE, KIND_ONLINE, KIND_RESERVED_BASE,
};
pub use endpoint::{
    alloc_instance_id, Endpoint, EndpointRef, MailboxEndpoint, FIRST_DYNAMIC_INSTANCE_ID,
};
pub use relay_queue::{RelayOutcome, RelayQueue};
pub use route_bus::{NotifyContext, NotifyHandler, NotifyKind, RouteBus, RouteStats};

mod command;
mod endpoint;
mod relay_queue;
mod route_bus;
