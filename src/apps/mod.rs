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

//! Applications built on the route bus: the TCP command gateway, server-side modules
//! (presence) and the plain TCP tunnel.

pub use gateway::{GatewayFactory, GatewaySession};
pub use module::{Module, ModuleHost};
pub use presence::{
    start_presence, Presence, KIND_ONLINE_LIST, KIND_QUERY_ONLINE, PRESENCE_MODULE_ID,
};
pub use tunnel::{pipe_pair, PipeSession, TunnelFactory};

pub mod gateway;
mod module;
mod presence;
mod tunnel;
