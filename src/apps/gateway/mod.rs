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

//! TCP command gateway: length-prefixed frames in, route bus commands out.

use std::net::SocketAddr;

use crate::network::{Connection, ConnectionOptions};
use crate::route::{CommandKind, LogicalId, RouteBus};
use crate::service::{Accepted, ServerConfig, SessionFactory};
use crate::AppResult;

pub use frame::{decode_group, decode_id_list, encode_group, CommandFrame};
pub use session::{GatewayOptions, GatewaySession};

mod frame;
mod session;

pub const KIND_LOGIN: CommandKind = 0x0001;
pub const KIND_LOGIN_ACK: CommandKind = 0x0002;
/// Payload: `u16 count | count * u32 id | message`.
pub const KIND_BROADCAST: CommandKind = 0x0003;

/// Ids below this are module instance ids and cannot be claimed by a client.
pub const MIN_CLIENT_ID: LogicalId = 256;

/// Builds a [`GatewaySession`] for every accepted connection.
#[derive(Debug, Clone)]
pub struct GatewayFactory {
    bus: RouteBus,
    options: GatewayOptions,
    connection: ConnectionOptions,
}

impl GatewayFactory {
    pub fn new(bus: RouteBus, config: &ServerConfig) -> GatewayFactory {
        GatewayFactory {
            bus,
            options: GatewayOptions {
                max_package_size: config.network.max_package_size,
                mailbox_capacity: config.gateway.mailbox_capacity,
                forward_timeout: config.network.write_timeout(),
            },
            connection: ConnectionOptions::from(&config.network),
        }
    }
}

impl SessionFactory for GatewayFactory {
    fn name(&self) -> &str {
        "gateway"
    }

    async fn serve(&self, accepted: Accepted) -> AppResult<()> {
        let Accepted {
            stream,
            peer,
            handle,
            shutdown,
        } = accepted;
        let session = GatewaySession::new(
            self.bus.clone(),
            handle.clone(),
            peer_name(&peer),
            self.options.clone(),
        );
        Connection::with_handle(stream, peer_name(&peer), session, handle, &self.connection)
            .with_shutdown(shutdown)
            .run()
            .await
    }
}

fn peer_name(peer: &SocketAddr) -> String {
    peer.to_string()
}
