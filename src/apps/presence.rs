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

use std::collections::BTreeSet;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};

use crate::apps::{Module, ModuleHost};
use crate::route::{
    Command, CommandKind, LogicalId, NotifyKind, RouteBus, KIND_OFFLINE, KIND_ONLINE,
};
use crate::service::ServerConfig;
use crate::AppResult;

pub const PRESENCE_MODULE_ID: u32 = 1;

/// Ask the presence module who is online; answered with [`KIND_ONLINE_LIST`].
pub const KIND_QUERY_ONLINE: CommandKind = 0x0010;
/// Payload: sorted big-endian u32 logical ids.
pub const KIND_ONLINE_LIST: CommandKind = 0x0011;

/// Tracks which logical ids currently have a registered client endpoint.
#[derive(Debug, Default)]
pub struct Presence {
    online: BTreeSet<LogicalId>,
}

impl Presence {
    fn online_list(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.online.len() * 4);
        for id in &self.online {
            buf.put_u32(*id);
        }
        buf.freeze()
    }
}

impl Module for Presence {
    fn name(&self) -> &str {
        "presence"
    }

    fn instance_id(&self) -> u32 {
        PRESENCE_MODULE_ID
    }

    async fn handle(&mut self, cmd: Command, bus: &RouteBus) -> AppResult<()> {
        match cmd.kind() {
            KIND_ONLINE => {
                self.online.insert(cmd.from_id());
                trace!("presence: {} online, {} total", cmd.from_id(), self.online.len());
            }
            KIND_OFFLINE => {
                self.online.remove(&cmd.from_id());
                trace!("presence: {} offline, {} total", cmd.from_id(), self.online.len());
            }
            KIND_QUERY_ONLINE => {
                let reply = Command::new(
                    PRESENCE_MODULE_ID,
                    cmd.from_id(),
                    KIND_ONLINE_LIST,
                    self.online_list(),
                );
                bus.forward(reply).await?;
            }
            other => debug!("presence ignores kind {:#06x} from {}", other, cmd.from_id()),
        }
        Ok(())
    }
}

/// Starts the presence module and hooks it to client registrations.
pub async fn start_presence(
    bus: &RouteBus,
    config: &ServerConfig,
    notify_shutdown: &broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
) -> AppResult<ModuleHost> {
    let host = ModuleHost::spawn(
        Presence::default(),
        bus,
        config.gateway.module_channel_capacity,
        &config.relay,
        notify_shutdown,
        shutdown_complete_tx,
    )
    .await?;

    // departures arrive as bus offline commands, arrivals through this handler
    let endpoint = host.endpoint();
    bus.register_notify_handler("presence", move |ctx| {
        if ctx.kind == NotifyKind::Online {
            endpoint.deliver(Command::new(
                ctx.logical_id,
                PRESENCE_MODULE_ID,
                KIND_ONLINE,
                Bytes::new(),
            ));
        }
    })
    .await?;
    Ok(host)
}
