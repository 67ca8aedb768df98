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

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, info, warn};

use crate::apps::gateway::frame::{decode_group, CommandFrame};
use crate::apps::gateway::{KIND_BROADCAST, KIND_LOGIN, KIND_LOGIN_ACK, MIN_CLIENT_ID};
use crate::network::{ConnectionHandle, Decoded, Session};
use crate::route::{
    alloc_instance_id, Command, Endpoint, EndpointRef, LogicalId, MailboxEndpoint, RouteBus,
    KIND_RESERVED_BASE,
};
use crate::{AppError, AppResult};

/// Per-connection limits for a gateway session.
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub max_package_size: usize,
    pub mailbox_capacity: usize,
    /// upper bound for any single wait on a saturated bus
    pub forward_timeout: Duration,
}

enum SessionState {
    AwaitLogin,
    Online {
        endpoint: EndpointRef,
        mailbox: mpsc::Receiver<Command>,
    },
    Closed,
}

/// Frame protocol between a TCP client and the route bus.
///
/// The first frame must be a login claiming a logical id. From then on every frame is
/// forwarded as a command from that id, and commands routed to the id are written back
/// as frames, either with the next decode reply or on the next idle tick.
pub struct GatewaySession {
    bus: RouteBus,
    handle: ConnectionHandle,
    peer: String,
    options: GatewayOptions,
    state: SessionState,
}

impl GatewaySession {
    pub fn new(
        bus: RouteBus,
        handle: ConnectionHandle,
        peer: impl Into<String>,
        options: GatewayOptions,
    ) -> GatewaySession {
        GatewaySession {
            bus,
            handle,
            peer: peer.into(),
            options,
            state: SessionState::AwaitLogin,
        }
    }

    /// Logged-in id, if any.
    pub fn logical_id(&self) -> Option<LogicalId> {
        match &self.state {
            SessionState::Online { endpoint, .. } => Some(endpoint.logical_id()),
            _ => None,
        }
    }

    async fn login(&mut self, frame: CommandFrame) -> AppResult<Bytes> {
        if frame.kind != KIND_LOGIN {
            return Err(AppError::MalformedProtocol(format!(
                "{} sent kind {:#06x} before login",
                self.peer, frame.kind
            )));
        }
        let id = frame.from;
        if id < MIN_CLIENT_ID {
            return Err(AppError::InvalidValue(format!(
                "{} claimed reserved id {}",
                self.peer, id
            )));
        }

        let (endpoint, mailbox) =
            MailboxEndpoint::new(alloc_instance_id(), id, self.options.mailbox_capacity);
        let endpoint: EndpointRef = Arc::new(endpoint.with_connection(self.handle.clone()));
        self.bounded("register", self.bus.register(endpoint.clone(), false))
            .await?;
        // commands addressed to us may only be sent once the registration is visible
        self.bounded("sync", self.bus.sync()).await?;
        info!("client {} logged in as {}", self.peer, id);

        self.state = SessionState::Online { endpoint, mailbox };
        Ok(CommandFrame::new(KIND_LOGIN_ACK, 0, id, Bytes::new()).encode())
    }

    async fn forward(&self, me: LogicalId, frame: CommandFrame) -> AppResult<()> {
        let cmd = match frame.kind {
            KIND_LOGIN => {
                warn!("client {} sent a second login, ignored", me);
                return Ok(());
            }
            kind if kind >= KIND_RESERVED_BASE => {
                warn!("client {} sent reserved kind {:#06x}, dropped", me, kind);
                return Ok(());
            }
            KIND_BROADCAST => {
                let (group, message) = decode_group(&frame.payload)?;
                Command::broadcast(me, group, KIND_BROADCAST, message)
            }
            kind => Command::new(me, frame.to, kind, frame.payload),
        };

        match time::timeout(self.options.forward_timeout, self.bus.forward(cmd)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "route bus saturated for {:?}, drop frame from {}",
                    self.options.forward_timeout, me
                );
                Ok(())
            }
        }
    }

    /// Runs a registration-queue operation for at most `forward_timeout`.
    async fn bounded<F>(&self, what: &str, op: F) -> AppResult<()>
    where
        F: Future<Output = AppResult<()>>,
    {
        match time::timeout(self.options.forward_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(AppError::ChannelSendError(format!(
                "route {} for {} not done within {:?}",
                what, self.peer, self.options.forward_timeout
            ))),
        }
    }

    /// Encodes at most one mailbox worth of pending commands into `out`.
    fn drain_mailbox(&mut self, out: &mut BytesMut) {
        if let SessionState::Online { mailbox, .. } = &mut self.state {
            for _ in 0..self.options.mailbox_capacity {
                match mailbox.try_recv() {
                    Ok(cmd) => CommandFrame::from(&cmd).write_to(out),
                    Err(_) => break,
                }
            }
        }
    }
}

impl Session for GatewaySession {
    async fn decode(&mut self, buf: &[u8]) -> AppResult<Decoded> {
        let Some((frame, frame_len)) = CommandFrame::parse(buf, self.options.max_package_size)?
        else {
            return Ok(Decoded::incomplete());
        };

        let logged_in = match &self.state {
            SessionState::AwaitLogin => None,
            SessionState::Online { endpoint, .. } => Some(endpoint.logical_id()),
            SessionState::Closed => {
                return Err(AppError::IllegalStateError(format!(
                    "decode on closed session of {}",
                    self.peer
                )));
            }
        };

        let mut out = BytesMut::new();
        match logged_in {
            None => {
                let ack = self.login(frame).await?;
                out.extend_from_slice(&ack);
            }
            Some(me) => self.forward(me, frame).await?,
        }
        self.drain_mailbox(&mut out);
        Ok(Decoded::consumed(frame_len).with_reply(out.freeze()))
    }

    async fn idle(&mut self) -> AppResult<Option<Bytes>> {
        let mut out = BytesMut::new();
        self.drain_mailbox(&mut out);
        if out.is_empty() {
            Ok(None)
        } else {
            Ok(Some(out.freeze()))
        }
    }

    async fn clean(&mut self) {
        if let SessionState::Online { endpoint, .. } =
            std::mem::replace(&mut self.state, SessionState::Closed)
        {
            debug!("client {} ({}) leaving", endpoint.logical_id(), self.peer);
            if let Err(e) = self
                .bounded("unregister", self.bus.unregister(endpoint))
                .await
            {
                debug!("unregister of {} skipped: {}", self.peer, e);
            }
        }
    }
}
