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

//! Plain TCP tunnel: every accepted client is piped to a fixed upstream address.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time;
use tracing::{debug, info};

use crate::network::{Connection, ConnectionHandle, ConnectionOptions, Decoded, Session};
use crate::service::{Accepted, ServerConfig, SessionFactory};
use crate::{AppError, AppResult};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// One side of a tunnel. Bytes read on this side go to the peer's channel, bytes in this
/// side's channel are written out.
///
/// A side that ends drops its sender. The other side keeps writing what is still queued
/// and closes itself once its channel reports the sender gone.
pub struct PipeSession {
    side: &'static str,
    to_peer: Option<mpsc::Sender<Bytes>>,
    from_peer: mpsc::Receiver<Bytes>,
    own: ConnectionHandle,
    write_timeout: Duration,
}

/// Builds the two halves of a tunnel between the connections owning `left` and `right`.
pub fn pipe_pair(
    left: &ConnectionHandle,
    right: &ConnectionHandle,
    channel_capacity: usize,
    write_timeout: Duration,
) -> (PipeSession, PipeSession) {
    let (left_tx, left_rx) = mpsc::channel(channel_capacity);
    let (right_tx, right_rx) = mpsc::channel(channel_capacity);
    let left_session = PipeSession {
        side: "client",
        to_peer: Some(right_tx),
        from_peer: left_rx,
        own: left.clone(),
        write_timeout,
    };
    let right_session = PipeSession {
        side: "upstream",
        to_peer: Some(left_tx),
        from_peer: right_rx,
        own: right.clone(),
        write_timeout,
    };
    (left_session, right_session)
}

impl PipeSession {
    /// Takes everything the peer queued. Closes this side once the peer is gone and
    /// nothing is left to write.
    fn drain(&mut self) -> Option<Bytes> {
        let mut out = BytesMut::new();
        let mut peer_gone = false;
        loop {
            match self.from_peer.try_recv() {
                Ok(chunk) => out.extend_from_slice(&chunk),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    peer_gone = true;
                    break;
                }
            }
        }
        if !out.is_empty() {
            return Some(out.freeze());
        }
        if peer_gone && !self.own.is_closed() {
            debug!("{} side of tunnel drained, peer is gone", self.side);
            self.own.close();
        }
        None
    }
}

impl Session for PipeSession {
    async fn decode(&mut self, buf: &[u8]) -> AppResult<Decoded> {
        let Some(to_peer) = &self.to_peer else {
            return Err(AppError::IllegalStateError(format!(
                "{} side of tunnel already cleaned",
                self.side
            )));
        };
        let chunk = Bytes::copy_from_slice(buf);
        match time::timeout(self.write_timeout, to_peer.send(chunk)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                return Err(AppError::ChannelSendError(format!(
                    "{} side: peer is gone",
                    self.side
                )))
            }
            Err(_) => return Err(AppError::WriteTimeout(self.write_timeout)),
        }
        let decoded = Decoded::consumed(buf.len());
        Ok(match self.drain() {
            Some(pending) => decoded.with_reply(pending),
            None => decoded,
        })
    }

    async fn idle(&mut self) -> AppResult<Option<Bytes>> {
        Ok(self.drain())
    }

    async fn clean(&mut self) {
        debug!("{} side of tunnel closed", self.side);
        // the peer flushes what it still holds, then closes on the disconnect
        self.to_peer.take();
    }
}

/// Dials the upstream for every accepted client and runs both sides until either closes.
#[derive(Debug, Clone)]
pub struct TunnelFactory {
    upstream: String,
    channel_capacity: usize,
    connection: ConnectionOptions,
}

impl TunnelFactory {
    pub fn new(config: &ServerConfig) -> TunnelFactory {
        TunnelFactory {
            upstream: config.tunnel.upstream.clone(),
            channel_capacity: config.tunnel.channel_capacity,
            connection: ConnectionOptions::from(&config.network),
        }
    }
}

impl SessionFactory for TunnelFactory {
    fn name(&self) -> &str {
        "tunnel"
    }

    async fn serve(&self, accepted: Accepted) -> AppResult<()> {
        let Accepted {
            stream,
            peer,
            handle,
            shutdown,
        } = accepted;

        let upstream = match time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.upstream)).await {
            Ok(Ok(upstream)) => upstream,
            Ok(Err(e)) => {
                return Err(AppError::DetailedIoError(format!(
                    "connect upstream {} for {} failed: {}",
                    self.upstream, peer, e
                )))
            }
            Err(_) => {
                return Err(AppError::DetailedIoError(format!(
                    "connect upstream {} for {} timed out",
                    self.upstream, peer
                )))
            }
        };
        let _ = upstream.set_nodelay(true);
        info!("tunnel {} <-> {} established", peer, self.upstream);

        let upstream_handle = ConnectionHandle::new(self.connection.recv_timeout);
        let (client_side, upstream_side) = pipe_pair(
            &handle,
            &upstream_handle,
            self.channel_capacity,
            self.connection.write_timeout,
        );

        let (_, upstream_task) = Connection::with_handle(
            upstream,
            self.upstream.clone(),
            upstream_side,
            upstream_handle,
            &self.connection,
        )
        .spawn();

        let client_result = Connection::with_handle(
            stream,
            peer.to_string(),
            client_side,
            handle,
            &self.connection,
        )
        .with_shutdown(shutdown)
        .run()
        .await;

        let upstream_result = upstream_task
            .await
            .map_err(|e| AppError::IllegalStateError(format!("upstream task failed: {}", e)))?;
        client_result.and(upstream_result)
    }
}
