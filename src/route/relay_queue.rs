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

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::route::Command;
use crate::service::RelayConfig;
use crate::{AppError, AppResult, Shutdown};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The arriving command went straight into the sink.
    Delivered,
    /// The sink stayed full for a whole attempt window; the command waits in the queue.
    Buffered,
    /// A slot opened only after the command was older than `ttl`; it was dropped.
    Expired,
}

#[derive(Debug)]
struct QueuedCommand {
    command: Command,
    enqueued_at: Instant,
}

/// Forwarding adapter that absorbs a slow sink for up to `ttl`.
///
/// Commands are handed on in arrival order. Each delivery attempt waits at most
/// `attempt_window` for a slot in the sink; a command queued longer than `ttl` is
/// discarded instead of delivered. The queue never holds more than `max_queued` commands,
/// the oldest goes first when it would.
#[derive(Debug)]
pub struct RelayQueue {
    name: String,
    queue: VecDeque<QueuedCommand>,
    ttl: Duration,
    attempt_window: Duration,
    max_queued: usize,
    discarded: u64,
}

impl RelayQueue {
    pub fn new(name: impl Into<String>, config: &RelayConfig) -> RelayQueue {
        RelayQueue::with_limits(
            name,
            config.ttl(),
            config.attempt_window(),
            config.max_queued,
        )
    }

    pub fn with_limits(
        name: impl Into<String>,
        ttl: Duration,
        attempt_window: Duration,
        max_queued: usize,
    ) -> RelayQueue {
        RelayQueue {
            name: name.into(),
            queue: VecDeque::new(),
            ttl,
            attempt_window,
            max_queued: max_queued.max(1),
            discarded: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Commands dropped so far, by expiry or by the count cap.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Hands `cmd` to `sink` behind everything already queued.
    ///
    /// The command's age counts from this call; it is dropped rather than delivered once
    /// it is older than `ttl`. Only a closed sink is an error.
    pub async fn relay(
        &mut self,
        cmd: Command,
        sink: &mpsc::Sender<Command>,
    ) -> AppResult<RelayOutcome> {
        let arrived_at = Instant::now();
        if !self.flush(sink).await? {
            self.enqueue(cmd, arrived_at);
            return Ok(RelayOutcome::Buffered);
        }

        match time::timeout(self.attempt_window, sink.reserve()).await {
            Ok(Ok(permit)) => {
                if arrived_at.elapsed() > self.ttl {
                    drop(permit);
                    self.discard_expired(&cmd, arrived_at);
                    return Ok(RelayOutcome::Expired);
                }
                permit.send(cmd);
                Ok(RelayOutcome::Delivered)
            }
            Ok(Err(_)) => Err(self.sink_closed()),
            Err(_) => {
                self.enqueue(cmd, arrived_at);
                Ok(RelayOutcome::Buffered)
            }
        }
    }

    /// Delivers queued commands from the head, dropping expired ones.
    ///
    /// Returns `true` once the queue is empty, `false` when the sink stayed full for an
    /// attempt window. Age is checked again once a slot is granted, since waiting for it
    /// may have pushed the head past `ttl`.
    pub async fn flush(&mut self, sink: &mpsc::Sender<Command>) -> AppResult<bool> {
        while let Some(head) = self.queue.front() {
            if head.enqueued_at.elapsed() > self.ttl {
                self.pop_expired();
                continue;
            }

            match time::timeout(self.attempt_window, sink.reserve()).await {
                Ok(Ok(permit)) => {
                    if self.head_expired() {
                        drop(permit);
                        self.pop_expired();
                        continue;
                    }
                    if let Some(node) = self.queue.pop_front() {
                        trace!("relay {} deliver queued {}", self.name, node.command);
                        permit.send(node.command);
                    }
                }
                Ok(Err(_)) => return Err(self.sink_closed()),
                Err(_) => {
                    debug!(
                        "relay {} sink still full, {} queued",
                        self.name,
                        self.queue.len()
                    );
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Relays everything arriving on `inbound` into `outbound` until the inbound side
    /// closes or shutdown is signalled. While commands are queued the sink is retried
    /// every attempt window even without new arrivals.
    pub async fn pump(
        mut self,
        mut inbound: mpsc::Receiver<Command>,
        outbound: mpsc::Sender<Command>,
        mut shutdown: Shutdown,
    ) -> AppResult<()> {
        let mut retry = time::interval(self.attempt_window.max(Duration::from_millis(1)));
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("relay {} got shutdown with {} queued", self.name, self.queue.len());
                    break;
                }
                cmd = inbound.recv() => match cmd {
                    Some(cmd) => {
                        self.relay(cmd, &outbound).await?;
                    }
                    None => {
                        self.flush(&outbound).await?;
                        break;
                    }
                },
                _ = retry.tick(), if !self.queue.is_empty() => {
                    self.flush(&outbound).await?;
                }
            }
        }

        if !self.queue.is_empty() {
            info!(
                "relay {} stopped, {} queued commands dropped",
                self.name,
                self.queue.len()
            );
        }
        Ok(())
    }

    fn head_expired(&self) -> bool {
        self.queue
            .front()
            .is_some_and(|head| head.enqueued_at.elapsed() > self.ttl)
    }

    fn pop_expired(&mut self) {
        if let Some(expired) = self.queue.pop_front() {
            self.discard_expired(&expired.command, expired.enqueued_at);
        }
    }

    fn discard_expired(&mut self, command: &Command, enqueued_at: Instant) {
        self.discarded += 1;
        warn!(
            "relay {} discard expired {} after {:?}",
            self.name,
            command,
            enqueued_at.elapsed()
        );
    }

    fn enqueue(&mut self, command: Command, enqueued_at: Instant) {
        if self.queue.len() >= self.max_queued {
            if let Some(oldest) = self.queue.pop_front() {
                self.discarded += 1;
                warn!(
                    "relay {} over {} queued, drop oldest {}",
                    self.name, self.max_queued, oldest.command
                );
            }
        }
        self.queue.push_back(QueuedCommand {
            command,
            enqueued_at,
        });
    }

    fn sink_closed(&self) -> AppError {
        AppError::ChannelSendError(format!(
            "relay {} sink closed with {} queued",
            self.name,
            self.queue.len()
        ))
    }
}
